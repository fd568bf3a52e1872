use clap::Parser;
use env_logger::Env;
use kbld::args::{Args, SubCommand};
use kbld::errors::*;
use kbld::resolve;
use std::io;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::init_from_env(Env::default().default_filter_or(log_level));

    match args.subcommand {
        SubCommand::Resolve(resolve) => resolve::resolve(&resolve).await,
        SubCommand::Completions(completions) => completions.generate(io::stdout()),
    }
}
