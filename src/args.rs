use crate::errors::*;
use crate::registry::RegistryOpts;
use clap::{ArgAction, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::io;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(version)]
pub struct Args {
    /// Increase logging output (can be used multiple times)
    #[arg(short, long, global = true, action(ArgAction::Count))]
    pub verbose: u8,
    #[command(subcommand)]
    pub subcommand: SubCommand,
}

#[derive(Debug, Subcommand)]
pub enum SubCommand {
    Resolve(Resolve),
    Completions(Completions),
}

/// Build images and update references
#[derive(Debug, Parser)]
pub struct Resolve {
    /// Input files with resources and kbld configuration (can be specified multiple times, `-` reads stdin)
    #[arg(short = 'f', long = "file")]
    pub files: Vec<PathBuf>,
    /// Allow building of images
    #[arg(long, default_value_t = true, action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
    pub build: bool,
    /// Set maximum number of concurrent builds
    #[arg(long, default_value_t = 4)]
    pub build_concurrency: usize,
    /// Annotate resources with an annotation listing their images
    #[arg(long, default_value_t = true, action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
    pub images_annotation: bool,
    /// Set image map file with pre-resolved image mappings (json object)
    #[arg(long)]
    pub image_map_file: Option<PathBuf>,
    /// File path to emit configuration with resolved image references
    #[arg(long)]
    pub lock_output: Option<PathBuf>,
    /// File path to emit an imgpkg images lockfile with resolved image references
    #[arg(long)]
    pub imgpkg_lock_output: Option<PathBuf>,
    /// List image references found in the inputs instead of resolving them
    #[arg(long)]
    pub unresolved_inspect: bool,
    /// Add CA certificates for the registry API (can be specified multiple times)
    #[arg(long = "registry-ca-cert-path")]
    pub registry_ca_cert_paths: Vec<PathBuf>,
    /// Set whether to verify the server's certificate chain and host name
    #[arg(long, default_value_t = true, action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
    pub registry_verify_certs: bool,
    /// Allow the use of http when interacting with registries
    #[arg(long)]
    pub registry_insecure: bool,
}

impl Resolve {
    pub fn validate(&self) -> Result<()> {
        if self.files.is_empty() {
            bail!("Expected at least one input file (-f)");
        }
        if self.lock_output.is_some() && self.imgpkg_lock_output.is_some() {
            bail!("Can only output one lockfile type, pass only one of --lock-output or --imgpkg-lock-output");
        }
        Ok(())
    }

    pub fn registry_opts(&self) -> RegistryOpts {
        RegistryOpts {
            ca_cert_paths: self.registry_ca_cert_paths.clone(),
            verify_certs: self.registry_verify_certs,
            insecure: self.registry_insecure,
        }
    }
}

/// Generate shell completions
#[derive(Debug, Parser)]
pub struct Completions {
    pub shell: Shell,
}

impl Completions {
    pub fn generate<W: io::Write>(&self, mut w: W) -> Result<()> {
        clap_complete::generate(self.shell, &mut Args::command(), "kbld", &mut w);
        Ok(())
    }
}
