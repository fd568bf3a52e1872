use crate::errors::*;
use crate::logger::{Logger, PrefixWriter};
use crate::registry::ImageRef;
use crate::tags;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

/// Options forwarded to `docker build`.
/// https://docs.docker.com/engine/reference/commandline/build/
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerBuildOpts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_cache: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buildkit: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_options: Option<Vec<String>>,
}

/// A locally-scoped image name holding a just-built image.
#[derive(Debug, Clone, PartialEq)]
pub struct DockerTmpRef(String);

impl DockerTmpRef {
    pub fn new<S: Into<String>>(val: S) -> DockerTmpRef {
        DockerTmpRef(val.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DockerPushResult {
    pub digest: String,
    /// Local daemon image id observed at push time.
    pub image_id: String,
}

#[derive(Debug, Clone)]
pub struct Docker {
    logger: Logger,
}

impl Docker {
    pub fn new(logger: Logger) -> Docker {
        Docker { logger }
    }

    pub async fn build(
        &self,
        image: &str,
        directory: &Path,
        opts: &DockerBuildOpts,
    ) -> Result<DockerTmpRef> {
        ensure_directory(directory)?;

        let tmp_ref = DockerTmpRef::new(tags::tmp_build_ref(image)?);
        let logger = self.logger.prefixed(format!("{image} | "));
        logger.write_line(&format!(
            "starting build (using Docker): {} -> {}",
            directory.display(),
            tmp_ref.as_str()
        ));

        let mut args = vec!["build".to_string()];
        if let Some(target) = &opts.target {
            args.push("--target".to_string());
            args.push(target.clone());
        }
        if opts.pull == Some(true) {
            args.push("--pull".to_string());
        }
        if opts.no_cache == Some(true) {
            args.push("--no-cache".to_string());
        }
        if let Some(file) = &opts.file {
            // docker runs with cwd set to the build directory, so a relative
            // Dockerfile path needs no joining
            args.push("--file".to_string());
            args.push(file.clone());
        }
        if let Some(raw_options) = &opts.raw_options {
            args.extend(raw_options.iter().cloned());
        }
        args.push("--tag".to_string());
        args.push(tmp_ref.as_str().to_string());
        args.push(".".to_string());

        let mut cmd = Command::new("docker");
        cmd.args(&args).current_dir(directory);
        if opts.buildkit == Some(true) {
            cmd.env("DOCKER_BUILDKIT", "1");
        }

        debug!("Spawning child process: docker {args:?}");
        let out = run_teed(cmd, &logger).await?;
        if !out.status.success() {
            logger.write_line(&format!("error: {:?}", out.status));
            bail!(
                "Docker build of {image:?} failed to execute: {:?}\n{}",
                out.status,
                out.stderr
            );
        }

        let inspect = self.inspect(tmp_ref.as_str()).await?;
        let stable_ref = self.retag_stable(&tmp_ref, image, &inspect.id, &logger).await?;
        logger.write_line("finished build (using Docker)");
        Ok(stable_ref)
    }

    /// Retags with a name derived from the image id, so repeated builds of an
    /// unchanged source converge to the same reference. The daemon rejects a
    /// `kbld@sha256:...` form for local images.
    pub async fn retag_stable(
        &self,
        tmp_ref: &DockerTmpRef,
        image: &str,
        image_id: &str,
        logger: &PrefixWriter,
    ) -> Result<DockerTmpRef> {
        let stable_ref = DockerTmpRef::new(tags::stable_build_ref(image, image_id)?);

        self.docker(&["tag", tmp_ref.as_str(), stable_ref.as_str()], logger)
            .await
            .context("Retagging image with stable reference")?;

        // remove the random tag to be nice to `docker images` output
        // (no point in untagging a digest reference)
        if !tmp_ref.as_str().starts_with("sha256:") {
            self.docker(&["rmi", tmp_ref.as_str()], logger)
                .await
                .context("Removing temporary image tag")?;
        }

        Ok(stable_ref)
    }

    pub async fn push(&self, tmp_ref: &DockerTmpRef, image_dst: &str) -> Result<DockerPushResult> {
        let logger = self.logger.prefixed(format!("{image_dst} | "));
        let image_dst = ensure_tagged(image_dst)?;

        logger.write_line(&format!(
            "starting push (using Docker): {} -> {image_dst}",
            tmp_ref.as_str()
        ));

        let prev = self.inspect(tmp_ref.as_str()).await?;

        self.docker(&["tag", tmp_ref.as_str(), &image_dst], &logger)
            .await
            .context("Tagging image for push")?;
        self.docker(&["push", &image_dst], &logger)
            .await
            .context("Pushing image")?;

        let curr = self.inspect(&image_dst).await?;
        if let Err(err) = check_push_race(&prev, &curr) {
            logger.write_line("push race detected");
            return Err(err);
        }

        let digest = determine_repo_digest(&curr)?;
        logger.write_line("finished push (using Docker)");
        Ok(DockerPushResult {
            digest,
            image_id: curr.id,
        })
    }

    async fn inspect(&self, reference: &str) -> Result<InspectData> {
        debug!("Spawning child process: docker inspect {reference:?}");
        let out = Command::new("docker")
            .args(["inspect", reference])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("Failed to execute docker binary")?;
        if !out.status.success() {
            bail!(
                "Docker inspect of {reference:?} failed to execute: {:?}\n{}",
                out.status,
                String::from_utf8_lossy(&out.stderr)
            );
        }

        let mut data = serde_json::from_slice::<Vec<InspectData>>(&out.stdout)
            .context("Failed to parse docker inspect output")?;
        if data.len() != 1 {
            bail!("Expected to find exactly one image, but found {}", data.len());
        }
        Ok(data.remove(0))
    }

    async fn docker(&self, args: &[&str], logger: &PrefixWriter) -> Result<String> {
        let mut cmd = Command::new("docker");
        cmd.args(args);

        debug!("Spawning child process: docker {args:?}");
        let out = run_teed(cmd, logger).await?;
        if !out.status.success() {
            bail!(
                "Docker command ({args:?}) failed to execute: {:?}\n{}",
                out.status,
                out.stderr
            );
        }
        Ok(out.stdout)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct InspectData {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "RepoDigests", default)]
    repo_digests: Vec<String>,
}

struct TeedOutput {
    stdout: String,
    stderr: String,
    status: ExitStatus,
}

/// Runs the child with both stdio streams teed to the prefixed writer while
/// buffering them for failure reporting.
async fn run_teed(mut cmd: Command, logger: &PrefixWriter) -> Result<TeedOutput> {
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    let mut child = cmd.spawn().context("Failed to execute docker binary")?;

    let stdout = child.stdout.take().context("Failed to open child stdout")?;
    let stderr = child.stderr.take().context("Failed to open child stderr")?;

    let (stdout, stderr, status) = tokio::try_join!(
        tee(stdout, logger.clone()),
        tee(stderr, logger.clone()),
        async { child.wait().await.map_err(Error::from) },
    )?;

    Ok(TeedOutput {
        stdout,
        stderr,
        status,
    })
}

async fn tee<R: AsyncRead + Unpin>(stream: R, logger: PrefixWriter) -> Result<String> {
    let mut lines = BufReader::new(stream).lines();
    let mut buf = String::new();
    while let Some(line) = lines.next_line().await? {
        logger.write_line(&line);
        buf.push_str(&line);
        buf.push('\n');
    }
    Ok(buf)
}

fn ensure_directory(directory: &Path) -> Result<()> {
    let metadata = std::fs::metadata(directory).with_context(|| {
        anyhow!("Checking if path {directory:?} is a directory")
    })?;

    // docker reports a missing build directory with a confusing
    // 'not a directory' fork/exec error, so check upfront
    if !metadata.is_dir() {
        bail!("Expected path {directory:?} to be a directory, but was not");
    }

    Ok(())
}

/// The digest is only known after the push, so an untagged destination gets a
/// temporary remote tag.
// TODO the temporary kbld-<rand> tag is left behind in the destination registry
fn ensure_tagged(image_dst: &str) -> Result<String> {
    let image_ref = image_dst.parse::<ImageRef>()?;
    if image_ref.tag.is_none() && image_ref.digest.is_none() {
        Ok(format!("{image_dst}:kbld-{}", tags::random_str50()?))
    } else {
        Ok(image_dst.to_string())
    }
}

/// A concurrent docker command may retag between inspect and push, making the
/// pushed image a different one than intended.
fn check_push_race(prev: &InspectData, curr: &InspectData) -> Result<()> {
    if prev.id != curr.id {
        bail!(
            "push race: image id changed during push (before: {}, after: {})",
            prev.id,
            curr.id
        );
    }
    Ok(())
}

fn determine_repo_digest(inspect: &InspectData) -> Result<String> {
    let mut digest: Option<String> = None;
    for repo_digest in &inspect.repo_digests {
        let image_ref = repo_digest.parse::<ImageRef>()?;
        let found = image_ref
            .digest
            .with_context(|| anyhow!("Extracting digest from repo digest {repo_digest:?}"))?;
        match &digest {
            Some(existing) if *existing != found => {
                bail!(
                    "Expected to find a single repo digest, but found {:?}",
                    inspect.repo_digests
                );
            }
            _ => digest = Some(found),
        }
    }
    digest.context("Expected to find at least one repo digest")
}
