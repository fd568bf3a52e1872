use crate::errors::*;
use std::path::PathBuf;
use tokio::process::Command;

/// Returned by [`GitRepo::remote_url`] when no `origin` remote is configured.
pub const REMOTE_URL_UNKNOWN: &str = "<unknown>";
/// Returned by [`GitRepo::head_sha`] for a freshly initialized working copy.
pub const HEAD_SHA_NO_COMMITS: &str = "<no-commits>";

/// Best-effort probe of the git working copy enclosing a build directory,
/// used to attach provenance metadata to built images.
#[derive(Debug, Clone)]
pub struct GitRepo {
    dir: PathBuf,
}

impl GitRepo {
    pub fn new<P: Into<PathBuf>>(dir: P) -> GitRepo {
        GitRepo { dir: dir.into() }
    }

    pub async fn is_valid(&self) -> bool {
        self.git(&["rev-parse", "--git-dir"]).await.is_ok()
    }

    pub async fn remote_url(&self) -> Result<String> {
        self.ensure_valid().await?;
        // exits non-zero when the key is unset
        match self.git(&["config", "--get", "remote.origin.url"]).await {
            Ok(out) => Ok(out.trim().to_string()),
            Err(_) => Ok(REMOTE_URL_UNKNOWN.to_string()),
        }
    }

    pub async fn head_sha(&self) -> Result<String> {
        self.ensure_valid().await?;
        match self.git(&["rev-parse", "HEAD"]).await {
            Ok(out) => Ok(out.trim().to_string()),
            Err(_) => Ok(HEAD_SHA_NO_COMMITS.to_string()),
        }
    }

    pub async fn head_tags(&self) -> Result<Vec<String>> {
        self.ensure_valid().await?;
        // fails on a repo without commits, which still has no tags
        let Ok(out) = self.git(&["tag", "--points-at", "HEAD"]).await else {
            return Ok(Vec::new());
        };
        Ok(out
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    pub async fn is_dirty(&self) -> Result<bool> {
        self.ensure_valid().await?;
        let out = self.git(&["status", "--porcelain"]).await?;
        Ok(!out.trim().is_empty())
    }

    async fn ensure_valid(&self) -> Result<()> {
        if !self.is_valid().await {
            bail!("Expected path {:?} to be inside a git working copy", self.dir);
        }
        Ok(())
    }

    async fn git(&self, args: &[&str]) -> Result<String> {
        debug!("Spawning child process: git {args:?}");
        let out = Command::new("git")
            .args(args)
            .current_dir(&self.dir)
            .output()
            .await
            .context("Failed to execute git binary")?;
        if !out.status.success() {
            bail!("Git command ({args:?}) failed to execute: {:?}", out.status);
        }
        let stdout = String::from_utf8(out.stdout).context("Git output is not valid utf-8")?;
        Ok(stdout)
    }
}
