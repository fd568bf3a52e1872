use crate::config::Source;
use crate::docker::{Docker, DockerPushResult, DockerTmpRef};
use crate::errors::*;
use crate::logger::Logger;
use std::path::Path;

/// Builder backends able to turn a source directory into a local image
/// reference. Pre-resolved references bypass building entirely and are
/// handled before a builder is chosen.
#[derive(Debug, Clone)]
pub enum Builder {
    Docker(Docker),
}

impl Builder {
    /// Sources currently always select the docker backend; this is the seam
    /// where other backends would dispatch on source options.
    pub fn for_source(_source: &Source, logger: Logger) -> Builder {
        Builder::Docker(Docker::new(logger))
    }

    pub async fn build(&self, image: &str, source: &Source) -> Result<DockerTmpRef> {
        match self {
            Builder::Docker(docker) => {
                docker
                    .build(image, Path::new(&source.path), &source.docker_build_opts())
                    .await
            }
        }
    }

    pub async fn push(&self, tmp_ref: &DockerTmpRef, image_dst: &str) -> Result<DockerPushResult> {
        match self {
            Builder::Docker(docker) => docker.push(tmp_ref, image_dst).await,
        }
    }
}
