use crate::builder::Builder;
use crate::config::{Conf, Source};
use crate::errors::*;
use crate::git::GitRepo;
use crate::logger::Logger;
use crate::registry::{ImageRef, ImageRegistry};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

/// Records which transform produced a resolved image.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Origin {
    Local {
        path: String,
    },
    #[serde(rename_all = "camelCase")]
    Git {
        #[serde(rename = "remoteURL")]
        remote_url: String,
        sha: String,
        dirty: bool,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        tags: Vec<String>,
    },
    Preresolved {
        url: String,
    },
    #[serde(rename_all = "camelCase")]
    Resolved {
        url: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tag: Option<String>,
    },
}

/// Outcome of the transformation chain for one unresolved reference.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedImage {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub origins: Vec<Origin>,
    pub url: String,
    #[serde(skip)]
    pub image_id: Option<String>,
}

/// Applies the per-reference transformation chain: override lookup, then
/// build and push, then remote digest lookup. Exactly one transform decides
/// the outcome.
pub struct Factory {
    conf: Conf,
    registry: Arc<dyn ImageRegistry>,
    logger: Logger,
    allowed_to_build: bool,
}

impl Factory {
    pub fn new(
        conf: Conf,
        registry: Arc<dyn ImageRegistry>,
        logger: Logger,
        allowed_to_build: bool,
    ) -> Factory {
        Factory {
            conf,
            registry,
            logger,
            allowed_to_build,
        }
    }

    pub async fn resolve(&self, url: &str) -> Result<ResolvedImage> {
        if let Some(o) = self.conf.override_for(url) {
            if o.preresolved {
                debug!("Using pre-resolved override for {url:?}: {:?}", o.new_image);
                return Ok(ResolvedImage {
                    url: o.new_image.clone(),
                    origins: vec![Origin::Preresolved {
                        url: o.new_image.clone(),
                    }],
                    image_id: None,
                });
            }

            let new_url = match &o.tag_selection {
                Some(selection) => {
                    let tags = self.registry.list_tags(&o.new_image).await?;
                    let tag = highest_matching_tag(&tags, &selection.semver.constraints)?;
                    let mut image_ref = o.new_image.parse::<ImageRef>()?;
                    image_ref.tag = Some(tag);
                    image_ref.to_string()
                }
                None => o.new_image.clone(),
            };
            debug!("Override rewrote {url:?} to {new_url:?}");
            return self.resolve_digest(&new_url).await;
        }

        if self.allowed_to_build {
            if let Some(source) = self.conf.source_for(url) {
                return self.build(url, source).await;
            }
        }

        self.resolve_digest(url).await
    }

    async fn resolve_digest(&self, url: &str) -> Result<ResolvedImage> {
        let digest = self.registry.digest(url).await?;
        let image_ref = url.parse::<ImageRef>()?;
        Ok(ResolvedImage {
            url: image_ref.with_digest(&digest),
            origins: vec![Origin::Resolved {
                url: url.to_string(),
                tag: image_ref.tag,
            }],
            image_id: None,
        })
    }

    async fn build(&self, url: &str, source: &Source) -> Result<ResolvedImage> {
        let mut origins = vec![Origin::Local {
            path: source.path.clone(),
        }];
        if let Some(origin) = git_origin(Path::new(&source.path)).await {
            origins.push(origin);
        }

        let builder = Builder::for_source(source, self.logger.clone());
        let tmp_ref = builder.build(url, source).await?;

        if let Some(destination) = self.conf.destination_for(url) {
            let pushed = builder.push(&tmp_ref, &destination.new_image).await?;
            let image_ref = destination.new_image.parse::<ImageRef>()?;
            Ok(ResolvedImage {
                url: image_ref.with_digest(&pushed.digest),
                origins,
                image_id: Some(pushed.image_id),
            })
        } else {
            // without a destination the image only exists in the local daemon,
            // addressable by its stable kbld: tag
            Ok(ResolvedImage {
                url: tmp_ref.as_str().to_string(),
                origins,
                image_id: None,
            })
        }
    }
}

/// Git provenance is best effort; a directory outside a working copy or any
/// probe failure yields no origin.
async fn git_origin(dir: &Path) -> Option<Origin> {
    let repo = GitRepo::new(dir);
    if !repo.is_valid().await {
        return None;
    }
    let remote_url = repo.remote_url().await.ok()?;
    let sha = repo.head_sha().await.ok()?;
    let dirty = repo.is_dirty().await.ok()?;
    let tags = repo.head_tags().await.unwrap_or_default();
    Some(Origin::Git {
        remote_url,
        sha,
        dirty,
        tags,
    })
}

/// Picks the highest tag parseable as a semver version that satisfies the
/// constraints.
pub fn highest_matching_tag(tags: &[String], constraints: &str) -> Result<String> {
    let req = semver::VersionReq::parse(constraints)
        .with_context(|| anyhow!("Failed to parse semver constraints: {constraints:?}"))?;

    let mut best: Option<(semver::Version, &str)> = None;
    for tag in tags {
        let Ok(version) = semver::Version::parse(tag.trim_start_matches('v')) else {
            continue;
        };
        if !req.matches(&version) {
            continue;
        }
        if best.as_ref().map_or(true, |(b, _)| version > *b) {
            best = Some((version, tag));
        }
    }

    let (_, tag) = best.with_context(|| {
        anyhow!("Expected to find at least one tag matching constraints {constraints:?}")
    })?;
    Ok(tag.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_highest_matching_tag() -> Result<()> {
        let tags = tags(&["1.0.0", "1.2.0", "2.0.0", "latest", "v1.1.0"]);
        assert_eq!(highest_matching_tag(&tags, ">=1.0.0, <2.0.0")?, "1.2.0");
        assert_eq!(highest_matching_tag(&tags, ">=2.0.0")?, "2.0.0");
        Ok(())
    }

    #[test]
    fn test_highest_matching_tag_requires_match() {
        assert!(highest_matching_tag(&tags(&["latest"]), ">=1.0.0").is_err());
        assert!(highest_matching_tag(&tags(&["1.0.0"]), "not-a-constraint").is_err());
    }

    #[test]
    fn test_origin_yaml_shape() -> Result<()> {
        let origins = vec![
            Origin::Local {
                path: "app/".to_string(),
            },
            Origin::Git {
                remote_url: "http://some-remote".to_string(),
                sha: "abc123".to_string(),
                dirty: false,
                tags: Vec::new(),
            },
            Origin::Resolved {
                url: "nginx:1.19".to_string(),
                tag: Some("1.19".to_string()),
            },
        ];
        let buf = serde_yaml::to_string(&origins)?;
        assert!(buf.contains("local:"));
        assert!(buf.contains("path: app/"));
        assert!(buf.contains("remoteURL: http://some-remote"));
        assert!(buf.contains("resolved:"));
        assert!(buf.contains("tag: '1.19'"));
        Ok(())
    }

    #[test]
    fn test_resolved_image_serializes_origins_before_url() -> Result<()> {
        let image = ResolvedImage {
            origins: vec![Origin::Preresolved {
                url: "myapp@sha256:aaa".to_string(),
            }],
            url: "myapp@sha256:aaa".to_string(),
            image_id: None,
        };
        let buf = serde_yaml::to_string(&vec![image])?;
        let origins_at = buf.find("origins:").context("missing origins")?;
        let url_at = buf.rfind("url:").context("missing url")?;
        assert!(origins_at < url_at);
        Ok(())
    }
}
