use crate::config::{Conf, Config, ImageOverride};
use crate::errors::*;
use crate::queue::ProcessedImages;
use indexmap::IndexMap;
use serde::Serialize;

pub const IMAGES_LOCK_API_VERSION: &str = "imgpkg.carvel.dev/v1alpha1";
pub const IMAGES_LOCK_KIND: &str = "ImagesLock";

/// Annotation carrying the original unresolved reference.
pub const IMAGES_LOCK_KBLD_ID: &str = "kbld.carvel.dev/id";
/// Annotation carrying the yaml-encoded origin list.
pub const IMAGES_LOCK_KBLD_ORIGINS: &str = "kbld.carvel.dev/origins";

/// Lockfile in config shape: a kbld Config whose overrides pin every resolved
/// reference, replayable via `-f` on the next run.
pub fn lock_config(conf: &Conf, images: &ProcessedImages) -> Config {
    let mut config = Config::empty();
    config.minimum_required_version = Some(env!("CARGO_PKG_VERSION").to_string());
    config.search_rules = conf.search_rules_without_defaults();

    for (url, image) in images.all() {
        config.overrides.push(ImageOverride {
            image: url.clone(),
            new_image: image.url.clone(),
            preresolved: true,
            tag_selection: None,
        });
    }
    config
}

/// Lockfile in imgpkg ImagesLock shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImagesLock {
    pub api_version: String,
    pub kind: String,
    pub images: Vec<LockImageRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LockImageRef {
    pub image: String,
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub annotations: IndexMap<String, String>,
}

pub fn images_lock(images: &ProcessedImages) -> Result<ImagesLock> {
    let mut lock = ImagesLock {
        api_version: IMAGES_LOCK_API_VERSION.to_string(),
        kind: IMAGES_LOCK_KIND.to_string(),
        images: Vec::new(),
    };

    for (url, image) in images.all() {
        let mut annotations = IndexMap::new();
        annotations.insert(IMAGES_LOCK_KBLD_ID.to_string(), url.clone());
        if !image.origins.is_empty() {
            let origins = serde_yaml::to_string(&image.origins)
                .context("Failed to serialize image origins")?;
            annotations.insert(IMAGES_LOCK_KBLD_ORIGINS.to_string(), origins);
        }
        lock.images.push(LockImageRef {
            image: image.url.clone(),
            annotations,
        });
    }

    Ok(lock)
}
