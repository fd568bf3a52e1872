use crate::args;
use crate::config::{Conf, Config};
use crate::errors::*;
use crate::image::{Factory, ResolvedImage};
use crate::lockfile;
use crate::logger::Logger;
use crate::queue::{ImageQueue, ProcessedImages, UnresolvedRefs};
use crate::registry::Registry;
use crate::resources::{Resource, IMAGES_ANNOTATION};
use crate::search::{ImageRefs, SearchRule};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncReadExt;

pub async fn resolve(args: &args::Resolve) -> Result<()> {
    args.validate()?;

    let logger = Logger::new();
    let prefixed = logger.prefixed("resolve | ");

    let resources = load_resources(&args.files).await?;
    let (resources, mut conf) = Conf::from_resources(resources)?;

    if let Some(path) = &args.image_map_file {
        let buf = fs::read(path)
            .await
            .with_context(|| anyhow!("Failed to read image map file: {path:?}"))?;
        conf = conf.with_additional(Config::from_image_map(&buf)?);
    }

    let rules = conf.search_rules();
    let unresolved = collect_image_refs(&resources, &rules);
    debug!("Collected {} distinct image references", unresolved.len());

    if args.unresolved_inspect {
        let output = unresolved_inspect_output(&unresolved)?;
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(output.as_bytes())?;
        return Ok(());
    }

    let registry = Registry::new(&args.registry_opts())?;
    let factory = Factory::new(conf.clone(), Arc::new(registry), logger.clone(), args.build);
    let images = ImageQueue::new(factory)
        .run(&unresolved, args.build_concurrency)
        .await?;

    for (url, image) in images.all() {
        prefixed.write_line(&format!("final: {url} -> {}", image.url));
    }

    emit_lock_output(args, &conf, &images).await?;

    let docs = update_refs_in_resources(&resources, &rules, &images, args.images_annotation)
        .context("Updating resource references")?;

    // stdout stays empty unless the whole pipeline succeeded
    let mut stdout = std::io::stdout().lock();
    for doc in docs {
        stdout.write_all(b"---\n")?;
        stdout.write_all(&doc)?;
    }
    Ok(())
}

async fn load_resources(files: &[PathBuf]) -> Result<Vec<Resource>> {
    let mut resources = Vec::new();
    for path in files {
        let buf = if path == Path::new("-") {
            let mut buf = String::new();
            tokio::io::stdin()
                .read_to_string(&mut buf)
                .await
                .context("Failed to read resources from stdin")?;
            buf
        } else {
            fs::read_to_string(path)
                .await
                .with_context(|| anyhow!("Failed to read input file: {path:?}"))?
        };
        let parsed = Resource::parse_stream(&buf)
            .with_context(|| anyhow!("Failed to parse input file: {path:?}"))?;
        resources.extend(parsed);
    }
    Ok(resources)
}

/// First visit pass: gathers every image reference without touching the
/// documents.
pub fn collect_image_refs(resources: &[Resource], rules: &[SearchRule]) -> UnresolvedRefs {
    let mut unresolved = UnresolvedRefs::new();
    for resource in resources {
        let mut copy = resource.deep_copy();
        ImageRefs::new(rules).visit(copy.value_mut(), &mut |image| {
            unresolved.add(image);
            (String::new(), false)
        });
    }
    unresolved
}

/// Second visit pass: rewrites every matched field to its resolved url and
/// optionally attaches the images annotation. Missing references aggregate
/// into one error.
pub fn update_refs_in_resources(
    resources: &[Resource],
    rules: &[SearchRule],
    images: &ProcessedImages,
    images_annotation: bool,
) -> Result<Vec<Vec<u8>>> {
    let mut errs = Vec::new();
    let mut docs = Vec::new();

    for resource in resources {
        let mut copy = resource.deep_copy();
        let mut observed = Vec::<ResolvedImage>::new();

        ImageRefs::new(rules).visit(copy.value_mut(), &mut |image| {
            let Some(resolved) = images.find_by_url(image) else {
                errs.push(format!("Expected to find image for {image:?}"));
                return (String::new(), false);
            };
            if images_annotation {
                observed.push(resolved.clone());
            }
            (resolved.url.clone(), true)
        });

        if !observed.is_empty() {
            let listed = serde_yaml::to_string(&observed)
                .context("Failed to serialize images annotation")?;
            copy.set_annotation(IMAGES_ANNOTATION, listed)?;
        }

        docs.push(copy.bytes()?);
    }

    if !errs.is_empty() {
        bail!("\n- {}", errs.join("\n- "));
    }
    Ok(docs)
}

async fn emit_lock_output(
    args: &args::Resolve,
    conf: &Conf,
    images: &ProcessedImages,
) -> Result<()> {
    if let Some(path) = &args.lock_output {
        let config = lockfile::lock_config(conf, images);
        let buf = serde_yaml::to_string(&config).context("Failed to serialize lockfile")?;
        fs::write(path, buf)
            .await
            .with_context(|| anyhow!("Failed to write lockfile: {path:?}"))?;
    } else if let Some(path) = &args.imgpkg_lock_output {
        let lock = lockfile::images_lock(images)?;
        let buf = serde_yaml::to_string(&lock).context("Failed to serialize images lockfile")?;
        fs::write(path, buf)
            .await
            .with_context(|| anyhow!("Failed to write images lockfile: {path:?}"))?;
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct UnresolvedInspect {
    images: Vec<UnresolvedInspectEntry>,
}

#[derive(Debug, Serialize)]
struct UnresolvedInspectEntry {
    image: String,
}

fn unresolved_inspect_output(unresolved: &UnresolvedRefs) -> Result<String> {
    let inspect = UnresolvedInspect {
        images: unresolved
            .iter()
            .map(|image| UnresolvedInspectEntry {
                image: image.clone(),
            })
            .collect(),
    };
    serde_yaml::to_string(&inspect).context("Failed to serialize unresolved images")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ImageRegistry;
    use crate::test_data;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubRegistry {
        digests: HashMap<String, String>,
        calls: AtomicUsize,
    }

    impl StubRegistry {
        fn with(digests: &[(&str, &str)]) -> StubRegistry {
            StubRegistry {
                digests: digests
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ImageRegistry for StubRegistry {
        async fn digest(&self, url: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.digests
                .get(url)
                .cloned()
                .with_context(|| anyhow!("Unknown image: {url:?}"))
        }

        async fn list_tags(&self, _url: &str) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    fn parse_inputs(buf: &str) -> (Vec<Resource>, Conf) {
        Conf::from_resources(Resource::parse_stream(buf).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_resolve_end_to_end() -> Result<()> {
        let buf = format!(
            "{}---\n{}---\n{}",
            test_data::TWO_PODS_YAML,
            test_data::MYAPP_POD_YAML,
            test_data::MYAPP_OVERRIDE_CONFIG_YAML,
        );
        let (resources, conf) = parse_inputs(&buf);
        let rules = conf.search_rules();

        let unresolved = collect_image_refs(&resources, &rules);
        assert_eq!(unresolved.len(), 2);

        let registry = Arc::new(StubRegistry::with(&[("nginx:1.19", "sha256:bbb")]));
        let factory = Factory::new(conf, registry.clone(), Logger::new(), false);
        let images = ImageQueue::new(factory).run(&unresolved, 4).await?;

        // every collected ref is covered
        for url in unresolved.iter() {
            assert!(images.find_by_url(url).is_some(), "missing {url:?}");
        }
        assert_eq!(registry.calls.load(Ordering::SeqCst), 1);

        let docs = update_refs_in_resources(&resources, &rules, &images, false)?;
        assert_eq!(docs.len(), 3);
        let rendered = docs
            .iter()
            .map(|d| String::from_utf8(d.clone()).unwrap())
            .collect::<Vec<_>>();
        assert!(rendered[0].contains("image: nginx@sha256:bbb"));
        assert!(rendered[1].contains("image: nginx@sha256:bbb"));
        assert!(rendered[2].contains("image: myapp@sha256:aaa"));

        let lock = lockfile::images_lock(&images)?;
        assert_eq!(lock.images.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_rewrite_fidelity() -> Result<()> {
        let (resources, conf) = parse_inputs(test_data::TWO_PODS_YAML);
        let rules = conf.search_rules();
        let unresolved = collect_image_refs(&resources, &rules);

        let registry = Arc::new(StubRegistry::with(&[("nginx:1.19", "sha256:bbb")]));
        let factory = Factory::new(conf, registry, Logger::new(), false);
        let images = ImageQueue::new(factory).run(&unresolved, 4).await?;

        let docs = update_refs_in_resources(&resources, &rules, &images, false)?;

        // collecting refs from the rewritten documents yields the resolved urls
        let rewritten = docs
            .iter()
            .map(|d| Resource::parse_stream(std::str::from_utf8(d).unwrap()).unwrap().remove(0))
            .collect::<Vec<_>>();
        let after = collect_image_refs(&rewritten, &rules);
        let after = after.iter().cloned().collect::<Vec<_>>();
        assert_eq!(after, vec!["nginx@sha256:bbb".to_string()]);

        // everything but the image field survives re-serialization unchanged
        assert!(String::from_utf8(docs[0].clone())?.contains("name: pod1"));
        Ok(())
    }

    #[test]
    fn test_update_refs_aggregates_missing_images() {
        let (resources, conf) = parse_inputs(test_data::TWO_PODS_YAML);
        let rules = conf.search_rules();
        let images = ProcessedImages::default();

        let err = update_refs_in_resources(&resources, &rules, &images, false).unwrap_err();
        let msg = format!("{err}");
        assert!(msg.contains("- Expected to find image for \"nginx:1.19\""));
    }

    #[test]
    fn test_images_annotation_is_attached() -> Result<()> {
        let (resources, conf) = parse_inputs(test_data::POD_YAML);
        let rules = conf.search_rules();

        let mut images = ProcessedImages::default();
        images.add(
            "nginx:1.19",
            ResolvedImage {
                origins: Vec::new(),
                url: "nginx@sha256:bbb".to_string(),
                image_id: None,
            },
        );

        let docs = update_refs_in_resources(&resources, &rules, &images, true)?;
        let rendered = String::from_utf8(docs[0].clone())?;
        assert!(rendered.contains(IMAGES_ANNOTATION));
        assert!(rendered.contains("url: nginx@sha256:bbb"));
        Ok(())
    }

    #[test]
    fn test_unresolved_inspect_output() -> Result<()> {
        let (resources, conf) = parse_inputs(test_data::TWO_PODS_YAML);
        let unresolved = collect_image_refs(&resources, &conf.search_rules());
        let output = unresolved_inspect_output(&unresolved)?;
        assert_eq!(output, "images:\n- image: nginx:1.19\n");
        Ok(())
    }
}
