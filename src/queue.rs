use crate::errors::*;
use crate::image::{Factory, ResolvedImage};
use indexmap::{IndexMap, IndexSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;

/// Distinct image references found during collection. Duplicates collapse at
/// insert, so the queue runs the transformation chain at most once per
/// reference.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnresolvedRefs {
    refs: IndexSet<String>,
}

impl UnresolvedRefs {
    pub fn new() -> UnresolvedRefs {
        UnresolvedRefs::default()
    }

    pub fn add<S: Into<String>>(&mut self, url: S) {
        self.refs.insert(url.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.refs.iter()
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }
}

/// Mapping from unresolved reference to its resolution outcome, in completion
/// order. Write-once per key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessedImages {
    images: IndexMap<String, ResolvedImage>,
}

impl ProcessedImages {
    /// First write for a key wins; the queue never resolves a key twice.
    pub fn add<S: Into<String>>(&mut self, url: S, image: ResolvedImage) {
        self.images.entry(url.into()).or_insert(image);
    }

    pub fn find_by_url(&self, url: &str) -> Option<&ResolvedImage> {
        self.images.get(url)
    }

    pub fn all(&self) -> impl Iterator<Item = (&String, &ResolvedImage)> {
        self.images.iter()
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

/// Bounded-concurrency work queue driving the transformation chain.
pub struct ImageQueue {
    factory: Arc<Factory>,
}

impl ImageQueue {
    pub fn new(factory: Factory) -> ImageQueue {
        ImageQueue {
            factory: Arc::new(factory),
        }
    }

    /// Resolves every reference with at most `concurrency` chains in flight.
    /// The first failure stops scheduling of queued work; in-flight chains run
    /// to completion and their results are discarded.
    pub async fn run(&self, refs: &UnresolvedRefs, concurrency: usize) -> Result<ProcessedImages> {
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let stop = Arc::new(AtomicBool::new(false));
        let images = Arc::new(Mutex::new(IndexMap::new()));
        let errors = Arc::new(Mutex::new(Vec::<Error>::new()));

        let mut tasks = JoinSet::new();
        for url in refs.iter() {
            let url = url.clone();
            let factory = self.factory.clone();
            let semaphore = semaphore.clone();
            let stop = stop.clone();
            let images = images.clone();
            let errors = errors.clone();

            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return;
                };
                if stop.load(Ordering::SeqCst) {
                    debug!("Skipping {url:?}, an earlier image failed");
                    return;
                }

                match factory.resolve(&url).await {
                    Ok(image) => {
                        if !stop.load(Ordering::SeqCst) {
                            images.lock().await.insert(url, image);
                        }
                    }
                    Err(err) => {
                        stop.store(true, Ordering::SeqCst);
                        errors
                            .lock()
                            .await
                            .push(err.context(format!("Resolving image {url:?}")));
                    }
                }
            });
        }

        while tasks.join_next().await.is_some() {}

        let errors = Arc::try_unwrap(errors)
            .map_err(|_| anyhow!("Image queue tasks still running"))?
            .into_inner();
        if let Some(err) = errors.into_iter().next() {
            return Err(err);
        }

        let images = Arc::try_unwrap(images)
            .map_err(|_| anyhow!("Image queue tasks still running"))?
            .into_inner();
        Ok(ProcessedImages { images })
    }
}
