//! Per-call-site memoization of built pipelines and metrics recorders.
//!
//! A call-site's pipeline is built at most once: concurrent first callers block on the same
//! cell until the single builder finishes, then all observe the same instance. Entries are
//! never invalidated. A build that fails leaves the cell empty, so the next call reports the
//! configuration error again instead of running an unprotected unit of work.

use crate::call_site::CallSite;
use crate::error::ConfigError;
use crate::metrics::MetricsRecorder;
use once_cell::sync::OnceCell;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

type Slot = Arc<OnceCell<Arc<dyn Any + Send + Sync>>>;

#[derive(Default)]
pub struct StrategyCache {
    pipelines: RwLock<HashMap<CallSite, Slot>>,
    recorders: Mutex<HashMap<CallSite, Arc<dyn MetricsRecorder>>>,
}

impl std::fmt::Debug for StrategyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyCache").field("pipelines", &self.len()).finish()
    }
}

impl StrategyCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, site: &CallSite) -> Slot {
        if let Some(slot) = self.pipelines.read().unwrap_or_else(|e| e.into_inner()).get(site) {
            return slot.clone();
        }
        self.pipelines
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(site.clone())
            .or_default()
            .clone()
    }

    /// The pipeline of `site`, running `build` if none was published yet.
    pub fn get_or_build<P, F>(&self, site: &CallSite, build: F) -> Result<P, ConfigError>
    where
        P: Clone + Any + Send + Sync,
        F: FnOnce() -> Result<P, ConfigError>,
    {
        let slot = self.slot(site);
        let value = slot.get_or_try_init(|| build().map(|p| Arc::new(p) as Arc<dyn Any + Send + Sync>))?;
        value.downcast_ref::<P>().cloned().ok_or_else(|| ConfigError::CachedTypeMismatch(site.to_string()))
    }

    /// `true` once a pipeline for `site` was published.
    pub fn contains(&self, site: &CallSite) -> bool {
        self.pipelines
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(site)
            .map_or(false, |slot| slot.get().is_some())
    }

    /// Number of published pipelines.
    pub fn len(&self) -> usize {
        self.pipelines
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|slot| slot.get().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The metrics recorder of `site`, created by `make` on first use.
    pub fn recorder<F>(&self, site: &CallSite, make: F) -> Arc<dyn MetricsRecorder>
    where
        F: FnOnce() -> Arc<dyn MetricsRecorder>,
    {
        self.recorders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(site.clone())
            .or_insert_with(make)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopMetrics;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    #[test]
    fn builds_once_under_concurrent_first_use() {
        let cache = Arc::new(StrategyCache::new());
        let builds = Arc::new(AtomicUsize::new(0));
        let start = Arc::new(Barrier::new(8));
        let site = CallSite::new("Svc", "op");

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let (cache, builds, start, site) = (cache.clone(), builds.clone(), start.clone(), site.clone());
                std::thread::spawn(move || {
                    start.wait();
                    cache
                        .get_or_build(&site, || {
                            builds.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(std::time::Duration::from_millis(10));
                            Ok(Arc::new(42u32))
                        })
                        .unwrap()
                })
            })
            .collect();
        let instances: Vec<Arc<u32>> = workers.into_iter().map(|w| w.join().unwrap()).collect();

        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert!(instances.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert!(cache.contains(&site));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn failed_builds_are_not_published() {
        let cache = StrategyCache::new();
        let site = CallSite::new("Svc", "op");
        let err = cache
            .get_or_build::<u8, _>(&site, || Err(ConfigError::invalid("retry", "max_retries", "bad")))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidParameter { .. }));
        assert!(!cache.contains(&site));
        assert_eq!(cache.get_or_build(&site, || Ok(3u8)).unwrap(), 3);
    }

    #[test]
    fn type_mismatch_is_reported() {
        let cache = StrategyCache::new();
        let site = CallSite::new("Svc", "op");
        cache.get_or_build(&site, || Ok(1u8)).unwrap();
        let err = cache.get_or_build(&site, || Ok(String::new())).unwrap_err();
        assert_eq!(err, ConfigError::CachedTypeMismatch("Svc#op".into()));
    }

    #[test]
    fn recorders_are_per_site_singletons() {
        let cache = StrategyCache::new();
        let site = CallSite::new("Svc", "op");
        let a = cache.recorder(&site, || Arc::new(NoopMetrics));
        let b = cache.recorder(&site, || panic!("recorder created twice"));
        assert!(Arc::ptr_eq(&a, &b));
    }
}
