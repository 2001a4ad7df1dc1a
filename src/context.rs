//! Shared component wiring for the alert service.
//!
//! Every background role (beat, workers, API) receives the same explicitly
//! constructed context; there are no process-level singletons.

use std::sync::Arc;

use crate::audit::AuditLog;
use crate::cache::ContentCache;
use crate::circuit::CircuitBreaker;
use crate::config::Config;
use crate::kv::KvStore;
use crate::metrics::Metrics;
use crate::notify::NotificationManager;
use crate::scheduler::AdaptiveRecheck;
use crate::scraper::SharedScraper;
use crate::storage::Database;
use crate::tasks::queue::TaskQueue;

#[derive(Clone)]
pub struct AppContext {
    pub cfg: Arc<Config>,
    pub kv: Arc<dyn KvStore>,
    pub db: Database,
    pub metrics: Arc<Metrics>,
    pub queue: Arc<TaskQueue>,
    pub scheduler: Arc<AdaptiveRecheck>,
    pub circuit: Arc<CircuitBreaker>,
    pub cache: Arc<ContentCache>,
    pub notifier: Arc<NotificationManager>,
    pub scraper: SharedScraper,
    pub audit: Arc<AuditLog>,
}

impl AppContext {
    pub fn new(
        cfg: Arc<Config>,
        kv: Arc<dyn KvStore>,
        db: Database,
        scraper: SharedScraper,
    ) -> Self {
        let metrics = Arc::new(Metrics::new());
        Self::with_metrics(cfg, kv, db, scraper, metrics)
    }

    pub fn with_metrics(
        cfg: Arc<Config>,
        kv: Arc<dyn KvStore>,
        db: Database,
        scraper: SharedScraper,
        metrics: Arc<Metrics>,
    ) -> Self {
        let queue = Arc::new(TaskQueue::new(kv.clone()));
        let scheduler = Arc::new(AdaptiveRecheck::new(kv.clone(), metrics.clone(), &cfg));
        let circuit = Arc::new(CircuitBreaker::new(kv.clone(), metrics.clone(), &cfg));
        let cache = Arc::new(ContentCache::new(
            kv.clone(),
            metrics.clone(),
            cfg.cache_base_ttl,
            cfg.cache_max_multiplier,
        ));
        let notifier = Arc::new(NotificationManager::with_default_channels(
            cfg.clone(),
            metrics.clone(),
        ));
        let audit = Arc::new(AuditLog::new(cfg.audit_dir.clone(), metrics.clone()));

        Self {
            cfg,
            kv,
            db,
            metrics,
            queue,
            scheduler,
            circuit,
            cache,
            notifier,
            scraper,
            audit,
        }
    }
}
