//! Typed in-memory caches refreshed by periodic delta pulls from the store.
//!
//! Every cache keeps a monotonic `last_fetch_time` watermark and coalesces
//! concurrent refreshes through a single-flight keyed by its name. Apply
//! semantics are shared: rows with `valid = false` are removed from the
//! forward map and every reverse index, everything else is upserted, and
//! the watermark advances to the max row `modify_time` once the whole delta
//! is in.

pub mod instance;
pub mod router_rule;
pub mod rules;
pub mod service;
pub mod strategy;
pub mod user;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{error, info};

use crate::error::ApiResult;
use crate::store::{ServiceRuleKind, Store};

pub use instance::InstanceCache;
pub use router_rule::RouterRuleCache;
pub use rules::ServiceRuleCache;
pub use service::ServiceCache;
pub use strategy::StrategyCache;
pub use user::UserCache;

/// Per-cache fetch watermark: strictly monotonic, swapped once per refresh.
pub(crate) struct Watermark {
    last_fetch: Mutex<DateTime<Utc>>,
    first_load: AtomicBool,
}

impl Watermark {
    pub(crate) fn new() -> Self {
        Self {
            last_fetch: Mutex::new(DateTime::<Utc>::MIN_UTC),
            first_load: AtomicBool::new(true),
        }
    }

    pub(crate) fn snapshot(&self) -> (DateTime<Utc>, bool) {
        let last = *self.last_fetch.lock().expect("watermark poisoned");
        (last, self.first_load.load(Ordering::SeqCst))
    }

    /// Advances to `last_mtime` if it moved forward and clears the
    /// first-load flag.
    pub(crate) fn advance(&self, last_mtime: DateTime<Utc>) {
        let mut last = self.last_fetch.lock().expect("watermark poisoned");
        if last_mtime > *last {
            *last = last_mtime;
        }
        self.first_load.store(false, Ordering::SeqCst);
    }
}

/// All typed caches plus the refresh entry points.
pub struct CacheSet {
    pub service: Arc<ServiceCache>,
    pub instance: Arc<InstanceCache>,
    pub user: Arc<UserCache>,
    pub strategy: Arc<StrategyCache>,
    pub router_rule: Arc<RouterRuleCache>,
    pub rate_limit: Arc<ServiceRuleCache>,
    pub fault_detect: Arc<ServiceRuleCache>,
    pub circuit_breaker: Arc<ServiceRuleCache>,
}

impl CacheSet {
    pub fn new(store: Arc<dyn Store>) -> Arc<Self> {
        let service = Arc::new(ServiceCache::new(Arc::clone(&store)));
        let instance = Arc::new(InstanceCache::new(Arc::clone(&store)));
        let user = Arc::new(UserCache::new(Arc::clone(&store)));
        let strategy = Arc::new(StrategyCache::new(Arc::clone(&store), Arc::clone(&user)));
        let router_rule = Arc::new(RouterRuleCache::new(
            Arc::clone(&store),
            Arc::clone(&service),
        ));
        let rate_limit = Arc::new(ServiceRuleCache::new(
            Arc::clone(&store),
            ServiceRuleKind::RateLimit,
        ));
        let fault_detect = Arc::new(ServiceRuleCache::new(
            Arc::clone(&store),
            ServiceRuleKind::FaultDetect,
        ));
        let circuit_breaker = Arc::new(ServiceRuleCache::new(
            Arc::clone(&store),
            ServiceRuleKind::CircuitBreaker,
        ));
        Arc::new(Self {
            service,
            instance,
            user,
            strategy,
            router_rule,
            rate_limit,
            fault_detect,
            circuit_breaker,
        })
    }

    /// Refreshes every cache once. Caches are independent, so failures are
    /// reported but do not stop the remaining refreshes.
    pub async fn refresh_all(&self) -> ApiResult<()> {
        let (service, instance, user, strategy, router, rate, fault, breaker) = tokio::join!(
            self.service.update(),
            self.instance.update(),
            self.user.update(),
            self.strategy.update(),
            self.router_rule.update(),
            self.rate_limit.update(),
            self.fault_detect.update(),
            self.circuit_breaker.update(),
        );
        for result in [service, instance, user, strategy, router, rate, fault, breaker] {
            result?;
        }
        Ok(())
    }

    /// Spawns the periodic refresh loop; returns when the shutdown channel
    /// flips.
    pub fn spawn_refresh_loop(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let caches = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        let start = std::time::Instant::now();
                        if let Err(err) = caches.refresh_all().await {
                            error!(%err, "cache refresh failed");
                        } else {
                            metrics::histogram!("cache_refresh_duration_seconds")
                                .record(start.elapsed().as_secs_f64());
                        }
                    }
                }
            }
            info!("cache refresh loop stopped");
        })
    }
}
