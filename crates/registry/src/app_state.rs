use std::sync::Arc;

use crate::auth::InstanceAuthority;
use crate::cache::CacheSet;
use crate::config::AppConfig;
use crate::eventbus::EventHub;
use crate::healthcheck::LeaderHealthChecker;
use crate::http::ConnLimiter;
use crate::rate_limit::KeyedSlidingWindow;
use crate::service::discover::DiscoverServer;
use crate::store::Store;

/// Shared application state passed into handlers. Components receive their
/// handles by construction at boot; there are no process-global lookups.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub hub: EventHub,
    pub store: Arc<dyn Store>,
    pub caches: Arc<CacheSet>,
    pub checker: Arc<LeaderHealthChecker>,
    pub authority: Arc<InstanceAuthority>,
    pub discover: Arc<DiscoverServer>,
    /// Per-api buckets keyed by the raw URL path.
    pub api_limiter: Arc<KeyedSlidingWindow>,
    pub conn_limiter: Arc<ConnLimiter>,
}

#[allow(dead_code)]
fn _assert_app_state_bounds() {
    fn assert_bounds<T: Clone + Send + Sync + 'static>() {}
    assert_bounds::<AppState>();
}
