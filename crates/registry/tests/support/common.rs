#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::connect_info::ConnectInfo,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use registry::{
    app_state::AppState,
    build_app_state,
    config::{
        ApiRateLimitConfig, AppConfig, AsyncRegisterConfig, AuthConfig, BatchConfig, CacheConfig,
        ConnLimitConfig, HealthCheckConfig, InstanceLimitConfig, LeaderCheckerConfig,
        LimitsConfig, MetricsConfig, ServerConfig,
    },
    eventbus::EventHub,
    http::build_router,
    store::memory::MemoryStore,
    store::Store,
    telemetry,
};
use serde_json::Value;
use tower::ServiceExt;

#[derive(Clone)]
pub struct TestAppConfig {
    pub console_auth: bool,
    pub api_rate_limit_per_minute: u32,
    pub instance_rate_limit_per_minute: u32,
    pub async_register: bool,
    pub expire_duration_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for TestAppConfig {
    fn default() -> Self {
        Self {
            console_auth: false,
            api_rate_limit_per_minute: 0,
            instance_rate_limit_per_minute: 0,
            async_register: false,
            expire_duration_secs: 1,
            sweep_interval_secs: 1,
        }
    }
}

pub fn app_config(test: &TestAppConfig) -> AppConfig {
    AppConfig {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            advertised_host: "127.0.0.1".to_string(),
        },
        metrics: MetricsConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        },
        conn_limit: ConnLimitConfig {
            open_conn_limit: false,
            max_conn_per_host: 1024,
            max_conn_limit: 10240,
        },
        tls: None,
        health_check: HealthCheckConfig {
            expire_duration_secs: test.expire_duration_secs,
            sweep_interval_secs: test.sweep_interval_secs,
            leader: LeaderCheckerConfig {
                solt_num: 8,
                stream_num: 2,
                batch: BatchConfig {
                    queue_size: 256,
                    wait_time_ms: 10,
                    max_batch_count: 32,
                    concurrency: 4,
                },
            },
        },
        async_register: AsyncRegisterConfig {
            enabled: test.async_register,
            batch: None,
        },
        cache: CacheConfig {
            refresh_interval_ms: 100,
        },
        instance_limit: InstanceLimitConfig {
            rate_limit_per_minute: test.instance_rate_limit_per_minute,
        },
        api_rate_limit: ApiRateLimitConfig {
            per_minute: test.api_rate_limit_per_minute,
        },
        limits: LimitsConfig {
            max_field_len: 128,
            max_metadata_count: 64,
            max_batch_size: 100,
        },
        auth: AuthConfig {
            console_open: test.console_auth,
            client_open: false,
        },
    }
}

pub struct TestApp {
    pub state: AppState,
    pub store: MemoryStore,
    pub hub: EventHub,
    router: Router,
}

pub async fn spawn_app(test: TestAppConfig) -> TestApp {
    let _ = telemetry::init_metrics_recorder();
    let hub = EventHub::new();
    let store = MemoryStore::new(hub.clone(), "127.0.0.1");
    let dyn_store: Arc<dyn Store> = Arc::new(store.clone());
    let state = build_app_state(app_config(&test), dyn_store, hub.clone())
        .await
        .expect("build app state");
    // Let the self-election settle before tests drive traffic.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let router = build_router(state.clone()).with_state(state.clone());
    TestApp {
        state,
        store,
        hub,
        router,
    }
}

impl TestApp {
    /// One-shot request against the router; responses come back as parsed
    /// JSON plus status.
    pub async fn request(
        &self,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => {
                builder = builder.header("content-type", "application/json");
                builder
                    .body(Body::from(serde_json::to_vec(&body).expect("serialize")))
                    .expect("request")
            }
            None => builder.body(Body::empty()).expect("request"),
        };
        let mut request = request;
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000))));

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router response");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("read body")
            .to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("parse body")
        };
        (status, value)
    }

    pub async fn refresh_caches(&self) {
        self.state.caches.refresh_all().await.expect("refresh");
    }
}

pub fn register_body(service: &str, host: &str, port: u16) -> Value {
    serde_json::json!({
        "namespace": "default",
        "service": service,
        "host": host,
        "port": port,
    })
}
