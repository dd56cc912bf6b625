//! HTTP adapters: the native naming/discovery surface and the checker peer
//! channel. Handlers translate wire requests into core calls and map the
//! closed code set onto HTTP statuses (`status = wire_code / 1000`).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Query, State},
    http::{HeaderMap, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use common::api::{ApiCode, Instance, InstanceRequest, Service, ServiceKey};
use dashmap::DashMap;
use serde::Serialize;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tracing::warn;

use crate::app_state::AppState;
use crate::context::RequestContext;
use crate::error::{ApiError, ApiResult, CoordError};
use crate::healthcheck::peer::{DeleteBeatsRequest, QueryBeatsRequest, ReplicateBeatsRequest};
use crate::service::discover::{DiscoverRequest, DiscoverResult};
use crate::service::{worst_code, BatchUpdateOutcome, UpdateOutcome};
use crate::store::RouterRule;

pub const OPERATOR_HEADER: &str = "x-registry-operator";
pub const USER_ID_HEADER: &str = "x-registry-user-id";
pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const PLATFORM_ID_HEADER: &str = "x-platform-id";

// ----- wire envelopes ----------------------------------------------------

#[derive(Debug, Serialize)]
pub struct BatchWriteBody {
    pub code: u32,
    pub info: String,
    pub size: usize,
    pub responses: Vec<SingleWriteBody>,
}

#[derive(Debug, Serialize)]
pub struct SingleWriteBody {
    pub code: u32,
    pub info: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<Instance>,
}

#[derive(Debug, Serialize)]
pub struct QueryInstanceBody {
    #[serde(flatten)]
    pub instance: Instance,
    pub editable: bool,
}

#[derive(Debug, Serialize)]
pub struct BatchQueryBody {
    pub code: u32,
    pub info: String,
    pub amount: usize,
    pub size: usize,
    pub instances: Vec<QueryInstanceBody>,
}

#[derive(Debug, Serialize)]
pub struct DiscoverMeta {
    pub namespace: String,
    pub service: String,
    pub revision: String,
}

#[derive(Debug, Serialize)]
pub struct DiscoverBody<T: Serialize> {
    pub code: u32,
    pub info: String,
    pub service: DiscoverMeta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias_for: Option<ServiceKey>,
    #[serde(flatten)]
    pub payload: T,
}

#[derive(Debug, Serialize)]
pub struct InstancesPayload {
    pub instances: Vec<Instance>,
}

#[derive(Debug, Serialize)]
pub struct ServicesPayload {
    pub services: Vec<Service>,
}

#[derive(Debug, Serialize)]
pub struct RoutersPayload {
    pub rules: Vec<RouterRule>,
}

#[derive(Debug, Serialize)]
pub struct ServiceRulesPayload {
    pub rules: Vec<crate::store::ServiceRule>,
}

fn code_response(code: ApiCode, info: impl Into<String>) -> Response {
    let status =
        StatusCode::from_u16(code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = serde_json::json!({
        "code": code.wire_code(),
        "info": info.into(),
    });
    (status, Json(body)).into_response()
}

fn error_response(err: &ApiError) -> Response {
    code_response(err.code, err.message.clone())
}

fn json_with_code<T: Serialize>(code: ApiCode, body: T) -> Response {
    let status =
        StatusCode::from_u16(code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(body)).into_response()
}

// ----- request context ---------------------------------------------------

fn request_context(headers: &HeaderMap, from_client: bool, open_async_regis: bool) -> RequestContext {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string())
    };
    let principal = header(USER_ID_HEADER).map(crate::store::Principal::user);
    RequestContext {
        auth_context: None,
        request_id: header(REQUEST_ID_HEADER),
        platform_id: header(PLATFORM_ID_HEADER),
        operator: header(OPERATOR_HEADER),
        from_client,
        open_async_regis,
        principal,
    }
}

// ----- connection and api limits -----------------------------------------

/// Active-connection bookkeeping per remote host plus a process-wide total.
pub struct ConnLimiter {
    open: bool,
    max_per_host: usize,
    max_total: usize,
    per_host: DashMap<std::net::IpAddr, usize>,
    total: AtomicUsize,
}

impl ConnLimiter {
    pub fn new(open: bool, max_per_host: usize, max_total: usize) -> Arc<Self> {
        Arc::new(Self {
            open,
            max_per_host: max_per_host.max(1),
            max_total: max_total.max(1),
            per_host: DashMap::new(),
            total: AtomicUsize::new(0),
        })
    }

    fn try_acquire(&self, addr: std::net::IpAddr) -> bool {
        if !self.open {
            return true;
        }
        let total = self.total.fetch_add(1, Ordering::SeqCst) + 1;
        if total > self.max_total {
            self.total.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        let mut entry = self.per_host.entry(addr).or_insert(0);
        if *entry >= self.max_per_host {
            drop(entry);
            self.total.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        *entry += 1;
        true
    }

    fn release(&self, addr: std::net::IpAddr) {
        if !self.open {
            return;
        }
        self.total.fetch_sub(1, Ordering::SeqCst);
        if let Some(mut entry) = self.per_host.get_mut(&addr) {
            *entry = entry.saturating_sub(1);
        }
    }
}

async fn limits_middleware(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    // Per-api buckets are keyed by the raw URL path on purpose; trailing
    // slashes count as distinct APIs.
    let path = request.uri().path().to_string();
    if !state.api_limiter.try_acquire(&path) {
        metrics::counter!("api_rate_limited_total", "path" => path).increment(1);
        return code_response(ApiCode::ApiRateLimit, "api rate limit exceeded");
    }
    let ip = addr.ip();
    if !state.conn_limiter.try_acquire(ip) {
        warn!(%ip, "connection limit exceeded");
        return code_response(ApiCode::IpRateLimit, "connection limit exceeded");
    }
    let response = next.run(request).await;
    state.conn_limiter.release(ip);
    response
}

// ----- router -------------------------------------------------------------

pub fn build_router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/naming/v1/instances", post(create_instances))
        .route("/naming/v1/instances", put(update_instances))
        .route("/naming/v1/instances", get(get_instances))
        .route("/naming/v1/instances/count", get(get_instances_count))
        .route("/naming/v1/instances/delete", post(delete_instances))
        .route("/naming/v1/instances/isolate/host", post(isolate_by_host))
        .route("/naming/v1/instances/delete/host", post(delete_by_host))
        .route("/client/v1/instance/register", post(register_instance))
        .route("/client/v1/instance/deregister", post(deregister_instance))
        .route("/client/v1/instance/heartbeat", post(heartbeat))
        .route("/naming/v1/discover/instances", post(discover_instances))
        .route("/naming/v1/discover/services", post(discover_services))
        .route("/naming/v1/discover/routers", post(discover_routers))
        .route("/naming/v1/discover/ratelimits", post(discover_ratelimits))
        .route(
            "/naming/v1/discover/faultdetectors",
            post(discover_faultdetectors),
        )
        .route(
            "/naming/v1/discover/circuitbreakers",
            post(discover_circuitbreakers),
        )
        .route("/naming/v1/service/info", get(service_info))
        .route("/checker/v1/ping", get(checker_ping))
        .route("/checker/v1/replicate", post(checker_replicate))
        .route("/checker/v1/query", post(checker_query))
        .route("/checker/v1/delete", post(checker_delete))
        .layer(axum::middleware::from_fn_with_state(
            state,
            limits_middleware,
        ))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

pub fn build_metrics_router() -> Router<AppState> {
    Router::new().route("/metrics", get(metrics_endpoint))
}

async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    let _ = &state;
    crate::telemetry::render_metrics().into_response()
}

async fn healthz() -> Response {
    (StatusCode::OK, Json(serde_json::json!({"status": "ok"}))).into_response()
}

// ----- console instance handlers ------------------------------------------

fn batch_write_response<T>(
    results: ApiResult<Vec<ApiResult<T>>>,
    into_instance: impl Fn(T) -> Option<Instance>,
    success_code: impl Fn(&T) -> ApiCode,
) -> Response {
    let results = match results {
        Ok(results) => results,
        Err(err) => return error_response(&err),
    };
    let responses: Vec<SingleWriteBody> = results
        .into_iter()
        .map(|result| match result {
            Ok(value) => SingleWriteBody {
                code: success_code(&value).wire_code(),
                info: String::new(),
                instance: into_instance(value),
            },
            Err(err) => SingleWriteBody {
                code: err.code.wire_code(),
                info: err.message,
                instance: None,
            },
        })
        .collect();
    let batch_code = worst_code(
        responses
            .iter()
            .map(|response| wire_to_code(response.code)),
    );
    let body = BatchWriteBody {
        code: batch_code.wire_code(),
        info: String::new(),
        size: responses.len(),
        responses,
    };
    json_with_code(batch_code, body)
}

/// Maps a wire code back onto the enum; unknown codes collapse to the
/// generic failure.
fn wire_to_code(wire: u32) -> ApiCode {
    const ALL: &[ApiCode] = &[
        ApiCode::ExecuteSuccess,
        ApiCode::DataNoChange,
        ApiCode::NoNeedUpdate,
        ApiCode::EmptyRequest,
        ApiCode::EmptyQueryParameter,
        ApiCode::InvalidParameter,
        ApiCode::BatchSizeOverLimit,
        ApiCode::InvalidNamespaceName,
        ApiCode::InvalidServiceName,
        ApiCode::InvalidInstanceId,
        ApiCode::InvalidInstanceHost,
        ApiCode::InvalidInstancePort,
        ApiCode::InvalidMetadata,
        ApiCode::NotFoundService,
        ApiCode::NotFoundInstance,
        ApiCode::ExistedResource,
        ApiCode::NotAllowedAccess,
        ApiCode::IpRateLimit,
        ApiCode::ApiRateLimit,
        ApiCode::InstanceTooManyRequests,
        ApiCode::StoreLayerException,
        ApiCode::ExecuteException,
        ApiCode::ClientApiNotOpen,
    ];
    ALL.iter()
        .copied()
        .find(|code| code.wire_code() == wire)
        .unwrap_or(ApiCode::ExecuteException)
}

async fn create_instances(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(reqs): Json<Vec<InstanceRequest>>,
) -> Response {
    let ctx = request_context(&headers, false, false);
    let results = state.authority.create_instances(&ctx, reqs).await;
    batch_write_response(results, Some, |_| ApiCode::ExecuteSuccess)
}

async fn delete_instances(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(reqs): Json<Vec<InstanceRequest>>,
) -> Response {
    let ctx = request_context(&headers, false, false);
    let results = state.authority.delete_instances(&ctx, reqs).await;
    batch_write_response(results, |deleted| deleted, |_| ApiCode::ExecuteSuccess)
}

async fn update_instances(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(reqs): Json<Vec<InstanceRequest>>,
) -> Response {
    let ctx = request_context(&headers, false, false);
    let results = state.authority.update_instances(&ctx, reqs).await;
    batch_write_response(
        results,
        |outcome| match outcome {
            UpdateOutcome::Updated(instance) => Some(instance),
            UpdateOutcome::NoChange => None,
        },
        UpdateOutcome::code,
    )
}

async fn isolate_by_host(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(reqs): Json<Vec<InstanceRequest>>,
) -> Response {
    let ctx = request_context(&headers, false, false);
    let results = state.authority.update_instances_isolate(&ctx, reqs).await;
    batch_write_response(results, |_| None, BatchUpdateOutcome::code)
}

async fn delete_by_host(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(reqs): Json<Vec<InstanceRequest>>,
) -> Response {
    let ctx = request_context(&headers, false, false);
    let results = state.authority.delete_instances_by_host(&ctx, reqs).await;
    batch_write_response(results, |_| None, |_| ApiCode::ExecuteSuccess)
}

async fn get_instances(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let ctx = request_context(&headers, false, false);
    match state.authority.get_instances(&ctx, query).await {
        Ok(result) => {
            let instances: Vec<QueryInstanceBody> = result
                .instances
                .into_iter()
                .map(|item| QueryInstanceBody {
                    instance: item.instance,
                    editable: item.editable,
                })
                .collect();
            let body = BatchQueryBody {
                code: ApiCode::ExecuteSuccess.wire_code(),
                info: String::new(),
                amount: result.total,
                size: instances.len(),
                instances,
            };
            json_with_code(ApiCode::ExecuteSuccess, body)
        }
        Err(err) => error_response(&err),
    }
}

async fn get_instances_count(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let ctx = request_context(&headers, false, false);
    match state.authority.get_instances_count(&ctx).await {
        Ok(count) => json_with_code(
            ApiCode::ExecuteSuccess,
            serde_json::json!({
                "code": ApiCode::ExecuteSuccess.wire_code(),
                "info": "",
                "amount": count,
            }),
        ),
        Err(err) => error_response(&err),
    }
}

// ----- client handlers ----------------------------------------------------

async fn register_instance(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<InstanceRequest>,
) -> Response {
    let ctx = request_context(&headers, true, state.config.async_register.enabled);
    match state.authority.register_instance(&ctx, req).await {
        Ok(instance) => json_with_code(
            ApiCode::ExecuteSuccess,
            serde_json::json!({
                "code": ApiCode::ExecuteSuccess.wire_code(),
                "info": "",
                "instance": instance,
            }),
        ),
        Err(err) => error_response(&err),
    }
}

async fn deregister_instance(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<InstanceRequest>,
) -> Response {
    let ctx = request_context(&headers, true, state.config.async_register.enabled);
    match state.authority.deregister_instance(&ctx, req).await {
        Ok(_) => code_response(ApiCode::ExecuteSuccess, ""),
        Err(err) => error_response(&err),
    }
}

async fn heartbeat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<InstanceRequest>,
) -> Response {
    let ctx = request_context(&headers, true, false);
    match state.authority.heartbeat(&ctx, req).await {
        Ok(()) => code_response(ApiCode::ExecuteSuccess, ""),
        Err(err) => error_response(&err),
    }
}

// ----- discovery ----------------------------------------------------------

fn discover_meta(req: &DiscoverRequest, revision: String) -> DiscoverMeta {
    DiscoverMeta {
        namespace: req.namespace.clone(),
        service: req.service.clone(),
        revision,
    }
}

fn discover_response<T, P: Serialize>(
    req: &DiscoverRequest,
    result: ApiResult<DiscoverResult<T>>,
    wrap: impl Fn(T) -> P,
) -> Response {
    match result {
        Ok(DiscoverResult::NoChange) => code_response(ApiCode::DataNoChange, ""),
        Ok(DiscoverResult::Data {
            revision,
            alias_for,
            payload,
        }) => {
            let body = DiscoverBody {
                code: ApiCode::ExecuteSuccess.wire_code(),
                info: String::new(),
                service: discover_meta(req, revision),
                alias_for,
                payload: wrap(payload),
            };
            json_with_code(ApiCode::ExecuteSuccess, body)
        }
        Err(err) => error_response(&err),
    }
}

async fn discover_instances(
    State(state): State<AppState>,
    Json(req): Json<DiscoverRequest>,
) -> Response {
    let result = state.discover.instances(&req);
    discover_response(&req, result, |instances| InstancesPayload { instances })
}

async fn discover_services(
    State(state): State<AppState>,
    Json(req): Json<DiscoverRequest>,
) -> Response {
    let result = state.discover.services(&req);
    discover_response(&req, result, |services| ServicesPayload { services })
}

async fn discover_routers(
    State(state): State<AppState>,
    Json(req): Json<DiscoverRequest>,
) -> Response {
    let result = state.discover.router_rules(&req);
    discover_response(&req, result, |rules| RoutersPayload { rules })
}

async fn discover_ratelimits(
    State(state): State<AppState>,
    Json(req): Json<DiscoverRequest>,
) -> Response {
    let result = state.discover.service_rules(&state.caches.rate_limit, &req);
    discover_response(&req, result, |rules| ServiceRulesPayload { rules })
}

async fn discover_faultdetectors(
    State(state): State<AppState>,
    Json(req): Json<DiscoverRequest>,
) -> Response {
    let result = state.discover.service_rules(&state.caches.fault_detect, &req);
    discover_response(&req, result, |rules| ServiceRulesPayload { rules })
}

async fn discover_circuitbreakers(
    State(state): State<AppState>,
    Json(req): Json<DiscoverRequest>,
) -> Response {
    let result = state
        .discover
        .service_rules(&state.caches.circuit_breaker, &req);
    discover_response(&req, result, |rules| ServiceRulesPayload { rules })
}

async fn service_info(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let Some(service) = query.get("service") else {
        return code_response(ApiCode::InvalidServiceName, "service is required");
    };
    let namespace = query
        .get("namespace")
        .map(String::as_str)
        .unwrap_or("default");
    let clusters = query.get("clusters").map(String::as_str).unwrap_or("");
    let info = state.discover.service_info(service, namespace, clusters);
    (StatusCode::OK, Json(info)).into_response()
}

// ----- checker peer channel ----------------------------------------------

fn coord_response(err: CoordError) -> Response {
    match err {
        CoordError::RedirectOnlyOnce => {
            code_response(ApiCode::ExecuteException, "redirect request only once")
        }
        CoordError::PeerClosed => code_response(ApiCode::ExecuteException, "peer closed"),
        other => code_response(ApiCode::ExecuteException, other.to_string()),
    }
}

async fn checker_ping(State(state): State<AppState>) -> Response {
    let body = serde_json::json!({
        "leader": state.checker.is_leader(),
        "initialized": state.checker.is_initialized(),
    });
    (StatusCode::OK, Json(body)).into_response()
}

async fn checker_replicate(
    State(state): State<AppState>,
    Json(req): Json<ReplicateBeatsRequest>,
) -> Response {
    match state.checker.handle_replicate(req) {
        Ok(()) => code_response(ApiCode::ExecuteSuccess, ""),
        Err(err) => coord_response(err),
    }
}

async fn checker_query(
    State(state): State<AppState>,
    Json(req): Json<QueryBeatsRequest>,
) -> Response {
    match state.checker.handle_query(req) {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(err) => coord_response(err),
    }
}

async fn checker_delete(
    State(state): State<AppState>,
    Json(req): Json<DeleteBeatsRequest>,
) -> Response {
    match state.checker.handle_delete(req) {
        Ok(()) => code_response(ApiCode::ExecuteSuccess, ""),
        Err(err) => coord_response(err),
    }
}
