//! Instance lifecycle service: register, deregister, update, isolate,
//! host-batch operations, heartbeat forwarding and filtered queries.
//!
//! Parent services are auto-created on first register, serialized per
//! `(namespace, name)` through a single-flight so concurrent first
//! registers produce exactly one service row. The create path additionally
//! read-locks the service row through a store transaction so a racing
//! service delete cannot orphan the new instance. Register/deregister can
//! ride an async batch pipeline when enabled by configuration.

pub mod discover;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use common::api::{
    instance_id, new_revision, ApiCode, HealthCheck, HealthCheckKind, Instance, InstanceEvent,
    InstanceEventType, InstanceRequest, Service, INSTANCE_EVENT_TOPIC,
};
use tracing::{error, info, warn};

use crate::batch::{BatchController, BatchHandler, CtrlConfig};
use crate::cache::CacheSet;
use crate::config::{AsyncRegisterConfig, InstanceLimitConfig, LimitsConfig};
use crate::context::RequestContext;
use crate::error::{ApiError, ApiResult, CoordError};
use crate::eventbus::EventHub;
use crate::healthcheck::{LeaderHealthChecker, ReportRequest};
use crate::history::{HistorySink, OperationType, RecordEntry};
use crate::rate_limit::KeyedSlidingWindow;
use crate::singleflight::SingleFlight;
use crate::store::{InstanceFilters, Store, StoreError};

const DEFAULT_WEIGHT: u32 = 100;
const AUTO_CREATED_META_KEY: &str = "internal-auto-created";

/// Query attributes accepted by the expanded instance query.
const INSTANCE_FILTER_ATTRIBUTES: &[&str] = &[
    "service",
    "namespace",
    "host",
    "port",
    "keys",
    "values",
    "protocol",
    "version",
    "health_status",
    "healthy",
    "isolate",
    "weight",
    "logic_set",
    "cmdb_region",
    "cmdb_zone",
    "cmdb_idc",
    "priority",
    "offset",
    "limit",
];

/// Outcome of a single-instance update.
#[derive(Debug, Clone)]
pub enum UpdateOutcome {
    Updated(Instance),
    NoChange,
}

impl UpdateOutcome {
    pub fn code(&self) -> ApiCode {
        match self {
            UpdateOutcome::Updated(_) => ApiCode::ExecuteSuccess,
            UpdateOutcome::NoChange => ApiCode::NoNeedUpdate,
        }
    }
}

/// Outcome of a host-batch mutation.
#[derive(Debug, Clone)]
pub enum BatchUpdateOutcome {
    Updated(usize),
    NoChange,
}

impl BatchUpdateOutcome {
    pub fn code(&self) -> ApiCode {
        match self {
            BatchUpdateOutcome::Updated(_) => ApiCode::ExecuteSuccess,
            BatchUpdateOutcome::NoChange => ApiCode::NoNeedUpdate,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InstanceQueryResult {
    pub total: usize,
    pub instances: Vec<Instance>,
}

/// The batch code is the worst per-item code.
pub fn worst_code(codes: impl IntoIterator<Item = ApiCode>) -> ApiCode {
    codes
        .into_iter()
        .max_by_key(|code| code.wire_code())
        .unwrap_or(ApiCode::ExecuteSuccess)
}

struct InstanceBatcher {
    register: BatchController<Instance, Instance>,
    deregister: BatchController<String, ()>,
}

pub struct InstanceServer {
    store: Arc<dyn Store>,
    caches: Arc<CacheSet>,
    hub: EventHub,
    checker: Arc<LeaderHealthChecker>,
    limits: LimitsConfig,
    create_service_flight: SingleFlight<String, ApiResult<String>>,
    instance_limiter: KeyedSlidingWindow,
    batcher: Option<InstanceBatcher>,
    history: Arc<dyn HistorySink>,
}

impl InstanceServer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        caches: Arc<CacheSet>,
        hub: EventHub,
        checker: Arc<LeaderHealthChecker>,
        limits: LimitsConfig,
        instance_limit: InstanceLimitConfig,
        async_register: AsyncRegisterConfig,
        history: Arc<dyn HistorySink>,
    ) -> Arc<Self> {
        let batcher = if async_register.enabled {
            Some(Self::build_batcher(&store, async_register))
        } else {
            None
        };
        Arc::new(Self {
            store,
            caches,
            hub,
            checker,
            limits,
            create_service_flight: SingleFlight::new(),
            instance_limiter: KeyedSlidingWindow::per_minute(instance_limit.rate_limit_per_minute),
            batcher,
            history,
        })
    }

    fn build_batcher(store: &Arc<dyn Store>, conf: AsyncRegisterConfig) -> InstanceBatcher {
        let batch = conf.batch.unwrap_or(crate::config::BatchConfig {
            queue_size: 10240,
            wait_time_ms: 32,
            max_batch_count: 128,
            concurrency: 64,
        });
        let ctrl = |label: &str| CtrlConfig {
            label: label.to_string(),
            queue_size: batch.queue_size,
            wait_time: std::time::Duration::from_millis(batch.wait_time_ms),
            max_batch_count: batch.max_batch_count,
            concurrency: batch.concurrency,
        };

        let register_store = Arc::clone(store);
        let register_handler: BatchHandler<Instance, Instance> = Arc::new(move |tasks| {
            let store = Arc::clone(&register_store);
            Box::pin(async move {
                for task in tasks {
                    let instance = task.param.clone();
                    let result = match store.add_instance(instance.clone()).await {
                        Ok(()) => Ok(instance),
                        Err(err) => Err(ApiError::from(err)),
                    };
                    task.reply(result);
                }
            })
        });

        let deregister_store = Arc::clone(store);
        let deregister_handler: BatchHandler<String, ()> = Arc::new(move |tasks| {
            let store = Arc::clone(&deregister_store);
            Box::pin(async move {
                for task in tasks {
                    let result = store
                        .delete_instance(&task.param)
                        .await
                        .map_err(ApiError::from);
                    task.reply(result);
                }
            })
        });

        InstanceBatcher {
            register: BatchController::new(ctrl("instance-register"), register_handler),
            deregister: BatchController::new(ctrl("instance-deregister"), deregister_handler),
        }
    }

    // ----- batch entry points -------------------------------------------

    pub async fn create_instances(
        &self,
        ctx: &RequestContext,
        reqs: Vec<InstanceRequest>,
    ) -> ApiResult<Vec<ApiResult<Instance>>> {
        self.check_batch(&reqs)?;
        let mut out = Vec::with_capacity(reqs.len());
        for req in reqs {
            out.push(self.create_instance(ctx, req).await);
        }
        Ok(out)
    }

    pub async fn delete_instances(
        &self,
        ctx: &RequestContext,
        reqs: Vec<InstanceRequest>,
    ) -> ApiResult<Vec<ApiResult<Option<Instance>>>> {
        self.check_batch(&reqs)?;
        let mut out = Vec::with_capacity(reqs.len());
        for req in reqs {
            out.push(self.delete_instance(ctx, req).await);
        }
        Ok(out)
    }

    pub async fn update_instances(
        &self,
        ctx: &RequestContext,
        reqs: Vec<InstanceRequest>,
    ) -> ApiResult<Vec<ApiResult<UpdateOutcome>>> {
        self.check_batch(&reqs)?;
        let mut out = Vec::with_capacity(reqs.len());
        for req in reqs {
            out.push(self.update_instance(ctx, req).await);
        }
        Ok(out)
    }

    pub async fn update_instances_isolate(
        &self,
        ctx: &RequestContext,
        reqs: Vec<InstanceRequest>,
    ) -> ApiResult<Vec<ApiResult<BatchUpdateOutcome>>> {
        self.check_batch(&reqs)?;
        let mut out = Vec::with_capacity(reqs.len());
        for req in reqs {
            out.push(self.update_instance_isolate(ctx, req).await);
        }
        Ok(out)
    }

    pub async fn delete_instances_by_host(
        &self,
        ctx: &RequestContext,
        reqs: Vec<InstanceRequest>,
    ) -> ApiResult<Vec<ApiResult<usize>>> {
        self.check_batch(&reqs)?;
        let mut out = Vec::with_capacity(reqs.len());
        for req in reqs {
            out.push(self.delete_instance_by_host(ctx, req).await);
        }
        Ok(out)
    }

    fn check_batch<T>(&self, reqs: &[T]) -> ApiResult<()> {
        if reqs.is_empty() {
            return Err(ApiError::code(ApiCode::EmptyRequest));
        }
        if reqs.len() > self.limits.max_batch_size {
            return Err(ApiError::code(ApiCode::BatchSizeOverLimit));
        }
        Ok(())
    }

    // ----- register ------------------------------------------------------

    pub async fn create_instance(
        &self,
        ctx: &RequestContext,
        req: InstanceRequest,
    ) -> ApiResult<Instance> {
        let start = std::time::Instant::now();
        let id = self.check_create_instance(&req)?;
        if !self.instance_limiter.try_acquire(&id) {
            error!(instance_id = %id, "create instance exceeds per-instance rate allowance");
            return Err(ApiError::code(ApiCode::InstanceTooManyRequests));
        }

        let namespace = req.namespace.clone().unwrap_or_default();
        let service = req.service.clone().unwrap_or_default();
        let service_id = self
            .create_service_if_absent(ctx, &namespace, &service)
            .await?;

        let existing = self
            .store
            .get_instance(&id)
            .await
            .map_err(|err| ApiError::from(err))?;
        if let Some(existing) = existing {
            return self.re_register(ctx, req, existing).await;
        }

        let instance = build_instance(&service_id, &id, &req, None);
        let stored = if self.batcher.is_some() && ctx.open_async_regis {
            self.async_create_instance(instance).await?
        } else {
            self.serial_create_instance(&namespace, &service, instance)
                .await?
        };

        info!(
            instance_id = %stored.id,
            namespace = %stored.namespace,
            service = %stored.service,
            host = %stored.host,
            port = stored.port,
            cost = ?start.elapsed(),
            "create instance"
        );
        self.send_discover_event(ctx, &stored, InstanceEventType::Online);
        self.record_history(ctx, &stored, OperationType::Create);
        Ok(stored)
    }

    /// Second register of an existing id: identical content is a no-op that
    /// returns the stored row; changed content becomes an attribute update
    /// so no duplicate online event ever fires.
    async fn re_register(
        &self,
        ctx: &RequestContext,
        req: InstanceRequest,
        existing: Instance,
    ) -> ApiResult<Instance> {
        let mut candidate = build_instance(&existing.service_id, &existing.id, &req, Some(&existing));
        if instances_equivalent(&candidate, &existing) {
            return Ok(existing);
        }
        candidate.revision = new_revision();
        candidate.mtime = Utc::now();
        self.store
            .update_instance(candidate.clone())
            .await
            .map_err(ApiError::from)?;
        self.send_discover_event(ctx, &candidate, InstanceEventType::Update);
        self.record_history(ctx, &candidate, OperationType::Update);
        Ok(candidate)
    }

    async fn serial_create_instance(
        &self,
        namespace: &str,
        service: &str,
        instance: Instance,
    ) -> ApiResult<Instance> {
        // Pin the service row so a racing service delete cannot win between
        // the existence check and the insert.
        let mut tx = self
            .store
            .create_transaction()
            .await
            .map_err(|err| ApiError::store_layer(err.to_string()))?;
        let locked = match tx.rlock_service(service, namespace).await {
            Ok(locked) => locked,
            Err(err) => {
                let _ = tx.commit().await;
                return Err(ApiError::store_layer(err.to_string()));
            }
        };
        let Some(locked) = locked else {
            let _ = tx.commit().await;
            return Err(ApiError::code(ApiCode::NotFoundService));
        };
        if locked.is_alias() {
            let _ = tx.commit().await;
            return Err(ApiError::new(
                ApiCode::InvalidParameter,
                "cannot register instances under a service alias",
            ));
        }

        let result = self.store.add_instance(instance.clone()).await;
        let _ = tx.commit().await;
        match result {
            Ok(()) => Ok(instance),
            Err(StoreError::Duplicate(_)) => {
                // A concurrent register won; reuse its row as a soft success.
                match self.store.get_instance(&instance.id).await {
                    Ok(Some(existing)) => Ok(existing),
                    Ok(None) => Err(ApiError::code(ApiCode::ExecuteException)),
                    Err(err) => Err(ApiError::from(err)),
                }
            }
            Err(err) => Err(ApiError::from(err)),
        }
    }

    async fn async_create_instance(&self, instance: Instance) -> ApiResult<Instance> {
        let batcher = self.batcher.as_ref().expect("async path without batcher");
        let id = instance.id.clone();
        let future = batcher.register.submit(instance).await?;
        match future.wait().await {
            Ok(stored) => Ok(stored),
            Err(err) if err.code == ApiCode::ExistedResource => {
                match self.store.get_instance(&id).await {
                    Ok(Some(existing)) => Ok(existing),
                    _ => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }

    async fn create_service_if_absent(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        name: &str,
    ) -> ApiResult<String> {
        if let Some(service) = self.load_service(namespace, name).await? {
            return Ok(service.id);
        }
        let key = format!("{namespace}:{name}");
        let operator = ctx.operator_or_default().to_string();
        self.create_service_flight
            .run(key, || async move {
                // Losers of the flight election may arrive after the row
                // landed; observe it instead of racing another insert.
                if let Some(service) = self.load_service(namespace, name).await? {
                    return Ok(service.id);
                }
                let mut meta = HashMap::new();
                meta.insert(AUTO_CREATED_META_KEY.to_string(), "true".to_string());
                let now = Utc::now();
                let service = Service {
                    id: uuid::Uuid::new_v4().simple().to_string(),
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                    business: String::new(),
                    meta,
                    reference: String::new(),
                    revision: new_revision(),
                    ctime: now,
                    mtime: now,
                };
                match self.store.create_service(service).await {
                    Ok(created) => {
                        info!(
                            namespace = %namespace,
                            service = %name,
                            operator = %operator,
                            "auto-created service on first register"
                        );
                        Ok(created.id)
                    }
                    Err(StoreError::Duplicate(_)) => {
                        match self.store.get_service(name, namespace).await {
                            Ok(Some(existing)) => Ok(existing.id),
                            Ok(None) => Err(ApiError::code(ApiCode::ExecuteException)),
                            Err(err) => Err(ApiError::from(err)),
                        }
                    }
                    Err(err) => Err(ApiError::from(err)),
                }
            })
            .await
    }

    async fn load_service(&self, namespace: &str, name: &str) -> ApiResult<Option<Service>> {
        let cached = self.caches.service.get_by_name(name, namespace);
        let service = match cached {
            Some(service) => Some(service),
            None => self
                .store
                .get_service(name, namespace)
                .await
                .map_err(ApiError::from)?,
        };
        match service {
            Some(service) if service.is_alias() => Err(ApiError::new(
                ApiCode::InvalidParameter,
                "service is an alias",
            )),
            other => Ok(other),
        }
    }

    // ----- deregister ----------------------------------------------------

    pub async fn delete_instance(
        &self,
        ctx: &RequestContext,
        req: InstanceRequest,
    ) -> ApiResult<Option<Instance>> {
        let id = self.check_revise_instance(&req)?;
        if !self.instance_limiter.try_acquire(&id) {
            error!(instance_id = %id, "delete instance exceeds per-instance rate allowance");
            return Err(ApiError::code(ApiCode::InstanceTooManyRequests));
        }

        let Some(instance) = self
            .store
            .get_instance(&id)
            .await
            .map_err(ApiError::from)?
        else {
            // Deleting what is already gone succeeds without an event.
            return Ok(None);
        };

        if self.batcher.is_some() && ctx.open_async_regis {
            let batcher = self.batcher.as_ref().expect("async path without batcher");
            let future = batcher.deregister.submit(id.clone()).await?;
            match future.wait().await {
                Ok(()) => {}
                Err(err) if err.code == ApiCode::NotFoundInstance => return Ok(None),
                Err(err) => return Err(err),
            }
        } else {
            self.store
                .delete_instance(&id)
                .await
                .map_err(ApiError::from)?;
        }

        info!(
            instance_id = %instance.id,
            namespace = %instance.namespace,
            service = %instance.service,
            host = %instance.host,
            port = instance.port,
            "delete instance"
        );
        let _ = self.checker.delete(false, &id).await;
        self.send_discover_event(ctx, &instance, InstanceEventType::Offline);
        self.record_history(ctx, &instance, OperationType::Delete);
        Ok(Some(instance))
    }

    // ----- update --------------------------------------------------------

    pub async fn update_instance(
        &self,
        ctx: &RequestContext,
        req: InstanceRequest,
    ) -> ApiResult<UpdateOutcome> {
        let id = self.check_revise_instance(&req)?;
        let Some(mut instance) = self
            .store
            .get_instance(&id)
            .await
            .map_err(ApiError::from)?
        else {
            return Err(ApiError::code(ApiCode::NotFoundInstance));
        };
        self.check_metadata(req.metadata.as_ref())?;

        let events = update_instance_attributes(&req, &mut instance);
        if events.is_empty() {
            info!(instance_id = %id, "update instance carries no change");
            return Ok(UpdateOutcome::NoChange);
        }
        instance.revision = new_revision();
        instance.mtime = Utc::now();
        self.store
            .update_instance(instance.clone())
            .await
            .map_err(ApiError::from)?;

        info!(
            instance_id = %instance.id,
            namespace = %instance.namespace,
            service = %instance.service,
            healthy = instance.healthy,
            "update instance"
        );
        self.record_history(ctx, &instance, OperationType::Update);
        for event_type in events {
            self.send_discover_event(ctx, &instance, event_type);
        }
        Ok(UpdateOutcome::Updated(instance))
    }

    // ----- isolate by host -----------------------------------------------

    pub async fn update_instance_isolate(
        &self,
        ctx: &RequestContext,
        req: InstanceRequest,
    ) -> ApiResult<BatchUpdateOutcome> {
        self.check_instance_by_host(&req)?;
        let Some(isolate) = req.isolate else {
            return Err(ApiError::new(
                ApiCode::InvalidParameter,
                "isolate flag is required",
            ));
        };
        let (service, instances) = self.instances_by_host(&req).await?;
        if instances.is_empty() {
            return Err(ApiError::code(ApiCode::NotFoundInstance));
        }
        let changed: Vec<Instance> = instances
            .into_iter()
            .filter(|instance| instance.isolate != isolate)
            .collect();
        if changed.is_empty() {
            return Ok(BatchUpdateOutcome::NoChange);
        }

        let revision = new_revision();
        let ids: Vec<String> = changed.iter().map(|instance| instance.id.clone()).collect();
        self.store
            .batch_set_instance_isolate(ids, isolate, revision.clone())
            .await
            .map_err(ApiError::from)?;

        let event_type = if isolate {
            InstanceEventType::OpenIsolate
        } else {
            InstanceEventType::CloseIsolate
        };
        for mut instance in changed.clone() {
            instance.isolate = isolate;
            instance.revision = revision.clone();
            info!(
                instance_id = %instance.id,
                namespace = %service.namespace,
                service = %service.name,
                isolate,
                "update instance isolate"
            );
            self.record_history(ctx, &instance, OperationType::UpdateIsolate);
            self.send_discover_event(ctx, &instance, event_type);
        }
        Ok(BatchUpdateOutcome::Updated(changed.len()))
    }

    // ----- delete by host ------------------------------------------------

    pub async fn delete_instance_by_host(
        &self,
        ctx: &RequestContext,
        req: InstanceRequest,
    ) -> ApiResult<usize> {
        self.check_instance_by_host(&req)?;
        let (service, instances) = self.instances_by_host(&req).await?;
        if instances.is_empty() {
            return Ok(0);
        }
        let ids: Vec<String> = instances.iter().map(|instance| instance.id.clone()).collect();
        self.store
            .batch_delete_instances(ids)
            .await
            .map_err(ApiError::from)?;

        for instance in &instances {
            info!(
                instance_id = %instance.id,
                namespace = %service.namespace,
                service = %service.name,
                host = %instance.host,
                port = instance.port,
                "delete instance by host"
            );
            let _ = self.checker.delete(false, &instance.id).await;
            self.record_history(ctx, instance, OperationType::Delete);
            self.send_discover_event(ctx, instance, InstanceEventType::Offline);
        }
        Ok(instances.len())
    }

    async fn instances_by_host(
        &self,
        req: &InstanceRequest,
    ) -> ApiResult<(Service, Vec<Instance>)> {
        let namespace = req.namespace.as_deref().unwrap_or_default();
        let name = req.service.as_deref().unwrap_or_default();
        let host = req.host.as_deref().unwrap_or_default();

        let service = self
            .store
            .get_service(name, namespace)
            .await
            .map_err(ApiError::from)?
            .ok_or_else(|| ApiError::code(ApiCode::NotFoundService))?;
        // Aliases never own instances; work on the source service.
        let service = if service.is_alias() {
            self.store
                .get_service_by_id(&service.reference)
                .await
                .map_err(ApiError::from)?
                .ok_or_else(|| ApiError::code(ApiCode::NotFoundService))?
        } else {
            service
        };
        let instances = self
            .store
            .get_instances_by_host(&service.id, host)
            .await
            .map_err(ApiError::from)?;
        Ok((service, instances))
    }

    // ----- heartbeat ------------------------------------------------------

    pub async fn heartbeat(&self, _ctx: &RequestContext, req: InstanceRequest) -> ApiResult<()> {
        let id = self.check_heartbeat_instance(&req)?;
        let instance = match self.caches.instance.get_by_id(&id) {
            Some(instance) => Some(instance),
            None => self.store.get_instance(&id).await.map_err(ApiError::from)?,
        };
        let Some(instance) = instance else {
            return Err(ApiError::code(ApiCode::NotFoundInstance));
        };
        if !instance.enable_health_check {
            return Err(ApiError::new(
                ApiCode::InvalidParameter,
                "health check is not enabled for the instance",
            ));
        }
        self.checker
            .report(
                false,
                ReportRequest {
                    instance_id: id,
                    cur_time_sec: Utc::now().timestamp(),
                    count: 0,
                },
            )
            .await
            .map_err(map_coord_error)
    }

    // ----- queries --------------------------------------------------------

    pub async fn get_instances(
        &self,
        _ctx: &RequestContext,
        mut query: HashMap<String, String>,
    ) -> ApiResult<InstanceQueryResult> {
        if query.is_empty() {
            return Err(ApiError::code(ApiCode::EmptyQueryParameter));
        }
        if !(query.contains_key("service")
            || query.contains_key("namespace")
            || query.contains_key("host"))
        {
            return Err(ApiError::new(
                ApiCode::InvalidParameter,
                "one of service, namespace or host is required",
            ));
        }

        let meta_key = query.remove("keys");
        let meta_value = query.remove("values");
        let metadata = match (meta_key, meta_value) {
            (Some(key), Some(value)) => HashMap::from([(key, value)]),
            (None, None) => HashMap::new(),
            _ => {
                return Err(ApiError::new(
                    ApiCode::InvalidParameter,
                    "instance metadata key and value must both be provided",
                ))
            }
        };

        // `healthy` wins when both health aliases are present.
        if query.contains_key("health_status") && query.contains_key("healthy") {
            query.remove("health_status");
        }

        let offset = parse_query_number(&query, "offset")?;
        let limit = parse_query_number(&query, "limit")?;
        query.remove("offset");
        query.remove("limit");

        let mut fields = HashMap::new();
        for (key, value) in query {
            if !INSTANCE_FILTER_ATTRIBUTES.contains(&key.as_str()) {
                return Err(ApiError::new(
                    ApiCode::InvalidParameter,
                    format!("{key} is not allowed"),
                ));
            }
            if value.is_empty() {
                return Err(ApiError::new(
                    ApiCode::InvalidParameter,
                    format!("the value for {key} is empty"),
                ));
            }
            let key = match key.as_str() {
                "health_status" => "healthy".to_string(),
                other => other.to_string(),
            };
            let value = match (key.as_str(), value.as_str()) {
                ("healthy" | "isolate", "true") => "1".to_string(),
                ("healthy" | "isolate", "false") => "0".to_string(),
                _ => value,
            };
            fields.insert(key, value);
        }

        let (total, instances) = self
            .store
            .get_expand_instances(InstanceFilters {
                fields,
                metadata,
                offset,
                limit,
            })
            .await
            .map_err(|err| {
                error!(%err, "query instances from store");
                ApiError::from(err)
            })?;
        Ok(InstanceQueryResult { total, instances })
    }

    pub async fn get_instances_count(&self) -> ApiResult<usize> {
        self.store
            .get_instances_count()
            .await
            .map_err(ApiError::from)
    }

    // ----- validation -----------------------------------------------------

    fn check_create_instance(&self, req: &InstanceRequest) -> ApiResult<String> {
        self.check_metadata(req.metadata.as_ref())?;
        self.check_field_lengths(req)?;
        check_tetrad(req)
    }

    fn check_revise_instance(&self, req: &InstanceRequest) -> ApiResult<String> {
        if let Some(id) = &req.id {
            if id.is_empty() {
                return Err(ApiError::code(ApiCode::InvalidInstanceId));
            }
            return Ok(id.clone());
        }
        self.check_field_lengths(req)?;
        check_tetrad(req)
    }

    fn check_heartbeat_instance(&self, req: &InstanceRequest) -> ApiResult<String> {
        if let Some(id) = &req.id {
            if id.is_empty() {
                return Err(ApiError::code(ApiCode::InvalidInstanceId));
            }
            return Ok(id.clone());
        }
        check_tetrad(req)
    }

    fn check_instance_by_host(&self, req: &InstanceRequest) -> ApiResult<()> {
        if req.service.as_deref().unwrap_or_default().is_empty() {
            return Err(ApiError::code(ApiCode::InvalidServiceName));
        }
        if req.namespace.as_deref().unwrap_or_default().is_empty() {
            return Err(ApiError::code(ApiCode::InvalidNamespaceName));
        }
        if req.host.as_deref().unwrap_or_default().is_empty() {
            return Err(ApiError::code(ApiCode::InvalidInstanceHost));
        }
        Ok(())
    }

    fn check_metadata(&self, metadata: Option<&HashMap<String, String>>) -> ApiResult<()> {
        let Some(metadata) = metadata else {
            return Ok(());
        };
        if metadata.len() > self.limits.max_metadata_count {
            return Err(ApiError::code(ApiCode::InvalidMetadata));
        }
        for (key, value) in metadata {
            if key.is_empty()
                || key.len() > self.limits.max_field_len
                || value.len() > self.limits.max_field_len
            {
                return Err(ApiError::code(ApiCode::InvalidMetadata));
            }
        }
        Ok(())
    }

    fn check_field_lengths(&self, req: &InstanceRequest) -> ApiResult<()> {
        let max = self.limits.max_field_len;
        let too_long = |value: &Option<String>| {
            value.as_ref().map(|v| v.len() > max).unwrap_or(false)
        };
        if too_long(&req.service) {
            return Err(ApiError::code(ApiCode::InvalidServiceName));
        }
        if too_long(&req.namespace) {
            return Err(ApiError::code(ApiCode::InvalidNamespaceName));
        }
        if too_long(&req.host) {
            return Err(ApiError::code(ApiCode::InvalidInstanceHost));
        }
        if too_long(&req.protocol) || too_long(&req.version) || too_long(&req.logic_set) {
            return Err(ApiError::code(ApiCode::InvalidParameter));
        }
        if let Some(port) = req.port {
            if port == 0 || port > 65535 {
                return Err(ApiError::code(ApiCode::InvalidInstancePort));
            }
        }
        if let Some(weight) = req.weight {
            if weight > 65535 {
                return Err(ApiError::code(ApiCode::InvalidParameter));
            }
        }
        Ok(())
    }

    // ----- plumbing -------------------------------------------------------

    fn send_discover_event(
        &self,
        ctx: &RequestContext,
        instance: &Instance,
        event_type: InstanceEventType,
    ) {
        let mut metadata = HashMap::new();
        if let Some(request_id) = &ctx.request_id {
            metadata.insert("request-id".to_string(), request_id.clone());
        }
        let event = InstanceEvent {
            id: instance.id.clone(),
            namespace: instance.namespace.clone(),
            service: instance.service.clone(),
            instance: instance.clone(),
            event_type,
            create_time: Utc::now(),
            metadata,
        };
        if let Err(err) = self.hub.publish(INSTANCE_EVENT_TOPIC, event) {
            warn!(%err, "publish instance event");
        }
    }

    fn record_history(
        &self,
        ctx: &RequestContext,
        instance: &Instance,
        operation: OperationType,
    ) {
        self.history.record(RecordEntry {
            resource_type: "instance",
            resource_name: format!(
                "{}({}:{})",
                instance.service, instance.host, instance.port
            ),
            namespace: instance.namespace.clone(),
            operation_type: operation,
            operator: ctx.operator_or_default().to_string(),
            detail: serde_json::to_string(instance).unwrap_or_default(),
            happen_time: Utc::now(),
        });
    }
}

fn map_coord_error(err: CoordError) -> ApiError {
    match err {
        CoordError::RecordNotFound => ApiError::code(ApiCode::NotFoundInstance),
        other => ApiError::new(ApiCode::ExecuteException, other.to_string()),
    }
}

fn parse_query_number(query: &HashMap<String, String>, key: &str) -> ApiResult<usize> {
    match query.get(key) {
        None => Ok(0),
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|_| ApiError::code(ApiCode::InvalidParameter)),
    }
}

fn check_tetrad(req: &InstanceRequest) -> ApiResult<String> {
    let namespace = req.namespace.as_deref().unwrap_or_default();
    let service = req.service.as_deref().unwrap_or_default();
    let host = req.host.as_deref().unwrap_or_default();
    if namespace.is_empty() {
        return Err(ApiError::code(ApiCode::InvalidNamespaceName));
    }
    if service.is_empty() {
        return Err(ApiError::code(ApiCode::InvalidServiceName));
    }
    if host.is_empty() {
        return Err(ApiError::code(ApiCode::InvalidInstanceHost));
    }
    let Some(port) = req.port else {
        return Err(ApiError::code(ApiCode::InvalidInstancePort));
    };
    if port == 0 || port > 65535 {
        return Err(ApiError::code(ApiCode::InvalidInstancePort));
    }
    if let Some(id) = &req.id {
        if id.is_empty() {
            return Err(ApiError::code(ApiCode::InvalidInstanceId));
        }
        return Ok(id.clone());
    }
    Ok(instance_id(namespace, service, host, port as u16))
}

/// Materializes the stored instance for a register request. `existing`
/// preserves the operator-set isolate flag on re-register.
fn build_instance(
    service_id: &str,
    id: &str,
    req: &InstanceRequest,
    existing: Option<&Instance>,
) -> Instance {
    let enable_health_check = match (req.enable_health_check, &req.health_check) {
        (Some(enabled), _) => enabled,
        (None, Some(_)) => true,
        (None, None) => false,
    };
    let health_check = if enable_health_check {
        let ttl = req
            .health_check
            .as_ref()
            .map(|check| HealthCheck::normalized_ttl(check.ttl_secs))
            .unwrap_or(common::api::DEFAULT_HEALTH_CHECK_TTL_SECS);
        Some(HealthCheck {
            kind: HealthCheckKind::Heartbeat,
            ttl_secs: ttl,
        })
    } else {
        None
    };
    Instance {
        id: id.to_string(),
        service_id: service_id.to_string(),
        namespace: req.namespace.clone().unwrap_or_default(),
        service: req.service.clone().unwrap_or_default(),
        host: req.host.clone().unwrap_or_default(),
        port: req.port.unwrap_or_default() as u16,
        vpc_id: req.vpc_id.clone().unwrap_or_default(),
        protocol: req.protocol.clone().unwrap_or_default(),
        version: req.version.clone().unwrap_or_default(),
        weight: req.weight.unwrap_or(DEFAULT_WEIGHT),
        priority: req.priority.unwrap_or_default(),
        healthy: req.healthy.unwrap_or(true),
        isolate: req
            .isolate
            .or_else(|| existing.map(|instance| instance.isolate))
            .unwrap_or(false),
        enable_health_check,
        health_check,
        location: req.location.clone().unwrap_or_default(),
        metadata: req.metadata.clone().unwrap_or_default(),
        logic_set: req.logic_set.clone().unwrap_or_default(),
        revision: new_revision(),
        mtime: Utc::now(),
    }
}

fn instances_equivalent(a: &Instance, b: &Instance) -> bool {
    let mut left = a.clone();
    let mut right = b.clone();
    left.revision = String::new();
    right.revision = String::new();
    left.mtime = right.mtime;
    left.service_id = right.service_id.clone();
    left == right
}

/// Diffs every mutable field, mutating `instance` in place. The returned
/// set is empty when nothing changed.
fn update_instance_attributes(
    req: &InstanceRequest,
    instance: &mut Instance,
) -> HashSet<InstanceEventType> {
    let mut events = HashSet::new();

    if let Some(metadata) = &req.metadata {
        if *metadata != instance.metadata {
            instance.metadata = metadata.clone();
            events.insert(InstanceEventType::Update);
        }
    }
    if let Some(location) = &req.location {
        if *location != instance.location {
            instance.location = location.clone();
            events.insert(InstanceEventType::Update);
        }
    }
    if let Some(protocol) = &req.protocol {
        if *protocol != instance.protocol {
            instance.protocol = protocol.clone();
            events.insert(InstanceEventType::Update);
        }
    }
    if let Some(version) = &req.version {
        if *version != instance.version {
            instance.version = version.clone();
            events.insert(InstanceEventType::Update);
        }
    }
    if let Some(priority) = req.priority {
        if priority != instance.priority {
            instance.priority = priority;
            events.insert(InstanceEventType::Update);
        }
    }
    if let Some(weight) = req.weight {
        if weight != instance.weight {
            instance.weight = weight;
            events.insert(InstanceEventType::Update);
        }
    }
    if let Some(healthy) = req.healthy {
        if healthy != instance.healthy {
            instance.healthy = healthy;
            events.insert(if healthy {
                InstanceEventType::TurnHealth
            } else {
                InstanceEventType::TurnUnHealth
            });
        }
    }
    if let Some(isolate) = req.isolate {
        if isolate != instance.isolate {
            instance.isolate = isolate;
            events.insert(if isolate {
                InstanceEventType::OpenIsolate
            } else {
                InstanceEventType::CloseIsolate
            });
        }
    }
    if let Some(logic_set) = &req.logic_set {
        if *logic_set != instance.logic_set {
            instance.logic_set = logic_set.clone();
            events.insert(InstanceEventType::Update);
        }
    }
    if update_health_check(req, instance) {
        events.insert(InstanceEventType::Update);
    }

    events
}

fn update_health_check(req: &InstanceRequest, instance: &mut Instance) -> bool {
    let mut need_update = false;

    if let Some(check) = &req.health_check {
        if req.enable_health_check.unwrap_or(true) {
            if !instance.enable_health_check {
                // Newly enabled checks start unhealthy until the first
                // heartbeat lands.
                instance.healthy = false;
                instance.enable_health_check = true;
                need_update = true;
            }
            let ttl = HealthCheck::normalized_ttl(check.ttl_secs);
            if instance
                .health_check
                .as_ref()
                .map(|current| current.ttl_secs)
                != Some(ttl)
            {
                need_update = true;
            }
            instance.health_check = Some(HealthCheck {
                kind: HealthCheckKind::Heartbeat,
                ttl_secs: ttl,
            });
        }
    }

    if req.enable_health_check == Some(false) {
        if instance.enable_health_check {
            need_update = true;
        }
        if instance.health_check.is_some() {
            need_update = true;
        }
        instance.enable_health_check = false;
        instance.health_check = None;
    }

    need_update
}
