//! Authorization interceptor wrapping every instance-plane entry point.
//!
//! The interceptor assembles a typed [`AuthContext`] from the request,
//! asks the policy checker, and only invokes the inner server on allow.
//! Denials surface as `NotAllowedAccess` without touching the store or the
//! event bus. List responses are post-processed with a per-item `editable`
//! flag.

use std::collections::HashMap;
use std::sync::Arc;

use common::api::{ApiCode, Instance, InstanceRequest};
use tracing::debug;

use crate::cache::CacheSet;
use crate::context::{AuthContext, Operation, RequestContext};
use crate::error::{ApiError, ApiResult};
use crate::service::{
    BatchUpdateOutcome, InstanceQueryResult, InstanceServer, UpdateOutcome,
};
use crate::store::{Principal, ResourceType, StrategyResource, UserRole};

/// Items stamped with this metadata key are never editable from this
/// console.
pub const THIRD_PLATFORM_META_KEY: &str = "3rd-platform";

pub trait AuthChecker: Send + Sync {
    fn check_console_permission(&self, ctx: &AuthContext) -> ApiResult<()>;
    fn check_client_permission(&self, ctx: &AuthContext) -> ApiResult<()>;
    fn allow_resource_operate(
        &self,
        principal: Option<&Principal>,
        res_type: ResourceType,
        res_id: &str,
    ) -> bool;
}

/// Policy checker backed by the strategy and user caches.
pub struct CacheAuthChecker {
    caches: Arc<CacheSet>,
    console_open: bool,
    client_open: bool,
}

impl CacheAuthChecker {
    pub fn new(caches: Arc<CacheSet>, console_open: bool, client_open: bool) -> Arc<Self> {
        Arc::new(Self {
            caches,
            console_open,
            client_open,
        })
    }

    fn check(&self, ctx: &AuthContext, open: bool) -> ApiResult<()> {
        if !open {
            return Ok(());
        }
        let Some(principal) = &ctx.principal else {
            return Err(ApiError::not_allowed("no principal in request"));
        };
        // Admins bypass per-resource policy.
        if let Some(user) = self.caches.user.get_user(&principal.principal_id) {
            if user.role == UserRole::Admin {
                return Ok(());
            }
        }
        for resource in &ctx.resources {
            if !self
                .caches
                .strategy
                .is_resource_editable(principal, resource.res_type, &resource.res_id)
            {
                debug!(
                    method = ctx.method,
                    res_id = %resource.res_id,
                    principal = %principal.principal_id,
                    "permission denied"
                );
                return Err(ApiError::not_allowed(format!(
                    "principal {} may not operate resource {}",
                    principal.principal_id, resource.res_id
                )));
            }
        }
        Ok(())
    }
}

impl AuthChecker for CacheAuthChecker {
    fn check_console_permission(&self, ctx: &AuthContext) -> ApiResult<()> {
        self.check(ctx, self.console_open)
    }

    fn check_client_permission(&self, ctx: &AuthContext) -> ApiResult<()> {
        self.check(ctx, self.client_open)
    }

    fn allow_resource_operate(
        &self,
        principal: Option<&Principal>,
        res_type: ResourceType,
        res_id: &str,
    ) -> bool {
        if !self.console_open {
            return true;
        }
        let Some(principal) = principal else {
            return false;
        };
        self.caches
            .strategy
            .is_resource_editable(principal, res_type, res_id)
    }
}

/// Instance returned by an authorized list query.
#[derive(Debug, Clone)]
pub struct QueryInstance {
    pub instance: Instance,
    pub editable: bool,
}

#[derive(Debug, Clone)]
pub struct AuthedQueryResult {
    pub total: usize,
    pub instances: Vec<QueryInstance>,
}

/// Auth-checking facade over [`InstanceServer`]; the only layer allowed to
/// rewrite result codes, and only to `NotAllowedAccess`.
pub struct InstanceAuthority {
    checker: Arc<dyn AuthChecker>,
    caches: Arc<CacheSet>,
    inner: Arc<InstanceServer>,
}

impl InstanceAuthority {
    pub fn new(
        checker: Arc<dyn AuthChecker>,
        caches: Arc<CacheSet>,
        inner: Arc<InstanceServer>,
    ) -> Arc<Self> {
        Arc::new(Self {
            checker,
            caches,
            inner,
        })
    }

    fn collect_auth_context(
        &self,
        ctx: &RequestContext,
        reqs: &[InstanceRequest],
        operation: Operation,
        method: &'static str,
    ) -> AuthContext {
        let mut resources = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for req in reqs {
            let (Some(namespace), Some(service)) = (&req.namespace, &req.service) else {
                continue;
            };
            // Policy links carry service ids; a service unknown to the cache
            // has no link and therefore no policy to enforce.
            if let Some(row) = self.caches.service.get_by_name(service, namespace) {
                if seen.insert(row.id.clone()) {
                    resources.push(StrategyResource {
                        res_type: ResourceType::Services,
                        res_id: row.id,
                    });
                }
            }
        }
        AuthContext {
            operation,
            method,
            resources,
            principal: ctx.principal.clone(),
        }
    }

    fn authorized(
        &self,
        ctx: &RequestContext,
        auth_ctx: AuthContext,
        console: bool,
    ) -> ApiResult<RequestContext> {
        let result = if console {
            self.checker.check_console_permission(&auth_ctx)
        } else {
            self.checker.check_client_permission(&auth_ctx)
        };
        result.map_err(|err| {
            metrics::counter!("auth_denied_total", "method" => auth_ctx.method).increment(1);
            ApiError::new(ApiCode::NotAllowedAccess, err.message)
        })?;
        let mut next = ctx.clone();
        next.auth_context = Some(auth_ctx);
        Ok(next)
    }

    // ----- console surface ----------------------------------------------

    pub async fn create_instances(
        &self,
        ctx: &RequestContext,
        reqs: Vec<InstanceRequest>,
    ) -> ApiResult<Vec<ApiResult<Instance>>> {
        let auth_ctx = self.collect_auth_context(ctx, &reqs, Operation::Create, "CreateInstances");
        let ctx = self.authorized(ctx, auth_ctx, true)?;
        self.inner.create_instances(&ctx, reqs).await
    }

    pub async fn delete_instances(
        &self,
        ctx: &RequestContext,
        reqs: Vec<InstanceRequest>,
    ) -> ApiResult<Vec<ApiResult<Option<Instance>>>> {
        let auth_ctx = self.collect_auth_context(ctx, &reqs, Operation::Delete, "DeleteInstances");
        let ctx = self.authorized(ctx, auth_ctx, true)?;
        self.inner.delete_instances(&ctx, reqs).await
    }

    pub async fn update_instances(
        &self,
        ctx: &RequestContext,
        reqs: Vec<InstanceRequest>,
    ) -> ApiResult<Vec<ApiResult<UpdateOutcome>>> {
        let auth_ctx = self.collect_auth_context(ctx, &reqs, Operation::Modify, "UpdateInstances");
        let ctx = self.authorized(ctx, auth_ctx, true)?;
        self.inner.update_instances(&ctx, reqs).await
    }

    pub async fn update_instances_isolate(
        &self,
        ctx: &RequestContext,
        reqs: Vec<InstanceRequest>,
    ) -> ApiResult<Vec<ApiResult<BatchUpdateOutcome>>> {
        let auth_ctx =
            self.collect_auth_context(ctx, &reqs, Operation::Modify, "UpdateInstancesIsolate");
        let ctx = self.authorized(ctx, auth_ctx, true)?;
        self.inner.update_instances_isolate(&ctx, reqs).await
    }

    /// Host-batch deletion is restricted to admin/owner roles on top of the
    /// regular policy check.
    pub async fn delete_instances_by_host(
        &self,
        ctx: &RequestContext,
        reqs: Vec<InstanceRequest>,
    ) -> ApiResult<Vec<ApiResult<usize>>> {
        let auth_ctx =
            self.collect_auth_context(ctx, &reqs, Operation::Delete, "DeleteInstancesByHost");
        let ctx = self.authorized(ctx, auth_ctx, true)?;
        if let Some(principal) = &ctx.principal {
            let role = self
                .caches
                .user
                .get_user(&principal.principal_id)
                .map(|user| user.role);
            if !matches!(role, Some(UserRole::Admin) | Some(UserRole::Owner)) {
                return Err(ApiError::not_allowed(
                    "only admin or owner accounts may delete instances by host",
                ));
            }
        }
        self.inner.delete_instances_by_host(&ctx, reqs).await
    }

    pub async fn get_instances(
        &self,
        ctx: &RequestContext,
        query: HashMap<String, String>,
    ) -> ApiResult<AuthedQueryResult> {
        let auth_ctx = self.collect_auth_context(ctx, &[], Operation::Read, "GetInstances");
        let ctx = self.authorized(ctx, auth_ctx, true)?;
        let InstanceQueryResult { total, instances } =
            self.inner.get_instances(&ctx, query).await?;
        let instances = instances
            .into_iter()
            .map(|instance| {
                let editable = if instance.metadata.contains_key(THIRD_PLATFORM_META_KEY) {
                    false
                } else {
                    self.checker.allow_resource_operate(
                        ctx.principal.as_ref(),
                        ResourceType::Services,
                        &instance.service_id,
                    )
                };
                QueryInstance { instance, editable }
            })
            .collect();
        Ok(AuthedQueryResult { total, instances })
    }

    pub async fn get_instances_count(&self, ctx: &RequestContext) -> ApiResult<usize> {
        let auth_ctx = self.collect_auth_context(ctx, &[], Operation::Read, "GetInstancesCount");
        let _ctx = self.authorized(ctx, auth_ctx, true)?;
        self.inner.get_instances_count().await
    }

    // ----- client (data-plane) surface ----------------------------------

    pub async fn register_instance(
        &self,
        ctx: &RequestContext,
        req: InstanceRequest,
    ) -> ApiResult<Instance> {
        let reqs = std::slice::from_ref(&req);
        let auth_ctx = self.collect_auth_context(ctx, reqs, Operation::Create, "RegisterInstance");
        let mut ctx = self.authorized(ctx, auth_ctx, false)?;
        ctx.from_client = true;
        self.inner.create_instance(&ctx, req).await
    }

    pub async fn deregister_instance(
        &self,
        ctx: &RequestContext,
        req: InstanceRequest,
    ) -> ApiResult<Option<Instance>> {
        let reqs = std::slice::from_ref(&req);
        let auth_ctx =
            self.collect_auth_context(ctx, reqs, Operation::Delete, "DeregisterInstance");
        let mut ctx = self.authorized(ctx, auth_ctx, false)?;
        ctx.from_client = true;
        self.inner.delete_instance(&ctx, req).await
    }

    pub async fn heartbeat(&self, ctx: &RequestContext, req: InstanceRequest) -> ApiResult<()> {
        let reqs = std::slice::from_ref(&req);
        let auth_ctx = self.collect_auth_context(ctx, reqs, Operation::Modify, "Heartbeat");
        let ctx = self.authorized(ctx, auth_ctx, false)?;
        self.inner.heartbeat(&ctx, req).await
    }

    pub fn inner(&self) -> &Arc<InstanceServer> {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        AsyncRegisterConfig, BatchConfig, InstanceLimitConfig, LeaderCheckerConfig, LimitsConfig,
    };
    use crate::eventbus::{EventHub, SubOptions};
    use crate::healthcheck::LeaderHealthChecker;
    use crate::history::LogHistorySink;
    use crate::store::memory::MemoryStore;
    use crate::store::{Store, StrategyDetail, UserRow};
    use common::api::INSTANCE_EVENT_TOPIC;
    use std::time::Duration;

    struct AuthHarness {
        authority: Arc<InstanceAuthority>,
        store: MemoryStore,
        caches: Arc<CacheSet>,
        hub: EventHub,
    }

    async fn auth_harness(console_open: bool) -> AuthHarness {
        let hub = EventHub::new();
        let store = MemoryStore::new(hub.clone(), "127.0.0.1");
        let dyn_store: Arc<dyn Store> = Arc::new(store.clone());
        let caches = CacheSet::new(Arc::clone(&dyn_store));
        let checker = LeaderHealthChecker::new(
            LeaderCheckerConfig {
                solt_num: 4,
                stream_num: 1,
                batch: BatchConfig {
                    queue_size: 16,
                    wait_time_ms: 10,
                    max_batch_count: 4,
                    concurrency: 1,
                },
            },
            "127.0.0.1",
            0,
        );
        checker.start(&hub, &dyn_store).await.expect("start");
        tokio::time::sleep(Duration::from_millis(30)).await;

        let server = InstanceServer::new(
            dyn_store,
            Arc::clone(&caches),
            hub.clone(),
            checker,
            LimitsConfig {
                max_field_len: 128,
                max_metadata_count: 8,
                max_batch_size: 10,
            },
            InstanceLimitConfig {
                rate_limit_per_minute: 0,
            },
            AsyncRegisterConfig {
                enabled: false,
                batch: None,
            },
            Arc::new(LogHistorySink),
        );
        let auth_checker = CacheAuthChecker::new(Arc::clone(&caches), console_open, false);
        let authority = InstanceAuthority::new(auth_checker, Arc::clone(&caches), server);
        AuthHarness {
            authority,
            store,
            caches,
            hub,
        }
    }

    fn request(service: &str, host: &str, port: u32) -> InstanceRequest {
        InstanceRequest::tetrad("default", service, host, port)
    }

    async fn seed_protected_service(harness: &AuthHarness) -> String {
        // Register through the client surface, then link the service to a
        // policy naming only "owner-user".
        let ctx = RequestContext::client();
        let created = harness
            .authority
            .register_instance(&ctx, request("A", "10.0.0.1", 8080))
            .await
            .expect("register");
        harness
            .store
            .upsert_strategy(StrategyDetail {
                id: "policy-a".to_string(),
                name: "policy-a".to_string(),
                resources: vec![StrategyResource {
                    res_type: ResourceType::Services,
                    res_id: created.service_id.clone(),
                }],
                principals: vec![Principal::user("owner-user")],
            })
            .await;
        harness.caches.refresh_all().await.expect("refresh");
        created.service_id
    }

    #[tokio::test]
    async fn deny_skips_inner_handler_store_and_events() {
        let harness = auth_harness(true).await;
        seed_protected_service(&harness).await;

        let mut sub = harness
            .hub
            .subscribe(INSTANCE_EVENT_TOPIC, SubOptions::default())
            .expect("subscribe");
        let ctx = RequestContext::default().with_principal(Principal::user("intruder"));
        let err = harness
            .authority
            .delete_instances(&ctx, vec![request("A", "10.0.0.1", 8080)])
            .await
            .unwrap_err();
        assert_eq!(err.code, ApiCode::NotAllowedAccess);

        // Neither a store write nor an event happened.
        assert_eq!(harness.store.get_instances_count().await.expect("count"), 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn policy_member_passes_through() {
        let harness = auth_harness(true).await;
        seed_protected_service(&harness).await;

        let ctx = RequestContext::default().with_principal(Principal::user("owner-user"));
        let results = harness
            .authority
            .delete_instances(&ctx, vec![request("A", "10.0.0.1", 8080)])
            .await
            .expect("authorized delete");
        assert!(results[0].is_ok());
        assert_eq!(harness.store.get_instances_count().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn closed_console_auth_allows_everything() {
        let harness = auth_harness(false).await;
        seed_protected_service(&harness).await;
        let ctx = RequestContext::default();
        let results = harness
            .authority
            .delete_instances(&ctx, vec![request("A", "10.0.0.1", 8080)])
            .await
            .expect("delete with auth disabled");
        assert!(results[0].is_ok());
    }

    #[tokio::test]
    async fn list_responses_carry_editable_flags() {
        let harness = auth_harness(true).await;
        seed_protected_service(&harness).await;
        // A second instance stamped as third-platform data.
        let ctx = RequestContext::client();
        let mut foreign = request("A", "10.0.0.2", 8080);
        foreign.metadata = Some(
            [(THIRD_PLATFORM_META_KEY.to_string(), "nacos".to_string())]
                .into_iter()
                .collect(),
        );
        harness
            .authority
            .register_instance(&ctx, foreign)
            .await
            .expect("register");

        let ctx = RequestContext::default().with_principal(Principal::user("owner-user"));
        let mut query = HashMap::new();
        query.insert("service".to_string(), "A".to_string());
        let result = harness
            .authority
            .get_instances(&ctx, query)
            .await
            .expect("list");
        assert_eq!(result.total, 2);
        for item in &result.instances {
            if item.instance.metadata.contains_key(THIRD_PLATFORM_META_KEY) {
                assert!(!item.editable, "third-platform rows are never editable");
            } else {
                assert!(item.editable, "policy member edits its own service");
            }
        }

        let ctx = RequestContext::default().with_principal(Principal::user("outsider"));
        let mut query = HashMap::new();
        query.insert("service".to_string(), "A".to_string());
        let result = harness
            .authority
            .get_instances(&ctx, query)
            .await
            .expect("list");
        assert!(result.instances.iter().all(|item| !item.editable));
    }

    #[tokio::test]
    async fn delete_by_host_requires_admin_or_owner() {
        let harness = auth_harness(true).await;
        seed_protected_service(&harness).await;
        harness
            .store
            .upsert_user(UserRow {
                id: "owner-user".to_string(),
                name: "owner-user".to_string(),
                role: UserRole::Sub,
                member_ids: Vec::new(),
            })
            .await;
        harness.caches.refresh_all().await.expect("refresh");

        let ctx = RequestContext::default().with_principal(Principal::user("owner-user"));
        let mut req = request("A", "10.0.0.1", 0);
        req.port = None;
        let err = harness
            .authority
            .delete_instances_by_host(&ctx, vec![req.clone()])
            .await
            .unwrap_err();
        assert_eq!(err.code, ApiCode::NotAllowedAccess);

        // Promote to owner and retry.
        harness
            .store
            .upsert_user(UserRow {
                id: "owner-user".to_string(),
                name: "owner-user".to_string(),
                role: UserRole::Owner,
                member_ids: Vec::new(),
            })
            .await;
        harness.caches.refresh_all().await.expect("refresh");
        let results = harness
            .authority
            .delete_instances_by_host(&ctx, vec![req])
            .await
            .expect("delete by host");
        assert_eq!(*results[0].as_ref().expect("count"), 1);
    }

    #[tokio::test]
    async fn admin_bypasses_resource_policy() {
        let harness = auth_harness(true).await;
        seed_protected_service(&harness).await;
        harness
            .store
            .upsert_user(UserRow {
                id: "root".to_string(),
                name: "root".to_string(),
                role: UserRole::Admin,
                member_ids: Vec::new(),
            })
            .await;
        harness.caches.refresh_all().await.expect("refresh");

        let ctx = RequestContext::default().with_principal(Principal::user("root"));
        let results = harness
            .authority
            .delete_instances(&ctx, vec![request("A", "10.0.0.1", 8080)])
            .await
            .expect("admin delete");
        assert!(results[0].is_ok());
    }
}
