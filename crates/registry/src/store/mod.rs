//! Contract the registry core consumes from the persistent store.
//!
//! The store supplies durable point reads and writes plus delta reads for
//! the cache refresh engine: every delta row carries a `modify_time` and a
//! `valid` flag, tombstones included. It also performs the external leader
//! election, publishing [`LeaderChangeEvent`]s on the hub.

pub mod memory;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::api::{ApiCode, Instance, Service};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

/// Well-known election key for the heartbeat leader.
pub const ELECTION_KEY_SELF_SERVICE_CHECKER: &str = "self-service-checker";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("duplicate key: {0}")]
    Duplicate(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("store failure: {0}")]
    Internal(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate(msg) => ApiError::new(ApiCode::ExistedResource, msg),
            StoreError::NotFound(msg) => ApiError::new(ApiCode::NotFoundInstance, msg),
            StoreError::Internal(msg) => ApiError::new(ApiCode::StoreLayerException, msg),
        }
    }
}

/// Delta row wrapper: tombstones carry the last-known payload with
/// `valid = false`.
#[derive(Debug, Clone)]
pub struct DeltaRow<T> {
    pub data: T,
    pub modify_time: DateTime<Utc>,
    pub valid: bool,
}

/// Resource classes an auth strategy may attach to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Namespaces,
    Services,
    ConfigGroups,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalRole {
    User,
    Group,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Principal {
    pub principal_id: String,
    pub role: PrincipalRole,
}

impl Principal {
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            principal_id: id.into(),
            role: PrincipalRole::User,
        }
    }

    pub fn group(id: impl Into<String>) -> Self {
        Self {
            principal_id: id.into(),
            role: PrincipalRole::Group,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct StrategyResource {
    pub res_type: ResourceType,
    pub res_id: String,
}

/// Auth strategy row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StrategyDetail {
    pub id: String,
    pub name: String,
    pub resources: Vec<StrategyResource>,
    pub principals: Vec<Principal>,
}

/// User row consumed by the user cache. Groups are rows with
/// `member_ids` listing their users.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserRow {
    pub id: String,
    pub name: String,
    pub role: UserRole,
    /// For group rows: ids of member users.
    #[serde(default)]
    pub member_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Admin,
    Owner,
    Sub,
    Group,
}

/// Specificity class of a router rule: L1 matches before L2 before L3.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum RoutingLevel {
    L1,
    L2,
    L3,
}

/// V2 router rule row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouterRule {
    pub id: String,
    pub name: String,
    pub namespace: String,
    pub service: String,
    pub level: RoutingLevel,
    pub priority: u32,
    pub enable: bool,
    pub revision: String,
}

/// Legacy V1 router rule row, keyed by the owning service id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouterRuleV1 {
    pub id: String,
    /// Owning service id; conversion resolves it to `(service, namespace)`.
    pub service_id: String,
    pub in_bounds: Vec<RouteEntry>,
    pub out_bounds: Vec<RouteEntry>,
    pub revision: String,
}

/// One direction entry of a V1 rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouteEntry {
    pub name: String,
    pub priority: u32,
}

/// Kinds of service-scoped governance rules sharing one cache shape.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ServiceRuleKind {
    RateLimit,
    FaultDetect,
    CircuitBreaker,
}

/// Service-scoped governance rule row (rate limit, fault detect, circuit
/// breaker).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceRule {
    pub id: String,
    pub namespace: String,
    pub service: String,
    pub revision: String,
    pub content: String,
}

/// Filter set accepted by the expanded instance query.
#[derive(Debug, Clone, Default)]
pub struct InstanceFilters {
    pub fields: HashMap<String, String>,
    pub metadata: HashMap<String, String>,
    pub offset: usize,
    pub limit: usize,
}

/// Transaction handle; `rlock_service` pins the service row against
/// concurrent deletion until `commit`.
#[async_trait]
pub trait StoreTx: Send {
    async fn rlock_service(&mut self, name: &str, namespace: &str)
        -> StoreResult<Option<Service>>;
    async fn commit(self: Box<Self>) -> StoreResult<()>;
}

#[async_trait]
pub trait Store: Send + Sync {
    // Delta reads for the cache refresh engine.
    async fn get_services_for_cache(
        &self,
        last_mtime: DateTime<Utc>,
        first_load: bool,
    ) -> StoreResult<Vec<DeltaRow<Service>>>;
    async fn get_instances_for_cache(
        &self,
        last_mtime: DateTime<Utc>,
        first_load: bool,
    ) -> StoreResult<Vec<DeltaRow<Instance>>>;
    async fn get_strategies_for_cache(
        &self,
        last_mtime: DateTime<Utc>,
        first_load: bool,
    ) -> StoreResult<Vec<DeltaRow<StrategyDetail>>>;
    async fn get_users_for_cache(
        &self,
        last_mtime: DateTime<Utc>,
        first_load: bool,
    ) -> StoreResult<Vec<DeltaRow<UserRow>>>;
    async fn get_router_rules_for_cache(
        &self,
        last_mtime: DateTime<Utc>,
        first_load: bool,
    ) -> StoreResult<Vec<DeltaRow<RouterRule>>>;
    async fn get_router_rules_v1_for_cache(
        &self,
        last_mtime: DateTime<Utc>,
        first_load: bool,
    ) -> StoreResult<Vec<DeltaRow<RouterRuleV1>>>;
    async fn get_service_rules_for_cache(
        &self,
        kind: ServiceRuleKind,
        last_mtime: DateTime<Utc>,
        first_load: bool,
    ) -> StoreResult<Vec<DeltaRow<ServiceRule>>>;

    // Point reads.
    async fn get_service(&self, name: &str, namespace: &str) -> StoreResult<Option<Service>>;
    async fn get_service_by_id(&self, id: &str) -> StoreResult<Option<Service>>;
    async fn get_instance(&self, id: &str) -> StoreResult<Option<Instance>>;
    async fn get_instances_by_host(
        &self,
        service_id: &str,
        host: &str,
    ) -> StoreResult<Vec<Instance>>;
    async fn get_expand_instances(
        &self,
        filters: InstanceFilters,
    ) -> StoreResult<(usize, Vec<Instance>)>;
    async fn get_instances_count(&self) -> StoreResult<usize>;

    // Writes.
    async fn create_service(&self, service: Service) -> StoreResult<Service>;
    async fn add_instance(&self, instance: Instance) -> StoreResult<()>;
    async fn update_instance(&self, instance: Instance) -> StoreResult<()>;
    async fn delete_instance(&self, id: &str) -> StoreResult<()>;
    async fn batch_delete_instances(&self, ids: Vec<String>) -> StoreResult<()>;
    async fn batch_set_instance_isolate(
        &self,
        ids: Vec<String>,
        isolate: bool,
        revision: String,
    ) -> StoreResult<()>;

    async fn create_transaction(&self) -> StoreResult<Box<dyn StoreTx>>;

    /// Joins the external leader election for `key`. Results arrive as
    /// [`common::api::LeaderChangeEvent`]s on the leader-change topic.
    async fn start_leader_election(&self, key: &str) -> StoreResult<()>;
}
