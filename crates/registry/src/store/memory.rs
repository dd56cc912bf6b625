//! In-process store used by the standalone server mode and the test suites.
//!
//! Tombstones are retained so the cache refresh engine observes deletions
//! through its delta reads, and modification timestamps are strictly
//! monotonic so the watermark contract holds even for same-millisecond
//! writes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use common::api::{Instance, LeaderChangeEvent, Service, LEADER_CHANGE_EVENT_TOPIC};
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedRwLockReadGuard, RwLock};

use super::{
    DeltaRow, InstanceFilters, RouterRule, RouterRuleV1, ServiceRule, ServiceRuleKind, Store,
    StoreError, StoreResult, StoreTx, StrategyDetail, UserRow,
};
use crate::eventbus::EventHub;

#[derive(Debug, Clone)]
struct Record<T> {
    data: T,
    modify_time: DateTime<Utc>,
    valid: bool,
}

#[derive(Default)]
struct Tables {
    services: HashMap<String, Record<Service>>,
    service_ids: HashMap<(String, String), String>,
    instances: HashMap<String, Record<Instance>>,
    strategies: HashMap<String, Record<StrategyDetail>>,
    users: HashMap<String, Record<UserRow>>,
    router_rules: HashMap<String, Record<RouterRule>>,
    router_rules_v1: HashMap<String, Record<RouterRuleV1>>,
    service_rules: HashMap<(ServiceRuleKind, String), Record<ServiceRule>>,
}

struct Inner {
    hub: EventHub,
    host: String,
    tables: RwLock<Tables>,
    clock: Mutex<DateTime<Utc>>,
    service_locks: DashMap<String, Arc<RwLock<()>>>,
}

#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new(hub: EventHub, host: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                hub,
                host: host.into(),
                tables: RwLock::new(Tables::default()),
                clock: Mutex::new(DateTime::<Utc>::MIN_UTC),
                service_locks: DashMap::new(),
            }),
        }
    }

    /// Publishes a leader-change event, standing in for the external
    /// election backend. Tests drive failovers through this.
    pub fn publish_leader_change(&self, key: &str, leader: bool, leader_host: &str) {
        let _ = self.inner.hub.publish(
            LEADER_CHANGE_EVENT_TOPIC,
            LeaderChangeEvent {
                key: key.to_string(),
                leader,
                leader_host: leader_host.to_string(),
            },
        );
    }

    // Seeding helpers for rule-plane tables; in production these tables are
    // written by the console APIs, which live outside this crate.

    pub async fn upsert_strategy(&self, strategy: StrategyDetail) {
        let mtime = self.inner.next_mtime().await;
        let mut tables = self.inner.tables.write().await;
        tables.strategies.insert(
            strategy.id.clone(),
            Record {
                data: strategy,
                modify_time: mtime,
                valid: true,
            },
        );
    }

    pub async fn remove_strategy(&self, id: &str) {
        let mtime = self.inner.next_mtime().await;
        let mut tables = self.inner.tables.write().await;
        if let Some(record) = tables.strategies.get_mut(id) {
            record.valid = false;
            record.modify_time = mtime;
        }
    }

    pub async fn upsert_user(&self, user: UserRow) {
        let mtime = self.inner.next_mtime().await;
        let mut tables = self.inner.tables.write().await;
        tables.users.insert(
            user.id.clone(),
            Record {
                data: user,
                modify_time: mtime,
                valid: true,
            },
        );
    }

    pub async fn upsert_router_rule(&self, rule: RouterRule) {
        let mtime = self.inner.next_mtime().await;
        let mut tables = self.inner.tables.write().await;
        tables.router_rules.insert(
            rule.id.clone(),
            Record {
                data: rule,
                modify_time: mtime,
                valid: true,
            },
        );
    }

    pub async fn remove_router_rule(&self, id: &str) {
        let mtime = self.inner.next_mtime().await;
        let mut tables = self.inner.tables.write().await;
        if let Some(record) = tables.router_rules.get_mut(id) {
            record.valid = false;
            record.modify_time = mtime;
        }
    }

    pub async fn upsert_router_rule_v1(&self, rule: RouterRuleV1) {
        let mtime = self.inner.next_mtime().await;
        let mut tables = self.inner.tables.write().await;
        tables.router_rules_v1.insert(
            rule.id.clone(),
            Record {
                data: rule,
                modify_time: mtime,
                valid: true,
            },
        );
    }

    pub async fn upsert_service_rule(&self, kind: ServiceRuleKind, rule: ServiceRule) {
        let mtime = self.inner.next_mtime().await;
        let mut tables = self.inner.tables.write().await;
        tables.service_rules.insert(
            (kind, rule.id.clone()),
            Record {
                data: rule,
                modify_time: mtime,
                valid: true,
            },
        );
    }
}

impl Inner {
    /// Strictly monotonic modification timestamp.
    async fn next_mtime(&self) -> DateTime<Utc> {
        let mut last = self.clock.lock().await;
        let now = Utc::now();
        let next = if now > *last {
            now
        } else {
            *last + ChronoDuration::milliseconds(1)
        };
        *last = next;
        next
    }

    fn service_lock(&self, service_id: &str) -> Arc<RwLock<()>> {
        self.service_locks
            .entry(service_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }
}

fn delta<T: Clone>(
    records: impl Iterator<Item = Record<T>>,
    last_mtime: DateTime<Utc>,
    first_load: bool,
) -> Vec<DeltaRow<T>> {
    records
        .filter(|record| {
            if first_load {
                record.valid
            } else {
                record.modify_time > last_mtime
            }
        })
        .map(|record| DeltaRow {
            data: record.data,
            modify_time: record.modify_time,
            valid: record.valid,
        })
        .collect()
}

fn matches_field(instance: &Instance, key: &str, value: &str) -> bool {
    match key {
        "service" => instance.service == value,
        "namespace" => instance.namespace == value,
        "host" => instance.host == value,
        "port" => instance.port.to_string() == value,
        "protocol" => instance.protocol == value,
        "version" => instance.version == value,
        "vpc_id" => instance.vpc_id == value,
        "logic_set" => instance.logic_set == value,
        "healthy" => (instance.healthy as u8).to_string() == value,
        "isolate" => (instance.isolate as u8).to_string() == value,
        _ => true,
    }
}

pub struct MemoryTx {
    inner: Arc<Inner>,
    guards: Vec<OwnedRwLockReadGuard<()>>,
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn rlock_service(
        &mut self,
        name: &str,
        namespace: &str,
    ) -> StoreResult<Option<Service>> {
        let service = {
            let tables = self.inner.tables.read().await;
            tables
                .service_ids
                .get(&(namespace.to_string(), name.to_string()))
                .and_then(|id| tables.services.get(id))
                .filter(|record| record.valid)
                .map(|record| record.data.clone())
        };
        let Some(service) = service else {
            return Ok(None);
        };
        let lock = self.inner.service_lock(&service.id);
        self.guards.push(lock.read_owned().await);
        Ok(Some(service))
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        drop(self.guards);
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_services_for_cache(
        &self,
        last_mtime: DateTime<Utc>,
        first_load: bool,
    ) -> StoreResult<Vec<DeltaRow<Service>>> {
        let tables = self.inner.tables.read().await;
        Ok(delta(
            tables.services.values().cloned(),
            last_mtime,
            first_load,
        ))
    }

    async fn get_instances_for_cache(
        &self,
        last_mtime: DateTime<Utc>,
        first_load: bool,
    ) -> StoreResult<Vec<DeltaRow<Instance>>> {
        let tables = self.inner.tables.read().await;
        Ok(delta(
            tables.instances.values().cloned(),
            last_mtime,
            first_load,
        ))
    }

    async fn get_strategies_for_cache(
        &self,
        last_mtime: DateTime<Utc>,
        first_load: bool,
    ) -> StoreResult<Vec<DeltaRow<StrategyDetail>>> {
        let tables = self.inner.tables.read().await;
        Ok(delta(
            tables.strategies.values().cloned(),
            last_mtime,
            first_load,
        ))
    }

    async fn get_users_for_cache(
        &self,
        last_mtime: DateTime<Utc>,
        first_load: bool,
    ) -> StoreResult<Vec<DeltaRow<UserRow>>> {
        let tables = self.inner.tables.read().await;
        Ok(delta(
            tables.users.values().cloned(),
            last_mtime,
            first_load,
        ))
    }

    async fn get_router_rules_for_cache(
        &self,
        last_mtime: DateTime<Utc>,
        first_load: bool,
    ) -> StoreResult<Vec<DeltaRow<RouterRule>>> {
        let tables = self.inner.tables.read().await;
        Ok(delta(
            tables.router_rules.values().cloned(),
            last_mtime,
            first_load,
        ))
    }

    async fn get_router_rules_v1_for_cache(
        &self,
        last_mtime: DateTime<Utc>,
        first_load: bool,
    ) -> StoreResult<Vec<DeltaRow<RouterRuleV1>>> {
        let tables = self.inner.tables.read().await;
        Ok(delta(
            tables.router_rules_v1.values().cloned(),
            last_mtime,
            first_load,
        ))
    }

    async fn get_service_rules_for_cache(
        &self,
        kind: ServiceRuleKind,
        last_mtime: DateTime<Utc>,
        first_load: bool,
    ) -> StoreResult<Vec<DeltaRow<ServiceRule>>> {
        let tables = self.inner.tables.read().await;
        Ok(delta(
            tables
                .service_rules
                .iter()
                .filter(|((k, _), _)| *k == kind)
                .map(|(_, record)| record.clone()),
            last_mtime,
            first_load,
        ))
    }

    async fn get_service(&self, name: &str, namespace: &str) -> StoreResult<Option<Service>> {
        let tables = self.inner.tables.read().await;
        let id = tables
            .service_ids
            .get(&(namespace.to_string(), name.to_string()));
        Ok(id
            .and_then(|id| tables.services.get(id))
            .filter(|record| record.valid)
            .map(|record| record.data.clone()))
    }

    async fn get_service_by_id(&self, id: &str) -> StoreResult<Option<Service>> {
        let tables = self.inner.tables.read().await;
        Ok(tables
            .services
            .get(id)
            .filter(|record| record.valid)
            .map(|record| record.data.clone()))
    }

    async fn get_instance(&self, id: &str) -> StoreResult<Option<Instance>> {
        let tables = self.inner.tables.read().await;
        Ok(tables
            .instances
            .get(id)
            .filter(|record| record.valid)
            .map(|record| record.data.clone()))
    }

    async fn get_instances_by_host(
        &self,
        service_id: &str,
        host: &str,
    ) -> StoreResult<Vec<Instance>> {
        let tables = self.inner.tables.read().await;
        Ok(tables
            .instances
            .values()
            .filter(|record| record.valid)
            .filter(|record| record.data.service_id == service_id && record.data.host == host)
            .map(|record| record.data.clone())
            .collect())
    }

    async fn get_expand_instances(
        &self,
        filters: InstanceFilters,
    ) -> StoreResult<(usize, Vec<Instance>)> {
        let tables = self.inner.tables.read().await;
        let mut hits: Vec<Instance> = tables
            .instances
            .values()
            .filter(|record| record.valid)
            .map(|record| &record.data)
            .filter(|instance| {
                filters
                    .fields
                    .iter()
                    .all(|(key, value)| matches_field(instance, key, value))
            })
            .filter(|instance| {
                filters
                    .metadata
                    .iter()
                    .all(|(key, value)| instance.metadata.get(key) == Some(value))
            })
            .cloned()
            .collect();
        hits.sort_by(|a, b| a.id.cmp(&b.id));
        let total = hits.len();
        let page: Vec<Instance> = hits
            .into_iter()
            .skip(filters.offset)
            .take(if filters.limit == 0 {
                usize::MAX
            } else {
                filters.limit
            })
            .collect();
        Ok((total, page))
    }

    async fn get_instances_count(&self) -> StoreResult<usize> {
        let tables = self.inner.tables.read().await;
        Ok(tables
            .instances
            .values()
            .filter(|record| record.valid)
            .count())
    }

    async fn create_service(&self, service: Service) -> StoreResult<Service> {
        let mtime = self.inner.next_mtime().await;
        let mut tables = self.inner.tables.write().await;
        let key = (service.namespace.clone(), service.name.clone());
        if let Some(existing_id) = tables.service_ids.get(&key) {
            if tables
                .services
                .get(existing_id)
                .map(|record| record.valid)
                .unwrap_or(false)
            {
                return Err(StoreError::Duplicate(format!(
                    "service {}:{}",
                    service.namespace, service.name
                )));
            }
        }
        tables.service_ids.insert(key, service.id.clone());
        tables.services.insert(
            service.id.clone(),
            Record {
                data: service.clone(),
                modify_time: mtime,
                valid: true,
            },
        );
        Ok(service)
    }

    async fn add_instance(&self, instance: Instance) -> StoreResult<()> {
        let mtime = self.inner.next_mtime().await;
        let mut tables = self.inner.tables.write().await;
        if tables
            .instances
            .get(&instance.id)
            .map(|record| record.valid)
            .unwrap_or(false)
        {
            return Err(StoreError::Duplicate(format!("instance {}", instance.id)));
        }
        tables.instances.insert(
            instance.id.clone(),
            Record {
                data: instance,
                modify_time: mtime,
                valid: true,
            },
        );
        Ok(())
    }

    async fn update_instance(&self, instance: Instance) -> StoreResult<()> {
        let mtime = self.inner.next_mtime().await;
        let mut tables = self.inner.tables.write().await;
        match tables.instances.get_mut(&instance.id) {
            Some(record) if record.valid => {
                record.data = instance;
                record.modify_time = mtime;
                Ok(())
            }
            _ => Err(StoreError::NotFound(format!("instance {}", instance.id))),
        }
    }

    async fn delete_instance(&self, id: &str) -> StoreResult<()> {
        let mtime = self.inner.next_mtime().await;
        let mut tables = self.inner.tables.write().await;
        if let Some(record) = tables.instances.get_mut(id) {
            record.valid = false;
            record.modify_time = mtime;
        }
        Ok(())
    }

    async fn batch_delete_instances(&self, ids: Vec<String>) -> StoreResult<()> {
        let mtime = self.inner.next_mtime().await;
        let mut tables = self.inner.tables.write().await;
        for id in ids {
            if let Some(record) = tables.instances.get_mut(&id) {
                record.valid = false;
                record.modify_time = mtime;
            }
        }
        Ok(())
    }

    async fn batch_set_instance_isolate(
        &self,
        ids: Vec<String>,
        isolate: bool,
        revision: String,
    ) -> StoreResult<()> {
        let mtime = self.inner.next_mtime().await;
        let mut tables = self.inner.tables.write().await;
        for id in ids {
            if let Some(record) = tables.instances.get_mut(&id) {
                if record.valid {
                    record.data.isolate = isolate;
                    record.data.revision = revision.clone();
                    record.modify_time = mtime;
                }
            }
        }
        Ok(())
    }

    async fn create_transaction(&self) -> StoreResult<Box<dyn StoreTx>> {
        Ok(Box::new(MemoryTx {
            inner: Arc::clone(&self.inner),
            guards: Vec::new(),
        }))
    }

    async fn start_leader_election(&self, key: &str) -> StoreResult<()> {
        // Single-node default: this process wins immediately. Clustered
        // deployments plug in a store whose election is backed by the
        // database.
        self.publish_leader_change(key, true, &self.inner.host);
        Ok(())
    }
}
