//! Instance cache: id and service-id indexes plus lazily recomputed
//! per-service revisions.

use std::collections::HashSet;
use std::sync::Arc;

use common::api::Instance;
use dashmap::DashMap;
use tracing::{debug, error};

use super::Watermark;
use crate::error::ApiResult;
use crate::revision::composite_revision;
use crate::singleflight::SingleFlight;
use crate::store::Store;

const CACHE_NAME: &str = "instance";

pub struct InstanceCache {
    store: Arc<dyn Store>,
    ids: DashMap<String, Instance>,
    by_service: DashMap<String, HashSet<String>>,
    /// service id → composite revision; invalidated on every apply touching
    /// the service and recomputed on demand.
    revisions: DashMap<String, String>,
    watermark: Watermark,
    flight: SingleFlight<&'static str, ApiResult<()>>,
}

impl InstanceCache {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            ids: DashMap::new(),
            by_service: DashMap::new(),
            revisions: DashMap::new(),
            watermark: Watermark::new(),
            flight: SingleFlight::new(),
        }
    }

    pub async fn update(&self) -> ApiResult<()> {
        self.flight
            .run(CACHE_NAME, || async { self.real_update().await })
            .await
    }

    async fn real_update(&self) -> ApiResult<()> {
        let (last_fetch, first_load) = self.watermark.snapshot();
        let rows = self
            .store
            .get_instances_for_cache(last_fetch, first_load)
            .await
            .map_err(|err| {
                error!(%err, "refresh instance cache");
                crate::error::ApiError::from(err)
            })?;

        let mut last_mtime = last_fetch;
        let (mut added, mut removed) = (0usize, 0usize);
        for row in rows {
            if row.modify_time > last_mtime {
                last_mtime = row.modify_time;
            }
            let id = row.data.id.clone();
            let service_id = row.data.service_id.clone();
            if !row.valid {
                if let Some((_, old)) = self.ids.remove(&id) {
                    if let Some(mut members) = self.by_service.get_mut(&old.service_id) {
                        members.remove(&id);
                    }
                    self.revisions.remove(&old.service_id);
                }
                removed += 1;
            } else {
                if let Some(old) = self.ids.get(&id) {
                    if old.service_id != service_id {
                        let stale = old.service_id.clone();
                        drop(old);
                        if let Some(mut members) = self.by_service.get_mut(&stale) {
                            members.remove(&id);
                        }
                        self.revisions.remove(&stale);
                    }
                }
                self.by_service
                    .entry(service_id.clone())
                    .or_default()
                    .insert(id.clone());
                self.ids.insert(id, row.data);
                self.revisions.remove(&service_id);
                added += 1;
            }
        }
        if added + removed > 0 {
            debug!(added, removed, "instance cache applied delta");
        }
        self.watermark.advance(last_mtime);
        Ok(())
    }

    pub fn get_by_id(&self, id: &str) -> Option<Instance> {
        self.ids.get(id).map(|entry| entry.clone())
    }

    pub fn get_by_service_id(&self, service_id: &str) -> Vec<Instance> {
        let Some(members) = self.by_service.get(service_id) else {
            return Vec::new();
        };
        members
            .iter()
            .filter_map(|id| self.ids.get(id).map(|entry| entry.clone()))
            .collect()
    }

    /// Ids of instances with health checking enabled; input to the expiry
    /// sweeper.
    pub fn health_checked_instances(&self) -> Vec<Instance> {
        self.ids
            .iter()
            .filter(|entry| entry.enable_health_check)
            .map(|entry| entry.clone())
            .collect()
    }

    /// Opaque ETag over the service's member instance revisions. Stale
    /// entries are recomputed on demand.
    pub fn service_revision(&self, service_id: &str) -> String {
        if let Some(revision) = self.revisions.get(service_id) {
            return revision.clone();
        }
        let members = self.get_by_service_id(service_id);
        let revisions: Vec<String> = members.iter().map(|ins| ins.revision.clone()).collect();
        let computed = composite_revision(&revisions);
        self.revisions
            .insert(service_id.to_string(), computed.clone());
        computed
    }

    pub fn count(&self) -> usize {
        self.ids.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventbus::EventHub;
    use crate::store::memory::MemoryStore;
    use chrono::Utc;
    use common::api::new_revision;
    use std::collections::HashMap;

    fn make_instance(id: &str, service_id: &str, port: u16, checked: bool) -> Instance {
        Instance {
            id: id.to_string(),
            service_id: service_id.to_string(),
            namespace: "default".to_string(),
            service: "a".to_string(),
            host: "10.0.0.1".to_string(),
            port,
            vpc_id: String::new(),
            protocol: String::new(),
            version: String::new(),
            weight: 100,
            priority: 0,
            healthy: true,
            isolate: false,
            enable_health_check: checked,
            health_check: None,
            location: Default::default(),
            metadata: HashMap::new(),
            logic_set: String::new(),
            revision: new_revision(),
            mtime: Utc::now(),
        }
    }

    #[tokio::test]
    async fn service_revision_changes_when_membership_changes() {
        let store = MemoryStore::new(EventHub::new(), "127.0.0.1");
        store
            .add_instance(make_instance("i1", "s1", 8080, false))
            .await
            .expect("add");
        let cache = InstanceCache::new(Arc::new(store.clone()));
        cache.update().await.expect("refresh");
        let rev1 = cache.service_revision("s1");

        store
            .add_instance(make_instance("i2", "s1", 8081, false))
            .await
            .expect("add");
        cache.update().await.expect("refresh");
        let rev2 = cache.service_revision("s1");
        assert_ne!(rev1, rev2);

        // Unchanged content keeps the same revision.
        cache.update().await.expect("refresh");
        assert_eq!(rev2, cache.service_revision("s1"));
    }

    #[tokio::test]
    async fn removed_instances_leave_every_index() {
        let store = MemoryStore::new(EventHub::new(), "127.0.0.1");
        store
            .add_instance(make_instance("i1", "s1", 8080, true))
            .await
            .expect("add");
        let cache = InstanceCache::new(Arc::new(store.clone()));
        cache.update().await.expect("refresh");
        assert_eq!(cache.get_by_service_id("s1").len(), 1);
        assert_eq!(cache.health_checked_instances().len(), 1);

        store.delete_instance("i1").await.expect("delete");
        cache.update().await.expect("refresh");
        assert!(cache.get_by_id("i1").is_none());
        assert!(cache.get_by_service_id("s1").is_empty());
        assert!(cache.health_checked_instances().is_empty());
    }
}
