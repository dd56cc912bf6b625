//! Service cache: `(namespace, name)` and id lookups plus alias resolution.

use std::sync::Arc;

use common::api::Service;
use dashmap::DashMap;
use tracing::{debug, error};

use super::Watermark;
use crate::error::ApiResult;
use crate::revision::composite_revision;
use crate::singleflight::SingleFlight;
use crate::store::Store;

const CACHE_NAME: &str = "service";

pub struct ServiceCache {
    store: Arc<dyn Store>,
    ids: DashMap<String, Service>,
    names: DashMap<(String, String), String>,
    watermark: Watermark,
    flight: SingleFlight<&'static str, ApiResult<()>>,
}

impl ServiceCache {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            ids: DashMap::new(),
            names: DashMap::new(),
            watermark: Watermark::new(),
            flight: SingleFlight::new(),
        }
    }

    /// Refreshes the cache; concurrent callers coalesce to one store query.
    pub async fn update(&self) -> ApiResult<()> {
        self.flight
            .run(CACHE_NAME, || async { self.real_update().await })
            .await
    }

    async fn real_update(&self) -> ApiResult<()> {
        let (last_fetch, first_load) = self.watermark.snapshot();
        let rows = self
            .store
            .get_services_for_cache(last_fetch, first_load)
            .await
            .map_err(|err| {
                error!(%err, "refresh service cache");
                crate::error::ApiError::from(err)
            })?;

        let mut last_mtime = last_fetch;
        let (mut added, mut removed) = (0usize, 0usize);
        for row in rows {
            if row.modify_time > last_mtime {
                last_mtime = row.modify_time;
            }
            let key = (row.data.namespace.clone(), row.data.name.clone());
            if !row.valid {
                self.ids.remove(&row.data.id);
                self.names.remove(&key);
                removed += 1;
            } else {
                self.names.insert(key, row.data.id.clone());
                self.ids.insert(row.data.id.clone(), row.data);
                added += 1;
            }
        }
        if added + removed > 0 {
            debug!(added, removed, "service cache applied delta");
        }
        self.watermark.advance(last_mtime);
        Ok(())
    }

    pub fn get_by_id(&self, id: &str) -> Option<Service> {
        self.ids.get(id).map(|entry| entry.clone())
    }

    pub fn get_by_name(&self, name: &str, namespace: &str) -> Option<Service> {
        let id = self
            .names
            .get(&(namespace.to_string(), name.to_string()))?
            .clone();
        self.get_by_id(&id)
    }

    /// Resolves a name to its source service, dereferencing an alias exactly
    /// once.
    pub fn get_source_service(&self, name: &str, namespace: &str) -> Option<Service> {
        let service = self.get_by_name(name, namespace)?;
        if service.is_alias() {
            return self.get_by_id(&service.reference);
        }
        Some(service)
    }

    /// Services of one namespace plus the namespace's composite revision.
    pub fn list_services(&self, namespace: &str) -> (String, Vec<Service>) {
        let services: Vec<Service> = self
            .ids
            .iter()
            .filter(|entry| entry.namespace == namespace)
            .map(|entry| entry.clone())
            .collect();
        (list_revision(&services), services)
    }

    pub fn list_all_services(&self) -> (String, Vec<Service>) {
        let services: Vec<Service> = self.ids.iter().map(|entry| entry.clone()).collect();
        (list_revision(&services), services)
    }

    pub fn count(&self) -> usize {
        self.ids.len()
    }
}

fn list_revision(services: &[Service]) -> String {
    if services.is_empty() {
        return String::new();
    }
    let revisions: Vec<String> = services.iter().map(|svc| svc.revision.clone()).collect();
    composite_revision(&revisions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventbus::EventHub;
    use crate::store::memory::MemoryStore;
    use chrono::Utc;
    use common::api::new_revision;
    use std::collections::HashMap;

    fn make_service(id: &str, namespace: &str, name: &str, reference: &str) -> Service {
        Service {
            id: id.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            business: String::new(),
            meta: HashMap::new(),
            reference: reference.to_string(),
            revision: new_revision(),
            ctime: Utc::now(),
            mtime: Utc::now(),
        }
    }

    #[tokio::test]
    async fn name_and_id_lookups_agree() {
        let store = MemoryStore::new(EventHub::new(), "127.0.0.1");
        store
            .create_service(make_service("s1", "default", "a", ""))
            .await
            .expect("create");
        let cache = ServiceCache::new(Arc::new(store));
        cache.update().await.expect("refresh");

        let by_name = cache.get_by_name("a", "default").expect("by name");
        let by_id = cache.get_by_id("s1").expect("by id");
        assert_eq!(by_name, by_id);
    }

    #[tokio::test]
    async fn alias_resolution_dereferences_exactly_once() {
        let store = MemoryStore::new(EventHub::new(), "127.0.0.1");
        store
            .create_service(make_service("s1", "default", "real", ""))
            .await
            .expect("create");
        store
            .create_service(make_service("s2", "default", "alias", "s1"))
            .await
            .expect("create");
        let cache = ServiceCache::new(Arc::new(store));
        cache.update().await.expect("refresh");

        let source = cache.get_source_service("alias", "default").expect("alias");
        assert_eq!(source.id, "s1");
        let direct = cache.get_source_service("real", "default").expect("real");
        assert_eq!(direct.id, "s1");
    }

    #[tokio::test]
    async fn namespace_listing_revision_tracks_membership() {
        let store = MemoryStore::new(EventHub::new(), "127.0.0.1");
        store
            .create_service(make_service("s1", "default", "a", ""))
            .await
            .expect("create");
        let cache = ServiceCache::new(Arc::new(store.clone()));
        cache.update().await.expect("refresh");
        let (rev1, list1) = cache.list_services("default");
        assert_eq!(list1.len(), 1);
        assert_ne!(rev1, "");

        store
            .create_service(make_service("s2", "default", "b", ""))
            .await
            .expect("create");
        cache.update().await.expect("refresh");
        let (rev2, list2) = cache.list_services("default");
        assert_eq!(list2.len(), 2);
        assert_ne!(rev1, rev2);
    }
}
