//! Client discovery endpoints over the cached view.
//!
//! Every response carries an opaque revision; a request presenting the
//! same revision short-circuits to `DataNoChange` without a payload.

use std::sync::Arc;

use chrono::Utc;
use common::api::{ApiCode, Instance, Service, ServiceInfo, ServiceKey};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::CacheSet;
use crate::error::{ApiError, ApiResult};
use crate::store::RouterRule;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoverRequest {
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub revision: String,
}

/// Discovery outcome: unchanged content is signalled without a payload.
#[derive(Debug, Clone)]
pub enum DiscoverResult<T> {
    NoChange,
    Data {
        revision: String,
        /// Source service when the request named an alias.
        alias_for: Option<ServiceKey>,
        payload: T,
    },
}

impl<T> DiscoverResult<T> {
    pub fn code(&self) -> ApiCode {
        match self {
            DiscoverResult::NoChange => ApiCode::DataNoChange,
            DiscoverResult::Data { .. } => ApiCode::ExecuteSuccess,
        }
    }
}

const DEFAULT_NAMESPACE: &str = "default";

pub struct DiscoverServer {
    caches: Arc<CacheSet>,
}

impl DiscoverServer {
    pub fn new(caches: Arc<CacheSet>) -> Arc<Self> {
        Arc::new(Self { caches })
    }

    fn source_service(&self, name: &str, namespace: &str) -> ApiResult<(Service, Option<ServiceKey>)> {
        let direct = self
            .caches
            .service
            .get_by_name(name, namespace)
            .ok_or_else(|| ApiError::code(ApiCode::NotFoundService))?;
        if direct.is_alias() {
            let source = self
                .caches
                .service
                .get_by_id(&direct.reference)
                .ok_or_else(|| ApiError::code(ApiCode::NotFoundService))?;
            let alias_for = Some(source.key());
            return Ok((source, alias_for));
        }
        Ok((direct, None))
    }

    /// Instances of one service, revision-gated.
    pub fn instances(&self, req: &DiscoverRequest) -> ApiResult<DiscoverResult<Vec<Instance>>> {
        if req.service.is_empty() {
            return Err(ApiError::code(ApiCode::InvalidServiceName));
        }
        let namespace = if req.namespace.is_empty() {
            DEFAULT_NAMESPACE
        } else {
            &req.namespace
        };
        let (service, alias_for) = self.source_service(&req.service, namespace)?;
        let revision = self.caches.instance.service_revision(&service.id);
        if !revision.is_empty() && revision == req.revision {
            return Ok(DiscoverResult::NoChange);
        }
        let instances = self.caches.instance.get_by_service_id(&service.id);
        debug!(
            service = %service.name,
            namespace = %service.namespace,
            size = instances.len(),
            %revision,
            "discover instances"
        );
        Ok(DiscoverResult::Data {
            revision,
            alias_for,
            payload: instances,
        })
    }

    /// Service listing of a namespace (or all), revision-gated.
    pub fn services(&self, req: &DiscoverRequest) -> ApiResult<DiscoverResult<Vec<Service>>> {
        let (revision, services) = if req.namespace.is_empty() {
            self.caches.service.list_all_services()
        } else {
            self.caches.service.list_services(&req.namespace)
        };
        if revision.is_empty() {
            return Ok(DiscoverResult::Data {
                revision,
                alias_for: None,
                payload: Vec::new(),
            });
        }
        debug!(size = services.len(), %revision, "discover services");
        if revision == req.revision {
            return Ok(DiscoverResult::NoChange);
        }
        Ok(DiscoverResult::Data {
            revision,
            alias_for: None,
            payload: services,
        })
    }

    /// Router rules of one service, flattened L1→L3, revision-gated.
    pub fn router_rules(&self, req: &DiscoverRequest) -> ApiResult<DiscoverResult<Vec<RouterRule>>> {
        if req.service.is_empty() {
            return Err(ApiError::code(ApiCode::InvalidServiceName));
        }
        if req.namespace.is_empty() {
            return Err(ApiError::code(ApiCode::InvalidNamespaceName));
        }
        let (service, alias_for) = self.source_service(&req.service, &req.namespace)?;
        let (revision, rules) = self
            .caches
            .router_rule
            .get_router_config(&service.name, &service.namespace);
        if revision.is_empty() {
            return Ok(DiscoverResult::Data {
                revision,
                alias_for,
                payload: Vec::new(),
            });
        }
        if revision == req.revision {
            return Ok(DiscoverResult::NoChange);
        }
        Ok(DiscoverResult::Data {
            revision,
            alias_for,
            payload: rules,
        })
    }

    /// Governance rules of one service (rate limit, fault detect, circuit
    /// breaker share the shape), revision-gated.
    pub fn service_rules(
        &self,
        cache: &crate::cache::ServiceRuleCache,
        req: &DiscoverRequest,
    ) -> ApiResult<DiscoverResult<Vec<crate::store::ServiceRule>>> {
        if req.service.is_empty() {
            return Err(ApiError::code(ApiCode::InvalidServiceName));
        }
        if req.namespace.is_empty() {
            return Err(ApiError::code(ApiCode::InvalidNamespaceName));
        }
        let (service, alias_for) = self.source_service(&req.service, &req.namespace)?;
        let revision = cache.last_revision(&service.name, &service.namespace);
        if revision.is_empty() {
            return Ok(DiscoverResult::Data {
                revision,
                alias_for,
                payload: Vec::new(),
            });
        }
        if revision == req.revision {
            return Ok(DiscoverResult::NoChange);
        }
        Ok(DiscoverResult::Data {
            revision,
            alias_for,
            payload: cache.get_rules(&service.name, &service.namespace),
        })
    }

    /// Immutable snapshot for foreign-protocol bridges. Isolated instances
    /// are filtered out; the checksum is the service's instance revision.
    pub fn service_info(&self, name: &str, namespace: &str, clusters: &str) -> ServiceInfo {
        let Ok((service, _)) = self.source_service(name, namespace) else {
            return ServiceInfo::empty(name, namespace);
        };
        let hosts: Vec<Instance> = self
            .caches
            .instance
            .get_by_service_id(&service.id)
            .into_iter()
            .filter(|instance| !instance.isolate)
            .collect();
        ServiceInfo {
            name: name.to_string(),
            group_name: namespace.to_string(),
            clusters: clusters.to_string(),
            checksum: self.caches.instance.service_revision(&service.id),
            cache_millis: 1000,
            last_ref_time: Utc::now().timestamp_millis(),
            reach_protection_threshold: false,
            hosts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventbus::EventHub;
    use crate::store::memory::MemoryStore;
    use crate::store::Store;
    use chrono::Utc;
    use common::api::new_revision;
    use std::collections::HashMap;

    fn service_row(id: &str, name: &str, reference: &str) -> Service {
        Service {
            id: id.to_string(),
            namespace: "default".to_string(),
            name: name.to_string(),
            business: String::new(),
            meta: HashMap::new(),
            reference: reference.to_string(),
            revision: new_revision(),
            ctime: Utc::now(),
            mtime: Utc::now(),
        }
    }

    fn instance_row(id: &str, service_id: &str, port: u16, isolate: bool) -> Instance {
        Instance {
            id: id.to_string(),
            service_id: service_id.to_string(),
            namespace: "default".to_string(),
            service: "A".to_string(),
            host: "10.0.0.1".to_string(),
            port,
            vpc_id: String::new(),
            protocol: String::new(),
            version: String::new(),
            weight: 100,
            priority: 0,
            healthy: true,
            isolate,
            enable_health_check: false,
            health_check: None,
            location: Default::default(),
            metadata: HashMap::new(),
            logic_set: String::new(),
            revision: new_revision(),
            mtime: Utc::now(),
        }
    }

    async fn discover_harness() -> (Arc<DiscoverServer>, MemoryStore, Arc<CacheSet>) {
        let store = MemoryStore::new(EventHub::new(), "127.0.0.1");
        let dyn_store: Arc<dyn Store> = Arc::new(store.clone());
        let caches = CacheSet::new(dyn_store);
        let discover = DiscoverServer::new(Arc::clone(&caches));
        (discover, store, caches)
    }

    #[tokio::test]
    async fn instance_discovery_gates_on_revision() {
        let (discover, store, caches) = discover_harness().await;
        store
            .create_service(service_row("s1", "A", ""))
            .await
            .expect("create");
        store
            .add_instance(instance_row("i1", "s1", 8080, false))
            .await
            .expect("add");
        caches.refresh_all().await.expect("refresh");

        let mut req = DiscoverRequest {
            namespace: "default".to_string(),
            service: "A".to_string(),
            revision: String::new(),
        };
        let DiscoverResult::Data { revision, payload, .. } =
            discover.instances(&req).expect("discover")
        else {
            panic!("expected payload");
        };
        assert_eq!(payload.len(), 1);
        assert_ne!(revision, "");

        // Same revision: no change.
        req.revision = revision.clone();
        assert!(matches!(
            discover.instances(&req).expect("discover"),
            DiscoverResult::NoChange
        ));

        // New instance moves the revision.
        store
            .add_instance(instance_row("i2", "s1", 8081, false))
            .await
            .expect("add");
        caches.refresh_all().await.expect("refresh");
        let DiscoverResult::Data { revision: next, payload, .. } =
            discover.instances(&req).expect("discover")
        else {
            panic!("expected payload");
        };
        assert_ne!(next, revision);
        assert_eq!(payload.len(), 2);
    }

    #[tokio::test]
    async fn alias_discovery_returns_source_instances() {
        let (discover, store, caches) = discover_harness().await;
        store
            .create_service(service_row("s1", "real", ""))
            .await
            .expect("create");
        store
            .create_service(service_row("s2", "alias", "s1"))
            .await
            .expect("create");
        store
            .add_instance(instance_row("i1", "s1", 8080, false))
            .await
            .expect("add");
        caches.refresh_all().await.expect("refresh");

        let req = DiscoverRequest {
            namespace: "default".to_string(),
            service: "alias".to_string(),
            revision: String::new(),
        };
        let DiscoverResult::Data { alias_for, payload, .. } =
            discover.instances(&req).expect("discover")
        else {
            panic!("expected payload");
        };
        assert_eq!(payload.len(), 1);
        assert_eq!(
            alias_for.expect("alias_for"),
            ServiceKey::new("default", "real")
        );
    }

    #[tokio::test]
    async fn service_listing_gates_on_namespace_revision() {
        let (discover, store, caches) = discover_harness().await;
        store
            .create_service(service_row("s1", "A", ""))
            .await
            .expect("create");
        caches.refresh_all().await.expect("refresh");

        let mut req = DiscoverRequest {
            namespace: "default".to_string(),
            ..DiscoverRequest::default()
        };
        let DiscoverResult::Data { revision, payload, .. } =
            discover.services(&req).expect("discover")
        else {
            panic!("expected payload");
        };
        assert_eq!(payload.len(), 1);
        req.revision = revision;
        assert!(matches!(
            discover.services(&req).expect("discover"),
            DiscoverResult::NoChange
        ));
    }

    #[tokio::test]
    async fn service_info_filters_isolated_hosts() {
        let (discover, store, caches) = discover_harness().await;
        store
            .create_service(service_row("s1", "A", ""))
            .await
            .expect("create");
        store
            .add_instance(instance_row("i1", "s1", 8080, false))
            .await
            .expect("add");
        store
            .add_instance(instance_row("i2", "s1", 8081, true))
            .await
            .expect("add");
        caches.refresh_all().await.expect("refresh");

        let info = discover.service_info("A", "default", "c1");
        assert_eq!(info.hosts.len(), 1);
        assert_eq!(info.hosts[0].port, 8080);
        assert_ne!(info.checksum, "");
        assert_eq!(info.clusters, "c1");
    }

    #[tokio::test]
    async fn unknown_service_is_not_found() {
        let (discover, _store, _caches) = discover_harness().await;
        let req = DiscoverRequest {
            namespace: "default".to_string(),
            service: "ghost".to_string(),
            revision: String::new(),
        };
        assert_eq!(
            discover.instances(&req).unwrap_err().code,
            ApiCode::NotFoundService
        );
    }
}
