//! Service-scoped governance rule cache, shared by the rate-limit,
//! fault-detect and circuit-breaker planes.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::error;

use super::Watermark;
use crate::error::ApiResult;
use crate::revision::composite_revision;
use crate::singleflight::SingleFlight;
use crate::store::{ServiceRule, ServiceRuleKind, Store};

pub struct ServiceRuleCache {
    store: Arc<dyn Store>,
    kind: ServiceRuleKind,
    rules: DashMap<String, ServiceRule>,
    by_service: DashMap<(String, String), HashSet<String>>,
    watermark: Watermark,
    flight: SingleFlight<String, ApiResult<()>>,
}

impl ServiceRuleCache {
    pub fn new(store: Arc<dyn Store>, kind: ServiceRuleKind) -> Self {
        Self {
            store,
            kind,
            rules: DashMap::new(),
            by_service: DashMap::new(),
            watermark: Watermark::new(),
            flight: SingleFlight::new(),
        }
    }

    fn name(&self) -> String {
        format!("{:?}", self.kind)
    }

    pub async fn update(&self) -> ApiResult<()> {
        self.flight
            .run(self.name(), || async { self.real_update().await })
            .await
    }

    async fn real_update(&self) -> ApiResult<()> {
        let (last_fetch, first_load) = self.watermark.snapshot();
        let rows = self
            .store
            .get_service_rules_for_cache(self.kind, last_fetch, first_load)
            .await
            .map_err(|err| {
                error!(%err, kind = ?self.kind, "refresh service rule cache");
                crate::error::ApiError::from(err)
            })?;

        let mut last_mtime = last_fetch;
        for row in rows {
            if row.modify_time > last_mtime {
                last_mtime = row.modify_time;
            }
            let key = (row.data.namespace.clone(), row.data.service.clone());
            if !row.valid {
                if let Some((_, old)) = self.rules.remove(&row.data.id) {
                    let old_key = (old.namespace, old.service);
                    if let Some(mut members) = self.by_service.get_mut(&old_key) {
                        members.remove(&row.data.id);
                    }
                }
            } else {
                self.by_service
                    .entry(key)
                    .or_default()
                    .insert(row.data.id.clone());
                self.rules.insert(row.data.id.clone(), row.data);
            }
        }
        self.watermark.advance(last_mtime);
        Ok(())
    }

    pub fn get_rules(&self, service: &str, namespace: &str) -> Vec<ServiceRule> {
        let Some(ids) = self
            .by_service
            .get(&(namespace.to_string(), service.to_string()))
        else {
            return Vec::new();
        };
        let mut rules: Vec<ServiceRule> = ids
            .iter()
            .filter_map(|id| self.rules.get(id).map(|entry| entry.clone()))
            .collect();
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        rules
    }

    /// Composite revision over the service's rules; empty when the service
    /// has none.
    pub fn last_revision(&self, service: &str, namespace: &str) -> String {
        let rules = self.get_rules(service, namespace);
        if rules.is_empty() {
            return String::new();
        }
        let revisions: Vec<String> = rules.into_iter().map(|rule| rule.revision).collect();
        composite_revision(&revisions)
    }
}
