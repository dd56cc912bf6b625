//! Router rule cache: three-level bucket plus V1→V2 conversion.
//!
//! V2 rules are stored by id and indexed by `(namespace, service)`. Legacy
//! V1 rules convert into one V2 rule per direction entry; the bucket
//! remembers the v1→v2 mapping so a V1 tombstone can retract its converted
//! rules. Conversions that cannot complete yet (service row not cached,
//! alias target) stay in `pending_v1_rules` and retry on every refresh.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{error, warn};

use super::{service::ServiceCache, Watermark};
use crate::error::ApiResult;
use crate::revision::composite_revision;
use crate::singleflight::SingleFlight;
use crate::store::{RouterRule, RouterRuleV1, RoutingLevel, Store};

const CACHE_NAME: &str = "router_rule";

#[derive(Default)]
struct RouteRuleBucket {
    rules: HashMap<String, RouterRule>,
    index: HashMap<(String, String), HashSet<String>>,
    v1_to_v2: HashMap<String, Vec<String>>,
}

impl RouteRuleBucket {
    fn save_v2(&mut self, rule: RouterRule) {
        self.delete_v2(&rule.id);
        let key = (rule.namespace.clone(), rule.service.clone());
        self.index
            .entry(key)
            .or_default()
            .insert(rule.id.clone());
        self.rules.insert(rule.id.clone(), rule);
    }

    fn delete_v2(&mut self, id: &str) {
        if let Some(old) = self.rules.remove(id) {
            let key = (old.namespace, old.service);
            if let Some(members) = self.index.get_mut(&key) {
                members.remove(id);
                if members.is_empty() {
                    self.index.remove(&key);
                }
            }
        }
    }

    fn save_v1(&mut self, v1_id: &str, rules: Vec<RouterRule>) {
        self.delete_v1(v1_id);
        let mut ids = Vec::with_capacity(rules.len());
        for rule in rules {
            ids.push(rule.id.clone());
            self.save_v2(rule);
        }
        self.v1_to_v2.insert(v1_id.to_string(), ids);
    }

    fn delete_v1(&mut self, v1_id: &str) {
        if let Some(ids) = self.v1_to_v2.remove(v1_id) {
            for id in ids {
                self.delete_v2(&id);
            }
        }
    }

    fn converted_from_v1(&self, v2_id: &str) -> Option<String> {
        self.v1_to_v2
            .iter()
            .find(|(_, ids)| ids.iter().any(|id| id == v2_id))
            .map(|(v1_id, _)| v1_id.clone())
    }

    /// Enabled rules grouped by level; within a level the order is
    /// `(priority, id)`.
    fn list_enable_rules(
        &self,
        service: &str,
        namespace: &str,
        include_wildcard: bool,
    ) -> BTreeMap<RoutingLevel, Vec<RouterRule>> {
        let mut keys = vec![(namespace.to_string(), service.to_string())];
        if include_wildcard {
            keys.push((namespace.to_string(), "*".to_string()));
            keys.push(("*".to_string(), "*".to_string()));
        }

        let mut out: BTreeMap<RoutingLevel, Vec<RouterRule>> = BTreeMap::new();
        let mut seen = HashSet::new();
        for key in keys {
            let Some(ids) = self.index.get(&key) else {
                continue;
            };
            for id in ids {
                if !seen.insert(id.clone()) {
                    continue;
                }
                if let Some(rule) = self.rules.get(id) {
                    if rule.enable {
                        out.entry(rule.level).or_default().push(rule.clone());
                    }
                }
            }
        }
        for rules in out.values_mut() {
            rules.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.id.cmp(&b.id)));
        }
        out
    }

    fn size(&self) -> usize {
        self.rules.len()
    }
}

pub struct RouterRuleCache {
    store: Arc<dyn Store>,
    service_cache: Arc<ServiceCache>,
    bucket: RwLock<RouteRuleBucket>,
    pending_v1_rules: Mutex<HashMap<String, RouterRuleV1>>,
    watermark_v1: Watermark,
    watermark_v2: Watermark,
    flight: SingleFlight<&'static str, ApiResult<()>>,
}

impl RouterRuleCache {
    pub fn new(store: Arc<dyn Store>, service_cache: Arc<ServiceCache>) -> Self {
        Self {
            store,
            service_cache,
            bucket: RwLock::new(RouteRuleBucket::default()),
            pending_v1_rules: Mutex::new(HashMap::new()),
            watermark_v1: Watermark::new(),
            watermark_v2: Watermark::new(),
            flight: SingleFlight::new(),
        }
    }

    pub async fn update(&self) -> ApiResult<()> {
        self.flight
            .run(CACHE_NAME, || async { self.real_update().await })
            .await
    }

    async fn real_update(&self) -> ApiResult<()> {
        let (last_v1, first_v1) = self.watermark_v1.snapshot();
        let rows_v1 = self
            .store
            .get_router_rules_v1_for_cache(last_v1, first_v1)
            .await
            .map_err(|err| {
                error!(%err, "refresh router rule v1 cache");
                crate::error::ApiError::from(err)
            })?;

        let (last_v2, first_v2) = self.watermark_v2.snapshot();
        let rows_v2 = self
            .store
            .get_router_rules_for_cache(last_v2, first_v2)
            .await
            .map_err(|err| {
                error!(%err, "refresh router rule v2 cache");
                crate::error::ApiError::from(err)
            })?;

        let mut last_mtime_v1 = last_v1;
        {
            let mut pending = self
                .pending_v1_rules
                .lock()
                .expect("pending v1 rules poisoned");
            let mut bucket = self.bucket.write().expect("router bucket poisoned");
            for row in rows_v1 {
                if row.modify_time > last_mtime_v1 {
                    last_mtime_v1 = row.modify_time;
                }
                if !row.valid {
                    pending.remove(&row.data.id);
                    bucket.delete_v1(&row.data.id);
                } else {
                    pending.insert(row.data.id.clone(), row.data);
                }
            }
        }
        self.convert_pending().await;
        self.watermark_v1.advance(last_mtime_v1);

        let mut last_mtime_v2 = last_v2;
        {
            let mut bucket = self.bucket.write().expect("router bucket poisoned");
            for row in rows_v2 {
                if row.modify_time > last_mtime_v2 {
                    last_mtime_v2 = row.modify_time;
                }
                if !row.valid {
                    bucket.delete_v2(&row.data.id);
                } else {
                    bucket.save_v2(row.data);
                }
            }
        }
        self.watermark_v2.advance(last_mtime_v2);
        Ok(())
    }

    /// Retries every pending V1 conversion. Failed rows stay pending for
    /// the next tick.
    async fn convert_pending(&self) {
        let snapshot: Vec<RouterRuleV1> = {
            let pending = self
                .pending_v1_rules
                .lock()
                .expect("pending v1 rules poisoned");
            pending.values().cloned().collect()
        };

        for rule in snapshot {
            match self.convert_v1_to_v2(&rule).await {
                Ok(Some(converted)) => {
                    let mut bucket = self.bucket.write().expect("router bucket poisoned");
                    bucket.save_v1(&rule.id, converted);
                    drop(bucket);
                    self.pending_v1_rules
                        .lock()
                        .expect("pending v1 rules poisoned")
                        .remove(&rule.id);
                }
                Ok(None) => {
                    // Service row not visible yet; try again next tick.
                }
                Err(reason) => {
                    warn!(rule_id = %rule.id, %reason, "router rule v1 conversion failed, will retry");
                }
            }
        }
    }

    /// `Ok(None)` means the owning service is not resolvable yet; an alias
    /// target is a persistent error.
    async fn convert_v1_to_v2(
        &self,
        rule: &RouterRuleV1,
    ) -> Result<Option<Vec<RouterRule>>, String> {
        let service = match self.service_cache.get_by_id(&rule.service_id) {
            Some(service) => service,
            None => match self.store.get_service_by_id(&rule.service_id).await {
                Ok(Some(service)) => service,
                Ok(None) => return Ok(None),
                Err(err) => return Err(err.to_string()),
            },
        };
        if service.is_alias() {
            return Err(format!(
                "service {}:{} is an alias",
                service.namespace, service.name
            ));
        }

        let mut converted = Vec::with_capacity(rule.in_bounds.len() + rule.out_bounds.len());
        for (direction, entries) in [("in", &rule.in_bounds), ("out", &rule.out_bounds)] {
            for (index, entry) in entries.iter().enumerate() {
                converted.push(RouterRule {
                    id: format!("{}-{}-{}", rule.id, direction, index),
                    name: entry.name.clone(),
                    namespace: service.namespace.clone(),
                    service: service.name.clone(),
                    level: RoutingLevel::L3,
                    priority: entry.priority,
                    enable: true,
                    revision: rule.revision.clone(),
                });
            }
        }
        Ok(Some(converted))
    }

    pub fn list_enable_rules(
        &self,
        service: &str,
        namespace: &str,
        include_wildcard: bool,
    ) -> BTreeMap<RoutingLevel, Vec<RouterRule>> {
        self.bucket
            .read()
            .expect("router bucket poisoned")
            .list_enable_rules(service, namespace, include_wildcard)
    }

    /// Flattened L1→L2→L3 view plus the composite revision over member
    /// rules, for the discovery response.
    pub fn get_router_config(&self, service: &str, namespace: &str) -> (String, Vec<RouterRule>) {
        let by_level = self.list_enable_rules(service, namespace, true);
        let mut flat = Vec::new();
        let mut revisions = Vec::new();
        for (_, rules) in by_level {
            for rule in rules {
                revisions.push(rule.revision.clone());
                flat.push(rule);
            }
        }
        if flat.is_empty() {
            return (String::new(), flat);
        }
        (composite_revision(&revisions), flat)
    }

    /// The V1 rule a converted V2 rule came from, if any.
    pub fn converted_from_v1(&self, v2_id: &str) -> Option<String> {
        self.bucket
            .read()
            .expect("router bucket poisoned")
            .converted_from_v1(v2_id)
    }

    pub fn pending_v1_count(&self) -> usize {
        self.pending_v1_rules
            .lock()
            .expect("pending v1 rules poisoned")
            .len()
    }

    pub fn rule_count(&self) -> usize {
        self.bucket.read().expect("router bucket poisoned").size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventbus::EventHub;
    use crate::store::memory::MemoryStore;
    use crate::store::RouteEntry;
    use chrono::Utc;
    use common::api::{new_revision, Service};
    use std::collections::HashMap as StdHashMap;

    fn v2_rule(id: &str, level: RoutingLevel, priority: u32) -> RouterRule {
        RouterRule {
            id: id.to_string(),
            name: id.to_string(),
            namespace: "default".to_string(),
            service: "a".to_string(),
            level,
            priority,
            enable: true,
            revision: new_revision(),
        }
    }

    fn make_service(id: &str, name: &str, reference: &str) -> Service {
        Service {
            id: id.to_string(),
            namespace: "default".to_string(),
            name: name.to_string(),
            business: String::new(),
            meta: StdHashMap::new(),
            reference: reference.to_string(),
            revision: new_revision(),
            ctime: Utc::now(),
            mtime: Utc::now(),
        }
    }

    async fn cache_with(store: &MemoryStore) -> RouterRuleCache {
        let store: Arc<dyn Store> = Arc::new(store.clone());
        let service_cache = Arc::new(ServiceCache::new(Arc::clone(&store)));
        service_cache.update().await.expect("service refresh");
        let cache = RouterRuleCache::new(store, service_cache);
        cache.update().await.expect("router refresh");
        cache
    }

    #[tokio::test]
    async fn levels_flatten_l1_before_l2_before_l3() {
        let store = MemoryStore::new(EventHub::new(), "127.0.0.1");
        store.upsert_router_rule(v2_rule("r3", RoutingLevel::L3, 0)).await;
        store.upsert_router_rule(v2_rule("r1", RoutingLevel::L1, 5)).await;
        store.upsert_router_rule(v2_rule("r2", RoutingLevel::L2, 0)).await;
        let cache = cache_with(&store).await;

        let (revision, flat) = cache.get_router_config("a", "default");
        assert_ne!(revision, "");
        let ids: Vec<&str> = flat.iter().map(|rule| rule.id.as_str()).collect();
        assert_eq!(ids, vec!["r1", "r2", "r3"]);
    }

    #[tokio::test]
    async fn priority_then_id_orders_within_a_level() {
        let store = MemoryStore::new(EventHub::new(), "127.0.0.1");
        store.upsert_router_rule(v2_rule("rb", RoutingLevel::L1, 1)).await;
        store.upsert_router_rule(v2_rule("ra", RoutingLevel::L1, 1)).await;
        store.upsert_router_rule(v2_rule("rc", RoutingLevel::L1, 0)).await;
        let cache = cache_with(&store).await;

        let by_level = cache.list_enable_rules("a", "default", false);
        let ids: Vec<&str> = by_level[&RoutingLevel::L1]
            .iter()
            .map(|rule| rule.id.as_str())
            .collect();
        assert_eq!(ids, vec!["rc", "ra", "rb"]);
    }

    #[tokio::test]
    async fn v1_rules_convert_and_remember_their_origin() {
        let store = MemoryStore::new(EventHub::new(), "127.0.0.1");
        store
            .create_service(make_service("s1", "a", ""))
            .await
            .expect("create");
        store
            .upsert_router_rule_v1(RouterRuleV1 {
                id: "v1-rule".to_string(),
                service_id: "s1".to_string(),
                in_bounds: vec![RouteEntry {
                    name: "in0".to_string(),
                    priority: 0,
                }],
                out_bounds: vec![RouteEntry {
                    name: "out0".to_string(),
                    priority: 0,
                }],
                revision: new_revision(),
            })
            .await;
        let cache = cache_with(&store).await;

        assert_eq!(cache.pending_v1_count(), 0);
        assert_eq!(cache.rule_count(), 2);
        assert_eq!(
            cache.converted_from_v1("v1-rule-in-0").as_deref(),
            Some("v1-rule")
        );
    }

    #[tokio::test]
    async fn alias_service_conversion_stays_pending() {
        let store = MemoryStore::new(EventHub::new(), "127.0.0.1");
        store
            .create_service(make_service("s1", "real", ""))
            .await
            .expect("create");
        store
            .create_service(make_service("s2", "alias", "s1"))
            .await
            .expect("create");
        store
            .upsert_router_rule_v1(RouterRuleV1 {
                id: "v1-alias".to_string(),
                service_id: "s2".to_string(),
                in_bounds: vec![RouteEntry {
                    name: "in0".to_string(),
                    priority: 0,
                }],
                out_bounds: Vec::new(),
                revision: new_revision(),
            })
            .await;
        let cache = cache_with(&store).await;

        // The failed conversion is retried every refresh but never lands.
        assert_eq!(cache.pending_v1_count(), 1);
        assert_eq!(cache.rule_count(), 0);
        cache.update().await.expect("second refresh");
        assert_eq!(cache.pending_v1_count(), 1);
    }
}
