//! Auth strategy cache: forward rule map plus typed reverse indexes.
//!
//! Reverse indexes are a functional view of forward state. The apply path
//! diffs each incoming rule against the previously cached one and retracts
//! reverse-index entries for dropped resources/principals before adding the
//! new ones, so a rule edit can never leave a stale link behind.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, error};

use super::{user::UserCache, Watermark};
use crate::error::ApiResult;
use crate::singleflight::SingleFlight;
use crate::store::{Principal, PrincipalRole, ResourceType, Store, StrategyDetail};

const CACHE_NAME: &str = "strategy";

/// Forward entry: the rule plus its principals split by role for O(1)
/// editable checks.
#[derive(Debug, Clone)]
pub struct StrategyDetailCache {
    pub detail: StrategyDetail,
    pub user_principals: HashMap<String, Principal>,
    pub group_principals: HashMap<String, Principal>,
}

fn build_detail_cache(detail: StrategyDetail) -> StrategyDetailCache {
    let mut users = HashMap::new();
    let mut groups = HashMap::new();
    for principal in &detail.principals {
        match principal.role {
            PrincipalRole::User => {
                users.insert(principal.principal_id.clone(), principal.clone());
            }
            PrincipalRole::Group => {
                groups.insert(principal.principal_id.clone(), principal.clone());
            }
        }
    }
    StrategyDetailCache {
        detail,
        user_principals: users,
        group_principals: groups,
    }
}

pub struct StrategyCache {
    store: Arc<dyn Store>,
    user_cache: Arc<UserCache>,
    strategies: DashMap<String, StrategyDetailCache>,
    namespace_links: DashMap<String, HashSet<String>>,
    service_links: DashMap<String, HashSet<String>>,
    config_group_links: DashMap<String, HashSet<String>>,
    user_links: DashMap<String, HashSet<String>>,
    group_links: DashMap<String, HashSet<String>>,
    watermark: Watermark,
    flight: SingleFlight<&'static str, ApiResult<()>>,
}

impl StrategyCache {
    pub fn new(store: Arc<dyn Store>, user_cache: Arc<UserCache>) -> Self {
        Self {
            store,
            user_cache,
            strategies: DashMap::new(),
            namespace_links: DashMap::new(),
            service_links: DashMap::new(),
            config_group_links: DashMap::new(),
            user_links: DashMap::new(),
            group_links: DashMap::new(),
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
            .get_strategies_for_cache(last_fetch, first_load)
            .await
            .map_err(|err| {
                error!(%err, "refresh strategy cache");
                crate::error::ApiError::from(err)
            })?;

        let mut last_mtime = last_fetch;
        let (mut added, mut updated, mut removed) = (0usize, 0usize, 0usize);

        // Reverse indexes first: the diff needs the previous forward entry.
        for row in &rows {
            self.apply_resource_links(&row.data, row.valid);
            self.apply_principal_links(&row.data, row.valid);
        }

        for row in rows {
            if row.modify_time > last_mtime {
                last_mtime = row.modify_time;
            }
            if !row.valid {
                self.strategies.remove(&row.data.id);
                removed += 1;
            } else {
                if self.strategies.contains_key(&row.data.id) {
                    updated += 1;
                } else {
                    added += 1;
                }
                self.strategies
                    .insert(row.data.id.clone(), build_detail_cache(row.data));
            }
        }

        if added + updated + removed > 0 {
            debug!(added, updated, removed, "strategy cache applied delta");
        }
        self.watermark.advance(last_mtime);
        Ok(())
    }

    fn resource_index(&self, res_type: ResourceType) -> &DashMap<String, HashSet<String>> {
        match res_type {
            ResourceType::Namespaces => &self.namespace_links,
            ResourceType::Services => &self.service_links,
            ResourceType::ConfigGroups => &self.config_group_links,
        }
    }

    fn principal_index(&self, role: PrincipalRole) -> &DashMap<String, HashSet<String>> {
        match role {
            PrincipalRole::User => &self.user_links,
            PrincipalRole::Group => &self.group_links,
        }
    }

    fn write_link(
        index: &DashMap<String, HashSet<String>>,
        key: &str,
        strategy_id: &str,
        remove: bool,
    ) {
        if remove {
            if let Some(mut links) = index.get_mut(key) {
                links.remove(strategy_id);
            }
        } else {
            index
                .entry(key.to_string())
                .or_default()
                .insert(strategy_id.to_string());
        }
    }

    fn apply_resource_links(&self, rule: &StrategyDetail, valid: bool) {
        if let Some(old) = self.strategies.get(&rule.id) {
            let new_keys: HashSet<(ResourceType, &str)> = rule
                .resources
                .iter()
                .map(|res| (res.res_type, res.res_id.as_str()))
                .collect();
            // Resources kicked out of the rule lose their link first.
            for res in &old.detail.resources {
                if !new_keys.contains(&(res.res_type, res.res_id.as_str())) {
                    Self::write_link(
                        self.resource_index(res.res_type),
                        &res.res_id,
                        &rule.id,
                        true,
                    );
                }
            }
        }
        for res in &rule.resources {
            Self::write_link(
                self.resource_index(res.res_type),
                &res.res_id,
                &rule.id,
                !valid,
            );
        }
    }

    fn apply_principal_links(&self, rule: &StrategyDetail, valid: bool) {
        if let Some(old) = self.strategies.get(&rule.id) {
            let new_keys: HashSet<(PrincipalRole, &str)> = rule
                .principals
                .iter()
                .map(|p| (p.role, p.principal_id.as_str()))
                .collect();
            for principal in &old.detail.principals {
                if !new_keys.contains(&(principal.role, principal.principal_id.as_str())) {
                    Self::write_link(
                        self.principal_index(principal.role),
                        &principal.principal_id,
                        &rule.id,
                        true,
                    );
                }
            }
        }
        for principal in &rule.principals {
            Self::write_link(
                self.principal_index(principal.role),
                &principal.principal_id,
                &rule.id,
                !valid,
            );
        }
    }

    /// Whether any rule in `strategy_ids` names the principal. An empty
    /// bucket grants nothing; the never-linked default lives in
    /// [`is_resource_editable`](Self::is_resource_editable).
    fn check_editable(&self, strategy_ids: &HashSet<String>, principal: &Principal) -> bool {
        let mut editable = false;
        for strategy_id in strategy_ids {
            if let Some(rule) = self.strategies.get(strategy_id) {
                let hit = match principal.role {
                    PrincipalRole::User => rule.user_principals.contains_key(&principal.principal_id),
                    PrincipalRole::Group => {
                        rule.group_principals.contains_key(&principal.principal_id)
                    }
                };
                editable = editable || hit;
            }
        }
        editable
    }

    /// Whether the principal may operate on the resource. The principal
    /// expands into itself plus its groups (one level); both the resource's
    /// own rules and the `"*"` rules are consulted. A resource id that was
    /// never linked to any rule is editable by anyone; once a rule has
    /// touched it, only a rule membership grants access.
    pub fn is_resource_editable(
        &self,
        principal: &Principal,
        res_type: ResourceType,
        res_id: &str,
    ) -> bool {
        let index = self.resource_index(res_type);
        let links = index.get(res_id).map(|entry| entry.clone());
        let wildcard = index.get("*").map(|entry| entry.clone());

        let Some(links) = links else {
            return true;
        };

        let mut principals = vec![principal.clone()];
        if principal.role == PrincipalRole::User {
            for group_id in self
                .user_cache
                .get_user_link_group_ids(&principal.principal_id)
            {
                principals.push(Principal::group(group_id));
            }
        }

        for item in &principals {
            if let Some(wildcard) = &wildcard {
                if self.check_editable(wildcard, item) {
                    return true;
                }
            }
            if self.check_editable(&links, item) {
                return true;
            }
        }
        false
    }

    /// Whether any rule links the resource.
    pub fn is_resource_linked(&self, res_type: ResourceType, res_id: &str) -> bool {
        self.resource_index(res_type)
            .get(res_id)
            .map(|links| !links.is_empty())
            .unwrap_or(false)
    }

    pub fn get_strategy_ids_by_principal(&self, principal: &Principal) -> Vec<String> {
        self.principal_index(principal.role)
            .get(&principal.principal_id)
            .map(|links| links.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get_strategy(&self, id: &str) -> Option<StrategyDetailCache> {
        self.strategies.get(id).map(|entry| entry.clone())
    }
}
