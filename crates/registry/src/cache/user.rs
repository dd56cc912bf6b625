//! User cache: user/group rows plus the user → groups membership index.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::error;

use super::Watermark;
use crate::error::ApiResult;
use crate::singleflight::SingleFlight;
use crate::store::{Store, UserRole, UserRow};

const CACHE_NAME: &str = "user";

pub struct UserCache {
    store: Arc<dyn Store>,
    users: DashMap<String, UserRow>,
    /// user id → ids of groups the user belongs to.
    user_groups: DashMap<String, HashSet<String>>,
    watermark: Watermark,
    flight: SingleFlight<&'static str, ApiResult<()>>,
}

impl UserCache {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            users: DashMap::new(),
            user_groups: DashMap::new(),
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
            .get_users_for_cache(last_fetch, first_load)
            .await
            .map_err(|err| {
                error!(%err, "refresh user cache");
                crate::error::ApiError::from(err)
            })?;

        let mut last_mtime = last_fetch;
        for row in rows {
            if row.modify_time > last_mtime {
                last_mtime = row.modify_time;
            }
            let id = row.data.id.clone();
            if row.data.role == UserRole::Group {
                self.apply_group_membership(&row.data, row.valid);
            }
            if !row.valid {
                self.users.remove(&id);
            } else {
                self.users.insert(id, row.data);
            }
        }
        self.watermark.advance(last_mtime);
        Ok(())
    }

    /// Diffs the group's member list against the previous row, retracting
    /// dropped memberships before adding new ones.
    fn apply_group_membership(&self, group: &UserRow, valid: bool) {
        let new_members: HashSet<&String> = if valid {
            group.member_ids.iter().collect()
        } else {
            HashSet::new()
        };
        if let Some(old) = self.users.get(&group.id) {
            for member in &old.member_ids {
                if !new_members.contains(member) {
                    if let Some(mut groups) = self.user_groups.get_mut(member) {
                        groups.remove(&group.id);
                    }
                }
            }
        }
        for member in new_members {
            self.user_groups
                .entry(member.clone())
                .or_default()
                .insert(group.id.clone());
        }
    }

    pub fn get_user(&self, id: &str) -> Option<UserRow> {
        self.users.get(id).map(|entry| entry.clone())
    }

    /// One-level principal expansion: the groups a user belongs to.
    pub fn get_user_link_group_ids(&self, user_id: &str) -> Vec<String> {
        self.user_groups
            .get(user_id)
            .map(|groups| groups.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventbus::EventHub;
    use crate::store::memory::MemoryStore;

    fn user(id: &str, role: UserRole) -> UserRow {
        UserRow {
            id: id.to_string(),
            name: id.to_string(),
            role,
            member_ids: Vec::new(),
        }
    }

    fn group(id: &str, members: &[&str]) -> UserRow {
        UserRow {
            id: id.to_string(),
            name: id.to_string(),
            role: UserRole::Group,
            member_ids: members.iter().map(|m| m.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn membership_diff_retracts_dropped_members() {
        let store = MemoryStore::new(EventHub::new(), "127.0.0.1");
        store.upsert_user(user("u1", UserRole::Sub)).await;
        store.upsert_user(user("u2", UserRole::Sub)).await;
        store.upsert_user(group("g1", &["u1", "u2"])).await;

        let cache = UserCache::new(Arc::new(store.clone()));
        cache.update().await.expect("refresh");
        assert_eq!(cache.get_user_link_group_ids("u1"), vec!["g1".to_string()]);
        assert_eq!(cache.get_user_link_group_ids("u2"), vec!["g1".to_string()]);

        store.upsert_user(group("g1", &["u2"])).await;
        cache.update().await.expect("refresh");
        assert!(cache.get_user_link_group_ids("u1").is_empty());
        assert_eq!(cache.get_user_link_group_ids("u2"), vec!["g1".to_string()]);
    }
}
