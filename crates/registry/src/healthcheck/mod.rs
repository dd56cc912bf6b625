//! Leader-follower heartbeat health checker.
//!
//! Beat timestamps live in the elected leader's memory slots. The leader
//! serves reads and writes locally; followers forward over a long-lived
//! HTTP channel with batched bodies. Role transitions are driven by
//! [`LeaderChangeEvent`]s from the store's external election, fenced by a
//! monotonic `leader_version` so a retry scheduled under an obsolete
//! transition can never clobber a newer one.

pub mod peer;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::api::{
    HealthCheck, Instance, InstanceEvent, InstanceEventType, LeaderChangeEvent, new_revision,
    INSTANCE_EVENT_TOPIC, LEADER_CHANGE_EVENT_TOPIC,
};
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{error, info, warn};

use crate::cache::CacheSet;
use crate::config::{HealthCheckConfig, LeaderCheckerConfig};
use crate::error::CoordError;
use crate::eventbus::{EventHub, SubOptions};
use crate::store::{Store, ELECTION_KEY_SELF_SERVICE_CHECKER};
use peer::{
    BeatRecord, DeleteBeatsRequest, LocalPeer, QueryBeatsRequest, QueryBeatsResponse,
    ReadBeatRecord, RemotePeer, ReplicateBeatsRequest,
};

#[derive(Debug, Clone)]
pub struct ReportRequest {
    pub instance_id: String,
    pub cur_time_sec: i64,
    pub count: u64,
}

#[derive(Debug, Clone)]
pub struct QueryResponse {
    pub server: String,
    pub last_heartbeat_sec: i64,
    pub count: u64,
    pub exists: bool,
}

#[derive(Debug, Clone)]
pub struct CheckRequest {
    pub instance_id: String,
    /// Health state currently recorded for the instance.
    pub healthy: bool,
    pub expire_duration_sec: i64,
    pub cur_time_sec: i64,
}

#[derive(Debug, Clone)]
pub struct CheckResponse {
    pub healthy: bool,
    pub last_heartbeat_sec: i64,
    pub stay_unchanged: bool,
}

fn now_sec() -> i64 {
    Utc::now().timestamp()
}

pub struct LeaderHealthChecker {
    conf: LeaderCheckerConfig,
    /// Port peers reach this node's checker channel on.
    peer_port: u16,
    local: LocalPeer,
    remote: RwLock<Option<Arc<RemotePeer>>>,
    /// Serializes role transitions; request paths only take atomics.
    transition: Mutex<()>,
    leader: AtomicBool,
    initialized: AtomicBool,
    destroyed: AtomicBool,
    leader_version: AtomicI64,
    leader_change_time_sec: AtomicI64,
    suspend_time_sec: AtomicI64,
}

impl LeaderHealthChecker {
    pub fn new(conf: LeaderCheckerConfig, self_host: &str, peer_port: u16) -> Arc<Self> {
        Arc::new(Self {
            local: LocalPeer::new(self_host, conf.solt_num),
            conf,
            peer_port,
            remote: RwLock::new(None),
            transition: Mutex::new(()),
            leader: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            leader_version: AtomicI64::new(0),
            leader_change_time_sec: AtomicI64::new(0),
            suspend_time_sec: AtomicI64::new(0),
        })
    }

    /// Subscribes to leader-change events and joins the election.
    pub async fn start(
        self: &Arc<Self>,
        hub: &EventHub,
        store: &Arc<dyn Store>,
    ) -> Result<tokio::task::JoinHandle<()>, CoordError> {
        let mut subscription = hub.subscribe(LEADER_CHANGE_EVENT_TOPIC, SubOptions::default())?;
        let checker = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                let Some(event) = event.downcast_ref::<LeaderChangeEvent>() else {
                    continue;
                };
                if event.key != ELECTION_KEY_SELF_SERVICE_CHECKER {
                    continue;
                }
                if checker.destroyed.load(Ordering::SeqCst) {
                    break;
                }
                checker.on_leader_change(event.clone()).await;
            }
        });
        store
            .start_leader_election(ELECTION_KEY_SELF_SERVICE_CHECKER)
            .await
            .map_err(|err| CoordError::Transport(err.to_string()))?;
        Ok(handle)
    }

    async fn on_leader_change(self: &Arc<Self>, event: LeaderChangeEvent) {
        let _guard = self.transition.lock().await;
        self.leader_version.fetch_add(1, Ordering::SeqCst);
        self.initialized.store(false, Ordering::SeqCst);
        let version = self.leader_version.load(Ordering::SeqCst);
        if event.leader {
            self.become_leader().await;
        } else {
            self.become_follower(&event, version).await;
            // Records now belong to the new leader.
            self.local.storage().clean();
        }
        self.refresh_leader_change_time();
    }

    async fn become_leader(&self) {
        if let Some(old) = self.remote.write().await.take() {
            info!(leader = %old.host(), "become leader, closing old leader channel");
            old.close();
        }
        self.leader.store(true, Ordering::SeqCst);
        self.initialized.store(true, Ordering::SeqCst);
        info!("self become leader");
    }

    async fn become_follower(self: &Arc<Self>, event: &LeaderChangeEvent, version: i64) {
        // Empty host: election has no winner yet, wait for the next event.
        if event.leader_host.is_empty() {
            return;
        }
        info!(leader = %event.leader_host, "self become follower");
        {
            let remote = self.remote.read().await;
            if let Some(current) = remote.as_ref() {
                if current.host() == event.leader_host {
                    self.initialized.store(true, Ordering::SeqCst);
                    return;
                }
            }
        }
        if let Some(old) = self.remote.write().await.take() {
            info!(old_leader = %old.host(), "leader changed, closing old channel");
            old.close();
        }
        if !self.try_dial(event).await {
            let checker = Arc::clone(self);
            let event = event.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    let _guard = checker.transition.lock().await;
                    // A newer transition owns the state now.
                    if checker.leader_version.load(Ordering::SeqCst) != version {
                        return;
                    }
                    if checker.try_dial(&event).await {
                        return;
                    }
                }
            });
        }
    }

    async fn try_dial(&self, event: &LeaderChangeEvent) -> bool {
        match RemotePeer::connect(&event.leader_host, self.peer_port, &self.conf).await {
            Ok(peer) => {
                *self.remote.write().await = Some(Arc::new(peer));
                self.leader.store(false, Ordering::SeqCst);
                self.initialized.store(true, Ordering::SeqCst);
                true
            }
            Err(err) => {
                error!(%err, leader = %event.leader_host, "dial leader failed, will retry");
                false
            }
        }
    }

    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), CoordError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(CoordError::PeerClosed);
        }
        Ok(())
    }

    /// Writes one heartbeat for the instance, local on the leader and
    /// forwarded on a follower.
    pub async fn report(&self, from_peer: bool, req: ReportRequest) -> Result<(), CoordError> {
        self.ensure_open()?;
        if from_peer {
            return Err(CoordError::RedirectOnlyOnce);
        }
        if !self.is_initialized() {
            warn!("leader checker uninitialized, ignore report");
            return Ok(());
        }
        if self.is_leader() {
            return self.local.put(BeatRecord {
                key: req.instance_id,
                server_host: self.local.host().to_string(),
                cur_time_sec: req.cur_time_sec,
                count: req.count,
            });
        }
        let remote = self.responsible_remote().await?;
        remote
            .put(BeatRecord {
                key: req.instance_id,
                server_host: remote.host().to_string(),
                cur_time_sec: req.cur_time_sec,
                count: req.count,
            })
            .await
    }

    /// Reads the last heartbeat for the instance.
    pub async fn query(&self, from_peer: bool, instance_id: &str) -> Result<QueryResponse, CoordError> {
        self.ensure_open()?;
        if from_peer {
            return Err(CoordError::RedirectOnlyOnce);
        }
        if !self.is_initialized() {
            return Ok(QueryResponse {
                server: String::new(),
                last_heartbeat_sec: 0,
                count: 0,
                exists: false,
            });
        }
        let (server, record) = if self.is_leader() {
            (self.local.host().to_string(), self.local.get(instance_id)?)
        } else {
            let remote = self.responsible_remote().await?;
            let record = remote.get(instance_id).await?;
            (remote.host().to_string(), record)
        };
        Ok(read_to_query(server, record))
    }

    /// Removes the heartbeat record for the instance.
    pub async fn delete(&self, from_peer: bool, instance_id: &str) -> Result<(), CoordError> {
        self.ensure_open()?;
        if from_peer {
            return Err(CoordError::RedirectOnlyOnce);
        }
        if self.is_leader() {
            return self.local.del(instance_id);
        }
        let remote = self.responsible_remote().await?;
        remote.del(instance_id).await
    }

    /// Evaluates the instance's health from its last heartbeat, honoring
    /// the skip-check windows.
    pub async fn check(&self, req: CheckRequest) -> Result<CheckResponse, CoordError> {
        let query = self.query(false, &req.instance_id).await?;
        let last = query.last_heartbeat_sec;
        if self.skip_check(&req.instance_id, req.expire_duration_sec) {
            return Ok(CheckResponse {
                healthy: req.healthy,
                last_heartbeat_sec: last,
                stay_unchanged: true,
            });
        }
        if req.cur_time_sec > last && req.cur_time_sec - last >= req.expire_duration_sec {
            if req.healthy {
                info!(
                    instance_id = %req.instance_id,
                    last_heartbeat_sec = last,
                    cur_time_sec = req.cur_time_sec,
                    expire_duration_sec = req.expire_duration_sec,
                    "health check expired"
                );
                return Ok(CheckResponse {
                    healthy: false,
                    last_heartbeat_sec: last,
                    stay_unchanged: false,
                });
            }
            return Ok(CheckResponse {
                healthy: false,
                last_heartbeat_sec: last,
                stay_unchanged: true,
            });
        }
        if !req.healthy {
            info!(
                instance_id = %req.instance_id,
                last_heartbeat_sec = last,
                "health check resumed"
            );
            return Ok(CheckResponse {
                healthy: true,
                last_heartbeat_sec: last,
                stay_unchanged: false,
            });
        }
        Ok(CheckResponse {
            healthy: true,
            last_heartbeat_sec: last,
            stay_unchanged: true,
        })
    }

    async fn responsible_remote(&self) -> Result<Arc<RemotePeer>, CoordError> {
        let remote = self.remote.read().await;
        remote
            .as_ref()
            .map(Arc::clone)
            .ok_or(CoordError::PeerClosed)
    }

    /// Suppresses health transitions for one expire interval.
    pub fn suspend(&self) {
        let now = now_sec();
        info!(start = now, "suspend health checker");
        self.suspend_time_sec.store(now, Ordering::SeqCst);
    }

    pub fn suspend_time_sec(&self) -> i64 {
        self.suspend_time_sec.load(Ordering::SeqCst)
    }

    pub fn leader_change_time_sec(&self) -> i64 {
        self.leader_change_time_sec.load(Ordering::SeqCst)
    }

    fn refresh_leader_change_time(&self) {
        self.leader_change_time_sec.store(now_sec(), Ordering::SeqCst);
    }

    /// Whether checks must return unchanged: not yet initialized, inside an
    /// operator suspend window, or inside the churn window after a leader
    /// change (the cluster may transiently have zero or two leaders).
    fn skip_check(&self, key: &str, expire_duration_sec: i64) -> bool {
        if !self.is_initialized() {
            info!("leader checker uninitialized, skip check");
            return true;
        }
        let now = now_sec();
        let suspended = self.suspend_time_sec();
        if suspended > 0 && now >= suspended && now - suspended < expire_duration_sec {
            info!(
                suspend_time_sec = suspended,
                instance_id = %key,
                "health check suspended, skip"
            );
            return true;
        }
        let changed = self.leader_change_time_sec();
        if changed > 0 && now >= changed && now - changed < expire_duration_sec {
            info!(
                leader_change_time_sec = changed,
                instance_id = %key,
                "leader recently changed, skip check"
            );
            return true;
        }
        false
    }

    // Peer-channel entry points, called by the HTTP handlers. A message
    // carrying the peer marker is terminal here: a non-leader refuses it
    // instead of forwarding again.

    pub fn handle_replicate(&self, req: ReplicateBeatsRequest) -> Result<(), CoordError> {
        self.ensure_open()?;
        if req.sent_from_peer && !self.is_leader() {
            return Err(CoordError::RedirectOnlyOnce);
        }
        for record in req.records {
            self.local.put(record)?;
        }
        Ok(())
    }

    pub fn handle_query(&self, req: QueryBeatsRequest) -> Result<QueryBeatsResponse, CoordError> {
        self.ensure_open()?;
        if req.sent_from_peer && !self.is_leader() {
            return Err(CoordError::RedirectOnlyOnce);
        }
        let mut records = HashMap::with_capacity(req.keys.len());
        for key in req.keys {
            let record = self.local.get(&key)?;
            records.insert(key, record);
        }
        Ok(QueryBeatsResponse { records })
    }

    pub fn handle_delete(&self, req: DeleteBeatsRequest) -> Result<(), CoordError> {
        self.ensure_open()?;
        if req.sent_from_peer && !self.is_leader() {
            return Err(CoordError::RedirectOnlyOnce);
        }
        for key in req.keys {
            self.local.del(&key)?;
        }
        Ok(())
    }

    pub fn beat_count(&self) -> usize {
        self.local.storage().len()
    }

    /// Stops serving: closes the remote channel and fails subsequent calls
    /// with `PeerClosed`. The event subscription ends when its task sees
    /// the destroyed flag or the hub shuts down.
    pub async fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        if let Some(remote) = self.remote.write().await.take() {
            remote.close();
        }
        self.local.close();
    }
}

fn read_to_query(server: String, record: ReadBeatRecord) -> QueryResponse {
    match record.record {
        Some(beat) => QueryResponse {
            server,
            last_heartbeat_sec: beat.cur_time_sec,
            count: beat.count,
            exists: record.exist,
        },
        None => QueryResponse {
            server,
            last_heartbeat_sec: 0,
            count: 0,
            exists: false,
        },
    }
}

/// Background sweeper: walks health-check-enabled instances, evaluates each
/// through the checker, and applies state flips to the store, emitting
/// exactly one transition event per flip.
pub fn spawn_expiry_sweeper(
    checker: Arc<LeaderHealthChecker>,
    caches: Arc<CacheSet>,
    store: Arc<dyn Store>,
    hub: EventHub,
    conf: HealthCheckConfig,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut applied: HashMap<String, bool> = HashMap::new();
        let mut ticker =
            tokio::time::interval(Duration::from_secs(conf.sweep_interval_secs.max(1)));
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    sweep_once(&checker, &caches, &store, &hub, &conf, &mut applied).await;
                }
            }
        }
        info!("health expiry sweeper stopped");
    })
}

async fn sweep_once(
    checker: &LeaderHealthChecker,
    caches: &CacheSet,
    store: &Arc<dyn Store>,
    hub: &EventHub,
    conf: &HealthCheckConfig,
    applied: &mut HashMap<String, bool>,
) {
    let instances = caches.instance.health_checked_instances();
    applied.retain(|id, _| instances.iter().any(|ins| ins.id == *id));

    for instance in instances {
        let ttl = instance
            .health_check
            .as_ref()
            .map(|check| HealthCheck::normalized_ttl(check.ttl_secs))
            .unwrap_or(common::api::DEFAULT_HEALTH_CHECK_TTL_SECS) as i64;
        let expire = ttl.max(conf.expire_duration_secs as i64);
        let request = CheckRequest {
            instance_id: instance.id.clone(),
            healthy: instance.healthy,
            expire_duration_sec: expire,
            cur_time_sec: now_sec(),
        };
        let response = match checker.check(request).await {
            Ok(response) => response,
            Err(err) => {
                warn!(%err, instance_id = %instance.id, "health check failed");
                continue;
            }
        };
        if response.stay_unchanged || response.healthy == instance.healthy {
            continue;
        }
        // The cache may lag the store write by one refresh tick; dedupe so
        // one logical transition fires one event.
        if applied.get(&instance.id) == Some(&response.healthy) {
            continue;
        }
        applied.insert(instance.id.clone(), response.healthy);
        set_instance_health_status(store, hub, instance, response.healthy).await;
    }
}

async fn set_instance_health_status(
    store: &Arc<dyn Store>,
    hub: &EventHub,
    mut instance: Instance,
    healthy: bool,
) {
    instance.healthy = healthy;
    instance.revision = new_revision();
    if let Err(err) = store.update_instance(instance.clone()).await {
        error!(%err, instance_id = %instance.id, "persist health transition");
        return;
    }
    metrics::counter!(
        "healthcheck_transitions_total",
        "to" => if healthy { "healthy" } else { "unhealthy" }
    )
    .increment(1);
    let event_type = if healthy {
        InstanceEventType::TurnHealth
    } else {
        InstanceEventType::TurnUnHealth
    };
    let event = InstanceEvent {
        id: instance.id.clone(),
        namespace: instance.namespace.clone(),
        service: instance.service.clone(),
        event_type,
        create_time: Utc::now(),
        metadata: HashMap::new(),
        instance,
    };
    if let Err(err) = hub.publish(INSTANCE_EVENT_TOPIC, event) {
        warn!(%err, "publish health transition event");
    }
}
