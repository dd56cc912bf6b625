//! Peers of the leader-follower checker.
//!
//! The local peer keeps beat records in a sharded map sized by `solt_num`
//! to bound lock contention; read and write paths hash to the same shard,
//! and a bulk clean swaps each shard's inner map instead of draining it.
//! The remote peer forwards over HTTP with writes and reads batched per
//! destination.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::batch::{BatchController, BatchHandler, CtrlConfig};
use crate::config::LeaderCheckerConfig;
use crate::error::CoordError;

/// One heartbeat record. Stored only in the leader's memory slots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BeatRecord {
    pub key: String,
    pub server_host: String,
    pub cur_time_sec: i64,
    pub count: u64,
}

/// Read view: `exist = false` when no record is stored for the key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadBeatRecord {
    #[serde(default)]
    pub record: Option<BeatRecord>,
    pub exist: bool,
}

// Wire bodies of the peer channel. The `sent_from_peer` marker is an
// explicit application-level field: a message carrying it must never be
// forwarded again.

#[derive(Debug, Serialize, Deserialize)]
pub struct ReplicateBeatsRequest {
    pub sent_from_peer: bool,
    pub records: Vec<BeatRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueryBeatsRequest {
    pub sent_from_peer: bool,
    pub keys: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueryBeatsResponse {
    pub records: HashMap<String, ReadBeatRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteBeatsRequest {
    pub sent_from_peer: bool,
    pub keys: Vec<String>,
}

/// Sharded beat record store.
pub struct BeatStore {
    shards: Vec<RwLock<HashMap<String, BeatRecord>>>,
}

impl BeatStore {
    pub fn new(solt_num: usize) -> Self {
        let solt_num = solt_num.max(1);
        let mut shards = Vec::with_capacity(solt_num);
        for _ in 0..solt_num {
            shards.push(RwLock::new(HashMap::new()));
        }
        Self { shards }
    }

    fn shard(&self, key: &str) -> &RwLock<HashMap<String, BeatRecord>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    pub fn put(&self, record: BeatRecord) {
        let mut shard = self.shard(&record.key).write().expect("beat shard poisoned");
        shard.insert(record.key.clone(), record);
    }

    pub fn get(&self, key: &str) -> ReadBeatRecord {
        let shard = self.shard(key).read().expect("beat shard poisoned");
        match shard.get(key) {
            Some(record) => ReadBeatRecord {
                record: Some(record.clone()),
                exist: true,
            },
            None => ReadBeatRecord {
                record: None,
                exist: false,
            },
        }
    }

    pub fn del(&self, key: &str) {
        let mut shard = self.shard(key).write().expect("beat shard poisoned");
        shard.remove(key);
    }

    /// Wipes every shard by swapping in a fresh inner map.
    pub fn clean(&self) {
        for shard in &self.shards {
            let mut guard = shard.write().expect("beat shard poisoned");
            *guard = HashMap::new();
        }
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.read().expect("beat shard poisoned").len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Leader-side peer: reads and writes hit the local slots directly.
pub struct LocalPeer {
    host: String,
    storage: Arc<BeatStore>,
    closed: AtomicBool,
}

impl LocalPeer {
    pub fn new(host: impl Into<String>, solt_num: usize) -> Self {
        Self {
            host: host.into(),
            storage: Arc::new(BeatStore::new(solt_num)),
            closed: AtomicBool::new(false),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn storage(&self) -> &Arc<BeatStore> {
        &self.storage
    }

    pub fn put(&self, record: BeatRecord) -> Result<(), CoordError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoordError::PeerClosed);
        }
        self.storage.put(record);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<ReadBeatRecord, CoordError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoordError::PeerClosed);
        }
        Ok(self.storage.get(key))
    }

    pub fn del(&self, key: &str) -> Result<(), CoordError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoordError::PeerClosed);
        }
        self.storage.del(key);
        Ok(())
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct RemoteChannel {
    client: reqwest::Client,
    base_url: String,
    closed: AtomicBool,
}

impl RemoteChannel {
    async fn replicate(&self, records: Vec<BeatRecord>) -> Result<(), CoordError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoordError::PeerClosed);
        }
        let body = ReplicateBeatsRequest {
            sent_from_peer: true,
            records,
        };
        let resp = self
            .client
            .post(format!("{}/checker/v1/replicate", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|err| CoordError::Transport(err.to_string()))?;
        if !resp.status().is_success() {
            return Err(CoordError::Transport(format!(
                "replicate returned {}",
                resp.status()
            )));
        }
        Ok(())
    }

    async fn query(&self, keys: Vec<String>) -> Result<QueryBeatsResponse, CoordError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoordError::PeerClosed);
        }
        let body = QueryBeatsRequest {
            sent_from_peer: true,
            keys,
        };
        let resp = self
            .client
            .post(format!("{}/checker/v1/query", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|err| CoordError::Transport(err.to_string()))?;
        if !resp.status().is_success() {
            return Err(CoordError::Transport(format!(
                "query returned {}",
                resp.status()
            )));
        }
        resp.json::<QueryBeatsResponse>()
            .await
            .map_err(|err| CoordError::Transport(err.to_string()))
    }

    async fn delete(&self, keys: Vec<String>) -> Result<(), CoordError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoordError::PeerClosed);
        }
        let body = DeleteBeatsRequest {
            sent_from_peer: true,
            keys,
        };
        let resp = self
            .client
            .post(format!("{}/checker/v1/delete", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|err| CoordError::Transport(err.to_string()))?;
        if !resp.status().is_success() {
            return Err(CoordError::Transport(format!(
                "delete returned {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

/// Follower-side peer: forwards to the leader over HTTP, with puts and gets
/// batched per destination.
pub struct RemotePeer {
    host: String,
    channel: Arc<RemoteChannel>,
    put_batch: BatchController<BeatRecord, ()>,
    get_batch: BatchController<String, ReadBeatRecord>,
}

impl RemotePeer {
    /// Dials the leader and verifies the channel with a ping.
    pub async fn connect(
        host: &str,
        port: u16,
        conf: &LeaderCheckerConfig,
    ) -> Result<Self, CoordError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|err| CoordError::Transport(err.to_string()))?;
        let base_url = format!("http://{host}:{port}");
        let channel = Arc::new(RemoteChannel {
            client,
            base_url: base_url.clone(),
            closed: AtomicBool::new(false),
        });

        let resp = channel
            .client
            .get(format!("{base_url}/checker/v1/ping"))
            .send()
            .await
            .map_err(|err| CoordError::Transport(err.to_string()))?;
        if !resp.status().is_success() {
            return Err(CoordError::Transport(format!(
                "leader ping returned {}",
                resp.status()
            )));
        }

        let batch_cfg = |label: &str| CtrlConfig {
            label: label.to_string(),
            queue_size: conf.batch.queue_size,
            wait_time: Duration::from_millis(conf.batch.wait_time_ms),
            max_batch_count: conf.batch.max_batch_count,
            concurrency: conf.stream_num.max(1),
        };

        let put_channel = Arc::clone(&channel);
        let put_handler: BatchHandler<BeatRecord, ()> = Arc::new(move |tasks| {
            let channel = Arc::clone(&put_channel);
            Box::pin(async move {
                let records: Vec<BeatRecord> =
                    tasks.iter().map(|task| task.param.clone()).collect();
                let result = channel.replicate(records).await;
                for task in tasks {
                    task.reply(result.clone().map_err(|err| {
                        crate::error::ApiError::new(
                            common::api::ApiCode::ExecuteException,
                            err.to_string(),
                        )
                    }));
                }
            })
        });

        let get_channel = Arc::clone(&channel);
        let get_handler: BatchHandler<String, ReadBeatRecord> = Arc::new(move |tasks| {
            let channel = Arc::clone(&get_channel);
            Box::pin(async move {
                let keys: Vec<String> = tasks.iter().map(|task| task.param.clone()).collect();
                match channel.query(keys).await {
                    Ok(mut resp) => {
                        for task in tasks {
                            match resp.records.remove(&task.param) {
                                Some(record) => task.reply(Ok(record)),
                                None => task.reply(Err(crate::error::ApiError::new(
                                    common::api::ApiCode::NotFoundInstance,
                                    "beat record not found",
                                ))),
                            }
                        }
                    }
                    Err(err) => {
                        warn!(%err, "remote beat query failed");
                        for task in tasks {
                            task.reply(Err(crate::error::ApiError::new(
                                common::api::ApiCode::ExecuteException,
                                err.to_string(),
                            )));
                        }
                    }
                }
            })
        });

        Ok(Self {
            host: host.to_string(),
            put_batch: BatchController::new(batch_cfg("beat-putter"), put_handler),
            get_batch: BatchController::new(batch_cfg("beat-getter"), get_handler),
            channel,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn is_closed(&self) -> bool {
        self.channel.closed.load(Ordering::SeqCst)
    }

    pub async fn put(&self, record: BeatRecord) -> Result<(), CoordError> {
        if self.is_closed() {
            return Err(CoordError::PeerClosed);
        }
        let future = self
            .put_batch
            .submit(record)
            .await
            .map_err(|err| CoordError::Transport(err.to_string()))?;
        future
            .wait()
            .await
            .map_err(|err| CoordError::Transport(err.to_string()))
    }

    pub async fn get(&self, key: &str) -> Result<ReadBeatRecord, CoordError> {
        if self.is_closed() {
            return Err(CoordError::PeerClosed);
        }
        let future = self
            .get_batch
            .submit(key.to_string())
            .await
            .map_err(|err| CoordError::Transport(err.to_string()))?;
        match future.wait().await {
            Ok(record) => Ok(record),
            Err(err) if err.code == common::api::ApiCode::NotFoundInstance => Ok(ReadBeatRecord {
                record: None,
                exist: false,
            }),
            Err(err) => Err(CoordError::Transport(err.to_string())),
        }
    }

    pub async fn del(&self, key: &str) -> Result<(), CoordError> {
        if self.is_closed() {
            return Err(CoordError::PeerClosed);
        }
        self.channel.delete(vec![key.to_string()]).await
    }

    pub fn close(&self) {
        self.channel.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beat_store_round_trip_and_clean() {
        let store = BeatStore::new(8);
        store.put(BeatRecord {
            key: "i1".to_string(),
            server_host: "127.0.0.1".to_string(),
            cur_time_sec: 100,
            count: 1,
        });
        let read = store.get("i1");
        assert!(read.exist);
        assert_eq!(read.record.expect("record").cur_time_sec, 100);
        assert!(!store.get("missing").exist);

        store.clean();
        assert!(store.is_empty());
        assert!(!store.get("i1").exist);
    }

    #[test]
    fn same_key_hits_same_shard_on_read_and_write() {
        let store = BeatStore::new(32);
        for i in 0..256 {
            let key = format!("instance-{i}");
            store.put(BeatRecord {
                key: key.clone(),
                server_host: "h".to_string(),
                cur_time_sec: i,
                count: 1,
            });
            assert!(store.get(&key).exist, "lost record for {key}");
        }
        assert_eq!(store.len(), 256);
    }

    #[test]
    fn closed_local_peer_rejects_operations() {
        let peer = LocalPeer::new("127.0.0.1", 4);
        peer.close();
        let err = peer
            .put(BeatRecord {
                key: "i1".to_string(),
                server_host: "h".to_string(),
                cur_time_sec: 1,
                count: 1,
            })
            .unwrap_err();
        assert_eq!(err, CoordError::PeerClosed);
        assert_eq!(peer.get("i1").unwrap_err(), CoordError::PeerClosed);
    }
}
