//! Follower-side behavior of the leader health checker against a mocked
//! leader endpoint: forwarding, redial suppression, and version-fenced
//! dial retries.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use httpmock::Method::{GET, POST};
use httpmock::MockServer;
use registry::config::{BatchConfig, LeaderCheckerConfig};
use registry::eventbus::EventHub;
use registry::healthcheck::{LeaderHealthChecker, ReportRequest};
use registry::store::memory::MemoryStore;
use registry::store::{Store, ELECTION_KEY_SELF_SERVICE_CHECKER};
use serde_json::json;

fn checker_conf() -> LeaderCheckerConfig {
    LeaderCheckerConfig {
        solt_num: 8,
        stream_num: 2,
        batch: BatchConfig {
            queue_size: 256,
            wait_time_ms: 10,
            max_batch_count: 32,
            concurrency: 2,
        },
    }
}

struct FollowerHarness {
    checker: Arc<LeaderHealthChecker>,
    store: MemoryStore,
}

/// Builds a checker whose peer channel points at the mock leader, without
/// an initial election so the test controls every transition.
async fn follower_harness(leader: &MockServer) -> FollowerHarness {
    let hub = EventHub::new();
    let store = MemoryStore::new(hub.clone(), "127.0.0.1");
    let checker = LeaderHealthChecker::new(checker_conf(), "127.0.0.1", leader.port());
    let dyn_store: Arc<dyn Store> = Arc::new(store.clone());
    // The memory store elects this node leader on start; each test then
    // demotes it by publishing its own leader-change events.
    checker.start(&hub, &dyn_store).await.expect("start checker");
    tokio::time::sleep(Duration::from_millis(50)).await;
    FollowerHarness { checker, store }
}

fn mock_leader_channel(leader: &MockServer) -> (httpmock::Mock<'_>, httpmock::Mock<'_>) {
    let ping = leader.mock(|when, then| {
        when.method(GET).path("/checker/v1/ping");
        then.status(200)
            .json_body(json!({"leader": true, "initialized": true}));
    });
    let replicate = leader.mock(|when, then| {
        when.method(POST).path("/checker/v1/replicate");
        then.status(200).json_body(json!({"code": 200000}));
    });
    (ping, replicate)
}

#[tokio::test]
async fn follower_forwards_reports_to_the_leader() {
    let leader = MockServer::start();
    let (ping, replicate) = mock_leader_channel(&leader);
    let now = Utc::now().timestamp();
    let query = leader.mock(|when, then| {
        when.method(POST).path("/checker/v1/query");
        then.status(200).json_body(json!({
            "records": {
                "i1": {
                    "record": {
                        "key": "i1",
                        "server_host": "127.0.0.1",
                        "cur_time_sec": now,
                        "count": 3,
                    },
                    "exist": true,
                }
            }
        }));
    });

    let harness = follower_harness(&leader).await;
    harness
        .store
        .publish_leader_change(ELECTION_KEY_SELF_SERVICE_CHECKER, false, "127.0.0.1");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!harness.checker.is_leader());
    assert!(harness.checker.is_initialized());
    ping.assert();

    harness
        .checker
        .report(
            false,
            ReportRequest {
                instance_id: "i1".to_string(),
                cur_time_sec: now,
                count: 3,
            },
        )
        .await
        .expect("forwarded report");
    replicate.assert();

    let response = harness
        .checker
        .query(false, "i1")
        .await
        .expect("forwarded query");
    assert!(response.exists);
    assert_eq!(response.last_heartbeat_sec, now);
    query.assert();

    // Local slots stay empty on a follower.
    assert_eq!(harness.checker.beat_count(), 0);
}

#[tokio::test]
async fn unchanged_leader_host_does_not_redial() {
    let leader = MockServer::start();
    let (ping, _replicate) = mock_leader_channel(&leader);

    let harness = follower_harness(&leader).await;
    harness
        .store
        .publish_leader_change(ELECTION_KEY_SELF_SERVICE_CHECKER, false, "127.0.0.1");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(ping.hits(), 1);

    // The same leader host arrives again: no new channel is dialed.
    harness
        .store
        .publish_leader_change(ELECTION_KEY_SELF_SERVICE_CHECKER, false, "127.0.0.1");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(ping.hits(), 1, "unchanged leader must not be re-dialed");
    assert!(harness.checker.is_initialized());
}

#[tokio::test]
async fn failed_dial_retry_is_fenced_by_leader_version() {
    let leader = MockServer::start();
    let ping = leader.mock(|when, then| {
        when.method(GET).path("/checker/v1/ping");
        then.status(500);
    });

    let harness = follower_harness(&leader).await;
    harness
        .store
        .publish_leader_change(ELECTION_KEY_SELF_SERVICE_CHECKER, false, "127.0.0.1");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(ping.hits(), 1);
    assert!(!harness.checker.is_initialized(), "failed dial stays uninitialized");

    // A newer transition supersedes the pending retry.
    harness
        .store
        .publish_leader_change(ELECTION_KEY_SELF_SERVICE_CHECKER, true, "127.0.0.1");
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(harness.checker.is_leader());
    assert_eq!(
        ping.hits(),
        1,
        "obsolete retry must be discarded by the version fence"
    );
}

#[tokio::test]
async fn empty_leader_host_waits_for_the_next_event() {
    let leader = MockServer::start();
    let (ping, _replicate) = mock_leader_channel(&leader);

    let harness = follower_harness(&leader).await;
    harness
        .store
        .publish_leader_change(ELECTION_KEY_SELF_SERVICE_CHECKER, false, "");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!harness.checker.is_initialized());
    assert_eq!(ping.hits(), 0);

    harness
        .store
        .publish_leader_change(ELECTION_KEY_SELF_SERVICE_CHECKER, false, "127.0.0.1");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(harness.checker.is_initialized());
    assert_eq!(ping.hits(), 1);
}
