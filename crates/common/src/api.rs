//! Shared API DTOs used by the registry core, its protocol adapters, and the
//! test suites.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Default heartbeat TTL applied when a request carries none or an
/// out-of-range value.
pub const DEFAULT_HEALTH_CHECK_TTL_SECS: u32 = 5;

/// Largest accepted heartbeat TTL.
pub const MAX_HEALTH_CHECK_TTL_SECS: u32 = 60;

/// Event bus topic carrying [`InstanceEvent`]s.
pub const INSTANCE_EVENT_TOPIC: &str = "instance-event";

/// Event bus topic carrying [`LeaderChangeEvent`]s.
pub const LEADER_CHANGE_EVENT_TOPIC: &str = "leader-change-event";

/// Event bus topic for service create/delete notifications.
pub const SERVICE_EVENT_TOPIC: &str = "service-event";

/// Event bus topic for config-file pushes (owned by the config subsystem).
pub const CONFIG_FILE_EVENT_TOPIC: &str = "config-file-event";

/// Closed result-code enumeration shared by every API surface.
///
/// The HTTP status of a code is `wire_code / 1000`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ApiCode {
    ExecuteSuccess,
    DataNoChange,
    NoNeedUpdate,
    EmptyRequest,
    EmptyQueryParameter,
    InvalidParameter,
    BatchSizeOverLimit,
    InvalidNamespaceName,
    InvalidServiceName,
    InvalidInstanceId,
    InvalidInstanceHost,
    InvalidInstancePort,
    InvalidMetadata,
    NotFoundService,
    NotFoundInstance,
    ExistedResource,
    NotAllowedAccess,
    IpRateLimit,
    ApiRateLimit,
    InstanceTooManyRequests,
    StoreLayerException,
    ExecuteException,
    ClientApiNotOpen,
}

impl ApiCode {
    /// Stable numeric code carried on the wire.
    pub fn wire_code(&self) -> u32 {
        match self {
            ApiCode::ExecuteSuccess => 200000,
            ApiCode::DataNoChange => 200001,
            ApiCode::NoNeedUpdate => 200002,
            ApiCode::EmptyRequest => 400001,
            ApiCode::EmptyQueryParameter => 400002,
            ApiCode::InvalidParameter => 400003,
            ApiCode::BatchSizeOverLimit => 400004,
            ApiCode::InvalidNamespaceName => 400110,
            ApiCode::InvalidServiceName => 400201,
            ApiCode::InvalidInstanceId => 400301,
            ApiCode::InvalidInstanceHost => 400302,
            ApiCode::InvalidInstancePort => 400303,
            ApiCode::InvalidMetadata => 400304,
            ApiCode::NotFoundService => 404001,
            ApiCode::NotFoundInstance => 404002,
            ApiCode::ExistedResource => 409001,
            ApiCode::NotAllowedAccess => 403001,
            ApiCode::IpRateLimit => 429001,
            ApiCode::ApiRateLimit => 429002,
            ApiCode::InstanceTooManyRequests => 429003,
            ApiCode::StoreLayerException => 500001,
            ApiCode::ExecuteException => 500002,
            ApiCode::ClientApiNotOpen => 501001,
        }
    }

    /// HTTP status the code maps to.
    pub fn http_status(&self) -> u16 {
        (self.wire_code() / 1000) as u16
    }

    /// Whether the code reports a successful (2xx) outcome.
    pub fn is_success(&self) -> bool {
        self.http_status() < 300
    }
}

/// `(namespace, name)` pair identifying a service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ServiceKey {
    pub namespace: String,
    pub name: String,
}

impl ServiceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.namespace, self.name)
    }
}

/// Registered service row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Service {
    pub id: String,
    pub namespace: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub business: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub meta: HashMap<String, String>,
    /// Target service id when this row is an alias. An alias never owns
    /// instances; resolution dereferences exactly once.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reference: String,
    pub revision: String,
    pub ctime: DateTime<Utc>,
    pub mtime: DateTime<Utc>,
}

impl Service {
    pub fn is_alias(&self) -> bool {
        !self.reference.is_empty()
    }

    pub fn key(&self) -> ServiceKey {
        ServiceKey::new(self.namespace.clone(), self.name.clone())
    }
}

/// Health check kind attached to an instance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheckKind {
    #[default]
    Heartbeat,
}

/// Heartbeat health-check settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthCheck {
    #[serde(default)]
    pub kind: HealthCheckKind,
    pub ttl_secs: u32,
}

impl HealthCheck {
    /// Clamps the TTL into `[1, 60]`, falling back to the system default.
    pub fn normalized_ttl(ttl_secs: u32) -> u32 {
        if ttl_secs == 0 || ttl_secs > MAX_HEALTH_CHECK_TTL_SECS {
            DEFAULT_HEALTH_CHECK_TTL_SECS
        } else {
            ttl_secs
        }
    }
}

/// Geographic placement of an instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Location {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub region: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub zone: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub campus: String,
}

impl Location {
    pub fn is_empty(&self) -> bool {
        self.region.is_empty() && self.zone.is_empty() && self.campus.is_empty()
    }
}

/// Service instance row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Instance {
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_id: String,
    pub namespace: String,
    pub service: String,
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub vpc_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    pub weight: u32,
    pub priority: u32,
    pub healthy: bool,
    pub isolate: bool,
    pub enable_health_check: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheck>,
    #[serde(default, skip_serializing_if = "Location::is_empty")]
    pub location: Location,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub logic_set: String,
    pub revision: String,
    pub mtime: DateTime<Utc>,
}

impl Instance {
    pub fn key(&self) -> ServiceKey {
        ServiceKey::new(self.namespace.clone(), self.service.clone())
    }
}

/// Derives the deterministic instance id from the identifying tetrad.
///
/// The id is the first 32 hex characters of
/// `sha1("{namespace}:{service}:{host}:{port}")`.
pub fn instance_id(namespace: &str, service: &str, host: &str, port: u16) -> String {
    let mut hasher = Sha1::new();
    hasher.update(format!("{namespace}:{service}:{host}:{port}").as_bytes());
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(40);
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex.truncate(32);
    hex
}

/// Fresh opaque revision value. Equal revisions imply identical content;
/// every mutation must allocate a new one.
pub fn new_revision() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Write-side instance request. Fields are optional so update handlers can
/// distinguish "absent" from "set to the default".
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InstanceRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vpc_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthy: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolate: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_health_check: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheck>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logic_set: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_token: Option<String>,
}

impl InstanceRequest {
    /// Convenience constructor for the identifying tetrad.
    pub fn tetrad(
        namespace: impl Into<String>,
        service: impl Into<String>,
        host: impl Into<String>,
        port: u32,
    ) -> Self {
        Self {
            namespace: Some(namespace.into()),
            service: Some(service.into()),
            host: Some(host.into()),
            port: Some(port),
            ..Self::default()
        }
    }
}

/// Kinds of instance lifecycle events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InstanceEventType {
    Online,
    Offline,
    Update,
    TurnHealth,
    TurnUnHealth,
    OpenIsolate,
    CloseIsolate,
}

/// Event published on [`INSTANCE_EVENT_TOPIC`] after every instance mutation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceEvent {
    pub id: String,
    pub namespace: String,
    pub service: String,
    pub instance: Instance,
    pub event_type: InstanceEventType,
    pub create_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

/// Event published on [`LEADER_CHANGE_EVENT_TOPIC`] by the store's external
/// leader election.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaderChangeEvent {
    pub key: String,
    pub leader: bool,
    pub leader_host: String,
}

/// Immutable discovery snapshot handed to foreign-protocol bridges.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfo {
    pub name: String,
    pub group_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub clusters: String,
    pub hosts: Vec<Instance>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub checksum: String,
    pub cache_millis: i64,
    pub last_ref_time: i64,
    pub reach_protection_threshold: bool,
}

impl ServiceInfo {
    pub fn empty(name: impl Into<String>, group_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group_name: group_name.into(),
            clusters: String::new(),
            hosts: Vec::new(),
            checksum: String::new(),
            cache_millis: 1000,
            last_ref_time: 0,
            reach_protection_threshold: false,
        }
    }
}
