use serde::Deserialize;
use std::path::Path;

pub const ENV_PREFIX: &str = "REGISTRY";

fn available_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub metrics: MetricsConfig,
    pub conn_limit: ConnLimitConfig,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    pub health_check: HealthCheckConfig,
    pub async_register: AsyncRegisterConfig,
    pub cache: CacheConfig,
    pub instance_limit: InstanceLimitConfig,
    pub api_rate_limit: ApiRateLimitConfig,
    pub limits: LimitsConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Enforce policy checks on console (admin) APIs.
    pub console_open: bool,
    /// Enforce policy checks on client (data-plane) APIs.
    pub client_open: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Host advertised to peers for the follower→leader channel.
    pub advertised_host: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnLimitConfig {
    pub open_conn_limit: bool,
    pub max_conn_per_host: usize,
    pub max_conn_limit: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    pub cert_file: String,
    pub key_file: String,
    #[serde(default)]
    pub trusted_ca_file: Option<String>,
}

impl TlsConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        for (field, path) in [("tls.cert_file", &self.cert_file), ("tls.key_file", &self.key_file)]
        {
            if !Path::new(path).is_file() {
                anyhow::bail!("{field} does not exist: {path}");
            }
        }
        if let Some(ca) = &self.trusted_ca_file {
            if !Path::new(ca).is_file() {
                anyhow::bail!("tls.trusted_ca_file does not exist: {ca}");
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthCheckConfig {
    /// Seconds without a heartbeat before an instance turns unhealthy.
    #[serde(default = "default_expire_duration_secs")]
    pub expire_duration_secs: u64,
    /// Expiry sweep cadence.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    pub leader: LeaderCheckerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LeaderCheckerConfig {
    /// Beat store shard count.
    #[serde(default = "default_solt_num")]
    pub solt_num: usize,
    /// Follower→leader channel concurrency.
    #[serde(default = "default_stream_num")]
    pub stream_num: usize,
    pub batch: BatchConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    pub queue_size: usize,
    pub wait_time_ms: u64,
    pub max_batch_count: usize,
    pub concurrency: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AsyncRegisterConfig {
    pub enabled: bool,
    #[serde(default)]
    pub batch: Option<BatchConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    pub refresh_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstanceLimitConfig {
    /// Per-instance-id register/deregister allowance; 0 disables.
    pub rate_limit_per_minute: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiRateLimitConfig {
    /// Per raw URL path; 0 disables.
    pub per_minute: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    pub max_field_len: usize,
    pub max_metadata_count: usize,
    pub max_batch_size: usize,
}

fn default_expire_duration_secs() -> u64 {
    5
}

fn default_sweep_interval_secs() -> u64 {
    1
}

fn default_solt_num() -> usize {
    available_parallelism() * 16
}

fn default_stream_num() -> usize {
    available_parallelism()
}

pub fn load() -> anyhow::Result<AppConfig> {
    let env = config::Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .try_parsing(false);

    let builder = config::Config::builder()
        .add_source(config::File::with_name("registry").required(false))
        .add_source(env)
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.port", 8090)?
        .set_default("server.advertised_host", "127.0.0.1")?
        .set_default("metrics.host", "0.0.0.0")?
        .set_default("metrics.port", 9091)?
        .set_default("conn_limit.open_conn_limit", false)?
        .set_default("conn_limit.max_conn_per_host", 1024)?
        .set_default("conn_limit.max_conn_limit", 10240)?
        .set_default("health_check.expire_duration_secs", 5)?
        .set_default("health_check.sweep_interval_secs", 1)?
        .set_default("health_check.leader.solt_num", default_solt_num() as i64)?
        .set_default("health_check.leader.stream_num", default_stream_num() as i64)?
        .set_default("health_check.leader.batch.queue_size", 10240)?
        .set_default("health_check.leader.batch.wait_time_ms", 32)?
        .set_default("health_check.leader.batch.max_batch_count", 128)?
        .set_default("health_check.leader.batch.concurrency", 64)?
        .set_default("async_register.enabled", false)?
        .set_default("cache.refresh_interval_ms", 1000)?
        .set_default("instance_limit.rate_limit_per_minute", 0)?
        .set_default("api_rate_limit.per_minute", 0)?
        .set_default("limits.max_field_len", 128)?
        .set_default("limits.max_metadata_count", 64)?
        .set_default("limits.max_batch_size", 100)?
        .set_default("auth.console_open", false)?
        .set_default("auth.client_open", false)?;

    let cfg = builder.build()?;
    let app: AppConfig = cfg.try_deserialize()?;
    if let Some(tls) = &app.tls {
        tls.validate()?;
    }
    if app.health_check.expire_duration_secs == 0 {
        anyhow::bail!("health_check.expire_duration_secs must be > 0");
    }
    if app.cache.refresh_interval_ms == 0 {
        anyhow::bail!("cache.refresh_interval_ms must be > 0");
    }
    Ok(app)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_without_a_config_file() {
        let cfg = load().expect("config loads");
        assert_eq!(cfg.server.port, 8090);
        assert!(!cfg.async_register.enabled);
        assert_eq!(cfg.health_check.leader.solt_num, default_solt_num());
        assert_eq!(cfg.limits.max_batch_size, 100);
    }

    #[test]
    fn missing_tls_files_fail_validation() {
        let tls = TlsConfig {
            cert_file: "/nonexistent/cert.pem".to_string(),
            key_file: "/nonexistent/key.pem".to_string(),
            trusted_ca_file: None,
        };
        assert!(tls.validate().is_err());
    }
}
