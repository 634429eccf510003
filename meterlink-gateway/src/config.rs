use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use color_eyre::eyre::eyre;
use meterlink_core::Protocol;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub uplink: UplinkConfig,
    pub driver: DriverConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub collection: CollectionConfig,
    /// Devices seeded into the store at startup.
    #[serde(default)]
    pub devices: Vec<DeviceSeed>,
}

#[derive(Debug, Deserialize)]
pub struct GatewayConfig {
    /// Gateway ID (ULID format)
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address for the status HTTP server to listen on
    pub http_addr: SocketAddr,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    Memory,
    Sqlite { path: PathBuf },
}

#[derive(Debug, Deserialize)]
pub struct UplinkConfig {
    /// Base URL of the central system, e.g. `https://central.example/api`
    pub base_url: String,
    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Bearer token sent with every request
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DriverConfig {
    /// Simulated meters; every configured device answers.
    Mock,
    /// Real Modbus TCP devices.
    Modbus,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum live connections per protocol pool
    pub max_connections: usize,
    /// Idle connections older than this are closed
    pub idle_timeout_secs: u64,
    /// How long `acquire` may wait for a free connection, in milliseconds
    pub acquire_timeout_ms: u64,
    /// Interval between liveness probes of idle connections
    pub health_check_interval_secs: u64,
    /// Timeout for establishing a device session, in milliseconds
    pub connect_timeout_ms: u64,
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            idle_timeout_secs: 300,
            acquire_timeout_ms: 10_000,
            health_check_interval_secs: 60,
            connect_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Add up to 10% random jitter to each delay
    pub jitter_enabled: bool,
    /// Consecutive failed operations before a device's circuit opens
    pub circuit_breaker_threshold: u32,
    /// Cooldown before an open circuit lets a trial call through
    pub circuit_breaker_timeout_secs: u64,
    /// Retry contexts untouched for this long are purged
    pub stale_context_secs: u64,
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn circuit_breaker_timeout(&self) -> Duration {
        Duration::from_secs(self.circuit_breaker_timeout_secs)
    }

    pub fn stale_context_after(&self) -> Duration {
        Duration::from_secs(self.stale_context_secs)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter_enabled: true,
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout_secs: 60,
            stale_context_secs: 300,
        }
    }
}

/// Initial chunk size for a meter that has not been read yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum InitialBatchSize {
    Size(usize),
    All(AllRegisters),
}

/// The literal `"all"`: read every register in one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllRegisters {
    All,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub initial_batch_size: InitialBatchSize,
    pub min_batch_size: usize,
    /// Factor applied to the chunk size on timeout, in (0, 1)
    pub reduction_factor: f64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            initial_batch_size: InitialBatchSize::All(AllRegisters::All),
            min_batch_size: 1,
            reduction_factor: 0.5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Readings per upload batch
    pub batch_size: usize,
    /// Quick retries of one upload call before the attempt counts as failed
    pub max_retries: u32,
    /// Regular interval between scheduled uploads
    pub upload_interval_secs: u64,
    pub connectivity_check_interval_secs: u64,
    /// Timeout of the reachability probe
    pub connectivity_timeout_secs: u64,
}

impl UploadConfig {
    pub fn upload_interval(&self) -> Duration {
        Duration::from_secs(self.upload_interval_secs)
    }

    pub fn connectivity_check_interval(&self) -> Duration {
        Duration::from_secs(self.connectivity_check_interval_secs)
    }

    pub fn connectivity_timeout(&self) -> Duration {
        Duration::from_secs(self.connectivity_timeout_secs)
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_retries: 3,
            upload_interval_secs: 60,
            connectivity_check_interval_secs: 30,
            connectivity_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    /// Interval between collection cycles
    pub poll_interval_secs: u64,
    /// Interval between device registry reloads
    pub registry_refresh_secs: u64,
    /// Timeout of a single register read, in milliseconds
    pub device_timeout_ms: u64,
    /// Synchronized readings older than this are purged from the store
    pub retention_hours: u64,
}

impl CollectionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn registry_refresh(&self) -> Duration {
        Duration::from_secs(self.registry_refresh_secs)
    }

    pub fn device_timeout(&self) -> Duration {
        Duration::from_millis(self.device_timeout_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours * 3600)
    }
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            registry_refresh_secs: 300,
            device_timeout_ms: 3_000,
            retention_hours: 72,
        }
    }
}

/// A device declared in the configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceSeed {
    /// Meter ID (ULID format)
    pub id: String,
    pub name: String,
    pub host: String,
    #[serde(default = "default_modbus_port")]
    pub port: u16,
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    #[serde(default = "default_protocol")]
    pub protocol: Protocol,
    /// Point map: `{ point_name = { address = 0, count = 2, unit = "kWh" } }`
    pub points: serde_json::Value,
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_modbus_port() -> u16 {
    502
}

fn default_unit_id() -> u8 {
    1
}

fn default_protocol() -> Protocol {
    Protocol::ModbusTcp
}

impl Config {
    pub fn load(path: &Path) -> color_eyre::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> color_eyre::Result<()> {
        if self.pool.max_connections == 0 {
            return Err(eyre!("pool.max_connections must be at least 1"));
        }
        if self.pool.idle_timeout_secs == 0 {
            return Err(eyre!("pool.idle_timeout_secs must be positive"));
        }
        if !(self.batch.reduction_factor > 0.0 && self.batch.reduction_factor < 1.0) {
            return Err(eyre!(
                "batch.reduction_factor must be in (0, 1), got {}",
                self.batch.reduction_factor
            ));
        }
        if self.batch.min_batch_size == 0 {
            return Err(eyre!("batch.min_batch_size must be at least 1"));
        }
        if let InitialBatchSize::Size(0) = self.batch.initial_batch_size {
            return Err(eyre!("batch.initial_batch_size must be at least 1"));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(eyre!("retry.backoff_multiplier must be >= 1.0"));
        }
        if self.retry.circuit_breaker_threshold == 0 {
            return Err(eyre!("retry.circuit_breaker_threshold must be at least 1"));
        }
        if self.upload.batch_size == 0 {
            return Err(eyre!("upload.batch_size must be at least 1"));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig {
                id: "01JJNQ1KQCNZ8X9PQRV5ABCD12".to_string(),
            },
            server: ServerConfig {
                http_addr: SocketAddr::from(([0, 0, 0, 0], 8081)),
            },
            storage: StorageConfig::Memory,
            uplink: UplinkConfig {
                base_url: "http://127.0.0.1:8080/api".to_string(),
                request_timeout_secs: default_request_timeout_secs(),
                api_key: None,
            },
            driver: DriverConfig::Mock,
            pool: PoolConfig::default(),
            retry: RetryConfig::default(),
            batch: BatchConfig::default(),
            upload: UploadConfig::default(),
            collection: CollectionConfig::default(),
            devices: Vec::new(),
        }
    }
}
