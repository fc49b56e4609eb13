//! Configuration loading and validation.
//!
//! The TOML file mirrors the recognized option set: one `[engine]` block,
//! one `[broker]` block per pipeline (exactly one of `capacity` and
//! `max_size_bytes` selects the variant) and one `[persistence]` block.
//! Validation failures surface as `ConfigInvalid` before anything starts.

use primordia_error::{Error, ErrorKind};
use primordia_types::Topology;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

fn default_metrics_window() -> u32 {
    60
}

/// Broker sizing and receive tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Item capacity, selects the in-memory variant
    #[serde(default)]
    pub capacity: Option<usize>,
    /// Byte capacity, selects the journaled variant
    #[serde(default)]
    pub max_size_bytes: Option<u64>,
    /// Adaptive coalescing delay of the receive path
    #[serde(default)]
    pub coalescing_delay_ms: u64,
    /// Window of the throughput counters
    #[serde(default = "default_metrics_window")]
    pub metrics_window_seconds: u32,
}

impl BrokerConfig {
    fn validate(&self) -> Result<(), Error> {
        match (self.capacity, self.max_size_bytes) {
            (Some(_), Some(_)) => Err(ErrorKind::ConfigInvalid
                .other("broker: capacity and max_size_bytes are mutually exclusive")),
            (None, None) => Err(ErrorKind::ConfigInvalid
                .other("broker: one of capacity or max_size_bytes is required")),
            (Some(0), None) => {
                Err(ErrorKind::ConfigInvalid.other("broker: capacity must be positive"))
            }
            (None, Some(0)) => {
                Err(ErrorKind::ConfigInvalid.other("broker: max_size_bytes must be positive"))
            }
            _ => Ok(()),
        }
    }
}

/// Persistence loop sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Upper bound of chunks per drained batch
    pub max_batch_size: usize,
    /// Receive window timeout in seconds
    pub batch_timeout_seconds: u64,
}

impl PersistenceConfig {
    fn validate(&self) -> Result<(), Error> {
        if self.max_batch_size == 0 {
            return Err(ErrorKind::ConfigInvalid.other("persistence: max_batch_size must be > 0"));
        }
        if self.batch_timeout_seconds == 0 {
            return Err(
                ErrorKind::ConfigInvalid.other("persistence: batch_timeout_seconds must be > 0")
            );
        }
        Ok(())
    }
}

/// World shape and edge behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// Per-axis sizes
    pub shape: Vec<i32>,
    /// BOUNDED or TORUS
    pub topology: Topology,
}

/// One seeded organism.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrganismConfig {
    /// Path of the compiled program artifact, treated as an opaque blob
    pub program: PathBuf,
    /// Placement position, one component per axis
    pub placement_positions: Vec<i32>,
    /// Starting energy
    pub initial_energy: i64,
}

/// One registered plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Factory-table name
    pub name: String,
    /// Plugin-specific options, passed through opaquely
    #[serde(default)]
    pub options: serde_json::Value,
}

fn default_yield_interval() -> u64 {
    1024
}

/// Engine cadence, world and population.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Capture every n-th tick
    pub sampling_interval: u64,
    /// Accumulated delta cadence, in samples
    pub accumulated_delta_interval: u32,
    /// Snapshot cadence, in samples
    pub snapshot_interval: u32,
    /// Samples per chunk
    pub chunk_interval: u32,
    /// Seed of the deterministic random provider
    pub seed: i64,
    /// Ticks at which the engine parks itself
    #[serde(default)]
    pub pause_ticks: Vec<u64>,
    /// Scheduler yield cadence, in ticks
    #[serde(default = "default_yield_interval")]
    pub yield_interval: u64,
    /// The world
    pub environment: EnvironmentConfig,
    /// Seeded organisms
    #[serde(default)]
    pub organisms: Vec<OrganismConfig>,
    /// Registered plugins
    #[serde(default)]
    pub plugins: Vec<PluginConfig>,
}

impl EngineConfig {
    fn validate(&self) -> Result<(), Error> {
        if self.sampling_interval < 1 {
            return Err(ErrorKind::ConfigInvalid.other("engine: sampling_interval must be >= 1"));
        }
        if self.environment.shape.is_empty() {
            return Err(ErrorKind::ConfigInvalid.other("engine: environment.shape is empty"));
        }
        for organism in &self.organisms {
            if organism.placement_positions.len() != self.environment.shape.len() {
                return Err(ErrorKind::ConfigInvalid.other(format!(
                    "engine: placement {:?} does not match world rank {}",
                    organism.placement_positions,
                    self.environment.shape.len()
                )));
            }
        }
        Ok(())
    }
}

/// The whole recognized option set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Engine cadence, world and population
    pub engine: EngineConfig,
    /// Tick-data queue sizing
    pub broker: BrokerConfig,
    /// Persistence loop sizing
    pub persistence: PersistenceConfig,
}

impl AppConfig {
    /// Reads and validates a TOML config file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<AppConfig, Error> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ErrorKind::ConfigInvalid.other(format!("{}: {}", path.as_ref().display(), e))
        })?;
        let config: AppConfig = toml::from_str(&raw)
            .map_err(|e| ErrorKind::ConfigInvalid.other(format!("parse: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates every block.
    pub fn validate(&self) -> Result<(), Error> {
        self.engine.validate()?;
        self.broker.validate()?;
        self.persistence.validate()?;
        Ok(())
    }

    /// Applies `PRIMORDIA_*` environment overrides; the environment wins
    /// over the file, then the merged result is re-validated.
    pub fn apply_env_overrides(&mut self) -> Result<(), Error> {
        if let Some(capacity) = env_parse::<usize>("PRIMORDIA_BROKER_CAPACITY")? {
            self.broker.capacity = Some(capacity);
            self.broker.max_size_bytes = None;
        }
        if let Some(bytes) = env_parse::<u64>("PRIMORDIA_BROKER_MAX_SIZE_BYTES")? {
            self.broker.max_size_bytes = Some(bytes);
            self.broker.capacity = None;
        }
        if let Some(delay) = env_parse::<u64>("PRIMORDIA_BROKER_COALESCING_DELAY_MS")? {
            self.broker.coalescing_delay_ms = delay;
        }
        if let Some(size) = env_parse::<usize>("PRIMORDIA_PERSISTENCE_MAX_BATCH_SIZE")? {
            self.persistence.max_batch_size = size;
        }
        if let Some(timeout) = env_parse::<u64>("PRIMORDIA_PERSISTENCE_BATCH_TIMEOUT_SECONDS")? {
            self.persistence.batch_timeout_seconds = timeout;
        }
        self.validate()
    }

    /// Serializes the resolved configuration for the metadata record.
    pub fn resolved_json(&self) -> String {
        serde_json::to_string(self).expect("config serializes")
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>, Error>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| ErrorKind::ConfigInvalid.other(format!("{}={}: {}", key, raw, e))),
        Err(_) => Ok(None),
    }
}
