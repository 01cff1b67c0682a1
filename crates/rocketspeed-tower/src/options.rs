// Tower configuration sourced from defaults, environment variables and an
// optional YAML override file.
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::io::ErrorKind;
use std::time::Duration;

const DEFAULT_NUM_ROOMS: usize = 1;
const DEFAULT_READERS_PER_ROOM: usize = 2;
const DEFAULT_MAX_SUBSCRIPTION_LAG: u64 = 10_000;
const DEFAULT_STORAGE_TO_ROOM_QUEUE_SIZE: usize = 1_000;
const DEFAULT_ROOM_TO_CLIENT_QUEUE_SIZE: usize = 1_000;
const DEFAULT_MAX_FIND_TIME_REQUESTS: usize = 100;
const DEFAULT_CACHE_SIZE: usize = 0;
const DEFAULT_CACHE_BLOCK_SIZE: usize = 1_024;
const DEFAULT_BLOOM_BITS_PER_MSG: usize = 10;
const DEFAULT_TIMER_INTERVAL_MS: u64 = 100;
const DEFAULT_MIN_READER_RESTART_MS: u64 = 30_000;
const DEFAULT_MAX_READER_RESTART_MS: u64 = 60_000;
const DEFAULT_FLOW_BLOCKED_WARN_MS: u64 = 1_000;

/// Control tower configuration.
///
/// ```
/// use rocketspeed_tower::TowerOptions;
///
/// let options = TowerOptions::default();
/// assert_eq!(options.readers_per_room, 2);
/// assert_eq!(options.max_subscription_lag, 10_000);
/// ```
#[derive(Debug, Clone)]
pub struct TowerOptions {
    // Worker (room) count; each log is owned by exactly one room.
    pub num_rooms: usize,
    // Max concurrent log readers per room.
    pub readers_per_room: usize,
    // Bump threshold in sequence numbers.
    pub max_subscription_lag: u64,
    // Queue size storage -> room.
    pub storage_to_room_queue_size: usize,
    // Queue size room -> transport.
    pub room_to_client_queue_size: usize,
    // Concurrent find-latest-seqno calls per room.
    pub max_find_time_requests: usize,
    // Cache bytes per room; 0 disables the cache.
    pub cache_size: usize,
    // Records per cache block.
    pub cache_block_size: usize,
    // Bloom filter bits per record in a block.
    pub bloom_bits_per_msg: usize,
    // Admit records from system namespaces into the cache.
    pub cache_data_from_system_namespaces: bool,
    // Tick period for time-based processing.
    pub timer_interval: Duration,
    // Reader restart jitter bounds.
    pub min_reader_restart_duration: Duration,
    pub max_reader_restart_duration: Duration,
    // Warn when a source stays blocked longer than this.
    pub flow_blocked_warn_duration: Duration,
}

impl Default for TowerOptions {
    fn default() -> Self {
        Self {
            num_rooms: DEFAULT_NUM_ROOMS,
            readers_per_room: DEFAULT_READERS_PER_ROOM,
            max_subscription_lag: DEFAULT_MAX_SUBSCRIPTION_LAG,
            storage_to_room_queue_size: DEFAULT_STORAGE_TO_ROOM_QUEUE_SIZE,
            room_to_client_queue_size: DEFAULT_ROOM_TO_CLIENT_QUEUE_SIZE,
            max_find_time_requests: DEFAULT_MAX_FIND_TIME_REQUESTS,
            cache_size: DEFAULT_CACHE_SIZE,
            cache_block_size: DEFAULT_CACHE_BLOCK_SIZE,
            bloom_bits_per_msg: DEFAULT_BLOOM_BITS_PER_MSG,
            cache_data_from_system_namespaces: false,
            timer_interval: Duration::from_millis(DEFAULT_TIMER_INTERVAL_MS),
            min_reader_restart_duration: Duration::from_millis(DEFAULT_MIN_READER_RESTART_MS),
            max_reader_restart_duration: Duration::from_millis(DEFAULT_MAX_READER_RESTART_MS),
            flow_blocked_warn_duration: Duration::from_millis(DEFAULT_FLOW_BLOCKED_WARN_MS),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TowerOptionsOverride {
    num_rooms: Option<usize>,
    readers_per_room: Option<usize>,
    max_subscription_lag: Option<u64>,
    storage_to_room_queue_size: Option<usize>,
    room_to_client_queue_size: Option<usize>,
    max_find_time_requests: Option<usize>,
    cache_size: Option<usize>,
    cache_block_size: Option<usize>,
    bloom_bits_per_msg: Option<usize>,
    cache_data_from_system_namespaces: Option<bool>,
    timer_interval_ms: Option<u64>,
    min_reader_restart_ms: Option<u64>,
    max_reader_restart_ms: Option<u64>,
    flow_blocked_warn_ms: Option<u64>,
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|value| value.parse().ok())
}

impl TowerOptions {
    /// Defaults overridden by `ROCKETSPEED_*` environment variables.
    pub fn from_env() -> Self {
        let mut options = Self::default();
        if let Some(value) = env_parse("ROCKETSPEED_NUM_ROOMS") {
            options.num_rooms = value;
        }
        if let Some(value) = env_parse("ROCKETSPEED_READERS_PER_ROOM") {
            options.readers_per_room = value;
        }
        if let Some(value) = env_parse("ROCKETSPEED_MAX_SUBSCRIPTION_LAG") {
            options.max_subscription_lag = value;
        }
        if let Some(value) = env_parse("ROCKETSPEED_STORAGE_TO_ROOM_QUEUE_SIZE") {
            options.storage_to_room_queue_size = value;
        }
        if let Some(value) = env_parse("ROCKETSPEED_ROOM_TO_CLIENT_QUEUE_SIZE") {
            options.room_to_client_queue_size = value;
        }
        if let Some(value) = env_parse("ROCKETSPEED_MAX_FIND_TIME_REQUESTS") {
            options.max_find_time_requests = value;
        }
        if let Some(value) = env_parse("ROCKETSPEED_CACHE_SIZE") {
            options.cache_size = value;
        }
        if let Some(value) = env_parse("ROCKETSPEED_CACHE_BLOCK_SIZE") {
            options.cache_block_size = value;
        }
        if let Some(value) = env_parse("ROCKETSPEED_BLOOM_BITS_PER_MSG") {
            options.bloom_bits_per_msg = value;
        }
        if let Ok(value) = std::env::var("ROCKETSPEED_CACHE_SYSTEM_NAMESPACES") {
            options.cache_data_from_system_namespaces =
                matches!(value.as_str(), "1" | "true" | "yes");
        }
        if let Some(value) = env_parse("ROCKETSPEED_TIMER_INTERVAL_MS") {
            options.timer_interval = Duration::from_millis(value);
        }
        if let Some(value) = env_parse("ROCKETSPEED_MIN_READER_RESTART_MS") {
            options.min_reader_restart_duration = Duration::from_millis(value);
        }
        if let Some(value) = env_parse("ROCKETSPEED_MAX_READER_RESTART_MS") {
            options.max_reader_restart_duration = Duration::from_millis(value);
        }
        if let Some(value) = env_parse("ROCKETSPEED_FLOW_BLOCKED_WARN_MS") {
            options.flow_blocked_warn_duration = Duration::from_millis(value);
        }
        options
    }

    /// Environment defaults with a YAML file override when
    /// `ROCKETSPEED_TOWER_CONFIG` points at one.
    pub fn from_env_or_yaml() -> Result<Self> {
        let mut options = Self::from_env();
        let Some(config_path) = std::env::var("ROCKETSPEED_TOWER_CONFIG").ok() else {
            return Ok(options);
        };
        let contents = match fs::read_to_string(&config_path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(err)
                    .with_context(|| format!("read ROCKETSPEED_TOWER_CONFIG: {config_path}"));
            }
            Err(err) => {
                return Err(err).with_context(|| format!("read tower config: {config_path}"));
            }
        };
        let override_cfg: TowerOptionsOverride =
            serde_yaml::from_str(&contents).with_context(|| "parse tower config yaml")?;
        if let Some(value) = override_cfg.num_rooms {
            options.num_rooms = value;
        }
        if let Some(value) = override_cfg.readers_per_room {
            options.readers_per_room = value;
        }
        if let Some(value) = override_cfg.max_subscription_lag {
            options.max_subscription_lag = value;
        }
        if let Some(value) = override_cfg.storage_to_room_queue_size {
            options.storage_to_room_queue_size = value;
        }
        if let Some(value) = override_cfg.room_to_client_queue_size {
            options.room_to_client_queue_size = value;
        }
        if let Some(value) = override_cfg.max_find_time_requests {
            options.max_find_time_requests = value;
        }
        if let Some(value) = override_cfg.cache_size {
            options.cache_size = value;
        }
        if let Some(value) = override_cfg.cache_block_size {
            options.cache_block_size = value;
        }
        if let Some(value) = override_cfg.bloom_bits_per_msg {
            options.bloom_bits_per_msg = value;
        }
        if let Some(value) = override_cfg.cache_data_from_system_namespaces {
            options.cache_data_from_system_namespaces = value;
        }
        if let Some(value) = override_cfg.timer_interval_ms {
            options.timer_interval = Duration::from_millis(value);
        }
        if let Some(value) = override_cfg.min_reader_restart_ms {
            options.min_reader_restart_duration = Duration::from_millis(value);
        }
        if let Some(value) = override_cfg.max_reader_restart_ms {
            options.max_reader_restart_duration = Duration::from_millis(value);
        }
        if let Some(value) = override_cfg.flow_blocked_warn_ms {
            options.flow_blocked_warn_duration = Duration::from_millis(value);
        }
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.num_rooms > 0, "num_rooms must be positive");
        anyhow::ensure!(self.readers_per_room > 0, "readers_per_room must be positive");
        anyhow::ensure!(
            self.storage_to_room_queue_size > 0,
            "storage_to_room_queue_size must be positive"
        );
        anyhow::ensure!(
            self.room_to_client_queue_size > 0,
            "room_to_client_queue_size must be positive"
        );
        anyhow::ensure!(
            self.max_find_time_requests > 0,
            "max_find_time_requests must be positive"
        );
        anyhow::ensure!(self.cache_block_size > 0, "cache_block_size must be positive");
        anyhow::ensure!(
            self.min_reader_restart_duration <= self.max_reader_restart_duration,
            "reader restart bounds are inverted"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let options = TowerOptions::default();
        assert_eq!(options.readers_per_room, 2);
        assert_eq!(options.max_subscription_lag, 10_000);
        assert_eq!(options.storage_to_room_queue_size, 1_000);
        assert_eq!(options.room_to_client_queue_size, 1_000);
        assert_eq!(options.max_find_time_requests, 100);
        assert_eq!(options.cache_size, 0);
        assert_eq!(options.cache_block_size, 1_024);
        assert_eq!(options.bloom_bits_per_msg, 10);
        assert!(!options.cache_data_from_system_namespaces);
        assert_eq!(options.timer_interval, Duration::from_millis(100));
        assert_eq!(options.min_reader_restart_duration, Duration::from_secs(30));
        assert_eq!(options.max_reader_restart_duration, Duration::from_secs(60));
        options.validate().expect("defaults validate");
    }

    #[test]
    fn inverted_restart_bounds_are_rejected() {
        let mut options = TowerOptions::default();
        options.min_reader_restart_duration = Duration::from_secs(90);
        assert!(options.validate().is_err());
    }

    #[test]
    fn zero_rooms_are_rejected() {
        let mut options = TowerOptions::default();
        options.num_rooms = 0;
        assert!(options.validate().is_err());
    }
}
