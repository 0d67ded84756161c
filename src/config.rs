//! Persistent node configuration model and defaults.

use std::path::Path;
use std::time::Duration;

use log::{info, warn};

/// Root configuration persisted to `playnode.toml`.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Config {
    #[serde(default)]
    /// Node identity and backend selection.
    pub node: NodeConfig,
    #[serde(default)]
    /// State publication timing.
    pub sync: SyncConfig,
    #[serde(default)]
    /// Command delivery and dedup tuning.
    pub commands: CommandsConfig,
    #[serde(default)]
    /// Offline buffering and replay.
    pub offline: OfflineConfig,
    #[serde(default)]
    /// Liveness signal.
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    /// Log level and error-class suppression.
    pub logging: LoggingConfig,
}

/// Storage used for the shared state record and command log.
#[derive(Debug, Clone, Copy, serde::Deserialize, serde::Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct NodeConfig {
    /// Identity that scopes the state record and the command channel.
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub backend: BackendKind,
    /// SQLite file shared with remote consoles. Empty means the data directory default.
    #[serde(default)]
    pub database_path: String,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct SyncConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_min_write_spacing_ms")]
    pub min_write_spacing_ms: u64,
    /// Publication pause after applying a remote queue update.
    #[serde(default = "default_feedback_suppress_ms")]
    pub feedback_suppress_ms: u64,
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct CommandsConfig {
    #[serde(default = "default_command_ttl_secs")]
    pub command_ttl_secs: u64,
    #[serde(default = "default_poll_base_ms")]
    pub poll_base_ms: u64,
    #[serde(default = "default_poll_max_ms")]
    pub poll_max_ms: u64,
    #[serde(default = "default_processed_id_cap")]
    pub processed_id_cap: usize,
    #[serde(default = "default_processed_id_trim")]
    pub processed_id_trim: usize,
    #[serde(default = "default_inbound_queue_cap")]
    pub inbound_queue_cap: usize,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct OfflineConfig {
    #[serde(default = "default_buffer_cap")]
    pub buffer_cap: usize,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_heartbeat_interval_secs")]
    pub interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct LoggingConfig {
    /// One of `error`, `warn`, `info`, `debug`, `trace`.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_suppression_window_secs")]
    pub suppression_window_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            backend: BackendKind::Sqlite,
            database_path: String::new(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            min_write_spacing_ms: default_min_write_spacing_ms(),
            feedback_suppress_ms: default_feedback_suppress_ms(),
            startup_timeout_ms: default_startup_timeout_ms(),
        }
    }
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            command_ttl_secs: default_command_ttl_secs(),
            poll_base_ms: default_poll_base_ms(),
            poll_max_ms: default_poll_max_ms(),
            processed_id_cap: default_processed_id_cap(),
            processed_id_trim: default_processed_id_trim(),
            inbound_queue_cap: default_inbound_queue_cap(),
        }
    }
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            buffer_cap: default_buffer_cap(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_heartbeat_interval_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            suppression_window_secs: default_suppression_window_secs(),
        }
    }
}

impl SyncConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn min_write_spacing(&self) -> Duration {
        Duration::from_millis(self.min_write_spacing_ms)
    }

    pub fn feedback_suppress(&self) -> Duration {
        Duration::from_millis(self.feedback_suppress_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }
}

impl CommandsConfig {
    pub fn command_ttl_ms(&self) -> i64 {
        (self.command_ttl_secs as i64).saturating_mul(1_000)
    }
}

impl LoggingConfig {
    pub fn level_filter(&self) -> log::LevelFilter {
        match self.level.trim().to_ascii_lowercase().as_str() {
            "error" => log::LevelFilter::Error,
            "warn" => log::LevelFilter::Warn,
            "debug" => log::LevelFilter::Debug,
            "trace" => log::LevelFilter::Trace,
            _ => log::LevelFilter::Info,
        }
    }
}

fn default_node_id() -> String {
    "node-1".to_string()
}

fn default_debounce_ms() -> u64 {
    200
}

fn default_min_write_spacing_ms() -> u64 {
    100
}

fn default_feedback_suppress_ms() -> u64 {
    500
}

fn default_startup_timeout_ms() -> u64 {
    3_000
}

fn default_command_ttl_secs() -> u64 {
    30
}

fn default_poll_base_ms() -> u64 {
    2_000
}

fn default_poll_max_ms() -> u64 {
    30_000
}

fn default_processed_id_cap() -> usize {
    1_000
}

fn default_processed_id_trim() -> usize {
    500
}

fn default_inbound_queue_cap() -> usize {
    50
}

fn default_buffer_cap() -> usize {
    10
}

fn default_retry_base_ms() -> u64 {
    1_000
}

fn default_retry_max_ms() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_heartbeat_interval_secs() -> u64 {
    20
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_suppression_window_secs() -> u64 {
    30
}

/// Clamps every tunable into its supported range.
pub fn sanitize_config(config: Config) -> Config {
    let node_id = config.node.node_id.trim();
    let node_id = if node_id.is_empty() {
        default_node_id()
    } else {
        node_id.to_string()
    };
    let clamped_cap = config.commands.processed_id_cap.clamp(10, 100_000);
    let clamped_trim = config
        .commands
        .processed_id_trim
        .clamp(1, clamped_cap.saturating_sub(1).max(1));
    let clamped_poll_base = config.commands.poll_base_ms.clamp(100, 60_000);
    let clamped_retry_base = config.offline.retry_base_ms.clamp(10, 60_000);

    Config {
        node: NodeConfig {
            node_id,
            backend: config.node.backend,
            database_path: config.node.database_path.trim().to_string(),
        },
        sync: SyncConfig {
            debounce_ms: config.sync.debounce_ms.clamp(10, 2_000),
            min_write_spacing_ms: config.sync.min_write_spacing_ms.clamp(1, 5_000),
            feedback_suppress_ms: config.sync.feedback_suppress_ms.min(10_000),
            startup_timeout_ms: config.sync.startup_timeout_ms.clamp(100, 30_000),
        },
        commands: CommandsConfig {
            command_ttl_secs: config.commands.command_ttl_secs.clamp(5, 600),
            poll_base_ms: clamped_poll_base,
            poll_max_ms: config.commands.poll_max_ms.max(clamped_poll_base),
            processed_id_cap: clamped_cap,
            processed_id_trim: clamped_trim,
            inbound_queue_cap: config.commands.inbound_queue_cap.clamp(1, 1_000),
        },
        offline: OfflineConfig {
            buffer_cap: config.offline.buffer_cap.clamp(1, 100),
            retry_base_ms: clamped_retry_base,
            retry_max_ms: config.offline.retry_max_ms.max(clamped_retry_base),
            max_attempts: config.offline.max_attempts.clamp(1, 20),
        },
        heartbeat: HeartbeatConfig {
            interval_secs: config.heartbeat.interval_secs.clamp(15, 30),
        },
        logging: LoggingConfig {
            level: config.logging.level,
            suppression_window_secs: config.logging.suppression_window_secs.clamp(1, 3_600),
        },
    }
}

/// Reads `path`, writing a default config first when it does not exist.
///
/// Unreadable or malformed files fall back to defaults rather than failing startup.
pub fn load_or_create(path: &Path) -> Config {
    if !path.exists() {
        let default_config = Config::default();
        info!(
            "Config file not found. Creating default config. path={}",
            path.display()
        );
        if let Some(parent) = path.parent() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                warn!("Failed to create config directory {}: {}", parent.display(), err);
            }
        }
        match toml::to_string(&default_config) {
            Ok(text) => {
                if let Err(err) = std::fs::write(path, text) {
                    warn!("Failed to write default config {}: {}", path.display(), err);
                }
            }
            Err(err) => warn!("Failed to serialize default config: {}", err),
        }
        return sanitize_config(default_config);
    }

    let config = match std::fs::read_to_string(path) {
        Ok(content) => toml::from_str::<Config>(&content).unwrap_or_else(|err| {
            warn!("Config file {} is invalid, using defaults: {}", path.display(), err);
            Config::default()
        }),
        Err(err) => {
            warn!("Failed to read config {}: {}", path.display(), err);
            Config::default()
        }
    };
    sanitize_config(config)
}

#[cfg(test)]
mod tests {
    use super::{load_or_create, sanitize_config, BackendKind, Config};

    #[test]
    fn test_default_config_has_expected_values() {
        let config = Config::default();

        assert_eq!(config.node.node_id, "node-1");
        assert_eq!(config.node.backend, BackendKind::Sqlite);
        assert!(config.node.database_path.is_empty());
        assert_eq!(config.sync.debounce_ms, 200);
        assert_eq!(config.sync.min_write_spacing_ms, 100);
        assert_eq!(config.sync.feedback_suppress_ms, 500);
        assert_eq!(config.sync.startup_timeout_ms, 3_000);
        assert_eq!(config.commands.command_ttl_secs, 30);
        assert_eq!(config.commands.poll_base_ms, 2_000);
        assert_eq!(config.commands.poll_max_ms, 30_000);
        assert_eq!(config.commands.processed_id_cap, 1_000);
        assert_eq!(config.commands.processed_id_trim, 500);
        assert_eq!(config.offline.buffer_cap, 10);
        assert_eq!(config.offline.retry_base_ms, 1_000);
        assert_eq!(config.offline.retry_max_ms, 30_000);
        assert_eq!(config.offline.max_attempts, 5);
        assert_eq!(config.heartbeat.interval_secs, 20);
        assert_eq!(config.logging.level_filter(), log::LevelFilter::Info);
    }

    #[test]
    fn test_partial_config_deserialization_fills_defaults() {
        let partial = r#"
[node]
node_id = "lobby-screen"
backend = "memory"

[sync]
debounce_ms = 150
"#;
        let config: Config = toml::from_str(partial).expect("partial config should parse");
        assert_eq!(config.node.node_id, "lobby-screen");
        assert_eq!(config.node.backend, BackendKind::Memory);
        assert_eq!(config.sync.debounce_ms, 150);
        assert_eq!(config.sync.min_write_spacing_ms, 100);
        assert_eq!(config.commands.command_ttl_secs, 30);
        assert_eq!(config.heartbeat.interval_secs, 20);
    }

    #[test]
    fn test_sanitize_config_clamps_out_of_range_values() {
        let mut config = Config::default();
        config.node.node_id = "   ".to_string();
        config.sync.debounce_ms = 0;
        config.commands.processed_id_cap = 100;
        config.commands.processed_id_trim = 500;
        config.commands.poll_base_ms = 5_000;
        config.commands.poll_max_ms = 1_000;
        config.heartbeat.interval_secs = 2;
        config.offline.max_attempts = 0;

        let sanitized = sanitize_config(config);
        assert_eq!(sanitized.node.node_id, "node-1");
        assert_eq!(sanitized.sync.debounce_ms, 10);
        assert_eq!(sanitized.commands.processed_id_trim, 99);
        assert_eq!(sanitized.commands.poll_max_ms, 5_000);
        assert_eq!(sanitized.heartbeat.interval_secs, 15);
        assert_eq!(sanitized.offline.max_attempts, 1);
    }

    #[test]
    fn test_load_or_create_writes_default_file() {
        let dir = std::env::temp_dir().join(format!("playnode-config-{}", uuid::Uuid::new_v4()));
        let path = dir.join("playnode.toml");
        let loaded = load_or_create(&path);
        assert_eq!(loaded, sanitize_config(Config::default()));
        assert!(path.exists());

        std::fs::write(&path, "[node]\nnode_id = \"kiosk\"\n").expect("rewrite config");
        let reloaded = load_or_create(&path);
        assert_eq!(reloaded.node.node_id, "kiosk");
        let _ = std::fs::remove_dir_all(dir);
    }
}
