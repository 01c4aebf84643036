use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Huddle realtime server
#[derive(Parser, Serialize, Deserialize, Clone, Debug)]
#[command(name = "huddle-server", version, about = "Huddle realtime chat server")]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "HUDDLE_PORT", default_value = "1990")]
    pub port: u16,

    /// Bind address
    #[arg(long, env = "HUDDLE_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Path to TOML config file
    #[arg(long, default_value = "./huddle.toml")]
    pub config: String,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long, env = "HUDDLE_JSON_LOGS")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    pub generate_config: bool,

    /// Data directory for persistent state (DB, keys)
    #[arg(long, env = "HUDDLE_DATA_DIR", default_value = "./data")]
    pub data_dir: String,

    /// Presence persistence settings ([presence] section)
    #[arg(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence: Option<PresenceConfig>,

    /// Fanout settings ([fanout] section)
    #[arg(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fanout: Option<FanoutConfig>,

    /// Push dispatch settings ([push] section)
    #[arg(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push: Option<PushConfig>,

    /// WebSocket keepalive settings ([ws] section)
    #[arg(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws: Option<WsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Attempts to write an online/offline transition before giving up (default: 3)
    #[serde(default = "default_persist_attempts")]
    pub persist_attempts: u32,

    /// Delay between attempts in milliseconds (default: 50)
    #[serde(default = "default_persist_backoff_ms")]
    pub persist_backoff_ms: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            persist_attempts: default_persist_attempts(),
            persist_backoff_ms: default_persist_backoff_ms(),
        }
    }
}

fn default_persist_attempts() -> u32 {
    3
}

fn default_persist_backoff_ms() -> u64 {
    50
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutConfig {
    /// Characters of message content carried in alerts and push bodies (default: 100)
    #[serde(default = "default_preview_chars")]
    pub preview_chars: usize,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            preview_chars: default_preview_chars(),
        }
    }
}

fn default_preview_chars() -> usize {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfig {
    /// Whether push notifications are sent at all (default: true)
    #[serde(default = "default_push_enabled")]
    pub enabled: bool,

    /// Maximum push requests in flight at once (default: 64)
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: u32,

    /// Per-request timeout against push endpoints in seconds (default: 10)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Notification jobs waiting for a worker before new ones are dropped (default: 1024)
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            enabled: default_push_enabled(),
            max_in_flight: default_max_in_flight(),
            request_timeout_secs: default_request_timeout(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_push_enabled() -> bool {
    true
}

fn default_max_in_flight() -> u32 {
    64
}

fn default_request_timeout() -> u64 {
    10
}

fn default_queue_capacity() -> usize {
    1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsConfig {
    /// Seconds between server pings (default: 30)
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Seconds to wait for a pong before closing (default: 10)
    #[serde(default = "default_pong_timeout")]
    pub pong_timeout_secs: u64,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval(),
            pong_timeout_secs: default_pong_timeout(),
        }
    }
}

fn default_ping_interval() -> u64 {
    30
}

fn default_pong_timeout() -> u64 {
    10
}

impl WsConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.pong_timeout_secs.max(1))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 1990,
            bind_address: "0.0.0.0".to_string(),
            config: "./huddle.toml".to_string(),
            json_logs: false,
            generate_config: false,
            data_dir: "./data".to_string(),
            presence: None,
            fanout: None,
            push: None,
            ws: None,
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (HUDDLE_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        let cli = Config::parse();
        let config_path = cli.config.clone();

        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed("HUDDLE_").split("__"))
            .merge(Serialized::defaults(cli))
            .extract()
    }

    pub fn presence(&self) -> PresenceConfig {
        self.presence.clone().unwrap_or_default()
    }

    pub fn fanout(&self) -> FanoutConfig {
        self.fanout.clone().unwrap_or_default()
    }

    pub fn push(&self) -> PushConfig {
        self.push.clone().unwrap_or_default()
    }

    pub fn ws(&self) -> WsConfig {
        self.ws.clone().unwrap_or_default()
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Huddle Server Configuration
# Place this file at ./huddle.toml or specify with --config <path>
# All settings can be overridden via environment variables (HUDDLE_PORT,
# HUDDLE_PUSH__MAX_IN_FLIGHT, etc.) or CLI flags (--port, etc.)

# Server port (default: 1990)
# port = 1990

# Bind address (default: 0.0.0.0, all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# Data directory for SQLite database and JWT signing key
# data_dir = "./data"

# ---- Presence ----
# [presence]
# persist_attempts = 3      # writes of an online/offline flag before giving up
# persist_backoff_ms = 50   # delay between attempts

# ---- Fanout ----
# [fanout]
# preview_chars = 100       # characters of content in alerts and push bodies

# ---- Push Notifications ----
# [push]
# enabled = true
# max_in_flight = 64        # concurrent push requests
# request_timeout_secs = 10
# queue_capacity = 1024     # pending jobs before new ones are dropped

# ---- WebSocket ----
# [ws]
# ping_interval_secs = 30
# pong_timeout_secs = 10
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sections_fall_back_to_defaults() {
        let config = Config::default();
        assert_eq!(config.presence().persist_attempts, 3);
        assert_eq!(config.fanout().preview_chars, 100);
        assert_eq!(config.push().max_in_flight, 64);
        assert_eq!(config.push().queue_capacity, 1024);
        assert_eq!(config.ws().ping_interval(), Duration::from_secs(30));
    }

    #[test]
    fn toml_sections_override_defaults() {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::string(
                "[push]\nmax_in_flight = 8\n\n[fanout]\npreview_chars = 40\n",
            ))
            .extract()
            .unwrap();
        assert_eq!(config.push().max_in_flight, 8);
        assert!(config.push().enabled);
        assert_eq!(config.fanout().preview_chars, 40);
    }
}
