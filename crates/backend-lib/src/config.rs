// ============================
// crates/backend-lib/src/config.rs
// ============================
//! Configuration management.
use anyhow::Result;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Server bind address
    pub bind_addr: SocketAddr,
    /// Length of generated meeting codes
    pub meeting_code_length: usize,
    /// Capacity of each meeting's broadcast channel
    pub broadcast_capacity: usize,
    /// Maximum chat message length
    pub max_chat_length: usize,
    /// Log level
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".parse().expect("valid literal addr"),
            meeting_code_length: 8,
            broadcast_capacity: 128,
            max_chat_length: 2000,
            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from `huddle.toml` and `HUDDLE_`-prefixed
    /// environment variables, falling back to defaults for anything
    /// not provided.
    pub fn load() -> Result<Self> {
        Self::load_from("huddle.toml")
    }

    /// Load settings from an explicit config file path.
    pub fn load_from(path: &str) -> Result<Self> {
        let defaults = Settings::default();
        let settings = Figment::new()
            .merge(figment::providers::Serialized::defaults(&defaults))
            .merge(Toml::file(path))
            .merge(Env::prefixed("HUDDLE_"))
            .extract()?;
        Ok(settings)
    }
}
