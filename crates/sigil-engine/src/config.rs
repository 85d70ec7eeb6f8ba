//! Engine configuration loaded from environment variables.
//!
//! Every setting has a default so a session can start with zero
//! configuration against a local relay.

use std::path::PathBuf;
use std::time::Duration;

use sigil_net::TransportConfig;
use sigil_shared::constants::{
    ADMITTED_CAPACITY, DECRYPT_TIMEOUT, DIRECTORY_TIMEOUT, KEY_CACHE_CAPACITY, PAGE_SIZE, SWEEP_INTERVAL,
    TYPING_WINDOW,
};

/// Session configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Relay WebSocket endpoint.
    /// Env: `SIGIL_RELAY_URL`
    /// Default: `ws://127.0.0.1:8080/ws`
    pub relay_url: String,

    /// Base URL of the profile directory.
    /// Env: `SIGIL_DIRECTORY_URL`
    /// Default: `http://127.0.0.1:8080`
    pub directory_url: String,

    /// SQLite cache file.
    /// Env: `SIGIL_DB_PATH`
    /// Default: `None` (platform data directory).
    pub db_path: Option<PathBuf>,

    /// Send read receipts for messages seen in the active dialog.
    /// Env: `SIGIL_READ_RECEIPTS` (true/false)
    /// Default: `true`
    pub read_receipts: bool,

    /// Messages per history page.
    /// Env: `SIGIL_PAGE_SIZE`
    /// Default: `50`
    pub page_size: usize,

    /// Hard ceiling on one decryption.
    /// Env: `SIGIL_DECRYPT_TIMEOUT_MS`
    /// Default: 10 s
    pub decrypt_timeout: Duration,

    /// Ceiling on one directory lookup, including a send's key fetch.
    /// Env: `SIGIL_DIRECTORY_TIMEOUT_MS`
    /// Default: 10 s
    pub directory_timeout: Duration,

    pub key_cache_capacity: usize,
    pub admitted_capacity: usize,
    pub typing_window: Duration,
    pub sweep_interval: Duration,

    pub transport: TransportConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let transport = TransportConfig::default();
        Self {
            relay_url: transport.url.clone(),
            directory_url: "http://127.0.0.1:8080".to_string(),
            db_path: None,
            read_receipts: true,
            page_size: PAGE_SIZE,
            decrypt_timeout: DECRYPT_TIMEOUT,
            directory_timeout: DIRECTORY_TIMEOUT,
            key_cache_capacity: KEY_CACHE_CAPACITY,
            admitted_capacity: ADMITTED_CAPACITY,
            typing_window: TYPING_WINDOW,
            sweep_interval: SWEEP_INTERVAL,
            transport,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup("SIGIL_RELAY_URL") {
            config.relay_url = url;
        }

        if let Some(url) = lookup("SIGIL_DIRECTORY_URL") {
            config.directory_url = url.trim_end_matches('/').to_string();
        }

        if let Some(path) = lookup("SIGIL_DB_PATH") {
            if !path.is_empty() {
                config.db_path = Some(PathBuf::from(path));
            }
        }

        if let Some(val) = lookup("SIGIL_READ_RECEIPTS") {
            config.read_receipts = val != "false" && val != "0";
        }

        if let Some(val) = lookup("SIGIL_PAGE_SIZE") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.page_size = n,
                _ => tracing::warn!(value = %val, "Invalid SIGIL_PAGE_SIZE, using default"),
            }
        }

        if let Some(val) = lookup("SIGIL_DECRYPT_TIMEOUT_MS") {
            match val.parse::<u64>() {
                Ok(ms) if ms > 0 => config.decrypt_timeout = Duration::from_millis(ms),
                _ => tracing::warn!(
                    value = %val,
                    "Invalid SIGIL_DECRYPT_TIMEOUT_MS, using default"
                ),
            }
        }

        if let Some(val) = lookup("SIGIL_DIRECTORY_TIMEOUT_MS") {
            match val.parse::<u64>() {
                Ok(ms) if ms > 0 => config.directory_timeout = Duration::from_millis(ms),
                _ => tracing::warn!(
                    value = %val,
                    "Invalid SIGIL_DIRECTORY_TIMEOUT_MS, using default"
                ),
            }
        }

        // RUST_LOG is read by tracing-subscriber's EnvFilter directly.

        config.transport.url = config.relay_url.clone();
        config
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> EngineConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EngineConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.relay_url, "ws://127.0.0.1:8080/ws");
        assert_eq!(config.page_size, 50);
        assert_eq!(config.decrypt_timeout, Duration::from_secs(10));
        assert!(config.read_receipts);
        assert!(config.db_path.is_none());
    }

    #[test]
    fn test_env_overrides() {
        let config = from_pairs(&[
            ("SIGIL_RELAY_URL", "wss://relay.example/ws"),
            ("SIGIL_DIRECTORY_URL", "https://dir.example/"),
            ("SIGIL_DB_PATH", "/tmp/sigil-test.db"),
            ("SIGIL_READ_RECEIPTS", "false"),
            ("SIGIL_PAGE_SIZE", "20"),
            ("SIGIL_DECRYPT_TIMEOUT_MS", "250"),
            ("SIGIL_DIRECTORY_TIMEOUT_MS", "1500"),
        ]);
        assert_eq!(config.relay_url, "wss://relay.example/ws");
        assert_eq!(config.transport.url, "wss://relay.example/ws");
        assert_eq!(config.directory_url, "https://dir.example");
        assert_eq!(config.db_path, Some(PathBuf::from("/tmp/sigil-test.db")));
        assert!(!config.read_receipts);
        assert_eq!(config.page_size, 20);
        assert_eq!(config.decrypt_timeout, Duration::from_millis(250));
        assert_eq!(config.directory_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = from_pairs(&[
            ("SIGIL_PAGE_SIZE", "zero"),
            ("SIGIL_DECRYPT_TIMEOUT_MS", "0"),
        ]);
        assert_eq!(config.page_size, 50);
        assert_eq!(config.decrypt_timeout, Duration::from_secs(10));
    }
}
