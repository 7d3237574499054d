// Process configuration, read from the environment (and a `.env` file when
// present). Every setting has a default so a bare `Config::from_env()` starts a
// local worker on SQLite.

use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::logging::LogFormat;

pub const DEFAULT_DATABASE_URL: &str = "sqlite:reservations.db?mode=rwc";
pub const DEFAULT_LOG_FILTER: &str = "rail_reservation_worker=info,sqlx=warn,tower_http=info";

// DATABASE_URL value selecting the in-process store
pub const MEMORY_DATABASE: &str = "memory";

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub database_url: String,
    pub db_connect_max_tries: u32,
    pub db_connect_retry: Duration,
    pub api_bind_address: String,
    pub api_port: u16,
    pub scheduler_tick: Duration,
    pub recover_running_on_start: bool,
    pub ntfy_url: Option<String>,
    pub log_filter: String,
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            db_connect_max_tries: 20,
            db_connect_retry: Duration::from_secs(3),
            api_bind_address: "0.0.0.0".to_string(),
            api_port: 8000,
            scheduler_tick: Duration::from_millis(1000),
            recover_running_on_start: false,
            ntfy_url: None,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

impl Config {
    /// Loads `.env` if there is one, then reads the process environment.
    pub fn from_env() -> Result<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!(path = %path.display(), "Loaded .env");
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    // Blank values count as unset; malformed values are an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let mut config = Self::default();

        if let Some(url) = get("DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(tries) = get("DB_CONNECT_MAX_TRIES") {
            config.db_connect_max_tries = parse("DB_CONNECT_MAX_TRIES", &tries)?;
            if config.db_connect_max_tries == 0 {
                return Err(Error::config("DB_CONNECT_MAX_TRIES must be at least 1"));
            }
        }
        if let Some(secs) = get("DB_CONNECT_RETRY_SECS") {
            config.db_connect_retry = Duration::from_secs(parse("DB_CONNECT_RETRY_SECS", &secs)?);
        }
        if let Some(address) = get("API_BIND_ADDRESS") {
            config.api_bind_address = address;
        }
        if let Some(port) = get("API_PORT") {
            config.api_port = parse("API_PORT", &port)?;
        }
        if let Some(ms) = get("SCHEDULER_TICK_MS") {
            let ms: u64 = parse("SCHEDULER_TICK_MS", &ms)?;
            if ms == 0 {
                return Err(Error::config("SCHEDULER_TICK_MS must be positive"));
            }
            config.scheduler_tick = Duration::from_millis(ms);
        }
        if let Some(flag) = get("RECOVER_RUNNING_ON_START") {
            config.recover_running_on_start = parse_bool("RECOVER_RUNNING_ON_START", &flag)?;
        }
        config.ntfy_url = get("NTFY_URL");

        if let Some(filter) = get("LOG_FILTER").or_else(|| get("RUST_LOG")) {
            config.log_filter = filter;
        }
        if let Some(format) = get("LOG_FORMAT") {
            config.log_format = format.parse()?;
        }

        Ok(config)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.api_bind_address, self.api_port)
    }

    pub fn uses_memory_store(&self) -> bool {
        self.database_url.eq_ignore_ascii_case(MEMORY_DATABASE)
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::config(format!("{key} has invalid value '{value}'")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::config(format!("{key} has invalid value '{value}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_nothing_is_set() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.bind_addr(), "0.0.0.0:8000");
        assert!(!config.uses_memory_store());
        assert!(config.ntfy_url.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "memory"),
            ("DB_CONNECT_MAX_TRIES", "3"),
            ("DB_CONNECT_RETRY_SECS", "1"),
            ("API_PORT", "9090"),
            ("SCHEDULER_TICK_MS", "250"),
            ("RECOVER_RUNNING_ON_START", "yes"),
            ("NTFY_URL", "https://ntfy.sh/my-trains"),
            ("RUST_LOG", "debug"),
            ("LOG_FORMAT", "json"),
        ]))
        .unwrap();

        assert!(config.uses_memory_store());
        assert_eq!(config.db_connect_max_tries, 3);
        assert_eq!(config.db_connect_retry, Duration::from_secs(1));
        assert_eq!(config.api_port, 9090);
        assert_eq!(config.scheduler_tick, Duration::from_millis(250));
        assert!(config.recover_running_on_start);
        assert_eq!(config.ntfy_url.as_deref(), Some("https://ntfy.sh/my-trains"));
        assert_eq!(config.log_filter, "debug");
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_log_filter_wins_over_rust_log() {
        let config =
            Config::from_lookup(lookup(&[("LOG_FILTER", "warn"), ("RUST_LOG", "trace")])).unwrap();
        assert_eq!(config.log_filter, "warn");
    }

    #[test]
    fn test_blank_values_fall_back() {
        let config = Config::from_lookup(lookup(&[("API_PORT", "  "), ("NTFY_URL", "")])).unwrap();
        assert_eq!(config.api_port, 8000);
        assert!(config.ntfy_url.is_none());
    }

    #[test]
    fn test_malformed_values_are_rejected() {
        for (key, value) in [
            ("API_PORT", "eighty"),
            ("API_PORT", "70000"),
            ("DB_CONNECT_MAX_TRIES", "0"),
            ("SCHEDULER_TICK_MS", "0"),
            ("RECOVER_RUNNING_ON_START", "maybe"),
            ("LOG_FORMAT", "xml"),
        ] {
            let err = Config::from_lookup(lookup(&[(key, value)])).unwrap_err();
            assert!(
                matches!(err, Error::Configuration(_)),
                "{key}={value} gave {err:?}"
            );
        }
    }
}
