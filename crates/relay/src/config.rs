// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. Heartbeat and frame size limits are protocol constants and
// live with the session code.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use crate::{collab::RetryPolicy, rooms::HubSettings};

const DEV_JWT_SECRET: &str = "bookclub_local_development_jwt_secret_must_be_32_chars";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// HS256 secret shared with the identity token issuer.
    pub jwt_secret: String,
    /// Log filter directive (e.g. `info`, `bookclub_relay=debug`).
    pub log_filter: String,
    pub log_format: LogFormat,
    /// JSON room directory used to seed the in-process store.
    pub rooms_file: Option<PathBuf>,
    pub reconnect_grace: Duration,
    pub admission_timeout: Duration,
    pub outbound_queue: usize,
    pub recent_window: usize,
    pub write_retry_attempts: u32,
    pub read_only_cooldown: Duration,
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `BOOKCLUB_RELAY_HOST` | `0.0.0.0` |
    /// | `BOOKCLUB_RELAY_PORT` | `8080` |
    /// | `BOOKCLUB_RELAY_JWT_SECRET` | dev-only placeholder |
    /// | `BOOKCLUB_RELAY_LOG_FILTER` | `info` |
    /// | `BOOKCLUB_RELAY_LOG_FORMAT` | `text` |
    /// | `BOOKCLUB_RELAY_ROOMS_FILE` | *(none)* |
    /// | `BOOKCLUB_RELAY_RECONNECT_GRACE_MS` | `5000` |
    /// | `BOOKCLUB_RELAY_ADMISSION_TIMEOUT_MS` | `10000` |
    /// | `BOOKCLUB_RELAY_OUTBOUND_QUEUE` | `256` |
    /// | `BOOKCLUB_RELAY_RECENT_WINDOW` | `50` |
    /// | `BOOKCLUB_RELAY_WRITE_RETRY_ATTEMPTS` | `3` |
    /// | `BOOKCLUB_RELAY_READ_ONLY_COOLDOWN_MS` | `30000` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("BOOKCLUB_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = parse_or(&env, "BOOKCLUB_RELAY_PORT", 8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let jwt_secret = env("BOOKCLUB_RELAY_JWT_SECRET").unwrap_or_else(|_| DEV_JWT_SECRET.into());
        let log_filter = env("BOOKCLUB_RELAY_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_format = match env("BOOKCLUB_RELAY_LOG_FORMAT") {
            Ok(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };
        let rooms_file = env("BOOKCLUB_RELAY_ROOMS_FILE")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from);

        Self {
            listen_addr,
            jwt_secret,
            log_filter,
            log_format,
            rooms_file,
            reconnect_grace: Duration::from_millis(parse_or(
                &env,
                "BOOKCLUB_RELAY_RECONNECT_GRACE_MS",
                5_000,
            )),
            admission_timeout: Duration::from_millis(parse_or(
                &env,
                "BOOKCLUB_RELAY_ADMISSION_TIMEOUT_MS",
                10_000,
            )),
            outbound_queue: parse_or(&env, "BOOKCLUB_RELAY_OUTBOUND_QUEUE", 256usize).max(1),
            recent_window: parse_or(&env, "BOOKCLUB_RELAY_RECENT_WINDOW", 50usize).max(1),
            write_retry_attempts: parse_or(&env, "BOOKCLUB_RELAY_WRITE_RETRY_ATTEMPTS", 3u32)
                .max(1),
            read_only_cooldown: Duration::from_millis(parse_or(
                &env,
                "BOOKCLUB_RELAY_READ_ONLY_COOLDOWN_MS",
                30_000,
            )),
        }
    }

    /// Returns true when using the development-only JWT secret.
    pub fn is_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }

    pub fn hub_settings(&self) -> HubSettings {
        HubSettings {
            reconnect_grace: self.reconnect_grace,
            outbound_queue: self.outbound_queue,
            recent_window: self.recent_window,
            write_retry: RetryPolicy { attempts: self.write_retry_attempts, ..RetryPolicy::default() },
            read_only_cooldown: self.read_only_cooldown,
        }
    }
}

fn parse_or<F, T>(env: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
    T: std::str::FromStr,
{
    env(key).ok().and_then(|value| value.trim().parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from_map(
        map: HashMap<&'static str, &'static str>,
    ) -> impl Fn(&str) -> Result<String, std::env::VarError> {
        move |key: &str| {
            map.get(key)
                .map(|v| v.to_string())
                .ok_or(std::env::VarError::NotPresent)
        }
    }

    #[test]
    fn defaults_when_no_env_vars() {
        let cfg = RelayConfig::from_env_fn(env_from_map(HashMap::new()));
        assert_eq!(cfg.listen_addr.port(), 8080);
        assert_eq!(cfg.listen_addr.ip().to_string(), "0.0.0.0");
        assert!(cfg.is_dev_jwt_secret());
        assert_eq!(cfg.log_filter, "info");
        assert_eq!(cfg.log_format, LogFormat::Text);
        assert!(cfg.rooms_file.is_none());
        assert_eq!(cfg.reconnect_grace, Duration::from_millis(5_000));
        assert_eq!(cfg.admission_timeout, Duration::from_millis(10_000));
        assert_eq!(cfg.outbound_queue, 256);
        assert_eq!(cfg.recent_window, 50);
        assert_eq!(cfg.write_retry_attempts, 3);
        assert_eq!(cfg.read_only_cooldown, Duration::from_millis(30_000));
    }

    #[test]
    fn custom_host_and_port() {
        let mut m = HashMap::new();
        m.insert("BOOKCLUB_RELAY_HOST", "127.0.0.1");
        m.insert("BOOKCLUB_RELAY_PORT", "3000");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:3000");
    }

    #[test]
    fn custom_jwt_secret_is_not_dev() {
        let mut m = HashMap::new();
        m.insert("BOOKCLUB_RELAY_JWT_SECRET", "production_secret_at_least_32_chars!!");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert!(!cfg.is_dev_jwt_secret());
        assert_eq!(cfg.jwt_secret, "production_secret_at_least_32_chars!!");
    }

    #[test]
    fn log_settings_override() {
        let mut m = HashMap::new();
        m.insert("BOOKCLUB_RELAY_LOG_FILTER", "debug,bookclub_relay=trace");
        m.insert("BOOKCLUB_RELAY_LOG_FORMAT", "JSON");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.log_filter, "debug,bookclub_relay=trace");
        assert_eq!(cfg.log_format, LogFormat::Json);
    }

    #[test]
    fn invalid_numbers_use_defaults() {
        let mut m = HashMap::new();
        m.insert("BOOKCLUB_RELAY_PORT", "not_a_number");
        m.insert("BOOKCLUB_RELAY_RECONNECT_GRACE_MS", "-5");
        m.insert("BOOKCLUB_RELAY_OUTBOUND_QUEUE", "lots");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.port(), 8080);
        assert_eq!(cfg.reconnect_grace, Duration::from_millis(5_000));
        assert_eq!(cfg.outbound_queue, 256);
    }

    #[test]
    fn hub_settings_follow_overrides() {
        let mut m = HashMap::new();
        m.insert("BOOKCLUB_RELAY_RECONNECT_GRACE_MS", "2500");
        m.insert("BOOKCLUB_RELAY_OUTBOUND_QUEUE", "8");
        m.insert("BOOKCLUB_RELAY_RECENT_WINDOW", "20");
        m.insert("BOOKCLUB_RELAY_WRITE_RETRY_ATTEMPTS", "0");
        m.insert("BOOKCLUB_RELAY_READ_ONLY_COOLDOWN_MS", "1000");
        m.insert("BOOKCLUB_RELAY_ROOMS_FILE", "/etc/bookclub/rooms.json");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));

        let settings = cfg.hub_settings();
        assert_eq!(settings.reconnect_grace, Duration::from_millis(2_500));
        assert_eq!(settings.outbound_queue, 8);
        assert_eq!(settings.recent_window, 20);
        assert_eq!(settings.write_retry.attempts, 1);
        assert_eq!(settings.read_only_cooldown, Duration::from_secs(1));
        assert_eq!(cfg.rooms_file, Some(PathBuf::from("/etc/bookclub/rooms.json")));
    }
}
