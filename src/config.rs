//! Client configuration
//!
//! Values are read from `CHAT_SYNC_*` environment variables, falling back to
//! defaults suitable for a local push server.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ChatError, ChatResult};

/// Transport-level retry schedule
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: u32,
    /// `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let factor = self.multiplier.max(1).saturating_pow(exponent);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt <= max)
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Push channel endpoint (ws:// or wss://)
    pub push_url: String,
    /// Page size for notification fetches
    pub page_limit: u32,
    /// Where the authenticated identity is persisted between runs
    pub identity_path: PathBuf,
    pub reconnect: ReconnectPolicy,
    /// Match server echoes without a client key by text and time
    pub echo_heuristic: bool,
    /// Maximum clock distance for the echo heuristic
    pub echo_window: Duration,
    /// Outbound frames buffered per connection
    pub outbound_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            push_url: "ws://localhost:3030/push".to_string(),
            page_limit: 10,
            identity_path: PathBuf::from("chat_identity.json"),
            reconnect: ReconnectPolicy::default(),
            echo_heuristic: true,
            echo_window: Duration::from_secs(10),
            outbound_buffer: 256,
        }
    }
}

impl ClientConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> ChatResult<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> ChatResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("CHAT_SYNC_PUSH_URL") {
            if !url.starts_with("ws://") && !url.starts_with("wss://") {
                return Err(ChatError::Config(format!(
                    "CHAT_SYNC_PUSH_URL must be a ws:// or wss:// url, got {}",
                    url
                )));
            }
            config.push_url = url;
        }
        if let Some(limit) = parse_var::<u32>(&lookup, "CHAT_SYNC_PAGE_LIMIT")? {
            if limit == 0 {
                return Err(ChatError::Config("CHAT_SYNC_PAGE_LIMIT must be > 0".into()));
            }
            config.page_limit = limit;
        }
        if let Some(path) = lookup("CHAT_SYNC_IDENTITY_PATH") {
            let path = PathBuf::from(path);
            config.identity_path = if path.is_absolute() {
                path
            } else {
                env::current_dir()
                    .unwrap_or_else(|_| PathBuf::from("."))
                    .join(path)
            };
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "CHAT_SYNC_RECONNECT_INITIAL_MS")? {
            config.reconnect.initial_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "CHAT_SYNC_RECONNECT_MAX_MS")? {
            config.reconnect.max_delay = Duration::from_millis(ms);
        }
        if let Some(max) = parse_var::<u32>(&lookup, "CHAT_SYNC_RECONNECT_MAX_ATTEMPTS")? {
            config.reconnect.max_attempts = if max == 0 { None } else { Some(max) };
        }
        if let Some(enabled) = parse_var::<bool>(&lookup, "CHAT_SYNC_ECHO_HEURISTIC")? {
            config.echo_heuristic = enabled;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "CHAT_SYNC_ECHO_WINDOW_SECS")? {
            config.echo_window = Duration::from_secs(secs);
        }

        Ok(config)
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> ChatResult<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ChatError::Config(format!("{}: {}", key, e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_env() {
        let config = ClientConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.page_limit, 10);
        assert!(config.echo_heuristic);
        assert_eq!(config.reconnect.max_attempts, None);
    }

    #[test]
    fn test_overrides() {
        let config = ClientConfig::from_lookup(lookup_from(&[
            ("CHAT_SYNC_PUSH_URL", "wss://chat.example/ws"),
            ("CHAT_SYNC_PAGE_LIMIT", "5"),
            ("CHAT_SYNC_RECONNECT_MAX_ATTEMPTS", "3"),
            ("CHAT_SYNC_ECHO_HEURISTIC", "false"),
        ]))
        .unwrap();
        assert_eq!(config.push_url, "wss://chat.example/ws");
        assert_eq!(config.page_limit, 5);
        assert_eq!(config.reconnect.max_attempts, Some(3));
        assert!(!config.echo_heuristic);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(ClientConfig::from_lookup(lookup_from(&[("CHAT_SYNC_PAGE_LIMIT", "ten")])).is_err());
        assert!(ClientConfig::from_lookup(lookup_from(&[("CHAT_SYNC_PUSH_URL", "http://x")])).is_err());
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            multiplier: 2,
            max_attempts: Some(5),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(10), Duration::from_millis(1000));
        assert!(policy.allows(5));
        assert!(!policy.allows(6));
    }
}
