//! Server configuration module.
//!
//! Parses configuration from environment variables for the Huddle server.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `PORT` | No | 8080 | HTTP server port |
//! | `HUDDLE_DEFAULT_ROOM` | No | `default` | Room joined when `?room=` is absent |
//! | `HUDDLE_TOKEN_KEY` | No | random | Base64 32-byte Ed25519 seed for session tokens |
//! | `HUDDLE_TOKEN_TTL_SECS` | No | 86400 | Session token lifetime |
//! | `HUDDLE_MAILBOX_CAPACITY` | No | 256 | Per-connection outbound mailbox size |
//! | `HUDDLE_ROOM_INBOX_CAPACITY` | No | 128 | Per-room inbox size |
//! | `HUDDLE_UPLOAD_DIR` | No | `uploads` | Directory for avatar uploads, served at `/uploads` |
//! | `HUDDLE_UNSAFE_NO_AUTH` | No | false | Take identity from `?user=` (dev only) |

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use base64::prelude::*;
use thiserror::Error;
use tracing::warn;

use crate::connection::DEFAULT_MAILBOX_CAPACITY;
use crate::hub::HubConfig;
use crate::room::{DEFAULT_INBOX_CAPACITY, HISTORY_LIMIT};

/// Default HTTP server port.
const DEFAULT_PORT: u16 = 8080;

/// Room joined when the client does not name one.
pub const DEFAULT_ROOM: &str = "default";

/// Directory avatar uploads are written to when none is configured.
pub const DEFAULT_UPLOAD_DIR: &str = "uploads";

/// Default session token lifetime (24 hours).
const DEFAULT_TOKEN_TTL_SECS: u64 = 24 * 60 * 60;

/// Length of an Ed25519 seed.
const TOKEN_KEY_LENGTH: usize = 32;

/// Errors that can occur when parsing configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Environment variable has invalid format.
    #[error("invalid format for {var}: {message}")]
    InvalidFormat { var: String, message: String },

    /// Port number is invalid.
    #[error("invalid port number: {0}")]
    InvalidPort(#[from] std::num::ParseIntError),

    /// Configuration validation failed.
    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

/// Server configuration parsed from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server port.
    pub port: u16,

    /// Room used when a client connects without `?room=`.
    pub default_room: String,

    /// Ed25519 seed for signing session tokens. `None` means a random key is
    /// generated at startup.
    pub token_key: Option<[u8; TOKEN_KEY_LENGTH]>,

    /// Session token lifetime.
    pub token_ttl: Duration,

    /// Capacity of each connection's outbound mailbox.
    pub mailbox_capacity: usize,

    /// Capacity of each room's inbox.
    pub room_inbox_capacity: usize,

    /// Directory avatar uploads are stored in and served from.
    pub upload_dir: PathBuf,

    /// When true, clients name themselves with `?user=` (development only).
    pub unsafe_no_auth: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            default_room: DEFAULT_ROOM.to_string(),
            token_key: None,
            token_ttl: Duration::from_secs(DEFAULT_TOKEN_TTL_SECS),
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            room_inbox_capacity: DEFAULT_INBOX_CAPACITY,
            upload_dir: PathBuf::from(DEFAULT_UPLOAD_DIR),
            unsafe_no_auth: false,
        }
    }
}

impl Config {
    /// Parse configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - An environment variable has an invalid format
    /// - Port number is not a valid u16
    /// - A capacity is zero, or the mailbox cannot hold a full history replay
    ///
    /// # Example
    ///
    /// ```no_run
    /// use huddle_server::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Server will listen on port {}", config.port);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            port: parse_port()?,
            default_room: parse_string_env("HUDDLE_DEFAULT_ROOM")?
                .unwrap_or_else(|| DEFAULT_ROOM.to_string()),
            token_key: parse_token_key()?,
            token_ttl: Duration::from_secs(
                parse_number_env("HUDDLE_TOKEN_TTL_SECS")?.unwrap_or(DEFAULT_TOKEN_TTL_SECS),
            ),
            mailbox_capacity: parse_number_env("HUDDLE_MAILBOX_CAPACITY")?
                .unwrap_or(DEFAULT_MAILBOX_CAPACITY),
            room_inbox_capacity: parse_number_env("HUDDLE_ROOM_INBOX_CAPACITY")?
                .unwrap_or(DEFAULT_INBOX_CAPACITY),
            upload_dir: parse_string_env("HUDDLE_UPLOAD_DIR")?
                .map_or_else(|| PathBuf::from(DEFAULT_UPLOAD_DIR), PathBuf::from),
            unsafe_no_auth: parse_bool_env("HUDDLE_UNSAFE_NO_AUTH"),
        };

        config.validate()?;

        if config.unsafe_no_auth {
            warn!(
                "HUDDLE_UNSAFE_NO_AUTH is enabled - clients choose their own identity. \
                 Do not use in production!"
            );
        }

        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_room.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "default room cannot be empty".to_string(),
            ));
        }

        if self.mailbox_capacity == 0 || self.room_inbox_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "queue capacities must be greater than zero".to_string(),
            ));
        }

        if self.mailbox_capacity < HISTORY_LIMIT {
            return Err(ConfigError::ValidationError(format!(
                "mailbox capacity {} is smaller than the room history limit {HISTORY_LIMIT}",
                self.mailbox_capacity
            )));
        }

        if self.token_ttl.is_zero() {
            return Err(ConfigError::ValidationError(
                "token lifetime must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Queue sizing for the hub.
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            mailbox_capacity: self.mailbox_capacity,
            room_inbox_capacity: self.room_inbox_capacity,
            history_limit: HISTORY_LIMIT,
        }
    }
}

/// Parse a boolean environment variable.
///
/// Returns `true` if the variable is set to "true" (case-insensitive),
/// `false` otherwise.
fn parse_bool_env(name: &str) -> bool {
    env::var(name)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Read a string variable, treating empty as unset.
fn parse_string_env(name: &str) -> Result<Option<String>, ConfigError> {
    match env::var(name) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => Ok(Some(value.trim().to_string())),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidFormat {
            var: name.to_string(),
            message: "contains invalid unicode".to_string(),
        }),
    }
}

fn parse_number_env<T>(name: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = parse_string_env(name)? else {
        return Ok(None);
    };
    raw.parse()
        .map(Some)
        .map_err(|err: T::Err| ConfigError::InvalidFormat {
            var: name.to_string(),
            message: format!("expected a non-negative integer, got '{raw}': {err}"),
        })
}

/// Parse the PORT environment variable.
///
/// Returns the default port if not set.
fn parse_port() -> Result<u16, ConfigError> {
    match env::var("PORT") {
        Ok(port_str) => Ok(port_str.trim().parse()?),
        Err(env::VarError::NotPresent) => Ok(DEFAULT_PORT),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidFormat {
            var: "PORT".to_string(),
            message: "contains invalid unicode".to_string(),
        }),
    }
}

/// Parse the HUDDLE_TOKEN_KEY environment variable.
///
/// Expected format: standard base64 encoding of exactly 32 bytes.
fn parse_token_key() -> Result<Option<[u8; TOKEN_KEY_LENGTH]>, ConfigError> {
    let Some(encoded) = parse_string_env("HUDDLE_TOKEN_KEY")? else {
        return Ok(None);
    };

    let bytes = BASE64_STANDARD
        .decode(&encoded)
        .map_err(|err| ConfigError::InvalidFormat {
            var: "HUDDLE_TOKEN_KEY".to_string(),
            message: format!("invalid base64: {err}"),
        })?;

    let len = bytes.len();
    let key: [u8; TOKEN_KEY_LENGTH] = bytes.try_into().map_err(|_| {
        ConfigError::ValidationError(format!(
            "HUDDLE_TOKEN_KEY must decode to {TOKEN_KEY_LENGTH} bytes, got {len}"
        ))
    })?;
    Ok(Some(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    const ALL_VARS: [&str; 8] = [
        "PORT",
        "HUDDLE_DEFAULT_ROOM",
        "HUDDLE_TOKEN_KEY",
        "HUDDLE_TOKEN_TTL_SECS",
        "HUDDLE_MAILBOX_CAPACITY",
        "HUDDLE_ROOM_INBOX_CAPACITY",
        "HUDDLE_UPLOAD_DIR",
        "HUDDLE_UNSAFE_NO_AUTH",
    ];

    /// Helper to temporarily set environment variables for testing.
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        /// Starts from a clean slate for every variable this module reads.
        fn clean() -> Self {
            let mut guard = Self::new();
            for var in ALL_VARS {
                guard.remove(var);
            }
            guard
        }

        fn set(&mut self, key: &str, value: &str) {
            let old_value = env::var(key).ok();
            self.vars.push((key.to_string(), old_value));
            env::set_var(key, value);
        }

        fn remove(&mut self, key: &str) {
            let old_value = env::var(key).ok();
            self.vars.push((key.to_string(), old_value));
            env::remove_var(key);
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.iter().rev() {
                match value {
                    Some(v) => env::set_var(key, v),
                    None => env::remove_var(key),
                }
            }
        }
    }

    #[test]
    #[serial]
    fn test_config_defaults() {
        let _guard = EnvGuard::clean();

        let config = Config::from_env().expect("should parse config");
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.default_room, "default");
        assert!(config.token_key.is_none());
        assert_eq!(config.token_ttl, Duration::from_secs(86_400));
        assert_eq!(config.mailbox_capacity, 256);
        assert_eq!(config.room_inbox_capacity, 128);
        assert_eq!(config.upload_dir, PathBuf::from("uploads"));
        assert!(!config.unsafe_no_auth);
    }

    #[test]
    #[serial]
    fn test_config_all_vars_set() {
        let mut guard = EnvGuard::clean();
        guard.set("PORT", "9090");
        guard.set("HUDDLE_DEFAULT_ROOM", " lobby ");
        guard.set("HUDDLE_TOKEN_KEY", &BASE64_STANDARD.encode([7u8; 32]));
        guard.set("HUDDLE_TOKEN_TTL_SECS", "600");
        guard.set("HUDDLE_MAILBOX_CAPACITY", "64");
        guard.set("HUDDLE_ROOM_INBOX_CAPACITY", "16");
        guard.set("HUDDLE_UPLOAD_DIR", " /var/lib/huddle/avatars ");
        guard.set("HUDDLE_UNSAFE_NO_AUTH", "TRUE");

        let config = Config::from_env().expect("should parse config");
        assert_eq!(config.port, 9090);
        assert_eq!(config.default_room, "lobby");
        assert_eq!(config.token_key, Some([7u8; 32]));
        assert_eq!(config.token_ttl, Duration::from_secs(600));
        assert_eq!(config.mailbox_capacity, 64);
        assert_eq!(config.room_inbox_capacity, 16);
        assert_eq!(config.upload_dir, PathBuf::from("/var/lib/huddle/avatars"));
        assert!(config.unsafe_no_auth);

        let hub = config.hub_config();
        assert_eq!(hub.mailbox_capacity, 64);
        assert_eq!(hub.room_inbox_capacity, 16);
        assert_eq!(hub.history_limit, HISTORY_LIMIT);
    }

    #[test]
    #[serial]
    fn test_empty_default_room_falls_back() {
        let mut guard = EnvGuard::clean();
        guard.set("HUDDLE_DEFAULT_ROOM", "   ");

        let config = Config::from_env().expect("should parse config");
        assert_eq!(config.default_room, DEFAULT_ROOM);
    }

    #[test]
    #[serial]
    fn test_token_key_invalid_base64() {
        let mut guard = EnvGuard::clean();
        guard.set("HUDDLE_TOKEN_KEY", "not base64!!");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidFormat { ref var, .. } if var == "HUDDLE_TOKEN_KEY"));
    }

    #[test]
    #[serial]
    fn test_token_key_wrong_length() {
        let mut guard = EnvGuard::clean();
        guard.set("HUDDLE_TOKEN_KEY", &BASE64_STANDARD.encode([1u8; 16]));

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(ref msg) if msg.contains("32 bytes")));
    }

    #[test]
    #[serial]
    fn test_mailbox_smaller_than_history_rejected() {
        let mut guard = EnvGuard::clean();
        guard.set("HUDDLE_MAILBOX_CAPACITY", "16");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    #[serial]
    fn test_zero_inbox_rejected() {
        let mut guard = EnvGuard::clean();
        guard.set("HUDDLE_ROOM_INBOX_CAPACITY", "0");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    #[serial]
    fn test_zero_ttl_rejected() {
        let mut guard = EnvGuard::clean();
        guard.set("HUDDLE_TOKEN_TTL_SECS", "0");

        assert!(Config::from_env().is_err());
    }

    #[test]
    #[serial]
    fn test_non_numeric_capacity() {
        let mut guard = EnvGuard::clean();
        guard.set("HUDDLE_MAILBOX_CAPACITY", "lots");

        let err = Config::from_env().unwrap_err();
        assert!(
            matches!(err, ConfigError::InvalidFormat { ref var, .. } if var == "HUDDLE_MAILBOX_CAPACITY")
        );
    }

    #[test]
    #[serial]
    fn test_parse_bool_env() {
        let mut guard = EnvGuard::new();
        guard.set("TEST_BOOL", "True");
        assert!(parse_bool_env("TEST_BOOL"));

        guard.set("TEST_BOOL", "yes");
        assert!(!parse_bool_env("TEST_BOOL"));

        guard.remove("TEST_BOOL");
        assert!(!parse_bool_env("TEST_BOOL"));
    }

    #[test]
    #[serial]
    fn test_parse_port_custom() {
        let mut guard = EnvGuard::new();
        guard.set("PORT", "3000");

        assert_eq!(parse_port().expect("should parse port"), 3000);
    }

    #[test]
    #[serial]
    fn test_parse_port_invalid() {
        let mut guard = EnvGuard::new();
        guard.set("PORT", "not-a-number");

        assert!(matches!(parse_port().unwrap_err(), ConfigError::InvalidPort(_)));
    }

    #[test]
    #[serial]
    fn test_parse_port_out_of_range() {
        let mut guard = EnvGuard::new();
        guard.set("PORT", "99999");

        assert!(parse_port().is_err());
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }
}
