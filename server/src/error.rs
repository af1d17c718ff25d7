//! Error types for the Huddle server.
//!
//! Module-local failures have their own `thiserror` enums next to the code
//! that produces them:
//!
//! - [`ConfigError`] - environment parsing and validation
//! - [`AuthError`](crate::auth::AuthError) - token issuance and validation
//! - [`RegistrationError`](crate::accounts::RegistrationError) - account creation
//! - [`TransportError`](crate::transport::TransportError) - WebSocket I/O
//!
//! [`ServerError`] is the top-level type used at the HTTP boundary and for
//! hub lifecycle failures. Each variant maps to a status code and a stable
//! machine-readable code for the JSON error body. Core routing never returns
//! errors: a failing connection is torn down and an undeliverable message is
//! dropped.
//!
//! # Example
//!
//! ```rust
//! use axum::http::StatusCode;
//! use huddle_server::error::ServerError;
//!
//! fn require_room(room: &str) -> Result<(), ServerError> {
//!     if room.trim().is_empty() {
//!         return Err(ServerError::validation("empty_room", "room name cannot be empty"));
//!     }
//!     Ok(())
//! }
//!
//! assert!(require_room("lobby").is_ok());
//!
//! let err = require_room("  ").unwrap_err();
//! assert!(err.is_client_error());
//! assert_eq!(err.status(), StatusCode::BAD_REQUEST);
//! assert_eq!(err.code(), "empty_room");
//! ```

use std::error::Error;
use std::fmt;

use axum::http::StatusCode;

use crate::accounts::RegistrationError;
use crate::auth::AuthError;
pub use crate::config::ConfigError;

/// Top-level error type for the Huddle server.
#[derive(Debug)]
pub enum ServerError {
    /// Configuration error during server initialization.
    Config(ConfigError),

    /// Bad credentials or an unusable token.
    Auth { code: &'static str, message: String },

    /// Malformed or rejected request input.
    Validation { code: &'static str, message: String },

    /// The addressed resource does not exist.
    NotFound { code: &'static str, message: String },

    /// The hub has begun shutting down and accepts no new connections.
    ShuttingDown,

    /// Unexpected internal server error.
    Internal(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(err) => write!(f, "configuration error: {err}"),
            Self::Auth { message, .. } => write!(f, "authentication failed: {message}"),
            Self::Validation { message, .. } => write!(f, "validation error: {message}"),
            Self::NotFound { message, .. } => write!(f, "not found: {message}"),
            Self::ShuttingDown => write!(f, "server is shutting down"),
            Self::Internal(msg) => write!(f, "internal server error: {msg}"),
        }
    }
}

impl Error for ServerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Config(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ConfigError> for ServerError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

impl From<AuthError> for ServerError {
    fn from(err: AuthError) -> Self {
        Self::auth("invalid_token", err.to_string())
    }
}

impl From<RegistrationError> for ServerError {
    fn from(err: RegistrationError) -> Self {
        match err {
            RegistrationError::Hashing(_) => Self::Internal(err.to_string()),
            _ => Self::validation(err.code(), err.to_string()),
        }
    }
}

impl ServerError {
    /// Creates a new authentication error.
    ///
    /// ```rust
    /// use huddle_server::error::ServerError;
    ///
    /// let err = ServerError::auth("invalid_credentials", "invalid username or password");
    /// assert!(matches!(err, ServerError::Auth { code: "invalid_credentials", .. }));
    /// ```
    pub fn auth(code: &'static str, message: impl Into<String>) -> Self {
        Self::Auth {
            code,
            message: message.into(),
        }
    }

    /// Creates a new validation error.
    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        Self::NotFound {
            code,
            message: message.into(),
        }
    }

    /// Creates a new internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Auth { .. } => StatusCode::UNAUTHORIZED,
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            Self::Config(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Auth { code, .. } | Self::Validation { code, .. } | Self::NotFound { code, .. } => {
                *code
            }
            Self::ShuttingDown => "shutting_down",
            Self::Config(_) | Self::Internal(_) => "server_error",
        }
    }

    /// Message safe to show a client. Server-side details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            Self::Auth { message, .. }
            | Self::Validation { message, .. }
            | Self::NotFound { message, .. } => message.clone(),
            Self::ShuttingDown => self.to_string(),
            Self::Config(_) | Self::Internal(_) => "internal server error".to_string(),
        }
    }

    /// Returns `true` if this error indicates a client-side problem.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Auth { .. } | Self::Validation { .. } | Self::NotFound { .. }
        )
    }

    /// Returns `true` if this error indicates a server-side problem.
    pub fn is_server_error(&self) -> bool {
        matches!(self, Self::Internal(_) | Self::Config(_) | Self::ShuttingDown)
    }
}

/// A specialized Result type for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;
