//! In-memory account store for username/password login.
//!
//! Accounts are kept for the life of the process. Passwords are stored only
//! as bcrypt hashes, each with its own salt and work factor.
//!
//! bcrypt is CPU-bound: async callers should run [`AccountStore::register`]
//! and [`AccountStore::authenticate`] on a blocking thread.
//!
//! # Example
//!
//! ```rust
//! use huddle_server::accounts::{AccountStore, RegistrationError, MIN_HASH_COST};
//!
//! let store = AccountStore::with_cost(MIN_HASH_COST);
//! store.register("alice", "hunter2", Some("cat.png".into())).unwrap();
//!
//! assert!(store.authenticate("alice", "hunter2"));
//! assert!(!store.authenticate("alice", "wrong"));
//! assert_eq!(store.avatar("alice").as_deref(), Some("cat.png"));
//!
//! assert_eq!(
//!     store.register("alice", "again", None),
//!     Err(RegistrationError::NameTaken)
//! );
//! ```

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use thiserror::Error;
use tracing::{debug, trace, warn};

/// Maximum username length in characters.
pub const MAX_USERNAME_CHARS: usize = 24;

/// bcrypt work factor used by [`AccountStore::new`].
pub const DEFAULT_HASH_COST: u32 = 10;

/// Lowest work factor bcrypt accepts.
pub const MIN_HASH_COST: u32 = 4;

const MAX_HASH_COST: u32 = 31;

/// Reasons a registration is rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    /// Username or password is empty.
    #[error("username and password are required")]
    EmptyField,

    /// Username exceeds the length limit.
    #[error("username too long (max {max})")]
    NameTooLong { max: usize },

    /// Another account already uses this username.
    #[error("username already exists")]
    NameTaken,

    /// The password could not be hashed.
    #[error("failed to hash password: {0}")]
    Hashing(String),
}

impl RegistrationError {
    /// Stable machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmptyField => "empty_field",
            Self::NameTooLong { .. } => "name_too_long",
            Self::NameTaken => "name_taken",
            Self::Hashing(_) => "server_error",
        }
    }
}

#[derive(Debug, Clone)]
struct Account {
    password_hash: String,
    avatar: Option<String>,
}

/// Thread-safe store of registered accounts.
#[derive(Debug)]
pub struct AccountStore {
    accounts: RwLock<HashMap<String, Account>>,
    hash_cost: u32,
}

impl Default for AccountStore {
    fn default() -> Self {
        Self::with_cost(DEFAULT_HASH_COST)
    }
}

impl AccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store hashing with the given bcrypt work factor, clamped to
    /// the range bcrypt supports.
    pub fn with_cost(cost: u32) -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            hash_cost: cost.clamp(MIN_HASH_COST, MAX_HASH_COST),
        }
    }

    /// Creates an account.
    ///
    /// The username is trimmed before checks. An empty avatar counts as none.
    ///
    /// # Errors
    ///
    /// See [`RegistrationError`].
    pub fn register(
        &self,
        username: &str,
        password: &str,
        avatar: Option<String>,
    ) -> Result<(), RegistrationError> {
        let username = username.trim();
        if username.is_empty() || password.is_empty() {
            return Err(RegistrationError::EmptyField);
        }
        if username.chars().count() > MAX_USERNAME_CHARS {
            return Err(RegistrationError::NameTooLong {
                max: MAX_USERNAME_CHARS,
            });
        }
        if self.read().contains_key(username) {
            trace!(username = %username, "Registration rejected, name taken");
            return Err(RegistrationError::NameTaken);
        }

        let password_hash = bcrypt::hash(password, self.hash_cost)
            .map_err(|err| RegistrationError::Hashing(err.to_string()))?;
        let account = Account {
            password_hash,
            avatar: avatar.filter(|a| !a.trim().is_empty()),
        };

        let mut accounts = self
            .accounts
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if accounts.contains_key(username) {
            trace!(username = %username, "Registration lost race, name taken");
            return Err(RegistrationError::NameTaken);
        }
        accounts.insert(username.to_string(), account);
        debug!(username = %username, total = accounts.len(), "Account registered");
        Ok(())
    }

    /// Returns `true` if `password` matches the stored credentials.
    pub fn authenticate(&self, username: &str, password: &str) -> bool {
        let Some(password_hash) = self
            .read()
            .get(username.trim())
            .map(|account| account.password_hash.clone())
        else {
            return false;
        };

        bcrypt::verify(password, &password_hash).unwrap_or_else(|err| {
            warn!(username = %username.trim(), error = %err, "Stored password hash is unusable");
            false
        })
    }

    /// Avatar reference for `username`, if the account has one.
    pub fn avatar(&self, username: &str) -> Option<String> {
        self.read()
            .get(username.trim())
            .and_then(|account| account.avatar.clone())
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Account>> {
        self.accounts.read().unwrap_or_else(PoisonError::into_inner)
    }
}
