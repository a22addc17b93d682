//! Server side digest authentication.
//!
//! Issues `WWW-Authenticate` challenges with bounded lifetime nonces and
//! validates `Authorization` responses using the MD5 digest construction of
//! RFC 2617 / RFC 8760.

use parking_lot::RwLock;
use std::collections::HashMap;

mod digest;
mod nonce;

pub use digest::{AuthError, DigestAuthenticator};
pub use nonce::{NonceError, NonceStore, NONCE_GC_AFTER, NONCE_VALID_FOR};

/// Credential store mapping usernames to their password.
///
/// Passwords are held in plaintext, matching the minimal store of the
/// deployments this serves. An HA1-at-rest store can be substituted without
/// touching the validation path.
#[derive(Default)]
pub struct UserStore {
    users: RwLock<HashMap<String, String>>,
}

impl UserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, username: impl Into<String>, password: impl Into<String>) {
        self.users.write().insert(username.into(), password.into());
    }

    pub fn remove_user(&self, username: &str) {
        self.users.write().remove(username);
    }

    pub fn password_of(&self, username: &str) -> Option<String> {
        self.users.read().get(username).cloned()
    }
}
