//! Account persistence.
//!
//! Every virtual host is served by one [`Storage`] backend. Credentials are
//! kept as an HMAC-SHA-512 of the password keyed by the password itself over
//! the bare JID, so nothing stored can be replayed as a password.

mod local;
mod memory;

pub use local::LocalStorage;
pub use memory::MemoryStorage;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use jid::BareJid;
use sha2::Sha512;

use crate::user::User;
use crate::XmppError;

type HmacSha512 = Hmac<Sha512>;

/// Account store backing one or more virtual hosts.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Check a clear-text password against the stored credential.
    ///
    /// Returns `Ok(None)` for an unknown account or a wrong password. `Err`
    /// means the backend itself failed.
    async fn authenticate(&self, jid: &BareJid, password: &str) -> Result<Option<User>, XmppError> {
        let Some(user) = self.find_user_by_jid(jid).await? else {
            return Ok(None);
        };
        let expected = hash_password(password, jid)?;
        let matches = user
            .password
            .as_deref()
            .is_some_and(|stored| constant_time_eq(stored.as_bytes(), expected.as_bytes()));
        Ok(matches.then_some(user))
    }

    /// Load an account.
    async fn find_user_by_jid(&self, jid: &BareJid) -> Result<Option<User>, XmppError>;

    /// Create or replace an account.
    async fn save_user(&self, user: &User) -> Result<(), XmppError>;
}

/// Hex HMAC-SHA-512 credential for `password` on account `jid`.
pub fn hash_password(password: &str, jid: &BareJid) -> Result<String, XmppError> {
    let mut mac = HmacSha512::new_from_slice(password.as_bytes())
        .map_err(|e| XmppError::internal(format!("HMAC key rejected: {}", e)))?;
    mac.update(jid.to_string().as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time comparison to prevent timing attacks.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}
