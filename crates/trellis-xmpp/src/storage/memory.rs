use async_trait::async_trait;
use dashmap::DashMap;
use jid::BareJid;
use tracing::debug;

use super::{hash_password, Storage};
use crate::user::User;
use crate::XmppError;

/// Volatile account store for tests and throwaway hosts.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    users: DashMap<BareJid, User>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an account with a clear-text password.
    pub fn with_user(self, jid: &str, password: &str) -> Result<Self, XmppError> {
        let jid = BareJid::new(jid).map_err(|e| XmppError::config(format!("Invalid JID '{}': {}", jid, e)))?;
        let mut user = User::new(jid.clone());
        user.password = Some(hash_password(password, &jid)?);
        self.users.insert(jid, user);
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn find_user_by_jid(&self, jid: &BareJid) -> Result<Option<User>, XmppError> {
        Ok(self.users.get(jid).map(|entry| entry.value().clone()))
    }

    async fn save_user(&self, user: &User) -> Result<(), XmppError> {
        debug!(jid = %user.jid, contacts = user.roster.len(), "Saving user");
        self.users.insert(user.jid.clone(), user.clone());
        Ok(())
    }
}
