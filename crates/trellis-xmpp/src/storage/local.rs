use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use jid::BareJid;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::Storage;
use crate::user::{Ask, Contact, Subscription, User};
use crate::XmppError;

/// Account store keeping one TOML file per bare JID in a directory.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    dir: PathBuf,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct UserRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    password: Option<String>,
    #[serde(default)]
    roster: BTreeMap<String, ContactRecord>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ContactRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default)]
    subscription: Subscription,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ask: Option<Ask>,
    #[serde(default)]
    groups: Vec<String>,
}

impl LocalStorage {
    /// Open a store rooted at `dir`, which must be an existing writable
    /// directory.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, XmppError> {
        let dir = dir.as_ref();
        let metadata = std::fs::metadata(dir).map_err(|e| {
            XmppError::config(format!("Storage directory {}: {}", dir.display(), e))
        })?;
        if !metadata.is_dir() || metadata.permissions().readonly() {
            return Err(XmppError::config(format!(
                "Must provide a writable storage directory: {}",
                dir.display()
            )));
        }
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn path_for(&self, jid: &BareJid) -> PathBuf {
        self.dir.join(jid.to_string())
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn find_user_by_jid(&self, jid: &BareJid) -> Result<Option<User>, XmppError> {
        let path = self.path_for(jid);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(XmppError::storage(format!("{}: {}", path.display(), e))),
        };
        let record: UserRecord = toml::from_str(&text)
            .map_err(|e| XmppError::storage(format!("{}: {}", path.display(), e)))?;

        let mut user = User::new(jid.clone());
        user.name = record.name;
        user.password = record.password;
        for (contact_jid, props) in record.roster {
            let Ok(contact_jid) = BareJid::new(&contact_jid) else {
                warn!(jid = %jid, contact = %contact_jid, "Skipping roster entry with invalid JID");
                continue;
            };
            user.roster.push(Contact {
                jid: contact_jid,
                name: props.name,
                subscription: props.subscription,
                ask: props.ask,
                groups: props.groups,
            });
        }
        Ok(Some(user))
    }

    async fn save_user(&self, user: &User) -> Result<(), XmppError> {
        let record = UserRecord {
            name: user.name.clone(),
            password: user.password.clone(),
            roster: user
                .roster
                .iter()
                .map(|c| {
                    (
                        c.jid.to_string(),
                        ContactRecord {
                            name: c.name.clone(),
                            subscription: c.subscription,
                            ask: c.ask,
                            groups: c.groups.clone(),
                        },
                    )
                })
                .collect(),
        };
        let text = toml::to_string(&record)
            .map_err(|e| XmppError::storage(format!("Failed to encode {}: {}", user.jid, e)))?;
        let path = self.path_for(&user.jid);
        tokio::fs::write(&path, text)
            .await
            .map_err(|e| XmppError::storage(format!("{}: {}", path.display(), e)))?;
        debug!(jid = %user.jid, path = %path.display(), "Saved user");
        Ok(())
    }
}
