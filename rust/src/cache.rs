//! Local key-value cache.
//!
//! A fallback copy of the conversation list, message logs and profile, keyed by
//! the normalized local identity. Only consulted before the durable store has
//! delivered its first snapshot.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::core::message_log::LocalEntry;
use crate::error::CacheError;
use crate::identity::normalize_address;
use crate::state::{Conversation, Message};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedProfile {
    pub address: String,
    pub display_name: String,
}

#[derive(Debug, Default, PartialEq)]
pub struct CachedSession {
    pub chats: Vec<Conversation>,
    pub messages: HashMap<String, Vec<Message>>,
    /// Locally originated messages the store has not confirmed, by id.
    pub outbox: HashMap<String, LocalEntry>,
    pub profile: Option<CachedProfile>,
}

pub struct LocalCache {
    dir: PathBuf,
}

impl LocalCache {
    pub fn new(data_dir: &str) -> Self {
        Self {
            dir: Path::new(data_dir).join("cache"),
        }
    }

    fn path(&self, kind: &str, identity: &str) -> PathBuf {
        self.dir.join(format!("{kind}_{}.json", normalize_address(identity)))
    }

    fn read<T: DeserializeOwned>(&self, kind: &str, identity: &str) -> Result<Option<T>, CacheError> {
        let path = self.path(kind, identity);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    fn write<T: Serialize>(&self, kind: &str, identity: &str, value: &T) -> Result<(), CacheError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path(kind, identity);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec(value)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Missing files load as empty; unreadable ones are errors.
    pub fn load(&self, identity: &str) -> Result<CachedSession, CacheError> {
        Ok(CachedSession {
            chats: self.read("chats", identity)?.unwrap_or_default(),
            messages: self.read("messages", identity)?.unwrap_or_default(),
            outbox: self.read("outbox", identity)?.unwrap_or_default(),
            profile: self.read("profile", identity)?,
        })
    }

    pub fn save(
        &self,
        identity: &str,
        chats: &[Conversation],
        messages: &HashMap<String, Vec<Message>>,
        outbox: &HashMap<String, LocalEntry>,
        profile: &CachedProfile,
    ) -> Result<(), CacheError> {
        self.write("chats", identity, &chats)?;
        self.write("messages", identity, messages)?;
        self.write("outbox", identity, outbox)?;
        self.write("profile", identity, profile)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_by_normalized_identity() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(&dir.path().to_string_lossy());
        let chats = vec![Conversation::direct("c1".into(), "Asha".into(), "9876543210".into(), 5)];
        let profile = CachedProfile {
            address: "+91 91234 56780".into(),
            display_name: "Me".into(),
        };
        let mut outbox = HashMap::new();
        outbox.insert(
            "m1".to_string(),
            LocalEntry {
                accepted_at: 7,
                durable: false,
            },
        );
        cache.save("+91 91234 56780", &chats, &HashMap::new(), &outbox, &profile).unwrap();

        assert!(dir.path().join("cache").join("chats_9123456780.json").exists());
        let loaded = cache.load("9123456780").unwrap();
        assert_eq!(loaded.chats, chats);
        assert_eq!(loaded.outbox, outbox);
        assert_eq!(loaded.profile, Some(profile));
    }

    #[test]
    fn missing_cache_is_empty_and_garbage_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(&dir.path().to_string_lossy());
        assert_eq!(cache.load("9123456780").unwrap(), CachedSession::default());

        std::fs::create_dir_all(dir.path().join("cache")).unwrap();
        std::fs::write(dir.path().join("cache").join("chats_9123456780.json"), b"{nope").unwrap();
        assert!(matches!(cache.load("9123456780"), Err(CacheError::Serialization(_))));
    }
}
