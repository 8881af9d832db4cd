//! Namens-Cache
//!
//! Merkt sich Anzeigenamen von Peers, die per Gossip bekannt wurden, damit
//! sie auch ohne direkte Verbindung richtig angezeigt werden.

use super::kv::{KeyValueStore, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// Key-Präfix für gecachte Namen, gefolgt von der Peer-ID
pub const NAME_KEY_PREFIX: &str = "p2p_chat_user_";

/// Gespeicherter Eintrag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedName {
    pub name: String,
    /// Zeitpunkt der letzten Sichtung (Unix-Millisekunden)
    #[serde(rename = "seenAt")]
    pub seen_at: i64,
}

/// Store-gestützter Cache `peer_id → Name`
#[derive(Clone)]
pub struct NameCache {
    store: Arc<dyn KeyValueStore>,
}

impl NameCache {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    fn key(peer_id: &str) -> String {
        format!("{NAME_KEY_PREFIX}{peer_id}")
    }

    /// Speichert oder aktualisiert einen Namen
    pub fn remember(&self, peer_id: &str, name: &str, seen_at: i64) -> Result<(), StoreError> {
        let entry = CachedName {
            name: name.to_string(),
            seen_at,
        };
        let value = serde_json::to_string(&entry)?;
        self.store.set(&Self::key(peer_id), &value)
    }

    /// Liest einen Namen; unlesbare Einträge gelten als nicht vorhanden
    pub fn lookup(&self, peer_id: &str) -> Option<CachedName> {
        match self.store.get(&Self::key(peer_id)) {
            Ok(Some(raw)) => serde_json::from_str(&raw).ok(),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("Name cache lookup for {} failed: {}", peer_id, e);
                None
            }
        }
    }

    pub fn forget(&self, peer_id: &str) -> Result<(), StoreError> {
        self.store.remove(&Self::key(peer_id))
    }

    /// Entfernt alle Einträge, die älter als `cutoff` sind und nicht zu
    /// einem aktiven Peer gehören. Gibt die entfernten Peer-IDs zurück.
    pub fn prune(&self, active: &HashSet<String>, cutoff: i64) -> Result<Vec<String>, StoreError> {
        let mut removed = Vec::new();
        for key in self.store.list_keys(NAME_KEY_PREFIX)? {
            let peer_id = &key[NAME_KEY_PREFIX.len()..];
            if active.contains(peer_id) {
                continue;
            }
            let stale = match self.store.get(&key)? {
                Some(raw) => serde_json::from_str::<CachedName>(&raw)
                    .map(|entry| entry.seen_at < cutoff)
                    .unwrap_or(true),
                None => false,
            };
            if stale {
                self.store.remove(&key)?;
                removed.push(peer_id.to_string());
            }
        }
        Ok(removed)
    }
}

impl std::fmt::Debug for NameCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NameCache").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKeyValueStore;

    #[test]
    fn test_prune_keeps_active_and_fresh_entries() {
        let store = Arc::new(MemoryKeyValueStore::new());
        let cache = NameCache::new(store.clone());

        cache.remember("old", "Old", 1_000).unwrap();
        cache.remember("active", "Active", 1_000).unwrap();
        cache.remember("fresh", "Fresh", 9_000).unwrap();
        store.set("p2p_chat_user_broken", "not json").unwrap();

        let active: HashSet<String> = ["active".to_string()].into_iter().collect();
        let mut removed = cache.prune(&active, 5_000).unwrap();
        removed.sort();

        assert_eq!(removed, vec!["broken".to_string(), "old".to_string()]);
        assert!(cache.lookup("active").is_some());
        assert_eq!(cache.lookup("fresh").unwrap().name, "Fresh");
        assert!(cache.lookup("old").is_none());
    }

    #[test]
    fn test_username_key_is_not_a_cached_name() {
        let store = Arc::new(MemoryKeyValueStore::new());
        store.set("p2p_chat_username", "Me").unwrap();
        let cache = NameCache::new(store.clone());

        cache.prune(&HashSet::new(), i64::MAX).unwrap();
        assert_eq!(store.get("p2p_chat_username").unwrap().as_deref(), Some("Me"));
    }
}
