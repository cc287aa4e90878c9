//! Single-use upload nonces.
//!
//! Every file PUT must present a nonce previously issued for exactly that
//! `(store, session, filename)` triple. Validation consumes the entry, so a
//! captured signature cannot be replayed.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use cairn_core::StoreId;
use uuid::Uuid;

struct NonceEntry {
    nonce: String,
    expires_at: Instant,
}

pub struct NonceCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, NonceEntry>>,
}

/// Cache key for a file nonce.
pub fn nonce_key(store_id: &StoreId, session_id: &Uuid, filename: &str) -> String {
    format!("{}_{}_{}", store_id, session_id, filename)
}

impl NonceCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Issues a fresh nonce for `key`, replacing any previous one.
    pub fn issue(&self, key: String) -> String {
        let nonce = hex::encode(rand::random::<[u8; 16]>());
        let entry = NonceEntry {
            nonce: nonce.clone(),
            expires_at: Instant::now() + self.ttl,
        };
        self.entries
            .lock()
            .expect("nonce lock poisoned")
            .insert(key, entry);
        nonce
    }

    /// True iff a live entry for `key` matches `candidate`. The entry is
    /// removed before returning, so at most one call ever succeeds per
    /// issued nonce.
    pub fn validate_and_consume(&self, key: &str, candidate: &str) -> bool {
        let mut entries = self.entries.lock().expect("nonce lock poisoned");
        match entries.get(key) {
            Some(entry) if entry.expires_at <= Instant::now() => {
                entries.remove(key);
                false
            }
            Some(entry) if entry.nonce == candidate => {
                entries.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Drops expired entries; called from the maintenance tick.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.entries
            .lock()
            .expect("nonce lock poisoned")
            .retain(|_, entry| entry.expires_at > now);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(ttl: Duration) -> NonceCache {
        NonceCache::new(ttl)
    }

    #[test]
    fn issued_nonce_validates_exactly_once() {
        let cache = cache(Duration::from_secs(60));
        let nonce = cache.issue("k".into());

        assert!(cache.validate_and_consume("k", &nonce));
        assert!(!cache.validate_and_consume("k", &nonce));
    }

    #[test]
    fn wrong_candidate_keeps_entry() {
        let cache = cache(Duration::from_secs(60));
        let nonce = cache.issue("k".into());

        assert!(!cache.validate_and_consume("k", "not-the-nonce"));
        assert!(cache.validate_and_consume("k", &nonce));
    }

    #[test]
    fn expired_entries_fail_and_are_dropped() {
        let cache = cache(Duration::ZERO);
        let nonce = cache.issue("k".into());

        assert!(!cache.validate_and_consume("k", &nonce));
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn sweep_retains_live_entries() {
        let live_cache = cache(Duration::from_secs(60));
        live_cache.issue("live".into());
        live_cache.sweep();
        assert_eq!(live_cache.len(), 1);

        let expired = cache(Duration::ZERO);
        expired.issue("dead".into());
        expired.sweep();
        assert_eq!(expired.len(), 0);
    }

    #[test]
    fn nonces_are_32_hex_characters() {
        let cache = cache(Duration::from_secs(60));
        let nonce = cache.issue("k".into());
        assert_eq!(nonce.len(), 32);
        assert!(nonce.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
