//! Cached write-permission answers.
//!
//! Permission lookups go to the metadata service, which is slow relative to
//! a streaming upload, so answers are cached for a few minutes. A positive
//! answer slides on use; a stale `true` is acceptable because every blob is
//! still bounded by Merkle verification downstream.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use cairn_core::StoreId;

use crate::meta::MetaService;

type OwnerKey = (StoreId, String);

struct OwnerEntry {
    allowed: bool,
    expires_at: Instant,
}

pub struct OwnerCache {
    ttl: Duration,
    meta: Arc<dyn MetaService>,
    entries: Mutex<HashMap<OwnerKey, OwnerEntry>>,
}

impl OwnerCache {
    pub fn new(ttl: Duration, meta: Arc<dyn MetaService>) -> Self {
        Self {
            ttl,
            meta,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Whether `public_key` may write to the store, served from cache when
    /// a live entry exists.
    pub async fn is_owner(&self, store_id: &StoreId, public_key: &str) -> Result<bool> {
        let key = (store_id.clone(), public_key.to_string());
        {
            let mut entries = self.entries.lock().expect("owner lock poisoned");
            if let Some(entry) = entries.get_mut(&key) {
                if entry.expires_at > Instant::now() {
                    if entry.allowed {
                        entry.expires_at = Instant::now() + self.ttl;
                    }
                    return Ok(entry.allowed);
                }
                entries.remove(&key);
            }
        }

        let allowed = self.meta.has_write_permission(store_id, public_key).await?;
        self.entries.lock().expect("owner lock poisoned").insert(
            key,
            OwnerEntry {
                allowed,
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(allowed)
    }

    /// Slides the TTL of a positive cached answer; called while upload
    /// chunks stream in so a long transfer does not outlive its grant.
    pub fn touch(&self, store_id: &StoreId, public_key: &str) {
        let key = (store_id.clone(), public_key.to_string());
        let mut entries = self.entries.lock().expect("owner lock poisoned");
        if let Some(entry) = entries.get_mut(&key) {
            if entry.allowed && entry.expires_at > Instant::now() {
                entry.expires_at = Instant::now() + self.ttl;
            }
        }
    }

    pub fn sweep(&self) {
        let now = Instant::now();
        self.entries
            .lock()
            .expect("owner lock poisoned")
            .retain(|_, entry| entry.expires_at > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::MemoryMeta;

    fn store_id() -> StoreId {
        "a".repeat(64).parse().unwrap()
    }

    #[tokio::test]
    async fn caches_positive_and_negative_answers() {
        let meta = Arc::new(MemoryMeta::new());
        let id = store_id();
        meta.allow_writer(&id, "writer");
        let cache = OwnerCache::new(Duration::from_secs(60), meta.clone());

        assert!(cache.is_owner(&id, "writer").await.unwrap());
        assert!(!cache.is_owner(&id, "stranger").await.unwrap());

        // revoking upstream is not observed while the entry is live
        let fresh = Arc::new(MemoryMeta::new());
        let cache = OwnerCache::new(Duration::from_secs(60), fresh);
        cache.entries.lock().unwrap().insert(
            (id.clone(), "writer".to_string()),
            OwnerEntry {
                allowed: true,
                expires_at: Instant::now() + Duration::from_secs(60),
            },
        );
        assert!(cache.is_owner(&id, "writer").await.unwrap());
    }

    #[tokio::test]
    async fn expired_entry_refreshes_from_meta() {
        let meta = Arc::new(MemoryMeta::new());
        let id = store_id();
        let cache = OwnerCache::new(Duration::ZERO, meta.clone());

        assert!(!cache.is_owner(&id, "writer").await.unwrap());
        meta.allow_writer(&id, "writer");
        assert!(cache.is_owner(&id, "writer").await.unwrap());
    }
}
