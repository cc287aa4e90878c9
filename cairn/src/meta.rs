//! Client surface of the datastore metadata service.
//!
//! The network's metadata layer knows which roots a store has published and
//! which keys may write to it. The node only ever talks to it through
//! [`MetaService`], so tests and embedded deployments can substitute an
//! in-memory implementation.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use cairn_core::{RootHash, StoreId};
use serde::Deserialize;

/// External call budget; exceeding it fails the affected operation only.
const META_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait MetaService: Send + Sync {
    /// Ordered list of roots the store has published, oldest first.
    ///
    /// `bypass_cache` asks the service for a fresh answer; callers retry
    /// once with it before treating a root as unknown.
    async fn root_history(&self, store_id: &StoreId, bypass_cache: bool) -> Result<Vec<RootHash>>;

    /// Whether `public_key` may write to the store.
    async fn has_write_permission(&self, store_id: &StoreId, public_key: &str) -> Result<bool>;

    /// Tells the service a store directory materialized locally, so it can
    /// cache the store's creation height from its coin info.
    async fn store_created(&self, store_id: &StoreId) -> Result<()>;
}

/// HTTP client for a remote metadata service.
pub struct HttpMeta {
    endpoint: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct RootHistoryResponse {
    history: Vec<RootHash>,
}

#[derive(Deserialize)]
struct PermissionResponse {
    write: bool,
}

impl HttpMeta {
    pub fn new(endpoint: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(META_REQUEST_TIMEOUT)
            .build()
            .context("building metadata service client")?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl MetaService for HttpMeta {
    async fn root_history(&self, store_id: &StoreId, bypass_cache: bool) -> Result<Vec<RootHash>> {
        let mut url = format!("{}/stores/{}/root-history", self.endpoint, store_id);
        if bypass_cache {
            url.push_str("?bypass_cache=true");
        }
        let response: RootHistoryResponse = self
            .client
            .get(url)
            .send()
            .await
            .context("root history request")?
            .error_for_status()
            .context("root history status")?
            .json()
            .await
            .context("root history deserialization")?;
        Ok(response.history)
    }

    async fn has_write_permission(&self, store_id: &StoreId, public_key: &str) -> Result<bool> {
        let url = format!(
            "{}/stores/{}/permissions/{}",
            self.endpoint, store_id, public_key
        );
        let response: PermissionResponse = self
            .client
            .get(url)
            .send()
            .await
            .context("write permission request")?
            .error_for_status()
            .context("write permission status")?
            .json()
            .await
            .context("write permission deserialization")?;
        Ok(response.write)
    }

    async fn store_created(&self, store_id: &StoreId) -> Result<()> {
        let url = format!("{}/stores/{}/created", self.endpoint, store_id);
        self.client
            .post(url)
            .send()
            .await
            .context("store created request")?
            .error_for_status()
            .context("store created status")?;
        Ok(())
    }
}

/// In-memory metadata service for tests and embedded setups.
///
/// Root histories are registered up front; entries parked with
/// [`MemoryMeta::stage_root`] only become visible to a `bypass_cache`
/// lookup, which mimics a service whose cached answer lags the network.
#[derive(Default)]
pub struct MemoryMeta {
    inner: Mutex<MemoryMetaInner>,
}

#[derive(Default)]
struct MemoryMetaInner {
    histories: HashMap<StoreId, Vec<RootHash>>,
    staged: HashMap<StoreId, Vec<RootHash>>,
    writers: HashSet<(StoreId, String)>,
    created: Vec<StoreId>,
}

impl MemoryMeta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish_root(&self, store_id: &StoreId, root: &RootHash) {
        let mut inner = self.inner.lock().expect("meta lock poisoned");
        inner
            .histories
            .entry(store_id.clone())
            .or_default()
            .push(root.clone());
    }

    /// Registers a root that is only served once a cache-busting lookup
    /// happens.
    pub fn stage_root(&self, store_id: &StoreId, root: &RootHash) {
        let mut inner = self.inner.lock().expect("meta lock poisoned");
        inner
            .staged
            .entry(store_id.clone())
            .or_default()
            .push(root.clone());
    }

    pub fn allow_writer(&self, store_id: &StoreId, public_key: &str) {
        let mut inner = self.inner.lock().expect("meta lock poisoned");
        inner.writers.insert((store_id.clone(), public_key.to_string()));
    }

    pub fn created_stores(&self) -> Vec<StoreId> {
        self.inner.lock().expect("meta lock poisoned").created.clone()
    }
}

#[async_trait]
impl MetaService for MemoryMeta {
    async fn root_history(&self, store_id: &StoreId, bypass_cache: bool) -> Result<Vec<RootHash>> {
        let mut inner = self.inner.lock().expect("meta lock poisoned");
        if bypass_cache {
            if let Some(staged) = inner.staged.remove(store_id) {
                inner
                    .histories
                    .entry(store_id.clone())
                    .or_default()
                    .extend(staged);
            }
        }
        Ok(inner.histories.get(store_id).cloned().unwrap_or_default())
    }

    async fn has_write_permission(&self, store_id: &StoreId, public_key: &str) -> Result<bool> {
        let inner = self.inner.lock().expect("meta lock poisoned");
        Ok(inner
            .writers
            .contains(&(store_id.clone(), public_key.to_string())))
    }

    async fn store_created(&self, store_id: &StoreId) -> Result<()> {
        let mut inner = self.inner.lock().expect("meta lock poisoned");
        inner.created.push(store_id.clone());
        Ok(())
    }
}
