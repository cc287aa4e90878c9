use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as AnyhowContext, Result};
use cairn_store::Store;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::http::api::AppState;
use crate::http::rate_limit::RateLimiter;
use crate::meta::MetaService;
use crate::nonce::NonceCache;
use crate::ownership::OwnerCache;
use crate::session::SessionRegistry;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

/// Assembled node: the store tree, the three registries and the wired
/// request state. Construction opens the base directory and sweeps staging
/// areas a previous run may have left behind.
pub struct Context {
    config: Config,
    state: AppState,
}

impl Context {
    pub async fn build(config: Config, meta: Arc<dyn MetaService>) -> Result<Self> {
        let store = Store::open(&config.base_dir)
            .with_context(|| format!("opening store tree at {}", config.base_dir.display()))?;
        match store.sweep_session_dirs().await {
            Ok(0) => {}
            Ok(removed) => info!(removed, "removed stale session staging areas"),
            Err(err) => warn!(%err, "could not sweep stale session staging areas"),
        }

        let sessions = SessionRegistry::new(store.clone(), config.session_ttl());
        let nonces = Arc::new(NonceCache::new(config.nonce_ttl()));
        let owners = Arc::new(OwnerCache::new(config.owner_cache_ttl(), meta.clone()));
        let upload_limiter = Arc::new(RateLimiter::new(
            config.rate_limits.upload_start_max,
            Duration::from_secs(config.rate_limits.upload_start_window_secs),
        ));
        let fetch_limiter = Arc::new(RateLimiter::new(
            config.rate_limits.fetch_max,
            Duration::from_secs(config.rate_limits.fetch_window_secs),
        ));

        let state = AppState {
            store,
            sessions,
            nonces,
            owners,
            meta,
            store_owner: config.store_owner.clone(),
            upload_limiter,
            fetch_limiter,
        };
        Ok(Self { config, state })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn log_configuration(&self) {
        info!(
            base_dir = %self.config.base_dir.display(),
            bind = %format!("{}:{}", self.config.bind_host, self.config.bind_port),
            tls = self.config.tls_cert.is_some(),
            session_ttl_secs = self.config.session_ttl_secs,
            nonce_ttl_secs = self.config.nonce_ttl_secs,
            owner_cache_ttl_secs = self.config.owner_cache_ttl_secs,
            "node configured"
        );
    }

    /// Periodic sweep of the TTL-bounded registries.
    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        let state = self.state.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(MAINTENANCE_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                state.nonces.sweep();
                state.owners.sweep();
                state.upload_limiter.sweep();
                state.fetch_limiter.sweep();
            }
        })
    }
}
