//! Upload session registry.
//!
//! A session is the server-side context of one pending snapshot: an
//! exclusive staging directory, the accepted root commitment, and a sliding
//! idle deadline. The registry owns every session; all registry mutations
//! go through its lock, so a commit taking a session and its expiry timer
//! destroying it can never both win.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cairn_core::{RootCommitment, RootHash, StoreId};
use cairn_store::{Store, StoreError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

pub struct Session {
    id: Uuid,
    store_id: StoreId,
    ttl: Duration,
    /// Minimum spacing between deadline re-arms. Streaming uploads observe
    /// every chunk; re-arming per chunk would be unbounded work.
    bump_interval: Duration,
    state: Mutex<SessionState>,
    cancel: CancellationToken,
}

struct SessionState {
    commitment: Option<Arc<RootCommitment>>,
    deadline: Instant,
    last_bump: Instant,
}

impl Session {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn store_id(&self) -> &StoreId {
        &self.store_id
    }

    pub fn commitment(&self) -> Option<Arc<RootCommitment>> {
        self.state.lock().expect("session lock poisoned").commitment.clone()
    }

    pub fn root_hash(&self) -> Option<RootHash> {
        self.commitment().map(|commitment| commitment.root().clone())
    }

    /// Installs the accepted commitment. The commitment is immutable once
    /// set; a second call is refused.
    pub fn set_commitment(&self, commitment: Arc<RootCommitment>) -> bool {
        let mut state = self.state.lock().expect("session lock poisoned");
        if state.commitment.is_some() {
            return false;
        }
        state.commitment = Some(commitment);
        true
    }

    /// Slides the idle deadline to now + TTL, at most once per
    /// `bump_interval`.
    pub fn bump(&self) {
        let mut state = self.state.lock().expect("session lock poisoned");
        let now = Instant::now();
        if now.duration_since(state.last_bump) < self.bump_interval {
            return;
        }
        state.last_bump = now;
        state.deadline = now + self.ttl;
    }

    fn deadline(&self) -> Instant {
        self.state.lock().expect("session lock poisoned").deadline
    }
}

#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    store: Store,
    ttl: Duration,
    sessions: Mutex<HashMap<Uuid, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new(store: Store, ttl: Duration) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                store,
                ttl,
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Creates a session with a fresh staging directory and arms its idle
    /// timer.
    pub async fn create(&self, store_id: StoreId) -> Result<Arc<Session>, StoreError> {
        let id = Uuid::new_v4();
        self.inner.store.create_session_dir(&id.to_string()).await?;

        let now = Instant::now();
        let ttl = self.inner.ttl;
        let session = Arc::new(Session {
            id,
            store_id,
            ttl,
            bump_interval: (ttl / 10).min(Duration::from_secs(1)),
            state: Mutex::new(SessionState {
                commitment: None,
                deadline: now + ttl,
                last_bump: now,
            }),
            cancel: CancellationToken::new(),
        });

        self.inner
            .sessions
            .lock()
            .expect("registry lock poisoned")
            .insert(id, session.clone());
        tokio::spawn(expire_when_idle(self.inner.clone(), session.clone()));

        debug!(session = %id, store = %session.store_id, "session created");
        Ok(session)
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<Session>> {
        self.inner
            .sessions
            .lock()
            .expect("registry lock poisoned")
            .get(id)
            .cloned()
    }

    /// Removes the session from the registry and disarms its timer, leaving
    /// the staging directory for the caller. Exactly one caller wins a
    /// given session; the commit path uses this to shut the expiry race
    /// out.
    pub fn take(&self, id: &Uuid) -> Option<Arc<Session>> {
        self.inner.take(id)
    }

    /// Tears a session down: unregister, disarm, delete the staging area.
    /// Idempotent; returns whether the session still existed.
    pub async fn destroy(&self, id: &Uuid) -> bool {
        self.inner.destroy(id).await
    }

    /// Path of the staging directory owned by `session`.
    pub fn staging_dir(&self, session: &Session) -> std::path::PathBuf {
        self.inner.store.layout().session_dir(&session.id().to_string())
    }

    /// Deletes a taken session's staging directory.
    pub async fn reclaim_staging(&self, session: &Session) {
        self.inner.reclaim_staging(session.id()).await;
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.sessions.lock().unwrap().len()
    }
}

impl RegistryInner {
    fn take(&self, id: &Uuid) -> Option<Arc<Session>> {
        let session = self
            .sessions
            .lock()
            .expect("registry lock poisoned")
            .remove(id)?;
        session.cancel.cancel();
        Some(session)
    }

    async fn destroy(&self, id: &Uuid) -> bool {
        match self.take(id) {
            Some(session) => {
                self.reclaim_staging(session.id()).await;
                debug!(session = %id, "session destroyed");
                true
            }
            None => false,
        }
    }

    async fn reclaim_staging(&self, id: Uuid) {
        if let Err(err) = self.store.remove_session_dir(&id.to_string()).await {
            warn!(session = %id, %err, "could not remove session staging dir");
        }
    }
}

/// Per-session expiry task. Sleeps to the current deadline and re-checks it
/// on wake, so a bump simply moves the target of the next wake-up.
async fn expire_when_idle(inner: Arc<RegistryInner>, session: Arc<Session>) {
    loop {
        let deadline = session.deadline();
        tokio::select! {
            _ = session.cancel.cancelled() => return,
            _ = tokio::time::sleep_until(deadline) => {
                if Instant::now() >= session.deadline() {
                    debug!(session = %session.id(), "session idle deadline passed");
                    inner.destroy(&session.id()).await;
                    return;
                }
            }
        }
    }
}

/// Whether a staged file exists for `rel` inside the session's directory.
pub async fn staged_file_exists(staging: &Path, rel: &Path) -> bool {
    tokio::fs::metadata(staging.join(rel))
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_id() -> StoreId {
        "a".repeat(64).parse().unwrap()
    }

    async fn registry(ttl: Duration) -> (tempfile::TempDir, SessionRegistry) {
        let base = tempfile::tempdir().unwrap();
        let store = Store::open(base.path()).unwrap();
        let registry = SessionRegistry::new(store, ttl);
        (base, registry)
    }

    #[tokio::test]
    async fn idle_session_expires_and_staging_is_reclaimed() {
        let (_base, registry) = registry(Duration::from_millis(80)).await;
        let session = registry.create(store_id()).await.unwrap();
        let staging = registry.staging_dir(&session);
        assert!(staging.is_dir());

        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(registry.get(&session.id()).is_none());
        assert!(!staging.exists());
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn bump_slides_the_deadline() {
        let (_base, registry) = registry(Duration::from_millis(300)).await;
        let session = registry.create(store_id()).await.unwrap();

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(150)).await;
            session.bump();
        }
        assert!(registry.get(&session.id()).is_some());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(registry.get(&session.id()).is_none());
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let (_base, registry) = registry(Duration::from_secs(60)).await;
        let session = registry.create(store_id()).await.unwrap();

        assert!(registry.destroy(&session.id()).await);
        assert!(!registry.destroy(&session.id()).await);
        assert!(registry.get(&session.id()).is_none());
    }

    #[tokio::test]
    async fn take_wins_over_later_destroy() {
        let (_base, registry) = registry(Duration::from_secs(60)).await;
        let session = registry.create(store_id()).await.unwrap();

        let taken = registry.take(&session.id()).expect("first take wins");
        assert!(registry.take(&session.id()).is_none());
        assert!(!registry.destroy(&session.id()).await);

        // the staging dir is still the taker's to reclaim
        let staging = registry.staging_dir(&taken);
        assert!(staging.is_dir());
        registry.reclaim_staging(&taken).await;
        assert!(!staging.exists());
    }

    #[tokio::test]
    async fn commitment_is_write_once() {
        let (_base, registry) = registry(Duration::from_secs(60)).await;
        let session = registry.create(store_id()).await.unwrap();

        let zero = RootHash::zero();
        let bytes = format!(r#"{{"root":"{}","leaves":[],"files":{{}}}}"#, zero);
        let commitment = Arc::new(RootCommitment::parse(bytes.as_bytes(), &zero).unwrap());

        assert!(session.root_hash().is_none());
        assert!(session.set_commitment(commitment.clone()));
        assert!(!session.set_commitment(commitment));
        assert_eq!(session.root_hash(), Some(zero));
    }
}
