use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use cairn_core::{RootHash, StoreId};
use tokio::fs as async_fs;
use tracing::{debug, warn};

use crate::paths::{StoreLayout, MANIFEST_FILE};
use crate::StoreError;

/// Outcome of merging a session's staging area into the canonical tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MergeOutcome {
    pub copied: usize,
    /// Files skipped because the store already holds them. Blob names are
    /// content digests, so name equality is content equality.
    pub deduplicated: usize,
}

/// The canonical on-disk store tree plus the per-session staging areas.
///
/// Committed files are shared-read and only ever mutated through
/// [`Store::merge_session`], which never overwrites.
#[derive(Debug, Clone)]
pub struct Store {
    layout: StoreLayout,
}

impl Store {
    /// Opens the tree at `base`, creating the store and session roots when
    /// missing.
    pub fn open(base: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let layout = StoreLayout::new(base);
        fs::create_dir_all(layout.stores_root())?;
        fs::create_dir_all(layout.sessions_root())?;
        Ok(Self { layout })
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub async fn store_exists(&self, store_id: &StoreId) -> bool {
        async_fs::metadata(self.layout.store_dir(store_id))
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false)
    }

    pub async fn has_commitment(&self, store_id: &StoreId, root: &RootHash) -> bool {
        async_fs::metadata(self.layout.commitment_path(store_id, root))
            .await
            .map(|meta| meta.is_file())
            .unwrap_or(false)
    }

    /// Size of a committed file, or `None` when absent.
    pub async fn file_size(&self, store_id: &StoreId, rel: &Path) -> Option<u64> {
        let path = self.layout.store_dir(store_id).join(rel);
        async_fs::metadata(path)
            .await
            .ok()
            .filter(|meta| meta.is_file())
            .map(|meta| meta.len())
    }

    /// Opens a committed file for streaming reads.
    pub async fn open_file(
        &self,
        store_id: &StoreId,
        rel: &Path,
    ) -> Result<(async_fs::File, u64), StoreError> {
        let path = self.layout.store_dir(store_id).join(rel);
        let meta = async_fs::metadata(&path)
            .await
            .map_err(|_| StoreError::FileNotFound(rel.display().to_string()))?;
        if !meta.is_file() {
            return Err(StoreError::FileNotFound(rel.display().to_string()));
        }
        let file = async_fs::File::open(&path).await?;
        Ok((file, meta.len()))
    }

    pub async fn create_session_dir(&self, session_id: &str) -> Result<PathBuf, StoreError> {
        let dir = self.layout.session_dir(session_id);
        async_fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    pub async fn remove_session_dir(&self, session_id: &str) -> Result<(), StoreError> {
        let dir = self.layout.session_dir(session_id);
        match async_fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Removes staging areas left behind by a previous process run.
    pub async fn sweep_session_dirs(&self) -> Result<usize, StoreError> {
        let root = self.layout.sessions_root();
        let mut removed = 0;
        let mut entries = async_fs::read_dir(&root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Err(err) = async_fs::remove_dir_all(entry.path()).await {
                warn!(path = %entry.path().display(), %err, "could not remove stale session dir");
            } else {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "swept stale session directories");
        }
        Ok(removed)
    }

    /// Recursively copies a session's staging area into the store directory
    /// without overwriting, so re-uploads of content-addressed blobs keep
    /// the original bytes.
    pub async fn merge_session(
        &self,
        store_id: &StoreId,
        tmp_dir: &Path,
    ) -> Result<MergeOutcome, StoreError> {
        let src = tmp_dir.to_path_buf();
        let dst = self.layout.store_dir(store_id);
        tokio::task::spawn_blocking(move || -> Result<MergeOutcome, StoreError> {
            fs::create_dir_all(&dst)?;
            let mut outcome = MergeOutcome::default();
            copy_tree_no_overwrite(&src, &dst, &mut outcome)?;
            Ok(outcome)
        })
        .await
        .map_err(|_| StoreError::TaskFailed)?
    }

    /// Rewrites `manifest.dat` as the given root history filtered down to
    /// the commitments that exist on disk, oldest first. The file is
    /// replaced atomically through a rename.
    pub async fn regenerate_manifest(
        &self,
        store_id: &StoreId,
        history: &[RootHash],
    ) -> Result<(), StoreError> {
        let dir = self.layout.store_dir(store_id);
        if async_fs::metadata(&dir).await.is_err() {
            return Ok(());
        }
        let mut lines = String::new();
        for root in history {
            if self.has_commitment(store_id, root).await {
                lines.push_str(root.as_str());
                lines.push('\n');
            }
        }
        let manifest = self.layout.manifest_path(store_id);
        let staged = dir.join(format!("{MANIFEST_FILE}.next"));
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let mut file = fs::File::create(&staged)?;
            file.write_all(lines.as_bytes())?;
            file.sync_all()?;
            fs::rename(&staged, &manifest)?;
            Ok(())
        })
        .await
        .map_err(|_| StoreError::TaskFailed)?
    }
}

fn copy_tree_no_overwrite(
    src: &Path,
    dst: &Path,
    outcome: &mut MergeOutcome,
) -> Result<(), StoreError> {
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            fs::create_dir_all(&to)?;
            copy_tree_no_overwrite(&from, &to, outcome)?;
        } else if to.exists() {
            outcome.deduplicated += 1;
        } else {
            fs::copy(&from, &to)?;
            outcome.copied += 1;
        }
    }
    Ok(())
}
