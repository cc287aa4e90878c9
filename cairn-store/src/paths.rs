//! Deterministic filesystem layout.
//!
//! Every path is a pure function of identifiers, rooted at the configured
//! base directory:
//!
//! ```text
//! <base>/stores/<storeId>/data/<aa>/<bb>/<rest>   content-addressed blobs
//! <base>/stores/<storeId>/<rootHash>.dat          root commitments
//! <base>/stores/<storeId>/manifest.dat            committed root list
//! <base>/sessions/<sessionId>/                    per-session staging area
//! ```

use std::path::{Component, Path, PathBuf};

use cairn_core::{Digest, RootHash, StoreId};

use crate::StoreError;

pub const MANIFEST_FILE: &str = "manifest.dat";
pub const DATA_DIR: &str = "data";

#[derive(Debug, Clone)]
pub struct StoreLayout {
    base: PathBuf,
}

impl StoreLayout {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn stores_root(&self) -> PathBuf {
        self.base.join("stores")
    }

    pub fn store_dir(&self, store_id: &StoreId) -> PathBuf {
        self.stores_root().join(store_id.as_str())
    }

    pub fn manifest_path(&self, store_id: &StoreId) -> PathBuf {
        self.store_dir(store_id).join(MANIFEST_FILE)
    }

    pub fn commitment_path(&self, store_id: &StoreId, root: &RootHash) -> PathBuf {
        self.store_dir(store_id)
            .join(format!("{}.dat", root.as_str()))
    }

    pub fn sessions_root(&self) -> PathBuf {
        self.base.join("sessions")
    }

    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.sessions_root().join(session_id)
    }
}

/// Canonical relative blob path for a content digest:
/// `data/<first two hex>/<next two>/<remaining 60>`.
pub fn blob_rel_path(digest: &Digest) -> PathBuf {
    let hex = digest.as_str();
    Path::new(DATA_DIR)
        .join(&hex[0..2])
        .join(&hex[2..4])
        .join(&hex[4..])
}

/// Validates a client-supplied relative path.
///
/// Uploaded and fetched filenames travel as URL suffixes; anything that
/// could escape the store or session directory (absolute paths, parent
/// components, drive prefixes) is rejected before it touches the
/// filesystem.
pub fn sanitize_rel_path(raw: &str) -> Result<PathBuf, StoreError> {
    if raw.is_empty() || raw.contains('\\') {
        return Err(StoreError::UnsafePath(raw.to_string()));
    }
    let path = Path::new(raw);
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            _ => return Err(StoreError::UnsafePath(raw.to_string())),
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(StoreError::UnsafePath(raw.to_string()));
    }
    Ok(clean)
}
