//! Root-commitment documents (`<rootHash>.dat`).
//!
//! A commitment declares the Merkle root of one snapshot, the ordered leaf
//! hashes that recompute it, and the content digests of the blobs the
//! snapshot stores. Parsing is strict: duplicate file keys are rejected and
//! every hex value must already be canonical apart from letter case.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use thiserror::Error;

use crate::id::{Digest, ParseIdError, RootHash};
use crate::merkle::{contains_leaf, merkle_root};

#[derive(Debug, Error)]
pub enum CommitmentError {
    #[error("commitment text must not begin or end with whitespace")]
    SurroundingWhitespace,

    #[error("commitment is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("commitment declares root {declared} but {expected} was expected")]
    RootMismatch { declared: RootHash, expected: RootHash },

    #[error("commitment without leaves must declare the all-zero root")]
    EmptyTreeRoot,

    #[error("leaves recompute to {computed}, not the declared root")]
    LeavesMismatch { computed: RootHash },

    #[error("path {0:?} is not under data/")]
    NotDataPath(String),

    #[error("data path does not spell a sha-256 digest: {0}")]
    BadDataPath(#[source] ParseIdError),

    #[error("blob digest {observed} does not match path digest {expected}")]
    DigestMismatch { expected: Digest, observed: Digest },

    #[error("no file entry with content digest {0}")]
    UnknownFile(Digest),

    #[error("leaf {0} is not part of the committed tree")]
    LeafNotInTree(Digest),
}

/// A single entry of the `files` mapping.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FileEntry {
    /// Merkle leaf hash of the entry.
    pub hash: Digest,
    /// Content digest of the stored blob, before compression.
    pub sha256: Digest,
}

/// Leaf declaration of a commitment, split by the empty case since an empty
/// tree follows a different root rule.
#[derive(Debug, Clone)]
pub enum CommitmentLeaves {
    Empty,
    Present(Vec<Digest>),
}

#[derive(Debug, Clone)]
pub struct RootCommitment {
    root: RootHash,
    leaves: CommitmentLeaves,
    files: BTreeMap<String, FileEntry>,
}

/// `files` map that rejects duplicate keys.
///
/// `serde_json` silently keeps the last value for a repeated key; a repeated
/// key in a commitment is a sign of a forged or corrupted document, so the
/// parse fails instead.
struct FilesMap(BTreeMap<String, FileEntry>);

impl<'de> Deserialize<'de> for FilesMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FilesVisitor;

        impl<'de> Visitor<'de> for FilesVisitor {
            type Value = FilesMap;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of hex keys to file entries")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut entries = BTreeMap::new();
                while let Some((key, value)) = access.next_entry::<String, FileEntry>()? {
                    if key.is_empty() || !key.chars().all(|c| c.is_ascii_hexdigit()) {
                        return Err(serde::de::Error::custom(format!(
                            "file key {key:?} is not hex"
                        )));
                    }
                    let key = key.to_ascii_lowercase();
                    if entries.insert(key.clone(), value).is_some() {
                        return Err(serde::de::Error::custom(format!(
                            "duplicate file key {key:?}"
                        )));
                    }
                }
                Ok(FilesMap(entries))
            }
        }

        deserializer.deserialize_map(FilesVisitor)
    }
}

// Unknown fields are ignored on purpose; commitments written by newer
// publishers stay readable.
#[derive(Deserialize)]
struct RawCommitment {
    root: RootHash,
    leaves: Vec<Digest>,
    files: FilesMap,
}

impl RootCommitment {
    /// Parses a commitment document and checks its internal consistency
    /// against the root hash the caller expects (the `.dat` basename).
    pub fn parse(bytes: &[u8], expected_root: &RootHash) -> Result<Self, CommitmentError> {
        // serde_json skips insignificant whitespace around the document, so
        // padded text has to be caught before the parser sees it.
        if bytes.first().is_some_and(|byte| byte.is_ascii_whitespace())
            || bytes.last().is_some_and(|byte| byte.is_ascii_whitespace())
        {
            return Err(CommitmentError::SurroundingWhitespace);
        }
        let raw: RawCommitment = serde_json::from_slice(bytes)?;
        let commitment = Self {
            root: raw.root,
            leaves: if raw.leaves.is_empty() {
                CommitmentLeaves::Empty
            } else {
                CommitmentLeaves::Present(raw.leaves)
            },
            files: raw.files.0,
        };
        commitment.verify_root(expected_root)?;
        Ok(commitment)
    }

    fn verify_root(&self, expected: &RootHash) -> Result<(), CommitmentError> {
        if &self.root != expected {
            return Err(CommitmentError::RootMismatch {
                declared: self.root.clone(),
                expected: expected.clone(),
            });
        }
        match &self.leaves {
            CommitmentLeaves::Empty => {
                if !self.root.is_zero() {
                    return Err(CommitmentError::EmptyTreeRoot);
                }
            }
            CommitmentLeaves::Present(leaves) => {
                let computed = merkle_root(leaves);
                if computed != self.root {
                    return Err(CommitmentError::LeavesMismatch { computed });
                }
            }
        }
        Ok(())
    }

    pub fn root(&self) -> &RootHash {
        &self.root
    }

    pub fn files(&self) -> impl Iterator<Item = (&str, &FileEntry)> {
        self.files.iter().map(|(key, entry)| (key.as_str(), entry))
    }

    /// Per-file integrity check for a completed blob.
    ///
    /// The declared data path must spell the blob's digest, a file entry
    /// with that digest must exist, and the entry's leaf hash must be a
    /// member of the committed tree. Any failure means the blob does not
    /// belong to this snapshot.
    pub fn verify_file(&self, data_path: &str, observed: &Digest) -> Result<(), CommitmentError> {
        let expected = digest_from_data_path(data_path)?;
        if observed != &expected {
            return Err(CommitmentError::DigestMismatch { expected, observed: observed.clone() });
        }
        let entry = self
            .files
            .values()
            .find(|entry| entry.sha256 == expected)
            .ok_or_else(|| CommitmentError::UnknownFile(expected.clone()))?;
        match &self.leaves {
            CommitmentLeaves::Present(leaves) if contains_leaf(leaves, &entry.hash) => Ok(()),
            _ => Err(CommitmentError::LeafNotInTree(entry.hash.clone())),
        }
    }
}

/// Recovers the expected content digest from a `data/<aa>/<bb>/<rest>` path
/// by dropping the leading `data` component and concatenating the remaining
/// hex characters.
pub fn digest_from_data_path(path: &str) -> Result<Digest, CommitmentError> {
    let mut components = path.split('/');
    if components.next() != Some("data") {
        return Err(CommitmentError::NotDataPath(path.to_string()));
    }
    let hex: String = components.collect();
    hex.parse().map_err(CommitmentError::BadDataPath)
}
