pub mod commitment;
pub mod hashing;
pub mod id;
pub mod merkle;
pub mod signature;

pub use commitment::{CommitmentError, FileEntry, RootCommitment};
pub use hashing::{sha256_hex, HashingWriter};
pub use id::{Digest, ParseIdError, RootHash, StoreId};
pub use merkle::merkle_root;
pub use signature::verify_key_ownership_signature;
