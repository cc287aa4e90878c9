pub mod paths;
pub mod store;
pub mod writer;

use thiserror::Error;

pub use paths::{blob_rel_path, sanitize_rel_path, StoreLayout};
pub use store::{MergeOutcome, Store};
pub use writer::{BlobSink, SinkOutcome};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("unsafe relative path {0:?}")]
    UnsafePath(String),

    #[error("no such file {0:?}")]
    FileNotFound(String),

    #[error("blob writer task ended unexpectedly")]
    WriterGone,

    #[error("filesystem task ended unexpectedly")]
    TaskFailed,
}
