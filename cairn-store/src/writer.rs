//! Streaming blob sink.
//!
//! Request bodies arrive as async chunk streams but compression and disk
//! writes are blocking, so each sink owns a dedicated blocking task fed
//! through a bounded channel. The pipeline inside the task is
//! hashing → optional gzip → buffered file, which keeps the digest over the
//! pre-compression bytes.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use bytes::Bytes;
use cairn_core::{Digest, HashingWriter};
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::StoreError;

const CHANNEL_DEPTH: usize = 16;

enum Sink {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Sink::Plain(inner) => inner.write(buf),
            Sink::Gzip(inner) => inner.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Sink::Plain(inner) => inner.flush(),
            Sink::Gzip(inner) => inner.flush(),
        }
    }
}

impl Sink {
    fn finish(self) -> io::Result<()> {
        let mut inner = match self {
            Sink::Plain(inner) => inner,
            Sink::Gzip(encoder) => encoder.finish()?,
        };
        inner.flush()
    }
}

/// Result of a completed blob write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkOutcome {
    /// Digest of the bytes as received, before compression.
    pub digest: Digest,
    /// Number of bytes received.
    pub bytes_in: u64,
}

/// Asynchronous handle over a blocking write pipeline.
///
/// Dropping the handle without calling [`BlobSink::finish`] abandons the
/// write; the partial file is left behind for the owning session's cleanup.
pub struct BlobSink {
    tx: mpsc::Sender<Bytes>,
    worker: JoinHandle<io::Result<SinkOutcome>>,
}

impl BlobSink {
    /// Opens `path` for writing, creating missing parent directories.
    pub fn create(path: PathBuf, compress: bool) -> Self {
        let (tx, mut rx) = mpsc::channel::<Bytes>(CHANNEL_DEPTH);
        let worker = tokio::task::spawn_blocking(move || {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = BufWriter::new(File::create(&path)?);
            let sink = if compress {
                Sink::Gzip(GzEncoder::new(file, Compression::default()))
            } else {
                Sink::Plain(file)
            };
            let mut writer = HashingWriter::new(sink);
            while let Some(chunk) = rx.blocking_recv() {
                writer.write_all(&chunk)?;
            }
            let (sink, digest, bytes_in) = writer.finalize();
            sink.finish()?;
            Ok(SinkOutcome { digest, bytes_in })
        });
        Self { tx, worker }
    }

    pub async fn write(&self, chunk: Bytes) -> Result<(), StoreError> {
        self.tx
            .send(chunk)
            .await
            .map_err(|_| StoreError::WriterGone)
    }

    /// Closes the stream and waits for the pipeline to settle.
    pub async fn finish(self) -> Result<SinkOutcome, StoreError> {
        drop(self.tx);
        match self.worker.await {
            Ok(result) => result.map_err(StoreError::Io),
            Err(_) => Err(StoreError::WriterGone),
        }
    }
}
