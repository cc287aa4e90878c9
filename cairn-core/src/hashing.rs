use std::io::{self, Write};

use sha2::{Digest as _, Sha256};

use crate::id::Digest;

/// A write-through sha-256 observer.
///
/// Forwards every byte unchanged to the inner writer while maintaining a
/// running digest of the bytes it has seen. Composes with other writers, so
/// a sink can be layered as hashing → compressor → file and the digest
/// covers the pre-compression bytes.
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    bytes_written: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes_written: 0,
        }
    }

    /// Consumes the writer and returns the inner sink together with the
    /// final digest and the number of bytes observed.
    pub fn finalize(self) -> (W, Digest, u64) {
        let digest = Digest::from_bytes(self.hasher.finalize().into());
        (self.inner, digest, self.bytes_written)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.update(&buf[..written]);
        self.bytes_written += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Digest of a complete in-memory buffer, for callers that do not stream.
pub fn sha256_hex(bytes: &[u8]) -> Digest {
    Digest::from_bytes(Sha256::digest(bytes).into())
}
