//! Byte-source abstraction consumed by the demuxer.
//!
//! Wraps an externally supplied seekable stream behind read/seek/size so the
//! container probe can run over files, in-memory buffers, or any custom
//! transport. Writing is not part of the contract.

use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom};

use symphonia::core::io::MediaSource;

/// A seekable, readable stream of container bytes.
///
/// The engine only ever reads and seeks; there is no write operation.
pub trait ByteSource: Send + Sync {
    /// Read up to `buf.len()` bytes, returning the count (0 at end of stream).
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Reposition the stream, returning the new absolute offset.
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64>;

    /// Total size in bytes, when known.
    fn size(&self) -> Option<u64>;
}

impl ByteSource for File {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(self, buf)
    }

    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        Seek::seek(self, pos)
    }

    fn size(&self) -> Option<u64> {
        self.metadata().ok().map(|m| m.len())
    }
}

impl<T> ByteSource for Cursor<T>
where
    T: AsRef<[u8]> + Send + Sync,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(self, buf)
    }

    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        Seek::seek(self, pos)
    }

    fn size(&self) -> Option<u64> {
        Some(self.get_ref().as_ref().len() as u64)
    }
}

/// Adapter presenting a [`ByteSource`] to the demuxer as a `MediaSource`.
pub(crate) struct SourceAdapter {
    inner: Box<dyn ByteSource>,
}

impl SourceAdapter {
    pub(crate) fn new(inner: Box<dyn ByteSource>) -> Self {
        Self { inner }
    }
}

impl Read for SourceAdapter {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Seek for SourceAdapter {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}

impl MediaSource for SourceAdapter {
    fn is_seekable(&self) -> bool {
        true
    }

    fn byte_len(&self) -> Option<u64> {
        self.inner.size()
    }
}
