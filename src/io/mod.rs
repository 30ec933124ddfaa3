//! Transport abstraction under the lookahead buffer.
//!
//! Sessions never talk to a reader directly; they own a [`ByteSource`]
//! wrapped in a lookahead buffer. The trait is deliberately small: a
//! blocking read of up to N bytes, an optional cheap skip, and an
//! optional known total size. Sinks stay plain [`std::io::Write`].

use std::io::{self, Read, Seek, SeekFrom};

pub mod lookahead;

/// Size of the scratch buffer used by read-and-discard skips.
const SKIP_CHUNK: usize = 8 * 1024;

/// Blocking byte transport feeding a read session.
///
/// `read` returning 0 means end of stream. Implementations may be
/// non-seekable and of unknown length; sessions only require forward
/// reads. `skip` exists so seekable transports can avoid decoding bytes
/// nobody asked for.
pub trait ByteSource: Send {
    /// Read up to `buf.len()` bytes; 0 means EOF.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Discard up to `n` bytes, returning how many were actually skipped
    /// (fewer only at EOF). The default reads and discards.
    fn skip(&mut self, n: u64) -> io::Result<u64> {
        let mut scratch = [0u8; SKIP_CHUNK];
        let mut skipped = 0u64;
        while skipped < n {
            let want = usize::try_from((n - skipped).min(SKIP_CHUNK as u64)).unwrap_or(SKIP_CHUNK);
            let got = self.read(&mut scratch[..want])?;
            if got == 0 {
                break;
            }
            skipped += got as u64;
        }
        Ok(skipped)
    }

    /// Total stream size when the transport knows it up front.
    fn total_size(&self) -> Option<u64> {
        None
    }
}

impl ByteSource for Box<dyn ByteSource> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf)
    }

    fn skip(&mut self, n: u64) -> io::Result<u64> {
        (**self).skip(n)
    }

    fn total_size(&self) -> Option<u64> {
        (**self).total_size()
    }
}

/// Adapter for any plain reader (pipes, sockets, in-memory cursors).
pub struct ReaderSource<R> {
    inner: R,
}

impl<R: Read + Send> ReaderSource<R> {
    /// Wrap a reader as a forward-only source.
    #[must_use]
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

impl<R: Read + Send> ByteSource for ReaderSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

/// Adapter for seekable transports (files): skips seek instead of
/// reading, and reports the total size captured at construction.
pub struct SeekableSource<R> {
    inner: R,
    pos: u64,
    len: u64,
}

impl<R: Read + Seek + Send> SeekableSource<R> {
    /// Wrap a seekable reader, measuring its length once.
    ///
    /// The reader is left positioned where it was handed in; bytes before
    /// that position are not part of the session's stream.
    pub fn new(mut inner: R) -> io::Result<Self> {
        let pos = inner.stream_position()?;
        let len = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(pos))?;
        Ok(Self { inner, pos, len })
    }
}

impl<R: Read + Seek + Send> ByteSource for SeekableSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let got = self.inner.read(buf)?;
        self.pos += got as u64;
        Ok(got)
    }

    fn skip(&mut self, n: u64) -> io::Result<u64> {
        let remaining = self.len.saturating_sub(self.pos);
        let step = n.min(remaining);
        if step > 0 {
            self.pos = self.inner.seek(SeekFrom::Start(self.pos + step))?;
        }
        Ok(step)
    }

    fn total_size(&self) -> Option<u64> {
        Some(self.len.saturating_sub(self.pos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn reader_source_reports_eof_as_zero() {
        let mut source = ReaderSource::new(Cursor::new(vec![1u8, 2, 3]));
        let mut buf = [0u8; 8];
        assert_eq!(source.read(&mut buf).unwrap(), 3);
        assert_eq!(source.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn default_skip_reads_and_discards() {
        let mut source = ReaderSource::new(Cursor::new(vec![7u8; 100]));
        assert_eq!(source.skip(64).unwrap(), 64);
        let mut buf = [0u8; 100];
        assert_eq!(source.read(&mut buf).unwrap(), 36);
        assert_eq!(source.skip(10).unwrap(), 0, "EOF caps the skip");
    }

    #[test]
    fn seekable_source_skips_by_seeking_and_knows_size() {
        let mut source = SeekableSource::new(Cursor::new((0u8..100).collect::<Vec<_>>())).unwrap();
        assert_eq!(source.total_size(), Some(100));
        assert_eq!(source.skip(90).unwrap(), 90);
        assert_eq!(source.skip(20).unwrap(), 10, "clamped at EOF");
        let mut buf = [0u8; 4];
        assert_eq!(source.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn seekable_source_starts_at_current_position() {
        let mut cursor = Cursor::new((0u8..10).collect::<Vec<_>>());
        cursor.seek(SeekFrom::Start(4)).unwrap();
        let mut source = SeekableSource::new(cursor).unwrap();
        assert_eq!(source.total_size(), Some(6));
        let mut buf = [0u8; 2];
        source.read(&mut buf).unwrap();
        assert_eq!(buf, [4, 5]);
    }
}
