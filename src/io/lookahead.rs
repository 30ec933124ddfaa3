//! Growable lookahead buffer over a [`ByteSource`].
//!
//! Detection needs to inspect stream prefixes without committing to
//! them: every bidder peeks at the same bytes, and only the winner's
//! reader consumes anything. [`Lookahead`] provides exactly that
//! contract: `peek` grows an internal buffer until enough bytes are
//! visible (or EOF truncates the view), `consume` retires bytes from
//! the front, and plain [`Read`](io::Read) pulls consume-style for
//! payload delivery, bypassing the buffer entirely once it is empty.
//!
//! Offsets reported in errors count consumed bytes from the start of
//! this stage's stream, so a corrupt header inside a gzip member is
//! reported at its decoded offset, not the compressed one.

use std::io;

use crate::error::Error;
use crate::io::ByteSource;
use crate::Result;

/// Initial buffer capacity; grows by doubling when a peek wants more.
const INITIAL_CAPACITY: usize = 16 * 1024;

/// Buffered forward-only view of a byte stream.
pub struct Lookahead {
    src: Box<dyn ByteSource>,
    /// Storage; `buf[consumed..buffered]` holds peekable bytes.
    buf: Vec<u8>,
    consumed: usize,
    buffered: usize,
    exhausted: bool,
    /// Stream offset of the next unconsumed byte.
    offset: u64,
    /// Stage name used in error context ("archive", "gzip", ...).
    label: &'static str,
}

impl std::fmt::Debug for Lookahead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lookahead")
            .field("label", &self.label)
            .field("offset", &self.offset)
            .field("buffered", &(self.buffered - self.consumed))
            .field("exhausted", &self.exhausted)
            .finish_non_exhaustive()
    }
}

impl Lookahead {
    /// Wrap a boxed source. `label` names the stage in error messages.
    #[must_use]
    pub fn new(src: Box<dyn ByteSource>, label: &'static str) -> Self {
        Self {
            src,
            buf: Vec::new(),
            consumed: 0,
            buffered: 0,
            exhausted: false,
            offset: 0,
            label,
        }
    }

    /// Convenience constructor boxing a concrete source.
    #[must_use]
    pub fn from_source<S: ByteSource + 'static>(src: S, label: &'static str) -> Self {
        Self::new(Box::new(src), label)
    }

    /// Bytes currently buffered and not yet consumed.
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffered - self.consumed
    }

    /// Offset of the next unconsumed byte from the start of this stage.
    #[must_use]
    pub fn stream_offset(&self) -> u64 {
        self.offset
    }

    /// Whether the underlying source has reported EOF.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.exhausted && self.available() == 0
    }

    /// Bytes remaining from the current position, when the transport
    /// knows its size. Buffered bytes count as remaining.
    #[must_use]
    pub fn total_size(&self) -> Option<u64> {
        self.src
            .total_size()
            .map(|rest| rest + self.available() as u64)
    }

    /// Return a view of at least `min` unconsumed bytes without
    /// consuming them. The slice may be longer than requested; it is
    /// shorter only when EOF arrives first. Repeated peeks are
    /// idempotent until `consume` moves the front.
    pub fn peek(&mut self, min: usize) -> Result<&[u8]> {
        self.fill(min)?;
        Ok(&self.buf[self.consumed..self.buffered])
    }

    /// Retire `n` bytes from the front of the buffer.
    ///
    /// # Panics
    ///
    /// Consuming more than [`available`](Self::available) is a bug in
    /// the calling reader, not a stream condition, and panics.
    pub fn consume(&mut self, n: usize) {
        assert!(
            n <= self.available(),
            "{}: consumed {n} bytes with only {} buffered",
            self.label,
            self.available()
        );
        self.consumed += n;
        self.offset += n as u64;
        if self.consumed == self.buffered {
            self.consumed = 0;
            self.buffered = 0;
        }
    }

    /// Discard up to `n` bytes, buffered first, then via the source's
    /// own skip. Returns how many were discarded; fewer means EOF.
    pub fn skip(&mut self, n: u64) -> Result<u64> {
        let from_buf = u64::min(self.available() as u64, n);
        self.consume(from_buf as usize);
        let mut skipped = from_buf;
        if skipped < n && !self.exhausted {
            let got = self
                .src
                .skip(n - skipped)
                .map_err(|err| self.wrap_io(err))?;
            if got < n - skipped {
                self.exhausted = true;
            }
            self.offset += got;
            skipped += got;
        }
        Ok(skipped)
    }

    /// Read like [`io::Read`], wrapping failures with stage context.
    pub fn read_into(&mut self, out: &mut [u8]) -> Result<usize> {
        let read = io::Read::read(self, out);
        read.map_err(|err| self.wrap_io(err))
    }

    /// Ensure at least `min` bytes are buffered or EOF was seen.
    fn fill(&mut self, min: usize) -> Result<()> {
        while self.available() < min && !self.exhausted {
            self.make_room(min);
            let got = {
                let tail = &mut self.buf[self.buffered..];
                self.src.read(tail)
            };
            match got {
                Ok(0) => self.exhausted = true,
                Ok(n) => self.buffered += n,
                Err(err) => return Err(self.wrap_io(err)),
            }
        }
        Ok(())
    }

    /// Make sure `buf[buffered..]` has room to receive bytes and the
    /// buffer can hold `min` unconsumed bytes in total. Compacts when
    /// at least half of the storage is dead space, otherwise doubles.
    fn make_room(&mut self, min: usize) {
        if self.consumed > 0 && self.consumed * 2 >= self.buf.len() {
            self.buf.copy_within(self.consumed..self.buffered, 0);
            self.buffered -= self.consumed;
            self.consumed = 0;
        }
        let needed = self.consumed + min;
        if self.buf.len() < needed || self.buffered == self.buf.len() {
            let target = needed.max(self.buf.len() * 2).max(INITIAL_CAPACITY);
            self.buf.resize(target, 0);
        }
    }

    fn wrap_io(&self, err: io::Error) -> Error {
        Error::io(
            err,
            format!("{}: read failed at offset {}", self.label, self.offset),
        )
    }
}

impl io::Read for Lookahead {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        let available = self.available();
        if available > 0 {
            let n = available.min(out.len());
            out[..n].copy_from_slice(&self.buf[self.consumed..self.consumed + n]);
            self.consume(n);
            return Ok(n);
        }
        if self.exhausted {
            return Ok(0);
        }
        // Buffer is empty: hand the caller's buffer straight to the
        // source instead of staging through ours.
        let got = self.src.read(out)?;
        if got == 0 {
            self.exhausted = true;
        }
        self.offset += got as u64;
        Ok(got)
    }
}
