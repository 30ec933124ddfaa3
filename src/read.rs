//! The read session: filter chain assembly, format dispatch, and the
//! entry-by-entry decode state machine.

use std::io::{Read, Seek};

use log::debug;

use crate::entry::Entry;
use crate::error::Error;
use crate::filter::{self, FilterKind};
use crate::format::{self, FormatKind, FormatReader, PayloadBlock};
use crate::io::lookahead::Lookahead;
use crate::io::{ByteSource, ReaderSource, SeekableSource};
use crate::Result;

/// Scratch size for draining an abandoned entry.
const DRAIN_CHUNK: usize = 32 * 1024;

/// What a read session is allowed to recognize.
///
/// Defaults enable every compiled-in filter and every format except the
/// raw fallback, which callers opt into explicitly.
#[derive(Debug, Clone)]
pub struct ReadOptions {
    filters: Vec<FilterKind>,
    formats: Vec<FormatKind>,
    max_filter_chain: usize,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            filters: filter::registered_kinds(),
            formats: format::default_kinds(),
            max_filter_chain: 8,
        }
    }
}

impl ReadOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict filter bidding to exactly these kinds.
    #[must_use]
    pub fn with_filters(mut self, filters: impl Into<Vec<FilterKind>>) -> Self {
        self.filters = filters.into();
        self
    }

    /// Restrict format bidding to exactly these kinds.
    #[must_use]
    pub fn with_formats(mut self, formats: impl Into<Vec<FormatKind>>) -> Self {
        self.formats = formats.into();
        self
    }

    /// Cap the number of nested filter stages (default 8).
    #[must_use]
    pub fn with_max_filter_chain(mut self, depth: usize) -> Self {
        self.max_filter_chain = depth;
        self
    }

    /// Let unrecognized non-empty streams surface as one raw entry
    /// instead of failing dispatch.
    #[must_use]
    pub fn with_raw_fallback(mut self) -> Self {
        if !self.formats.contains(&FormatKind::Raw) {
            self.formats.push(FormatKind::Raw);
        }
        self
    }
}

#[derive(Debug)]
enum ReadState {
    /// Between entries; the next header is up.
    Idle,
    /// An entry's payload is being delivered.
    InEntry { declared: Option<u64> },
    /// End-of-archive seen; `next_entry` keeps returning `None`.
    Finished,
}

/// Streaming archive reader.
///
/// Drives one [`FormatReader`] over the effective (post-filter) stream.
/// Entries come out in archive order; payload is pulled with
/// [`read_data`](Self::read_data) (holes zero-filled) or
/// [`next_block`](Self::next_block) (holes surfaced). Calling
/// [`next_entry`](Self::next_entry) with payload still pending drains
/// the rest of the open entry first.
///
/// After any error the session is parked: every later call replays the
/// same failure instead of decoding from an undefined stream position.
pub struct ReadSession {
    stream: Lookahead,
    chain: Vec<FilterKind>,
    format: FormatKind,
    reader: Box<dyn FormatReader>,
    state: ReadState,
    /// Bytes of the open entry handed to the caller, holes included.
    delivered: u64,
    /// Zero bytes of a surfaced hole not yet converted by `read_data`.
    pending_hole: u64,
    fault: Option<Error>,
}

impl std::fmt::Debug for ReadSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadSession")
            .field("format", &self.format)
            .field("chain", &self.chain)
            .field("state", &self.state)
            .field("delivered", &self.delivered)
            .field("fault", &self.fault)
            .finish_non_exhaustive()
    }
}

impl ReadSession {
    /// Detect filters and format over `source` and open the winner.
    pub fn open(source: Box<dyn ByteSource>, options: &ReadOptions) -> Result<Self> {
        let (chain, mut stream) =
            filter::assemble_decode_chain(source, &options.filters, options.max_filter_chain)?;
        let (format, reader) = format::dispatch(&mut stream, &options.formats)?;
        debug!(
            "read session open: format {} behind {} filter stage(s)",
            format,
            chain.len()
        );
        Ok(Self {
            stream,
            chain,
            format,
            reader,
            state: ReadState::Idle,
            delivered: 0,
            pending_hole: 0,
            fault: None,
        })
    }

    /// Open over any plain reader (pipe, socket, in-memory buffer).
    pub fn from_reader<R: Read + Send + 'static>(reader: R, options: &ReadOptions) -> Result<Self> {
        Self::open(Box::new(ReaderSource::new(reader)), options)
    }

    /// Open over a seekable transport; skips become seeks and the raw
    /// fallback learns the stream size.
    pub fn from_seekable<R: Read + Seek + Send + 'static>(
        reader: R,
        options: &ReadOptions,
    ) -> Result<Self> {
        let source = SeekableSource::new(reader)
            .map_err(|err| Error::io(err, "measuring seekable input"))?;
        Self::open(Box::new(source), options)
    }

    /// Filter chain detected in front of the format, outermost first.
    #[must_use]
    pub fn filter_chain(&self) -> &[FilterKind] {
        &self.chain
    }

    /// The format that won dispatch.
    #[must_use]
    pub fn format(&self) -> FormatKind {
        self.format
    }

    /// Payload bytes of the current (or just-finished) entry handed to
    /// the caller, sparse holes included.
    #[must_use]
    pub fn entry_bytes_delivered(&self) -> u64 {
        self.delivered
    }

    /// Advance to the next entry header; `Ok(None)` is end of archive.
    pub fn next_entry(&mut self) -> Result<Option<Entry>> {
        self.guard()?;
        let result = self.advance();
        self.park(result)
    }

    /// Pull payload with holes zero-filled, `Read`-style; 0 means the
    /// entry is complete.
    pub fn read_data(&mut self, out: &mut [u8]) -> Result<usize> {
        self.guard()?;
        if out.is_empty() {
            return Ok(0);
        }
        if self.pending_hole > 0 {
            let n = usize::try_from(self.pending_hole.min(out.len() as u64))
                .unwrap_or(out.len());
            out[..n].fill(0);
            self.pending_hole -= n as u64;
            return Ok(n);
        }
        let result = self.block(out);
        match self.park(result)? {
            PayloadBlock::Data(n) => Ok(n),
            PayloadBlock::Hole(gap) => {
                let n = usize::try_from(gap.min(out.len() as u64)).unwrap_or(out.len());
                out[..n].fill(0);
                self.pending_hole = gap - n as u64;
                Ok(n)
            }
            PayloadBlock::End => Ok(0),
        }
    }

    /// Pull one payload block, surfacing sparse holes instead of
    /// materializing them.
    pub fn next_block(&mut self, out: &mut [u8]) -> Result<PayloadBlock> {
        self.guard()?;
        if self.pending_hole > 0 {
            // Already counted when the hole was first surfaced.
            return Ok(PayloadBlock::Hole(std::mem::take(&mut self.pending_hole)));
        }
        let result = self.block(out);
        self.park(result)
    }

    fn advance(&mut self) -> Result<Option<Entry>> {
        match self.state {
            ReadState::Finished => return Ok(None),
            ReadState::InEntry { .. } => {
                let mut scratch = vec![0u8; DRAIN_CHUNK];
                loop {
                    match self.block(&mut scratch)? {
                        PayloadBlock::Data(_) | PayloadBlock::Hole(_) => {}
                        PayloadBlock::End => break,
                    }
                }
            }
            ReadState::Idle => {}
        }
        self.pending_hole = 0;
        match self.reader.next_entry(&mut self.stream)? {
            Some(entry) => {
                self.delivered = 0;
                self.state = ReadState::InEntry {
                    declared: entry.size(),
                };
                Ok(Some(entry))
            }
            None => {
                self.state = ReadState::Finished;
                Ok(None)
            }
        }
    }

    /// One reader block with delivery accounting and the declared-size
    /// bound. Closes the entry when the reader reports its end.
    fn block(&mut self, out: &mut [u8]) -> Result<PayloadBlock> {
        let declared = match self.state {
            ReadState::InEntry { declared } => declared,
            ReadState::Idle | ReadState::Finished => return Ok(PayloadBlock::End),
        };
        let block = self.reader.next_block(&mut self.stream, out)?;
        let grown = match block {
            PayloadBlock::Data(n) => n as u64,
            PayloadBlock::Hole(gap) => gap,
            PayloadBlock::End => {
                self.reader.finish_entry(&mut self.stream)?;
                self.state = ReadState::Idle;
                return Ok(PayloadBlock::End);
            }
        };
        self.delivered += grown;
        if let Some(declared) = declared {
            if self.delivered > declared {
                return Err(Error::corrupt(format!(
                    "entry payload ran {} bytes past its declared size {declared}",
                    self.delivered - declared
                )));
            }
        }
        Ok(block)
    }

    fn guard(&self) -> Result<()> {
        match &self.fault {
            Some(err) => Err(err.replay()),
            None => Ok(()),
        }
    }

    /// Park the session on failure so later calls replay it.
    fn park<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.fault = Some(err.replay());
        }
        result
    }
}
