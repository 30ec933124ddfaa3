//! The two pseudo-formats: `Empty` for zero-byte input and `Raw` for
//! opting in to unrecognized byte streams.
//!
//! Both bid the minimum positive score so any real format outbids
//! them. `Raw` never participates in default detection; when enabled
//! it surfaces the whole stream as one nameless entry, which is how a
//! bare compressed file (`data.gz` with no archive inside) is read.

use crate::entry::{Entry, EntryKind};
use crate::error::Error;
use crate::format::{FormatReader, FormatWriter, PayloadBlock};
use crate::io::lookahead::Lookahead;
use crate::Result;
use std::io::Write;

pub(crate) fn bid_empty(stream: &mut Lookahead) -> Result<i32> {
    if stream.peek(1)?.is_empty() && stream.is_exhausted() {
        return Ok(1);
    }
    Ok(0)
}

pub(crate) fn open_empty() -> Box<dyn FormatReader> {
    Box::new(EmptyReader)
}

pub(crate) struct EmptyReader;

impl FormatReader for EmptyReader {
    fn next_entry(&mut self, _stream: &mut Lookahead) -> Result<Option<Entry>> {
        Ok(None)
    }

    fn next_block(&mut self, _stream: &mut Lookahead, _out: &mut [u8]) -> Result<PayloadBlock> {
        Ok(PayloadBlock::End)
    }

    fn finish_entry(&mut self, _stream: &mut Lookahead) -> Result<()> {
        Ok(())
    }
}

pub(crate) fn bid_raw(stream: &mut Lookahead) -> Result<i32> {
    if stream.peek(1)?.is_empty() {
        return Ok(0);
    }
    Ok(1)
}

pub(crate) fn open_raw() -> Box<dyn FormatReader> {
    Box::new(RawReader { yielded: false })
}

pub(crate) struct RawReader {
    yielded: bool,
}

impl FormatReader for RawReader {
    fn next_entry(&mut self, stream: &mut Lookahead) -> Result<Option<Entry>> {
        if self.yielded {
            return Ok(None);
        }
        self.yielded = true;
        // The transport may know the size; a pipe will not.
        let entry = Entry::new("data", EntryKind::Regular);
        Ok(Some(match stream.total_size() {
            Some(size) => entry.with_size(size),
            None => entry.with_unknown_size(),
        }))
    }

    fn next_block(&mut self, stream: &mut Lookahead, out: &mut [u8]) -> Result<PayloadBlock> {
        let got = stream.read_into(out)?;
        if got == 0 {
            return Ok(PayloadBlock::End);
        }
        Ok(PayloadBlock::Data(got))
    }

    fn finish_entry(&mut self, _stream: &mut Lookahead) -> Result<()> {
        Ok(())
    }
}

/// Writes exactly one entry's payload with no framing at all.
pub(crate) struct RawWriter {
    written_one: bool,
}

impl RawWriter {
    pub(crate) fn new() -> Self {
        Self { written_one: false }
    }
}

impl FormatWriter for RawWriter {
    fn write_header(&mut self, _sink: &mut dyn Write, entry: &Entry) -> Result<()> {
        if self.written_one {
            return Err(Error::misuse(
                "raw output holds exactly one entry; a second was written",
            ));
        }
        if !entry.carries_payload() {
            return Err(Error::unsupported(format!(
                "raw output carries file payload only, not {} entries",
                entry.kind()
            )));
        }
        self.written_one = true;
        Ok(())
    }

    fn write_data(&mut self, sink: &mut dyn Write, buf: &[u8]) -> Result<()> {
        sink.write_all(buf)
            .map_err(|err| Error::io(err, "raw: writing payload"))
    }

    fn finish_entry(&mut self, _sink: &mut dyn Write, _written: u64) -> Result<()> {
        Ok(())
    }

    fn finish(&mut self, _sink: &mut dyn Write) -> Result<()> {
        Ok(())
    }
}
