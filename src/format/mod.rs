//! Container format modules and the single-winner dispatcher.
//!
//! Formats are mutually exclusive: every registered bidder inspects the
//! effective (post-filter) stream through peeks, and exactly one winner
//! gets to decode it. Ties go to the lowest registration index, so the
//! table below doubles as the documented priority order, most specific
//! magic first.

use std::fmt;
use std::io::Write;

use log::debug;

use crate::entry::Entry;
use crate::error::{Error, ErrorKind};
use crate::io::lookahead::Lookahead;
use crate::Result;

pub(crate) mod ar;
pub(crate) mod cpio;
pub(crate) mod mtree;
pub(crate) mod raw;
pub(crate) mod tar;
pub(crate) mod warc;
pub(crate) mod zip;

pub use cpio::CpioVariant;
pub use tar::TarVariant;
pub use zip::ZipMethod;

/// Identity of one container format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormatKind {
    Tar,
    Cpio,
    Zip,
    Ar,
    Mtree,
    Warc,
    /// Zero-byte stream: recognized as an archive with no entries.
    Empty,
    /// Unframed passthrough; never bids unless explicitly enabled.
    Raw,
}

impl FormatKind {
    /// Stable lower-case name used in labels and error context.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Tar => "tar",
            Self::Cpio => "cpio",
            Self::Zip => "zip",
            Self::Ar => "ar",
            Self::Mtree => "mtree",
            Self::Warc => "warc",
            Self::Empty => "empty",
            Self::Raw => "raw",
        }
    }
}

impl fmt::Display for FormatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One chunk of an open entry's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadBlock {
    /// `out[..n]` was filled with entry data.
    Data(usize),
    /// A sparse gap of this many zero bytes; nothing was stored.
    Hole(u64),
    /// The payload is complete.
    End,
}

/// Decode side of one format.
///
/// The session drives the state machine; readers only parse. `next_entry`
/// returns `Ok(None)` at the end-of-archive marker. `next_block` is called
/// until it reports [`PayloadBlock::End`]; `finish_entry` then consumes
/// whatever block padding the format requires before the next header.
pub(crate) trait FormatReader: Send {
    fn next_entry(&mut self, stream: &mut Lookahead) -> Result<Option<Entry>>;

    fn next_block(&mut self, stream: &mut Lookahead, out: &mut [u8]) -> Result<PayloadBlock>;

    fn finish_entry(&mut self, stream: &mut Lookahead) -> Result<()>;
}

/// Encode side of one format.
///
/// `write_header` validates the entry against what the format can
/// represent and serializes the header. Payload bytes arrive through
/// `write_data`; `finish_entry` receives the byte count the session
/// accepted and emits per-entry trailers/padding. `finish` writes the
/// archive trailer.
pub(crate) trait FormatWriter: Send {
    fn write_header(&mut self, sink: &mut dyn Write, entry: &Entry) -> Result<()>;

    fn write_data(&mut self, sink: &mut dyn Write, buf: &[u8]) -> Result<()>;

    fn finish_entry(&mut self, sink: &mut dyn Write, written: u64) -> Result<()>;

    fn finish(&mut self, sink: &mut dyn Write) -> Result<()>;
}

/// One registered format bidder. Scores follow the crate-wide scale:
/// roughly eight points per verified distinguishing byte, zero means
/// "not mine", and weak structural bids stay below 16.
pub(crate) struct FormatSpec {
    pub(crate) kind: FormatKind,
    pub(crate) bid: fn(&mut Lookahead) -> Result<i32>,
    pub(crate) open: fn() -> Box<dyn FormatReader>,
}

/// Format bidders in priority order; index order breaks bid ties.
pub(crate) static REGISTRY: &[FormatSpec] = &[
    FormatSpec {
        kind: FormatKind::Tar,
        bid: tar::bid,
        open: tar::open,
    },
    FormatSpec {
        kind: FormatKind::Cpio,
        bid: cpio::bid,
        open: cpio::open,
    },
    FormatSpec {
        kind: FormatKind::Zip,
        bid: zip::bid,
        open: zip::open,
    },
    FormatSpec {
        kind: FormatKind::Ar,
        bid: ar::bid,
        open: ar::open,
    },
    FormatSpec {
        kind: FormatKind::Mtree,
        bid: mtree::bid,
        open: mtree::open,
    },
    FormatSpec {
        kind: FormatKind::Warc,
        bid: warc::bid,
        open: warc::open,
    },
    FormatSpec {
        kind: FormatKind::Empty,
        bid: raw::bid_empty,
        open: raw::open_empty,
    },
    FormatSpec {
        kind: FormatKind::Raw,
        bid: raw::bid_raw,
        open: raw::open_raw,
    },
];

/// All registered format kinds in priority order, minus the opt-in
/// raw fallback.
pub(crate) fn default_kinds() -> Vec<FormatKind> {
    REGISTRY
        .iter()
        .map(|spec| spec.kind)
        .filter(|kind| *kind != FormatKind::Raw)
        .collect()
}

/// Run format bidding over the effective stream and open the winner.
pub(crate) fn dispatch(
    stream: &mut Lookahead,
    enabled: &[FormatKind],
) -> Result<(FormatKind, Box<dyn FormatReader>)> {
    let mut best: Option<(usize, i32)> = None;
    for (index, spec) in REGISTRY.iter().enumerate() {
        if !enabled.contains(&spec.kind) {
            continue;
        }
        let score = (spec.bid)(stream)?;
        if score > 0 && best.map_or(true, |(_, top)| score > top) {
            best = Some((index, score));
        }
    }
    let Some((index, score)) = best else {
        return Err(Error::new(
            ErrorKind::UnrecognizedFormat,
            "no registered format recognized the stream",
        ));
    };
    let spec = &REGISTRY[index];
    debug!("format bid won: {} (score {score})", spec.kind);
    Ok((spec.kind, (spec.open)()))
}

/// Strip the NUL/space padding conventions shared by tar, cpio odc, and
/// ar header fields.
pub(crate) fn trim_field(field: &[u8]) -> &[u8] {
    let mut field = field;
    if let Some(nul) = field.iter().position(|&b| b == 0) {
        field = &field[..nul];
    }
    while let Some((&b' ', rest)) = field.split_first() {
        field = rest;
    }
    while let Some((&b' ', rest)) = field.split_last() {
        field = rest;
    }
    field
}

pub(crate) fn parse_octal(field: &[u8], what: &str) -> Result<u64> {
    parse_radix(trim_field(field), 8, what)
}

pub(crate) fn parse_decimal(field: &[u8], what: &str) -> Result<u64> {
    parse_radix(trim_field(field), 10, what)
}

pub(crate) fn parse_hex(field: &[u8], what: &str) -> Result<u64> {
    parse_radix(field, 16, what)
}

fn parse_radix(field: &[u8], radix: u64, what: &str) -> Result<u64> {
    let mut value: u64 = 0;
    for &byte in field {
        let digit = match byte {
            b'0'..=b'9' => u64::from(byte - b'0'),
            b'a'..=b'f' if radix == 16 => u64::from(byte - b'a') + 10,
            b'A'..=b'F' if radix == 16 => u64::from(byte - b'A') + 10,
            _ => {
                return Err(Error::corrupt(format!(
                    "{what}: invalid digit {byte:#04x} in numeric field"
                )))
            }
        };
        if digit >= radix {
            return Err(Error::corrupt(format!(
                "{what}: digit {byte:#04x} out of range for base {radix}"
            )));
        }
        value = value
            .checked_mul(radix)
            .and_then(|v| v.checked_add(digit))
            .ok_or_else(|| Error::corrupt(format!("{what}: numeric field overflows u64")))?;
    }
    Ok(value)
}

/// Require `want` bytes from the stream; a shortfall is a short read
/// (truncation) with the offset in context.
pub(crate) fn peek_exact<'a>(
    stream: &'a mut Lookahead,
    want: usize,
    what: &str,
) -> Result<&'a [u8]> {
    let offset = stream.stream_offset();
    let available = stream.peek(want)?.len();
    if available < want {
        return Err(Error::short_read(format!(
            "{what}: need {want} bytes at offset {offset}, have {available}"
        )));
    }
    Ok(&stream.peek(want)?[..want])
}

/// Read exactly `len` bytes into an owned buffer; EOF first is a short
/// read with the offset in context.
pub(crate) fn read_exact_vec(stream: &mut Lookahead, len: usize, what: &str) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let offset = stream.stream_offset();
        let got = stream.read_into(&mut buf[filled..])?;
        if got == 0 {
            return Err(Error::short_read(format!(
                "{what}: need {len} bytes, stream ended at offset {offset}"
            )));
        }
        filled += got;
    }
    Ok(buf)
}

/// Skip exactly `n` bytes; EOF first is a short read.
pub(crate) fn skip_exact(stream: &mut Lookahead, n: u64, what: &str) -> Result<()> {
    let offset = stream.stream_offset();
    let got = stream.skip(n)?;
    if got < n {
        return Err(Error::short_read(format!(
            "{what}: expected {n} bytes of padding at offset {offset}, stream ended after {got}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::ReaderSource;
    use std::io::Cursor;

    fn lookahead(bytes: &[u8]) -> Lookahead {
        Lookahead::from_source(ReaderSource::new(Cursor::new(bytes.to_vec())), "test")
    }

    #[test]
    fn trim_strips_nul_then_spaces() {
        assert_eq!(trim_field(b"  0644 \0junk"), b"0644");
        assert_eq!(trim_field(b"\0"), b"");
        assert_eq!(trim_field(b"12345"), b"12345");
    }

    #[test]
    fn octal_and_decimal_fields_parse() {
        assert_eq!(parse_octal(b"0000644\0", "mode").unwrap(), 0o644);
        assert_eq!(parse_decimal(b"1234567890  ", "size").unwrap(), 1_234_567_890);
        assert_eq!(parse_hex(b"0000ABCD", "ino").unwrap(), 0xabcd);
        assert!(parse_octal(b"08", "mode").is_err());
        assert!(parse_hex(b"xyz", "ino").is_err());
    }

    #[test]
    fn parse_overflow_is_corrupt_not_panic() {
        let err = parse_decimal(b"99999999999999999999999", "size").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptHeader);
    }

    #[test]
    fn unrecognized_stream_fails_dispatch() {
        let mut stream = lookahead(b"this is not an archive of any registered format");
        let Err(err) = dispatch(&mut stream, &default_kinds()) else {
            panic!("junk bytes dispatched to a format");
        };
        assert_eq!(err.kind(), ErrorKind::UnrecognizedFormat);
    }

    #[test]
    fn peek_exact_reports_truncation() {
        let mut stream = lookahead(b"abc");
        let err = peek_exact(&mut stream, 10, "test header").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ShortRead);
        assert!(err.context().contains("need 10"));
    }
}
