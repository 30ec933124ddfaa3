//! Compression and text-encoding filter stages.
//!
//! On read, every registered filter bids against the stream prefix; the
//! winner wraps the stream in its decoder and bidding repeats on the
//! decoded bytes until nothing bids, producing an ordered chain
//! (outermost stage first). On write there is no bidding: the caller
//! names the chain in the same outermost-first order and each stage
//! wraps the sink below it, with `finish` cascading trailers from the
//! innermost stage outwards.

use std::fmt;
use std::io::{self, BufWriter, Write};

use log::debug;

use crate::error::{Error, ErrorKind};
use crate::io::lookahead::Lookahead;
use crate::io::ByteSource;
use crate::Result;

#[cfg(feature = "bzip2")]
pub(crate) mod bzip2;
pub(crate) mod compress;
#[cfg(feature = "gzip")]
pub(crate) mod gzip;
#[cfg(feature = "lz4")]
pub(crate) mod lz4;
pub(crate) mod uu;
#[cfg(feature = "xz")]
pub(crate) mod xz;
#[cfg(feature = "zstd")]
pub(crate) mod zstd;

/// Identity of one filter stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterKind {
    #[cfg(feature = "gzip")]
    Gzip,
    #[cfg(feature = "bzip2")]
    Bzip2,
    #[cfg(feature = "xz")]
    Xz,
    /// LZMA-alone (`.lzma`), the pre-xz container.
    #[cfg(feature = "xz")]
    Lzma,
    #[cfg(feature = "lz4")]
    Lz4,
    #[cfg(feature = "zstd")]
    Zstd,
    /// Unix `compress` (`.Z`) LZW streams.
    Compress,
    /// Uuencoded text framing (`begin NNN name`).
    Uu,
    /// Base64 text framing (`begin-base64 NNN name`).
    Base64,
}

impl FilterKind {
    /// Stable lower-case name used in labels and error context.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            #[cfg(feature = "gzip")]
            Self::Gzip => "gzip",
            #[cfg(feature = "bzip2")]
            Self::Bzip2 => "bzip2",
            #[cfg(feature = "xz")]
            Self::Xz => "xz",
            #[cfg(feature = "xz")]
            Self::Lzma => "lzma",
            #[cfg(feature = "lz4")]
            Self::Lz4 => "lz4",
            #[cfg(feature = "zstd")]
            Self::Zstd => "zstd",
            Self::Compress => "compress",
            Self::Uu => "uu",
            Self::Base64 => "base64",
        }
    }

    /// Wrap an encode stack in this filter's encoder.
    pub(crate) fn wrap_sink(self, sink: SinkStack) -> Result<SinkStack> {
        match self {
            #[cfg(feature = "gzip")]
            Self::Gzip => Ok(gzip::wrap(sink)),
            #[cfg(feature = "bzip2")]
            Self::Bzip2 => Ok(bzip2::wrap(sink)),
            #[cfg(feature = "xz")]
            Self::Xz => Ok(xz::wrap(sink)),
            #[cfg(feature = "xz")]
            Self::Lzma => xz::wrap_lzma(sink),
            #[cfg(feature = "lz4")]
            Self::Lz4 => Ok(lz4::wrap(sink)),
            #[cfg(feature = "zstd")]
            Self::Zstd => zstd::wrap(sink),
            Self::Compress => Ok(compress::wrap(sink)),
            Self::Uu => Ok(uu::wrap(sink, uu::Framing::Uuencode)),
            Self::Base64 => Ok(uu::wrap(sink, uu::Framing::Base64)),
        }
    }
}

impl fmt::Display for FilterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One registered decode bidder.
///
/// `bid` inspects the stream through peeks only and returns a score
/// scaled to the number of prefix bits it verified; zero or negative
/// means "not mine". `open` consumes the lookahead and returns the
/// decoded byte source.
pub(crate) struct FilterSpec {
    pub(crate) kind: FilterKind,
    pub(crate) bid: fn(&mut Lookahead) -> Result<i32>,
    pub(crate) open: fn(Lookahead) -> Result<Box<dyn ByteSource>>,
}

/// Decode bidders in priority order; index order breaks bid ties.
pub(crate) static REGISTRY: &[FilterSpec] = &[
    #[cfg(feature = "gzip")]
    FilterSpec {
        kind: FilterKind::Gzip,
        bid: gzip::bid,
        open: gzip::open,
    },
    #[cfg(feature = "bzip2")]
    FilterSpec {
        kind: FilterKind::Bzip2,
        bid: bzip2::bid,
        open: bzip2::open,
    },
    #[cfg(feature = "xz")]
    FilterSpec {
        kind: FilterKind::Xz,
        bid: xz::bid,
        open: xz::open,
    },
    #[cfg(feature = "xz")]
    FilterSpec {
        kind: FilterKind::Lzma,
        bid: xz::bid_lzma,
        open: xz::open_lzma,
    },
    #[cfg(feature = "lz4")]
    FilterSpec {
        kind: FilterKind::Lz4,
        bid: lz4::bid,
        open: lz4::open,
    },
    #[cfg(feature = "zstd")]
    FilterSpec {
        kind: FilterKind::Zstd,
        bid: zstd::bid,
        open: zstd::open,
    },
    FilterSpec {
        kind: FilterKind::Compress,
        bid: compress::bid,
        open: compress::open,
    },
    FilterSpec {
        kind: FilterKind::Uu,
        bid: uu::bid_uuencode,
        open: uu::open,
    },
    FilterSpec {
        kind: FilterKind::Base64,
        bid: uu::bid_base64,
        open: uu::open,
    },
];

/// All registered filter kinds in priority order.
pub(crate) fn registered_kinds() -> Vec<FilterKind> {
    REGISTRY.iter().map(|spec| spec.kind).collect()
}

/// Run filter bidding repeatedly, wrapping the stream in each winning
/// decoder, until no enabled filter bids above zero.
///
/// Returns the chain (outermost stage first) and the lookahead over the
/// fully decoded stream, ready for format dispatch.
pub(crate) fn assemble_decode_chain(
    src: Box<dyn ByteSource>,
    enabled: &[FilterKind],
    max_depth: usize,
) -> Result<(Vec<FilterKind>, Lookahead)> {
    let mut stream = Lookahead::new(src, "archive");
    let mut chain = Vec::new();
    loop {
        let mut best: Option<(usize, i32)> = None;
        for (index, spec) in REGISTRY.iter().enumerate() {
            if !enabled.contains(&spec.kind) {
                continue;
            }
            let score = (spec.bid)(&mut stream)?;
            if score > 0 && best.map_or(true, |(_, top)| score > top) {
                best = Some((index, score));
            }
        }
        let Some((index, score)) = best else {
            break;
        };
        if chain.len() == max_depth {
            return Err(Error::new(
                ErrorKind::ChainDepthExceeded,
                format!("more than {max_depth} nested filters"),
            ));
        }
        let spec = &REGISTRY[index];
        debug!(
            "filter bid won: {} (score {score}, depth {})",
            spec.kind,
            chain.len()
        );
        chain.push(spec.kind);
        let decoded = (spec.open)(stream)?;
        stream = Lookahead::new(decoded, spec.kind.name());
    }
    Ok((chain, stream))
}

/// Adapts a decoder (plain [`io::Read`]) back into a [`ByteSource`] so
/// the next stage can wrap it in its own lookahead.
pub(crate) struct StageSource<R> {
    inner: R,
}

impl<R: io::Read + Send + 'static> StageSource<R> {
    pub(crate) fn boxed(inner: R) -> Box<dyn ByteSource> {
        Box::new(Self { inner })
    }
}

impl<R: io::Read + Send> ByteSource for StageSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

/// Writer stage that can flush its own trailer and then finish the
/// stage below it. The format encoder writes into the top of the stack.
pub(crate) trait FinishWrite: Write + Send {
    /// Flush this stage's trailer, then finish the stage below.
    fn finish(self: Box<Self>) -> Result<()>;
}

pub(crate) type SinkStack = Box<dyn FinishWrite>;

/// Base of every encode stack: buffers and flushes the caller's sink.
struct PlainSink<W: Write + Send> {
    inner: BufWriter<W>,
}

impl<W: Write + Send> Write for PlainSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<W: Write + Send> FinishWrite for PlainSink<W> {
    fn finish(mut self: Box<Self>) -> Result<()> {
        self.inner
            .flush()
            .map_err(|err| Error::flush_failure("sink", err))
    }
}

/// Build the encode stack for `chain` (outermost stage first) on top of
/// `sink`. With an empty chain the stack is a plain buffered sink.
pub(crate) fn assemble_encode_chain<W: Write + Send + 'static>(
    sink: W,
    chain: &[FilterKind],
) -> Result<SinkStack> {
    let mut stack: SinkStack = Box::new(PlainSink {
        inner: BufWriter::new(sink),
    });
    for kind in chain {
        stack = kind.wrap_sink(stack)?;
    }
    Ok(stack)
}
