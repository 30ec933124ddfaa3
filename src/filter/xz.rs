//! xz and LZMA-alone filter stages, both backed by liblzma.

use xz2::read::XzDecoder;
use xz2::stream::{LzmaOptions, Stream};
use xz2::write::XzEncoder;

use crate::error::{Error, ErrorKind};
use crate::filter::{FinishWrite, SinkStack, StageSource};
use crate::io::lookahead::Lookahead;
use crate::io::ByteSource;
use crate::Result;

const XZ_MAGIC: [u8; 6] = [0xfd, b'7', b'z', b'X', b'Z', 0x00];
const PRESET: u32 = 6;

pub(crate) fn bid(stream: &mut Lookahead) -> Result<i32> {
    let head = stream.peek(6)?;
    if head.len() < 6 || head[..6] != XZ_MAGIC {
        return Ok(0);
    }
    Ok(48)
}

/// LZMA-alone has no magic; this is a structural sniff of the 13-byte
/// header. The score stays low so any true magic outranks it.
pub(crate) fn bid_lzma(stream: &mut Lookahead) -> Result<i32> {
    let head = stream.peek(13)?;
    if head.len() < 13 {
        return Ok(0);
    }
    // Properties byte encodes (pb * 5 + lp) * 9 + lc with pb <= 4,
    // lp <= 4, lc <= 8.
    if head[0] >= 225 {
        return Ok(0);
    }
    let mut score = 3;
    if head[0] == 0x5d {
        // The value every stock encoder emits (lc=3, lp=0, pb=2).
        score += 4;
    }
    let dict = u32::from_le_bytes([head[1], head[2], head[3], head[4]]);
    if dict == 0 || dict > 1 << 27 {
        return Ok(0);
    }
    if dict.is_power_of_two() {
        score += 4;
    }
    let size = u64::from_le_bytes([
        head[5], head[6], head[7], head[8], head[9], head[10], head[11], head[12],
    ]);
    if size != u64::MAX && size > 1 << 38 {
        return Ok(0);
    }
    if size == u64::MAX {
        // Streamed output with an end marker, the common shape.
        score += 3;
    }
    Ok(score)
}

/// Multi-stream decoder: concatenated xz streams decode as one.
pub(crate) fn open(stream: Lookahead) -> Result<Box<dyn ByteSource>> {
    Ok(StageSource::boxed(XzDecoder::new_multi_decoder(stream)))
}

pub(crate) fn open_lzma(stream: Lookahead) -> Result<Box<dyn ByteSource>> {
    let raw = Stream::new_lzma_decoder(u64::MAX).map_err(codec_error)?;
    Ok(StageSource::boxed(XzDecoder::new_stream(stream, raw)))
}

pub(crate) fn wrap(sink: SinkStack) -> SinkStack {
    Box::new(XzEncoder::new(sink, PRESET))
}

pub(crate) fn wrap_lzma(sink: SinkStack) -> Result<SinkStack> {
    let options = LzmaOptions::new_preset(PRESET).map_err(codec_error)?;
    let raw = Stream::new_lzma_encoder(&options).map_err(codec_error)?;
    Ok(Box::new(XzEncoder::new_stream(sink, raw)))
}

fn codec_error(err: xz2::stream::Error) -> Error {
    Error::new(ErrorKind::Io, format!("lzma codec setup: {err}"))
}

impl FinishWrite for XzEncoder<SinkStack> {
    fn finish(self: Box<Self>) -> Result<()> {
        let inner = (*self)
            .finish()
            .map_err(|err| Error::flush_failure("xz", err))?;
        inner.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::ReaderSource;
    use std::io::{Cursor, Write};

    fn lookahead(bytes: &[u8]) -> Lookahead {
        Lookahead::from_source(ReaderSource::new(Cursor::new(bytes.to_vec())), "test")
    }

    fn drain(mut src: Box<dyn ByteSource>) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            let n = src.read(&mut buf).unwrap();
            if n == 0 {
                return out;
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    #[test]
    fn xz_bid_requires_full_magic() {
        let mut enc = XzEncoder::new(Vec::new(), PRESET);
        enc.write_all(b"payload").unwrap();
        let compressed = enc.finish().unwrap();
        assert_eq!(bid(&mut lookahead(&compressed)).unwrap(), 48);
        assert_eq!(bid(&mut lookahead(&compressed[..5])).unwrap(), 0);
        assert_eq!(bid(&mut lookahead(b"\xfd7zXY\x00")).unwrap(), 0);
    }

    #[test]
    fn lzma_bid_is_weak_but_structural() {
        let options = LzmaOptions::new_preset(PRESET).unwrap();
        let raw = Stream::new_lzma_encoder(&options).unwrap();
        let mut enc = XzEncoder::new_stream(Vec::new(), raw);
        enc.write_all(b"alone").unwrap();
        let compressed = enc.finish().unwrap();

        let score = bid_lzma(&mut lookahead(&compressed)).unwrap();
        assert!(score > 0);
        assert!(score < 16, "structural sniff must lose to real magics");
        assert_eq!(bid_lzma(&mut lookahead(&[0xff; 13])).unwrap(), 0);
    }

    #[test]
    fn both_containers_round_trip() {
        let mut enc = XzEncoder::new(Vec::new(), PRESET);
        enc.write_all(b"xz payload").unwrap();
        let xz_bytes = enc.finish().unwrap();
        assert_eq!(drain(open(lookahead(&xz_bytes)).unwrap()), b"xz payload");

        let options = LzmaOptions::new_preset(PRESET).unwrap();
        let raw = Stream::new_lzma_encoder(&options).unwrap();
        let mut enc = XzEncoder::new_stream(Vec::new(), raw);
        enc.write_all(b"alone payload").unwrap();
        let alone_bytes = enc.finish().unwrap();
        assert_eq!(
            drain(open_lzma(lookahead(&alone_bytes)).unwrap()),
            b"alone payload"
        );
    }
}
