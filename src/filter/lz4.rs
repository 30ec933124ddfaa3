//! lz4 frame filter stage.

use lz4_flex::frame::{FrameDecoder, FrameEncoder};

use crate::error::{Error, ErrorKind};
use crate::filter::{FinishWrite, SinkStack, StageSource};
use crate::io::lookahead::Lookahead;
use crate::io::ByteSource;
use crate::Result;

const FRAME_MAGIC: [u8; 4] = [0x04, 0x22, 0x4d, 0x18];
/// Pre-frame-spec container written by lz4 before r131.
const LEGACY_MAGIC: [u8; 4] = [0x02, 0x21, 0x4c, 0x18];

/// Bids on both containers; the legacy one is claimed so it can be
/// rejected with a precise error instead of `UnrecognizedFormat`.
pub(crate) fn bid(stream: &mut Lookahead) -> Result<i32> {
    let head = stream.peek(4)?;
    if head.len() < 4 {
        return Ok(0);
    }
    if head[..4] == FRAME_MAGIC || head[..4] == LEGACY_MAGIC {
        return Ok(32);
    }
    Ok(0)
}

pub(crate) fn open(mut stream: Lookahead) -> Result<Box<dyn ByteSource>> {
    if stream.peek(4)?.starts_with(&LEGACY_MAGIC) {
        return Err(Error::new(
            ErrorKind::UnrecognizedFilter,
            "lz4: legacy frame container is not supported",
        ));
    }
    Ok(StageSource::boxed(FrameDecoder::new(stream)))
}

pub(crate) fn wrap(sink: SinkStack) -> SinkStack {
    Box::new(FrameEncoder::new(sink))
}

impl FinishWrite for FrameEncoder<SinkStack> {
    fn finish(self: Box<Self>) -> Result<()> {
        let inner = (*self).finish().map_err(|err| {
            Error::flush_failure("lz4", std::io::Error::other(err))
        })?;
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

    #[test]
    fn bids_on_either_magic() {
        let mut enc = FrameEncoder::new(Vec::new());
        enc.write_all(b"payload").unwrap();
        let compressed = enc.finish().unwrap();
        assert_eq!(bid(&mut lookahead(&compressed)).unwrap(), 32);
        assert_eq!(bid(&mut lookahead(&LEGACY_MAGIC)).unwrap(), 32);
        assert_eq!(bid(&mut lookahead(b"\x04\x22\x4d")).unwrap(), 0);
    }

    #[test]
    fn legacy_container_is_rejected_at_open() {
        let Err(err) = open(lookahead(&LEGACY_MAGIC)) else {
            panic!("legacy container opened as a frame stream");
        };
        assert_eq!(err.kind(), ErrorKind::UnrecognizedFilter);
    }

    #[test]
    fn round_trips() {
        let mut enc = FrameEncoder::new(Vec::new());
        enc.write_all(b"lz4 frame payload").unwrap();
        let compressed = enc.finish().unwrap();
        let mut decoded = open(lookahead(&compressed)).unwrap();
        let mut out = Vec::new();
        let mut buf = [0u8; 8];
        loop {
            let n = decoded.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, b"lz4 frame payload");
    }
}
