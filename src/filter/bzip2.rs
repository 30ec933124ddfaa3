//! bzip2 filter stage.

use bzip2::read::MultiBzDecoder;
use bzip2::write::BzEncoder;

use crate::error::Error;
use crate::filter::{FinishWrite, SinkStack, StageSource};
use crate::io::lookahead::Lookahead;
use crate::io::ByteSource;
use crate::Result;

/// Compressed-block signature following `BZh<level>`.
const BLOCK_MAGIC: [u8; 6] = [0x31, 0x41, 0x59, 0x26, 0x53, 0x59];
/// End-of-stream signature for a stream with no blocks.
const EOS_MAGIC: [u8; 6] = [0x17, 0x72, 0x45, 0x38, 0x50, 0x90];

/// `BZh` magic, a level digit, and when enough bytes are buffered the
/// first block (or end-of-stream) signature as well.
pub(crate) fn bid(stream: &mut Lookahead) -> Result<i32> {
    let head = stream.peek(10)?;
    if head.len() < 4 || &head[..3] != b"BZh" {
        return Ok(0);
    }
    if !head[3].is_ascii_digit() || head[3] == b'0' {
        return Ok(0);
    }
    let mut score = 29;
    if head.len() >= 10 {
        if head[4..10] != BLOCK_MAGIC && head[4..10] != EOS_MAGIC {
            return Ok(0);
        }
        score += 48;
    }
    Ok(score)
}

/// Multi-stream decoder: concatenated bzip2 streams decode as one.
pub(crate) fn open(stream: Lookahead) -> Result<Box<dyn ByteSource>> {
    Ok(StageSource::boxed(MultiBzDecoder::new(stream)))
}

pub(crate) fn wrap(sink: SinkStack) -> SinkStack {
    Box::new(BzEncoder::new(sink, bzip2::Compression::default()))
}

impl FinishWrite for BzEncoder<SinkStack> {
    fn finish(self: Box<Self>) -> Result<()> {
        let inner = (*self)
            .finish()
            .map_err(|err| Error::flush_failure("bzip2", err))?;
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
    fn bids_on_real_streams_only() {
        let mut enc = BzEncoder::new(Vec::new(), bzip2::Compression::default());
        enc.write_all(b"payload").unwrap();
        let compressed = enc.finish().unwrap();
        assert!(bid(&mut lookahead(&compressed)).unwrap() > 0);

        assert_eq!(bid(&mut lookahead(b"BZh0trash!")).unwrap(), 0);
        assert_eq!(bid(&mut lookahead(b"BZhX123456")).unwrap(), 0);
        assert_eq!(
            bid(&mut lookahead(b"BZh9!!!!!!")).unwrap(),
            0,
            "level digit without a block signature"
        );
    }

    #[test]
    fn truncated_magic_still_bids() {
        // EOF right after the level digit: the signature check is waived.
        assert_eq!(bid(&mut lookahead(b"BZh9")).unwrap(), 29);
    }

    #[test]
    fn round_trips() {
        let mut enc = BzEncoder::new(Vec::new(), bzip2::Compression::default());
        enc.write_all(b"bzip2 round trip").unwrap();
        let compressed = enc.finish().unwrap();
        let mut decoded = open(lookahead(&compressed)).unwrap();
        let mut out = Vec::new();
        let mut buf = [0u8; 32];
        loop {
            let n = decoded.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, b"bzip2 round trip");
    }
}
