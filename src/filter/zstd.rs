//! zstd filter stage.

use zstd::stream::read::Decoder as ZstdDecoder;
use zstd::stream::write::Encoder as ZstdEncoder;

use crate::error::Error;
use crate::filter::{FinishWrite, SinkStack, StageSource};
use crate::io::lookahead::Lookahead;
use crate::io::ByteSource;
use crate::Result;

const MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];
const LEVEL: i32 = 3;

pub(crate) fn bid(stream: &mut Lookahead) -> Result<i32> {
    let head = stream.peek(4)?;
    if head.len() < 4 || head[..4] != MAGIC {
        return Ok(0);
    }
    Ok(32)
}

pub(crate) fn open(stream: Lookahead) -> Result<Box<dyn ByteSource>> {
    let decoder = ZstdDecoder::new(stream)
        .map_err(|err| Error::io(err, "zstd: initializing decoder"))?;
    Ok(StageSource::boxed(decoder))
}

pub(crate) fn wrap(sink: SinkStack) -> Result<SinkStack> {
    let encoder = ZstdEncoder::new(sink, LEVEL)
        .map_err(|err| Error::io(err, "zstd: initializing encoder"))?;
    Ok(Box::new(encoder))
}

impl FinishWrite for ZstdEncoder<'static, SinkStack> {
    fn finish(self: Box<Self>) -> Result<()> {
        let inner = (*self)
            .finish()
            .map_err(|err| Error::flush_failure("zstd", err))?;
        inner.finish()
    }
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
    fn bids_on_frame_magic() {
        let compressed = zstd::stream::encode_all(&b"frame"[..], LEVEL).unwrap();
        assert_eq!(bid(&mut lookahead(&compressed)).unwrap(), 32);
        assert_eq!(bid(&mut lookahead(&compressed[..3])).unwrap(), 0);
        assert_eq!(bid(&mut lookahead(b"\x28\xb5\x2f\xfe")).unwrap(), 0);
    }

    #[test]
    fn round_trips() {
        let compressed = zstd::stream::encode_all(&b"zstd payload"[..], LEVEL).unwrap();
        let mut decoded = open(lookahead(&compressed)).unwrap();
        let mut out = Vec::new();
        let mut buf = [0u8; 16];
        loop {
            let n = decoded.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, b"zstd payload");
    }
}
