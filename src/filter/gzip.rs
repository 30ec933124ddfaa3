//! gzip (RFC 1952) filter stage.

use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression as GzipLevel;

use crate::error::Error;
use crate::filter::{FinishWrite, SinkStack, StageSource};
use crate::io::lookahead::Lookahead;
use crate::io::ByteSource;
use crate::Result;

/// Magic, deflate method byte, and clear reserved flag bits.
pub(crate) fn bid(stream: &mut Lookahead) -> Result<i32> {
    let head = stream.peek(4)?;
    if head.len() < 4 || head[0] != 0x1f || head[1] != 0x8b {
        return Ok(0);
    }
    if head[2] != 8 {
        return Ok(0);
    }
    if head[3] & 0xe0 != 0 {
        return Ok(0);
    }
    Ok(27)
}

/// Multi-member decoder: concatenated gzip streams decode as one.
pub(crate) fn open(stream: Lookahead) -> Result<Box<dyn ByteSource>> {
    Ok(StageSource::boxed(MultiGzDecoder::new(stream)))
}

pub(crate) fn wrap(sink: SinkStack) -> SinkStack {
    Box::new(GzEncoder::new(sink, GzipLevel::default()))
}

impl FinishWrite for GzEncoder<SinkStack> {
    fn finish(self: Box<Self>) -> Result<()> {
        let inner = (*self)
            .finish()
            .map_err(|err| Error::flush_failure("gzip", err))?;
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
        let mut enc = GzEncoder::new(Vec::new(), GzipLevel::default());
        enc.write_all(b"x").unwrap();
        let compressed = enc.finish().unwrap();
        assert!(bid(&mut lookahead(&compressed)).unwrap() > 0);

        assert_eq!(bid(&mut lookahead(b"")).unwrap(), 0);
        assert_eq!(bid(&mut lookahead(b"\x1f\x8b")).unwrap(), 0, "too short");
        assert_eq!(
            bid(&mut lookahead(b"\x1f\x8b\x07\x00")).unwrap(),
            0,
            "non-deflate method"
        );
        assert_eq!(
            bid(&mut lookahead(b"\x1f\x8b\x08\xff")).unwrap(),
            0,
            "reserved flags set"
        );
    }

    #[test]
    fn decodes_concatenated_members() {
        let mut stream = Vec::new();
        for part in [&b"first "[..], &b"second"[..]] {
            let mut enc = GzEncoder::new(Vec::new(), GzipLevel::default());
            enc.write_all(part).unwrap();
            stream.extend_from_slice(&enc.finish().unwrap());
        }
        let mut decoded = open(lookahead(&stream)).unwrap();
        let mut out = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            let n = decoded.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, b"first second");
    }
}
