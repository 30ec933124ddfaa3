//! Text-safe framing filters: uuencode and `begin-base64`.
//!
//! One decoder serves both framings (the begin line says which); the
//! encode side is two registry kinds so the caller picks the framing by
//! naming the chain. Decoded lines tolerate stripped trailing spaces,
//! the classic mail-transport damage, by treating absent characters as
//! zero-valued.

use std::io::{self, Read, Write};

use crate::error::Error;
use crate::filter::{FinishWrite, SinkStack, StageSource};
use crate::io::lookahead::Lookahead;
use crate::io::ByteSource;
use crate::Result;

const UU_LINE_BYTES: usize = 45;
const B64_LINE_BYTES: usize = 57;
const MAX_LINE: usize = 4096;

const B64_ALPHABET: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Framing {
    Uuencode,
    Base64,
}

fn begin_line_bid(head: &[u8], keyword: &[u8]) -> i32 {
    if head.len() < keyword.len() + 5 || !head.starts_with(keyword) {
        return 0;
    }
    let rest = &head[keyword.len()..];
    // A three-digit octal mode then a space before the name.
    if !rest[..3].iter().all(|b| (b'0'..=b'7').contains(b)) || rest[3] != b' ' {
        return 0;
    }
    (keyword.len() as i32) * 8 + 8
}

pub(crate) fn bid_uuencode(stream: &mut Lookahead) -> Result<i32> {
    let head = stream.peek(24)?;
    // "begin-base64" also starts with "begin"; leave it to its own bidder.
    if head.starts_with(b"begin-") {
        return Ok(0);
    }
    Ok(begin_line_bid(head, b"begin "))
}

pub(crate) fn bid_base64(stream: &mut Lookahead) -> Result<i32> {
    let head = stream.peek(24)?;
    Ok(begin_line_bid(head, b"begin-base64 "))
}

pub(crate) fn open(stream: Lookahead) -> Result<Box<dyn ByteSource>> {
    Ok(StageSource::boxed(UuDecoder::new(stream)))
}

pub(crate) fn wrap(sink: SinkStack, framing: Framing) -> SinkStack {
    Box::new(UuEncoder::new(sink, framing))
}

fn bad_data(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("uu: {message}"))
}

/// Historic uuencode character for a 6-bit value; zero maps to a grave
/// accent rather than a space so nothing strips it.
fn uu_char(value: u8) -> u8 {
    if value == 0 {
        0x60
    } else {
        0x20 + value
    }
}

fn uu_value(ch: u8) -> u8 {
    ch.wrapping_sub(0x20) & 0x3f
}

fn b64_value(ch: u8) -> Option<u8> {
    match ch {
        b'A'..=b'Z' => Some(ch - b'A'),
        b'a'..=b'z' => Some(ch - b'a' + 26),
        b'0'..=b'9' => Some(ch - b'0' + 52),
        b'+' => Some(62),
        b'/' => Some(63),
        _ => None,
    }
}

enum DecodeState {
    AwaitBegin,
    Body(Framing),
    Done,
}

/// Streaming decoder for both text framings.
pub(crate) struct UuDecoder<R> {
    inner: R,
    rbuf: Vec<u8>,
    rpos: usize,
    rlen: usize,
    decoded: Vec<u8>,
    dpos: usize,
    state: DecodeState,
}

impl<R: Read> UuDecoder<R> {
    pub(crate) fn new(inner: R) -> Self {
        Self {
            inner,
            rbuf: vec![0; 4096],
            rpos: 0,
            rlen: 0,
            decoded: Vec::new(),
            dpos: 0,
            state: DecodeState::AwaitBegin,
        }
    }

    /// Next line without its terminator (`\r\n` and `\n` both end a
    /// line). `None` at EOF with nothing buffered.
    fn read_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut line = Vec::new();
        loop {
            if self.rpos == self.rlen {
                self.rlen = self.inner.read(&mut self.rbuf)?;
                self.rpos = 0;
                if self.rlen == 0 {
                    if line.is_empty() {
                        return Ok(None);
                    }
                    break;
                }
            }
            let byte = self.rbuf[self.rpos];
            self.rpos += 1;
            if byte == b'\n' {
                break;
            }
            if line.len() == MAX_LINE {
                return Err(bad_data("line too long"));
            }
            line.push(byte);
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Ok(Some(line))
    }

    fn consume_begin(&mut self) -> io::Result<()> {
        let Some(line) = self.read_line()? else {
            return Err(bad_data("missing begin line"));
        };
        let framing = if line.starts_with(b"begin-base64 ") {
            Framing::Base64
        } else if line.starts_with(b"begin ") {
            Framing::Uuencode
        } else {
            return Err(bad_data("missing begin line"));
        };
        self.state = DecodeState::Body(framing);
        Ok(())
    }

    fn decode_uu_line(&mut self, line: &[u8]) -> io::Result<bool> {
        if line.is_empty() {
            return Ok(true);
        }
        if line == b"end" {
            self.state = DecodeState::Done;
            return Ok(true);
        }
        let count = usize::from(uu_value(line[0]));
        if count == 0 {
            // Zero-length line; the "end" keyword follows. Anything after
            // it belongs to nobody and is dropped with the framing.
            self.state = DecodeState::Done;
            return Ok(true);
        }
        if count > UU_LINE_BYTES {
            return Err(bad_data("oversized uuencoded line"));
        }
        let mut produced = 0;
        let mut pos = 1;
        while produced < count {
            let group: [u8; 4] = std::array::from_fn(|i| {
                line.get(pos + i).copied().map_or(0, uu_value)
            });
            let bytes = [
                group[0] << 2 | group[1] >> 4,
                group[1] << 4 | group[2] >> 2,
                group[2] << 6 | group[3],
            ];
            let take = (count - produced).min(3);
            self.decoded.extend_from_slice(&bytes[..take]);
            produced += take;
            pos += 4;
        }
        Ok(true)
    }

    fn decode_b64_line(&mut self, line: &[u8]) -> io::Result<bool> {
        if line == b"====" {
            self.state = DecodeState::Done;
            return Ok(true);
        }
        let mut group = [0u8; 4];
        let mut filled = 0;
        for &ch in line {
            if ch == b'=' {
                break;
            }
            if ch.is_ascii_whitespace() {
                continue;
            }
            group[filled] = b64_value(ch).ok_or_else(|| bad_data("invalid base64 byte"))?;
            filled += 1;
            if filled == 4 {
                self.decoded.extend_from_slice(&[
                    group[0] << 2 | group[1] >> 4,
                    group[1] << 4 | group[2] >> 2,
                    group[2] << 6 | group[3],
                ]);
                filled = 0;
            }
        }
        match filled {
            0 => {}
            2 => self.decoded.push(group[0] << 2 | group[1] >> 4),
            3 => {
                self.decoded.push(group[0] << 2 | group[1] >> 4);
                self.decoded.push(group[1] << 4 | group[2] >> 2);
            }
            _ => return Err(bad_data("truncated base64 group")),
        }
        Ok(true)
    }

    /// Refill the decoded buffer; `false` once the framing has ended.
    fn pump(&mut self) -> io::Result<bool> {
        loop {
            match self.state {
                DecodeState::AwaitBegin => self.consume_begin()?,
                DecodeState::Done => return Ok(false),
                DecodeState::Body(framing) => {
                    let Some(line) = self.read_line()? else {
                        // Missing end marker: historic decoders stop quietly.
                        self.state = DecodeState::Done;
                        return Ok(false);
                    };
                    match framing {
                        Framing::Uuencode => self.decode_uu_line(&line)?,
                        Framing::Base64 => self.decode_b64_line(&line)?,
                    };
                    if !self.decoded.is_empty() {
                        return Ok(true);
                    }
                }
            }
        }
    }
}

impl<R: Read> Read for UuDecoder<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        while self.dpos == self.decoded.len() {
            self.decoded.clear();
            self.dpos = 0;
            if !self.pump()? {
                return Ok(0);
            }
        }
        let n = (self.decoded.len() - self.dpos).min(out.len());
        out[..n].copy_from_slice(&self.decoded[self.dpos..self.dpos + n]);
        self.dpos += n;
        Ok(n)
    }
}

/// Streaming encoder for either framing.
pub(crate) struct UuEncoder<W> {
    inner: W,
    framing: Framing,
    pending: Vec<u8>,
    begin_written: bool,
}

impl<W: Write> UuEncoder<W> {
    pub(crate) fn new(inner: W, framing: Framing) -> Self {
        Self {
            inner,
            framing,
            pending: Vec::new(),
            begin_written: false,
        }
    }

    fn line_bytes(&self) -> usize {
        match self.framing {
            Framing::Uuencode => UU_LINE_BYTES,
            Framing::Base64 => B64_LINE_BYTES,
        }
    }

    fn ensure_begin(&mut self) -> io::Result<()> {
        if !self.begin_written {
            let line: &[u8] = match self.framing {
                Framing::Uuencode => b"begin 644 data\n",
                Framing::Base64 => b"begin-base64 644 data\n",
            };
            self.inner.write_all(line)?;
            self.begin_written = true;
        }
        Ok(())
    }

    fn emit_line(&mut self, chunk: &[u8]) -> io::Result<()> {
        let mut line = Vec::with_capacity(80);
        match self.framing {
            Framing::Uuencode => {
                line.push(uu_char(chunk.len() as u8));
                for group in chunk.chunks(3) {
                    let b = [
                        group[0],
                        group.get(1).copied().unwrap_or(0),
                        group.get(2).copied().unwrap_or(0),
                    ];
                    line.push(uu_char(b[0] >> 2));
                    line.push(uu_char((b[0] << 4 | b[1] >> 4) & 0x3f));
                    line.push(uu_char((b[1] << 2 | b[2] >> 6) & 0x3f));
                    line.push(uu_char(b[2] & 0x3f));
                }
            }
            Framing::Base64 => {
                for group in chunk.chunks(3) {
                    let b = [
                        group[0],
                        group.get(1).copied().unwrap_or(0),
                        group.get(2).copied().unwrap_or(0),
                    ];
                    line.push(B64_ALPHABET[(b[0] >> 2) as usize]);
                    line.push(B64_ALPHABET[((b[0] << 4 | b[1] >> 4) & 0x3f) as usize]);
                    line.push(if group.len() > 1 {
                        B64_ALPHABET[((b[1] << 2 | b[2] >> 6) & 0x3f) as usize]
                    } else {
                        b'='
                    });
                    line.push(if group.len() > 2 {
                        B64_ALPHABET[(b[2] & 0x3f) as usize]
                    } else {
                        b'='
                    });
                }
            }
        }
        line.push(b'\n');
        self.inner.write_all(&line)
    }

    pub(crate) fn finalize(mut self) -> io::Result<W> {
        self.ensure_begin()?;
        if !self.pending.is_empty() {
            let chunk = std::mem::take(&mut self.pending);
            self.emit_line(&chunk)?;
        }
        match self.framing {
            Framing::Uuencode => self.inner.write_all(b"`\nend\n")?,
            Framing::Base64 => self.inner.write_all(b"====\n")?,
        }
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for UuEncoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ensure_begin()?;
        self.pending.extend_from_slice(buf);
        let line = self.line_bytes();
        while self.pending.len() >= line {
            let rest = self.pending.split_off(line);
            let chunk = std::mem::replace(&mut self.pending, rest);
            self.emit_line(&chunk)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        // Partial lines stay pending until finish.
        self.inner.flush()
    }
}

impl FinishWrite for UuEncoder<SinkStack> {
    fn finish(self: Box<Self>) -> Result<()> {
        let inner = (*self)
            .finalize()
            .map_err(|err| Error::flush_failure("uu", err))?;
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

    fn encode(data: &[u8], framing: Framing) -> Vec<u8> {
        let mut enc = UuEncoder::new(Vec::new(), framing);
        enc.write_all(data).unwrap();
        enc.finalize().unwrap()
    }

    fn decode(data: &[u8]) -> io::Result<Vec<u8>> {
        let mut dec = UuDecoder::new(Cursor::new(data.to_vec()));
        let mut out = Vec::new();
        dec.read_to_end(&mut out)?;
        Ok(out)
    }

    #[test]
    fn classic_vectors() {
        assert_eq!(encode(b"Cat", Framing::Uuencode), b"begin 644 data\n#0V%T\n`\nend\n");
        assert_eq!(
            encode(b"Cat", Framing::Base64),
            b"begin-base64 644 data\nQ2F0\n====\n"
        );
    }

    #[test]
    fn both_framings_round_trip() {
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        for framing in [Framing::Uuencode, Framing::Base64] {
            let text = encode(&data, framing);
            assert_eq!(decode(&text).unwrap(), data, "{framing:?}");
        }
    }

    #[test]
    fn decoder_accepts_stripped_trailing_spaces() {
        // "!0P``" for the single byte 'C', with the zero-valued padding
        // chars stripped off the way mail gateways used to.
        let text = b"begin 644 f\n!0P\n`\nend\n";
        assert_eq!(decode(text).unwrap(), b"C");
    }

    #[test]
    fn trailing_garbage_after_end_is_dropped() {
        let text = b"begin-base64 644 f\nQ2F0\n====\nleftover noise";
        assert_eq!(decode(text).unwrap(), b"Cat");
    }

    #[test]
    fn bids_are_framing_specific() {
        let uu = b"begin 644 data\n#0V%T\n`\nend\n";
        let b64 = b"begin-base64 644 data\nQ2F0\n====\n";
        assert!(bid_uuencode(&mut lookahead(uu)).unwrap() > 0);
        assert_eq!(bid_uuencode(&mut lookahead(b64)).unwrap(), 0);
        assert!(bid_base64(&mut lookahead(b64)).unwrap() > 0);
        assert_eq!(bid_base64(&mut lookahead(uu)).unwrap(), 0);
        assert_eq!(bid_uuencode(&mut lookahead(b"begin XYZ f\n")).unwrap(), 0);
        assert_eq!(bid_uuencode(&mut lookahead(b"beginning")).unwrap(), 0);
    }
}
