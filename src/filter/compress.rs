//! Unix `compress` (`.Z`) filter stage: an in-crate LZW codec.
//!
//! The historical tool blocked its output in groups of eight codes, so
//! junk padding appears wherever the code width changes or the table is
//! reset. Both ends here reproduce that quirk: the encoder pads each
//! section to a multiple of `n_bits` bytes, the decoder skips the same
//! padding. Codes are packed LSB-first, widths grow from 9 bits to the
//! header's maximum (we always write 16), and code 256 resets the table
//! in block mode.

use std::collections::HashMap;
use std::io::{self, Read, Write};

use crate::error::Error;
use crate::filter::{FinishWrite, SinkStack, StageSource};
use crate::io::lookahead::Lookahead;
use crate::io::ByteSource;
use crate::Result;

const MAGIC: [u8; 2] = [0x1f, 0x9d];
const BLOCK_MODE: u8 = 0x80;
const INIT_BITS: u32 = 9;
const CLEAR: u32 = 256;
const FIRST: u32 = 257;
const WRITE_MAX_BITS: u32 = 16;

pub(crate) fn bid(stream: &mut Lookahead) -> Result<i32> {
    let head = stream.peek(3)?;
    if head.len() < 3 || head[..2] != MAGIC {
        return Ok(0);
    }
    let max_bits = u32::from(head[2] & 0x1f);
    if !(INIT_BITS..=WRITE_MAX_BITS).contains(&max_bits) || head[2] & 0x60 != 0 {
        return Ok(0);
    }
    Ok(20)
}

pub(crate) fn open(stream: Lookahead) -> Result<Box<dyn ByteSource>> {
    Ok(StageSource::boxed(ZDecoder::new(stream)))
}

pub(crate) fn wrap(sink: SinkStack) -> SinkStack {
    Box::new(ZEncoder::new(sink))
}

fn bad_data(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("compress: {message}"))
}

/// Streaming LZW decoder.
pub(crate) struct ZDecoder<R> {
    inner: R,
    rbuf: Vec<u8>,
    rpos: usize,
    rlen: usize,
    bit_buf: u32,
    bit_count: u32,
    bytes_in_section: u32,
    n_bits: u32,
    max_bits: u32,
    block_mode: bool,
    maxcode: u32,
    maxmaxcode: u32,
    free_ent: u32,
    oldcode: i32,
    finchar: u8,
    prefix: Vec<u16>,
    suffix: Vec<u8>,
    /// Expanded string, drained from the back.
    stack: Vec<u8>,
    header_read: bool,
    eof: bool,
}

impl<R: Read> ZDecoder<R> {
    pub(crate) fn new(inner: R) -> Self {
        Self {
            inner,
            rbuf: vec![0; 4096],
            rpos: 0,
            rlen: 0,
            bit_buf: 0,
            bit_count: 0,
            bytes_in_section: 0,
            n_bits: INIT_BITS,
            max_bits: WRITE_MAX_BITS,
            block_mode: true,
            maxcode: (1 << INIT_BITS) - 1,
            maxmaxcode: 1 << WRITE_MAX_BITS,
            free_ent: FIRST,
            oldcode: -1,
            finchar: 0,
            prefix: Vec::new(),
            suffix: Vec::new(),
            stack: Vec::new(),
            header_read: false,
            eof: false,
        }
    }

    fn next_byte(&mut self) -> io::Result<Option<u8>> {
        if self.rpos == self.rlen {
            self.rlen = self.inner.read(&mut self.rbuf)?;
            self.rpos = 0;
            if self.rlen == 0 {
                return Ok(None);
            }
        }
        let byte = self.rbuf[self.rpos];
        self.rpos += 1;
        Ok(Some(byte))
    }

    fn read_header(&mut self) -> io::Result<()> {
        let mut header = [0u8; 3];
        for slot in &mut header {
            *slot = self
                .next_byte()?
                .ok_or_else(|| bad_data("truncated header"))?;
        }
        if header[..2] != MAGIC {
            return Err(bad_data("bad magic"));
        }
        self.max_bits = u32::from(header[2] & 0x1f);
        if !(INIT_BITS..=WRITE_MAX_BITS).contains(&self.max_bits) {
            return Err(bad_data("unsupported maximum code width"));
        }
        self.block_mode = header[2] & BLOCK_MODE != 0;
        self.maxmaxcode = 1 << self.max_bits;
        self.free_ent = if self.block_mode { FIRST } else { CLEAR };
        self.prefix = vec![0; self.maxmaxcode as usize];
        self.suffix = (0..self.maxmaxcode)
            .map(|code| (code & 0xff) as u8)
            .collect();
        self.header_read = true;
        Ok(())
    }

    /// Pull the next `n_bits` wide code; `None` once the stream (or its
    /// trailing partial code, which encoders emit as flush padding) ends.
    fn read_code(&mut self) -> io::Result<Option<u32>> {
        while self.bit_count < self.n_bits {
            match self.next_byte()? {
                None => return Ok(None),
                Some(byte) => {
                    self.bit_buf |= u32::from(byte) << self.bit_count;
                    self.bit_count += 8;
                    self.bytes_in_section += 1;
                }
            }
        }
        let code = self.bit_buf & ((1 << self.n_bits) - 1);
        self.bit_buf >>= self.n_bits;
        self.bit_count -= self.n_bits;
        Ok(Some(code))
    }

    /// Discard the group padding: drop the partial byte, then whole
    /// bytes until the section length is a multiple of `n_bits`.
    fn realign(&mut self) -> io::Result<()> {
        self.bit_buf = 0;
        self.bit_count = 0;
        let mut pad = (self.n_bits - self.bytes_in_section % self.n_bits) % self.n_bits;
        while pad > 0 {
            if self.next_byte()?.is_none() {
                break;
            }
            pad -= 1;
        }
        self.bytes_in_section = 0;
        Ok(())
    }

    /// Decode one code onto the stack. `false` means end of stream.
    fn next_code(&mut self) -> io::Result<bool> {
        if self.free_ent > self.maxcode {
            self.realign()?;
            self.n_bits += 1;
            self.maxcode = if self.n_bits == self.max_bits {
                self.maxmaxcode
            } else {
                (1 << self.n_bits) - 1
            };
        }
        let Some(code) = self.read_code()? else {
            return Ok(false);
        };
        if self.oldcode < 0 {
            if code >= 256 {
                return Err(bad_data("first code is not a literal"));
            }
            self.finchar = code as u8;
            self.oldcode = code as i32;
            self.stack.push(self.finchar);
            return Ok(true);
        }
        if code == CLEAR && self.block_mode {
            for slot in &mut self.prefix {
                *slot = 0;
            }
            self.free_ent = FIRST - 1;
            self.realign()?;
            self.n_bits = INIT_BITS;
            self.maxcode = (1 << INIT_BITS) - 1;
            return Ok(true);
        }
        let incode = code;
        let mut code = code;
        if code >= self.free_ent {
            if code > self.free_ent {
                return Err(bad_data("code beyond table"));
            }
            // KwKwK: the string being defined by this very code.
            self.stack.push(self.finchar);
            code = self.oldcode as u32;
        }
        while code >= 256 {
            self.stack.push(self.suffix[code as usize]);
            code = u32::from(self.prefix[code as usize]);
        }
        self.finchar = self.suffix[code as usize];
        self.stack.push(self.finchar);
        if self.free_ent < self.maxmaxcode {
            self.prefix[self.free_ent as usize] = self.oldcode as u16;
            self.suffix[self.free_ent as usize] = self.finchar;
            self.free_ent += 1;
        }
        self.oldcode = incode as i32;
        Ok(true)
    }
}

impl<R: Read> Read for ZDecoder<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        if !self.header_read {
            self.read_header()?;
        }
        let mut written = 0;
        while written < out.len() {
            match self.stack.pop() {
                Some(byte) => {
                    out[written] = byte;
                    written += 1;
                }
                None => {
                    if self.eof {
                        break;
                    }
                    if !self.next_code()? {
                        self.eof = true;
                    }
                }
            }
        }
        Ok(written)
    }
}

/// Streaming LZW encoder; always block mode with 16-bit codes.
pub(crate) struct ZEncoder<W> {
    inner: W,
    table: HashMap<(u16, u8), u16>,
    free_ent: u32,
    n_bits: u32,
    maxcode: u32,
    clear_pending: bool,
    /// Current prefix code; -1 before the first input byte.
    ent: i32,
    bit_buf: u32,
    bit_count: u32,
    bytes_in_section: u32,
    header_written: bool,
    staged: Vec<u8>,
}

impl<W: Write> ZEncoder<W> {
    pub(crate) fn new(inner: W) -> Self {
        Self {
            inner,
            table: HashMap::new(),
            free_ent: FIRST,
            n_bits: INIT_BITS,
            maxcode: (1 << INIT_BITS) - 1,
            clear_pending: false,
            ent: -1,
            bit_buf: 0,
            bit_count: 0,
            bytes_in_section: 0,
            header_written: false,
            staged: Vec::new(),
        }
    }

    fn push_byte(&mut self, byte: u8) {
        if self.ent < 0 {
            self.ent = i32::from(byte);
            return;
        }
        if let Some(&code) = self.table.get(&(self.ent as u16, byte)) {
            self.ent = i32::from(code);
            return;
        }
        self.output(self.ent as u32);
        if self.free_ent < 1 << WRITE_MAX_BITS {
            self.table
                .insert((self.ent as u16, byte), self.free_ent as u16);
            self.free_ent += 1;
        } else {
            // Table full: reset it, exactly as compress(1) does when the
            // ratio decays (we reset eagerly).
            self.table.clear();
            self.free_ent = FIRST;
            self.clear_pending = true;
            self.output(CLEAR);
        }
        self.ent = i32::from(byte);
    }

    fn output(&mut self, code: u32) {
        self.bit_buf |= code << self.bit_count;
        self.bit_count += self.n_bits;
        while self.bit_count >= 8 {
            self.staged.push((self.bit_buf & 0xff) as u8);
            self.bit_buf >>= 8;
            self.bit_count -= 8;
            self.bytes_in_section += 1;
        }
        if self.free_ent > self.maxcode || self.clear_pending {
            self.pad_section();
            if self.clear_pending {
                self.clear_pending = false;
                self.n_bits = INIT_BITS;
                self.maxcode = (1 << INIT_BITS) - 1;
            } else {
                self.n_bits += 1;
                self.maxcode = if self.n_bits == WRITE_MAX_BITS {
                    1 << WRITE_MAX_BITS
                } else {
                    (1 << self.n_bits) - 1
                };
            }
        }
    }

    /// Flush the partial byte and zero-pad the section to a multiple of
    /// `n_bits` bytes, mirroring the historical group flush.
    fn pad_section(&mut self) {
        if self.bit_count > 0 {
            self.staged.push((self.bit_buf & 0xff) as u8);
            self.bit_buf = 0;
            self.bit_count = 0;
            self.bytes_in_section += 1;
        }
        let pad = (self.n_bits - self.bytes_in_section % self.n_bits) % self.n_bits;
        for _ in 0..pad {
            self.staged.push(0);
        }
        self.bytes_in_section = 0;
    }

    fn drain_staged(&mut self) -> io::Result<()> {
        if !self.header_written {
            self.inner
                .write_all(&[MAGIC[0], MAGIC[1], BLOCK_MODE | WRITE_MAX_BITS as u8])?;
            self.header_written = true;
        }
        if !self.staged.is_empty() {
            self.inner.write_all(&self.staged)?;
            self.staged.clear();
        }
        Ok(())
    }

    /// Emit the trailing code and partial byte, then hand back the sink.
    pub(crate) fn finalize(mut self) -> io::Result<W> {
        if self.ent >= 0 {
            self.output(self.ent as u32);
        }
        if self.bit_count > 0 {
            self.staged.push((self.bit_buf & 0xff) as u8);
            self.bit_buf = 0;
            self.bit_count = 0;
        }
        self.drain_staged()?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for ZEncoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for &byte in buf {
            self.push_byte(byte);
        }
        self.drain_staged()?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        // Pending bits stay buffered; only completed bytes can flush.
        self.drain_staged()?;
        self.inner.flush()
    }
}

impl FinishWrite for ZEncoder<SinkStack> {
    fn finish(self: Box<Self>) -> Result<()> {
        let inner = (*self)
            .finalize()
            .map_err(|err| Error::flush_failure("compress", err))?;
        inner.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::ReaderSource;
    use proptest::prelude::*;
    use std::io::Cursor;

    fn lookahead(bytes: &[u8]) -> Lookahead {
        Lookahead::from_source(ReaderSource::new(Cursor::new(bytes.to_vec())), "test")
    }

    fn compress_bytes(data: &[u8]) -> Vec<u8> {
        let mut enc = ZEncoder::new(Vec::new());
        enc.write_all(data).unwrap();
        enc.finalize().unwrap()
    }

    fn decompress_bytes(data: &[u8]) -> io::Result<Vec<u8>> {
        let mut dec = ZDecoder::new(Cursor::new(data.to_vec()));
        let mut out = Vec::new();
        dec.read_to_end(&mut out)?;
        Ok(out)
    }

    #[test]
    fn header_is_block_mode_sixteen_bits() {
        let encoded = compress_bytes(b"");
        assert_eq!(encoded, vec![0x1f, 0x9d, 0x90]);
        assert_eq!(decompress_bytes(&encoded).unwrap(), b"");
    }

    #[test]
    fn repetitive_input_round_trips() {
        let data: Vec<u8> = b"abcabcabcabc".iter().copied().cycle().take(10_000).collect();
        let encoded = compress_bytes(&data);
        assert!(encoded.len() < data.len(), "LZW must win on repetition");
        assert_eq!(decompress_bytes(&encoded).unwrap(), data);
    }

    #[test]
    fn width_growth_and_table_reset_round_trip() {
        // A cheap generator with enough novelty to march the code width
        // all the way to 16 bits and force a table reset.
        let mut state = 0x2545_f491u32;
        let data: Vec<u8> = (0..200_000)
            .map(|_| {
                state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                (state >> 16) as u8
            })
            .collect();
        let encoded = compress_bytes(&data);
        assert_eq!(decompress_bytes(&encoded).unwrap(), data);
    }

    #[test]
    fn rejects_leading_non_literal_code() {
        // 9-bit code 300 packed LSB-first directly after the header.
        let err = decompress_bytes(&[0x1f, 0x9d, 0x90, 0x2c, 0x01]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn bid_checks_magic_and_width() {
        assert_eq!(bid(&mut lookahead(&[0x1f, 0x9d, 0x90])).unwrap(), 20);
        assert_eq!(bid(&mut lookahead(&[0x1f, 0x9d, 0x08])).unwrap(), 0);
        assert_eq!(bid(&mut lookahead(&[0x1f, 0x9d, 0xff])).unwrap(), 0);
        assert_eq!(bid(&mut lookahead(&[0x1f, 0x9e, 0x90])).unwrap(), 0);
        assert_eq!(bid(&mut lookahead(&[0x1f, 0x9d])).unwrap(), 0);
    }

    proptest! {
        #[test]
        fn arbitrary_bytes_round_trip(data in proptest::collection::vec(any::<u8>(), 0..4096)) {
            let encoded = compress_bytes(&data);
            prop_assert_eq!(decompress_bytes(&encoded).unwrap(), data);
        }
    }
}
