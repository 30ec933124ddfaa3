//! zip container, streamed strictly forward.
//!
//! The reader walks local file headers in stream order and never visits
//! the central directory; entries whose producer set general-purpose
//! flag bit 3 carry their sizes and CRC in a trailing data descriptor,
//! so their size stays unknown until the deflate stream self-terminates.
//! The writer streams deflate entries with bit 3 descriptors, holds
//! stored payloads back so their headers carry real sizes, and emits
//! the central directory on finish. Deflate entry bodies ride on flate2's
//! raw `Decompress`/`Compress` state, bounded by exact input accounting
//! against the lookahead so a corrupt stream can never run into the next
//! header.

use std::io::Write;

use bstr::BString;

#[cfg(feature = "gzip")]
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time};

use crate::entry::{Entry, EntryKind, Timestamp};
use crate::error::Error;
use crate::format::{peek_exact, read_exact_vec, skip_exact, FormatReader, FormatWriter, PayloadBlock};
use crate::io::lookahead::Lookahead;
use crate::Result;

const SIG_LOCAL: u32 = 0x0403_4b50;
const SIG_CENTRAL: u32 = 0x0201_4b50;
const SIG_EOCD: u32 = 0x0605_4b50;
const SIG_DESCRIPTOR: u32 = 0x0807_4b50;

const METHOD_STORED: u16 = 0;
const METHOD_DEFLATE: u16 = 8;

const FLAG_ENCRYPTED: u16 = 0x0001;
const FLAG_DESCRIPTOR: u16 = 0x0008;

/// Local-header or end-of-central-directory signature.
pub(crate) fn bid(stream: &mut Lookahead) -> Result<i32> {
    let head = stream.peek(4)?;
    if head.len() < 4 {
        return Ok(0);
    }
    let sig = u32::from_le_bytes(head[..4].try_into().unwrap());
    if sig == SIG_LOCAL || sig == SIG_EOCD {
        return Ok(32);
    }
    Ok(0)
}

pub(crate) fn open() -> Box<dyn FormatReader> {
    Box::new(ZipReader {
        body: Body::None,
        has_descriptor: false,
        zip64: false,
        expected_crc: None,
        expected_size: None,
        compressed_remaining: 0,
        compressed_consumed: 0,
        delivered: 0,
        #[cfg(feature = "gzip")]
        crc: flate2::Crc::new(),
        done: false,
    })
}

fn u16le(bytes: &[u8]) -> u16 {
    u16::from_le_bytes(bytes[..2].try_into().unwrap())
}

fn u32le(bytes: &[u8]) -> u32 {
    u32::from_le_bytes(bytes[..4].try_into().unwrap())
}

fn u64le(bytes: &[u8]) -> u64 {
    u64::from_le_bytes(bytes[..8].try_into().unwrap())
}

enum Body {
    None,
    Stored {
        remaining: u64,
    },
    #[cfg(feature = "gzip")]
    Deflate {
        inflate: Box<Decompress>,
        finished: bool,
    },
}

pub(crate) struct ZipReader {
    body: Body,
    has_descriptor: bool,
    zip64: bool,
    expected_crc: Option<u32>,
    expected_size: Option<u64>,
    /// Compressed bytes left for bounded-size entries; u64::MAX when the
    /// descriptor will tell us.
    compressed_remaining: u64,
    compressed_consumed: u64,
    delivered: u64,
    #[cfg(feature = "gzip")]
    crc: flate2::Crc,
    done: bool,
}

/// DOS date/time to a unix timestamp; implausible fields yield `None`
/// rather than an error, matching how zip tooling shrugs at them.
fn from_dos_datetime(date: u16, dos_time: u16) -> Option<Timestamp> {
    let year = 1980 + i32::from(date >> 9);
    let month = Month::try_from(((date >> 5) & 0xf) as u8).ok()?;
    let day = (date & 0x1f) as u8;
    let hour = (dos_time >> 11) as u8;
    let minute = ((dos_time >> 5) & 0x3f) as u8;
    let second = ((dos_time & 0x1f) * 2) as u8;
    let date = Date::from_calendar_date(year, month, day).ok()?;
    let time = Time::from_hms(hour, minute, second).ok()?;
    Some(Timestamp::from_secs(
        PrimitiveDateTime::new(date, time).assume_utc().unix_timestamp(),
    ))
}

/// Unix timestamp to DOS date/time, clamped to the representable
/// 1980..=2107 window.
fn to_dos_datetime(ts: Option<Timestamp>) -> (u16, u16) {
    let Some(ts) = ts else {
        return (0x21, 0); // 1980-01-01 00:00:00
    };
    let Ok(dt) = OffsetDateTime::from_unix_timestamp(ts.secs) else {
        return (0x21, 0);
    };
    let year = dt.year().clamp(1980, 2107);
    let date = ((year - 1980) as u16) << 9
        | u16::from(dt.month() as u8) << 5
        | u16::from(dt.day());
    let time = u16::from(dt.hour()) << 11
        | u16::from(dt.minute()) << 5
        | u16::from(dt.second()) / 2;
    (date, time)
}

struct ExtraFields {
    zip64_usize: Option<u64>,
    zip64_csize: Option<u64>,
    unix_mtime: Option<i64>,
    uid: Option<u64>,
    gid: Option<u64>,
}

fn parse_extra(extra: &[u8], lfh_usize: u32, lfh_csize: u32) -> ExtraFields {
    let mut fields = ExtraFields {
        zip64_usize: None,
        zip64_csize: None,
        unix_mtime: None,
        uid: None,
        gid: None,
    };
    let mut rest = extra;
    while rest.len() >= 4 {
        let id = u16le(rest);
        let len = u16le(&rest[2..]) as usize;
        let Some(body) = rest.get(4..4 + len) else {
            break;
        };
        match id {
            0x0001 => {
                let mut body = body;
                if lfh_usize == u32::MAX && body.len() >= 8 {
                    fields.zip64_usize = Some(u64le(body));
                    body = &body[8..];
                }
                if lfh_csize == u32::MAX && body.len() >= 8 {
                    fields.zip64_csize = Some(u64le(body));
                }
            }
            0x5455 => {
                if body.first().map_or(false, |&flags| flags & 1 != 0) && body.len() >= 5 {
                    fields.unix_mtime = Some(i64::from(u32le(&body[1..]) as i32));
                }
            }
            0x7875 => {
                // version, uid size, uid, gid size, gid, all LE.
                if body.first() == Some(&1) && body.len() >= 2 {
                    let uid_len = body[1] as usize;
                    if let Some(uid) = body.get(2..2 + uid_len) {
                        fields.uid = Some(uint_le(uid));
                        let gid_at = 2 + uid_len + 1;
                        if let Some(&gid_len) = body.get(2 + uid_len) {
                            if let Some(gid) = body.get(gid_at..gid_at + gid_len as usize) {
                                fields.gid = Some(uint_le(gid));
                            }
                        }
                    }
                }
            }
            _ => {}
        }
        rest = &rest[4 + len..];
    }
    fields
}

fn uint_le(bytes: &[u8]) -> u64 {
    let mut value = 0u64;
    for (index, &byte) in bytes.iter().take(8).enumerate() {
        value |= u64::from(byte) << (index * 8);
    }
    value
}

impl FormatReader for ZipReader {
    fn next_entry(&mut self, stream: &mut Lookahead) -> Result<Option<Entry>> {
        if self.done {
            return Ok(None);
        }
        let offset = stream.stream_offset();
        let sig_bytes = peek_exact(stream, 4, "zip signature")?;
        let sig = u32le(sig_bytes);
        if sig == SIG_CENTRAL || sig == SIG_EOCD {
            // The entry stream is over; the central directory repeats
            // what we already delivered.
            stream.skip(u64::MAX)?;
            self.done = true;
            return Ok(None);
        }
        if sig != SIG_LOCAL {
            return Err(Error::corrupt(format!(
                "zip: expected a local file header at offset {offset}, found {sig:#010x}"
            )));
        }
        let head = peek_exact(stream, 30, "zip local header")?.to_vec();
        let flags = u16le(&head[6..]);
        let method = u16le(&head[8..]);
        let dos_time = u16le(&head[10..]);
        let dos_date = u16le(&head[12..]);
        let crc = u32le(&head[14..]);
        let csize = u32le(&head[18..]);
        let usize_ = u32le(&head[22..]);
        let name_len = u16le(&head[26..]) as usize;
        let extra_len = u16le(&head[28..]) as usize;
        stream.consume(30);

        if flags & FLAG_ENCRYPTED != 0 {
            return Err(Error::unsupported(format!(
                "zip: encrypted entry at offset {offset}"
            )));
        }
        let name = read_exact_vec(stream, name_len, "zip entry name")?;
        let extra = read_exact_vec(stream, extra_len, "zip extra fields")?;
        let fields = parse_extra(&extra, usize_, csize);
        self.zip64 = fields.zip64_usize.is_some() || fields.zip64_csize.is_some();
        let usize_ = fields.zip64_usize.unwrap_or(u64::from(usize_));
        let csize = fields.zip64_csize.unwrap_or(u64::from(csize));

        self.has_descriptor = flags & FLAG_DESCRIPTOR != 0;
        let size_known = !self.has_descriptor;
        self.delivered = 0;
        self.compressed_consumed = 0;
        #[cfg(feature = "gzip")]
        {
            self.crc = flate2::Crc::new();
        }
        self.expected_crc = if size_known { Some(crc) } else { None };
        self.expected_size = if size_known { Some(usize_) } else { None };

        let is_dir = name.last() == Some(&b'/');
        self.body = match method {
            METHOD_STORED => {
                if self.has_descriptor && !is_dir {
                    return Err(Error::corrupt(
                        "zip: stored entry with unknown sizes is not streamable",
                    ));
                }
                self.compressed_remaining = if is_dir { 0 } else { usize_ };
                Body::Stored {
                    remaining: if is_dir { 0 } else { usize_ },
                }
            }
            #[cfg(feature = "gzip")]
            METHOD_DEFLATE => {
                self.compressed_remaining = if size_known { csize } else { u64::MAX };
                Body::Deflate {
                    inflate: Box::new(Decompress::new(false)),
                    finished: false,
                }
            }
            #[cfg(not(feature = "gzip"))]
            METHOD_DEFLATE => {
                return Err(Error::unsupported(
                    "zip: deflate support not compiled in (enable the gzip feature)",
                ))
            }
            other => {
                return Err(Error::unsupported(format!(
                    "zip: compression method {other} is not supported"
                )))
            }
        };

        let mut name = name;
        // Entries carry the bare directory name, as in the other formats.
        if is_dir && name.len() > 1 {
            name.pop();
        }
        let mut entry = Entry::new(
            BString::from(name),
            if is_dir {
                EntryKind::Directory
            } else {
                EntryKind::Regular
            },
        );
        if is_dir {
            entry.set_size(None);
        } else {
            entry.set_size(size_known.then_some(usize_));
        }
        let mtime = fields
            .unix_mtime
            .map(Timestamp::from_secs)
            .or_else(|| from_dos_datetime(dos_date, dos_time));
        if let Some(mtime) = mtime {
            entry = entry.with_mtime(mtime);
        }
        if fields.uid.is_some() || fields.gid.is_some() {
            entry = entry.with_owner(fields.uid.unwrap_or(0), fields.gid.unwrap_or(0));
        }
        Ok(Some(entry))
    }

    fn next_block(&mut self, stream: &mut Lookahead, out: &mut [u8]) -> Result<PayloadBlock> {
        match &mut self.body {
            Body::None => Ok(PayloadBlock::End),
            Body::Stored { remaining } => {
                if *remaining == 0 {
                    return Ok(PayloadBlock::End);
                }
                let want = usize::try_from((*remaining).min(out.len() as u64)).unwrap_or(out.len());
                let got = stream.read_into(&mut out[..want])?;
                if got == 0 {
                    return Err(Error::short_read(format!(
                        "zip payload truncated with {remaining} bytes undelivered"
                    )));
                }
                *remaining -= got as u64;
                self.delivered += got as u64;
                #[cfg(feature = "gzip")]
                self.crc.update(&out[..got]);
                Ok(PayloadBlock::Data(got))
            }
            #[cfg(feature = "gzip")]
            Body::Deflate { inflate, finished } => {
                if *finished {
                    return Ok(PayloadBlock::End);
                }
                let mut need = 1usize;
                loop {
                    let cap = usize::try_from(self.compressed_remaining.min(1 << 20))
                        .unwrap_or(1 << 20);
                    let requested = need.min(cap.max(1));
                    let input = stream.peek(requested)?;
                    let input_len = input.len().min(cap);
                    let input = &input[..input_len];
                    if input.is_empty() {
                        return Err(Error::short_read(
                            "zip deflate stream truncated before its final block",
                        ));
                    }
                    let before_in = inflate.total_in();
                    let before_out = inflate.total_out();
                    let status = inflate
                        .decompress(input, out, FlushDecompress::None)
                        .map_err(|_| Error::corrupt("zip: invalid deflate data"))?;
                    let used = (inflate.total_in() - before_in) as usize;
                    let produced = (inflate.total_out() - before_out) as usize;
                    stream.consume(used);
                    self.compressed_consumed += used as u64;
                    if self.compressed_remaining != u64::MAX {
                        self.compressed_remaining -= used as u64;
                    }
                    if status == Status::StreamEnd {
                        *finished = true;
                    }
                    if produced > 0 {
                        self.crc.update(&out[..produced]);
                        self.delivered += produced as u64;
                        return Ok(PayloadBlock::Data(produced));
                    }
                    if *finished {
                        return Ok(PayloadBlock::End);
                    }
                    if used == 0 {
                        if input_len as u64 >= self.compressed_remaining {
                            return Err(Error::corrupt(
                                "zip: deflate stream runs past its declared compressed size",
                            ));
                        }
                        if input_len < requested {
                            return Err(Error::short_read(
                                "zip deflate stream truncated before its final block",
                            ));
                        }
                    }
                    // Grow the peek window until the inflater can make
                    // progress.
                    need = input_len + 1;
                }
            }
        }
    }

    fn finish_entry(&mut self, stream: &mut Lookahead) -> Result<()> {
        // Bounded entries may leave validly unconsumed compressed bytes
        // only as trailing NUL padding from odd producers; anything else
        // has already failed inside next_block.
        if !self.has_descriptor && self.compressed_remaining > 0 {
            let leftover = self.compressed_remaining;
            self.compressed_remaining = 0;
            skip_exact(stream, leftover, "zip compressed payload tail")?;
        }
        if self.has_descriptor {
            let head = peek_exact(stream, 4, "zip data descriptor")?;
            if u32le(head) == SIG_DESCRIPTOR {
                stream.consume(4);
            }
            let width = if self.zip64 { 8 } else { 4 };
            let descriptor = read_exact_vec(stream, 4 + 2 * width, "zip data descriptor")?;
            let crc = u32le(&descriptor);
            let (csize, usize_) = if self.zip64 {
                (u64le(&descriptor[4..]), u64le(&descriptor[12..]))
            } else {
                (
                    u64::from(u32le(&descriptor[4..])),
                    u64::from(u32le(&descriptor[8..])),
                )
            };
            if csize != self.compressed_consumed {
                return Err(Error::corrupt(format!(
                    "zip descriptor claims {csize} compressed bytes, stream held {}",
                    self.compressed_consumed
                )));
            }
            self.expected_crc = Some(crc);
            self.expected_size = Some(usize_);
        }
        if let Some(expected) = self.expected_size.take() {
            if expected != self.delivered {
                return Err(Error::corrupt(format!(
                    "zip entry declared {expected} bytes but delivered {}",
                    self.delivered
                )));
            }
        }
        #[cfg(feature = "gzip")]
        if let Some(expected) = self.expected_crc.take() {
            let actual = self.crc.sum();
            if expected != actual {
                return Err(Error::corrupt(format!(
                    "zip crc mismatch: header {expected:#010x}, payload {actual:#010x}"
                )));
            }
        }
        self.expected_crc = None;
        self.body = Body::None;
        Ok(())
    }
}

/// Entry body compression for the writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZipMethod {
    Stored,
    #[cfg(feature = "gzip")]
    Deflate,
}

impl Default for ZipMethod {
    fn default() -> Self {
        #[cfg(feature = "gzip")]
        {
            Self::Deflate
        }
        #[cfg(not(feature = "gzip"))]
        {
            Self::Stored
        }
    }
}

fn local_header(record: &CentralRecord) -> Vec<u8> {
    let mut header = Vec::with_capacity(30 + record.name.len());
    header.extend_from_slice(&SIG_LOCAL.to_le_bytes());
    header.extend_from_slice(&20u16.to_le_bytes()); // version needed
    header.extend_from_slice(&record.flags.to_le_bytes());
    header.extend_from_slice(&record.method.to_le_bytes());
    header.extend_from_slice(&record.dos_time.to_le_bytes());
    header.extend_from_slice(&record.dos_date.to_le_bytes());
    header.extend_from_slice(&record.crc.to_le_bytes());
    header.extend_from_slice(&(record.csize as u32).to_le_bytes());
    header.extend_from_slice(&(record.usize_ as u32).to_le_bytes());
    header.extend_from_slice(&(record.name.len() as u16).to_le_bytes());
    header.extend_from_slice(&0u16.to_le_bytes()); // extra len
    header.extend_from_slice(&record.name);
    header
}

struct CentralRecord {
    name: Vec<u8>,
    method: u16,
    flags: u16,
    crc: u32,
    csize: u64,
    usize_: u64,
    dos_date: u16,
    dos_time: u16,
    external: u32,
    offset: u64,
}

enum OpenBody {
    /// Payload held back; the local header goes out on finish once the
    /// CRC and sizes are known, so no data descriptor is needed.
    Stored { buffer: Vec<u8> },
    /// Header already written with zero sizes; nothing follows.
    Directory,
    #[cfg(feature = "gzip")]
    Deflate(Box<Compress>),
}

struct OpenEntry {
    body: OpenBody,
    record: CentralRecord,
    #[cfg(feature = "gzip")]
    crc: flate2::Crc,
    usize_: u64,
    csize: u64,
    /// Symlink target emitted as the entry payload on finish.
    pending_target: Option<BString>,
}

pub(crate) struct ZipWriter {
    method: ZipMethod,
    position: u64,
    records: Vec<CentralRecord>,
    open: Option<OpenEntry>,
}

impl ZipWriter {
    pub(crate) fn new(method: ZipMethod) -> Self {
        Self {
            method,
            position: 0,
            records: Vec::new(),
            open: None,
        }
    }

    fn put(&mut self, sink: &mut dyn Write, bytes: &[u8], what: &str) -> Result<()> {
        sink.write_all(bytes)
            .map_err(|err| Error::io(err, format!("zip: writing {what}")))?;
        self.position += bytes.len() as u64;
        Ok(())
    }

    fn push_payload(&mut self, sink: &mut dyn Write, buf: &[u8]) -> Result<()> {
        let Some(open) = self.open.as_mut() else {
            return Err(Error::misuse("zip payload write with no open entry"));
        };
        open.usize_ += buf.len() as u64;
        #[cfg(feature = "gzip")]
        open.crc.update(buf);
        let chunk = match &mut open.body {
            OpenBody::Stored { buffer } => {
                buffer.extend_from_slice(buf);
                Vec::new()
            }
            OpenBody::Directory => buf.to_vec(),
            #[cfg(feature = "gzip")]
            OpenBody::Deflate(deflate) => {
                let mut scratch = [0u8; 16 * 1024];
                let mut compressed = Vec::new();
                let mut input = buf;
                while !input.is_empty() {
                    let before_in = deflate.total_in();
                    let before_out = deflate.total_out();
                    deflate
                        .compress(input, &mut scratch, FlushCompress::None)
                        .map_err(|err| {
                            Error::io(
                                std::io::Error::new(std::io::ErrorKind::Other, err),
                                "zip: deflate state",
                            )
                        })?;
                    let used = (deflate.total_in() - before_in) as usize;
                    let produced = (deflate.total_out() - before_out) as usize;
                    input = &input[used..];
                    compressed.extend_from_slice(&scratch[..produced]);
                }
                compressed
            }
        };
        open.csize += chunk.len() as u64;
        self.put(sink, &chunk, "entry payload")
    }
}

impl FormatWriter for ZipWriter {
    fn write_header(&mut self, sink: &mut dyn Write, entry: &Entry) -> Result<()> {
        let (is_dir, pending_target) = match entry.kind() {
            EntryKind::Regular => (false, None),
            EntryKind::Directory => (true, None),
            // Symlinks store their target as the payload with the unix
            // mode in the external attributes, the Info-ZIP way.
            EntryKind::Symlink => (
                false,
                Some(entry.link_target().cloned().ok_or_else(|| {
                    Error::misuse("symlink entry without a target")
                })?),
            ),
            other => {
                return Err(Error::unsupported(format!(
                    "zip cannot represent {other} entries"
                )))
            }
        };
        let mut name = entry.path().to_vec();
        if is_dir && name.last() != Some(&b'/') {
            name.push(b'/');
        }
        if name.len() > usize::from(u16::MAX) {
            return Err(Error::unsupported("zip entry name exceeds 65535 bytes"));
        }

        let method = if is_dir {
            METHOD_STORED
        } else {
            match self.method {
                ZipMethod::Stored => METHOD_STORED,
                #[cfg(feature = "gzip")]
                ZipMethod::Deflate => METHOD_DEFLATE,
            }
        };
        // Bit 3 is only set where the sizes truly are unknown up front:
        // deflate output. Stored payloads are held back instead, since
        // a stored entry behind a descriptor cannot be re-read from a
        // plain stream.
        let flags = if !is_dir && method == METHOD_DEFLATE {
            FLAG_DESCRIPTOR
        } else {
            0
        };
        let (dos_date, dos_time) = to_dos_datetime(entry.mtime());

        #[cfg(feature = "gzip")]
        let body = if is_dir {
            OpenBody::Directory
        } else if method == METHOD_DEFLATE {
            OpenBody::Deflate(Box::new(Compress::new(Compression::default(), false)))
        } else {
            OpenBody::Stored { buffer: Vec::new() }
        };
        #[cfg(not(feature = "gzip"))]
        let body = if is_dir {
            OpenBody::Directory
        } else {
            OpenBody::Stored { buffer: Vec::new() }
        };

        let record = CentralRecord {
            name,
            method,
            flags,
            crc: 0,
            csize: 0,
            usize_: 0,
            dos_date,
            dos_time,
            external: entry.unix_mode() << 16 | if is_dir { 0x10 } else { 0 },
            offset: self.position,
        };
        if !matches!(body, OpenBody::Stored { .. }) {
            let header = local_header(&record);
            self.put(sink, &header, "local file header")?;
        }

        self.open = Some(OpenEntry {
            body,
            record,
            #[cfg(feature = "gzip")]
            crc: flate2::Crc::new(),
            usize_: 0,
            csize: 0,
            pending_target,
        });
        Ok(())
    }

    fn write_data(&mut self, sink: &mut dyn Write, buf: &[u8]) -> Result<()> {
        self.push_payload(sink, buf)
    }

    fn finish_entry(&mut self, sink: &mut dyn Write, _written: u64) -> Result<()> {
        if let Some(target) = self
            .open
            .as_mut()
            .and_then(|open| open.pending_target.take())
        {
            self.push_payload(sink, &target)?;
        }
        let Some(open) = self.open.as_mut() else {
            return Err(Error::misuse("zip finish_entry with no open entry"));
        };
        // Flush the deflate trailer.
        #[cfg(feature = "gzip")]
        let tail = if let OpenBody::Deflate(deflate) = &mut open.body {
            let mut scratch = [0u8; 16 * 1024];
            let mut tail = Vec::new();
            loop {
                let before_out = deflate.total_out();
                let status = deflate
                    .compress(&[], &mut scratch, FlushCompress::Finish)
                    .map_err(|err| {
                        Error::io(
                            std::io::Error::new(std::io::ErrorKind::Other, err),
                            "zip: deflate finish",
                        )
                    })?;
                let produced = (deflate.total_out() - before_out) as usize;
                tail.extend_from_slice(&scratch[..produced]);
                if status == Status::StreamEnd {
                    break;
                }
            }
            open.csize += tail.len() as u64;
            tail
        } else {
            Vec::new()
        };
        #[cfg(not(feature = "gzip"))]
        let tail: Vec<u8> = Vec::new();
        if !tail.is_empty() {
            self.put(sink, &tail, "deflate trailer")?;
        }

        let Some(open) = self.open.take() else {
            return Err(Error::misuse("zip finish_entry with no open entry"));
        };
        let mut record = open.record;
        #[cfg(feature = "gzip")]
        {
            record.crc = open.crc.sum();
        }
        record.csize = open.csize;
        record.usize_ = open.usize_;
        if let OpenBody::Stored { buffer } = open.body {
            record.csize = record.usize_;
            record.offset = self.position;
            if record.usize_ > u64::from(u32::MAX) {
                return Err(Error::unsupported(
                    "zip64 write is not supported; entry exceeds 4 GiB",
                ));
            }
            let header = local_header(&record);
            self.put(sink, &header, "local file header")?;
            self.put(sink, &buffer, "entry payload")?;
        } else if record.csize > u64::from(u32::MAX) || record.usize_ > u64::from(u32::MAX) {
            return Err(Error::unsupported(
                "zip64 write is not supported; entry exceeds 4 GiB",
            ));
        }
        if record.flags & FLAG_DESCRIPTOR != 0 {
            let mut descriptor = Vec::with_capacity(16);
            descriptor.extend_from_slice(&SIG_DESCRIPTOR.to_le_bytes());
            descriptor.extend_from_slice(&record.crc.to_le_bytes());
            descriptor.extend_from_slice(&(record.csize as u32).to_le_bytes());
            descriptor.extend_from_slice(&(record.usize_ as u32).to_le_bytes());
            self.put(sink, &descriptor, "data descriptor")?;
        }
        self.records.push(record);
        Ok(())
    }

    fn finish(&mut self, sink: &mut dyn Write) -> Result<()> {
        let cd_offset = self.position;
        if cd_offset > u64::from(u32::MAX) {
            return Err(Error::unsupported(
                "zip64 write is not supported; archive exceeds 4 GiB",
            ));
        }
        let records = std::mem::take(&mut self.records);
        let mut directory = Vec::new();
        for record in &records {
            directory.extend_from_slice(&SIG_CENTRAL.to_le_bytes());
            directory.extend_from_slice(&(3u16 << 8 | 20).to_le_bytes()); // made by unix
            directory.extend_from_slice(&20u16.to_le_bytes()); // version needed
            directory.extend_from_slice(&record.flags.to_le_bytes());
            directory.extend_from_slice(&record.method.to_le_bytes());
            directory.extend_from_slice(&record.dos_time.to_le_bytes());
            directory.extend_from_slice(&record.dos_date.to_le_bytes());
            directory.extend_from_slice(&record.crc.to_le_bytes());
            directory.extend_from_slice(&(record.csize as u32).to_le_bytes());
            directory.extend_from_slice(&(record.usize_ as u32).to_le_bytes());
            directory.extend_from_slice(&(record.name.len() as u16).to_le_bytes());
            directory.extend_from_slice(&0u16.to_le_bytes()); // extra
            directory.extend_from_slice(&0u16.to_le_bytes()); // comment
            directory.extend_from_slice(&0u16.to_le_bytes()); // disk
            directory.extend_from_slice(&0u16.to_le_bytes()); // internal attrs
            directory.extend_from_slice(&record.external.to_le_bytes());
            directory.extend_from_slice(&(record.offset as u32).to_le_bytes());
            directory.extend_from_slice(&record.name);
        }
        self.put(sink, &directory, "central directory")?;

        let mut eocd = Vec::with_capacity(22);
        eocd.extend_from_slice(&SIG_EOCD.to_le_bytes());
        eocd.extend_from_slice(&0u16.to_le_bytes()); // this disk
        eocd.extend_from_slice(&0u16.to_le_bytes()); // cd disk
        eocd.extend_from_slice(&(records.len() as u16).to_le_bytes());
        eocd.extend_from_slice(&(records.len() as u16).to_le_bytes());
        eocd.extend_from_slice(&(directory.len() as u32).to_le_bytes());
        eocd.extend_from_slice(&(cd_offset as u32).to_le_bytes());
        eocd.extend_from_slice(&0u16.to_le_bytes()); // comment
        self.put(sink, &eocd, "end of central directory")
    }
}
