//! cpio container: newc (`070701`), crc (`070702`), and odc (`070707`)
//! read; newc and odc write.
//!
//! newc headers are 110 bytes of ASCII hex; odc headers are 76 bytes of
//! ASCII octal. The `TRAILER!!!` member ends the archive. newc aligns
//! names and payloads to 4 bytes; odc has no alignment. Hardlinks are
//! resolved through a (dev, ino) map: the second and later occurrences
//! of an inode with nlink > 1 surface as hardlink entries targeting the
//! first path seen.

use std::collections::HashMap;
use std::io::Write;

use bstr::BString;
use bytes::Bytes;

use crate::entry::{Entry, EntryKind, Timestamp};
use crate::error::Error;
use crate::format::{
    parse_hex, parse_octal, peek_exact, read_exact_vec, skip_exact, FormatReader, FormatWriter,
    PayloadBlock,
};
use crate::io::lookahead::Lookahead;
use crate::sidecar::{SidecarKey, SidecarNamespace};
use crate::Result;

const NEWC_MAGIC: &[u8] = b"070701";
const CRC_MAGIC: &[u8] = b"070702";
const ODC_MAGIC: &[u8] = b"070707";
const NEWC_HEADER: usize = 110;
const ODC_HEADER: usize = 76;
const TRAILER: &[u8] = b"TRAILER!!!";

/// Six verified magic bytes.
pub(crate) fn bid(stream: &mut Lookahead) -> Result<i32> {
    let head = stream.peek(6)?;
    if head.len() < 6 {
        return Ok(0);
    }
    if &head[..6] == NEWC_MAGIC || &head[..6] == CRC_MAGIC || &head[..6] == ODC_MAGIC {
        return Ok(48);
    }
    Ok(0)
}

pub(crate) fn open() -> Box<dyn FormatReader> {
    Box::new(CpioReader {
        remaining: 0,
        padding: 0,
        expected_check: None,
        running_check: 0,
        seen: HashMap::new(),
        done: false,
    })
}

struct RawHeader {
    ino: u64,
    mode: u64,
    uid: u64,
    gid: u64,
    nlink: u64,
    mtime: u64,
    filesize: u64,
    dev: u64,
    rdev_major: u64,
    rdev_minor: u64,
    namesize: u64,
    check: Option<u64>,
    newc: bool,
}

pub(crate) struct CpioReader {
    remaining: u64,
    padding: u64,
    /// crc-variant additive checksum carried to payload completion.
    expected_check: Option<u64>,
    running_check: u64,
    /// (dev, ino) of payload-bearing members already seen, mapped to the
    /// first path.
    seen: HashMap<(u64, u64), BString>,
    done: bool,
}

impl CpioReader {
    fn parse_newc(&self, stream: &mut Lookahead, crc: bool) -> Result<(RawHeader, BString)> {
        let head = peek_exact(stream, NEWC_HEADER, "cpio newc header")?;
        let field = |index: usize| -> &[u8] { &head[6 + index * 8..6 + (index + 1) * 8] };
        let header = RawHeader {
            ino: parse_hex(field(0), "cpio ino")?,
            mode: parse_hex(field(1), "cpio mode")?,
            uid: parse_hex(field(2), "cpio uid")?,
            gid: parse_hex(field(3), "cpio gid")?,
            nlink: parse_hex(field(4), "cpio nlink")?,
            mtime: parse_hex(field(5), "cpio mtime")?,
            filesize: parse_hex(field(6), "cpio filesize")?,
            dev: parse_hex(field(7), "cpio devmajor")? << 32
                | parse_hex(field(8), "cpio devminor")?,
            rdev_major: parse_hex(field(9), "cpio rdevmajor")?,
            rdev_minor: parse_hex(field(10), "cpio rdevminor")?,
            namesize: parse_hex(field(11), "cpio namesize")?,
            check: if crc {
                Some(parse_hex(field(12), "cpio check")?)
            } else {
                None
            },
            newc: true,
        };
        stream.consume(NEWC_HEADER);
        let name = self.read_name(stream, &header, NEWC_HEADER as u64)?;
        Ok((header, name))
    }

    fn parse_odc(&self, stream: &mut Lookahead) -> Result<(RawHeader, BString)> {
        let head = peek_exact(stream, ODC_HEADER, "cpio odc header")?;
        let header = RawHeader {
            dev: parse_octal(&head[6..12], "cpio dev")?,
            ino: parse_octal(&head[12..18], "cpio ino")?,
            mode: parse_octal(&head[18..24], "cpio mode")?,
            uid: parse_octal(&head[24..30], "cpio uid")?,
            gid: parse_octal(&head[30..36], "cpio gid")?,
            nlink: parse_octal(&head[36..42], "cpio nlink")?,
            rdev_major: parse_octal(&head[42..48], "cpio rdev")? >> 8,
            rdev_minor: parse_octal(&head[42..48], "cpio rdev")? & 0xff,
            mtime: parse_octal(&head[48..59], "cpio mtime")?,
            namesize: parse_octal(&head[59..65], "cpio namesize")?,
            filesize: parse_octal(&head[65..76], "cpio filesize")?,
            check: None,
            newc: false,
        };
        stream.consume(ODC_HEADER);
        let name = self.read_name(stream, &header, ODC_HEADER as u64)?;
        Ok((header, name))
    }

    /// Read the NUL-terminated name and, for newc, the padding that
    /// aligns header + name to 4 bytes.
    fn read_name(
        &self,
        stream: &mut Lookahead,
        header: &RawHeader,
        header_len: u64,
    ) -> Result<BString> {
        if header.namesize == 0 || header.namesize > 1 << 16 {
            return Err(Error::corrupt(format!(
                "cpio header: implausible name size {}",
                header.namesize
            )));
        }
        let raw = read_exact_vec(stream, header.namesize as usize, "cpio member name")?;
        if raw.last() != Some(&0) {
            return Err(Error::corrupt("cpio member name is not NUL-terminated"));
        }
        if header.newc {
            let consumed = header_len + header.namesize;
            skip_exact(stream, align4(consumed) - consumed, "cpio name padding")?;
        }
        Ok(BString::from(&raw[..raw.len() - 1]))
    }
}

fn align4(n: u64) -> u64 {
    (n + 3) & !3
}

impl FormatReader for CpioReader {
    fn next_entry(&mut self, stream: &mut Lookahead) -> Result<Option<Entry>> {
        if self.done {
            return Ok(None);
        }
        {
            let offset = stream.stream_offset();
            let magic = peek_exact(stream, 6, "cpio magic")?.to_vec();
            let (header, name) = match &magic[..] {
                m if m == NEWC_MAGIC => self.parse_newc(stream, false)?,
                m if m == CRC_MAGIC => self.parse_newc(stream, true)?,
                m if m == ODC_MAGIC => self.parse_odc(stream)?,
                _ => {
                    return Err(Error::corrupt(format!(
                        "cpio header: bad magic at offset {offset}"
                    )))
                }
            };
            if name == TRAILER {
                // Drain trailer payload padding and whatever block
                // padding the producer appended.
                stream.skip(u64::MAX)?;
                self.done = true;
                return Ok(None);
            }

            let kind = EntryKind::from_unix_file_type(header.mode as u32);
            let mut entry = Entry::new(name.clone(), kind)
                .with_mode(header.mode as u32)
                .with_owner(header.uid, header.gid)
                .with_mtime(Timestamp::from_secs(header.mtime as i64))
                .with_sidecar(
                    SidecarKey::new(SidecarNamespace::Format, "cpio.ino"),
                    Bytes::from(header.ino.to_string()),
                )
                .with_sidecar(
                    SidecarKey::new(SidecarNamespace::Format, "cpio.nlink"),
                    Bytes::from(header.nlink.to_string()),
                );
            if matches!(kind, EntryKind::CharDevice | EntryKind::BlockDevice) {
                entry = entry.with_rdev(header.rdev_major as u32, header.rdev_minor as u32);
            }

            self.remaining = header.filesize;
            self.padding = if header.newc {
                align4(header.filesize) - header.filesize
            } else {
                0
            };
            self.expected_check = header.check;
            self.running_check = 0;

            match kind {
                EntryKind::Symlink => {
                    // The payload is the link target, not entry data.
                    let target =
                        read_exact_vec(stream, header.filesize as usize, "cpio symlink target")?;
                    skip_exact(stream, self.padding, "cpio payload padding")?;
                    self.remaining = 0;
                    self.padding = 0;
                    entry.set_link_target(BString::from(target));
                    entry.set_size(None);
                }
                EntryKind::Regular => {
                    let link_key = (header.dev, header.ino);
                    match self.seen.get(&link_key) {
                        Some(first) if header.nlink > 1 => {
                            entry.set_kind(EntryKind::Hardlink);
                            entry.set_link_target(first.clone());
                        }
                        _ => {
                            self.seen.insert(link_key, name);
                        }
                    }
                    entry.set_size(Some(header.filesize));
                }
                _ => {
                    entry.set_size(None);
                    if header.filesize != 0 {
                        return Err(Error::corrupt(format!(
                            "cpio {} entry claims a {} byte payload",
                            kind, header.filesize
                        )));
                    }
                }
            }
            return Ok(Some(entry));
        }
    }

    fn next_block(&mut self, stream: &mut Lookahead, out: &mut [u8]) -> Result<PayloadBlock> {
        if self.remaining == 0 {
            return Ok(PayloadBlock::End);
        }
        let want = usize::try_from(self.remaining.min(out.len() as u64)).unwrap_or(out.len());
        let got = stream.read_into(&mut out[..want])?;
        if got == 0 {
            return Err(Error::short_read(format!(
                "cpio payload truncated with {} bytes undelivered at offset {}",
                self.remaining,
                stream.stream_offset()
            )));
        }
        self.remaining -= got as u64;
        if self.expected_check.is_some() {
            for &byte in &out[..got] {
                self.running_check = (self.running_check + u64::from(byte)) & 0xffff_ffff;
            }
        }
        Ok(PayloadBlock::Data(got))
    }

    fn finish_entry(&mut self, stream: &mut Lookahead) -> Result<()> {
        if let Some(expected) = self.expected_check.take() {
            if expected != self.running_check {
                return Err(Error::corrupt(format!(
                    "cpio crc member checksum mismatch: header {expected:#010x}, payload {:#010x}",
                    self.running_check
                )));
            }
        }
        let padding = std::mem::take(&mut self.padding);
        skip_exact(stream, padding, "cpio payload padding")
    }
}

/// Which cpio dialect the writer emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CpioVariant {
    /// SVR4 newc, 4-byte aligned hex headers.
    #[default]
    Newc,
    /// Portable odc octal headers.
    Odc,
}

pub(crate) struct CpioWriter {
    variant: CpioVariant,
    next_ino: u64,
    /// Inode assigned to each written path, so hardlink members can
    /// share their target's inode.
    inos: HashMap<BString, u64>,
    /// Pending symlink target to emit as the entry payload.
    pending_target: Option<BString>,
}

impl CpioWriter {
    pub(crate) fn new(variant: CpioVariant) -> Self {
        Self {
            variant,
            next_ino: 1,
            inos: HashMap::new(),
            pending_target: None,
        }
    }

    fn emit_header(
        &mut self,
        sink: &mut dyn Write,
        name: &[u8],
        ino: u64,
        mode: u64,
        uid: u64,
        gid: u64,
        nlink: u64,
        mtime: u64,
        filesize: u64,
        rdev: (u32, u32),
    ) -> Result<()> {
        let mut header = Vec::with_capacity(NEWC_HEADER + name.len() + 4);
        match self.variant {
            CpioVariant::Newc => {
                header.extend_from_slice(NEWC_MAGIC);
                for value in [
                    ino,
                    mode,
                    uid,
                    gid,
                    nlink,
                    mtime & 0xffff_ffff,
                    filesize,
                    0, // devmajor
                    0, // devminor
                    u64::from(rdev.0),
                    u64::from(rdev.1),
                    name.len() as u64 + 1,
                    0, // check (newc stores zero)
                ] {
                    header.extend_from_slice(format!("{value:08X}").as_bytes());
                }
                header.extend_from_slice(name);
                header.push(0);
                let pad = align4(header.len() as u64) - header.len() as u64;
                header.extend(std::iter::repeat(0).take(pad as usize));
            }
            CpioVariant::Odc => {
                header.extend_from_slice(ODC_MAGIC);
                for (value, width) in [
                    (0u64, 6),                          // dev
                    (ino & 0o777_777, 6),
                    (mode & 0o777_777, 6),
                    (uid & 0o777_777, 6),
                    (gid & 0o777_777, 6),
                    (nlink & 0o777_777, 6),
                    (u64::from(rdev.0) << 8 | u64::from(rdev.1 & 0xff), 6),
                    (mtime & 0o77_777_777_777, 11),
                    (name.len() as u64 + 1, 6),
                    (filesize, 11),
                ] {
                    header.extend_from_slice(format!("{value:0width$o}", width = width).as_bytes());
                }
                header.extend_from_slice(name);
                header.push(0);
            }
        }
        sink.write_all(&header)
            .map_err(|err| Error::io(err, "cpio: writing member header"))
    }
}

impl FormatWriter for CpioWriter {
    fn write_header(&mut self, sink: &mut dyn Write, entry: &Entry) -> Result<()> {
        let (filesize, nlink) = match entry.kind() {
            EntryKind::Regular => (
                entry.size().ok_or_else(|| {
                    Error::misuse("cpio entries need a declared size before payload writes")
                })?,
                1,
            ),
            EntryKind::Symlink => {
                let target = entry
                    .link_target()
                    .ok_or_else(|| Error::misuse("symlink entry without a target"))?;
                self.pending_target = Some(target.clone());
                (target.len() as u64, 1)
            }
            EntryKind::Hardlink => (0, 2),
            EntryKind::Directory => (0, 2),
            _ => (0, 1),
        };
        if self.variant == CpioVariant::Odc && filesize > 0o77_777_777_777 {
            return Err(Error::unsupported(format!(
                "odc cpio size field cannot hold {filesize} bytes"
            )));
        }
        // Hardlinks share their target's inode so readers can pair them
        // back up; everything else gets a fresh one.
        let ino = match entry.kind() {
            EntryKind::Hardlink => entry
                .link_target()
                .and_then(|target| self.inos.get(target).copied())
                .ok_or_else(|| Error::misuse("hardlink target was not written earlier"))?,
            _ => {
                let ino = self.next_ino;
                self.next_ino += 1;
                if entry.kind() == EntryKind::Regular {
                    self.inos.insert(entry.path().clone(), ino);
                }
                ino
            }
        };
        let mtime = entry.mtime().map_or(0, |ts| ts.secs.max(0) as u64);
        self.emit_header(
            sink,
            entry.path(),
            ino,
            u64::from(entry.unix_mode()),
            entry.uid(),
            entry.gid(),
            nlink,
            mtime,
            filesize,
            entry.rdev().unwrap_or((0, 0)),
        )?;
        if let Some(target) = self.pending_target.take() {
            sink.write_all(&target)
                .map_err(|err| Error::io(err, "cpio: writing symlink target"))?;
            if self.variant == CpioVariant::Newc {
                let pad = align4(target.len() as u64) - target.len() as u64;
                sink.write_all(&vec![0u8; pad as usize])
                    .map_err(|err| Error::io(err, "cpio: writing target padding"))?;
            }
        }
        Ok(())
    }

    fn write_data(&mut self, sink: &mut dyn Write, buf: &[u8]) -> Result<()> {
        sink.write_all(buf)
            .map_err(|err| Error::io(err, "cpio: writing member payload"))
    }

    fn finish_entry(&mut self, sink: &mut dyn Write, written: u64) -> Result<()> {
        if self.variant == CpioVariant::Newc {
            let pad = align4(written) - written;
            sink.write_all(&vec![0u8; pad as usize])
                .map_err(|err| Error::io(err, "cpio: writing payload padding"))?;
        }
        Ok(())
    }

    fn finish(&mut self, sink: &mut dyn Write) -> Result<()> {
        // nlink 1, everything else zero, per the SVR4 trailer convention.
        self.emit_header(sink, TRAILER, 0, 0, 0, 0, 1, 0, 0, (0, 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::ReaderSource;
    use std::io::Cursor;

    fn lookahead(bytes: Vec<u8>) -> Lookahead {
        Lookahead::from_source(ReaderSource::new(Cursor::new(bytes)), "test")
    }

    fn roundtrip(variant: CpioVariant, entries: &[(Entry, &[u8])]) -> Vec<(Entry, Vec<u8>)> {
        let mut bytes = Vec::new();
        let mut writer = CpioWriter::new(variant);
        for (entry, payload) in entries {
            writer.write_header(&mut bytes, entry).unwrap();
            writer.write_data(&mut bytes, payload).unwrap();
            writer.finish_entry(&mut bytes, payload.len() as u64).unwrap();
        }
        writer.finish(&mut bytes).unwrap();

        let mut stream = lookahead(bytes);
        assert!(bid(&mut stream).unwrap() > 0);
        let mut reader = open();
        let mut decoded = Vec::new();
        while let Some(entry) = reader.next_entry(&mut stream).unwrap() {
            let mut payload = Vec::new();
            let mut buf = [0u8; 64];
            loop {
                match reader.next_block(&mut stream, &mut buf).unwrap() {
                    PayloadBlock::Data(n) => payload.extend_from_slice(&buf[..n]),
                    PayloadBlock::Hole(_) => unreachable!("cpio has no holes"),
                    PayloadBlock::End => break,
                }
            }
            reader.finish_entry(&mut stream).unwrap();
            decoded.push((entry, payload));
        }
        decoded
    }

    #[test]
    fn newc_round_trips_files_and_dirs() {
        let entries = [
            (
                Entry::file("a.txt", 12).with_mtime(Timestamp::from_secs(1_500_000_000)),
                &b"twelve bytes"[..],
            ),
            (Entry::directory("dir"), &b""[..]),
            (Entry::file("dir/b.txt", 0), &b""[..]),
        ];
        let decoded = roundtrip(CpioVariant::Newc, &entries);
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[0].0.path(), &BString::from("a.txt"));
        assert_eq!(decoded[0].1, b"twelve bytes");
        assert_eq!(decoded[1].0.kind(), EntryKind::Directory);
        assert!(decoded[1].1.is_empty());
        assert_eq!(decoded[2].0.size(), Some(0));
    }

    #[test]
    fn odc_round_trips() {
        let entries = [(
            Entry::file("f", 5).with_owner(12, 34),
            &b"hello"[..],
        )];
        let decoded = roundtrip(CpioVariant::Odc, &entries);
        assert_eq!(decoded[0].0.uid(), 12);
        assert_eq!(decoded[0].0.gid(), 34);
        assert_eq!(decoded[0].1, b"hello");
    }

    #[test]
    fn symlink_target_rides_in_the_payload() {
        let entries = [(Entry::symlink("ln", "a.txt"), &b""[..])];
        let decoded = roundtrip(CpioVariant::Newc, &entries);
        assert_eq!(decoded[0].0.kind(), EntryKind::Symlink);
        assert_eq!(decoded[0].0.link_target().unwrap(), &BString::from("a.txt"));
        assert!(decoded[0].1.is_empty(), "targets are not entry payload");
    }

    #[test]
    fn crc_variant_verifies_payload_checksum() {
        // Build a crc-variant member by hand: payload "ab" sums to 195.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(CRC_MAGIC);
        for value in [1u64, 0o100644, 0, 0, 1, 0, 2, 0, 0, 0, 0, 2, 195] {
            bytes.extend_from_slice(format!("{value:08X}").as_bytes());
        }
        bytes.extend_from_slice(b"f\0");
        bytes.extend_from_slice(&[0u8; 2]); // name padding to 4
        bytes.extend_from_slice(b"ab");
        bytes.extend_from_slice(&[0u8; 2]); // payload padding
        let mut writer = CpioWriter::new(CpioVariant::Newc);
        writer.finish(&mut bytes).unwrap();

        let mut stream = lookahead(bytes.clone());
        let mut reader = open();
        reader.next_entry(&mut stream).unwrap().unwrap();
        let mut buf = [0u8; 8];
        while !matches!(
            reader.next_block(&mut stream, &mut buf).unwrap(),
            PayloadBlock::End
        ) {}
        reader.finish_entry(&mut stream).unwrap();

        // Corrupt one payload byte; the stored check no longer matches.
        let payload_at = bytes.windows(2).position(|w| w == b"ab").unwrap();
        bytes[payload_at] = b'x';
        let mut stream = lookahead(bytes);
        let mut reader = open();
        reader.next_entry(&mut stream).unwrap().unwrap();
        while !matches!(
            reader.next_block(&mut stream, &mut buf).unwrap(),
            PayloadBlock::End
        ) {}
        let err = reader.finish_entry(&mut stream).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::CorruptHeader);
    }

    #[test]
    fn hardlink_pairs_resolve_on_second_occurrence() {
        let mut bytes = Vec::new();
        let mut writer = CpioWriter::new(CpioVariant::Newc);
        // Same (dev, ino) pair twice with nlink 2, built by hand since
        // the writer allocates fresh inodes.
        for name in [&b"first"[..], &b"second"[..]] {
            bytes.extend_from_slice(NEWC_MAGIC);
            for value in [7u64, 0o100644, 0, 0, 2, 0, 0, 0, 0, 0, 0, name.len() as u64 + 1, 0] {
                bytes.extend_from_slice(format!("{value:08X}").as_bytes());
            }
            bytes.extend_from_slice(name);
            bytes.push(0);
            while bytes.len() % 4 != 0 {
                bytes.push(0);
            }
        }
        writer.finish(&mut bytes).unwrap();

        let mut stream = lookahead(bytes);
        let mut reader = open();
        let first = reader.next_entry(&mut stream).unwrap().unwrap();
        assert_eq!(first.kind(), EntryKind::Regular);
        reader.finish_entry(&mut stream).unwrap();
        let second = reader.next_entry(&mut stream).unwrap().unwrap();
        assert_eq!(second.kind(), EntryKind::Hardlink);
        assert_eq!(second.link_target().unwrap(), &BString::from("first"));
    }

    #[test]
    fn bad_magic_is_corrupt() {
        let mut stream = lookahead(b"071234rest-of-nothing".to_vec());
        let mut reader = open();
        let err = reader.next_entry(&mut stream).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::CorruptHeader);
    }
}
