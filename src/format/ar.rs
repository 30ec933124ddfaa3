//! ar container: common, GNU, and BSD member naming on read; common
//! plus GNU long names on write.
//!
//! The archive opens with `!<arch>\n`; members carry 60-byte fixed
//! headers and are padded to even offsets with `\n`. GNU archives put
//! long names in a `//` table referenced as `/N`; BSD archives prepend
//! the name to the payload as `#1/N`. The `/` symbol table and the `//`
//! name table are consumed internally and never surfaced as entries.

use bstr::BString;

use crate::entry::{Entry, EntryKind, Timestamp};
use crate::error::Error;
use crate::format::{
    parse_decimal, parse_octal, peek_exact, read_exact_vec, skip_exact, FormatReader,
    FormatWriter, PayloadBlock,
};
use crate::io::lookahead::Lookahead;
use crate::Result;
use std::io::Write;

const GLOBAL_MAGIC: &[u8] = b"!<arch>\n";
const HEADER_LEN: usize = 60;
const NAME_TABLE_LIMIT: u64 = 1 << 20;

/// The full eight-byte global magic.
pub(crate) fn bid(stream: &mut Lookahead) -> Result<i32> {
    let head = stream.peek(GLOBAL_MAGIC.len())?;
    if head.len() >= GLOBAL_MAGIC.len() && &head[..GLOBAL_MAGIC.len()] == GLOBAL_MAGIC {
        return Ok(64);
    }
    Ok(0)
}

pub(crate) fn open() -> Box<dyn FormatReader> {
    Box::new(ArReader {
        started: false,
        name_table: Vec::new(),
        remaining: 0,
        padding: 0,
    })
}

pub(crate) struct ArReader {
    started: bool,
    /// GNU `//` long-name table, shared by all members.
    name_table: Vec<u8>,
    remaining: u64,
    padding: u64,
}

impl ArReader {
    /// Resolve a `/N` reference into the GNU name table. Entries are
    /// terminated by `/\n`.
    fn lookup_long_name(&self, offset: u64) -> Result<BString> {
        let start = usize::try_from(offset)
            .ok()
            .filter(|&at| at < self.name_table.len())
            .ok_or_else(|| {
                Error::corrupt(format!("ar: long-name offset {offset} outside the // table"))
            })?;
        let rest = &self.name_table[start..];
        let end = rest
            .iter()
            .position(|&b| b == b'\n')
            .unwrap_or(rest.len());
        let mut name = &rest[..end];
        if name.last() == Some(&b'/') {
            name = &name[..name.len() - 1];
        }
        Ok(BString::from(name))
    }
}

impl FormatReader for ArReader {
    fn next_entry(&mut self, stream: &mut Lookahead) -> Result<Option<Entry>> {
        if !self.started {
            let magic = peek_exact(stream, GLOBAL_MAGIC.len(), "ar global header")?;
            if magic != GLOBAL_MAGIC {
                return Err(Error::corrupt("ar: missing !<arch> global header"));
            }
            stream.consume(GLOBAL_MAGIC.len());
            self.started = true;
        }
        loop {
            let offset = stream.stream_offset();
            let head = stream.peek(HEADER_LEN)?;
            if head.is_empty() {
                return Ok(None);
            }
            if head.len() < HEADER_LEN {
                return Err(Error::short_read(format!(
                    "ar member header truncated at offset {offset}"
                )));
            }
            let head: [u8; HEADER_LEN] = head[..HEADER_LEN].try_into().unwrap();
            if &head[58..60] != b"`\n" {
                return Err(Error::corrupt(format!(
                    "ar member header at offset {offset} lacks the `\\n terminator"
                )));
            }
            stream.consume(HEADER_LEN);

            let name_field = &head[..16];
            let mtime = parse_decimal(&head[16..28], "ar mtime")?;
            let uid = parse_decimal(&head[28..34], "ar uid").unwrap_or(0);
            let gid = parse_decimal(&head[34..40], "ar gid").unwrap_or(0);
            let mode = parse_octal(&head[40..48], "ar mode")?;
            let size = parse_decimal(&head[48..58], "ar size")?;
            let padding = size % 2;

            let trimmed = super::trim_field(name_field);
            // Special members: `/` symbol table, `//` long-name table.
            if trimmed == b"/" {
                skip_exact(stream, size + padding, "ar symbol table")?;
                continue;
            }
            if trimmed == b"//" {
                if size > NAME_TABLE_LIMIT {
                    return Err(Error::corrupt(format!(
                        "ar: {size} byte long-name table exceeds the {NAME_TABLE_LIMIT} byte cap"
                    )));
                }
                self.name_table = read_exact_vec(stream, size as usize, "ar long-name table")?;
                skip_exact(stream, padding, "ar table padding")?;
                continue;
            }

            let (name, payload_size) = if let Some(digits) = trimmed.strip_prefix(b"/") {
                let at = parse_decimal(digits, "ar long-name offset")?;
                (self.lookup_long_name(at)?, size)
            } else if let Some(digits) = trimmed.strip_prefix(b"#1/") {
                // BSD: the first N payload bytes are the name; padding
                // still covers the full stored size.
                let name_len = parse_decimal(digits, "ar inline name length")?;
                if name_len > size {
                    return Err(Error::corrupt(
                        "ar: inline name longer than the member itself",
                    ));
                }
                let raw = read_exact_vec(stream, name_len as usize, "ar inline name")?;
                let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
                (BString::from(&raw[..end]), size - name_len)
            } else {
                let mut name = trimmed;
                // GNU terminates inline names with `/`.
                if name.last() == Some(&b'/') {
                    name = &name[..name.len() - 1];
                }
                (BString::from(name), size)
            };
            self.remaining = payload_size;
            self.padding = padding;

            let entry = Entry::file(name, payload_size)
                .with_mode(mode as u32)
                .with_owner(uid, gid)
                .with_mtime(Timestamp::from_secs(mtime as i64));
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
                "ar member payload truncated with {} bytes undelivered",
                self.remaining
            )));
        }
        self.remaining -= got as u64;
        Ok(PayloadBlock::Data(got))
    }

    fn finish_entry(&mut self, stream: &mut Lookahead) -> Result<()> {
        let padding = std::mem::take(&mut self.padding);
        skip_exact(stream, padding, "ar member padding")
    }
}

pub(crate) struct ArWriter {
    started: bool,
    /// Offsets into the emitted `//` table, or `None` before any long
    /// name forced one out.
    name_table: Option<Vec<u8>>,
}

impl ArWriter {
    pub(crate) fn new() -> Self {
        Self {
            started: false,
            name_table: None,
        }
    }
}

impl FormatWriter for ArWriter {
    fn write_header(&mut self, sink: &mut dyn Write, entry: &Entry) -> Result<()> {
        if entry.kind() != EntryKind::Regular {
            return Err(Error::unsupported(format!(
                "ar archives hold regular files only, not {} entries",
                entry.kind()
            )));
        }
        let size = entry.size().ok_or_else(|| {
            Error::misuse("ar entries need a declared size before payload writes")
        })?;
        if !self.started {
            sink.write_all(GLOBAL_MAGIC)
                .map_err(|err| Error::io(err, "ar: writing global header"))?;
            self.started = true;
        }

        let name = entry.path();
        let name_field: Vec<u8> = if name.len() <= 15 {
            let mut field = name.to_vec();
            field.push(b'/');
            field
        } else {
            // One `//` table per archive, emitted just before the first
            // member that needs it; later long names cannot be added.
            if self.name_table.is_some() {
                return Err(Error::unsupported(
                    "ar long-name table already flushed; reorder long-named members first",
                ));
            }
            let mut table = name.to_vec();
            table.extend_from_slice(b"/\n");
            if table.len() % 2 != 0 {
                table.push(b'\n');
            }
            let mut header = member_header(b"//", 0, 0, 0, 0, table.len() as u64);
            header.extend_from_slice(&table);
            sink.write_all(&header)
                .map_err(|err| Error::io(err, "ar: writing long-name table"))?;
            self.name_table = Some(table);
            b"/0".to_vec()
        };

        let mtime = entry.mtime().map_or(0, |ts| ts.secs.max(0) as u64);
        let header = member_header(
            &name_field,
            mtime,
            entry.uid(),
            entry.gid(),
            u64::from(entry.mode()),
            size,
        );
        sink.write_all(&header)
            .map_err(|err| Error::io(err, "ar: writing member header"))
    }

    fn write_data(&mut self, sink: &mut dyn Write, buf: &[u8]) -> Result<()> {
        sink.write_all(buf)
            .map_err(|err| Error::io(err, "ar: writing member payload"))
    }

    fn finish_entry(&mut self, sink: &mut dyn Write, written: u64) -> Result<()> {
        if written % 2 != 0 {
            sink.write_all(b"\n")
                .map_err(|err| Error::io(err, "ar: writing member padding"))?;
        }
        Ok(())
    }

    fn finish(&mut self, sink: &mut dyn Write) -> Result<()> {
        if !self.started {
            // An empty archive is just the global header.
            sink.write_all(GLOBAL_MAGIC)
                .map_err(|err| Error::io(err, "ar: writing global header"))?;
            self.started = true;
        }
        Ok(())
    }
}

fn member_header(name: &[u8], mtime: u64, uid: u64, gid: u64, mode: u64, size: u64) -> Vec<u8> {
    let mut header = Vec::with_capacity(HEADER_LEN);
    push_field(&mut header, name, 16);
    push_field(&mut header, mtime.to_string().as_bytes(), 12);
    push_field(&mut header, uid.to_string().as_bytes(), 6);
    push_field(&mut header, gid.to_string().as_bytes(), 6);
    push_field(&mut header, format!("{mode:o}").as_bytes(), 8);
    push_field(&mut header, size.to_string().as_bytes(), 10);
    header.extend_from_slice(b"`\n");
    header
}

fn push_field(out: &mut Vec<u8>, value: &[u8], width: usize) {
    let len = value.len().min(width);
    out.extend_from_slice(&value[..len]);
    out.extend(std::iter::repeat(b' ').take(width - len));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::ReaderSource;
    use std::io::Cursor;

    fn lookahead(bytes: Vec<u8>) -> Lookahead {
        Lookahead::from_source(ReaderSource::new(Cursor::new(bytes)), "test")
    }

    fn read_all(bytes: Vec<u8>) -> Vec<(Entry, Vec<u8>)> {
        let mut stream = lookahead(bytes);
        assert!(bid(&mut stream).unwrap() > 0);
        let mut reader = open();
        let mut decoded = Vec::new();
        while let Some(entry) = reader.next_entry(&mut stream).unwrap() {
            let mut payload = Vec::new();
            let mut buf = [0u8; 32];
            loop {
                match reader.next_block(&mut stream, &mut buf).unwrap() {
                    PayloadBlock::Data(n) => payload.extend_from_slice(&buf[..n]),
                    PayloadBlock::Hole(_) => unreachable!("ar has no holes"),
                    PayloadBlock::End => break,
                }
            }
            reader.finish_entry(&mut stream).unwrap();
            decoded.push((entry, payload));
        }
        decoded
    }

    #[test]
    fn short_names_round_trip_with_odd_padding() {
        let mut bytes = Vec::new();
        let mut writer = ArWriter::new();
        for (name, payload) in [("hello.o", &b"abc"[..]), ("world.o", &b"defg"[..])] {
            let entry = Entry::file(name, payload.len() as u64)
                .with_mode(0o644)
                .with_mtime(Timestamp::from_secs(1_400_000_000));
            writer.write_header(&mut bytes, &entry).unwrap();
            writer.write_data(&mut bytes, payload).unwrap();
            writer.finish_entry(&mut bytes, payload.len() as u64).unwrap();
        }
        writer.finish(&mut bytes).unwrap();

        let decoded = read_all(bytes);
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].0.path(), &BString::from("hello.o"));
        assert_eq!(decoded[0].1, b"abc");
        assert_eq!(decoded[1].1, b"defg");
    }

    #[test]
    fn gnu_long_names_go_through_the_table() {
        let long = "a_rather_long_member_name.obj";
        let mut bytes = Vec::new();
        let mut writer = ArWriter::new();
        let entry = Entry::file(long, 2);
        writer.write_header(&mut bytes, &entry).unwrap();
        writer.write_data(&mut bytes, b"xy").unwrap();
        writer.finish_entry(&mut bytes, 2).unwrap();
        writer.finish(&mut bytes).unwrap();

        let decoded = read_all(bytes);
        assert_eq!(decoded[0].0.path(), &BString::from(long));
        assert_eq!(decoded[0].1, b"xy");

        // A second long name after the table has been flushed fails.
        let mut writer = ArWriter::new();
        let mut bytes = Vec::new();
        writer
            .write_header(&mut bytes, &Entry::file(long, 0))
            .unwrap();
        writer.finish_entry(&mut bytes, 0).unwrap();
        let err = writer
            .write_header(&mut bytes, &Entry::file("another_long_member_name.obj", 0))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::UnsupportedEntryKind);
    }

    #[test]
    fn bsd_inline_names_are_recognized() {
        let mut bytes = GLOBAL_MAGIC.to_vec();
        let name = b"embedded_name.o";
        let payload = b"zz";
        let stored = name.len() + payload.len();
        let mut header = member_header(
            format!("#1/{}", name.len()).as_bytes(),
            0,
            0,
            0,
            0o644,
            stored as u64,
        );
        header.extend_from_slice(name);
        header.extend_from_slice(payload);
        if stored % 2 != 0 {
            header.push(b'\n');
        }
        bytes.extend_from_slice(&header);

        let decoded = read_all(bytes);
        assert_eq!(decoded[0].0.path(), &BString::from(&name[..]));
        assert_eq!(decoded[0].0.size(), Some(2));
        assert_eq!(decoded[0].1, payload);
    }

    #[test]
    fn directories_are_rejected_on_write() {
        let mut writer = ArWriter::new();
        let err = writer
            .write_header(&mut Vec::new(), &Entry::directory("dir"))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::UnsupportedEntryKind);
    }
}
