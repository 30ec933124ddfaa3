//! WARC web-archive records, mapped onto the entry model.
//!
//! Only `resource` records surface as entries; `warcinfo`, `metadata`,
//! and the request/response kinds are skipped transparently. The path
//! comes from `WARC-Target-URI` with any `file://` scheme stripped,
//! the modification time from `WARC-Date`. The writer leads with one
//! deterministic `warcinfo` record, then one `resource` record per
//! regular file.

use bstr::BString;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::entry::{Entry, EntryKind, Timestamp};
use crate::error::Error;
use crate::format::{parse_decimal, peek_exact, skip_exact, FormatReader, FormatWriter, PayloadBlock};
use crate::io::lookahead::Lookahead;
use crate::sidecar::{SidecarKey, SidecarNamespace};
use crate::Result;
use std::io::Write;

const VERSION_PREFIX: &[u8] = b"WARC/";
const HEADER_LIMIT: usize = 64 * 1024;
const RECORD_SEPARATOR: &[u8] = b"\r\n\r\n";

/// `WARC/` plus a digit-led version string.
pub(crate) fn bid(stream: &mut Lookahead) -> Result<i32> {
    let head = stream.peek(8)?;
    if head.len() >= 8
        && &head[..VERSION_PREFIX.len()] == VERSION_PREFIX
        && head[VERSION_PREFIX.len()].is_ascii_digit()
    {
        return Ok(40);
    }
    Ok(0)
}

pub(crate) fn open() -> Box<dyn FormatReader> {
    Box::new(WarcReader { remaining: 0 })
}

pub(crate) struct WarcReader {
    remaining: u64,
}

impl FormatReader for WarcReader {
    fn next_entry(&mut self, stream: &mut Lookahead) -> Result<Option<Entry>> {
        loop {
            if stream.peek(1)?.is_empty() {
                return Ok(None);
            }
            let offset = stream.stream_offset();
            let header = read_header_block(stream)?;
            let mut record_type = None;
            let mut target_uri = None;
            let mut date = None;
            let mut content_length = None;
            let mut sidecars = Vec::new();
            for line in header.split(|&b| b == b'\n') {
                let line = line.strip_suffix(b"\r").unwrap_or(line);
                if line.is_empty() || line.starts_with(VERSION_PREFIX) {
                    continue;
                }
                let at = line.iter().position(|&b| b == b':').ok_or_else(|| {
                    Error::corrupt(format!("warc: malformed header line in record at {offset}"))
                })?;
                let name = &line[..at];
                let value = trim_ascii(&line[at + 1..]);
                if eq_ignore_case(name, b"WARC-Type") {
                    record_type = Some(value.to_vec());
                } else if eq_ignore_case(name, b"WARC-Target-URI") {
                    target_uri = Some(value.to_vec());
                } else if eq_ignore_case(name, b"WARC-Date") {
                    date = Some(value.to_vec());
                } else if eq_ignore_case(name, b"Content-Length") {
                    content_length = Some(parse_decimal(value, "warc content length")?);
                } else if eq_ignore_case(name, b"Content-Type")
                    || eq_ignore_case(name, b"WARC-Record-ID")
                {
                    let mut key = b"warc.".to_vec();
                    key.extend(name.iter().map(u8::to_ascii_lowercase));
                    sidecars.push((key, value.to_vec()));
                }
            }
            let length = content_length.ok_or_else(|| {
                Error::corrupt(format!("warc: record at {offset} lacks Content-Length"))
            })?;

            if record_type.as_deref() != Some(b"resource") {
                skip_exact(stream, length, "warc record body")?;
                let sep = peek_exact(stream, RECORD_SEPARATOR.len(), "warc record separator")?;
                if &sep[..RECORD_SEPARATOR.len()] != RECORD_SEPARATOR {
                    return Err(Error::corrupt(format!(
                        "warc: record at {offset} not followed by a blank-line separator"
                    )));
                }
                stream.consume(RECORD_SEPARATOR.len());
                continue;
            }

            let uri = target_uri.ok_or_else(|| {
                Error::corrupt(format!("warc: resource record at {offset} lacks a target URI"))
            })?;
            let path = uri.strip_prefix(b"file://").unwrap_or(&uri).to_vec();
            self.remaining = length;

            let mut entry = Entry::file(BString::from(path), length);
            if let Some(date) = date {
                entry = entry.with_mtime(parse_warc_date(&date)?);
            }
            for (key, value) in sidecars {
                entry = entry.with_sidecar(
                    SidecarKey::new(SidecarNamespace::Format, key),
                    value,
                );
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
                "warc record body truncated with {} bytes undelivered",
                self.remaining
            )));
        }
        self.remaining -= got as u64;
        Ok(PayloadBlock::Data(got))
    }

    fn finish_entry(&mut self, stream: &mut Lookahead) -> Result<()> {
        skip_exact(stream, self.remaining, "warc record body")?;
        self.remaining = 0;
        let sep = peek_exact(stream, RECORD_SEPARATOR.len(), "warc record separator")?;
        if &sep[..RECORD_SEPARATOR.len()] != RECORD_SEPARATOR {
            return Err(Error::corrupt(
                "warc: record body not followed by a blank-line separator",
            ));
        }
        stream.consume(RECORD_SEPARATOR.len());
        Ok(())
    }
}

/// Consume the version line and header lines up to and including the
/// blank line that ends them.
fn read_header_block(stream: &mut Lookahead) -> Result<Vec<u8>> {
    let mut want = 512;
    loop {
        let view = stream.peek(want)?;
        if !view.starts_with(VERSION_PREFIX) {
            return Err(Error::corrupt(format!(
                "warc: record at offset {} lacks a WARC/ version line",
                stream.stream_offset()
            )));
        }
        if let Some(at) = view.windows(4).position(|w| w == RECORD_SEPARATOR) {
            let header = view[..at].to_vec();
            stream.consume(at + RECORD_SEPARATOR.len());
            return Ok(header);
        }
        if view.len() < want {
            return Err(Error::short_read(
                "warc: header block truncated before its blank line",
            ));
        }
        if want >= HEADER_LIMIT {
            return Err(Error::corrupt(format!(
                "warc: header block exceeds the {HEADER_LIMIT} byte cap"
            )));
        }
        want *= 2;
    }
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |at| at + 1);
    &bytes[start..end]
}

fn eq_ignore_case(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b)
            .all(|(x, y)| x.to_ascii_lowercase() == y.to_ascii_lowercase())
}

fn parse_warc_date(raw: &[u8]) -> Result<Timestamp> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| Error::corrupt("warc: WARC-Date is not valid UTF-8"))?;
    let parsed = OffsetDateTime::parse(text, &Rfc3339)
        .map_err(|err| Error::corrupt(format!("warc: bad WARC-Date {text:?}: {err}")))?;
    Ok(Timestamp::new(
        parsed.unix_timestamp(),
        parsed.nanosecond(),
    ))
}

fn format_warc_date(ts: Timestamp) -> String {
    OffsetDateTime::from_unix_timestamp(ts.secs)
        .ok()
        .and_then(|when| when.replace_nanosecond(ts.nanos).ok())
        .and_then(|when| when.format(&Rfc3339).ok())
        .unwrap_or_else(|| String::from("1970-01-01T00:00:00Z"))
}

pub(crate) struct WarcWriter {
    started: bool,
    /// Sequence number feeding the deterministic record ids.
    sequence: u64,
    body_open: bool,
}

impl WarcWriter {
    pub(crate) fn new() -> Self {
        Self {
            started: false,
            sequence: 0,
            body_open: false,
        }
    }

    fn record_id(&mut self) -> String {
        let id = format!("<urn:arcmux:record-{}>", self.sequence);
        self.sequence += 1;
        id
    }

    fn write_warcinfo(&mut self, sink: &mut dyn Write) -> Result<()> {
        let body = b"software: arcmux\r\nformat: WARC File Format 1.0\r\n";
        let id = self.record_id();
        let header = format!(
            "WARC/1.0\r\n\
             WARC-Type: warcinfo\r\n\
             WARC-Record-ID: {id}\r\n\
             WARC-Date: 1970-01-01T00:00:00Z\r\n\
             Content-Type: application/warc-fields\r\n\
             Content-Length: {}\r\n\r\n",
            body.len()
        );
        sink.write_all(header.as_bytes())
            .and_then(|()| sink.write_all(body))
            .and_then(|()| sink.write_all(RECORD_SEPARATOR))
            .map_err(|err| Error::io(err, "warc: writing warcinfo record"))
    }
}

impl FormatWriter for WarcWriter {
    fn write_header(&mut self, sink: &mut dyn Write, entry: &Entry) -> Result<()> {
        if entry.kind() != EntryKind::Regular {
            return Err(Error::unsupported(format!(
                "warc archives hold regular files only, not {} entries",
                entry.kind()
            )));
        }
        let size = entry.size().ok_or_else(|| {
            Error::misuse("warc entries need a declared size before payload writes")
        })?;
        if !self.started {
            self.write_warcinfo(sink)?;
            self.started = true;
        }
        let id = self.record_id();
        let date = format_warc_date(entry.mtime().unwrap_or(Timestamp::from_secs(0)));
        let mut header = Vec::new();
        header.extend_from_slice(b"WARC/1.0\r\nWARC-Type: resource\r\n");
        header.extend_from_slice(b"WARC-Target-URI: file://");
        header.extend_from_slice(entry.path());
        header.extend_from_slice(b"\r\n");
        header.extend_from_slice(format!("WARC-Record-ID: {id}\r\n").as_bytes());
        header.extend_from_slice(format!("WARC-Date: {date}\r\n").as_bytes());
        header.extend_from_slice(b"Content-Type: application/octet-stream\r\n");
        header.extend_from_slice(format!("Content-Length: {size}\r\n\r\n").as_bytes());
        sink.write_all(&header)
            .map_err(|err| Error::io(err, "warc: writing record header"))?;
        self.body_open = true;
        Ok(())
    }

    fn write_data(&mut self, sink: &mut dyn Write, buf: &[u8]) -> Result<()> {
        if !self.body_open {
            return Err(Error::misuse("warc: payload bytes with no record open"));
        }
        sink.write_all(buf)
            .map_err(|err| Error::io(err, "warc: writing record body"))
    }

    fn finish_entry(&mut self, sink: &mut dyn Write, _written: u64) -> Result<()> {
        self.body_open = false;
        sink.write_all(RECORD_SEPARATOR)
            .map_err(|err| Error::io(err, "warc: writing record separator"))
    }

    fn finish(&mut self, sink: &mut dyn Write) -> Result<()> {
        if !self.started {
            self.write_warcinfo(sink)?;
            self.started = true;
        }
        Ok(())
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

    fn read_all(bytes: Vec<u8>) -> Vec<(Entry, Vec<u8>)> {
        let mut stream = lookahead(bytes);
        assert!(bid(&mut stream).unwrap() > 0);
        let mut reader = open();
        let mut decoded = Vec::new();
        while let Some(entry) = reader.next_entry(&mut stream).unwrap() {
            let mut payload = Vec::new();
            let mut buf = [0u8; 16];
            loop {
                match reader.next_block(&mut stream, &mut buf).unwrap() {
                    PayloadBlock::Data(n) => payload.extend_from_slice(&buf[..n]),
                    PayloadBlock::Hole(_) => unreachable!("warc has no holes"),
                    PayloadBlock::End => break,
                }
            }
            reader.finish_entry(&mut stream).unwrap();
            decoded.push((entry, payload));
        }
        decoded
    }

    #[test]
    fn writer_output_reads_back_and_skips_warcinfo() {
        let mut bytes = Vec::new();
        let mut writer = WarcWriter::new();
        let entry = Entry::file("docs/a.txt", 5)
            .with_mtime(Timestamp::new(1_600_000_000, 250_000_000));
        writer.write_header(&mut bytes, &entry).unwrap();
        writer.write_data(&mut bytes, b"hello").unwrap();
        writer.finish_entry(&mut bytes, 5).unwrap();
        writer.finish(&mut bytes).unwrap();

        let decoded = read_all(bytes);
        assert_eq!(decoded.len(), 1, "warcinfo is skipped");
        assert_eq!(decoded[0].0.path(), &BString::from("docs/a.txt"));
        assert_eq!(decoded[0].0.mtime(), Some(Timestamp::new(1_600_000_000, 250_000_000)));
        assert_eq!(decoded[0].1, b"hello");
        let key = SidecarKey::new(SidecarNamespace::Format, "warc.warc-record-id");
        assert!(decoded[0].0.sidecar(&key).is_some());
    }

    #[test]
    fn missing_content_length_is_corrupt() {
        let doc = b"WARC/1.0\r\nWARC-Type: resource\r\nWARC-Target-URI: file:///a\r\n\r\n";
        let mut stream = lookahead(doc.to_vec());
        let err = open().next_entry(&mut stream).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::CorruptHeader);
    }

    #[test]
    fn truncated_body_is_a_short_read() {
        let doc = b"WARC/1.0\r\nWARC-Type: resource\r\nWARC-Target-URI: file://a\r\nContent-Length: 10\r\n\r\nabc";
        let mut stream = lookahead(doc.to_vec());
        let mut reader = open();
        let entry = reader.next_entry(&mut stream).unwrap().unwrap();
        assert_eq!(entry.size(), Some(10));
        let mut buf = [0u8; 16];
        assert!(matches!(
            reader.next_block(&mut stream, &mut buf).unwrap(),
            PayloadBlock::Data(3)
        ));
        let err = reader.next_block(&mut stream, &mut buf).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ShortRead);
    }

    #[test]
    fn non_resource_records_are_transparent() {
        let mut doc = Vec::new();
        doc.extend_from_slice(
            b"WARC/1.0\r\nWARC-Type: response\r\nContent-Length: 4\r\n\r\nHTTP\r\n\r\n",
        );
        doc.extend_from_slice(
            b"WARC/1.0\r\nWARC-Type: resource\r\nWARC-Target-URI: file://b.txt\r\nContent-Length: 2\r\n\r\nok\r\n\r\n",
        );
        let decoded = read_all(doc);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].0.path(), &BString::from("b.txt"));
        assert_eq!(decoded[0].1, b"ok");
    }

    #[test]
    fn bad_date_is_corrupt() {
        let doc = b"WARC/1.0\r\nWARC-Type: resource\r\nWARC-Target-URI: file://a\r\nWARC-Date: not-a-date\r\nContent-Length: 0\r\n\r\n\r\n\r\n";
        let mut stream = lookahead(doc.to_vec());
        let err = open().next_entry(&mut stream).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::CorruptHeader);
    }
}
