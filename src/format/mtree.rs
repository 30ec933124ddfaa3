//! mtree specification files: a metadata-only format.
//!
//! Lines name filesystem objects and carry `keyword=value` pairs; no
//! payload bytes are stored. Entries therefore report their declared
//! `size` keyword but deliver an empty payload stream. Both the
//! relative style (basenames plus a directory stack, `..` to pop) and
//! the full-path style (`./dir/file`) are read; the writer emits full
//! paths with a SHA-256 digest per regular file.

use std::collections::BTreeMap;

use bstr::BString;

use crate::digest::{DigestKind, Digester};
use crate::entry::{Entry, EntryKind, Timestamp};
use crate::error::Error;
use crate::format::{FormatReader, FormatWriter, PayloadBlock};
use crate::io::lookahead::Lookahead;
use crate::sidecar::{SidecarKey, SidecarNamespace};
use crate::Result;
use std::io::Write;

const SIGNATURE: &[u8] = b"#mtree";
const LINE_LIMIT: usize = 1 << 20;

/// `#mtree` on the first line is definitive; otherwise a weak
/// structural bid when the first line already looks like an mtree
/// entry (`/set ...` or a word carrying `type=`).
pub(crate) fn bid(stream: &mut Lookahead) -> Result<i32> {
    let head = stream.peek(SIGNATURE.len())?;
    if head.len() >= SIGNATURE.len() && &head[..SIGNATURE.len()] == SIGNATURE {
        return Ok(48);
    }
    let head = stream.peek(256)?;
    let line = &head[..head.iter().position(|&b| b == b'\n').unwrap_or(head.len())];
    if line.starts_with(b"/set ") || line.windows(6).any(|w| w == b" type=") {
        return Ok(8);
    }
    Ok(0)
}

pub(crate) fn open() -> Box<dyn FormatReader> {
    Box::new(MtreeReader {
        defaults: BTreeMap::new(),
        dir_stack: Vec::new(),
    })
}

pub(crate) struct MtreeReader {
    /// Keyword values installed by `/set`, applied under each entry's
    /// own keywords.
    defaults: BTreeMap<Vec<u8>, Vec<u8>>,
    /// Directory context for relative-style lines.
    dir_stack: Vec<BString>,
}

impl MtreeReader {
    /// One logical line, with `\`-continuations joined and comments and
    /// blanks skipped. `Ok(None)` is end of input.
    fn next_line(&mut self, stream: &mut Lookahead) -> Result<Option<Vec<u8>>> {
        loop {
            let mut line = match read_raw_line(stream)? {
                Some(line) => line,
                None => return Ok(None),
            };
            while line.last() == Some(&b'\\') {
                line.pop();
                match read_raw_line(stream)? {
                    Some(more) => line.extend_from_slice(&more),
                    None => {
                        return Err(Error::short_read(
                            "mtree: continuation line missing at end of input",
                        ))
                    }
                }
            }
            let trimmed: &[u8] = match line.iter().position(|b| !b.is_ascii_whitespace()) {
                Some(at) => &line[at..],
                None => continue,
            };
            if trimmed.first() == Some(&b'#') {
                continue;
            }
            return Ok(Some(trimmed.to_vec()));
        }
    }

    /// Turn a path word into a full entry path. Relative basenames
    /// also report the decoded basename so `type=dir` can extend the
    /// stack.
    fn resolve_path(&mut self, word: &[u8]) -> Result<(BString, Option<BString>)> {
        let name = vis_decode(word)?;
        if name == b"..".as_slice() {
            if self.dir_stack.pop().is_none() {
                return Err(Error::corrupt("mtree: .. with no directory to leave"));
            }
            return Ok((BString::from(""), None));
        }
        if let Some(stripped) = name.strip_prefix(b"./") {
            return Ok((BString::from(stripped), None));
        }
        if name.contains(&b'/') {
            return Ok((BString::from(name), None));
        }
        let mut full = Vec::new();
        for dir in &self.dir_stack {
            full.extend_from_slice(dir);
            full.push(b'/');
        }
        full.extend_from_slice(&name);
        Ok((BString::from(full), Some(BString::from(name))))
    }
}

impl FormatReader for MtreeReader {
    fn next_entry(&mut self, stream: &mut Lookahead) -> Result<Option<Entry>> {
        loop {
            let line = match self.next_line(stream)? {
                Some(line) => line,
                None => return Ok(None),
            };
            let mut words = line
                .split(|b| b.is_ascii_whitespace())
                .filter(|w| !w.is_empty());
            let first = match words.next() {
                Some(first) => first,
                None => continue,
            };

            if first == b"/set" {
                for word in words {
                    let (key, value) = split_keyword(word)?;
                    self.defaults.insert(key.to_vec(), value.to_vec());
                }
                continue;
            }
            if first == b"/unset" {
                for word in words {
                    if word == b"all" {
                        self.defaults.clear();
                    } else {
                        self.defaults.remove(word);
                    }
                }
                continue;
            }

            let (path, basename) = self.resolve_path(first)?;
            if path.is_empty() {
                // A bare `..` line only adjusts the directory stack.
                continue;
            }

            let mut keywords: BTreeMap<Vec<u8>, Vec<u8>> = self.defaults.clone();
            for word in words {
                let (key, value) = split_keyword(word)?;
                keywords.insert(key.to_vec(), value.to_vec());
            }

            let kind = match keywords.get(b"type".as_slice()).map(Vec::as_slice) {
                Some(b"file") | None => EntryKind::Regular,
                Some(b"dir") => EntryKind::Directory,
                Some(b"link") => EntryKind::Symlink,
                Some(b"block") => EntryKind::BlockDevice,
                Some(b"char") => EntryKind::CharDevice,
                Some(b"fifo") => EntryKind::Fifo,
                Some(b"socket") => EntryKind::Socket,
                Some(other) => {
                    return Err(Error::corrupt(format!(
                        "mtree: unknown type keyword {:?}",
                        String::from_utf8_lossy(other)
                    )))
                }
            };
            if kind == EntryKind::Directory {
                if let Some(basename) = basename {
                    self.dir_stack.push(basename);
                }
            }

            let mut entry = Entry::new(path, kind);
            for (key, value) in keywords {
                match key.as_slice() {
                    b"type" => {}
                    b"mode" => {
                        entry = entry.with_mode(parse_keyword_number(&value, 8, "mode")? as u32);
                    }
                    b"uid" => {
                        let gid = entry.gid();
                        entry = entry.with_owner(parse_keyword_number(&value, 10, "uid")?, gid);
                    }
                    b"gid" => {
                        let uid = entry.uid();
                        entry = entry.with_owner(uid, parse_keyword_number(&value, 10, "gid")?);
                    }
                    b"uname" => {
                        let gname = entry.gname().cloned();
                        entry = entry.with_owner_names(Some(vis_decode(&value)?), gname);
                    }
                    b"gname" => {
                        let uname = entry.uname().cloned();
                        entry = entry.with_owner_names(uname, Some(vis_decode(&value)?));
                    }
                    b"size" => {
                        entry = entry.with_size(parse_keyword_number(&value, 10, "size")?);
                    }
                    b"time" => {
                        entry = entry.with_mtime(parse_keyword_time(&value)?);
                    }
                    b"link" => {
                        entry = entry.with_link_target(BString::from(vis_decode(&value)?));
                    }
                    // Digests, device numbers, and vendor keywords pass
                    // through as format-private sidecars.
                    other => {
                        let mut name = b"mtree.".to_vec();
                        name.extend_from_slice(other);
                        entry = entry.with_sidecar(
                            SidecarKey::new(SidecarNamespace::Format, name),
                            value,
                        );
                    }
                }
            }
            return Ok(Some(entry));
        }
    }

    fn next_block(&mut self, _stream: &mut Lookahead, _out: &mut [u8]) -> Result<PayloadBlock> {
        // The specification file describes payload it does not carry.
        Ok(PayloadBlock::End)
    }

    fn finish_entry(&mut self, _stream: &mut Lookahead) -> Result<()> {
        Ok(())
    }
}

fn read_raw_line(stream: &mut Lookahead) -> Result<Option<Vec<u8>>> {
    let mut want = 256;
    loop {
        let view = stream.peek(want)?;
        if view.is_empty() {
            return Ok(None);
        }
        if let Some(at) = view.iter().position(|&b| b == b'\n') {
            let line = view[..at].to_vec();
            stream.consume(at + 1);
            return Ok(Some(line));
        }
        if view.len() < want {
            // EOF without a trailing newline still yields the line.
            let line = view.to_vec();
            let len = line.len();
            stream.consume(len);
            return Ok(Some(line));
        }
        if want >= LINE_LIMIT {
            return Err(Error::corrupt(format!(
                "mtree: line exceeds the {LINE_LIMIT} byte cap"
            )));
        }
        want *= 2;
    }
}

fn split_keyword(word: &[u8]) -> Result<(&[u8], &[u8])> {
    match word.iter().position(|&b| b == b'=') {
        Some(at) => Ok((&word[..at], &word[at + 1..])),
        // Bare keywords (e.g. under /set) carry an empty value.
        None => Ok((word, &[])),
    }
}

/// Undo strvis encoding: `\ooo` octal escapes and doubled backslashes.
fn vis_decode(raw: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(raw.len());
    let mut at = 0;
    while at < raw.len() {
        if raw[at] != b'\\' {
            out.push(raw[at]);
            at += 1;
            continue;
        }
        let rest = &raw[at + 1..];
        if rest.first() == Some(&b'\\') {
            out.push(b'\\');
            at += 2;
            continue;
        }
        if rest.len() >= 3 && rest[..3].iter().all(|b| (b'0'..=b'7').contains(b)) {
            let value = (u32::from(rest[0] - b'0') << 6)
                | (u32::from(rest[1] - b'0') << 3)
                | u32::from(rest[2] - b'0');
            out.push(value as u8);
            at += 4;
            continue;
        }
        return Err(Error::corrupt(format!(
            "mtree: bad escape at byte {at} of {:?}",
            String::from_utf8_lossy(raw)
        )));
    }
    Ok(out)
}

fn vis_encode(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    for &b in raw {
        match b {
            b'\\' => out.extend_from_slice(b"\\\\"),
            b' ' | b'\t' | b'\n' | b'#' => {
                out.push(b'\\');
                out.push(b'0' + (b >> 6));
                out.push(b'0' + ((b >> 3) & 7));
                out.push(b'0' + (b & 7));
            }
            b if b.is_ascii_graphic() => out.push(b),
            b => {
                out.push(b'\\');
                out.push(b'0' + (b >> 6));
                out.push(b'0' + ((b >> 3) & 7));
                out.push(b'0' + (b & 7));
            }
        }
    }
    out
}

fn parse_keyword_number(value: &[u8], radix: u64, what: &str) -> Result<u64> {
    let mut acc: u64 = 0;
    if value.is_empty() {
        return Err(Error::corrupt(format!("mtree: empty {what} keyword")));
    }
    for &b in value {
        let digit = match b {
            b'0'..=b'9' => u64::from(b - b'0'),
            _ => return Err(Error::corrupt(format!("mtree: bad digit in {what} keyword"))),
        };
        if digit >= radix {
            return Err(Error::corrupt(format!("mtree: bad digit in {what} keyword")));
        }
        acc = acc
            .checked_mul(radix)
            .and_then(|acc| acc.checked_add(digit))
            .ok_or_else(|| Error::corrupt(format!("mtree: {what} keyword overflows")))?;
    }
    Ok(acc)
}

/// `time=seconds.fraction`, fraction padded or truncated to
/// nanoseconds.
fn parse_keyword_time(value: &[u8]) -> Result<Timestamp> {
    let (secs, frac) = match value.iter().position(|&b| b == b'.') {
        Some(at) => (&value[..at], &value[at + 1..]),
        None => (value, &[][..]),
    };
    let (negative, digits) = match secs.strip_prefix(b"-") {
        Some(rest) => (true, rest),
        None => (false, secs),
    };
    let magnitude = parse_keyword_number(digits, 10, "time")?;
    let secs = i64::try_from(magnitude)
        .map(|secs| if negative { -secs } else { secs })
        .map_err(|_| Error::corrupt("mtree: time keyword overflows"))?;
    let mut nanos: u32 = 0;
    for place in 0..9 {
        let digit = frac.get(place).copied().unwrap_or(b'0');
        if !digit.is_ascii_digit() {
            return Err(Error::corrupt("mtree: bad digit in time fraction"));
        }
        nanos = nanos * 10 + u32::from(digit - b'0');
    }
    Ok(Timestamp::new(secs, nanos))
}

pub(crate) struct MtreeWriter {
    started: bool,
    pending: Option<PendingLine>,
}

struct PendingLine {
    line: Vec<u8>,
    digester: Option<Digester>,
}

impl MtreeWriter {
    pub(crate) fn new() -> Self {
        Self {
            started: false,
            pending: None,
        }
    }
}

impl FormatWriter for MtreeWriter {
    fn write_header(&mut self, sink: &mut dyn Write, entry: &Entry) -> Result<()> {
        if entry.kind() == EntryKind::Hardlink {
            return Err(Error::unsupported(
                "mtree has no hardlink type; write the entry as a file",
            ));
        }
        if !self.started {
            sink.write_all(b"#mtree\n/set type=file uid=0 gid=0 mode=644\n")
                .map_err(|err| Error::io(err, "mtree: writing signature"))?;
            self.started = true;
        }

        let mut line = b"./".to_vec();
        line.extend_from_slice(&vis_encode(entry.path()));
        let type_word = match entry.kind() {
            EntryKind::Regular | EntryKind::Hardlink => "file",
            EntryKind::Directory => "dir",
            EntryKind::Symlink => "link",
            EntryKind::BlockDevice => "block",
            EntryKind::CharDevice => "char",
            EntryKind::Fifo => "fifo",
            EntryKind::Socket => "socket",
        };
        // The /set line covers type=file uid=0 gid=0 mode=644.
        if type_word != "file" {
            line.extend_from_slice(format!(" type={type_word}").as_bytes());
        }
        if entry.mode() != 0o644 {
            line.extend_from_slice(format!(" mode={:o}", entry.mode()).as_bytes());
        }
        if entry.uid() != 0 {
            line.extend_from_slice(format!(" uid={}", entry.uid()).as_bytes());
        }
        if entry.gid() != 0 {
            line.extend_from_slice(format!(" gid={}", entry.gid()).as_bytes());
        }
        if let Some(mtime) = entry.mtime() {
            line.extend_from_slice(
                format!(" time={}.{:09}", mtime.secs, mtime.nanos).as_bytes(),
            );
        }
        if let Some(target) = entry.link_target() {
            line.extend_from_slice(b" link=");
            line.extend_from_slice(&vis_encode(target));
        }
        if let Some((major, minor)) = entry.rdev() {
            line.extend_from_slice(format!(" device=native,{major},{minor}").as_bytes());
        }

        let digester = (entry.kind() == EntryKind::Regular)
            .then(|| Digester::new(DigestKind::Sha256));
        self.pending = Some(PendingLine { line, digester });
        Ok(())
    }

    fn write_data(&mut self, _sink: &mut dyn Write, buf: &[u8]) -> Result<()> {
        let pending = self
            .pending
            .as_mut()
            .ok_or_else(|| Error::misuse("mtree: payload bytes with no entry open"))?;
        if let Some(digester) = pending.digester.as_mut() {
            digester.update(buf);
        }
        Ok(())
    }

    fn finish_entry(&mut self, sink: &mut dyn Write, written: u64) -> Result<()> {
        let pending = self
            .pending
            .take()
            .ok_or_else(|| Error::misuse("mtree: finish_entry with no entry open"))?;
        let mut line = pending.line;
        if let Some(digester) = pending.digester {
            line.extend_from_slice(format!(" size={written}").as_bytes());
            line.extend_from_slice(format!(" sha256digest={}", digester.finish_hex()).as_bytes());
        }
        line.push(b'\n');
        sink.write_all(&line)
            .map_err(|err| Error::io(err, "mtree: writing entry line"))
    }

    fn finish(&mut self, sink: &mut dyn Write) -> Result<()> {
        if !self.started {
            sink.write_all(b"#mtree\n/set type=file uid=0 gid=0 mode=644\n")
                .map_err(|err| Error::io(err, "mtree: writing signature"))?;
            self.started = true;
        }
        Ok(())
    }
}
