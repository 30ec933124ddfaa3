//! tar container: ustar and pax read/write, GNU long names and old-GNU
//! sparse entries read-only.
//!
//! Headers are 512-byte blocks; payloads are padded to the block size.
//! The reader accepts POSIX ustar magic (`ustar\0`) and the old GNU
//! magic (`ustar  `), verifies header checksums (signed or unsigned
//! sum), applies pax `x`/`g` record overrides, and resolves GNU `L`/`K`
//! long name/link pseudo entries. Two consecutive zero blocks end the
//! archive.

use bstr::{BString, ByteSlice};
use bytes::Bytes;

use crate::entry::{Entry, EntryKind, Timestamp};
use crate::error::Error;
use crate::format::{
    parse_octal, peek_exact, read_exact_vec, skip_exact, trim_field, FormatReader, FormatWriter,
    PayloadBlock,
};
use crate::io::lookahead::Lookahead;
use crate::sidecar::{SidecarKey, SidecarNamespace};
use crate::Result;
use std::io::Write;

const BLOCK: usize = 512;
/// Cap on pax record blocks and GNU long-name payloads. Real metadata is
/// tiny; anything near this is hostile.
const META_LIMIT: u64 = 1 << 20;

/// Magic plus a verified checksum; both are required, so the score is
/// well above every structural bidder.
pub(crate) fn bid(stream: &mut Lookahead) -> Result<i32> {
    let head = stream.peek(BLOCK)?;
    if head.len() < BLOCK {
        return Ok(0);
    }
    let magic = &head[257..265];
    if magic != b"ustar\000" && magic != b"ustar  \0" {
        return Ok(0);
    }
    if !checksum_ok(&head[..BLOCK]) {
        return Ok(0);
    }
    Ok(56)
}

pub(crate) fn open() -> Box<dyn FormatReader> {
    Box::new(TarReader {
        remaining: 0,
        padding: 0,
        sparse: None,
        global: PaxAttrs::default(),
        done: false,
    })
}

fn checksum_ok(block: &[u8]) -> bool {
    let Ok(stored) = parse_octal(&block[148..156], "tar checksum") else {
        return false;
    };
    let mut unsigned: u64 = 0;
    let mut signed: i64 = 0;
    for (index, &byte) in block.iter().enumerate() {
        let byte = if (148..156).contains(&index) { b' ' } else { byte };
        unsigned += u64::from(byte);
        signed += i64::from(byte as i8);
    }
    stored == unsigned || i64::try_from(stored).map_or(false, |s| s == signed)
}

/// Octal with the GNU base-256 (high bit) extension.
fn parse_numeric(field: &[u8], what: &str) -> Result<u64> {
    if field.first().map_or(false, |&b| b & 0x80 != 0) {
        let mut value = u64::from(field[0] & 0x7f);
        for &byte in &field[1..] {
            if value > u64::MAX >> 8 {
                return Err(Error::corrupt(format!(
                    "{what}: base-256 field overflows u64"
                )));
            }
            value = value << 8 | u64::from(byte);
        }
        return Ok(value);
    }
    parse_octal(field, what)
}

/// Accumulated pax overrides from `x` (per entry) and `g` (global)
/// records, plus GNU long name/link payloads which share the override
/// slot at lower precedence.
#[derive(Default, Clone)]
struct PaxAttrs {
    path: Option<BString>,
    linkpath: Option<BString>,
    size: Option<u64>,
    uid: Option<u64>,
    gid: Option<u64>,
    uname: Option<BString>,
    gname: Option<BString>,
    mtime: Option<Timestamp>,
    atime: Option<Timestamp>,
    ctime: Option<Timestamp>,
    birthtime: Option<Timestamp>,
    sidecars: Vec<(SidecarKey, Bytes)>,
}

impl PaxAttrs {
    fn record(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        match key {
            b"path" => self.path = Some(value.into()),
            b"linkpath" => self.linkpath = Some(value.into()),
            b"size" => self.size = Some(super::parse_decimal(value, "pax size")?),
            b"uid" => self.uid = Some(super::parse_decimal(value, "pax uid")?),
            b"gid" => self.gid = Some(super::parse_decimal(value, "pax gid")?),
            b"uname" => self.uname = Some(value.into()),
            b"gname" => self.gname = Some(value.into()),
            b"mtime" => self.mtime = Some(parse_pax_time(value)?),
            b"atime" => self.atime = Some(parse_pax_time(value)?),
            b"ctime" => self.ctime = Some(parse_pax_time(value)?),
            b"LIBARCHIVE.creationtime" => self.birthtime = Some(parse_pax_time(value)?),
            _ => {
                let key = if let Some(name) = key.strip_prefix(b"SCHILY.xattr.") {
                    SidecarKey::xattr(name)
                } else if key.starts_with(b"SCHILY.acl.") || key.starts_with(b"LIBARCHIVE.acl.") {
                    SidecarKey::new(SidecarNamespace::Acl, key)
                } else if key == b"SCHILY.fflags" {
                    SidecarKey::new(SidecarNamespace::FileFlags, key)
                } else {
                    SidecarKey::new(SidecarNamespace::Format, key)
                };
                self.sidecars.push((key, Bytes::copy_from_slice(value)));
            }
        }
        Ok(())
    }

    /// Merge `self` over `base` (header fields already applied to the
    /// entry); `self` wins on every field it carries.
    fn apply(&self, entry: &mut Entry) {
        if let Some(path) = &self.path {
            entry.set_path(path.clone());
        }
        if let Some(link) = &self.linkpath {
            entry.set_link_target(link.clone());
        }
        for (key, value) in &self.sidecars {
            entry.insert_sidecar(key.clone(), value.clone());
        }
    }
}

/// Parse `seconds[.fraction]` with an optional sign.
fn parse_pax_time(value: &[u8]) -> Result<Timestamp> {
    let (secs_part, frac_part) = match value.iter().position(|&b| b == b'.') {
        Some(dot) => (&value[..dot], &value[dot + 1..]),
        None => (value, &[][..]),
    };
    let (negative, digits) = match secs_part.strip_prefix(b"-") {
        Some(rest) => (true, rest),
        None => (false, secs_part),
    };
    let magnitude = super::parse_decimal(digits, "pax timestamp")?;
    let mut secs = i64::try_from(magnitude)
        .map_err(|_| Error::corrupt("pax timestamp: seconds out of range"))?;
    if negative {
        secs = -secs;
    }
    let mut nanos: u32 = 0;
    for (index, &byte) in frac_part.iter().take(9).enumerate() {
        if !byte.is_ascii_digit() {
            return Err(Error::corrupt("pax timestamp: non-digit fraction"));
        }
        nanos += u32::from(byte - b'0') * 10u32.pow(8 - index as u32);
    }
    // The decimal fraction counts away from zero; `Timestamp` nanos
    // always add to `secs`, so pre-epoch values borrow a second.
    if negative && nanos != 0 {
        secs -= 1;
        nanos = 1_000_000_000 - nanos;
    }
    Ok(Timestamp::new(secs, nanos))
}

/// Parse the `%d key=value\n` record stream of a pax payload.
fn parse_pax_records(data: &[u8], attrs: &mut PaxAttrs) -> Result<()> {
    let mut rest = data;
    while !rest.is_empty() {
        let space = rest
            .iter()
            .position(|&b| b == b' ')
            .ok_or_else(|| Error::corrupt("pax record: missing length delimiter"))?;
        let len = super::parse_decimal(&rest[..space], "pax record length")? as usize;
        if len <= space + 1 || len > rest.len() {
            return Err(Error::corrupt(format!(
                "pax record: length {len} does not fit remaining {} bytes",
                rest.len()
            )));
        }
        let body = &rest[space + 1..len];
        let body = body.strip_suffix(b"\n").unwrap_or(body);
        let eq = body
            .iter()
            .position(|&b| b == b'=')
            .ok_or_else(|| Error::corrupt("pax record: missing '='"))?;
        attrs.record(&body[..eq], &body[eq + 1..])?;
        rest = &rest[len..];
    }
    Ok(())
}

/// Old-GNU sparse map for one open entry: (logical offset, length)
/// regions whose data are stored back to back.
struct SparseMap {
    regions: Vec<(u64, u64)>,
    index: usize,
    within: u64,
    logical: u64,
    total: u64,
}

pub(crate) struct TarReader {
    remaining: u64,
    padding: u64,
    sparse: Option<SparseMap>,
    global: PaxAttrs,
    done: bool,
}

impl TarReader {
    fn read_meta_payload(
        &self,
        stream: &mut Lookahead,
        size: u64,
        what: &str,
    ) -> Result<Vec<u8>> {
        if size > META_LIMIT {
            return Err(Error::corrupt(format!(
                "{what}: {size} byte metadata payload exceeds the {META_LIMIT} byte cap"
            )));
        }
        let data = read_exact_vec(stream, size as usize, what)?;
        skip_exact(stream, block_padding(size), what)?;
        Ok(data)
    }

    fn parse_sparse(
        &self,
        stream: &mut Lookahead,
        block: &[u8; BLOCK],
        stored_size: u64,
    ) -> Result<SparseMap> {
        let mut regions = Vec::new();
        let mut extended = push_sparse_regions(&block[386..482], 4, &mut regions)?
            && block[482] != 0;
        // Extended sparse maps follow as whole blocks of 21 descriptors.
        while extended {
            let ext = peek_exact(stream, BLOCK, "tar sparse extension")?.to_vec();
            stream.consume(BLOCK);
            extended =
                push_sparse_regions(&ext[..504], 21, &mut regions)? && ext[504] != 0;
        }
        let total = parse_numeric(&block[483..495], "tar sparse realsize")?;
        let stored: u64 = regions.iter().map(|&(_, len)| len).sum();
        if stored != stored_size {
            return Err(Error::corrupt(format!(
                "tar sparse map claims {stored} stored bytes but header says {stored_size}"
            )));
        }
        Ok(SparseMap {
            regions,
            index: 0,
            within: 0,
            logical: 0,
            total,
        })
    }
}

/// Parse up to `count` 24-byte sparse descriptors; returns whether the
/// table was full (a NUL-led offset field ends it early).
fn push_sparse_regions(
    table: &[u8],
    count: usize,
    regions: &mut Vec<(u64, u64)>,
) -> Result<bool> {
    for slot in 0..count {
        let descriptor = &table[slot * 24..slot * 24 + 24];
        if descriptor[0] == 0 {
            return Ok(false);
        }
        let offset = parse_numeric(&descriptor[..12], "tar sparse offset")?;
        let length = parse_numeric(&descriptor[12..24], "tar sparse length")?;
        if let Some(&(last_off, last_len)) = regions.last() {
            if offset < last_off + last_len {
                return Err(Error::corrupt("tar sparse map: regions out of order"));
            }
        }
        regions.push((offset, length));
    }
    Ok(true)
}

fn block_padding(size: u64) -> u64 {
    (BLOCK as u64 - size % BLOCK as u64) % BLOCK as u64
}

fn kind_from_typeflag(typeflag: u8, name: &[u8]) -> Result<EntryKind> {
    Ok(match typeflag {
        b'0' | 0 | b'7' => {
            if name.last() == Some(&b'/') {
                EntryKind::Directory
            } else {
                EntryKind::Regular
            }
        }
        b'1' => EntryKind::Hardlink,
        b'2' => EntryKind::Symlink,
        b'3' => EntryKind::CharDevice,
        b'4' => EntryKind::BlockDevice,
        b'5' => EntryKind::Directory,
        b'6' => EntryKind::Fifo,
        other => {
            return Err(Error::corrupt(format!(
                "tar header: unknown typeflag {:?}",
                other as char
            )))
        }
    })
}

impl FormatReader for TarReader {
    fn next_entry(&mut self, stream: &mut Lookahead) -> Result<Option<Entry>> {
        if self.done {
            return Ok(None);
        }
        let mut overrides = PaxAttrs::default();
        let mut long_name: Option<BString> = None;
        let mut long_link: Option<BString> = None;
        loop {
            let offset = stream.stream_offset();
            let head = stream.peek(BLOCK)?;
            if head.is_empty() {
                // Archive ends cleanly at a block boundary without the
                // two-zero-block trailer; common with minimal producers.
                self.done = true;
                return Ok(None);
            }
            if head.len() < BLOCK {
                return Err(Error::short_read(format!(
                    "tar header: truncated block at offset {offset} ({} of {BLOCK} bytes)",
                    head.len()
                )));
            }
            let block: [u8; BLOCK] = head[..BLOCK].try_into().unwrap();
            if block.iter().all(|&b| b == 0) {
                stream.consume(BLOCK);
                let second = stream.peek(BLOCK)?;
                if second.len() >= BLOCK && second[..BLOCK].iter().all(|&b| b == 0) {
                    stream.consume(BLOCK);
                }
                // Drain the rest of the trailing padding run.
                stream.skip(u64::MAX)?;
                self.done = true;
                return Ok(None);
            }
            if !checksum_ok(&block) {
                return Err(Error::corrupt(format!(
                    "tar header: checksum mismatch at offset {offset}"
                )));
            }
            stream.consume(BLOCK);

            let typeflag = block[156];
            let size = parse_numeric(&block[124..136], "tar size")?;
            match typeflag {
                b'x' => {
                    let data = self.read_meta_payload(stream, size, "tar pax records")?;
                    parse_pax_records(&data, &mut overrides)?;
                    continue;
                }
                b'g' => {
                    let data = self.read_meta_payload(stream, size, "tar pax globals")?;
                    parse_pax_records(&data, &mut self.global)?;
                    continue;
                }
                b'L' => {
                    let data = self.read_meta_payload(stream, size, "tar long name")?;
                    long_name = Some(strip_nuls(&data).into());
                    continue;
                }
                b'K' => {
                    let data = self.read_meta_payload(stream, size, "tar long link")?;
                    long_link = Some(strip_nuls(&data).into());
                    continue;
                }
                _ => {}
            }

            let name_field = trim_nuls_only(&block[..100]);
            let mut name = BString::from(name_field);
            // ustar prefix applies only when no long name overrides it.
            if &block[257..263] == b"ustar\0" && block[345] != 0 && long_name.is_none() {
                let prefix = trim_nuls_only(&block[345..500]);
                let mut joined = BString::from(prefix);
                joined.push(b'/');
                joined.extend_from_slice(&name);
                name = joined;
            }
            if let Some(long) = long_name.take() {
                name = long;
            }

            let sparse = typeflag == b'S';
            let kind = if sparse {
                EntryKind::Regular
            } else {
                kind_from_typeflag(typeflag, &name)?
            };
            // Directories are stored with a trailing slash; entries
            // carry the bare name, as in the other formats.
            if kind == EntryKind::Directory && name.len() > 1 && name.last() == Some(&b'/') {
                name.pop();
            }

            let mut entry = Entry::new(name, kind)
                .with_mode(parse_numeric(&block[100..108], "tar mode")? as u32)
                .with_owner(
                    overrides
                        .uid
                        .or(self.global.uid)
                        .map_or_else(|| parse_numeric(&block[108..116], "tar uid"), Ok)?,
                    overrides
                        .gid
                        .or(self.global.gid)
                        .map_or_else(|| parse_numeric(&block[116..124], "tar gid"), Ok)?,
                );

            let mtime_field = parse_numeric(&block[136..148], "tar mtime")?;
            let mtime = overrides
                .mtime
                .or(self.global.mtime)
                .unwrap_or(Timestamp::from_secs(mtime_field as i64));
            entry = entry.with_mtime(mtime);
            if let Some(atime) = overrides.atime.or(self.global.atime) {
                entry = entry.with_atime(atime);
            }
            if let Some(ctime) = overrides.ctime.or(self.global.ctime) {
                entry = entry.with_ctime(ctime);
            }
            if let Some(birthtime) = overrides.birthtime.or(self.global.birthtime) {
                entry = entry.with_birthtime(birthtime);
            }

            let uname = overrides
                .uname
                .clone()
                .or(self.global.uname.clone())
                .or_else(|| non_empty(trim_field(&block[265..297])));
            let gname = overrides
                .gname
                .clone()
                .or(self.global.gname.clone())
                .or_else(|| non_empty(trim_field(&block[297..329])));
            entry = entry.with_owner_names(uname, gname);

            if matches!(kind, EntryKind::CharDevice | EntryKind::BlockDevice) {
                entry = entry.with_rdev(
                    parse_numeric(&block[329..337], "tar devmajor")? as u32,
                    parse_numeric(&block[337..345], "tar devminor")? as u32,
                );
            }
            if matches!(kind, EntryKind::Symlink | EntryKind::Hardlink) {
                let link = trim_nuls_only(&block[157..257]);
                if !link.is_empty() {
                    entry.set_link_target(link);
                }
                if let Some(long) = long_link.take() {
                    entry.set_link_target(long);
                }
            }

            let stored_size = overrides.size.unwrap_or(size);
            if sparse {
                let map = self.parse_sparse(stream, &block, stored_size)?;
                entry.set_size(Some(map.total));
                self.remaining = stored_size;
                self.padding = block_padding(stored_size);
                self.sparse = Some(map);
            } else if kind.carries_payload() {
                entry.set_size(Some(stored_size));
                self.remaining = stored_size;
                self.padding = block_padding(stored_size);
            } else {
                // Non-payload kinds sometimes carry junk size fields;
                // nothing is stored for them.
                entry.set_size(None);
                self.remaining = 0;
                self.padding = 0;
            }

            self.global.apply(&mut entry);
            overrides.apply(&mut entry);
            return Ok(Some(entry));
        }
    }

    fn next_block(&mut self, stream: &mut Lookahead, out: &mut [u8]) -> Result<PayloadBlock> {
        if let Some(sparse) = &mut self.sparse {
            loop {
                if sparse.index == sparse.regions.len() {
                    if sparse.logical < sparse.total {
                        let gap = sparse.total - sparse.logical;
                        sparse.logical = sparse.total;
                        return Ok(PayloadBlock::Hole(gap));
                    }
                    return Ok(PayloadBlock::End);
                }
                let (offset, length) = sparse.regions[sparse.index];
                if sparse.logical < offset {
                    let gap = offset - sparse.logical;
                    sparse.logical = offset;
                    return Ok(PayloadBlock::Hole(gap));
                }
                if sparse.within == length {
                    sparse.index += 1;
                    sparse.within = 0;
                    continue;
                }
                let want = usize::try_from((length - sparse.within).min(out.len() as u64))
                    .unwrap_or(out.len());
                let got = stream.read_into(&mut out[..want])?;
                if got == 0 {
                    return Err(Error::short_read(format!(
                        "tar sparse payload truncated at offset {}",
                        stream.stream_offset()
                    )));
                }
                sparse.within += got as u64;
                sparse.logical += got as u64;
                self.remaining -= got as u64;
                return Ok(PayloadBlock::Data(got));
            }
        }
        if self.remaining == 0 {
            return Ok(PayloadBlock::End);
        }
        let want = usize::try_from(self.remaining.min(out.len() as u64)).unwrap_or(out.len());
        let got = stream.read_into(&mut out[..want])?;
        if got == 0 {
            return Err(Error::short_read(format!(
                "tar payload truncated with {} bytes undelivered at offset {}",
                self.remaining,
                stream.stream_offset()
            )));
        }
        self.remaining -= got as u64;
        Ok(PayloadBlock::Data(got))
    }

    fn finish_entry(&mut self, stream: &mut Lookahead) -> Result<()> {
        self.sparse = None;
        let padding = std::mem::take(&mut self.padding);
        skip_exact(stream, padding, "tar block padding")
    }
}

fn strip_nuls(data: &[u8]) -> &[u8] {
    match data.iter().position(|&b| b == 0) {
        Some(nul) => &data[..nul],
        None => data,
    }
}

fn trim_nuls_only(field: &[u8]) -> &[u8] {
    strip_nuls(field)
}

fn non_empty(field: &[u8]) -> Option<BString> {
    if field.is_empty() {
        None
    } else {
        Some(field.into())
    }
}

/// Which tar dialect the writer emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TarVariant {
    /// Strict POSIX ustar: errors on anything the fixed fields cannot
    /// hold.
    Ustar,
    /// ustar plus pax `x` records emitted exactly when needed.
    #[default]
    Pax,
}

pub(crate) struct TarWriter {
    variant: TarVariant,
    /// Sequence number for pax header pseudo-entry names.
    seq: u64,
}

impl TarWriter {
    pub(crate) fn new(variant: TarVariant) -> Self {
        Self { variant, seq: 0 }
    }
}

const OCTAL_SIZE_MAX: u64 = 0o77_777_777_777;
const OCTAL_ID_MAX: u64 = 0o7_777_777;

fn typeflag_for(kind: EntryKind) -> Result<u8> {
    Ok(match kind {
        EntryKind::Regular => b'0',
        EntryKind::Hardlink => b'1',
        EntryKind::Symlink => b'2',
        EntryKind::CharDevice => b'3',
        EntryKind::BlockDevice => b'4',
        EntryKind::Directory => b'5',
        EntryKind::Fifo => b'6',
        EntryKind::Socket => {
            return Err(Error::unsupported("tar cannot represent socket entries"))
        }
    })
}

fn put_octal(field: &mut [u8], value: u64) {
    let digits = field.len() - 1;
    let text = format!("{value:0width$o}", width = digits);
    field[..digits].copy_from_slice(text.as_bytes());
    field[digits] = 0;
}

/// Split a long name into (prefix, name) at a slash so both halves fit
/// their ustar fields.
fn split_ustar_name(name: &[u8]) -> Option<(&[u8], &[u8])> {
    if name.len() <= 100 {
        return Some((&[], name));
    }
    // The split slash itself is stored in neither field.
    for (index, &byte) in name.iter().enumerate().rev() {
        if byte == b'/' && index <= 155 && name.len() - index - 1 <= 100 && index > 0 {
            return Some((&name[..index], &name[index + 1..]));
        }
    }
    None
}

fn pax_record(key: &str, value: &[u8]) -> Vec<u8> {
    let base = key.len() + value.len() + 3;
    let mut total = base + 1;
    loop {
        let digits = total.to_string().len();
        if digits + base == total {
            break;
        }
        total = base + digits;
    }
    let mut record = Vec::with_capacity(total);
    record.extend_from_slice(total.to_string().as_bytes());
    record.push(b' ');
    record.extend_from_slice(key.as_bytes());
    record.push(b'=');
    record.extend_from_slice(value);
    record.push(b'\n');
    record
}

fn format_pax_time(ts: Timestamp) -> Vec<u8> {
    if ts.nanos == 0 {
        ts.secs.to_string().into_bytes()
    } else if ts.secs < 0 {
        // `nanos` adds to `secs`, so the decimal rendering gives the
        // borrowed second back.
        let whole = ts.secs + 1;
        let frac = 1_000_000_000 - ts.nanos;
        if whole == 0 {
            format!("-0.{frac:09}").into_bytes()
        } else {
            format!("{whole}.{frac:09}").into_bytes()
        }
    } else {
        format!("{}.{:09}", ts.secs, ts.nanos).into_bytes()
    }
}

impl TarWriter {
    /// pax records this entry needs beyond the fixed ustar fields.
    fn pax_records_for(&self, entry: &Entry, name: &[u8], size: u64) -> Vec<Vec<u8>> {
        let mut records = Vec::new();
        if split_ustar_name(name).is_none() {
            records.push(pax_record("path", name));
        }
        if let Some(target) = entry.link_target() {
            if target.len() > 100 {
                records.push(pax_record("linkpath", target));
            }
        }
        if size > OCTAL_SIZE_MAX {
            records.push(pax_record("size", size.to_string().as_bytes()));
        }
        if entry.uid() > OCTAL_ID_MAX {
            records.push(pax_record("uid", entry.uid().to_string().as_bytes()));
        }
        if entry.gid() > OCTAL_ID_MAX {
            records.push(pax_record("gid", entry.gid().to_string().as_bytes()));
        }
        if let Some(uname) = entry.uname() {
            if uname.len() > 31 {
                records.push(pax_record("uname", uname));
            }
        }
        if let Some(gname) = entry.gname() {
            if gname.len() > 31 {
                records.push(pax_record("gname", gname));
            }
        }
        if let Some(mtime) = entry.mtime() {
            if mtime.has_subsecond() || mtime.secs < 0 || mtime.secs as u64 > OCTAL_SIZE_MAX {
                records.push(pax_record("mtime", &format_pax_time(mtime)));
            }
        }
        if let Some(atime) = entry.atime() {
            records.push(pax_record("atime", &format_pax_time(atime)));
        }
        if let Some(ctime) = entry.ctime() {
            records.push(pax_record("ctime", &format_pax_time(ctime)));
        }
        if let Some(birthtime) = entry.birthtime() {
            records.push(pax_record(
                "LIBARCHIVE.creationtime",
                &format_pax_time(birthtime),
            ));
        }
        for (key, value) in entry.sidecars() {
            let pax_key = match key.namespace {
                SidecarNamespace::Xattr => format!("SCHILY.xattr.{}", key.name),
                // ACL, fflags, and format-private blobs keep the pax key
                // they were read under.
                _ => key.name.to_string(),
            };
            records.push(pax_record(&pax_key, value));
        }
        records
    }

    fn build_header(
        &self,
        entry: &Entry,
        typeflag: u8,
        name: &[u8],
        size: u64,
    ) -> Result<[u8; BLOCK]> {
        let mut block = [0u8; BLOCK];
        let (prefix, short_name) = split_ustar_name(name).unwrap_or((&[], &name[..name.len().min(100)]));
        block[..short_name.len()].copy_from_slice(short_name);
        block[345..345 + prefix.len()].copy_from_slice(prefix);
        put_octal(&mut block[100..108], u64::from(entry.mode()));
        put_octal(&mut block[108..116], entry.uid().min(OCTAL_ID_MAX));
        put_octal(&mut block[116..124], entry.gid().min(OCTAL_ID_MAX));
        put_octal(&mut block[124..136], size.min(OCTAL_SIZE_MAX));
        let mtime = entry.mtime().map_or(0, |ts| ts.secs.max(0) as u64);
        put_octal(&mut block[136..148], mtime.min(OCTAL_SIZE_MAX));
        block[156] = typeflag;
        if let Some(target) = entry.link_target() {
            let len = target.len().min(100);
            block[157..157 + len].copy_from_slice(&target[..len]);
        }
        block[257..263].copy_from_slice(b"ustar\0");
        block[263..265].copy_from_slice(b"00");
        if let Some(uname) = entry.uname() {
            let len = uname.len().min(31);
            block[265..265 + len].copy_from_slice(&uname[..len]);
        }
        if let Some(gname) = entry.gname() {
            let len = gname.len().min(31);
            block[297..297 + len].copy_from_slice(&gname[..len]);
        }
        if let Some((major, minor)) = entry.rdev() {
            put_octal(&mut block[329..337], u64::from(major));
            put_octal(&mut block[337..345], u64::from(minor));
        }
        // Checksum over the block with the checksum field as spaces.
        block[148..156].fill(b' ');
        let sum: u64 = block.iter().map(|&b| u64::from(b)).sum();
        let text = format!("{sum:06o}");
        block[148..154].copy_from_slice(text.as_bytes());
        block[154] = 0;
        block[155] = b' ';
        Ok(block)
    }

    fn pax_header_name(&self, name: &[u8]) -> Vec<u8> {
        let mut pseudo = format!("PaxHeaders/{}", self.seq).into_bytes();
        pseudo.push(b'/');
        let room = 100usize.saturating_sub(pseudo.len());
        let tail = &name[name.len().saturating_sub(room)..];
        pseudo.extend_from_slice(tail);
        pseudo.truncate(100);
        pseudo
    }
}

impl FormatWriter for TarWriter {
    fn write_header(&mut self, sink: &mut dyn Write, entry: &Entry) -> Result<()> {
        let typeflag = typeflag_for(entry.kind())?;
        let size = if entry.kind().carries_payload() {
            entry.size().ok_or_else(|| {
                Error::misuse("tar entries need a declared size before payload writes")
            })?
        } else {
            0
        };
        let mut name = entry.path().to_vec();
        if entry.kind() == EntryKind::Directory && name.last() != Some(&b'/') {
            name.push(b'/');
        }

        let records = match self.variant {
            TarVariant::Pax => self.pax_records_for(entry, &name, size),
            TarVariant::Ustar => {
                if split_ustar_name(&name).is_none() {
                    return Err(Error::unsupported(format!(
                        "ustar cannot store the {} byte path {:?}",
                        name.len(),
                        name.as_bstr()
                    )));
                }
                if entry.link_target().map_or(false, |t| t.len() > 100) {
                    return Err(Error::unsupported("ustar link target exceeds 100 bytes"));
                }
                if size > OCTAL_SIZE_MAX {
                    return Err(Error::unsupported(format!(
                        "ustar size field cannot hold {size} bytes"
                    )));
                }
                if entry.uid() > OCTAL_ID_MAX || entry.gid() > OCTAL_ID_MAX {
                    return Err(Error::unsupported("ustar uid/gid exceeds octal field width"));
                }
                Vec::new()
            }
        };

        if !records.is_empty() {
            let body: Vec<u8> = records.concat();
            let pseudo_name = self.pax_header_name(&name);
            let pseudo = Entry::new(pseudo_name, EntryKind::Regular).with_mode(0o644);
            let header = self.build_header(&pseudo, b'x', pseudo.path(), body.len() as u64)?;
            sink.write_all(&header)
                .and_then(|()| sink.write_all(&body))
                .and_then(|()| {
                    let pad = block_padding(body.len() as u64) as usize;
                    sink.write_all(&vec![0u8; pad])
                })
                .map_err(|err| Error::io(err, "tar: writing pax records"))?;
            self.seq += 1;
        }

        let header = self.build_header(entry, typeflag, &name, size)?;
        sink.write_all(&header)
            .map_err(|err| Error::io(err, "tar: writing entry header"))
    }

    fn write_data(&mut self, sink: &mut dyn Write, buf: &[u8]) -> Result<()> {
        sink.write_all(buf)
            .map_err(|err| Error::io(err, "tar: writing entry payload"))
    }

    fn finish_entry(&mut self, sink: &mut dyn Write, written: u64) -> Result<()> {
        let pad = block_padding(written) as usize;
        sink.write_all(&vec![0u8; pad])
            .map_err(|err| Error::io(err, "tar: writing block padding"))
    }

    fn finish(&mut self, sink: &mut dyn Write) -> Result<()> {
        sink.write_all(&[0u8; BLOCK * 2])
            .map_err(|err| Error::io(err, "tar: writing end-of-archive blocks"))
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

    fn write_simple(variant: TarVariant, entry: &Entry, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut writer = TarWriter::new(variant);
        writer.write_header(&mut out, entry).unwrap();
        writer.write_data(&mut out, payload).unwrap();
        writer.finish_entry(&mut out, payload.len() as u64).unwrap();
        writer.finish(&mut out).unwrap();
        out
    }

    #[test]
    fn ustar_header_round_trips() {
        let entry = Entry::file("hello.txt", 5)
            .with_mode(0o640)
            .with_owner(1000, 100)
            .with_owner_names(Some("alice"), Some("users"))
            .with_mtime(Timestamp::from_secs(1_600_000_000));
        let bytes = write_simple(TarVariant::Ustar, &entry, b"hello");
        assert_eq!(bytes.len() % BLOCK, 0);

        let mut stream = lookahead(bytes);
        assert!(bid(&mut stream).unwrap() > 0);
        let mut reader = open();
        let decoded = reader.next_entry(&mut stream).unwrap().unwrap();
        assert_eq!(decoded.path(), &BString::from("hello.txt"));
        assert_eq!(decoded.size(), Some(5));
        assert_eq!(decoded.mode(), 0o640);
        assert_eq!(decoded.uname().unwrap(), &BString::from("alice"));
        let mut buf = [0u8; 16];
        assert_eq!(
            reader.next_block(&mut stream, &mut buf).unwrap(),
            PayloadBlock::Data(5)
        );
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(
            reader.next_block(&mut stream, &mut buf).unwrap(),
            PayloadBlock::End
        );
        reader.finish_entry(&mut stream).unwrap();
        assert!(reader.next_entry(&mut stream).unwrap().is_none());
    }

    #[test]
    fn directory_names_come_back_without_the_slash() {
        let bytes = write_simple(TarVariant::Ustar, &Entry::directory("pkg"), b"");
        let mut stream = lookahead(bytes);
        let mut reader = open();
        let decoded = reader.next_entry(&mut stream).unwrap().unwrap();
        assert_eq!(decoded.path(), &BString::from("pkg"));
        assert_eq!(decoded.kind(), EntryKind::Directory);
    }

    #[test]
    fn pax_records_carry_long_paths_and_subseconds() {
        let long_path: String = "very/".repeat(40) + "deep.txt";
        let entry = Entry::file(long_path.as_str(), 3)
            .with_mtime(Timestamp::new(1_600_000_000, 123_456_789))
            .with_sidecar(SidecarKey::xattr("user.origin"), &b"test"[..]);
        let bytes = write_simple(TarVariant::Pax, &entry, b"pax");

        let mut stream = lookahead(bytes);
        let mut reader = open();
        let decoded = reader.next_entry(&mut stream).unwrap().unwrap();
        assert_eq!(decoded.path(), &BString::from(long_path));
        assert_eq!(decoded.mtime(), Some(Timestamp::new(1_600_000_000, 123_456_789)));
        assert_eq!(
            decoded.sidecar(&SidecarKey::xattr("user.origin")).unwrap(),
            &Bytes::from_static(b"test")
        );
    }

    #[test]
    fn pre_epoch_subsecond_mtimes_survive_pax() {
        // 1.5 s before the epoch: secs floored, nanos adding back up.
        let ts = Timestamp::new(-2, 500_000_000);
        assert_eq!(format_pax_time(ts), b"-1.500000000");
        assert_eq!(parse_pax_time(b"-1.500000000").unwrap(), ts);
        assert_eq!(
            parse_pax_time(b"-0.000000001").unwrap(),
            Timestamp::new(-1, 999_999_999)
        );

        let entry = Entry::file("old", 0).with_mtime(ts);
        let bytes = write_simple(TarVariant::Pax, &entry, b"");
        let mut stream = lookahead(bytes);
        let mut reader = open();
        let decoded = reader.next_entry(&mut stream).unwrap().unwrap();
        assert_eq!(decoded.mtime(), Some(ts));
    }

    #[test]
    fn ustar_rejects_what_it_cannot_hold() {
        let long_segment = "x".repeat(120);
        let entry = Entry::file(long_segment.as_str(), 0);
        let mut writer = TarWriter::new(TarVariant::Ustar);
        let err = writer.write_header(&mut Vec::new(), &entry).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::UnsupportedEntryKind);

        let socket = Entry::new("sock", EntryKind::Socket);
        let mut writer = TarWriter::new(TarVariant::Pax);
        let err = writer.write_header(&mut Vec::new(), &socket).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::UnsupportedEntryKind);
    }

    #[test]
    fn checksum_mismatch_is_corrupt() {
        let entry = Entry::file("a", 0);
        let mut bytes = write_simple(TarVariant::Ustar, &entry, b"");
        bytes[0] ^= 0xff;
        let mut stream = lookahead(bytes);
        let mut reader = open();
        let err = reader.next_entry(&mut stream).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::CorruptHeader);
    }

    #[test]
    fn old_gnu_sparse_yields_holes() {
        // Hand-build an old-GNU sparse member: 1 KiB of data at logical
        // offset 4096, real size 8192.
        let mut block = [0u8; BLOCK];
        block[..6].copy_from_slice(b"sparse");
        put_octal(&mut block[100..108], 0o644);
        put_octal(&mut block[108..116], 0);
        put_octal(&mut block[116..124], 0);
        put_octal(&mut block[124..136], 1024); // stored bytes
        put_octal(&mut block[136..148], 0);
        block[156] = b'S';
        block[257..263].copy_from_slice(b"ustar\0");
        block[263..265].copy_from_slice(b"00");
        put_octal(&mut block[386..398], 4096); // region offset
        put_octal(&mut block[398..410], 1024); // region length
        put_octal(&mut block[483..495], 8192); // realsize
        block[148..156].fill(b' ');
        let sum: u64 = block.iter().map(|&b| u64::from(b)).sum();
        block[148..154].copy_from_slice(format!("{sum:06o}").as_bytes());
        block[154] = 0;
        block[155] = b' ';

        let mut bytes = block.to_vec();
        bytes.extend_from_slice(&vec![7u8; 1024]);
        bytes.extend_from_slice(&[0u8; BLOCK * 2]);

        let mut stream = lookahead(bytes);
        let mut reader = open();
        let entry = reader.next_entry(&mut stream).unwrap().unwrap();
        assert_eq!(entry.size(), Some(8192));

        let mut buf = [0u8; 2048];
        assert_eq!(
            reader.next_block(&mut stream, &mut buf).unwrap(),
            PayloadBlock::Hole(4096)
        );
        let mut data = 0;
        loop {
            match reader.next_block(&mut stream, &mut buf).unwrap() {
                PayloadBlock::Data(n) => {
                    assert!(buf[..n].iter().all(|&b| b == 7));
                    data += n;
                }
                PayloadBlock::Hole(gap) => {
                    assert_eq!(gap, 8192 - 4096 - 1024);
                    break;
                }
                PayloadBlock::End => panic!("hole expected before end"),
            }
        }
        assert_eq!(data, 1024);
        assert_eq!(
            reader.next_block(&mut stream, &mut buf).unwrap(),
            PayloadBlock::End
        );
    }

    #[test]
    fn truncated_header_is_a_short_read() {
        let entry = Entry::file("a", 0);
        let mut bytes = write_simple(TarVariant::Ustar, &entry, b"");
        bytes.truncate(100);
        let mut stream = lookahead(bytes);
        let mut reader = open();
        let err = reader.next_entry(&mut stream).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ShortRead);
    }
}
