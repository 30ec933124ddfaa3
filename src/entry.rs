//! The uniform entry model every format decodes into and encodes from.

use std::collections::BTreeMap;
use std::fmt;

use bstr::{BString, ByteSlice};
use bytes::Bytes;

use crate::sidecar::{SidecarKey, SidecarNamespace};

/// What kind of filesystem object an entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Regular,
    Directory,
    Symlink,
    Hardlink,
    Fifo,
    CharDevice,
    BlockDevice,
    Socket,
}

impl EntryKind {
    /// Stable lower-case label used in listings and error messages.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Regular => "file",
            Self::Directory => "dir",
            Self::Symlink => "symlink",
            Self::Hardlink => "hardlink",
            Self::Fifo => "fifo",
            Self::CharDevice => "chardev",
            Self::BlockDevice => "blockdev",
            Self::Socket => "socket",
        }
    }

    /// Whether entries of this kind may carry payload bytes.
    ///
    /// Hardlinks are included because some formats (cpio) attach the file
    /// data to the last link of a set.
    #[must_use]
    pub fn carries_payload(self) -> bool {
        matches!(self, Self::Regular | Self::Hardlink)
    }

    /// The `S_IFMT` bits for this kind.
    #[must_use]
    pub fn unix_file_type(self) -> u32 {
        match self {
            Self::Regular | Self::Hardlink => 0o100000,
            Self::Directory => 0o040000,
            Self::Symlink => 0o120000,
            Self::Fifo => 0o010000,
            Self::CharDevice => 0o020000,
            Self::BlockDevice => 0o060000,
            Self::Socket => 0o140000,
        }
    }

    /// Classify from `S_IFMT` bits; unknown values map to `Regular`.
    #[must_use]
    pub fn from_unix_file_type(mode: u32) -> Self {
        match mode & 0o170000 {
            0o040000 => Self::Directory,
            0o120000 => Self::Symlink,
            0o010000 => Self::Fifo,
            0o020000 => Self::CharDevice,
            0o060000 => Self::BlockDevice,
            0o140000 => Self::Socket,
            _ => Self::Regular,
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A point in time with nanosecond precision.
///
/// Formats with coarser clocks round to their nearest representable value
/// on write; they never drop a known timestamp to zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    pub secs: i64,
    pub nanos: u32,
}

impl Timestamp {
    /// Whole-second timestamp.
    #[must_use]
    pub fn from_secs(secs: i64) -> Self {
        Self { secs, nanos: 0 }
    }

    /// Timestamp with a sub-second component; `nanos` must be < 1e9.
    #[must_use]
    pub fn new(secs: i64, nanos: u32) -> Self {
        debug_assert!(nanos < 1_000_000_000);
        Self { secs, nanos }
    }

    /// Whether the sub-second component is non-zero.
    #[must_use]
    pub fn has_subsecond(self) -> bool {
        self.nanos != 0
    }
}

/// Uniform metadata record for one archive member.
///
/// Decoders build these when they parse an entry header; the instance is
/// immutable once yielded. On write, callers construct one (builder
/// style, like the options types elsewhere in this crate) and the encoder
/// consumes it when the header is flushed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    path: BString,
    kind: EntryKind,
    size: Option<u64>,
    mode: u32,
    uid: u64,
    gid: u64,
    uname: Option<BString>,
    gname: Option<BString>,
    mtime: Option<Timestamp>,
    atime: Option<Timestamp>,
    ctime: Option<Timestamp>,
    birthtime: Option<Timestamp>,
    link_target: Option<BString>,
    rdev: Option<(u32, u32)>,
    sidecar: BTreeMap<SidecarKey, Bytes>,
}

impl Entry {
    /// New entry of an arbitrary kind with default metadata.
    #[must_use]
    pub fn new(path: impl Into<BString>, kind: EntryKind) -> Self {
        Self {
            path: path.into(),
            kind,
            size: None,
            mode: match kind {
                EntryKind::Directory => 0o755,
                EntryKind::Symlink => 0o777,
                _ => 0o644,
            },
            uid: 0,
            gid: 0,
            uname: None,
            gname: None,
            mtime: None,
            atime: None,
            ctime: None,
            birthtime: None,
            link_target: None,
            rdev: None,
            sidecar: BTreeMap::new(),
        }
    }

    /// Regular file with a declared payload size.
    #[must_use]
    pub fn file(path: impl Into<BString>, size: u64) -> Self {
        Self::new(path, EntryKind::Regular).with_size(size)
    }

    /// Directory entry (no payload).
    #[must_use]
    pub fn directory(path: impl Into<BString>) -> Self {
        Self::new(path, EntryKind::Directory)
    }

    /// Symlink entry pointing at `target`.
    #[must_use]
    pub fn symlink(path: impl Into<BString>, target: impl Into<BString>) -> Self {
        Self::new(path, EntryKind::Symlink).with_link_target(target)
    }

    /// Hardlink entry pointing at an earlier `target` path.
    #[must_use]
    pub fn hardlink(path: impl Into<BString>, target: impl Into<BString>) -> Self {
        Self::new(path, EntryKind::Hardlink)
            .with_link_target(target)
            .with_size(0)
    }

    /// Declare the payload size.
    #[must_use]
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// Mark the payload size unknown (streaming-trailer formats only).
    #[must_use]
    pub fn with_unknown_size(mut self) -> Self {
        self.size = None;
        self
    }

    /// Set permission bits (the `07777` portion; kind carries the type).
    #[must_use]
    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode & 0o7777;
        self
    }

    /// Set numeric owner ids.
    #[must_use]
    pub fn with_owner(mut self, uid: u64, gid: u64) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    /// Set symbolic owner names.
    #[must_use]
    pub fn with_owner_names(
        mut self,
        uname: Option<impl Into<BString>>,
        gname: Option<impl Into<BString>>,
    ) -> Self {
        self.uname = uname.map(Into::into);
        self.gname = gname.map(Into::into);
        self
    }

    /// Set the modification time.
    #[must_use]
    pub fn with_mtime(mut self, mtime: Timestamp) -> Self {
        self.mtime = Some(mtime);
        self
    }

    /// Set the access time.
    #[must_use]
    pub fn with_atime(mut self, atime: Timestamp) -> Self {
        self.atime = Some(atime);
        self
    }

    /// Set the inode-change time.
    #[must_use]
    pub fn with_ctime(mut self, ctime: Timestamp) -> Self {
        self.ctime = Some(ctime);
        self
    }

    /// Set the creation time.
    #[must_use]
    pub fn with_birthtime(mut self, birthtime: Timestamp) -> Self {
        self.birthtime = Some(birthtime);
        self
    }

    /// Set the symlink/hardlink target.
    #[must_use]
    pub fn with_link_target(mut self, target: impl Into<BString>) -> Self {
        self.link_target = Some(target.into());
        self
    }

    /// Set device major/minor numbers.
    #[must_use]
    pub fn with_rdev(mut self, major: u32, minor: u32) -> Self {
        self.rdev = Some((major, minor));
        self
    }

    /// Attach a capability-tagged sidecar blob.
    #[must_use]
    pub fn with_sidecar(mut self, key: SidecarKey, value: impl Into<Bytes>) -> Self {
        self.sidecar.insert(key, value.into());
        self
    }

    pub(crate) fn set_path(&mut self, path: impl Into<BString>) {
        self.path = path.into();
    }

    pub(crate) fn set_size(&mut self, size: Option<u64>) {
        self.size = size;
    }

    pub(crate) fn set_link_target(&mut self, target: impl Into<BString>) {
        self.link_target = Some(target.into());
    }

    pub(crate) fn set_kind(&mut self, kind: EntryKind) {
        self.kind = kind;
    }

    pub(crate) fn insert_sidecar(&mut self, key: SidecarKey, value: impl Into<Bytes>) {
        self.sidecar.insert(key, value.into());
    }

    /// Entry path as raw bytes (not assumed valid UTF-8).
    #[must_use]
    pub fn path(&self) -> &BString {
        &self.path
    }

    /// The entry kind.
    #[must_use]
    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    /// Declared payload size; `None` means unknown until the trailer.
    #[must_use]
    pub fn size(&self) -> Option<u64> {
        self.size
    }

    /// Permission bits.
    #[must_use]
    pub fn mode(&self) -> u32 {
        self.mode
    }

    /// Full unix mode word: `S_IFMT` bits for the kind plus permissions.
    #[must_use]
    pub fn unix_mode(&self) -> u32 {
        self.kind.unix_file_type() | self.mode
    }

    /// Numeric owner id.
    #[must_use]
    pub fn uid(&self) -> u64 {
        self.uid
    }

    /// Numeric group id.
    #[must_use]
    pub fn gid(&self) -> u64 {
        self.gid
    }

    /// Symbolic owner name, when the format carried one.
    #[must_use]
    pub fn uname(&self) -> Option<&BString> {
        self.uname.as_ref()
    }

    /// Symbolic group name, when the format carried one.
    #[must_use]
    pub fn gname(&self) -> Option<&BString> {
        self.gname.as_ref()
    }

    /// Modification time.
    #[must_use]
    pub fn mtime(&self) -> Option<Timestamp> {
        self.mtime
    }

    /// Access time.
    #[must_use]
    pub fn atime(&self) -> Option<Timestamp> {
        self.atime
    }

    /// Inode-change time.
    #[must_use]
    pub fn ctime(&self) -> Option<Timestamp> {
        self.ctime
    }

    /// Creation time.
    #[must_use]
    pub fn birthtime(&self) -> Option<Timestamp> {
        self.birthtime
    }

    /// Symlink or hardlink target.
    #[must_use]
    pub fn link_target(&self) -> Option<&BString> {
        self.link_target.as_ref()
    }

    /// Device numbers for device-node entries.
    #[must_use]
    pub fn rdev(&self) -> Option<(u32, u32)> {
        self.rdev
    }

    /// Look up one sidecar blob.
    #[must_use]
    pub fn sidecar(&self, key: &SidecarKey) -> Option<&Bytes> {
        self.sidecar.get(key)
    }

    /// Iterate sidecar blobs in deterministic (namespace, name) order.
    pub fn sidecars(&self) -> impl Iterator<Item = (&SidecarKey, &Bytes)> {
        self.sidecar.iter()
    }

    /// Iterate the sidecar blobs of one namespace.
    pub fn sidecars_in(
        &self,
        namespace: SidecarNamespace,
    ) -> impl Iterator<Item = (&SidecarKey, &Bytes)> {
        self.sidecar
            .iter()
            .filter(move |(key, _)| key.namespace == namespace)
    }

    /// Whether the kind admits payload bytes at all.
    #[must_use]
    pub fn carries_payload(&self) -> bool {
        self.kind.carries_payload()
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.path.as_bstr())?;
        match self.size {
            Some(size) => write!(f, " {size}")?,
            None => write!(f, " ?")?,
        }
        if let Some(target) = &self.link_target {
            write!(f, " -> {}", target.as_bstr())?;
        }
        Ok(())
    }
}
