//! Capability-tagged sidecar metadata and the platform attribute seam.
//!
//! Formats that carry extended metadata (pax xattr records, ACL text,
//! BSD file flags, format-private fields) surface it as opaque blobs
//! keyed by a namespace plus a name. The core never interprets blob
//! contents; applying them to a filesystem is the job of a platform
//! provider implementing the traits below.

use std::fmt;

use bstr::{BString, ByteSlice};
use bytes::Bytes;

use crate::error::Result;

/// Namespace a sidecar blob belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SidecarNamespace {
    /// Extended attributes (`SCHILY.xattr.*` and friends).
    Xattr,
    /// Access-control lists, kept in the producing format's text form.
    Acl,
    /// BSD-style file flags (`SCHILY.fflags`).
    FileFlags,
    /// Format-private keys that have no cross-format meaning.
    Format,
}

impl SidecarNamespace {
    /// Stable label used in diagnostics.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Xattr => "xattr",
            Self::Acl => "acl",
            Self::FileFlags => "fflags",
            Self::Format => "format",
        }
    }
}

impl fmt::Display for SidecarNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Key of one sidecar blob: namespace plus the name within it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SidecarKey {
    pub namespace: SidecarNamespace,
    pub name: BString,
}

impl SidecarKey {
    /// Build a key from a namespace and a byte name.
    #[must_use]
    pub fn new(namespace: SidecarNamespace, name: impl Into<BString>) -> Self {
        Self {
            namespace,
            name: name.into(),
        }
    }

    /// Shorthand for an extended-attribute key.
    #[must_use]
    pub fn xattr(name: impl Into<BString>) -> Self {
        Self::new(SidecarNamespace::Xattr, name)
    }
}

impl fmt::Display for SidecarKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.name.as_bstr())
    }
}

/// Read-side capability: a platform provider the caller hands in when it
/// wants filesystem attributes collected into sidecar blobs.
pub trait AttributeSource {
    /// Fetch one attribute; `Ok(None)` when the attribute is absent.
    fn get(&self, path: &[u8], namespace: SidecarNamespace, name: &[u8])
        -> Result<Option<Bytes>>;

    /// List the attribute names present under a namespace.
    fn list(&self, path: &[u8], namespace: SidecarNamespace) -> Result<Vec<BString>>;
}

/// Write-side capability: applies sidecar blobs to a filesystem object.
pub trait AttributeSink {
    /// Apply one attribute blob.
    fn set(
        &mut self,
        path: &[u8],
        namespace: SidecarNamespace,
        name: &[u8],
        value: &[u8],
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_order_by_namespace_then_name() {
        let a = SidecarKey::new(SidecarNamespace::Xattr, "user.a");
        let b = SidecarKey::new(SidecarNamespace::Xattr, "user.b");
        let c = SidecarKey::new(SidecarNamespace::Format, "cpio.ino");
        assert!(a < b);
        assert!(a < c, "xattr namespace sorts before format namespace");
    }

    #[test]
    fn display_is_namespace_qualified() {
        let key = SidecarKey::xattr("user.mime_type");
        assert_eq!(key.to_string(), "xattr:user.mime_type");
    }
}
