//! Digest capability consumed by formats that embed checksums.
//!
//! zip verifies CRC-32 over decompressed payloads; mtree emits
//! `sha256digest=` keywords. Both go through this one handle keyed by
//! algorithm so format code never names a hash implementation directly.

use sha2::{Digest, Sha256};

/// Supported digest algorithms.
///
/// CRC-32 rides on flate2 and is only present when the `gzip` feature is
/// enabled; without it, zip skips checksum verification the same way the
/// original system does when built without zlib.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestKind {
    Sha256,
    #[cfg(feature = "gzip")]
    Crc32,
}

impl DigestKind {
    /// Algorithm label used in listings (mtree keyword prefixes).
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            #[cfg(feature = "gzip")]
            Self::Crc32 => "crc32",
        }
    }

    /// Digest length in bytes.
    #[must_use]
    pub fn output_len(self) -> usize {
        match self {
            Self::Sha256 => 32,
            #[cfg(feature = "gzip")]
            Self::Crc32 => 4,
        }
    }
}

/// Incremental digest handle.
pub struct Digester {
    inner: Inner,
}

enum Inner {
    Sha256(Box<Sha256>),
    #[cfg(feature = "gzip")]
    Crc32(flate2::Crc),
}

impl Digester {
    /// Start a new digest of the given kind.
    #[must_use]
    pub fn new(kind: DigestKind) -> Self {
        let inner = match kind {
            DigestKind::Sha256 => Inner::Sha256(Box::new(Sha256::new())),
            #[cfg(feature = "gzip")]
            DigestKind::Crc32 => Inner::Crc32(flate2::Crc::new()),
        };
        Self { inner }
    }

    /// Feed payload bytes.
    pub fn update(&mut self, bytes: &[u8]) {
        match &mut self.inner {
            Inner::Sha256(hasher) => hasher.update(bytes),
            #[cfg(feature = "gzip")]
            Inner::Crc32(crc) => crc.update(bytes),
        }
    }

    /// Finish and return the digest bytes (big-endian for CRC-32).
    #[must_use]
    pub fn finish(self) -> Vec<u8> {
        match self.inner {
            Inner::Sha256(hasher) => hasher.finalize().to_vec(),
            #[cfg(feature = "gzip")]
            Inner::Crc32(crc) => crc.sum().to_be_bytes().to_vec(),
        }
    }

    /// Finish and hex-encode, as mtree keyword values expect.
    #[must_use]
    pub fn finish_hex(self) -> String {
        hex::encode(self.finish())
    }
}

impl std::fmt::Debug for Digester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self.inner {
            Inner::Sha256(_) => "sha256",
            #[cfg(feature = "gzip")]
            Inner::Crc32(_) => "crc32",
        };
        f.debug_struct("Digester").field("kind", &label).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_matches_known_vector() {
        let mut digester = Digester::new(DigestKind::Sha256);
        digester.update(b"abc");
        assert_eq!(
            digester.finish_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn incremental_updates_match_one_shot() {
        let mut split = Digester::new(DigestKind::Sha256);
        split.update(b"hello ");
        split.update(b"world");
        let mut whole = Digester::new(DigestKind::Sha256);
        whole.update(b"hello world");
        assert_eq!(split.finish(), whole.finish());
    }

    #[cfg(feature = "gzip")]
    #[test]
    fn crc32_matches_known_vector() {
        // CRC-32 of "123456789" is the classic check value 0xCBF43926.
        let mut digester = Digester::new(DigestKind::Crc32);
        digester.update(b"123456789");
        assert_eq!(digester.finish(), 0xCBF4_3926_u32.to_be_bytes().to_vec());
    }
}
