//! arcmux: a streaming multi-format archive codec.
//!
//! One read API and one write API over several container formats (tar,
//! cpio, zip, ar, mtree, WARC) and compression filters (gzip, bzip2,
//! xz, zstd, lz4, compress, uuencode/base64). On read, nothing is
//! named up front: filters and format are detected by bidding over the
//! stream prefix, so a `cpio.gz.uu` pipe opens the same way a plain
//! tar file does. On write, the caller picks the format and filter
//! chain explicitly.
//!
//! ```no_run
//! use arcmux::{Entry, ReadOptions, ReadSession, WriteOptions, WriteSession};
//!
//! # fn main() -> arcmux::Result<()> {
//! let file = std::fs::File::open("backup.tar.gz")
//!     .map_err(|e| arcmux::Error::io(e, "opening backup"))?;
//! let mut session = ReadSession::from_seekable(file, &ReadOptions::default())?;
//! while let Some(entry) = session.next_entry()? {
//!     println!("{entry}");
//! }
//!
//! let mut out = WriteSession::new(Vec::new(), &WriteOptions::new())?;
//! out.write_entry(&Entry::file("hello.txt", 5), b"hello")?;
//! out.finish()?;
//! # Ok(())
//! # }
//! ```
//!
//! Everything is streaming: input needs only forward reads (seekable
//! sources just skip faster), output needs only [`std::io::Write`],
//! and payloads move through caller-sized buffers. Sparse tar entries
//! surface their holes; zip descriptors are verified as the stream
//! passes; metadata rides a uniform [`Entry`] model with lossy-format
//! round-tripping to the nearest representable value.

pub mod digest;
pub mod entry;
pub mod error;
pub(crate) mod filter;
pub(crate) mod format;
pub mod io;
pub mod read;
pub mod sidecar;
pub mod write;

pub use entry::{Entry, EntryKind, Timestamp};
pub use error::{Error, ErrorKind, Result};
pub use filter::FilterKind;
pub use format::{CpioVariant, FormatKind, PayloadBlock, TarVariant, ZipMethod};
pub use read::{ReadOptions, ReadSession};
pub use write::{WriteOptions, WriteSession};
