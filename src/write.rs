//! The write session: format selection, an explicit filter chain, and
//! the entry-by-entry encode state machine.

use std::io::Write;

use log::debug;

use crate::entry::Entry;
use crate::error::Error;
use crate::filter::{self, FilterKind, SinkStack};
use crate::format::ar::ArWriter;
use crate::format::cpio::{CpioVariant, CpioWriter};
use crate::format::mtree::MtreeWriter;
use crate::format::raw::RawWriter;
use crate::format::tar::{TarVariant, TarWriter};
use crate::format::warc::WarcWriter;
use crate::format::zip::{ZipMethod, ZipWriter};
use crate::format::{FormatKind, FormatWriter};
use crate::Result;

/// What a write session produces.
///
/// There is no bidding on the encode side: the caller names the format
/// and, when wanted, the filter chain (outermost stage first).
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    format: Option<FormatKind>,
    filters: Vec<FilterKind>,
    tar_variant: TarVariant,
    cpio_variant: CpioVariant,
    zip_method: ZipMethod,
}

impl WriteOptions {
    /// Start from the defaults: pax tar, no filters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Select the container format (default tar).
    #[must_use]
    pub fn with_format(mut self, format: FormatKind) -> Self {
        self.format = Some(format);
        self
    }

    /// Compress the output through these stages, outermost first.
    #[must_use]
    pub fn with_filters(mut self, filters: impl Into<Vec<FilterKind>>) -> Self {
        self.filters = filters.into();
        self
    }

    /// Pick the tar dialect (default pax).
    #[must_use]
    pub fn with_tar_variant(mut self, variant: TarVariant) -> Self {
        self.tar_variant = variant;
        self
    }

    /// Pick the cpio dialect (default newc).
    #[must_use]
    pub fn with_cpio_variant(mut self, variant: CpioVariant) -> Self {
        self.cpio_variant = variant;
        self
    }

    /// Pick the zip entry compression (default deflate when built in).
    #[must_use]
    pub fn with_zip_method(mut self, method: ZipMethod) -> Self {
        self.zip_method = method;
        self
    }

    fn build_writer(&self) -> Result<Box<dyn FormatWriter>> {
        Ok(match self.format.unwrap_or(FormatKind::Tar) {
            FormatKind::Tar => Box::new(TarWriter::new(self.tar_variant)),
            FormatKind::Cpio => Box::new(CpioWriter::new(self.cpio_variant)),
            FormatKind::Zip => Box::new(ZipWriter::new(self.zip_method)),
            FormatKind::Ar => Box::new(ArWriter::new()),
            FormatKind::Mtree => Box::new(MtreeWriter::new()),
            FormatKind::Warc => Box::new(WarcWriter::new()),
            FormatKind::Raw => Box::new(RawWriter::new()),
            FormatKind::Empty => {
                return Err(Error::misuse(
                    "the empty pseudo-format is a detection result, not a write target",
                ))
            }
        })
    }
}

#[derive(Clone, Copy)]
enum WriteState {
    Idle,
    InEntry { declared: Option<u64>, written: u64 },
}

/// Streaming archive writer.
///
/// The caller opens each entry with [`write_header`](Self::write_header),
/// streams its payload, and closes it with
/// [`finish_entry`](Self::finish_entry); [`finish`](Self::finish)
/// consumes the session, writes the archive trailer, and flushes every
/// filter stage down to the sink. Payload byte counts are checked
/// against the entry's declared size on both sides.
///
/// After any error the session is parked and replays the failure, since
/// the sink may hold a half-written header.
pub struct WriteSession {
    sink: Option<SinkStack>,
    writer: Box<dyn FormatWriter>,
    state: WriteState,
    fault: Option<Error>,
}

impl WriteSession {
    /// Open a session writing into `sink` through the configured
    /// filter chain.
    pub fn new<W: Write + Send + 'static>(sink: W, options: &WriteOptions) -> Result<Self> {
        let writer = options.build_writer()?;
        let stack = filter::assemble_encode_chain(sink, &options.filters)?;
        debug!(
            "write session open: format {} behind {} filter stage(s)",
            options.format.unwrap_or(FormatKind::Tar),
            options.filters.len()
        );
        Ok(Self {
            sink: Some(stack),
            writer,
            state: WriteState::Idle,
            fault: None,
        })
    }

    /// Open the next entry. Non-payload kinds are declared at zero
    /// bytes; a payload kind with no declared size streams unbounded
    /// (formats that need the size up front reject it here).
    pub fn write_header(&mut self, entry: &Entry) -> Result<()> {
        self.guard()?;
        if matches!(self.state, WriteState::InEntry { .. }) {
            return Err(Error::misuse(
                "write_header called with the previous entry still open",
            ));
        }
        let declared = if entry.carries_payload() {
            entry.size()
        } else {
            Some(0)
        };
        let Some(sink) = self.sink.as_mut() else {
            return Err(Error::misuse("write session already finished"));
        };
        let result = self.writer.write_header(sink, entry);
        self.park(result)?;
        self.state = WriteState::InEntry {
            declared,
            written: 0,
        };
        Ok(())
    }

    /// Append payload bytes to the open entry.
    pub fn write_data(&mut self, buf: &[u8]) -> Result<()> {
        self.guard()?;
        let WriteState::InEntry { declared, written } = self.state else {
            return Err(Error::misuse("write_data called with no entry open"));
        };
        let grown = written + buf.len() as u64;
        if let Some(declared) = declared {
            if grown > declared {
                let err = Error::misuse(format!(
                    "entry payload overran its declared size {declared} by {} bytes",
                    grown - declared
                ));
                return self.park(Err(err));
            }
        }
        let Some(sink) = self.sink.as_mut() else {
            return Err(Error::misuse("write session already finished"));
        };
        let result = self.writer.write_data(sink, buf);
        self.park(result)?;
        self.state = WriteState::InEntry {
            declared,
            written: grown,
        };
        Ok(())
    }

    /// Close the open entry, checking the declared size was met.
    pub fn finish_entry(&mut self) -> Result<()> {
        self.guard()?;
        let WriteState::InEntry { declared, written } = self.state else {
            return Err(Error::misuse("finish_entry called with no entry open"));
        };
        if let Some(declared) = declared {
            if written < declared {
                let err = Error::misuse(format!(
                    "entry closed {} bytes short of its declared size {declared}",
                    declared - written
                ));
                return self.park(Err(err));
            }
        }
        let Some(sink) = self.sink.as_mut() else {
            return Err(Error::misuse("write session already finished"));
        };
        let result = self.writer.finish_entry(sink, written);
        self.park(result)?;
        self.state = WriteState::Idle;
        Ok(())
    }

    /// Header, payload, and close in one call.
    pub fn write_entry(&mut self, entry: &Entry, data: &[u8]) -> Result<()> {
        self.write_header(entry)?;
        if !data.is_empty() {
            self.write_data(data)?;
        }
        self.finish_entry()
    }

    /// Write the archive trailer and flush every filter stage.
    ///
    /// Consumes the session; an archive that is not finished is not
    /// valid, so dropping the session without calling this leaves the
    /// sink truncated.
    pub fn finish(mut self) -> Result<()> {
        self.guard()?;
        if matches!(self.state, WriteState::InEntry { .. }) {
            return Err(Error::misuse("finish called with an entry still open"));
        }
        let Some(sink) = self.sink.as_mut() else {
            return Err(Error::misuse("write session already finished"));
        };
        let result = self.writer.finish(sink);
        self.park(result)?;
        let stack = self
            .sink
            .take()
            .ok_or_else(|| Error::misuse("write session already finished"))?;
        stack.finish()
    }

    fn guard(&self) -> Result<()> {
        match &self.fault {
            Some(err) => Err(err.replay()),
            None => Ok(()),
        }
    }

    fn park<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.fault = Some(err.replay());
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::read::{ReadOptions, ReadSession};
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    /// Test sink the session can own while the test keeps a handle.
    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedSink {
        fn take(&self) -> Vec<u8> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }

    #[test]
    fn tar_session_round_trips_through_a_read_session() {
        let sink = SharedSink::default();
        let mut session = WriteSession::new(sink.clone(), &WriteOptions::new()).unwrap();
        session
            .write_entry(&Entry::file("a.txt", 12), b"hello, world")
            .unwrap();
        session.write_entry(&Entry::directory("dir"), b"").unwrap();
        session.write_entry(&Entry::file("dir/b.txt", 0), b"").unwrap();
        session.finish().unwrap();
        let bytes = sink.take();

        let mut reader =
            ReadSession::from_reader(Cursor::new(bytes), &ReadOptions::default()).unwrap();
        assert_eq!(reader.format(), FormatKind::Tar);
        let first = reader.next_entry().unwrap().unwrap();
        assert_eq!(first.path().to_string(), "a.txt");
        let mut buf = [0u8; 32];
        let got = reader.read_data(&mut buf).unwrap();
        assert_eq!(&buf[..got], b"hello, world");
        let second = reader.next_entry().unwrap().unwrap();
        assert_eq!(second.path().to_string(), "dir");
        let third = reader.next_entry().unwrap().unwrap();
        assert_eq!(third.size(), Some(0));
        assert!(reader.next_entry().unwrap().is_none());
    }

    #[test]
    fn ordering_violations_are_protocol_errors() {
        let mut session =
            WriteSession::new(Vec::new(), &WriteOptions::new()).unwrap();
        let err = session.write_data(b"early").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
        // The ordering check fires before any bytes move, so the
        // session is not parked.
        session.write_header(&Entry::file("a", 1)).unwrap();
        let err = session.write_header(&Entry::file("b", 1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
    }

    #[test]
    fn size_underrun_parks_the_session() {
        let mut session =
            WriteSession::new(Vec::new(), &WriteOptions::new()).unwrap();
        session.write_header(&Entry::file("a", 100)).unwrap();
        session.write_data(&[0u8; 50]).unwrap();
        let err = session.finish_entry().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
        let replay = session.write_data(&[0u8; 10]).unwrap_err();
        assert_eq!(replay.kind(), ErrorKind::ProtocolViolation);
        assert_eq!(replay.context(), err.context());
    }

    #[test]
    fn overrun_is_rejected_before_serialization() {
        let mut session =
            WriteSession::new(Vec::new(), &WriteOptions::new()).unwrap();
        session.write_header(&Entry::file("a", 4)).unwrap();
        let err = session.write_data(&[0u8; 5]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
    }

    #[test]
    fn non_payload_kinds_accept_no_bytes() {
        let mut session =
            WriteSession::new(Vec::new(), &WriteOptions::new()).unwrap();
        session
            .write_header(&Entry::symlink("ln", "target"))
            .unwrap();
        let err = session.write_data(b"x").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
    }

    #[cfg(feature = "gzip")]
    #[test]
    fn filtered_output_reads_back_through_the_chain() {
        let sink = SharedSink::default();
        let options = WriteOptions::new()
            .with_format(FormatKind::Cpio)
            .with_filters(vec![FilterKind::Gzip]);
        let mut session = WriteSession::new(sink.clone(), &options).unwrap();
        session
            .write_entry(&Entry::file("z.bin", 3), b"abc")
            .unwrap();
        session.finish().unwrap();
        let bytes = sink.take();
        assert_eq!(&bytes[..2], &[0x1f, 0x8b], "gzip magic on the wire");

        let mut reader =
            ReadSession::from_reader(Cursor::new(bytes), &ReadOptions::default()).unwrap();
        assert_eq!(reader.filter_chain(), &[FilterKind::Gzip]);
        assert_eq!(reader.format(), FormatKind::Cpio);
        let entry = reader.next_entry().unwrap().unwrap();
        assert_eq!(entry.path().to_string(), "z.bin");
    }
}
