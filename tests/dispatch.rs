//! Detection-level checks: bidding, chains, and their failure modes.

use std::io::Cursor;

use anyhow::Result;
use arcmux::{
    Entry, ErrorKind, FilterKind, FormatKind, ReadOptions, ReadSession, WriteOptions,
    WriteSession,
};

/// Sessions own their sink and `finish` consumes it; a shared handle
/// lets the test keep the bytes.
mod shared {
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    pub struct Sink(Arc<Mutex<Vec<u8>>>);

    impl Write for Sink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Sink {
        pub fn take(&self) -> Vec<u8> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }
}

#[test]
fn detection_is_deterministic() -> Result<()> {
    let bytes = build_cpio(0)?;
    let options = ReadOptions::default();
    for _ in 0..3 {
        let session = ReadSession::from_reader(Cursor::new(bytes.clone()), &options)?;
        assert_eq!(session.format(), FormatKind::Cpio);
        assert!(session.filter_chain().is_empty());
    }
    Ok(())
}

#[test]
fn filters_are_peeled_before_format_bidding() -> Result<()> {
    let bytes = build_cpio(1)?;
    let session = ReadSession::from_reader(Cursor::new(bytes), &ReadOptions::default())?;
    assert_eq!(session.filter_chain(), &[FilterKind::Gzip]);
    assert_eq!(session.format(), FormatKind::Cpio);
    Ok(())
}

#[test]
fn chain_depth_is_bounded() -> Result<()> {
    let bytes = build_cpio(4)?;
    let err = ReadSession::from_reader(
        Cursor::new(bytes.clone()),
        &ReadOptions::default().with_max_filter_chain(3),
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ChainDepthExceeded);

    // The same stream opens fine with room for the chain.
    let session = ReadSession::from_reader(
        Cursor::new(bytes),
        &ReadOptions::default().with_max_filter_chain(4),
    )?;
    assert_eq!(session.filter_chain().len(), 4);
    Ok(())
}

#[test]
fn unrecognized_input_names_the_failure() {
    let err = ReadSession::from_reader(
        Cursor::new(b"\x7fELF not an archive".to_vec()),
        &ReadOptions::default(),
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnrecognizedFormat);
}

#[test]
fn empty_input_is_an_archive_with_no_entries() -> Result<()> {
    let mut session =
        ReadSession::from_reader(Cursor::new(Vec::new()), &ReadOptions::default())?;
    assert_eq!(session.format(), FormatKind::Empty);
    assert!(session.next_entry()?.is_none());
    Ok(())
}

#[test]
fn disabled_formats_never_win() -> Result<()> {
    let bytes = build_cpio(0)?;
    let err = ReadSession::from_reader(
        Cursor::new(bytes),
        &ReadOptions::default().with_formats(vec![FormatKind::Tar, FormatKind::Zip]),
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnrecognizedFormat);
    Ok(())
}

/// Build the fixture through shared sinks (sessions consume the sink
/// they own on finish).
fn build_cpio(depth: usize) -> Result<Vec<u8>> {
    let sink = shared::Sink::default();
    let mut session = WriteSession::new(
        sink.clone(),
        &WriteOptions::new().with_format(FormatKind::Cpio),
    )?;
    session.write_entry(&Entry::file("payload.bin", 4), b"data")?;
    session.finish()?;
    let mut bytes = sink.take();
    for _ in 0..depth {
        let sink = shared::Sink::default();
        let mut wrapper = WriteSession::new(
            sink.clone(),
            &WriteOptions::new()
                .with_format(FormatKind::Raw)
                .with_filters(vec![FilterKind::Gzip]),
        )?;
        wrapper.write_entry(&Entry::file("data", bytes.len() as u64), &bytes)?;
        wrapper.finish()?;
        bytes = sink.take();
    }
    Ok(bytes)
}
