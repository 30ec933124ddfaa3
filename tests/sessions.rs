//! Session state-machine behavior shared by every format.

use std::io::{Cursor, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use arcmux::{
    Entry, EntryKind, ErrorKind, FormatKind, ReadOptions, ReadSession, WriteOptions,
    WriteSession,
};

#[derive(Clone, Default)]
struct Sink(Arc<Mutex<Vec<u8>>>);

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
    fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

/// The shared fixture: a file with payload, a directory, an empty file.
fn three_entry_archive(format: FormatKind) -> Result<Vec<u8>> {
    let sink = Sink::default();
    let mut session =
        WriteSession::new(sink.clone(), &WriteOptions::new().with_format(format))?;
    session.write_entry(&Entry::file("a.txt", 12), b"hello, world")?;
    session.write_entry(&Entry::directory("dir"), b"")?;
    session.write_entry(&Entry::file("dir/b.txt", 0), b"")?;
    session.finish()?;
    Ok(sink.take())
}

#[test]
fn the_same_listing_comes_back_from_every_container() -> Result<()> {
    for format in [FormatKind::Tar, FormatKind::Cpio, FormatKind::Zip] {
        let mut session = ReadSession::from_reader(
            Cursor::new(three_entry_archive(format)?),
            &ReadOptions::default(),
        )?;
        assert_eq!(session.format(), format, "{format} archive detected as itself");

        let first = session.next_entry()?.unwrap();
        assert_eq!(first.path().to_string(), "a.txt");
        assert_eq!(first.kind(), EntryKind::Regular);
        let mut payload = Vec::new();
        let mut buf = [0u8; 5];
        loop {
            let got = session.read_data(&mut buf)?;
            if got == 0 {
                break;
            }
            payload.extend_from_slice(&buf[..got]);
        }
        assert_eq!(payload, b"hello, world", "{format} payload");

        let second = session.next_entry()?.unwrap();
        assert_eq!(second.kind(), EntryKind::Directory, "{format} directory");
        assert_eq!(second.path().to_string(), "dir", "{format} bare directory name");

        let third = session.next_entry()?.unwrap();
        assert_eq!(third.path().to_string(), "dir/b.txt");
        assert_eq!(session.read_data(&mut buf)?, 0, "{format} empty file");

        assert!(session.next_entry()?.is_none(), "{format} end of archive");
    }
    Ok(())
}

#[test]
fn truncation_parks_the_session_with_a_replayable_fault() -> Result<()> {
    for format in [FormatKind::Tar, FormatKind::Cpio, FormatKind::Zip] {
        let mut bytes = three_entry_archive(format)?;
        // Cut inside an entry header: tar accepts a clean EOF at an
        // inter-entry block boundary and zip one inside the central
        // directory, so neither of those offsets proves anything.
        bytes.truncate(bytes.len() * 2 / 5 + 1);
        let mut session =
            ReadSession::from_reader(Cursor::new(bytes), &ReadOptions::default())?;

        let first = 'decode: loop {
            match session.next_entry() {
                Ok(Some(_)) => {
                    let mut buf = [0u8; 4096];
                    loop {
                        match session.read_data(&mut buf) {
                            Ok(0) => break,
                            Ok(_) => {}
                            Err(err) => break 'decode err,
                        }
                    }
                }
                Ok(None) => panic!("{format}: truncated archive decoded cleanly"),
                Err(err) => break 'decode err,
            }
        };
        assert!(
            matches!(first.kind(), ErrorKind::ShortRead | ErrorKind::CorruptHeader),
            "{format}: truncation surfaced as {}",
            first.kind()
        );
        let replay = session.next_entry().unwrap_err();
        assert_eq!(replay.kind(), first.kind(), "{format} fault replays");
        assert_eq!(replay.context(), first.context(), "{format} context replays");
    }
    Ok(())
}

#[test]
fn declared_sizes_bind_the_write_side() -> Result<()> {
    let mut session = WriteSession::new(Sink::default(), &WriteOptions::new())?;
    session.write_header(&Entry::file("short.bin", 100))?;
    session.write_data(&[0u8; 50])?;
    let err = session.finish_entry().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
    // The sink holds a half-written entry now; everything replays.
    let replay = session.write_header(&Entry::file("next", 0)).unwrap_err();
    assert_eq!(replay.kind(), ErrorKind::ProtocolViolation);
    assert_eq!(replay.context(), err.context());
    Ok(())
}

#[test]
fn file_backed_archives_read_through_the_seekable_path() -> Result<()> {
    let mut file = tempfile::tempfile()?;
    file.write_all(&three_entry_archive(FormatKind::Tar)?)?;
    file.seek(SeekFrom::Start(0))?;

    let mut session = ReadSession::from_seekable(file, &ReadOptions::default())?;
    assert_eq!(session.format(), FormatKind::Tar);
    let mut names = Vec::new();
    while let Some(entry) = session.next_entry()? {
        names.push(entry.path().to_string());
    }
    assert_eq!(names, ["a.txt", "dir", "dir/b.txt"]);
    Ok(())
}

#[test]
fn zero_byte_regular_files_need_no_data_calls() -> Result<()> {
    let sink = Sink::default();
    let mut session = WriteSession::new(sink.clone(), &WriteOptions::new())?;
    session.write_header(&Entry::file("empty", 0))?;
    session.finish_entry()?;
    session.finish()?;
    assert!(!sink.take().is_empty());
    Ok(())
}
