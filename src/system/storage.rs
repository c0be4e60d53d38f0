//! Durable storage for the session log
//!
//! The SD card driver itself lives outside this crate; it is reached through
//! the [`Volume`] and [`LogFile`] traits. This module owns the session
//! bookkeeping: the counter file that gives every power cycle its own log,
//! the log header, and the coalescing buffer that turns many small frame
//! writes into a few large card writes.

use core::fmt::Write as _;

#[cfg(feature = "defmt")]
use defmt::Format;
use heapless::{String, Vec};

use crate::fmt::Dbg;
use crate::system::config::{BINNING_FACTOR, COUNTER_FILE};

/// Append-only file handle
pub trait LogFile {
    type Error: core::fmt::Debug;

    fn write_all(&mut self, data: &[u8]) -> Result<(), Self::Error>;

    /// Hands buffered data to the driver
    fn flush(&mut self) -> Result<(), Self::Error>;

    /// Commits everything written so far to the medium
    fn sync(&mut self) -> Result<(), Self::Error>;

    /// Earlier accepted writes thrown away by failed calls since the last check
    fn take_discarded(&mut self) -> u32 {
        0
    }
}

/// Mounted file system
pub trait Volume {
    type Error: core::fmt::Debug;
    type File: LogFile;

    /// Reads a whole small file into `buf`, `Ok(None)` if it does not exist
    fn read(&mut self, name: &str, buf: &mut [u8]) -> Result<Option<usize>, Self::Error>;

    /// Creates or truncates `name` and writes `data`
    fn replace(&mut self, name: &str, data: &[u8]) -> Result<(), Self::Error>;

    /// Opens `name` for appending, creating it if needed
    fn open_append(&mut self, name: &str) -> Result<Self::File, Self::Error>;
}

/// Session start-up failures, each disables logging for the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub enum StorageError {
    CounterRead,
    CounterWrite,
    Open,
    Header,
}

/// Name of a session log, 8.3 compatible
pub type LogName = String<12>;

/// Log file name for a session index
pub fn log_name(session: u32) -> LogName {
    let mut name = LogName::new();
    // "LOG_" + 4 digits + ".CSV" fits 12 bytes for every index below 10000
    let _ = write!(name, "LOG_{:04}.CSV", session % 10_000);
    name
}

/// Bumps the session counter on the card and returns the new index
///
/// A missing counter starts at 1. An unreadable value also restarts at 1;
/// logs are opened for appending so an older session is extended, never
/// overwritten.
pub fn next_session<V: Volume>(volume: &mut V) -> Result<u32, StorageError> {
    let mut buf = [0u8; 16];
    let stored = volume.read(COUNTER_FILE, &mut buf).map_err(|e| {
        error!("counter read failed: {:?}", Dbg(&e));
        StorageError::CounterRead
    })?;

    let session = match stored {
        Some(len) => match parse_counter(&buf[..len]) {
            Some(previous) => previous.wrapping_add(1),
            None => {
                warn!("counter file unreadable, restarting at 1");
                1
            }
        },
        None => 1,
    };

    let mut text: String<10> = String::new();
    let _ = write!(text, "{}", session);
    volume.replace(COUNTER_FILE, text.as_bytes()).map_err(|e| {
        error!("counter write failed: {:?}", Dbg(&e));
        StorageError::CounterWrite
    })?;

    Ok(session)
}

fn parse_counter(raw: &[u8]) -> Option<u32> {
    core::str::from_utf8(raw).ok()?.trim().parse().ok()
}

/// Writes the comment block at the top of every session log
pub fn write_header<F: LogFile>(file: &mut F) -> Result<(), F::Error> {
    let mut header: String<128> = String::new();
    let _ = write!(
        header,
        "# Depth Sensor Log\n# Binning Factor: {}\n# Frame,Steering(millis),Throttle(millis),Width,Height,Data...\n",
        BINNING_FACTOR
    );
    file.write_all(header.as_bytes())?;
    file.flush()
}

/// Opens this power cycle's log
///
/// Reads and bumps the counter file, opens `LOG_nnnn.CSV` for appending
/// behind an `N` byte coalescing buffer and writes the header.
pub fn open_session<V: Volume, const N: usize>(
    volume: &mut V,
) -> Result<(u32, CoalescingWriter<V::File, N>), StorageError> {
    let session = next_session(volume)?;
    let name = log_name(session);

    let file = volume.open_append(&name).map_err(|e| {
        error!("failed to open {}: {:?}", name.as_str(), Dbg(&e));
        StorageError::Open
    })?;
    let mut writer = CoalescingWriter::new(file);
    write_header(&mut writer).map_err(|e| {
        error!("failed to write log header: {:?}", Dbg(&e));
        StorageError::Header
    })?;

    info!("logging to {}", name.as_str());
    Ok((session, writer))
}

/// Buffers small writes and passes them on in chunks of up to `N` bytes
pub struct CoalescingWriter<F, const N: usize> {
    inner: F,
    buffer: Vec<u8, N>,
    /// Writes currently held in `buffer`
    held: u32,
    discarded: u32,
}

impl<F: LogFile, const N: usize> CoalescingWriter<F, N> {
    pub fn new(inner: F) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            held: 0,
            discarded: 0,
        }
    }

    pub fn get_ref(&self) -> &F {
        &self.inner
    }

    /// Bytes waiting for the next card write
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn drain(&mut self) -> Result<(), F::Error> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let result = self.inner.write_all(&self.buffer);
        // nothing is retried, a failed chunk is gone
        if result.is_err() {
            self.discarded = self.discarded.saturating_add(self.held);
        }
        self.buffer.clear();
        self.held = 0;
        result
    }
}

impl<F: LogFile, const N: usize> LogFile for CoalescingWriter<F, N> {
    type Error = F::Error;

    fn write_all(&mut self, data: &[u8]) -> Result<(), Self::Error> {
        if self.buffer.len() + data.len() > N {
            self.drain()?;
        }
        if data.len() > N {
            return self.inner.write_all(data);
        }
        // cannot fail, the buffer was drained above if needed
        let _ = self.buffer.extend_from_slice(data);
        self.held += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        self.drain()?;
        self.inner.flush()
    }

    fn sync(&mut self) -> Result<(), Self::Error> {
        self.flush()?;
        self.inner.sync()
    }

    fn take_discarded(&mut self) -> u32 {
        let own = core::mem::take(&mut self.discarded);
        own.saturating_add(self.inner.take_discarded())
    }
}


#[cfg(test)]
mod tests {
    use super::mock::*;
    use super::*;

    #[test]
    fn first_session_starts_at_one() {
        let mut volume = MemVolume::default();
        assert_eq!(next_session(&mut volume), Ok(1));
        assert_eq!(volume.files[COUNTER_FILE], b"1");
    }

    #[test]
    fn counter_is_incremented_and_rewritten() {
        let mut volume = MemVolume::default();
        volume.files.insert(COUNTER_FILE.into(), b"41\n".to_vec());
        assert_eq!(next_session(&mut volume), Ok(42));
        assert_eq!(volume.files[COUNTER_FILE], b"42");
        assert_eq!(next_session(&mut volume), Ok(43));
    }

    #[test]
    fn garbage_counter_restarts() {
        let mut volume = MemVolume::default();
        volume.files.insert(COUNTER_FILE.into(), b"x?".to_vec());
        assert_eq!(next_session(&mut volume), Ok(1));
    }

    #[test]
    fn unreadable_card_disables_session() {
        let mut volume = MemVolume {
            unreadable: true,
            ..Default::default()
        };
        assert!(matches!(
            open_session::<_, 64>(&mut volume),
            Err(StorageError::CounterRead)
        ));
    }

    #[test]
    fn session_opens_numbered_log_with_header() {
        let mut volume = MemVolume::default();
        volume.files.insert(COUNTER_FILE.into(), b"6".to_vec());
        let (session, _writer) = open_session::<_, 256>(&mut volume).unwrap();
        assert_eq!(session, 7);
        assert_eq!(volume.opened, vec!["LOG_0007.CSV".to_string()]);
        let text = std::string::String::from_utf8(volume.log.written()).unwrap();
        assert_eq!(
            text,
            "# Depth Sensor Log\n# Binning Factor: 4\n# Frame,Steering(millis),Throttle(millis),Width,Height,Data...\n"
        );
        assert_eq!(volume.log.ops.borrow().last(), Some(&Op::Flush));
    }

    #[test]
    fn open_failure_is_reported() {
        let mut volume = MemVolume {
            no_open: true,
            ..Default::default()
        };
        assert!(matches!(open_session::<_, 64>(&mut volume), Err(StorageError::Open)));
    }

    #[test]
    fn small_writes_are_coalesced() {
        let file = MemFile::default();
        let mut writer = CoalescingWriter::<_, 8>::new(file.clone());
        writer.write_all(b"abc").unwrap();
        writer.write_all(b"def").unwrap();
        assert!(file.ops.borrow().is_empty());
        assert_eq!(writer.buffered(), 6);

        // does not fit, previous chunk goes out first
        writer.write_all(b"ghi").unwrap();
        assert_eq!(*file.ops.borrow(), vec![Op::Write(b"abcdef".to_vec())]);

        writer.sync().unwrap();
        assert_eq!(
            *file.ops.borrow(),
            vec![
                Op::Write(b"abcdef".to_vec()),
                Op::Write(b"ghi".to_vec()),
                Op::Flush,
                Op::Sync,
            ]
        );
    }

    #[test]
    fn oversized_write_bypasses_buffer() {
        let file = MemFile::default();
        let mut writer = CoalescingWriter::<_, 4>::new(file.clone());
        writer.write_all(b"ab").unwrap();
        writer.write_all(b"0123456789").unwrap();
        assert_eq!(
            *file.ops.borrow(),
            vec![Op::Write(b"ab".to_vec()), Op::Write(b"0123456789".to_vec())]
        );
    }

    #[test]
    fn failed_chunk_reports_held_writes() {
        let file = MemFile::default();
        let mut writer = CoalescingWriter::<_, 8>::new(file.clone());
        writer.write_all(b"ab").unwrap();
        writer.write_all(b"cd").unwrap();
        writer.write_all(b"ef").unwrap();
        assert_eq!(writer.take_discarded(), 0);

        *file.fail_writes.borrow_mut() = true;
        assert!(writer.write_all(b"ghi").is_err());
        assert_eq!(writer.buffered(), 0);
        assert_eq!(writer.take_discarded(), 3);
        assert_eq!(writer.take_discarded(), 0);

        *file.fail_writes.borrow_mut() = false;
        writer.write_all(b"jk").unwrap();
        *file.fail_writes.borrow_mut() = true;
        assert!(writer.flush().is_err());
        assert_eq!(writer.take_discarded(), 1);
    }

    #[test]
    fn log_names_are_short() {
        assert_eq!(log_name(1).as_str(), "LOG_0001.CSV");
        assert_eq!(log_name(12345).as_str(), "LOG_2345.CSV");
    }
}
