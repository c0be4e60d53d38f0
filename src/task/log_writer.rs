//! Session log writer
//!
//! Drains the log queue into the open session file. Data records are
//! appended and flushed every `flush_every` records; a sentinel flushes and
//! syncs the file so a mode exit leaves a complete log on the card.
//!
//! Failed writes are not retried: the record, and any buffered records the
//! file threw away with it, are counted as dropped and the writer carries on
//! with the next one.

use crate::fmt::Dbg;
use crate::system::record::PersistRecord;
use crate::system::stats::PipelineStats;
use crate::system::storage::LogFile;
use crate::task::depth_sample::LogQueue;

pub struct LogWriter<'a, F> {
    file: F,
    flush_every: u16,
    since_flush: u16,
    stats: &'a PipelineStats,
}

impl<'a, F: LogFile> LogWriter<'a, F> {
    pub fn new(file: F, flush_every: u16, stats: &'a PipelineStats) -> Self {
        Self {
            file,
            flush_every: flush_every.max(1),
            since_flush: 0,
            stats,
        }
    }

    pub fn get_ref(&self) -> &F {
        &self.file
    }

    /// Records written since the last flush
    pub fn pending(&self) -> u16 {
        self.since_flush
    }

    pub fn handle(&mut self, record: &PersistRecord) {
        match record {
            PersistRecord::Sentinel => {
                self.since_flush = 0;
                match self.file.sync() {
                    Ok(()) => debug!("log synced"),
                    Err(e) => {
                        let lost = self.discarded(0);
                        error!("log sync failed, {} records lost: {:?}", lost, Dbg(&e));
                    }
                }
            }
            PersistRecord::Frame(line) => {
                if let Err(e) = self.file.write_all(line.as_bytes()) {
                    let lost = self.discarded(1);
                    error!("log write failed, {} records lost: {:?}", lost, Dbg(&e));
                    return;
                }
                self.since_flush += 1;
                if self.since_flush >= self.flush_every {
                    self.since_flush = 0;
                    if let Err(e) = self.file.flush() {
                        let lost = self.discarded(0);
                        error!("log flush failed, {} records lost: {:?}", lost, Dbg(&e));
                    }
                }
            }
        }
    }

    /// Counts a failed call: `refused` records it did not take plus the
    /// buffered ones the file threw away
    fn discarded(&mut self, refused: u32) -> u32 {
        let lost = refused.saturating_add(self.file.take_discarded());
        self.stats.write_failed(lost);
        lost
    }

    /// Writes queued records forever
    pub async fn run(&mut self, queue: &LogQueue) -> ! {
        loop {
            let record = queue.receive().await;
            self.handle(&record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::record::FrameLine;
    use crate::system::storage::mock::{MemFile, Op};
    use crate::system::storage::CoalescingWriter;

    fn line(text: &str) -> PersistRecord {
        let mut line = FrameLine::new();
        line.push_str(text).unwrap();
        PersistRecord::Frame(line)
    }

    #[test]
    fn flushes_every_k_records() {
        let stats = PipelineStats::new();
        let file = MemFile::default();
        let mut writer = LogWriter::new(file.clone(), 2, &stats);
        for text in ["a\n", "b\n", "c\n"] {
            writer.handle(&line(text));
        }
        assert_eq!(
            *file.ops.borrow(),
            vec![
                Op::Write(b"a\n".to_vec()),
                Op::Write(b"b\n".to_vec()),
                Op::Flush,
                Op::Write(b"c\n".to_vec()),
            ]
        );
        assert_eq!(writer.pending(), 1);
    }

    #[test]
    fn sentinel_syncs_and_restarts_batch() {
        let stats = PipelineStats::new();
        let file = MemFile::default();
        let mut writer = LogWriter::new(file.clone(), 20, &stats);
        writer.handle(&line("a\n"));
        writer.handle(&PersistRecord::Sentinel);
        assert_eq!(writer.pending(), 0);
        assert_eq!(file.ops.borrow().last(), Some(&Op::Sync));
    }

    #[test]
    fn failed_write_is_counted_and_skipped() {
        let stats = PipelineStats::new();
        let file = MemFile::default();
        let mut writer = LogWriter::new(file.clone(), 20, &stats);
        *file.fail_writes.borrow_mut() = true;
        writer.handle(&line("lost\n"));
        *file.fail_writes.borrow_mut() = false;
        writer.handle(&line("kept\n"));

        assert_eq!(file.written(), b"kept\n");
        assert_eq!(stats.dropped_frames(), 1);
        assert_eq!(stats.snapshot().write_failures, 1);
    }

    #[test]
    fn failed_chunk_counts_every_buffered_record() {
        let stats = PipelineStats::new();
        let file = MemFile::default();
        let mut writer = LogWriter::new(CoalescingWriter::<_, 32>::new(file.clone()), 20, &stats);
        for text in ["r1-------\n", "r2-------\n", "r3-------\n"] {
            writer.handle(&line(text));
        }

        // r4 does not fit, the chunk holding r1..r3 fails with it
        *file.fail_writes.borrow_mut() = true;
        writer.handle(&line("r4-------\n"));
        *file.fail_writes.borrow_mut() = false;
        writer.handle(&line("r5-------\n"));
        writer.handle(&PersistRecord::Sentinel);

        assert_eq!(file.written(), b"r5-------\n");
        assert_eq!(stats.dropped_frames(), 4);
        assert_eq!(stats.snapshot().write_failures, 1);
    }

    #[test]
    fn failed_flush_counts_the_batch() {
        let stats = PipelineStats::new();
        let file = MemFile::default();
        let mut writer = LogWriter::new(CoalescingWriter::<_, 64>::new(file.clone()), 2, &stats);
        writer.handle(&line("a\n"));
        *file.fail_writes.borrow_mut() = true;
        writer.handle(&line("b\n"));

        assert!(file.written().is_empty());
        assert_eq!(stats.dropped_frames(), 2);
        assert_eq!(writer.pending(), 0);
    }
}
