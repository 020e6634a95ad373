//! # Pending Queue
//!
//! Append-only file of sales recorded while a pump had no parent connection.
//!
//! ## Replay Protocol
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  pending_sales.log ──begin_replay()──► pending_sales.log.replay         │
//! │        ▲  (rename: new offline sales start a fresh queue file)          │
//! │        │                                    │                           │
//! │        │                         send every record, wait for flush      │
//! │        │                                    │                           │
//! │        │                     ┌──────────────┴─────────────┐             │
//! │        │                  success                      failure          │
//! │        │                     ▼                            ▼             │
//! │        │              commit_replay()              abort_replay()       │
//! │        │              delete .replay               .replay + queue      │
//! │        └──────────────────────────────────────────── written back      │
//! │                                                                         │
//! │  A .replay file found at open() means the process died mid-replay:     │
//! │  it is merged back in front of the queue, so nothing is lost.           │
//! │                                                                         │
//! │  Every file operation holds one lock shared by all clones, so an        │
//! │  append never lands in a file that a replay step is moving or           │
//! │  rewriting.                                                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use fuelnet_core::PendingTransaction;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::flatfile;

/// Records read back from the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueContents {
    /// Well-formed records in append order.
    pub records: Vec<PendingTransaction>,
    /// Lines that could not be decoded or parsed.
    pub skipped: usize,
}

/// File-backed queue of [`PendingTransaction`]s.
#[derive(Debug, Clone)]
pub struct PendingQueue {
    path: PathBuf,
    replay_path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl PendingQueue {
    /// Opens the queue, recovering an interrupted replay if one is found.
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let queue = PendingQueue {
            replay_path: flatfile::sibling(&path, "replay"),
            path,
            lock: Arc::new(Mutex::new(())),
        };

        if queue.replay_path.exists() {
            warn!(path = %queue.replay_path.display(), "Recovering interrupted replay");
            queue.restore_replay()?;
        }
        Ok(queue)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one record.
    pub fn append(&self, record: &PendingTransaction) -> StoreResult<()> {
        let _guard = self.guard();
        flatfile::append_line(&self.path, &record.to_record_line())?;
        debug!(
            unit_id = %record.unit_id,
            commodity = %record.commodity,
            quantity = %record.quantity,
            "Sale queued for later delivery"
        );
        Ok(())
    }

    /// Every record currently queued.
    pub fn read_all(&self) -> StoreResult<QueueContents> {
        let _guard = self.guard();
        parse_lines(flatfile::read_decoded_lines(&self.path)?)
    }

    pub fn len(&self) -> StoreResult<usize> {
        Ok(self.read_all()?.records.len())
    }

    pub fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Unit id of the oldest well-formed record.
    pub fn first_unit_id(&self) -> StoreResult<Option<String>> {
        Ok(self
            .read_all()?
            .records
            .into_iter()
            .next()
            .map(|r| r.unit_id))
    }

    // =========================================================================
    // Replay
    // =========================================================================

    /// Moves the current queue aside and returns its records.
    ///
    /// Returns `None` when nothing is queued. Until [`commit_replay`] or
    /// [`abort_replay`] is called, new appends go to a fresh queue file.
    ///
    /// [`commit_replay`]: PendingQueue::commit_replay
    /// [`abort_replay`]: PendingQueue::abort_replay
    pub fn begin_replay(&self) -> StoreResult<Option<QueueContents>> {
        let _guard = self.guard();
        if self.replay_path.exists() {
            self.restore_replay()?;
        }

        match fs::rename(&self.path, &self.replay_path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(&self.path, e)),
        }

        let contents = parse_lines(flatfile::read_decoded_lines(&self.replay_path)?)?;
        if contents.records.is_empty() && contents.skipped == 0 {
            flatfile::remove_if_exists(&self.replay_path)?;
            return Ok(None);
        }
        Ok(Some(contents))
    }

    /// The replayed records were delivered; forget them.
    pub fn commit_replay(&self) -> StoreResult<()> {
        let _guard = self.guard();
        flatfile::remove_if_exists(&self.replay_path)
    }

    /// Delivery failed; put the replayed lines back in front of anything
    /// appended since [`PendingQueue::begin_replay`].
    pub fn abort_replay(&self) -> StoreResult<()> {
        let _guard = self.guard();
        self.restore_replay()
    }

    /// Caller holds the lock.
    fn restore_replay(&self) -> StoreResult<()> {
        let mut lines = flatfile::read_lines(&self.replay_path)?;
        if lines.is_empty() {
            return flatfile::remove_if_exists(&self.replay_path);
        }

        let restored = lines.len();
        lines.extend(flatfile::read_lines(&self.path)?);
        flatfile::write_lines_atomic(&self.path, &lines)?;
        flatfile::remove_if_exists(&self.replay_path)?;

        info!(restored, total = lines.len(), "Pending queue restored after failed replay");
        Ok(())
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn parse_lines(decoded: flatfile::DecodedLines) -> StoreResult<QueueContents> {
    let mut contents = QueueContents {
        skipped: decoded.undecodable,
        ..Default::default()
    };
    for line in decoded.lines {
        match PendingTransaction::parse_record_line(&line) {
            Ok(record) => contents.records.push(record),
            Err(e) => {
                debug!(%line, error = %e, "Skipping malformed pending record");
                contents.skipped += 1;
            }
        }
    }
    Ok(contents)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use fuelnet_core::{Commodity, Liters};

    fn record(unit: &str, qty: u32) -> PendingTransaction {
        PendingTransaction::now(unit, Commodity::Gasoline93, Liters::from_whole(qty))
    }

    fn queue() -> (tempfile::TempDir, PendingQueue) {
        let dir = tempfile::tempdir().unwrap();
        let queue = PendingQueue::open(dir.path().join("pending_sales.log")).unwrap();
        (dir, queue)
    }

    #[test]
    fn test_append_preserves_order() {
        let (_dir, queue) = queue();
        queue.append(&record("1", 5)).unwrap();
        queue.append(&record("1", 8)).unwrap();

        let contents = queue.read_all().unwrap();
        let quantities: Vec<_> = contents.records.iter().map(|r| r.quantity).collect();
        assert_eq!(quantities, vec![Liters::from_whole(5), Liters::from_whole(8)]);
        assert_eq!(queue.first_unit_id().unwrap().as_deref(), Some("1"));
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let (_dir, queue) = queue();
        queue.append(&record("1", 5)).unwrap();
        flatfile::append_line(queue.path(), "not|a|record").unwrap();
        queue.append(&record("1", 8)).unwrap();

        let contents = queue.read_all().unwrap();
        assert_eq!(contents.records.len(), 2);
        assert_eq!(contents.skipped, 1);
    }

    #[test]
    fn test_replay_commit_empties_queue() {
        let (_dir, queue) = queue();
        queue.append(&record("1", 5)).unwrap();

        let batch = queue.begin_replay().unwrap().unwrap();
        assert_eq!(batch.records.len(), 1);
        queue.commit_replay().unwrap();

        assert!(queue.is_empty().unwrap());
        assert!(queue.begin_replay().unwrap().is_none());
    }

    #[test]
    fn test_replay_abort_restores_in_front_of_new_appends() {
        let (_dir, queue) = queue();
        queue.append(&record("1", 5)).unwrap();
        queue.append(&record("1", 8)).unwrap();

        let _batch = queue.begin_replay().unwrap().unwrap();
        // A sale recorded while the replay is in flight.
        queue.append(&record("1", 3)).unwrap();
        queue.abort_replay().unwrap();

        let quantities: Vec<_> = queue
            .read_all()
            .unwrap()
            .records
            .iter()
            .map(|r| r.quantity)
            .collect();
        assert_eq!(
            quantities,
            vec![Liters::from_whole(5), Liters::from_whole(8), Liters::from_whole(3)]
        );
    }

    #[test]
    fn test_undecodable_lines_count_as_skipped() {
        let (_dir, queue) = queue();
        queue.append(&record("1", 5)).unwrap();
        {
            use std::io::Write;
            let mut file = fs::OpenOptions::new().append(true).open(queue.path()).unwrap();
            file.write_all(b"2|93|\xff|2024-03-01 14:02:11\n").unwrap();
        }
        queue.append(&record("1", 8)).unwrap();

        let contents = queue.read_all().unwrap();
        assert_eq!(contents.records.len(), 2);
        assert_eq!(contents.skipped, 1);

        let batch = queue.begin_replay().unwrap().unwrap();
        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.skipped, 1);
        queue.commit_replay().unwrap();
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn test_appends_during_replays_are_never_lost() {
        const SALES: u32 = 2000;
        let (_dir, queue) = queue();

        let writer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                for qty in 1..=SALES {
                    queue.append(&record("1", qty)).unwrap();
                }
            })
        };

        let mut delivered = Vec::new();
        let mut round = 0u32;
        while !writer.is_finished() {
            round += 1;
            let Some(batch) = queue.begin_replay().unwrap() else {
                continue;
            };
            if round % 3 == 0 {
                queue.abort_replay().unwrap();
            } else {
                delivered.extend(batch.records.into_iter().map(|r| r.quantity));
                queue.commit_replay().unwrap();
            }
        }
        writer.join().unwrap();

        let remaining = queue.read_all().unwrap();
        assert_eq!(remaining.skipped, 0);
        delivered.extend(remaining.records.into_iter().map(|r| r.quantity));

        let expected: Vec<Liters> = (1..=SALES).map(Liters::from_whole).collect();
        assert_eq!(delivered, expected);
    }

    #[test]
    fn test_open_recovers_interrupted_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pending_sales.log");
        {
            let queue = PendingQueue::open(&path).unwrap();
            queue.append(&record("2", 5)).unwrap();
            let _ = queue.begin_replay().unwrap();
            // Process dies here.
        }

        let queue = PendingQueue::open(&path).unwrap();
        assert_eq!(queue.len().unwrap(), 1);
        assert_eq!(queue.first_unit_id().unwrap().as_deref(), Some("2"));
    }
}
