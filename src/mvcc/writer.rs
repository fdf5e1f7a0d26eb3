//! The write pipelines. All durable writes flow through two background
//! workers, each draining an MPSC queue of batches: the data writer applies
//! batches to the storage engine, and the lock writer applies batches to the
//! in-memory lock and rollback tables, persisting lock changes to a side log
//! so locks survive restarts. A submitter blocks until its batch is durable,
//! and batches are applied in submission order, which lets the MVCC store
//! order its two write streams simply by submitting them sequentially.

use crate::encoding::bincode;
use crate::error::Result;
use crate::mvcc::memstore::MemStore;
use crate::storage::{Engine, Write};

use crossbeam::channel::{bounded, Receiver, Sender};
use log::error;
use serde_derive::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write as _};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// A batch of engine writes: committed versions, old-version copies, and
/// range-delete keys.
pub struct DataBatch {
    writes: Vec<Write>,
}

impl DataBatch {
    pub fn new() -> Self {
        Self { writes: Vec::new() }
    }

    pub fn set(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.writes.push(Write::Set(key, value));
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.writes.push(Write::Delete(key));
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// The total key/value bytes in the batch, for region size accounting.
    pub fn size(&self) -> usize {
        self.writes.iter().map(Write::size).sum()
    }

    fn into_writes(self) -> Vec<Write> {
        self.writes
    }
}

impl Default for DataBatch {
    fn default() -> Self {
        Self::new()
    }
}

/// A single write in a lock batch. Lock writes are persisted to the lock
/// log; rollback-marker writes are memory-only and recreated lazily after a
/// restart.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LockWrite {
    Set(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
    SetRollback(Vec<u8>),
    DeleteRollback(Vec<u8>),
}

/// A batch of lock-table and rollback-table writes.
pub struct LockBatch {
    writes: Vec<LockWrite>,
}

impl LockBatch {
    pub fn new() -> Self {
        Self { writes: Vec::new() }
    }

    pub fn set(&mut self, key: Vec<u8>, lock: Vec<u8>) {
        self.writes.push(LockWrite::Set(key, lock));
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.writes.push(LockWrite::Delete(key));
    }

    /// Writes a rollback marker at the given rollback key.
    pub fn rollback(&mut self, key: Vec<u8>) {
        self.writes.push(LockWrite::SetRollback(key));
    }

    /// Removes the rollback marker at the given rollback key.
    pub fn delete_rollback(&mut self, key: Vec<u8>) {
        self.writes.push(LockWrite::DeleteRollback(key));
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// Applies the batch to the in-memory tables.
    fn apply(&self, locks: &MemStore, rollbacks: &MemStore) {
        for write in &self.writes {
            match write {
                LockWrite::Set(key, lock) => locks.insert(key.clone(), lock.clone()),
                LockWrite::Delete(key) => locks.remove(key),
                LockWrite::SetRollback(key) => rollbacks.insert(key.clone(), Vec::new()),
                LockWrite::DeleteRollback(key) => rollbacks.remove(key),
            }
        }
    }
}

impl Default for LockBatch {
    fn default() -> Self {
        Self::new()
    }
}

/// A batch submitted to a pipeline, with a channel to acknowledge its
/// durable completion.
pub(crate) struct Submission<B> {
    batch: B,
    done: Sender<Result<()>>,
}

/// Submits a batch to a pipeline and blocks until it is durable.
pub(crate) fn submit<B>(tx: &Sender<Submission<B>>, batch: B) -> Result<()> {
    let (done_tx, done_rx) = bounded(1);
    tx.send(Submission { batch, done: done_tx })?;
    done_rx.recv()?
}

/// Spawns the data-write worker. It exits when all submission senders have
/// dropped, after draining in-flight batches.
pub(crate) fn spawn_data_writer<E: Engine + 'static>(
    engine: Arc<Mutex<E>>,
    rx: Receiver<Submission<DataBatch>>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        while let Ok(sub) = rx.recv() {
            let result = match engine.lock() {
                Ok(mut engine) => engine.write_batch(sub.batch.into_writes()),
                Err(err) => Err(err.into()),
            };
            if let Err(err) = &result {
                error!("data write failed: {err}");
            }
            let _ = sub.done.send(result);
        }
    })
}

/// Spawns the lock-write worker. Each batch is appended to the lock log and
/// synced before it becomes visible in the in-memory tables.
pub(crate) fn spawn_lock_writer(
    mut log: LockLog,
    locks: Arc<MemStore>,
    rollbacks: Arc<MemStore>,
    rx: Receiver<Submission<LockBatch>>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        while let Ok(sub) = rx.recv() {
            let result = log.append(&sub.batch).map(|()| sub.batch.apply(&locks, &rollbacks));
            if let Err(err) = &result {
                error!("lock write failed: {err}");
            }
            let _ = sub.done.send(result);
        }
    })
}

/// A persisted lock-log entry. Rollback markers are never logged.
#[derive(Debug, Serialize, Deserialize)]
enum LogEntry {
    Set(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// The persisted lock log: an append-only bincode stream of lock-table
/// changes, replayed on startup to rebuild the in-memory table and rewritten
/// compacted on clean shutdown.
pub(crate) struct LockLog {
    file: File,
}

impl LockLog {
    /// Opens the log for appending, creating it if missing.
    pub fn open(path: &Path) -> Result<Self> {
        let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }

    /// Appends a batch's lock writes and syncs them to disk.
    pub fn append(&mut self, batch: &LockBatch) -> Result<()> {
        let mut buf = Vec::new();
        for write in &batch.writes {
            match write {
                LockWrite::Set(key, lock) => {
                    bincode::serialize_into(&mut buf, &LogEntry::Set(key.clone(), lock.clone()))?
                }
                LockWrite::Delete(key) => {
                    bincode::serialize_into(&mut buf, &LogEntry::Delete(key.clone()))?
                }
                LockWrite::SetRollback(_) | LockWrite::DeleteRollback(_) => {}
            }
        }
        if buf.is_empty() {
            return Ok(());
        }
        self.file.write_all(&buf)?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Replays the log at the given path into a lock table, returning the
    /// number of entries applied. A missing log is empty; a truncated
    /// trailing entry marks the crash point and stops the replay.
    pub fn load(path: &Path, locks: &MemStore) -> Result<u64> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };
        let mut reader = BufReader::new(file);
        let mut count = 0;
        while let Some(entry) = bincode::maybe_deserialize_from::<_, LogEntry>(&mut reader)? {
            match entry {
                LogEntry::Set(key, lock) => locks.insert(key, lock),
                LogEntry::Delete(key) => locks.remove(&key),
            }
            count += 1;
        }
        Ok(count)
    }

    /// Rewrites the log from the current lock table, dropping deletions
    /// accumulated since the last rewrite. Writes to a temporary file and
    /// renames it into place so a crash leaves the old log intact.
    pub fn rewrite(path: &Path, locks: &MemStore) -> Result<()> {
        let tmp = path.with_extension("tmp");
        let mut writer = BufWriter::new(File::create(&tmp)?);
        for (key, lock) in locks.iter() {
            bincode::serialize_into(&mut writer, &LogEntry::Set(key, lock))?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Memory;

    #[test]
    fn lock_log_roundtrip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("locks");

        let mut log = LockLog::open(&path)?;
        let mut batch = LockBatch::new();
        batch.set(b"a".to_vec(), b"lock-a".to_vec());
        batch.set(b"b".to_vec(), b"lock-b".to_vec());
        batch.rollback(b"r".to_vec()); // memory-only, must not persist
        log.append(&batch)?;

        let mut batch = LockBatch::new();
        batch.delete(b"a".to_vec());
        log.append(&batch)?;
        drop(log);

        let locks = MemStore::new();
        assert_eq!(LockLog::load(&path, &locks)?, 3);
        assert_eq!(locks.get(b"a"), None);
        assert_eq!(locks.get(b"b"), Some(b"lock-b".to_vec()));
        assert_eq!(locks.len(), 1);

        // A rewrite compacts the log down to the live locks.
        LockLog::rewrite(&path, &locks)?;
        let reloaded = MemStore::new();
        assert_eq!(LockLog::load(&path, &reloaded)?, 1);
        assert_eq!(reloaded.get(b"b"), Some(b"lock-b".to_vec()));
        Ok(())
    }

    #[test]
    fn lock_log_missing() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let locks = MemStore::new();
        assert_eq!(LockLog::load(&dir.path().join("missing"), &locks)?, 0);
        Ok(())
    }

    #[test]
    fn pipelines_apply_and_ack() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let locks = Arc::new(MemStore::new());
        let rollbacks = Arc::new(MemStore::new());
        let engine = Arc::new(Mutex::new(Memory::new()));

        let (lock_tx, lock_rx) = crossbeam::channel::unbounded();
        let (data_tx, data_rx) = crossbeam::channel::unbounded();
        let lock_handle = spawn_lock_writer(
            LockLog::open(&dir.path().join("locks"))?,
            locks.clone(),
            rollbacks.clone(),
            lock_rx,
        );
        let data_handle = spawn_data_writer(engine.clone(), data_rx);

        let mut batch = LockBatch::new();
        batch.set(b"k".to_vec(), b"lock".to_vec());
        batch.rollback(b"rb".to_vec());
        submit(&lock_tx, batch)?;
        assert_eq!(locks.get(b"k"), Some(b"lock".to_vec()));
        assert_eq!(rollbacks.get(b"rb"), Some(Vec::new()));

        let mut batch = DataBatch::new();
        batch.set(b"k".to_vec(), b"value".to_vec());
        assert_eq!(batch.size(), 6);
        submit(&data_tx, batch)?;
        assert_eq!(engine.lock()?.get(b"k")?, Some(b"value".to_vec()));

        // Dropping the senders shuts the workers down.
        drop(lock_tx);
        drop(data_tx);
        lock_handle.join().expect("lock writer panicked");
        data_handle.join().expect("data writer panicked");
        Ok(())
    }
}
