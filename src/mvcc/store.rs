//! The MVCC store. See the [`crate::mvcc`] module documentation for the
//! protocol overview.

use crate::encoding::keycode;
use crate::error::{Error, Result};
use crate::mvcc::lock::{Lock, LockInfo, Mutation, Op, Value};
use crate::mvcc::memstore::MemStore;
use crate::mvcc::region::{key_hashes, reached_end, RequestCtx, TraceEvent};
use crate::mvcc::writer::{self, DataBatch, LockBatch, LockLog, Submission};
use crate::storage::Engine;

use crossbeam::channel::{Receiver, Sender};
use log::{debug, error, info};
use serde_derive::{Deserialize, Serialize};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

/// Keys deleted per batch by delete_range.
const DELETE_RANGE_BATCH: usize = 4096;

/// MVCC store options.
#[derive(Clone, Debug)]
pub struct Options {
    /// How often the rollback GC worker scans for expired markers.
    pub rollback_gc_interval: Duration,
    /// How far (in timestamp units) a rollback marker's start timestamp must
    /// trail the latest observed timestamp before it is removed. With
    /// TSO-style timestamps (milliseconds shifted left 18 bits) the default
    /// corresponds to ten minutes.
    pub rollback_gc_margin: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            rollback_gc_interval: Duration::from_secs(10),
            rollback_gc_margin: 600_000 << 18,
        }
    }
}

/// MVCC store status.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    /// The number of pending locks.
    pub locks: u64,
    /// The number of live rollback markers.
    pub rollbacks: u64,
    /// The highest timestamp observed by the store.
    pub latest_ts: u64,
    /// The storage engine.
    pub storage: crate::storage::Status,
}

/// The per-key outcome of the in-memory phase of a rollback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RollbackStatus {
    /// The lock tables fully determined the outcome.
    Done,
    /// No lock was found; the engine decides.
    NoLock,
    /// A lock from a newer transaction was found; the engine decides.
    NewLock,
}

/// A transactional MVCC store on top of a storage engine.
///
/// Pending transactions lock their keys in an in-memory lock table; rolled
/// back transactions leave markers in an in-memory rollback table to fence
/// out stale prewrites. Committed versions live in the engine: the latest at
/// the encoded key, older versions under timestamp-suffixed keys. Writes are
/// made durable by two pipeline workers (see [`crate::mvcc::writer`]);
/// conflicting writers are serialized per key by region latches.
pub struct MvccStore<E: Engine> {
    engine: Arc<Mutex<E>>,
    locks: Arc<MemStore>,
    rollbacks: Arc<MemStore>,
    /// The latest start or commit timestamp observed by any request,
    /// excluding the u64::MAX probe sentinel. Used as the watermark for
    /// rollback-marker GC.
    latest_ts: Arc<AtomicU64>,
    opts: Options,
    log_path: PathBuf,
    data_tx: Option<Sender<Submission<DataBatch>>>,
    lock_tx: Option<Sender<Submission<LockBatch>>>,
    gc_stop_tx: Option<Sender<()>>,
    data_handle: Option<JoinHandle<()>>,
    lock_handle: Option<JoinHandle<()>>,
    gc_handle: Option<JoinHandle<()>>,
}

impl<E: Engine + 'static> MvccStore<E> {
    /// Opens an MVCC store on the given engine, keeping its lock log under
    /// dir. Locks persisted by a previous incarnation are reloaded; rollback
    /// markers are not persisted and are recreated lazily.
    pub fn open(engine: E, dir: impl AsRef<Path>, opts: Options) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let log_path = dir.join("locks.log");

        let locks = Arc::new(MemStore::new());
        let rollbacks = Arc::new(MemStore::new());
        LockLog::load(&log_path, &locks)?;
        info!("recovered {} locks from {}", locks.len(), log_path.display());

        let engine = Arc::new(Mutex::new(engine));
        let latest_ts = Arc::new(AtomicU64::new(0));

        let (data_tx, data_rx) = crossbeam::channel::unbounded();
        let (lock_tx, lock_rx) = crossbeam::channel::unbounded();
        let (gc_stop_tx, gc_stop_rx) = crossbeam::channel::bounded(1);

        let data_handle = writer::spawn_data_writer(engine.clone(), data_rx);
        let lock_handle = writer::spawn_lock_writer(
            LockLog::open(&log_path)?,
            locks.clone(),
            rollbacks.clone(),
            lock_rx,
        );
        let gc_handle = {
            let rollbacks = rollbacks.clone();
            let latest_ts = latest_ts.clone();
            let lock_tx = lock_tx.clone();
            let opts = opts.clone();
            std::thread::spawn(move || {
                run_rollback_gc(rollbacks, latest_ts, lock_tx, gc_stop_rx, opts)
            })
        };

        Ok(Self {
            engine,
            locks,
            rollbacks,
            latest_ts,
            opts,
            log_path,
            data_tx: Some(data_tx),
            lock_tx: Some(lock_tx),
            gc_stop_tx: Some(gc_stop_tx),
            data_handle: Some(data_handle),
            lock_handle: Some(lock_handle),
            gc_handle: Some(gc_handle),
        })
    }

    /// Closes the store: stops the workers (waiting for in-flight batches)
    /// and dumps the in-memory locks to the lock log. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        // Stop the GC worker first; it holds a lock-pipeline sender.
        self.gc_stop_tx.take();
        if let Some(handle) = self.gc_handle.take() {
            handle.join().map_err(|_| Error::Internal("rollback gc worker panicked".into()))?;
        }
        // Dropping the senders lets the workers drain and exit.
        let was_open = self.lock_handle.is_some();
        self.data_tx.take();
        self.lock_tx.take();
        if let Some(handle) = self.data_handle.take() {
            handle.join().map_err(|_| Error::Internal("data writer panicked".into()))?;
        }
        if let Some(handle) = self.lock_handle.take() {
            handle.join().map_err(|_| Error::Internal("lock writer panicked".into()))?;
        }
        if was_open {
            LockLog::rewrite(&self.log_path, &self.locks)?;
            info!("dumped {} locks to {}", self.locks.len(), self.log_path.display());
        }
        Ok(())
    }

    /// The latest timestamp observed by the store.
    pub fn latest_ts(&self) -> u64 {
        self.latest_ts.load(Ordering::SeqCst)
    }

    /// Advances latest_ts to ts if it is larger, ignoring the u64::MAX
    /// primary-probe sentinel.
    fn update_latest_ts(&self, ts: u64) {
        if ts == u64::MAX {
            return;
        }
        let mut current = self.latest_ts.load(Ordering::SeqCst);
        while ts > current {
            match self.latest_ts.compare_exchange(current, ts, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    /// Returns the store status.
    pub fn status(&self) -> Result<Status> {
        Ok(Status {
            locks: self.locks.len() as u64,
            rollbacks: self.rollbacks.len() as u64,
            latest_ts: self.latest_ts(),
            storage: self.engine.lock()?.status()?,
        })
    }

    /// Locks the mutations' keys for a pending transaction at start_ts,
    /// recording the values to commit later. All-or-nothing per request:
    /// returns an empty vector if every mutation succeeded (or if this is a
    /// duplicate prewrite of the same transaction, which is a no-op), and
    /// otherwise a vector aligned with the mutations carrying each failed
    /// mutation's error, with no writes performed. The outer error is
    /// reserved for request-level failures.
    pub fn prewrite(
        &self,
        req: &mut RequestCtx,
        mutations: &[Mutation],
        primary: &[u8],
        start_ts: u64,
        ttl: u64,
    ) -> Result<Vec<Option<Error>>> {
        let dkeys: Vec<Vec<u8>> = mutations.iter().map(|m| keycode::encode_key(&m.key)).collect();
        let primary = keycode::encode_key(primary);

        let region = req.region.clone();
        let _latches = region.acquire_latches(&key_hashes(&dkeys))?;
        req.trace(TraceEvent::AcquireLatches);

        // The lock tables must be checked before the engine.
        let mut errs: Vec<Option<Error>> = Vec::with_capacity(mutations.len());
        let mut any_error = false;
        for dkey in &dkeys {
            match self.check_prewrite_lock(dkey, start_ts)? {
                PrewriteLock::Free => errs.push(None),
                PrewriteLock::Duplicate => return Ok(Vec::new()),
                PrewriteLock::Blocked(err) => {
                    errs.push(Some(err));
                    any_error = true;
                }
            }
        }
        req.trace(TraceEvent::ReadLock);
        if any_error {
            return Ok(errs);
        }

        let mut batch = LockBatch::new();
        {
            let mut reader = self.reader()?;
            for (i, (mutation, dkey)) in mutations.iter().zip(&dkeys).enumerate() {
                match check_prewrite_db(&mut *reader, dkey, start_ts) {
                    Ok(has_old_ver) => {
                        if !any_error {
                            let lock = Lock {
                                start_ts,
                                op: mutation.op,
                                has_old_ver,
                                ttl: ttl as u32,
                                primary: primary.clone(),
                                value: mutation.value.clone(),
                            };
                            batch.set(dkey.clone(), lock.encode());
                        }
                    }
                    Err(err) => {
                        errs[i] = Some(err);
                        any_error = true;
                    }
                }
            }
        }
        req.trace(TraceEvent::ReadDb);
        if any_error {
            return Ok(errs);
        }

        self.write_locks(batch)?;
        req.trace(TraceEvent::EndWriteLock);
        Ok(Vec::new())
    }

    /// Checks the lock and rollback tables for a prewrite of the encoded key
    /// at start_ts.
    fn check_prewrite_lock(&self, dkey: &[u8], start_ts: u64) -> Result<PrewriteLock> {
        let rb_key = keycode::append_ts(dkey.to_vec(), start_ts);
        if self.rollbacks.get(&rb_key).is_some() {
            return Ok(PrewriteLock::Blocked(Error::AlreadyRollback));
        }
        let Some(bytes) = self.locks.get(dkey) else { return Ok(PrewriteLock::Free) };
        let lock = Lock::decode(&bytes)?;
        if lock.start_ts == start_ts {
            // Same transaction, no need to overwrite.
            return Ok(PrewriteLock::Duplicate);
        }
        Ok(PrewriteLock::Blocked(lock.blocked_error(dkey)?))
    }

    /// Commits the keys prewritten at start_ts, at commit_ts. The locks are
    /// deleted only once the committed versions are durable: a crash in
    /// between leaves both the new value and the lock, which the next commit
    /// resolves via handle_lock_not_found.
    pub fn commit(
        &self,
        req: &mut RequestCtx,
        keys: &[Vec<u8>],
        start_ts: u64,
        commit_ts: u64,
    ) -> Result<()> {
        self.update_latest_ts(commit_ts);
        let dkeys: Vec<Vec<u8>> = keys.iter().map(|k| keycode::encode_key(k)).collect();

        let region = req.region.clone();
        let _latches = region.acquire_latches(&key_hashes(&dkeys))?;
        req.trace(TraceEvent::AcquireLatches);

        let mut batch = DataBatch::new();
        let mut need_move = vec![false; dkeys.len()];
        let mut diff = 0;
        for (i, dkey) in dkeys.iter().enumerate() {
            let Some(bytes) = self.locks.get(dkey) else {
                // Commits never cover partial keys, so if one lock is
                // missing the others must be missing too.
                return self.handle_lock_not_found(dkey, start_ts, commit_ts);
            };
            let lock = Lock::decode(&bytes)?;
            if lock.start_ts != start_ts {
                return Err(Error::Replaced);
            }
            if lock.op == Op::Lock {
                // Read-only lock: release it without writing a version.
                continue;
            }
            need_move[i] = lock.has_old_ver;
            let value = lock.into_value(commit_ts).encode();
            diff += dkey.len() + value.len();
            batch.set(dkey.clone(), value);
        }
        req.trace(TraceEvent::ReadLock);

        // Move the current latest versions to the old-version namespace.
        {
            let mut reader = self.reader()?;
            for (i, dkey) in dkeys.iter().enumerate() {
                if !need_move[i] {
                    continue;
                }
                let Some(bytes) = reader.get(dkey)? else { continue };
                let value = Value::decode(&bytes)?;
                batch.set(keycode::append_ts(dkey.clone(), value.commit_ts), bytes);
            }
        }
        req.trace(TraceEvent::ReadDb);

        region.add_diff(diff as i64);
        self.write_data(batch)?;

        // The locks must only be deleted after the data batch is durable.
        let mut batch = LockBatch::new();
        for dkey in dkeys {
            batch.delete(dkey);
        }
        self.write_locks(batch)?;
        req.trace(TraceEvent::EndWriteLock);
        Ok(())
    }

    /// Decides the outcome of a commit whose lock is gone: the commit may
    /// already have been applied (and its version possibly displaced into
    /// the old-version namespace by a later commit), in which case the
    /// replay is an idempotent success.
    fn handle_lock_not_found(&self, dkey: &[u8], start_ts: u64, commit_ts: u64) -> Result<()> {
        let mut reader = self.reader()?;
        let Some(bytes) = reader.get(dkey)? else { return Err(Error::LockNotFound) };
        if Value::decode(&bytes)?.start_ts == start_ts {
            return Ok(());
        }
        if reader.get(&keycode::append_ts(dkey.to_vec(), commit_ts))?.is_some() {
            return Ok(());
        }
        Err(Error::LockNotFound)
    }

    /// Rolls back the transaction at start_ts on the given keys, leaving
    /// rollback markers that fence out any late-arriving prewrite. Fails
    /// with AlreadyCommitted if the transaction committed.
    pub fn rollback(&self, req: &mut RequestCtx, keys: &[Vec<u8>], start_ts: u64) -> Result<()> {
        self.update_latest_ts(start_ts);
        let dkeys: Vec<Vec<u8>> = keys.iter().map(|k| keycode::encode_key(k)).collect();

        let region = req.region.clone();
        let _latches = region.acquire_latches(&key_hashes(&dkeys))?;
        req.trace(TraceEvent::AcquireLatches);

        let mut batch = LockBatch::new();
        let mut statuses = Vec::with_capacity(dkeys.len());
        for dkey in &dkeys {
            statuses.push(self.rollback_key_read_lock(&mut batch, dkey, start_ts)?);
        }
        req.trace(TraceEvent::ReadLock);

        {
            let mut reader = self.reader()?;
            for (dkey, status) in dkeys.iter().zip(statuses) {
                if status == RollbackStatus::Done {
                    continue;
                }
                let has_lock = status == RollbackStatus::NewLock;
                self.rollback_key_read_db(&mut *reader, &mut batch, dkey, start_ts, has_lock)?;
            }
        }
        req.trace(TraceEvent::ReadDb);

        self.write_locks(batch)?;
        req.trace(TraceEvent::EndWriteLock);
        Ok(())
    }

    /// Rolls back a single key at start_ts, on behalf of a lock-holder
    /// timeout inquiry.
    pub fn cleanup(&self, req: &mut RequestCtx, key: &[u8], start_ts: u64) -> Result<()> {
        self.update_latest_ts(start_ts);
        let dkey = keycode::encode_key(key);

        let region = req.region.clone();
        let _latches = region.acquire_latches(&key_hashes(std::slice::from_ref(&dkey)))?;
        req.trace(TraceEvent::AcquireLatches);

        let mut batch = LockBatch::new();
        let status = self.rollback_key_read_lock(&mut batch, &dkey, start_ts)?;
        if status != RollbackStatus::Done {
            let has_lock = status == RollbackStatus::NewLock;
            let mut reader = self.reader()?;
            self.rollback_key_read_db(&mut *reader, &mut batch, &dkey, start_ts, has_lock)?;
            drop(reader);
            req.trace(TraceEvent::ReadDb);
        }
        self.write_locks(batch)
    }

    /// The in-memory phase of a per-key rollback, deciding from the lock
    /// tables alone where possible.
    fn rollback_key_read_lock(
        &self,
        batch: &mut LockBatch,
        dkey: &[u8],
        start_ts: u64,
    ) -> Result<RollbackStatus> {
        let rb_key = keycode::append_ts(dkey.to_vec(), start_ts);
        if self.rollbacks.get(&rb_key).is_some() {
            // Already rolled back.
            return Ok(RollbackStatus::Done);
        }
        let Some(bytes) = self.locks.get(dkey) else { return Ok(RollbackStatus::NoLock) };
        let lock = Lock::decode(&bytes)?;
        if lock.start_ts < start_ts {
            // An older transaction holds the lock, and ours may not have
            // arrived yet; leave a marker to fence out its future prewrite.
            batch.rollback(rb_key);
            return Ok(RollbackStatus::Done);
        }
        if lock.start_ts == start_ts {
            // The prewrite may be resent, so deleting the lock is not
            // enough; the marker keeps it from re-locking the key.
            batch.rollback(rb_key);
            batch.delete(dkey.to_vec());
            return Ok(RollbackStatus::Done);
        }
        // A newer transaction holds the lock; the engine decides whether
        // ours committed before it.
        Ok(RollbackStatus::NewLock)
    }

    /// The engine phase of a per-key rollback, for keys the lock tables
    /// could not decide.
    fn rollback_key_read_db(
        &self,
        engine: &mut E,
        batch: &mut LockBatch,
        dkey: &[u8],
        start_ts: u64,
        has_lock: bool,
    ) -> Result<()> {
        let rb_key = keycode::append_ts(dkey.to_vec(), start_ts);
        let Some(bytes) = engine.get(dkey)? else {
            if !has_lock {
                // The prewrite has not arrived; fence it out.
                batch.rollback(rb_key);
            }
            return Ok(());
        };
        let value = Value::decode(&bytes)?;
        if value.start_ts == start_ts {
            return Err(Error::AlreadyCommitted(value.commit_ts));
        }
        if value.start_ts < start_ts && !has_lock {
            // Neither the prewrite nor a commit has arrived.
            batch.rollback(rb_key);
            return Ok(());
        }
        // A newer version is the latest; our commit may have been displaced
        // into the old-version namespace. Versions newer than start_ts are
        // scanned in descending commit order until one at or below start_ts
        // proves ours never committed.
        let from = keycode::append_ts(dkey.to_vec(), value.commit_ts);
        let mut scan = engine.scan((Bound::Included(from), Bound::Unbounded));
        while let Some((key, bytes)) = scan.next().transpose()? {
            if !key.starts_with(dkey) || keycode::is_visible_key(&key, start_ts)? {
                break;
            }
            if Value::decode(&bytes)?.start_ts == start_ts {
                return Err(Error::AlreadyCommitted(keycode::decode_ts(&key)?));
            }
        }
        Ok(())
    }

    /// Checks whether any of the keys is locked against a read at start_ts.
    pub fn check_keys_lock<K: AsRef<[u8]>>(&self, start_ts: u64, keys: &[K]) -> Result<()> {
        for key in keys {
            let dkey = keycode::encode_key(key.as_ref());
            if let Some(bytes) = self.locks.get(&dkey) {
                Lock::decode(&bytes)?.check(&dkey, start_ts)?;
            }
        }
        Ok(())
    }

    /// Checks whether any key in [start_key, end_key) is locked against a
    /// read at start_ts. An empty end key is unbounded.
    pub fn check_range_lock(&self, start_ts: u64, start_key: &[u8], end_key: &[u8]) -> Result<()> {
        let start = keycode::encode_key(start_key);
        let end = if end_key.is_empty() { Vec::new() } else { keycode::encode_key(end_key) };
        for (dkey, bytes) in self.locks.range_from(&start) {
            if reached_end(&dkey, &end) {
                break;
            }
            Lock::decode(&bytes)?.check(&dkey, start_ts)?;
        }
        Ok(())
    }

    /// Returns the locks in the request's region from transactions that
    /// began before max_ts.
    pub fn scan_lock(&self, req: &mut RequestCtx, max_ts: u64) -> Result<Vec<LockInfo>> {
        let mut infos = Vec::new();
        for (dkey, bytes) in self.locks.range_from(req.region.start_key()) {
            if reached_end(&dkey, req.region.end_key()) {
                break;
            }
            let lock = Lock::decode(&bytes)?;
            if lock.start_ts < max_ts {
                infos.push(LockInfo {
                    key: keycode::decode_key(&dkey)?,
                    primary: keycode::decode_key(&lock.primary)?,
                    start_ts: lock.start_ts,
                    ttl: lock.ttl as u64,
                });
            }
        }
        req.trace(TraceEvent::ReadLock);
        Ok(infos)
    }

    /// Resolves all locks in the request's region left by the transaction at
    /// start_ts: commits them at commit_ts if it is nonzero, and otherwise
    /// rolls them back by deleting them. Used when a client finds an expired
    /// lock and settles its fate via the transaction's primary key.
    pub fn resolve_lock(&self, req: &mut RequestCtx, start_ts: u64, commit_ts: u64) -> Result<()> {
        let region = req.region.clone();

        // Snapshot the matching locks without latches.
        let mut snapshot = Vec::new();
        for (dkey, bytes) in self.locks.range_from(region.start_key()) {
            if reached_end(&dkey, region.end_key()) {
                break;
            }
            if Lock::decode(&bytes)?.start_ts == start_ts {
                snapshot.push((dkey, bytes));
            }
        }
        req.trace(TraceEvent::ReadLock);
        if snapshot.is_empty() {
            return Ok(());
        }

        let keys: Vec<&Vec<u8>> = snapshot.iter().map(|(dkey, _)| dkey).collect();
        let _latches = region.acquire_latches(&key_hashes(&keys))?;
        req.trace(TraceEvent::AcquireLatches);

        let mut data_batch = DataBatch::new();
        let mut lock_batch = LockBatch::new();
        for (dkey, snap) in &snapshot {
            // Another operation may have replaced the lock between the
            // snapshot and the latches; acting on stale bytes would commit
            // the wrong transaction's value. Skip any changed key.
            if self.locks.get(dkey).as_ref() != Some(snap) {
                continue;
            }
            if commit_ts > 0 {
                let lock = Lock::decode(snap)?;
                data_batch.set(dkey.clone(), lock.into_value(commit_ts).encode());
            }
            lock_batch.delete(dkey.clone());
        }
        req.trace(TraceEvent::ReadLock);
        if lock_batch.is_empty() {
            return Ok(());
        }

        if !data_batch.is_empty() {
            region.add_diff(data_batch.size() as i64);
            self.write_data(data_batch)?;
        }
        self.write_locks(lock_batch)?;
        req.trace(TraceEvent::EndWriteLock);
        Ok(())
    }

    /// Deletes all versions of all keys in [start_key, end_key). A single
    /// call collects up to 4096 keys from the latest-version range and up to
    /// 4096 from the old-version range; callers repeat until the range is
    /// empty. Latches are held only around each batch write, so the range is
    /// not deleted atomically; callers must quiesce writers to it. An empty
    /// end key is unbounded.
    pub fn delete_range(&self, req: &mut RequestCtx, start_key: &[u8], end_key: &[u8]) -> Result<()> {
        let start = keycode::encode_key(start_key);
        let old_start = keycode::encode_old_key(start_key, u64::MAX);
        let (end, old_end) = if end_key.is_empty() {
            (Vec::new(), Vec::new())
        } else {
            (keycode::encode_key(end_key), keycode::encode_old_key(end_key, u64::MAX))
        };

        let mut keys = Vec::with_capacity(DELETE_RANGE_BATCH);
        {
            let mut reader = self.reader()?;
            collect_range_keys(&mut *reader, start, &end, &mut keys, DELETE_RANGE_BATCH)?;
            collect_range_keys(&mut *reader, old_start, &old_end, &mut keys, DELETE_RANGE_BATCH)?;
        }
        req.trace(TraceEvent::ReadDb);

        for chunk in keys.chunks(DELETE_RANGE_BATCH) {
            let mut batch = DataBatch::new();
            for key in chunk {
                batch.delete(key.clone());
            }
            let guard = req.region.acquire_latches(&key_hashes(chunk))?;
            let result = self.write_data(batch);
            drop(guard);
            result?;
        }
        Ok(())
    }

    /// Reads the value of a key as of the given timestamp, or None if the
    /// key has no visible version (or its visible version is a tombstone).
    /// Fails with Locked if a pending transaction blocks the read.
    pub fn get(&self, req: &mut RequestCtx, key: &[u8], ts: u64) -> Result<Option<Vec<u8>>> {
        self.update_latest_ts(ts);
        self.check_keys_lock(ts, &[key])?;
        req.trace(TraceEvent::ReadLock);
        let dkey = keycode::encode_key(key);
        let value = read_visible(&mut *self.reader()?, &dkey, ts)?;
        req.trace(TraceEvent::ReadDb);
        Ok(value.and_then(Value::into_payload))
    }

    /// Removes rollback markers whose transactions can no longer appear,
    /// i.e. whose start timestamp trails latest_ts by more than the GC
    /// margin. Returns the number removed. The background worker calls this
    /// periodically; it is safe to call directly since all rollback-table
    /// writes funnel through the lock pipeline.
    pub fn gc_rollback_markers(&self) -> Result<u64> {
        let lock_tx =
            self.lock_tx.as_ref().ok_or_else(|| Error::Internal("store is closed".into()))?;
        gc_expired_rollbacks(&self.rollbacks, &self.latest_ts, self.opts.rollback_gc_margin, lock_tx)
    }

    /// Takes the engine snapshot for a read phase. Writers only touch the
    /// engine through the data pipeline, and conflicting writers hold
    /// latches, so reads through the guard are consistent for the keys the
    /// request is allowed to touch.
    fn reader(&self) -> Result<MutexGuard<'_, E>> {
        Ok(self.engine.lock()?)
    }

    /// Submits a batch to the data pipeline and waits for durability.
    fn write_data(&self, batch: DataBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let tx = self.data_tx.as_ref().ok_or_else(|| Error::Internal("store is closed".into()))?;
        writer::submit(tx, batch)
    }

    /// Submits a batch to the lock pipeline and waits for durability.
    fn write_locks(&self, batch: LockBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let tx = self.lock_tx.as_ref().ok_or_else(|| Error::Internal("store is closed".into()))?;
        writer::submit(tx, batch)
    }
}

/// The outcome of checking the lock tables for one prewrite mutation.
enum PrewriteLock {
    /// The key is free to lock.
    Free,
    /// The key is already locked by the same transaction.
    Duplicate,
    /// The mutation fails with the given error.
    Blocked(Error),
}

/// Checks the engine for a prewrite of the encoded key at start_ts: a
/// version committed after start_ts is a write conflict. Returns whether any
/// committed version exists, for use at commit time.
fn check_prewrite_db<E: Engine>(engine: &mut E, dkey: &[u8], start_ts: u64) -> Result<bool> {
    let Some(bytes) = engine.get(dkey)? else { return Ok(false) };
    if Value::decode(&bytes)?.commit_ts > start_ts {
        return Err(Error::Retryable("write conflict".to_string()));
    }
    Ok(true)
}

/// Reads the newest version of the encoded key visible at ts, if any.
fn read_visible<E: Engine>(engine: &mut E, dkey: &[u8], ts: u64) -> Result<Option<Value>> {
    let Some(bytes) = engine.get(dkey)? else { return Ok(None) };
    let value = Value::decode(&bytes)?;
    if value.commit_ts <= ts {
        return Ok(Some(value));
    }
    // The latest version is too new. Old versions sort in descending commit
    // order, so the first one at or past the ts suffix is the newest visible
    // version.
    let from = keycode::append_ts(dkey.to_vec(), ts);
    let mut scan = engine.scan((Bound::Included(from), Bound::Unbounded));
    while let Some((key, bytes)) = scan.next().transpose()? {
        if !key.starts_with(dkey) {
            break;
        }
        return Ok(Some(Value::decode(&bytes)?));
    }
    Ok(None)
}

/// Collects up to limit engine keys from an encoded range. The limit is per
/// scan, independent of keys already accumulated by other scans.
fn collect_range_keys<E: Engine>(
    engine: &mut E,
    from: Vec<u8>,
    until: &[u8],
    keys: &mut Vec<Vec<u8>>,
    limit: usize,
) -> Result<()> {
    let mut collected = 0;
    let mut scan = engine.scan((Bound::Included(from), Bound::Unbounded));
    while let Some((key, _)) = scan.next().transpose()? {
        if reached_end(&key, until) {
            break;
        }
        keys.push(key);
        collected += 1;
        if collected == limit {
            break;
        }
    }
    Ok(())
}

/// Collects and removes expired rollback markers through the lock pipeline.
fn gc_expired_rollbacks(
    rollbacks: &MemStore,
    latest_ts: &AtomicU64,
    margin: u64,
    lock_tx: &Sender<Submission<LockBatch>>,
) -> Result<u64> {
    let horizon = latest_ts.load(Ordering::SeqCst).saturating_sub(margin);
    let mut batch = LockBatch::new();
    for (key, _) in rollbacks.iter() {
        // No in-flight transaction can still reference a marker this old.
        if keycode::decode_ts(&key)? < horizon {
            batch.delete_rollback(key);
        }
    }
    let count = batch.len() as u64;
    if count > 0 {
        writer::submit(lock_tx, batch)?;
    }
    Ok(count)
}

/// The rollback GC worker loop. Runs until the stop channel closes.
fn run_rollback_gc(
    rollbacks: Arc<MemStore>,
    latest_ts: Arc<AtomicU64>,
    lock_tx: Sender<Submission<LockBatch>>,
    stop_rx: Receiver<()>,
    opts: Options,
) {
    let ticker = crossbeam::channel::tick(opts.rollback_gc_interval);
    loop {
        crossbeam::select! {
            recv(stop_rx) -> _ => return,
            recv(ticker) -> _ => {
                match gc_expired_rollbacks(&rollbacks, &latest_ts, opts.rollback_gc_margin, &lock_tx) {
                    Ok(0) => {}
                    Ok(count) => debug!("removed {count} expired rollback markers"),
                    Err(err) => error!("rollback gc failed: {err}"),
                }
            }
        }
    }
}
