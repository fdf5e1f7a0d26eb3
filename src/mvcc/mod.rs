//! This module implements the transactional MVCC (Multi-Version Concurrency
//! Control) core of a storage node: a two-phase commit participant over an
//! ordered key/value engine, giving concurrent transactions snapshot-isolated
//! reads and serializable writes under an external timestamp oracle.
//!
//! VERSIONS
//! ========
//!
//! Every committed write produces a version identified by its transaction's
//! commit timestamp. The engine stores the latest version of a user key at
//! the key's order-preserving encoding, and each older version at the
//! encoding followed by the bitwise-NOT of its commit timestamp in big-endian
//! form, so a forward scan yields versions newest-first (see
//! [`crate::encoding::keycode`]). A read at timestamp T sees the newest
//! version with commit timestamp at or below T. Deletions are versions with
//! an empty payload.
//!
//! TWO-PHASE COMMIT
//! ================
//!
//! A transaction takes a start timestamp, then prewrites all its mutations:
//! each key is checked for conflicts and locked with a record carrying the
//! start timestamp, the mutation, and the transaction's primary key. A
//! transaction with all its prewrites in place is committed by taking a
//! commit timestamp, writing the committed versions, and removing the locks.
//! The primary key's lock is the transaction's commit point: a reader that
//! finds a stale lock settles the transaction's fate by consulting its
//! primary, then resolves the lock (resolve_lock) either way.
//!
//! Prewrite conflicts are of two kinds. A lock held by another transaction
//! blocks the prewrite until resolved (Locked). A version committed after
//! the start timestamp means the transaction read stale data and must retry
//! at a newer timestamp (Retryable).
//!
//! Rollbacks must fence out their transaction's own late-arriving prewrites:
//! a rolled-back key gets a rollback marker keyed by start timestamp, and a
//! prewrite finding a marker fails permanently (AlreadyRollback). Markers
//! are held in memory only and garbage collected once no transaction that
//! old can still appear.
//!
//! LOCKS, TABLES, AND LATCHES
//! ==========================
//!
//! Locks and rollback markers live in in-memory ordered tables
//! ([`memstore`]) read lock-free by any thread. Writers serialize per key
//! through region latches ([`region`]): every writer hashes its keys, locks
//! the corresponding latch slots in sorted order, and holds them across its
//! read-check-write cycle.
//!
//! DURABILITY
//! ==========
//!
//! All writes flow through two pipelines ([`writer`]): one applies engine
//! batches, the other applies lock-table batches and persists lock changes
//! to a side log replayed at startup. Commit orders the two streams: the
//! data batch must be durable before the lock deletion is submitted, so a
//! crash between them leaves both the committed value and the lock, a state
//! the next commit attempt recognizes as already committed. The reverse
//! order could lose the committed value while the lock's removal claims it
//! was durable.

pub mod lock;
pub mod memstore;
pub mod region;
pub mod store;
pub mod writer;

pub use lock::{Lock, LockInfo, Mutation, Op, Value};
pub use region::{RegionCtx, RequestCtx, TraceEvent};
pub use store::{MvccStore, Options, Status};
