use serde_derive::{Deserialize, Serialize};

/// txnkv errors. The transaction-protocol variants (Locked, AlreadyRollback,
/// AlreadyCommitted, Replaced, LockNotFound, Retryable) are returned to
/// clients, which react to them as part of the two-phase commit protocol.
/// The remaining variants signal data corruption, IO failures, or internal
/// invariant violations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Error {
    /// Rollback was attempted on a transaction that already committed at the
    /// given commit timestamp.
    AlreadyCommitted(u64),
    /// A rollback marker exists for this key and start timestamp, so the
    /// prewrite must not succeed.
    AlreadyRollback,
    /// Invalid data, e.g. a corrupt lock or value record.
    InvalidData(String),
    /// An internal error, e.g. a poisoned latch or a stopped worker.
    Internal(String),
    /// An input/output error.
    IO(String),
    /// Commit found no lock for the key and no evidence that the transaction
    /// committed.
    LockNotFound,
    /// A concurrent writer holds a lock that blocks this operation. Carries
    /// the lock's metadata so the caller can resolve it via its primary key.
    Locked { key: Vec<u8>, primary: Vec<u8>, start_ts: u64, ttl: u64 },
    /// The lock found at the key belongs to a different transaction; the
    /// original lock was likely rolled back and overwritten.
    Replaced,
    /// The operation lost a conflict and should be retried with a new start
    /// timestamp.
    Retryable(String),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::AlreadyCommitted(ts) => write!(f, "already committed at {ts}"),
            Error::AlreadyRollback => write!(f, "already rolled back"),
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::Internal(msg) => write!(f, "internal error: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::LockNotFound => write!(f, "lock not found"),
            Error::Locked { key, start_ts, .. } => {
                write!(f, "key {key:x?} is locked by transaction {start_ts}")
            }
            Error::Replaced => write!(f, "lock replaced by another transaction"),
            Error::Retryable(msg) => write!(f, "retryable: {msg}"),
        }
    }
}

/// Constructs an Error::InvalidData via format!() and into().
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::InvalidData(format!($($args)*)).into() };
}

/// A txnkv Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Allows converting an Error into a Result via into(), as the errdata!
/// macro does.
impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        // A poisoned mutex means a writer panicked mid-mutation; treat it as
        // fatal rather than limping along with unknown state.
        Error::Internal(format!("lock poisoned: {err}"))
    }
}

impl<T> From<crossbeam::channel::SendError<T>> for Error {
    fn from(_: crossbeam::channel::SendError<T>) -> Self {
        Error::Internal("write pipeline stopped".to_string())
    }
}

impl From<crossbeam::channel::RecvError> for Error {
    fn from(_: crossbeam::channel::RecvError) -> Self {
        Error::Internal("write pipeline stopped".to_string())
    }
}
