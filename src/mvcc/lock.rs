//! Lock and value records. A lock reserves a key for a pending transaction
//! between prewrite and commit; a value record is a committed version. Both
//! use fixed-layout little-endian encodings, since unlike keys they are never
//! compared byte-wise for ordering.

use crate::encoding::keycode;
use crate::errdata;
use crate::error::{Error, Result};

/// A mutation operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    /// Writes a value.
    Put = 0,
    /// Removes the key. Committed as a value record with an empty payload.
    Delete = 1,
    /// Locks the key without writing, e.g. for SELECT FOR UPDATE. Commit
    /// releases the lock without producing a version.
    Lock = 2,
}

impl TryFrom<u8> for Op {
    type Error = Error;

    fn try_from(b: u8) -> Result<Self> {
        match b {
            0 => Ok(Op::Put),
            1 => Ok(Op::Delete),
            2 => Ok(Op::Lock),
            b => errdata!("invalid operation {b}"),
        }
    }
}

/// A single mutation in a prewrite request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mutation {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub op: Op,
}

impl Mutation {
    /// A Put mutation of key to value.
    pub fn put(key: &[u8], value: &[u8]) -> Self {
        Self { key: key.to_vec(), value: value.to_vec(), op: Op::Put }
    }

    /// A Delete mutation of key.
    pub fn delete(key: &[u8]) -> Self {
        Self { key: key.to_vec(), value: Vec::new(), op: Op::Delete }
    }

    /// A Lock mutation of key.
    pub fn lock(key: &[u8]) -> Self {
        Self { key: key.to_vec(), value: Vec::new(), op: Op::Lock }
    }
}

/// A lock record, stored in the lock table at the encoded key.
///
/// Wire layout: start_ts (8 LE) | op (1) | has_old_ver (1) | ttl (4 LE) |
/// primary_len (2 LE) | primary | value. The primary key is stored in its
/// encoded form so all lock-table comparisons stay in one keyspace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lock {
    pub start_ts: u64,
    pub op: Op,
    /// Whether a committed version existed at prewrite time. Commit uses it
    /// to decide if the then-latest version must move to the old-version
    /// namespace.
    pub has_old_ver: bool,
    pub ttl: u32,
    pub primary: Vec<u8>,
    pub value: Vec<u8>,
}

impl Lock {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.primary.len() + self.value.len());
        out.extend(self.start_ts.to_le_bytes());
        out.push(self.op as u8);
        out.push(self.has_old_ver as u8);
        out.extend(self.ttl.to_le_bytes());
        out.extend((self.primary.len() as u16).to_le_bytes());
        out.extend(&self.primary);
        out.extend(&self.value);
        out
    }

    pub fn decode(mut bytes: &[u8]) -> Result<Self> {
        let start_ts = u64::from_le_bytes(take::<8>(&mut bytes)?);
        let op = Op::try_from(take::<1>(&mut bytes)?[0])?;
        let has_old_ver = match take::<1>(&mut bytes)?[0] {
            0 => false,
            1 => true,
            b => return errdata!("invalid has_old_ver flag {b}"),
        };
        let ttl = u32::from_le_bytes(take::<4>(&mut bytes)?);
        let primary_len = u16::from_le_bytes(take::<2>(&mut bytes)?) as usize;
        if bytes.len() < primary_len {
            return errdata!("lock record truncated: primary of {primary_len} bytes missing");
        }
        let (primary, value) = bytes.split_at(primary_len);
        Ok(Self {
            start_ts,
            op,
            has_old_ver,
            ttl,
            primary: primary.to_vec(),
            value: value.to_vec(),
        })
    }

    /// Builds the value record committed for this lock at commit_ts.
    pub fn into_value(self, commit_ts: u64) -> Value {
        Value { start_ts: self.start_ts, commit_ts, payload: self.value }
    }

    /// Checks whether this lock blocks a read at start_ts of the given
    /// encoded key. Point gets at u64::MAX against the lock's own primary
    /// key are administrative probes and bypass the lock; all other reads at
    /// or after the lock's start timestamp must wait for it to resolve.
    pub fn check(&self, key: &[u8], start_ts: u64) -> Result<()> {
        let lock_visible = self.start_ts < start_ts;
        let is_write_lock = matches!(self.op, Op::Put | Op::Delete);
        let is_primary_get = start_ts == u64::MAX && self.primary == key;
        if lock_visible && is_write_lock && !is_primary_get {
            return Err(self.blocked_error(key)?);
        }
        Ok(())
    }

    /// The Locked error for this lock at the given encoded key.
    pub fn blocked_error(&self, key: &[u8]) -> Result<Error> {
        Ok(Error::Locked {
            key: keycode::decode_key(key)?,
            primary: keycode::decode_key(&self.primary)?,
            start_ts: self.start_ts,
            ttl: self.ttl as u64,
        })
    }
}

/// A committed value record, stored in the engine at the encoded key (latest
/// version) or at a timestamp-suffixed old-version key.
///
/// Wire layout: start_ts (8 LE) | commit_ts (8 LE) | payload. An empty
/// payload is a deletion tombstone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Value {
    pub start_ts: u64,
    pub commit_ts: u64,
    pub payload: Vec<u8>,
}

impl Value {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.payload.len());
        out.extend(self.start_ts.to_le_bytes());
        out.extend(self.commit_ts.to_le_bytes());
        out.extend(&self.payload);
        out
    }

    pub fn decode(mut bytes: &[u8]) -> Result<Self> {
        let start_ts = u64::from_le_bytes(take::<8>(&mut bytes)?);
        let commit_ts = u64::from_le_bytes(take::<8>(&mut bytes)?);
        Ok(Self { start_ts, commit_ts, payload: bytes.to_vec() })
    }

    /// The live payload, treating the empty tombstone payload as absent.
    pub fn into_payload(self) -> Option<Vec<u8>> {
        if self.payload.is_empty() {
            None
        } else {
            Some(self.payload)
        }
    }
}

/// Metadata about a pending lock, as returned by lock scans. Keys are user
/// keys.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockInfo {
    pub key: Vec<u8>,
    pub primary: Vec<u8>,
    pub start_ts: u64,
    pub ttl: u64,
}

/// Takes N bytes off the front of the slice, or errors on truncated records.
fn take<const N: usize>(bytes: &mut &[u8]) -> Result<[u8; N]> {
    if bytes.len() < N {
        return errdata!("record truncated: want {N} bytes, have {}", bytes.len());
    }
    let (head, tail) = bytes.split_at(N);
    *bytes = tail;
    Ok(head.try_into().expect("length checked above"))
}
