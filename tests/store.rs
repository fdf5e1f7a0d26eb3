//! End-to-end tests of the MVCC store through the public API, focused on
//! restart recovery.

use txnkv::error::{Error, Result};
use txnkv::mvcc::{Mutation, MvccStore, Options, RegionCtx, RequestCtx};
use txnkv::storage::Memory;

use std::sync::Arc;

fn open(dir: &std::path::Path) -> Result<MvccStore<Memory>> {
    MvccStore::open(Memory::new(), dir, Options::default())
}

/// Locks survive a restart via the lock log, and the pending transaction can
/// be committed by the next incarnation.
#[test]
fn locks_survive_restart() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let region = Arc::new(RegionCtx::new(b"", b""));

    let mut store = open(dir.path())?;
    let mut req = RequestCtx::new(region.clone());
    let errs = store.prewrite(&mut req, &[Mutation::put(b"a", b"1")], b"a", 10, 1000)?;
    assert_eq!(errs, Vec::new());
    store.close()?;

    // The lock is live again after reopening, and still blocks readers.
    let mut store = open(dir.path())?;
    assert_eq!(store.status()?.locks, 1);
    assert!(matches!(
        store.check_keys_lock(20, &[b"a"]),
        Err(Error::Locked { start_ts: 10, .. })
    ));

    // The transaction commits as if nothing happened.
    store.commit(&mut RequestCtx::new(region.clone()), &[b"a".to_vec()], 10, 20)?;
    assert_eq!(store.get(&mut RequestCtx::new(region.clone()), b"a", 30)?, Some(b"1".to_vec()));
    store.close()?;

    // A clean shutdown after the commit leaves no locks behind.
    let store = open(dir.path())?;
    assert_eq!(store.status()?.locks, 0);
    Ok(())
}

/// Rollback markers are memory-only: they do not survive a restart, and the
/// key is free for new transactions afterwards.
#[test]
fn rollback_markers_not_persisted() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let region = Arc::new(RegionCtx::new(b"", b""));

    let mut store = open(dir.path())?;
    store.rollback(&mut RequestCtx::new(region.clone()), &[b"k".to_vec()], 10)?;
    assert_eq!(store.status()?.rollbacks, 1);
    store.close()?;

    let store = open(dir.path())?;
    assert_eq!(store.status()?.rollbacks, 0);
    let mut req = RequestCtx::new(region.clone());
    let errs = store.prewrite(&mut req, &[Mutation::put(b"k", b"1")], b"k", 11, 1000)?;
    assert_eq!(errs, Vec::new());
    Ok(())
}

/// A plain multi-key two-phase commit through the public API.
#[test]
fn multi_key_transaction() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let region = Arc::new(RegionCtx::new(b"", b""));
    let mut store = open(dir.path())?;

    let mutations =
        [Mutation::put(b"acct/alice", b"90"), Mutation::put(b"acct/bob", b"110")];
    let mut req = RequestCtx::new(region.clone());
    assert_eq!(store.prewrite(&mut req, &mutations, b"acct/alice", 10, 1000)?, Vec::new());

    let keys = vec![b"acct/alice".to_vec(), b"acct/bob".to_vec()];
    store.commit(&mut RequestCtx::new(region.clone()), &keys, 10, 20)?;

    let mut req = RequestCtx::new(region.clone());
    assert_eq!(store.get(&mut req, b"acct/alice", 30)?, Some(b"90".to_vec()));
    assert_eq!(store.get(&mut req, b"acct/bob", 30)?, Some(b"110".to_vec()));
    assert_eq!(store.status()?.locks, 0);
    store.close()?;
    Ok(())
}
