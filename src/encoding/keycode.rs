//! KeyCode is the lexicographical order-preserving binary encoding used for
//! engine and lock-table keys. It is designed for simplicity, not efficiency
//! (no varints or compression).
//!
//! Ordering is what makes multi-version storage work on a plain ordered
//! key/value engine: the latest committed version of a user key lives at the
//! encoded key itself, and every historical version lives at the encoded key
//! followed by an 8-byte big-endian suffix of the bitwise-NOT commit
//! timestamp. Inverting the timestamp makes newer versions sort before older
//! ones, so a forward scan from any suffix position yields versions in
//! descending commit order. Rollback markers use the same suffix layout with
//! the transaction's start timestamp.
//!
//! User keys are encoded by escaping 0x00 as 0x00ff and terminating with
//! 0x0000. Prefix-length encoding can't be used, since it violates ordering.
//! The terminator also guarantees that no encoded key is a prefix of a
//! different key's encoding, so a timestamp suffix can never collide with the
//! encoding of a longer user key.

use crate::error::Result;
use crate::errdata;

/// The length of the timestamp suffix on old-version and rollback keys.
pub const TS_SUFFIX_LEN: usize = 8;

/// Encodes a user key, preserving lexicographical ordering. The latest
/// committed version of the key is stored in the engine at this encoding.
pub fn encode_key(key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + 2);
    for &b in key {
        match b {
            0x00 => out.extend([0x00, 0xff]),
            b => out.push(b),
        }
    }
    out.extend([0x00, 0x00]);
    out
}

/// Decodes an encoded key back into the user key. Errors on malformed
/// escape sequences or a missing terminator.
pub fn decode_key(encoded: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(encoded.len());
    let mut iter = encoded.iter();
    loop {
        match iter.next() {
            Some(0x00) => match iter.next() {
                Some(0x00) => break,
                Some(0xff) => out.push(0x00),
                b => return errdata!("invalid escape {b:?} in key {encoded:x?}"),
            },
            Some(&b) => out.push(b),
            None => return errdata!("unterminated key {encoded:x?}"),
        }
    }
    if iter.next().is_some() {
        return errdata!("trailing bytes after key {encoded:x?}");
    }
    Ok(out)
}

/// Appends the inverted big-endian timestamp suffix to an encoded key.
pub fn append_ts(mut encoded: Vec<u8>, ts: u64) -> Vec<u8> {
    encoded.extend((!ts).to_be_bytes());
    encoded
}

/// Encodes the old-version key for a user key and commit timestamp. When
/// scanning forward from any old-version key, versions appear in descending
/// commit-timestamp order.
pub fn encode_old_key(key: &[u8], commit_ts: u64) -> Vec<u8> {
    append_ts(encode_key(key), commit_ts)
}

/// Encodes the rollback key for a user key and start timestamp. Rollback
/// keys exist only in the rollback table.
pub fn encode_rollback_key(key: &[u8], start_ts: u64) -> Vec<u8> {
    append_ts(encode_key(key), start_ts)
}

/// Decodes the timestamp from the trailing suffix of an old-version or
/// rollback key.
pub fn decode_ts(suffixed: &[u8]) -> Result<u64> {
    if suffixed.len() < TS_SUFFIX_LEN + 2 {
        return errdata!("key {suffixed:x?} too short for a timestamp suffix");
    }
    let tail: [u8; TS_SUFFIX_LEN] =
        suffixed[suffixed.len() - TS_SUFFIX_LEN..].try_into().expect("slice length checked");
    Ok(!u64::from_be_bytes(tail))
}

/// Returns true if the version stored at an old-version key is visible to a
/// read at start_ts, i.e. its commit timestamp is at or below start_ts.
pub fn is_visible_key(suffixed: &[u8], start_ts: u64) -> Result<bool> {
    Ok(start_ts >= decode_ts(suffixed)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_roundtrip() -> Result<()> {
        for key in [&b""[..], b"a", b"foo", b"\x00", b"\x00\xff", b"a\x00b"] {
            assert_eq!(decode_key(&encode_key(key))?, key.to_vec());
        }
        Ok(())
    }

    #[test]
    fn key_escaping() {
        assert_eq!(encode_key(b""), vec![0x00, 0x00]);
        assert_eq!(encode_key(b"\x00"), vec![0x00, 0xff, 0x00, 0x00]);
        assert_eq!(encode_key(b"a\x00b"), vec![0x61, 0x00, 0xff, 0x62, 0x00, 0x00]);
    }

    #[test]
    fn key_decode_errors() {
        assert!(decode_key(b"a").is_err()); // no terminator
        assert!(decode_key(&[0x00, 0x01]).is_err()); // bad escape
        assert!(decode_key(&[0x00, 0x00, 0x61]).is_err()); // trailing bytes
    }

    /// Encoded keys must order the same as their user keys, and no encoded
    /// key may prefix another key's encoding.
    #[test]
    fn key_ordering() {
        let keys: Vec<&[u8]> = vec![b"", b"\x00", b"\x00\x00", b"a", b"a\x00", b"ab", b"b"];
        let encoded: Vec<Vec<u8>> = keys.iter().map(|k| encode_key(k)).collect();
        let mut sorted = encoded.clone();
        sorted.sort();
        assert_eq!(sorted, encoded);

        for (i, a) in encoded.iter().enumerate() {
            for (j, b) in encoded.iter().enumerate() {
                if i != j {
                    assert!(!b.starts_with(a), "{:x?} prefixes {:x?}", a, b);
                }
            }
        }
    }

    /// Old-version keys must sort after their data key and in descending
    /// commit-timestamp order.
    #[test]
    fn old_key_ordering() -> Result<()> {
        let data = encode_key(b"k");
        let old: Vec<Vec<u8>> =
            [u64::MAX, 30, 20, 10, 0].iter().map(|&ts| encode_old_key(b"k", ts)).collect();
        let mut sorted = old.clone();
        sorted.sort();
        assert_eq!(sorted, old);
        assert!(old.iter().all(|k| *k > data && k.starts_with(&data)));

        // A different key's versions don't share the prefix.
        assert!(!encode_old_key(b"kk", 10).starts_with(&encode_old_key(b"k", 10)[..data.len()]));
        Ok(())
    }

    #[test]
    fn ts_roundtrip() -> Result<()> {
        for ts in [0, 1, 20, u64::MAX] {
            assert_eq!(decode_ts(&encode_old_key(b"k", ts))?, ts);
            assert_eq!(decode_ts(&encode_rollback_key(b"k", ts))?, ts);
        }
        assert!(decode_ts(b"short").is_err());
        Ok(())
    }

    #[test]
    fn visibility() -> Result<()> {
        let key = encode_old_key(b"k", 20);
        assert!(!is_visible_key(&key, 10)?);
        assert!(is_visible_key(&key, 20)?);
        assert!(is_visible_key(&key, 30)?);
        Ok(())
    }
}
