//! Bincode is used to encode the entries of the persisted lock log. It is a
//! Rust-specific encoding that depends on the internal data structures being
//! stable, but it's sufficient here. See:
//! https://github.com/bincode-org/bincode
//!
//! This module wraps the standard bincode crate to change the default options,
//! in particular to use variable-length rather than fixed-length integers.
//! Confusingly, upstream bincode::(de)serialize uses different options (fixed)
//! than DefaultOptions (variable) -- this module always uses DefaultOptions.

use crate::error::Result;

use bincode::Options;

/// Returns the default Bincode options, initialized on first use.
fn bincode() -> &'static bincode::DefaultOptions {
    static BINCODE: std::sync::OnceLock<bincode::DefaultOptions> = std::sync::OnceLock::new();
    BINCODE.get_or_init(bincode::DefaultOptions::new)
}

/// Deserializes a value from a reader using Bincode, or returns None at a
/// clean or truncated end of the stream. A truncated trailing entry marks the
/// point where an earlier crash interrupted an append; everything before it
/// is valid.
pub fn maybe_deserialize_from<R: std::io::Read, T: serde::de::DeserializeOwned>(
    reader: R,
) -> Result<Option<T>> {
    match bincode().deserialize_from(reader) {
        Ok(v) => Ok(Some(v)),
        Err(e) => match *e {
            bincode::ErrorKind::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
            _ => Err(e.into()),
        },
    }
}

/// Serializes a value to a writer using Bincode.
pub fn serialize_into<W: std::io::Write, T: serde::Serialize>(writer: W, value: &T) -> Result<()> {
    Ok(bincode().serialize_into(writer, value)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_roundtrip() -> Result<()> {
        let mut buf = Vec::new();
        serialize_into(&mut buf, &(b"key".to_vec(), b"value".to_vec()))?;
        serialize_into(&mut buf, &(b"other".to_vec(), Vec::<u8>::new()))?;

        let mut reader = buf.as_slice();
        let mut entries = Vec::new();
        while let Some(entry) = maybe_deserialize_from::<_, (Vec<u8>, Vec<u8>)>(&mut reader)? {
            entries.push(entry);
        }
        assert_eq!(
            entries,
            vec![(b"key".to_vec(), b"value".to_vec()), (b"other".to_vec(), Vec::new())]
        );
        Ok(())
    }

    #[test]
    fn truncated_tail() -> Result<()> {
        let mut buf = Vec::new();
        serialize_into(&mut buf, &(b"key".to_vec(), b"value".to_vec()))?;
        let full = buf.len();
        serialize_into(&mut buf, &(b"partial".to_vec(), b"entry".to_vec()))?;
        buf.truncate(full + 3);

        let mut reader = buf.as_slice();
        assert_eq!(
            maybe_deserialize_from::<_, (Vec<u8>, Vec<u8>)>(&mut reader)?,
            Some((b"key".to_vec(), b"value".to_vec()))
        );
        assert_eq!(maybe_deserialize_from::<_, (Vec<u8>, Vec<u8>)>(&mut reader)?, None);
        Ok(())
    }
}
