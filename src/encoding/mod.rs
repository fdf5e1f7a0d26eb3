//! Binary data encodings.
//!
//! - keycode: order-preserving encoding for engine and lock-table keys,
//!   including the timestamp-suffixed old-version and rollback keys.
//! - bincode: used for the persisted lock log.
pub mod bincode;
pub mod keycode;
