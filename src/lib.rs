#![warn(clippy::all)]

pub mod encoding;
pub mod error;
pub mod mvcc;
pub mod storage;

pub use error::{Error, Result};
pub use mvcc::MvccStore;
