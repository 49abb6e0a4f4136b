//! Test fixtures
//!
//! Throw-away ledgers on temporary sled directories, mined at a low
//! difficulty so unit tests stay fast.

pub mod test_utils;

pub use test_utils::*;
