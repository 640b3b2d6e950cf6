//! Shared fixtures for unit tests
//!
//! Temporary chains with a minted genesis, signed transfers and helpers to grow a chain
//! block by block.

pub mod test_utils;

pub use test_utils::*;
