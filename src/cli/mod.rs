//! Command-line interface
//!
//! Argument parsing for the `aurum-chain` binary. Environment variables are read here
//! through clap and nowhere else.

pub mod commands;

pub use commands::{Command, NodeArgs, Opt};
