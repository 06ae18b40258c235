//! Core domain + lifecycle logic for the temporary channel bot.
//!
//! This crate is platform-agnostic. The chat platform (Discord today) lives
//! behind the `ChannelProvider` port implemented in adapter crates, and the
//! persisted records live behind the `RecordStore` port.

pub mod clock;
pub mod commands;
pub mod config;
pub mod domain;
pub mod errors;
pub mod lifecycle;
pub mod locks;
pub mod logging;
pub mod provider;
pub mod store;
pub mod sweeper;

#[cfg(test)]
mod testing;

pub use errors::{Error, Result};
