//! Vote collection and decryption for short-lived electronic polls.
//!
//! The crate is built from two coupled state machines: the ballot [`Backend`]
//! that owns a poll's lifecycle (`absent → open → closed`) and deduplicates
//! voters, and the [`decrypt::Decrypt`] engine that mints poll-scoped
//! keypairs, decrypts end-to-end encrypted ballots and signs the terminal
//! artifact. [`VoteService`] composes them behind the operations the HTTP
//! layer consumes.

#[macro_use]
extern crate serde;

pub mod backends;
pub mod ballot;
pub mod config;
pub mod counter;
pub mod crypto;
pub mod decrypt;
mod error;
pub mod keystore;
pub mod poll;
pub mod serde_base64;
mod vote;

pub use backends::{Backend, BackendError, MemoryBackend};
pub use config::{ConfigSource, MemoryConfig, PollSnapshot};
pub use counter::{CountState, VoteCounter};
pub use decrypt::{Decrypt, Decrypter};
pub use error::VoteError;
pub use vote::{PollKey, StopResult, VoteService};

#[cfg(test)]
mod tests;
