//! Secret commitment service over a plain TCP line protocol.
//!
//! A prover submits a secret and gets back an id plus two key references, one
//! for itself and one to hand to a verifier. The verifier later presents a
//! candidate secret with the id and its key reference and learns whether it
//! matches. The prover can poll the outcome with its own key reference.
//!
//! - [`store`] keeps commitment rows in memory with per-row locking.
//! - [`engine`] is the verification state machine and attempt throttling.
//! - [`crypto`] holds the hashing and key material collaborators.
//! - [`protocol`] parses `:::`-separated command lines and renders replies.
//! - [`server`] accepts TCP connections and runs one task per client.
//! - [`cli`] parses the command-line configuration.

pub mod cli;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod server;
pub mod store;

pub use error::{CommitmentError, Result};
