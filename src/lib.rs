//! Anonymous-communication relay built on a dining-cryptographers network.
//!
//! # Overview
//!
//! A set of clients transmit bit-commitments that XOR-combine, through a
//! central relay, into a single anonymous output cell per round. Trustees
//! contribute pseudo-random pads (known only pairwise to each client) so
//! that no coalition smaller than all trustees can deanonymize a sender.
//! Anonymous write-slots are assigned by a verifiable shuffle of ephemeral
//! public keys.
//!
//! Three roles cooperate:
//!
//! - [`relay::Relay`] (one instance, the star center): accepts connections,
//!   drives setup, runs the windowed round scheduler, broadcasts downstream,
//!   XOR-combines upstream, and exposes the anonymous plaintext to the
//!   egress.
//! - [`client::Client`] (two or more): maintains pairwise shared secrets
//!   with every trustee, learns its anonymous slot from the shuffle, and
//!   emits one DC-net ciphertext per round.
//! - [`trustee::Trustee`] (one or more): maintains pairwise shared secrets
//!   with every client, emits one DC-net pad per round, and performs one
//!   shuffle in the chain during setup.
//!
//! # Status
//!
//! `dcnet` is ALPHA software and not yet recommended for production use.

pub mod client;
pub mod codec;
pub mod coder;
pub mod config;
pub mod crypto;
pub mod message;
pub mod metrics;
pub mod net;
pub mod relay;
pub mod schedule;
pub mod socks;
pub mod state;
pub mod trustee;

use thiserror::Error;

/// Top-level failure taxonomy.
///
/// Setup-fatal and peer-lost conditions are recoverable at the relay (they
/// trigger a resync); cryptographic verification failures and configuration
/// errors are fatal to the process that observes them.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or missing configuration.
    #[error("configuration: {0}")]
    Config(String),

    /// A cryptographic check failed (signature, proof, or slot recognition).
    #[error("verification: {0}")]
    Verification(String),

    /// Wire-level failure on a peer connection.
    #[error("net: {0}")]
    Net(#[from] net::Error),

    /// Malformed bytes at a parse boundary.
    #[error("codec: {0}")]
    Codec(#[from] codec::Error),

    /// A peer disconnected or timed out mid-protocol.
    #[error("peer lost: {0}")]
    PeerLost(String),

    /// A message arrived in a state that does not accept it.
    #[error("out-of-phase message {message} in state {state}")]
    OutOfPhase {
        message: &'static str,
        state: &'static str,
    },
}

impl Error {
    /// Process exit code for this error: 1 configuration, 2 cryptographic
    /// verification failure, 3 I/O fatal.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(_) => 1,
            Error::Verification(_) => 2,
            _ => 3,
        }
    }
}
