//! Cryptographic primitives: the Ristretto group surface, keypairs, and
//! pairwise shared secrets.
//!
//! All protocol cryptography lives on the Ristretto group over
//! Curve25519. Long-term and ephemeral identities are `(Scalar,
//! RistrettoPoint)` pairs; a client and a trustee derive the same shared
//! secret `priv_a · pub_b = priv_b · pub_a` from their static keys, and
//! every pad stream is keyed from that point.

use curve25519_dalek_ng::{
    constants::RISTRETTO_BASEPOINT_POINT,
    ristretto::{CompressedRistretto, RistrettoPoint},
    scalar::Scalar,
};
use rand::{CryptoRng, RngCore};

pub mod gf128;
pub mod nizk;
pub mod pad;
pub mod schnorr;
pub mod shuffle;

/// The group generator used for all keys and shuffle bases.
pub fn generator() -> RistrettoPoint {
    RISTRETTO_BASEPOINT_POINT
}

/// A private scalar and its public point.
#[derive(Clone)]
pub struct Keypair {
    pub private: Scalar,
    pub public: RistrettoPoint,
}

impl Keypair {
    /// Generates a fresh keypair.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let private = Scalar::random(rng);
        let public = private * RISTRETTO_BASEPOINT_POINT;
        Self { private, public }
    }

    /// Reconstructs a keypair from a canonical private-scalar encoding.
    pub fn from_private_bytes(bytes: [u8; 32]) -> Option<Self> {
        let private = Scalar::from_canonical_bytes(bytes)?;
        let public = private * RISTRETTO_BASEPOINT_POINT;
        Some(Self { private, public })
    }
}

/// Derives the pairwise shared secret `private · peer_public`.
pub fn shared_secret(private: &Scalar, peer_public: &RistrettoPoint) -> RistrettoPoint {
    private * peer_public
}

/// Compressed form of a shared secret, used as PRF key material.
pub fn secret_bytes(secret: &RistrettoPoint) -> [u8; 32] {
    secret.compress().to_bytes()
}

/// Decompresses an encoded point, rejecting invalid encodings.
pub fn decompress(bytes: &[u8; 32]) -> Option<RistrettoPoint> {
    CompressedRistretto(*bytes).decompress()
}

/// Converts a byte slice to a lowercase hexadecimal string.
pub fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Parses a hexadecimal string, ignoring an optional `0x` prefix.
pub fn from_hex(value: &str) -> Option<Vec<u8>> {
    let value = value.trim().trim_start_matches("0x");
    if value.len() % 2 != 0 {
        return None;
    }
    (0..value.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&value[i..i + 2], 16).ok())
        .collect()
}
