//! Pad-stream derivation.
//!
//! For each shared secret and round number, both sides of a client/trustee
//! pair expand the same pseudo-random pad: a ChaCha20 stream seeded with
//! `SHA-256(domain ‖ compressed_secret ‖ round_be)`. XOR is self-inverse,
//! so identical bytes on both sides cancel in the combined cell.

use curve25519_dalek_ng::ristretto::RistrettoPoint;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use sha2::{Digest, Sha256};

use super::{gf128, secret_bytes};

const PAD_DOMAIN: &[u8] = b"dcnet-pad-v1";
const EQUIV_DOMAIN: &[u8] = b"dcnet-equiv-v1";
const BLIND_DOMAIN: &[u8] = b"dcnet-blind-v1";

fn seed(domain: &[u8], key: &[u8], round: u32) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(domain);
    hasher.update(key);
    hasher.update(round.to_be_bytes());
    hasher.finalize().into()
}

/// Expands `len` pad bytes for one (secret, round) pair.
pub fn pad_bytes(secret: &RistrettoPoint, round: u32, len: usize) -> Vec<u8> {
    let mut rng = ChaCha20Rng::from_seed(seed(PAD_DOMAIN, &secret_bytes(secret), round));
    let mut out = vec![0u8; len];
    rng.fill_bytes(&mut out);
    out
}

/// XORs the pad for one (secret, round) pair into `out`.
pub fn xor_pad(out: &mut [u8], secret: &RistrettoPoint, round: u32) {
    let pad = pad_bytes(secret, round, out.len());
    for (byte, pad_byte) in out.iter_mut().zip(pad) {
        *byte ^= pad_byte;
    }
}

/// Derives the per-pair equivocation element for one round.
pub fn equivocation_element(secret: &RistrettoPoint, round: u32) -> u128 {
    let digest = seed(EQUIV_DOMAIN, &secret_bytes(secret), round);
    gf128::from_bytes(&digest[..16].try_into().expect("digest is 32 bytes"))
}

/// Expands the blinding stream for a 16-byte key and round.
pub fn blind_stream(key: u128, round: u32, len: usize) -> Vec<u8> {
    let mut rng = ChaCha20Rng::from_seed(seed(BLIND_DOMAIN, &gf128::to_bytes(key), round));
    let mut out = vec![0u8; len];
    rng.fill_bytes(&mut out);
    out
}
