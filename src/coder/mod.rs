//! Per-round DC-net cell encoding and decoding.
//!
//! Every participant derives one pad per shared secret per round and XORs
//! them into its cell; the pads cancel pairwise when the relay combines
//! every client and trustee cell for a round, leaving the slot owner's
//! plaintext (or the zero cell when no slot is open):
//!
//! ```text
//! ⊕ client_cell_r ⊕ ⊕ trustee_cell_r = slot_owner_plaintext_r
//! ```
//!
//! With equivocation protection enabled, the first 16 bytes of every cell
//! carry a GF(2^128) tag instead of payload. The slot owner blinds its
//! payload under a fresh key `k` and publishes `τ = k ⊕ (h ⊗ Σ p)` where
//! `h` is its view of the downstream history and the `p` are per-pair
//! elements; trustees publish `σ = Σ p`. The relay recovers
//! `k = Σ τ ⊕ (h_relay ⊗ Σ σ)`, which matches only if every client's
//! history agrees with the relay's own. A client that saw a divergent
//! downstream past garbles the cell irrecoverably instead of leaking it.

use curve25519_dalek_ng::ristretto::RistrettoPoint;
use rand::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::crypto::{gf128, pad};

/// Width of the equivocation tag field.
pub const EQUIVOCATION_TAG_LEN: usize = 16;

/// Which side of the pad derivation a coder sits on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Client,
    Trustee,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("cell has {actual} bytes, expected {expected}")]
    WrongCellSize { expected: usize, actual: usize },
    #[error("payload of {payload} bytes exceeds capacity {capacity}")]
    PayloadTooLarge { payload: usize, capacity: usize },
    #[error("decode not started")]
    NotStarted,
}

/// A participant-side cell coder.
pub struct CellCoder {
    role: Role,
    payload_size: usize,
    equivocation: bool,
    secrets: Vec<RistrettoPoint>,
    history: [u8; 32],
}

impl CellCoder {
    pub fn new(
        role: Role,
        payload_size: usize,
        equivocation: bool,
        secrets: Vec<RistrettoPoint>,
    ) -> Self {
        Self {
            role,
            payload_size,
            equivocation,
            secrets,
            history: initial_history(),
        }
    }

    /// The wire size of every cell.
    pub fn cell_size(&self) -> usize {
        self.payload_size
    }

    /// Usable payload bytes per cell after protocol overhead.
    pub fn payload_capacity(&self) -> usize {
        if self.equivocation {
            self.payload_size - EQUIVOCATION_TAG_LEN
        } else {
            self.payload_size
        }
    }

    /// Folds one downstream payload into the history hash.
    pub fn update_history(&mut self, downstream: &[u8]) {
        self.history = chain_history(&self.history, downstream);
    }

    /// The current history digest.
    pub fn history(&self) -> [u8; 32] {
        self.history
    }

    /// Encodes the client cell for `round`.
    ///
    /// Returns the wire cell and the exact plaintext that decoding will
    /// produce for it (the payload zero-extended to capacity), which the
    /// caller hashes for disruption-protection bookkeeping.
    pub fn encode_for_round<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
        round: u32,
        slot_owner: bool,
        payload: &[u8],
    ) -> Result<(Vec<u8>, Vec<u8>), Error> {
        debug_assert_eq!(self.role, Role::Client);
        let capacity = self.payload_capacity();
        if payload.len() > capacity {
            return Err(Error::PayloadTooLarge {
                payload: payload.len(),
                capacity,
            });
        }
        let mut plain = vec![0u8; capacity];
        plain[..payload.len()].copy_from_slice(payload);

        let mut body = plain.clone();
        let mut cell = Vec::with_capacity(self.payload_size);
        if self.equivocation {
            let mut key = 0u128;
            if slot_owner {
                while key == 0 {
                    let mut bytes = [0u8; 16];
                    rng.fill_bytes(&mut bytes);
                    key = gf128::from_bytes(&bytes);
                }
                for (byte, blind) in body
                    .iter_mut()
                    .zip(pad::blind_stream(key, round, capacity))
                {
                    *byte ^= blind;
                }
            }
            let h = gf128::from_bytes(&self.history[..16].try_into().expect("32-byte digest"));
            let mut sum = 0u128;
            for secret in &self.secrets {
                sum ^= pad::equivocation_element(secret, round);
            }
            let tag = key ^ gf128::mul(h, sum);
            cell.extend_from_slice(&gf128::to_bytes(tag));
        }
        for secret in &self.secrets {
            pad::xor_pad(&mut body, secret, round);
        }
        cell.extend_from_slice(&body);
        Ok((cell, plain))
    }

    /// Encodes the trustee cell for `round`: pads only, plus the
    /// history-free equivocation tag.
    pub fn encode_trustee(&self, round: u32) -> Vec<u8> {
        debug_assert_eq!(self.role, Role::Trustee);
        let capacity = self.payload_capacity();
        let mut body = vec![0u8; capacity];
        for secret in &self.secrets {
            pad::xor_pad(&mut body, secret, round);
        }
        let mut cell = Vec::with_capacity(self.payload_size);
        if self.equivocation {
            let mut sum = 0u128;
            for secret in &self.secrets {
                sum ^= pad::equivocation_element(secret, round);
            }
            cell.extend_from_slice(&gf128::to_bytes(sum));
        }
        cell.extend_from_slice(&body);
        cell
    }
}

/// The relay-side accumulator.
///
/// Pure XOR accumulation: client and trustee cells may arrive in any
/// order between [`RelayDecoder::start`] and [`RelayDecoder::finish`].
///
/// With a pipeline window the relay's own history runs ahead of the
/// round being decoded, so [`RelayDecoder::start`] takes the history
/// snapshot that was current when that round was broadcast.
pub struct RelayDecoder {
    payload_size: usize,
    equivocation: bool,
    history: [u8; 32],
    round: u32,
    body: Vec<u8>,
    client_tags: u128,
    trustee_tags: u128,
    started: bool,
    /// Blinding key recovered by the last [`RelayDecoder::finish`]; kept
    /// for blame arbitration over retained rounds.
    pub last_key: u128,
}

impl RelayDecoder {
    pub fn new(payload_size: usize, equivocation: bool) -> Self {
        Self {
            payload_size,
            equivocation,
            history: initial_history(),
            round: 0,
            body: Vec::new(),
            client_tags: 0,
            trustee_tags: 0,
            started: false,
            last_key: 0,
        }
    }

    fn body_len(&self) -> usize {
        if self.equivocation {
            self.payload_size - EQUIVOCATION_TAG_LEN
        } else {
            self.payload_size
        }
    }

    /// Begins accumulation for `round`, decoded under `history`.
    pub fn start(&mut self, round: u32, history: [u8; 32]) {
        self.round = round;
        self.history = history;
        self.body = vec![0u8; self.body_len()];
        self.client_tags = 0;
        self.trustee_tags = 0;
        self.started = true;
    }

    fn absorb(&mut self, cell: &[u8], tags_client: bool) -> Result<(), Error> {
        if !self.started {
            return Err(Error::NotStarted);
        }
        if cell.len() != self.payload_size {
            return Err(Error::WrongCellSize {
                expected: self.payload_size,
                actual: cell.len(),
            });
        }
        let body = if self.equivocation {
            let tag = gf128::from_bytes(
                &cell[..EQUIVOCATION_TAG_LEN]
                    .try_into()
                    .expect("tag field is 16 bytes"),
            );
            if tags_client {
                self.client_tags ^= tag;
            } else {
                self.trustee_tags ^= tag;
            }
            &cell[EQUIVOCATION_TAG_LEN..]
        } else {
            cell
        };
        for (accumulated, byte) in self.body.iter_mut().zip(body) {
            *accumulated ^= byte;
        }
        Ok(())
    }

    /// Absorbs one client cell.
    pub fn decode_client(&mut self, cell: &[u8]) -> Result<(), Error> {
        self.absorb(cell, true)
    }

    /// Absorbs one trustee cell.
    pub fn decode_trustee(&mut self, cell: &[u8]) -> Result<(), Error> {
        self.absorb(cell, false)
    }

    /// Finishes the round and returns the anonymous plaintext.
    pub fn finish(&mut self) -> Result<Vec<u8>, Error> {
        if !self.started {
            return Err(Error::NotStarted);
        }
        self.started = false;
        let mut plain = std::mem::take(&mut self.body);
        if self.equivocation {
            let h = gf128::from_bytes(&self.history[..16].try_into().expect("32-byte digest"));
            let key = self.client_tags ^ gf128::mul(h, self.trustee_tags);
            self.last_key = key;
            if key != 0 {
                for (byte, blind) in plain
                    .iter_mut()
                    .zip(pad::blind_stream(key, self.round, self.body_len()))
                {
                    *byte ^= blind;
                }
            }
        }
        Ok(plain)
    }
}

/// The history every participant starts a setup from.
pub fn initial_history() -> [u8; 32] {
    // Any constant, non-empty seed; both sides start from the same value.
    Sha256::digest(b"dcnet-history-init").into()
}

/// Folds one downstream payload into a history digest.
pub fn chain_history(history: &[u8; 32], downstream: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(history);
    hasher.update(downstream);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{shared_secret, Keypair};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    struct Net {
        clients: Vec<CellCoder>,
        trustees: Vec<CellCoder>,
        relay: RelayDecoder,
        relay_history: [u8; 32],
    }

    fn build(n_clients: usize, n_trustees: usize, payload: usize, equivocation: bool) -> Net {
        let mut rng = StdRng::seed_from_u64(0xDC);
        let client_keys: Vec<_> = (0..n_clients).map(|_| Keypair::generate(&mut rng)).collect();
        let trustee_keys: Vec<_> = (0..n_trustees)
            .map(|_| Keypair::generate(&mut rng))
            .collect();

        let clients = client_keys
            .iter()
            .map(|client| {
                let secrets = trustee_keys
                    .iter()
                    .map(|trustee| shared_secret(&client.private, &trustee.public))
                    .collect();
                CellCoder::new(Role::Client, payload, equivocation, secrets)
            })
            .collect();
        let trustees = trustee_keys
            .iter()
            .map(|trustee| {
                let secrets = client_keys
                    .iter()
                    .map(|client| shared_secret(&trustee.private, &client.public))
                    .collect();
                CellCoder::new(Role::Trustee, payload, equivocation, secrets)
            })
            .collect();
        Net {
            clients,
            trustees,
            relay: RelayDecoder::new(payload, equivocation),
            relay_history: initial_history(),
        }
    }

    fn run_round(net: &mut Net, round: u32, owner: Option<usize>, payload: &[u8]) -> Vec<u8> {
        let mut rng = StdRng::seed_from_u64(round as u64);
        net.relay.start(round, net.relay_history);
        for (index, client) in net.clients.iter().enumerate() {
            let is_owner = owner == Some(index);
            let data = if is_owner { payload } else { &[] };
            let (cell, _) = client
                .encode_for_round(&mut rng, round, is_owner, data)
                .unwrap();
            net.relay.decode_client(&cell).unwrap();
        }
        for trustee in &net.trustees {
            net.relay.decode_trustee(&trustee.encode_trustee(round)).unwrap();
        }
        net.relay.finish().unwrap()
    }

    #[test]
    fn test_decode_correctness() {
        let mut net = build(3, 2, 32, false);
        let plain = run_round(&mut net, 5, Some(1), b"HELLO_WORLD_AAAA");
        assert_eq!(&plain[..16], b"HELLO_WORLD_AAAA");
        assert!(plain[16..].iter().all(|byte| *byte == 0));
    }

    #[test]
    fn test_zero_on_empty() {
        let mut net = build(2, 1, 16, false);
        for round in 1..=10 {
            assert_eq!(run_round(&mut net, round, None, &[]), vec![0u8; 16]);
        }
    }

    #[test]
    fn test_equivocation_round_trip() {
        let mut net = build(2, 1, 32, true);
        let plain = run_round(&mut net, 3, Some(0), b"HELLO");
        assert_eq!(&plain[..5], b"HELLO");
        // Capacity shrinks by the tag width.
        assert_eq!(plain.len(), 16);
    }

    #[test]
    fn test_equivocation_zero_on_empty() {
        let mut net = build(2, 1, 32, true);
        assert_eq!(run_round(&mut net, 4, None, &[]), vec![0u8; 16]);
    }

    #[test]
    fn test_equivocation_detects_history_divergence() {
        let mut net = build(2, 1, 32, true);

        // Everyone agrees on the first downstream message.
        for client in net.clients.iter_mut() {
            client.update_history(b"round 1 data");
        }
        net.relay_history = chain_history(&net.relay_history, b"round 1 data");
        let plain = run_round(&mut net, 2, Some(0), b"ok");
        assert_eq!(&plain[..2], b"ok");

        // Client 1 sees a divergent downstream past; the cell garbles.
        net.clients[0].update_history(b"round 2 data");
        net.clients[1].update_history(b"round 2 DATA");
        net.relay_history = chain_history(&net.relay_history, b"round 2 data");
        let plain = run_round(&mut net, 3, Some(0), b"secret!");
        assert_ne!(&plain[..7], b"secret!");
    }

    #[test]
    fn test_anonymity_of_slot() {
        // With fixed pads, swapping which client owns the slot leaves the
        // relay-observed combine identical for identical payloads.
        let mut net = build(2, 1, 16, false);
        let first = run_round(&mut net, 9, Some(0), b"PAYLOAD");
        let second = run_round(&mut net, 9, Some(1), b"PAYLOAD");
        assert_eq!(first, second);
    }

    #[test]
    fn test_contributions_combine_without_owner() {
        // Open/closed scheduling: every client XORs its bitmap in with
        // slot_owner = false, and the relay sees the union.
        let mut net = build(2, 1, 4, false);
        let mut rng = StdRng::seed_from_u64(77);
        net.relay.start(6, net.relay_history);
        for (index, client) in net.clients.iter().enumerate() {
            let contribution = [1u8 << index, 0, 0, 0];
            let (cell, _) = client
                .encode_for_round(&mut rng, 6, false, &contribution)
                .unwrap();
            net.relay.decode_client(&cell).unwrap();
        }
        for trustee in &net.trustees {
            net.relay.decode_trustee(&trustee.encode_trustee(6)).unwrap();
        }
        assert_eq!(net.relay.finish().unwrap(), vec![0b11, 0, 0, 0]);
    }

    #[test]
    fn test_rejects_wrong_cell_size() {
        let mut relay = RelayDecoder::new(16, false);
        relay.start(1, initial_history());
        assert_eq!(
            relay.decode_client(&[0u8; 15]),
            Err(Error::WrongCellSize {
                expected: 16,
                actual: 15
            })
        );
    }

    #[test]
    fn test_rejects_oversized_payload() {
        let net = build(2, 1, 8, false);
        let mut rng = StdRng::seed_from_u64(1);
        let result = net.clients[0].encode_for_round(&mut rng, 1, true, &[0u8; 9]);
        assert_eq!(
            result.err(),
            Some(Error::PayloadTooLarge {
                payload: 9,
                capacity: 8
            })
        );
    }
}
