//! The trustee shuffle chain for anonymous slot assignment.
//!
//! During setup the relay walks the trustees in order. Each trustee draws
//! a secret exponent `c`, re-bases the chain (`G' = c·G`), raises every
//! ephemeral client key to the same exponent, and outputs the keys in a
//! canonical order that hides the input permutation.
//!
//! The step proof must do more than prove knowledge of `c`: a cheating
//! trustee could otherwise attach any fabricated key list to a valid
//! base link. Every output key therefore carries a disjunctive
//! Chaum-Pedersen proof that it equals `c · E` for *some* input key `E`,
//! under the same `c` that links the bases; which input it came from
//! stays hidden. Inputs and outputs are required to be duplicate-free,
//! so the proven "each output is the image of some input" relation is a
//! bijection and no slot can be dropped or forged.
//!
//! Trustees sign the final `(base, keys)` only after re-verifying the
//! whole chain and finding their own link in it verbatim; a client
//! accepts a slot assignment only if every trustee signature verifies.
//! Tampering with any link therefore either breaks a proof (no
//! signatures are produced) or breaks a signature (clients reject).

use bytes::{Buf, BufMut};
use curve25519_dalek_ng::{ristretto::RistrettoPoint, scalar::Scalar, traits::IsIdentity};
use merlin::Transcript;
use rand::{CryptoRng, RngCore};

use crate::codec::{Codec, Error as CodecError};

const SHUFFLE_LABEL: &[u8] = b"dcnet-shuffle-v2";

/// One trustee's output in the shuffle chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShuffleStep {
    /// The re-based generator after this step.
    pub base: RistrettoPoint,
    /// The re-based ephemeral keys, canonically ordered.
    pub keys: Vec<RistrettoPoint>,
    /// One membership proof per output key, in output order.
    pub proof: StepProof,
}

/// The per-step proof: for every output key, a disjunction over the
/// input keys.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepProof {
    pub keys: Vec<KeyProof>,
}

/// Proof that one output key is `c · E_i` for some input key `E_i`,
/// where `c` is the exponent linking the bases. One clause per input;
/// all but the true clause are simulated, and the verifier only learns
/// that the challenges sum to the transcript challenge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyProof {
    pub clauses: Vec<Clause>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Clause {
    pub challenge: Scalar,
    pub response: Scalar,
}

/// Fiat-Shamir challenge for one output key's disjunction.
///
/// Binds the base pair, the full input list, the output key, and every
/// clause commitment pair.
fn key_challenge(
    base_in: &RistrettoPoint,
    base_out: &RistrettoPoint,
    keys_in: &[RistrettoPoint],
    key_out: &RistrettoPoint,
    commitments: &[(RistrettoPoint, RistrettoPoint)],
) -> Scalar {
    let mut transcript = Transcript::new(SHUFFLE_LABEL);
    transcript.append_message(b"base_in", base_in.compress().as_bytes());
    transcript.append_message(b"base_out", base_out.compress().as_bytes());
    transcript.append_u64(b"keys", keys_in.len() as u64);
    for key in keys_in {
        transcript.append_message(b"key_in", key.compress().as_bytes());
    }
    transcript.append_message(b"key_out", key_out.compress().as_bytes());
    for (base_commitment, key_commitment) in commitments {
        transcript.append_message(b"commit_base", base_commitment.compress().as_bytes());
        transcript.append_message(b"commit_key", key_commitment.compress().as_bytes());
    }
    let mut bytes = [0u8; 64];
    transcript.challenge_bytes(b"challenge", &mut bytes);
    Scalar::from_bytes_mod_order_wide(&bytes)
}

/// Proves that `key_out = exponent · keys_in[source]` without revealing
/// `source`, tied to `base_out = exponent · base_in`.
fn prove_key<R: RngCore + CryptoRng>(
    rng: &mut R,
    base_in: &RistrettoPoint,
    base_out: &RistrettoPoint,
    keys_in: &[RistrettoPoint],
    key_out: &RistrettoPoint,
    source: usize,
    exponent: &Scalar,
) -> KeyProof {
    let n = keys_in.len();
    let mut challenges = vec![Scalar::zero(); n];
    let mut responses = vec![Scalar::zero(); n];
    let mut commitments = Vec::with_capacity(n);

    // Simulate every clause but the real one.
    let nonce = Scalar::random(rng);
    for (index, key_in) in keys_in.iter().enumerate() {
        if index == source {
            commitments.push((nonce * base_in, nonce * key_in));
        } else {
            let challenge = Scalar::random(rng);
            let response = Scalar::random(rng);
            challenges[index] = challenge;
            responses[index] = response;
            commitments.push((
                response * base_in - challenge * base_out,
                response * key_in - challenge * key_out,
            ));
        }
    }

    let total = key_challenge(base_in, base_out, keys_in, key_out, &commitments);
    let mut simulated = Scalar::zero();
    for (index, challenge) in challenges.iter().enumerate() {
        if index != source {
            simulated += challenge;
        }
    }
    challenges[source] = total - simulated;
    responses[source] = nonce + challenges[source] * exponent;

    KeyProof {
        clauses: challenges
            .into_iter()
            .zip(responses)
            .map(|(challenge, response)| Clause {
                challenge,
                response,
            })
            .collect(),
    }
}

/// Verifies one output key's disjunction.
fn verify_key(
    base_in: &RistrettoPoint,
    base_out: &RistrettoPoint,
    keys_in: &[RistrettoPoint],
    key_out: &RistrettoPoint,
    proof: &KeyProof,
) -> bool {
    if proof.clauses.len() != keys_in.len() {
        return false;
    }
    let commitments: Vec<(RistrettoPoint, RistrettoPoint)> = proof
        .clauses
        .iter()
        .zip(keys_in)
        .map(|(clause, key_in)| {
            (
                clause.response * base_in - clause.challenge * base_out,
                clause.response * key_in - clause.challenge * key_out,
            )
        })
        .collect();
    let total = key_challenge(base_in, base_out, keys_in, key_out, &commitments);
    let sum: Scalar = proof
        .clauses
        .iter()
        .map(|clause| clause.challenge)
        .sum();
    sum == total
}

fn all_distinct(keys: &[RistrettoPoint]) -> bool {
    let mut encodings: Vec<[u8; 32]> = keys.iter().map(|key| key.compress().to_bytes()).collect();
    encodings.sort_unstable();
    encodings.windows(2).all(|pair| pair[0] != pair[1])
}

/// Performs one shuffle step over `(base_in, keys_in)`.
pub fn shuffle<R: RngCore + CryptoRng>(
    rng: &mut R,
    base_in: &RistrettoPoint,
    keys_in: &[RistrettoPoint],
) -> ShuffleStep {
    let exponent = Scalar::random(rng);
    let base = exponent * base_in;

    // Sorting by the compressed encoding is a permutation that depends only
    // on the re-based values, so the input order leaks nothing.
    let mut keys: Vec<(RistrettoPoint, usize)> = keys_in
        .iter()
        .enumerate()
        .map(|(source, key)| (exponent * key, source))
        .collect();
    keys.sort_by_key(|(key, _)| key.compress().to_bytes());

    let proofs = keys
        .iter()
        .map(|(key_out, source)| {
            prove_key(rng, base_in, &base, keys_in, key_out, *source, &exponent)
        })
        .collect();

    ShuffleStep {
        base,
        keys: keys.into_iter().map(|(key, _)| key).collect(),
        proof: StepProof { keys: proofs },
    }
}

/// Verifies a single link of the chain.
pub fn verify_step(
    base_in: &RistrettoPoint,
    keys_in: &[RistrettoPoint],
    step: &ShuffleStep,
) -> bool {
    if step.keys.len() != keys_in.len() || step.proof.keys.len() != keys_in.len() {
        return false;
    }
    if step.base.is_identity() {
        return false;
    }
    // Each output is proven to be the image of *some* input; with both
    // lists duplicate-free the relation is forced to be a bijection.
    if !all_distinct(keys_in) || !all_distinct(&step.keys) {
        return false;
    }
    step.keys
        .iter()
        .zip(&step.proof.keys)
        .all(|(key_out, proof)| verify_key(base_in, &step.base, keys_in, key_out, proof))
}

/// Verifies the whole chain from the initial `(base, keys)`.
pub fn verify_chain(
    base: &RistrettoPoint,
    keys: &[RistrettoPoint],
    steps: &[ShuffleStep],
) -> bool {
    let mut base_in = *base;
    let mut keys_in = keys.to_vec();
    for step in steps {
        if !verify_step(&base_in, &keys_in, step) {
            return false;
        }
        base_in = step.base;
        keys_in = step.keys.clone();
    }
    true
}

/// The bytes trustees sign and clients verify: the final base and key list.
pub fn sign_payload(base: &RistrettoPoint, keys: &[RistrettoPoint]) -> Vec<u8> {
    let mut buf = base.encode();
    keys.to_vec().write(&mut buf);
    buf.to_vec()
}

/// Scans the final key list for `eph_priv · base`; the index found is the
/// caller's anonymous slot.
pub fn recognize_slot(
    eph_private: &Scalar,
    base: &RistrettoPoint,
    keys: &[RistrettoPoint],
) -> Option<usize> {
    let mine = eph_private * base;
    keys.iter().position(|key| *key == mine)
}

impl Codec for Clause {
    fn write<B: BufMut>(&self, buf: &mut B) {
        self.challenge.write(buf);
        self.response.write(buf);
    }

    fn len_encoded(&self) -> usize {
        64
    }

    fn read<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        Ok(Self {
            challenge: Scalar::read(buf)?,
            response: Scalar::read(buf)?,
        })
    }
}

impl Codec for KeyProof {
    fn write<B: BufMut>(&self, buf: &mut B) {
        self.clauses.write(buf);
    }

    fn len_encoded(&self) -> usize {
        self.clauses.len_encoded()
    }

    fn read<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        Ok(Self {
            clauses: Vec::<Clause>::read(buf)?,
        })
    }
}

impl Codec for ShuffleStep {
    fn write<B: BufMut>(&self, buf: &mut B) {
        self.base.write(buf);
        self.keys.write(buf);
        self.proof.keys.write(buf);
    }

    fn len_encoded(&self) -> usize {
        self.base.len_encoded() + self.keys.len_encoded() + self.proof.keys.len_encoded()
    }

    fn read<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        Ok(Self {
            base: RistrettoPoint::read(buf)?,
            keys: Vec::<RistrettoPoint>::read(buf)?,
            proof: StepProof {
                keys: Vec::<KeyProof>::read(buf)?,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{generator, schnorr, Keypair};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn eph_keys(rng: &mut StdRng, n: usize) -> Vec<Keypair> {
        (0..n).map(|_| Keypair::generate(rng)).collect()
    }

    #[test]
    fn test_chain_verifies_and_all_slots_found() {
        let mut rng = StdRng::seed_from_u64(31);
        let clients = eph_keys(&mut rng, 4);
        let initial: Vec<_> = clients.iter().map(|keypair| keypair.public).collect();

        let mut base = generator();
        let mut keys = initial.clone();
        let mut steps = Vec::new();
        for _ in 0..3 {
            let step = shuffle(&mut rng, &base, &keys);
            base = step.base;
            keys = step.keys.clone();
            steps.push(step);
        }
        assert!(verify_chain(&generator(), &initial, &steps));

        // Every client recognizes exactly one slot, and the slots are a
        // permutation of 0..n.
        let mut slots: Vec<usize> = clients
            .iter()
            .map(|keypair| recognize_slot(&keypair.private, &base, &keys).unwrap())
            .collect();
        slots.sort_unstable();
        assert_eq!(slots, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_fabricated_key_list_cannot_be_proven() {
        // A Byzantine trustee that picks its exponent honestly (so the
        // base link holds) but invents the output list from scratch. It
        // runs the real proving algorithm with a claimed source for each
        // fabricated key; no proof it can produce verifies, because the
        // fabricated keys are not images of any input.
        let mut rng = StdRng::seed_from_u64(32);
        let initial: Vec<_> = eph_keys(&mut rng, 3)
            .iter()
            .map(|keypair| keypair.public)
            .collect();
        let exponent = Scalar::random(&mut rng);
        let base_out = exponent * generator();

        let fabricated: Vec<RistrettoPoint> = (0..3)
            .map(|_| exponent * Keypair::generate(&mut rng).public)
            .collect();
        let proofs = fabricated
            .iter()
            .enumerate()
            .map(|(claimed_source, key_out)| {
                prove_key(
                    &mut rng,
                    &generator(),
                    &base_out,
                    &initial,
                    key_out,
                    claimed_source,
                    &exponent,
                )
            })
            .collect();
        let forged = ShuffleStep {
            base: base_out,
            keys: fabricated,
            proof: StepProof { keys: proofs },
        };
        assert!(!verify_step(&generator(), &initial, &forged));
    }

    #[test]
    fn test_duplicated_output_cannot_drop_a_slot() {
        // Both outputs are valid images of input 0; the duplicate check
        // refuses the step even though each disjunction proof verifies.
        let mut rng = StdRng::seed_from_u64(33);
        let initial: Vec<_> = eph_keys(&mut rng, 2)
            .iter()
            .map(|keypair| keypair.public)
            .collect();
        let exponent = Scalar::random(&mut rng);
        let base_out = exponent * generator();
        let image = exponent * initial[0];

        let proofs: Vec<KeyProof> = (0..2)
            .map(|_| prove_key(&mut rng, &generator(), &base_out, &initial, &image, 0, &exponent))
            .collect();
        for proof in &proofs {
            assert!(verify_key(&generator(), &base_out, &initial, &image, proof));
        }
        let forged = ShuffleStep {
            base: base_out,
            keys: vec![image, image],
            proof: StepProof { keys: proofs },
        };
        assert!(!verify_step(&generator(), &initial, &forged));
    }

    #[test]
    fn test_tampered_key_breaks_chain() {
        let mut rng = StdRng::seed_from_u64(34);
        let clients = eph_keys(&mut rng, 3);
        let initial: Vec<_> = clients.iter().map(|keypair| keypair.public).collect();

        let mut step = shuffle(&mut rng, &generator(), &initial);
        step.keys[0] = Keypair::generate(&mut rng).public;
        assert!(!verify_chain(&generator(), &initial, &[step]));
    }

    #[test]
    fn test_tampered_base_breaks_chain() {
        let mut rng = StdRng::seed_from_u64(35);
        let clients = eph_keys(&mut rng, 3);
        let initial: Vec<_> = clients.iter().map(|keypair| keypair.public).collect();

        let mut step = shuffle(&mut rng, &generator(), &initial);
        step.base = Keypair::generate(&mut rng).public;
        assert!(!verify_step(&generator(), &initial, &step));
    }

    #[test]
    fn test_dropped_key_breaks_chain() {
        let mut rng = StdRng::seed_from_u64(36);
        let clients = eph_keys(&mut rng, 3);
        let initial: Vec<_> = clients.iter().map(|keypair| keypair.public).collect();

        let mut step = shuffle(&mut rng, &generator(), &initial);
        step.keys.pop();
        step.proof.keys.pop();
        assert!(!verify_step(&generator(), &initial, &step));
    }

    #[test]
    fn test_signature_covers_final_result() {
        let mut rng = StdRng::seed_from_u64(37);
        let trustee = Keypair::generate(&mut rng);
        let clients = eph_keys(&mut rng, 2);
        let initial: Vec<_> = clients.iter().map(|keypair| keypair.public).collect();
        let step = shuffle(&mut rng, &generator(), &initial);

        let payload = sign_payload(&step.base, &step.keys);
        let signature = schnorr::sign(&mut rng, &trustee.private, &payload);
        assert!(schnorr::verify(&trustee.public, &payload, &signature));

        // Any substitution in the signed list invalidates the signature.
        let mut swapped = step.keys.clone();
        swapped.swap(0, 1);
        let tampered = sign_payload(&step.base, &swapped);
        assert!(!schnorr::verify(&trustee.public, &tampered, &signature));
    }

    #[test]
    fn test_codec_round_trip() {
        let mut rng = StdRng::seed_from_u64(38);
        let clients = eph_keys(&mut rng, 3);
        let initial: Vec<_> = clients.iter().map(|keypair| keypair.public).collect();
        let step = shuffle(&mut rng, &generator(), &initial);
        assert_eq!(ShuffleStep::decode(step.encode()).unwrap(), step);
    }
}
