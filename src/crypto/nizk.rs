//! Non-interactive zero-knowledge proofs for the blame subprotocol.
//!
//! Two statements are needed:
//!
//! - [`DlogProof`]: knowledge of `x` with `X = x·B`, attached to a
//!   disruption accusation so the relay knows the accuser controls the
//!   ephemeral key of the disputed slot.
//! - [`DlogEqProof`]: Chaum–Pedersen equality `log_B(X) = log_P(S)`,
//!   attached to a revealed shared secret `S` so the relay can trust the
//!   pad bits it recomputes from `S` without learning any private scalar.
//!
//! Both are Fiat–Shamir transforms over a merlin transcript.

use bytes::{Buf, BufMut};
use curve25519_dalek_ng::{
    constants::RISTRETTO_BASEPOINT_POINT, ristretto::RistrettoPoint, scalar::Scalar,
};
use merlin::Transcript;
use rand::{CryptoRng, RngCore};

use crate::codec::{Codec, Error as CodecError};

const DLOG_LABEL: &[u8] = b"dcnet-dlog-v1";
const DLOG_EQ_LABEL: &[u8] = b"dcnet-dlog-eq-v1";

/// Proof of knowledge of a discrete logarithm against an arbitrary base.
///
/// The blame subprotocol proves slot ownership against the *final shuffle
/// base*, so the base is part of the statement rather than fixed to the
/// group generator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DlogProof {
    pub commitment: RistrettoPoint,
    pub response: Scalar,
}

fn dlog_challenge(
    base: &RistrettoPoint,
    public: &RistrettoPoint,
    commitment: &RistrettoPoint,
    context: &[u8],
) -> Scalar {
    let mut transcript = Transcript::new(DLOG_LABEL);
    transcript.append_message(b"base", base.compress().as_bytes());
    transcript.append_message(b"public", public.compress().as_bytes());
    transcript.append_message(b"commitment", commitment.compress().as_bytes());
    transcript.append_message(b"context", context);
    let mut bytes = [0u8; 64];
    transcript.challenge_bytes(b"challenge", &mut bytes);
    Scalar::from_bytes_mod_order_wide(&bytes)
}

impl DlogProof {
    /// Proves knowledge of `private` with `private·base`, bound to
    /// `context`.
    pub fn prove<R: RngCore + CryptoRng>(
        rng: &mut R,
        private: &Scalar,
        base: &RistrettoPoint,
        context: &[u8],
    ) -> Self {
        let nonce = Scalar::random(rng);
        let commitment = nonce * base;
        let public = private * base;
        let c = dlog_challenge(base, &public, &commitment, context);
        Self {
            commitment,
            response: nonce + c * private,
        }
    }

    /// Verifies the proof for `(base, public, context)`.
    pub fn verify(&self, public: &RistrettoPoint, base: &RistrettoPoint, context: &[u8]) -> bool {
        let c = dlog_challenge(base, public, &self.commitment, context);
        self.response * base == self.commitment + c * public
    }
}

impl Codec for DlogProof {
    fn write<B: BufMut>(&self, buf: &mut B) {
        self.commitment.write(buf);
        self.response.write(buf);
    }

    fn len_encoded(&self) -> usize {
        64
    }

    fn read<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        Ok(Self {
            commitment: RistrettoPoint::read(buf)?,
            response: Scalar::read(buf)?,
        })
    }
}

/// Chaum–Pedersen proof that `log_B(public) = log_P(secret)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DlogEqProof {
    pub base_commitment: RistrettoPoint,
    pub peer_commitment: RistrettoPoint,
    pub response: Scalar,
}

struct DlogEqStatement<'a> {
    public: &'a RistrettoPoint,
    peer: &'a RistrettoPoint,
    secret: &'a RistrettoPoint,
}

fn dlog_eq_challenge(
    statement: &DlogEqStatement<'_>,
    base_commitment: &RistrettoPoint,
    peer_commitment: &RistrettoPoint,
) -> Scalar {
    let mut transcript = Transcript::new(DLOG_EQ_LABEL);
    transcript.append_message(b"public", statement.public.compress().as_bytes());
    transcript.append_message(b"peer", statement.peer.compress().as_bytes());
    transcript.append_message(b"secret", statement.secret.compress().as_bytes());
    transcript.append_message(b"base_commitment", base_commitment.compress().as_bytes());
    transcript.append_message(b"peer_commitment", peer_commitment.compress().as_bytes());
    let mut bytes = [0u8; 64];
    transcript.challenge_bytes(b"challenge", &mut bytes);
    Scalar::from_bytes_mod_order_wide(&bytes)
}

impl DlogEqProof {
    /// Proves that the prover's public key and the revealed shared secret
    /// `secret = private·peer` share the discrete log `private`.
    pub fn prove<R: RngCore + CryptoRng>(
        rng: &mut R,
        private: &Scalar,
        peer: &RistrettoPoint,
    ) -> (RistrettoPoint, Self) {
        let public = private * RISTRETTO_BASEPOINT_POINT;
        let secret = private * peer;
        let nonce = Scalar::random(rng);
        let base_commitment = nonce * RISTRETTO_BASEPOINT_POINT;
        let peer_commitment = nonce * peer;
        let statement = DlogEqStatement {
            public: &public,
            peer,
            secret: &secret,
        };
        let c = dlog_eq_challenge(&statement, &base_commitment, &peer_commitment);
        (
            secret,
            Self {
                base_commitment,
                peer_commitment,
                response: nonce + c * private,
            },
        )
    }

    /// Verifies the equality for `(public, peer, secret)`.
    pub fn verify(
        &self,
        public: &RistrettoPoint,
        peer: &RistrettoPoint,
        secret: &RistrettoPoint,
    ) -> bool {
        let statement = DlogEqStatement {
            public,
            peer,
            secret,
        };
        let c = dlog_eq_challenge(&statement, &self.base_commitment, &self.peer_commitment);
        self.response * RISTRETTO_BASEPOINT_POINT == self.base_commitment + c * public
            && self.response * peer == self.peer_commitment + c * secret
    }
}

impl Codec for DlogEqProof {
    fn write<B: BufMut>(&self, buf: &mut B) {
        self.base_commitment.write(buf);
        self.peer_commitment.write(buf);
        self.response.write(buf);
    }

    fn len_encoded(&self) -> usize {
        96
    }

    fn read<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        Ok(Self {
            base_commitment: RistrettoPoint::read(buf)?,
            peer_commitment: RistrettoPoint::read(buf)?,
            response: Scalar::read(buf)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_dlog_round_trip() {
        let mut rng = StdRng::seed_from_u64(21);
        let keypair = Keypair::generate(&mut rng);
        let base = Keypair::generate(&mut rng).public;
        let public = keypair.private * base;
        let proof = DlogProof::prove(&mut rng, &keypair.private, &base, b"round 17 bit 3");
        assert!(proof.verify(&public, &base, b"round 17 bit 3"));
        assert!(!proof.verify(&public, &base, b"round 17 bit 4"));

        let other = Keypair::generate(&mut rng);
        assert!(!proof.verify(&other.public, &base, b"round 17 bit 3"));
    }

    #[test]
    fn test_dlog_eq_round_trip() {
        let mut rng = StdRng::seed_from_u64(22);
        let prover = Keypair::generate(&mut rng);
        let peer = Keypair::generate(&mut rng);

        let (secret, proof) = DlogEqProof::prove(&mut rng, &prover.private, &peer.public);
        assert_eq!(
            secret,
            crate::crypto::shared_secret(&prover.private, &peer.public)
        );
        assert!(proof.verify(&prover.public, &peer.public, &secret));
    }

    #[test]
    fn test_dlog_eq_rejects_forged_secret() {
        let mut rng = StdRng::seed_from_u64(23);
        let prover = Keypair::generate(&mut rng);
        let peer = Keypair::generate(&mut rng);
        let (_, proof) = DlogEqProof::prove(&mut rng, &prover.private, &peer.public);

        // A lying prover substituting a different "shared secret" point.
        let forged = Keypair::generate(&mut rng).public;
        assert!(!proof.verify(&prover.public, &peer.public, &forged));
    }

    #[test]
    fn test_codec_round_trip() {
        let mut rng = StdRng::seed_from_u64(24);
        let prover = Keypair::generate(&mut rng);
        let peer = Keypair::generate(&mut rng);
        let (_, proof) = DlogEqProof::prove(&mut rng, &prover.private, &peer.public);
        assert_eq!(DlogEqProof::decode(proof.encode()).unwrap(), proof);

        let dlog = DlogProof::prove(
            &mut rng,
            &prover.private,
            &crate::crypto::generator(),
            b"ctx",
        );
        assert_eq!(DlogProof::decode(dlog.encode()).unwrap(), dlog);
    }
}
