//! Schnorr signatures over Ristretto with a merlin transcript challenge.
//!
//! Trustees sign the shuffle transcript with their static keys; every
//! client verifies all of them before trusting its slot assignment.

use bytes::{Buf, BufMut};
use curve25519_dalek_ng::{
    constants::RISTRETTO_BASEPOINT_POINT, ristretto::RistrettoPoint, scalar::Scalar,
};
use merlin::Transcript;
use rand::{CryptoRng, RngCore};

use crate::codec::{Codec, Error as CodecError};

const SIGNATURE_LABEL: &[u8] = b"dcnet-schnorr-v1";

/// A Schnorr signature `(R, s)` with `s·B = R + c·P`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature {
    pub commitment: RistrettoPoint,
    pub response: Scalar,
}

fn challenge(commitment: &RistrettoPoint, public: &RistrettoPoint, message: &[u8]) -> Scalar {
    let mut transcript = Transcript::new(SIGNATURE_LABEL);
    transcript.append_message(b"commitment", commitment.compress().as_bytes());
    transcript.append_message(b"public", public.compress().as_bytes());
    transcript.append_message(b"message", message);
    let mut bytes = [0u8; 64];
    transcript.challenge_bytes(b"challenge", &mut bytes);
    Scalar::from_bytes_mod_order_wide(&bytes)
}

/// Signs `message` with the private scalar.
pub fn sign<R: RngCore + CryptoRng>(
    rng: &mut R,
    private: &Scalar,
    message: &[u8],
) -> Signature {
    let nonce = Scalar::random(rng);
    let commitment = nonce * RISTRETTO_BASEPOINT_POINT;
    let public = private * RISTRETTO_BASEPOINT_POINT;
    let c = challenge(&commitment, &public, message);
    Signature {
        commitment,
        response: nonce + c * private,
    }
}

/// Verifies a signature against a public key.
pub fn verify(public: &RistrettoPoint, message: &[u8], signature: &Signature) -> bool {
    let c = challenge(&signature.commitment, public, message);
    signature.response * RISTRETTO_BASEPOINT_POINT == signature.commitment + c * public
}

impl Codec for Signature {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_sign_verify() {
        let mut rng = StdRng::seed_from_u64(11);
        let keypair = Keypair::generate(&mut rng);
        let signature = sign(&mut rng, &keypair.private, b"transcript bytes");
        assert!(verify(&keypair.public, b"transcript bytes", &signature));
    }

    #[test]
    fn test_rejects_wrong_message() {
        let mut rng = StdRng::seed_from_u64(12);
        let keypair = Keypair::generate(&mut rng);
        let signature = sign(&mut rng, &keypair.private, b"original");
        assert!(!verify(&keypair.public, b"tampered", &signature));
    }

    #[test]
    fn test_rejects_wrong_key() {
        let mut rng = StdRng::seed_from_u64(13);
        let signer = Keypair::generate(&mut rng);
        let other = Keypair::generate(&mut rng);
        let signature = sign(&mut rng, &signer.private, b"message");
        assert!(!verify(&other.public, b"message", &signature));
    }

    #[test]
    fn test_codec_round_trip() {
        let mut rng = StdRng::seed_from_u64(14);
        let keypair = Keypair::generate(&mut rng);
        let signature = sign(&mut rng, &keypair.private, b"message");
        let decoded = Signature::decode(signature.encode()).unwrap();
        assert_eq!(decoded, signature);
    }
}
