//! The typed wire-message family.
//!
//! Every message is one variant of [`Message`]; the wire tag constants in
//! [`tag`] keep the historical protocol names. Dispatch is statically
//! exhaustive per role, and nothing in the codec compares against a bare
//! integer literal.

use bytes::{Buf, BufMut, BytesMut};
use curve25519_dalek_ng::ristretto::RistrettoPoint;

use crate::codec::{bytes_len, read_bytes, write_bytes, Codec, Error as CodecError};
use crate::crypto::{
    nizk::{DlogEqProof, DlogProof},
    schnorr::Signature,
    shuffle::ShuffleStep,
};

/// Wire type tags.
pub mod tag {
    pub const ALL_ALL_PARAMETERS: u16 = 1;
    pub const ALL_ALL_SHUTDOWN: u16 = 2;
    pub const REL_CLI_TELL_TRUSTEES_PK: u16 = 3;
    pub const CLI_REL_TELL_PK_AND_EPH_PK: u16 = 4;
    pub const REL_CLI_TELL_EPH_PKS_AND_TRUSTEES_SIG: u16 = 5;
    pub const REL_CLI_DOWNSTREAM_DATA: u16 = 6;
    pub const REL_CLI_DOWNSTREAM_DATA_UDP: u16 = 7;
    pub const CLI_REL_UPSTREAM_DATA: u16 = 8;
    pub const CLI_REL_OPENCLOSED_DATA: u16 = 9;
    pub const REL_TRU_TELL_CLIENTS_PKS: u16 = 10;
    pub const REL_TRU_TELL_SHUFFLE_INPUT: u16 = 11;
    pub const TRU_REL_SHUFFLE: u16 = 12;
    pub const REL_TRU_TELL_TRANSCRIPT: u16 = 13;
    pub const TRU_REL_SIGN: u16 = 14;
    pub const TRU_REL_TELL_PK: u16 = 15;
    pub const TRU_REL_DC_CIPHER: u16 = 16;
    pub const REL_TRU_TELL_RATE_CHANGE: u16 = 17;
    pub const REL_ALL_LAST_UPLOAD_FAILED: u16 = 18;
    pub const CLI_REL_DISRUPTION_BLAME: u16 = 19;
    pub const REL_ALL_DISRUPTION_REVEAL: u16 = 20;
    pub const CLI_REL_DISRUPTION_SECRET: u16 = 21;
    pub const TRU_REL_DISRUPTION_SECRET: u16 = 22;
}

/// Well-known parameter keys for [`Parameters`].
pub mod param {
    pub const NEXT_FREE_CLIENT_ID: &str = "NextFreeClientID";
    pub const N_CLIENTS: &str = "NClients";
    pub const N_TRUSTEES: &str = "NTrustees";
    pub const PAYLOAD_SIZE: &str = "PayloadSize";
    pub const USE_UDP: &str = "UseUDP";
    pub const DCNET_TYPE: &str = "DCNetType";
    pub const DISRUPTION_PROTECTION: &str = "DisruptionProtectionEnabled";
    pub const EQUIVOCATION_PROTECTION: &str = "EquivocationProtectionEnabled";
}

/// One value in the parameter bag.
#[derive(Clone, Debug, PartialEq)]
pub enum ParamValue {
    Int(i64),
    Bool(bool),
    Str(String),
}

const PARAM_INT: u8 = 0;
const PARAM_BOOL: u8 = 1;
const PARAM_STR: u8 = 2;

impl Codec for ParamValue {
    fn write<B: BufMut>(&self, buf: &mut B) {
        match self {
            ParamValue::Int(value) => {
                buf.put_u8(PARAM_INT);
                value.write(buf);
            }
            ParamValue::Bool(value) => {
                buf.put_u8(PARAM_BOOL);
                value.write(buf);
            }
            ParamValue::Str(value) => {
                buf.put_u8(PARAM_STR);
                value.write(buf);
            }
        }
    }

    fn len_encoded(&self) -> usize {
        1 + match self {
            ParamValue::Int(value) => value.len_encoded(),
            ParamValue::Bool(value) => value.len_encoded(),
            ParamValue::Str(value) => value.len_encoded(),
        }
    }

    fn read<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        match u8::read(buf)? {
            PARAM_INT => Ok(ParamValue::Int(i64::read(buf)?)),
            PARAM_BOOL => Ok(ParamValue::Bool(bool::read(buf)?)),
            PARAM_STR => Ok(ParamValue::Str(String::read(buf)?)),
            other => Err(CodecError::InvalidEnum(other)),
        }
    }
}

/// One named option.
#[derive(Clone, Debug, PartialEq)]
pub struct ParamEntry {
    pub key: String,
    pub value: ParamValue,
}

impl Codec for ParamEntry {
    fn write<B: BufMut>(&self, buf: &mut B) {
        self.key.write(buf);
        self.value.write(buf);
    }

    fn len_encoded(&self) -> usize {
        self.key.len_encoded() + self.value.len_encoded()
    }

    fn read<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        Ok(Self {
            key: String::read(buf)?,
            value: ParamValue::read(buf)?,
        })
    }
}

/// The bag of named options broadcast at the start of every setup, plus
/// the trustee public keys.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct Parameters {
    pub entries: Vec<ParamEntry>,
    pub trustee_keys: Vec<RistrettoPoint>,
}

impl Parameters {
    pub fn set_int(&mut self, key: &str, value: i64) {
        self.entries.push(ParamEntry {
            key: key.to_string(),
            value: ParamValue::Int(value),
        });
    }

    pub fn set_bool(&mut self, key: &str, value: bool) {
        self.entries.push(ParamEntry {
            key: key.to_string(),
            value: ParamValue::Bool(value),
        });
    }

    pub fn set_str(&mut self, key: &str, value: &str) {
        self.entries.push(ParamEntry {
            key: key.to_string(),
            value: ParamValue::Str(value.to_string()),
        });
    }

    pub fn int_or(&self, key: &str, default: i64) -> i64 {
        self.entries
            .iter()
            .find_map(|entry| match (&entry.value, entry.key == key) {
                (ParamValue::Int(value), true) => Some(*value),
                _ => None,
            })
            .unwrap_or(default)
    }

    pub fn bool_or(&self, key: &str, default: bool) -> bool {
        self.entries
            .iter()
            .find_map(|entry| match (&entry.value, entry.key == key) {
                (ParamValue::Bool(value), true) => Some(*value),
                _ => None,
            })
            .unwrap_or(default)
    }

    pub fn str_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.entries
            .iter()
            .find_map(|entry| match (&entry.value, entry.key == key) {
                (ParamValue::Str(value), true) => Some(value.as_str()),
                _ => None,
            })
            .unwrap_or(default)
    }
}

impl Codec for Parameters {
    fn write<B: BufMut>(&self, buf: &mut B) {
        self.entries.write(buf);
        self.trustee_keys.write(buf);
    }

    fn len_encoded(&self) -> usize {
        self.entries.len_encoded() + self.trustee_keys.len_encoded()
    }

    fn read<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        Ok(Self {
            entries: Vec::<ParamEntry>::read(buf)?,
            trustee_keys: Vec::<RistrettoPoint>::read(buf)?,
        })
    }
}

/// One relay-to-client round broadcast.
#[derive(Clone, Debug, PartialEq)]
pub struct Downstream {
    pub round: u32,
    /// Slot that owns the upstream answer to this broadcast; -1 when the
    /// round is closed.
    pub ownership_id: i32,
    pub flag_resync: bool,
    pub flag_open_closed: bool,
    pub data: Vec<u8>,
}

impl Codec for Downstream {
    fn write<B: BufMut>(&self, buf: &mut B) {
        self.round.write(buf);
        self.ownership_id.write(buf);
        self.flag_resync.write(buf);
        self.flag_open_closed.write(buf);
        write_bytes(buf, &self.data);
    }

    fn len_encoded(&self) -> usize {
        4 + 4 + 1 + 1 + bytes_len(&self.data)
    }

    fn read<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        Ok(Self {
            round: u32::read(buf)?,
            ownership_id: i32::read(buf)?,
            flag_resync: bool::read(buf)?,
            flag_open_closed: bool::read(buf)?,
            data: read_bytes(buf)?,
        })
    }
}

/// A shared-secret opening for the blame subprotocol: the secret point and
/// the discrete-log-equality proof that authenticates it.
#[derive(Clone, Debug, PartialEq)]
pub struct RevealedSecret {
    pub secret: RistrettoPoint,
    pub proof: DlogEqProof,
}

impl Codec for RevealedSecret {
    fn write<B: BufMut>(&self, buf: &mut B) {
        self.secret.write(buf);
        self.proof.write(buf);
    }

    fn len_encoded(&self) -> usize {
        self.secret.len_encoded() + self.proof.len_encoded()
    }

    fn read<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        Ok(Self {
            secret: RistrettoPoint::read(buf)?,
            proof: DlogEqProof::read(buf)?,
        })
    }
}

/// Every message the protocol exchanges.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// `ALL_ALL_PARAMETERS`
    Parameters(Parameters),
    /// `ALL_ALL_SHUTDOWN`
    Shutdown,
    /// `REL_CLI_TELL_TRUSTEES_PK`
    TrusteePublicKeys { keys: Vec<RistrettoPoint> },
    /// `CLI_REL_TELL_PK_AND_EPH_PK`
    ClientKeys {
        client_id: u32,
        public: RistrettoPoint,
        ephemeral: RistrettoPoint,
    },
    /// `REL_CLI_TELL_EPH_PKS_AND_TRUSTEES_SIG`
    SlotAssignment {
        base: RistrettoPoint,
        keys: Vec<RistrettoPoint>,
        signatures: Vec<Signature>,
    },
    /// `REL_CLI_DOWNSTREAM_DATA`
    Downstream(Downstream),
    /// `REL_CLI_DOWNSTREAM_DATA_UDP`
    DownstreamUdp(Downstream),
    /// `CLI_REL_UPSTREAM_DATA`
    Upstream {
        client_id: u32,
        round: u32,
        data: Vec<u8>,
    },
    /// `CLI_REL_OPENCLOSED_DATA`
    OpenClosedContribution {
        client_id: u32,
        round: u32,
        data: Vec<u8>,
    },
    /// `REL_TRU_TELL_CLIENTS_PKS`
    ClientPublicKeys { keys: Vec<RistrettoPoint> },
    /// `REL_TRU_TELL_SHUFFLE_INPUT`
    ShuffleInput {
        base: RistrettoPoint,
        keys: Vec<RistrettoPoint>,
    },
    /// `TRU_REL_SHUFFLE`
    ShuffleOutput { step: ShuffleStep },
    /// `REL_TRU_TELL_TRANSCRIPT`: the initial key list plus every chain
    /// link, enough for any trustee to re-verify the whole shuffle.
    Transcript {
        keys: Vec<RistrettoPoint>,
        steps: Vec<ShuffleStep>,
    },
    /// `TRU_REL_SIGN`
    TranscriptSignature {
        trustee_id: u32,
        signature: Signature,
    },
    /// `TRU_REL_TELL_PK`
    TrusteeIdentity {
        trustee_id: u32,
        key: RistrettoPoint,
    },
    /// `TRU_REL_DC_CIPHER`
    TrusteeCipher {
        trustee_id: u32,
        round: u32,
        data: Vec<u8>,
    },
    /// `REL_TRU_TELL_RATE_CHANGE`: the relay has consumed cells through
    /// `round`; trustees bound how far ahead of it they stream.
    RateChange { round: u32 },
    /// `REL_ALL_LAST_UPLOAD_FAILED`
    LastUploadFailed { conn_id: u32 },
    /// `CLI_REL_DISRUPTION_BLAME`
    DisruptionBlame {
        round: u32,
        bit_pos: u32,
        ephemeral: RistrettoPoint,
        proof: DlogProof,
    },
    /// `REL_ALL_DISRUPTION_REVEAL`
    DisruptionReveal { round: u32, bit_pos: u32 },
    /// `CLI_REL_DISRUPTION_SECRET`
    ClientSecrets {
        client_id: u32,
        secrets: Vec<RevealedSecret>,
    },
    /// `TRU_REL_DISRUPTION_SECRET`
    TrusteeSecrets {
        trustee_id: u32,
        secrets: Vec<RevealedSecret>,
    },
}

impl Message {
    /// The wire type tag for this message.
    pub fn tag(&self) -> u16 {
        match self {
            Message::Parameters(_) => tag::ALL_ALL_PARAMETERS,
            Message::Shutdown => tag::ALL_ALL_SHUTDOWN,
            Message::TrusteePublicKeys { .. } => tag::REL_CLI_TELL_TRUSTEES_PK,
            Message::ClientKeys { .. } => tag::CLI_REL_TELL_PK_AND_EPH_PK,
            Message::SlotAssignment { .. } => tag::REL_CLI_TELL_EPH_PKS_AND_TRUSTEES_SIG,
            Message::Downstream(_) => tag::REL_CLI_DOWNSTREAM_DATA,
            Message::DownstreamUdp(_) => tag::REL_CLI_DOWNSTREAM_DATA_UDP,
            Message::Upstream { .. } => tag::CLI_REL_UPSTREAM_DATA,
            Message::OpenClosedContribution { .. } => tag::CLI_REL_OPENCLOSED_DATA,
            Message::ClientPublicKeys { .. } => tag::REL_TRU_TELL_CLIENTS_PKS,
            Message::ShuffleInput { .. } => tag::REL_TRU_TELL_SHUFFLE_INPUT,
            Message::ShuffleOutput { .. } => tag::TRU_REL_SHUFFLE,
            Message::Transcript { .. } => tag::REL_TRU_TELL_TRANSCRIPT,
            Message::TranscriptSignature { .. } => tag::TRU_REL_SIGN,
            Message::TrusteeIdentity { .. } => tag::TRU_REL_TELL_PK,
            Message::TrusteeCipher { .. } => tag::TRU_REL_DC_CIPHER,
            Message::RateChange { .. } => tag::REL_TRU_TELL_RATE_CHANGE,
            Message::LastUploadFailed { .. } => tag::REL_ALL_LAST_UPLOAD_FAILED,
            Message::DisruptionBlame { .. } => tag::CLI_REL_DISRUPTION_BLAME,
            Message::DisruptionReveal { .. } => tag::REL_ALL_DISRUPTION_REVEAL,
            Message::ClientSecrets { .. } => tag::CLI_REL_DISRUPTION_SECRET,
            Message::TrusteeSecrets { .. } => tag::TRU_REL_DISRUPTION_SECRET,
        }
    }

    /// A short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Message::Parameters(_) => "ALL_ALL_PARAMETERS",
            Message::Shutdown => "ALL_ALL_SHUTDOWN",
            Message::TrusteePublicKeys { .. } => "REL_CLI_TELL_TRUSTEES_PK",
            Message::ClientKeys { .. } => "CLI_REL_TELL_PK_AND_EPH_PK",
            Message::SlotAssignment { .. } => "REL_CLI_TELL_EPH_PKS_AND_TRUSTEES_SIG",
            Message::Downstream(_) => "REL_CLI_DOWNSTREAM_DATA",
            Message::DownstreamUdp(_) => "REL_CLI_DOWNSTREAM_DATA_UDP",
            Message::Upstream { .. } => "CLI_REL_UPSTREAM_DATA",
            Message::OpenClosedContribution { .. } => "CLI_REL_OPENCLOSED_DATA",
            Message::ClientPublicKeys { .. } => "REL_TRU_TELL_CLIENTS_PKS",
            Message::ShuffleInput { .. } => "REL_TRU_TELL_SHUFFLE_INPUT",
            Message::ShuffleOutput { .. } => "TRU_REL_SHUFFLE",
            Message::Transcript { .. } => "REL_TRU_TELL_TRANSCRIPT",
            Message::TranscriptSignature { .. } => "TRU_REL_SIGN",
            Message::TrusteeIdentity { .. } => "TRU_REL_TELL_PK",
            Message::TrusteeCipher { .. } => "TRU_REL_DC_CIPHER",
            Message::RateChange { .. } => "REL_TRU_TELL_RATE_CHANGE",
            Message::LastUploadFailed { .. } => "REL_ALL_LAST_UPLOAD_FAILED",
            Message::DisruptionBlame { .. } => "CLI_REL_DISRUPTION_BLAME",
            Message::DisruptionReveal { .. } => "REL_ALL_DISRUPTION_REVEAL",
            Message::ClientSecrets { .. } => "CLI_REL_DISRUPTION_SECRET",
            Message::TrusteeSecrets { .. } => "TRU_REL_DISRUPTION_SECRET",
        }
    }

    /// Encodes the payload (everything after the type tag).
    pub fn encode_payload(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        match self {
            Message::Parameters(parameters) => parameters.write(&mut buf),
            Message::Shutdown => {}
            Message::TrusteePublicKeys { keys } => keys.write(&mut buf),
            Message::ClientKeys {
                client_id,
                public,
                ephemeral,
            } => {
                client_id.write(&mut buf);
                public.write(&mut buf);
                ephemeral.write(&mut buf);
            }
            Message::SlotAssignment {
                base,
                keys,
                signatures,
            } => {
                base.write(&mut buf);
                keys.write(&mut buf);
                signatures.write(&mut buf);
            }
            Message::Downstream(downstream) | Message::DownstreamUdp(downstream) => {
                downstream.write(&mut buf)
            }
            Message::Upstream {
                client_id,
                round,
                data,
            }
            | Message::OpenClosedContribution {
                client_id,
                round,
                data,
            } => {
                client_id.write(&mut buf);
                round.write(&mut buf);
                write_bytes(&mut buf, data);
            }
            Message::ClientPublicKeys { keys } => keys.write(&mut buf),
            Message::ShuffleInput { base, keys } => {
                base.write(&mut buf);
                keys.write(&mut buf);
            }
            Message::ShuffleOutput { step } => step.write(&mut buf),
            Message::Transcript { keys, steps } => {
                keys.write(&mut buf);
                steps.write(&mut buf);
            }
            Message::TranscriptSignature {
                trustee_id,
                signature,
            } => {
                trustee_id.write(&mut buf);
                signature.write(&mut buf);
            }
            Message::TrusteeIdentity { trustee_id, key } => {
                trustee_id.write(&mut buf);
                key.write(&mut buf);
            }
            Message::TrusteeCipher {
                trustee_id,
                round,
                data,
            } => {
                trustee_id.write(&mut buf);
                round.write(&mut buf);
                write_bytes(&mut buf, data);
            }
            Message::RateChange { round } => round.write(&mut buf),
            Message::LastUploadFailed { conn_id } => conn_id.write(&mut buf),
            Message::DisruptionBlame {
                round,
                bit_pos,
                ephemeral,
                proof,
            } => {
                round.write(&mut buf);
                bit_pos.write(&mut buf);
                ephemeral.write(&mut buf);
                proof.write(&mut buf);
            }
            Message::DisruptionReveal { round, bit_pos } => {
                round.write(&mut buf);
                bit_pos.write(&mut buf);
            }
            Message::ClientSecrets { client_id, secrets } => {
                client_id.write(&mut buf);
                secrets.write(&mut buf);
            }
            Message::TrusteeSecrets {
                trustee_id,
                secrets,
            } => {
                trustee_id.write(&mut buf);
                secrets.write(&mut buf);
            }
        }
        buf
    }

    /// Decodes a payload for a known type tag.
    pub fn decode_payload<B: Buf>(message_type: u16, buf: &mut B) -> Result<Self, CodecError> {
        let message = match message_type {
            tag::ALL_ALL_PARAMETERS => Message::Parameters(Parameters::read(buf)?),
            tag::ALL_ALL_SHUTDOWN => Message::Shutdown,
            tag::REL_CLI_TELL_TRUSTEES_PK => Message::TrusteePublicKeys {
                keys: Vec::<RistrettoPoint>::read(buf)?,
            },
            tag::CLI_REL_TELL_PK_AND_EPH_PK => Message::ClientKeys {
                client_id: u32::read(buf)?,
                public: RistrettoPoint::read(buf)?,
                ephemeral: RistrettoPoint::read(buf)?,
            },
            tag::REL_CLI_TELL_EPH_PKS_AND_TRUSTEES_SIG => Message::SlotAssignment {
                base: RistrettoPoint::read(buf)?,
                keys: Vec::<RistrettoPoint>::read(buf)?,
                signatures: Vec::<Signature>::read(buf)?,
            },
            tag::REL_CLI_DOWNSTREAM_DATA => Message::Downstream(Downstream::read(buf)?),
            tag::REL_CLI_DOWNSTREAM_DATA_UDP => Message::DownstreamUdp(Downstream::read(buf)?),
            tag::CLI_REL_UPSTREAM_DATA => Message::Upstream {
                client_id: u32::read(buf)?,
                round: u32::read(buf)?,
                data: read_bytes(buf)?,
            },
            tag::CLI_REL_OPENCLOSED_DATA => Message::OpenClosedContribution {
                client_id: u32::read(buf)?,
                round: u32::read(buf)?,
                data: read_bytes(buf)?,
            },
            tag::REL_TRU_TELL_CLIENTS_PKS => Message::ClientPublicKeys {
                keys: Vec::<RistrettoPoint>::read(buf)?,
            },
            tag::REL_TRU_TELL_SHUFFLE_INPUT => Message::ShuffleInput {
                base: RistrettoPoint::read(buf)?,
                keys: Vec::<RistrettoPoint>::read(buf)?,
            },
            tag::TRU_REL_SHUFFLE => Message::ShuffleOutput {
                step: ShuffleStep::read(buf)?,
            },
            tag::REL_TRU_TELL_TRANSCRIPT => Message::Transcript {
                keys: Vec::<RistrettoPoint>::read(buf)?,
                steps: Vec::<ShuffleStep>::read(buf)?,
            },
            tag::TRU_REL_SIGN => Message::TranscriptSignature {
                trustee_id: u32::read(buf)?,
                signature: Signature::read(buf)?,
            },
            tag::TRU_REL_TELL_PK => Message::TrusteeIdentity {
                trustee_id: u32::read(buf)?,
                key: RistrettoPoint::read(buf)?,
            },
            tag::TRU_REL_DC_CIPHER => Message::TrusteeCipher {
                trustee_id: u32::read(buf)?,
                round: u32::read(buf)?,
                data: read_bytes(buf)?,
            },
            tag::REL_TRU_TELL_RATE_CHANGE => Message::RateChange {
                round: u32::read(buf)?,
            },
            tag::REL_ALL_LAST_UPLOAD_FAILED => Message::LastUploadFailed {
                conn_id: u32::read(buf)?,
            },
            tag::CLI_REL_DISRUPTION_BLAME => Message::DisruptionBlame {
                round: u32::read(buf)?,
                bit_pos: u32::read(buf)?,
                ephemeral: RistrettoPoint::read(buf)?,
                proof: DlogProof::read(buf)?,
            },
            tag::REL_ALL_DISRUPTION_REVEAL => Message::DisruptionReveal {
                round: u32::read(buf)?,
                bit_pos: u32::read(buf)?,
            },
            tag::CLI_REL_DISRUPTION_SECRET => Message::ClientSecrets {
                client_id: u32::read(buf)?,
                secrets: Vec::<RevealedSecret>::read(buf)?,
            },
            tag::TRU_REL_DISRUPTION_SECRET => Message::TrusteeSecrets {
                trustee_id: u32::read(buf)?,
                secrets: Vec::<RevealedSecret>::read(buf)?,
            },
            other => return Err(CodecError::UnknownMessage(other)),
        };
        if buf.remaining() > 0 {
            return Err(CodecError::ExtraData(buf.remaining()));
        }
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{generator, nizk::DlogProof, schnorr, shuffle, Keypair};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn round_trip(message: Message) {
        let payload = message.encode_payload();
        let decoded = Message::decode_payload(message.tag(), &mut payload.freeze()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_parameters_round_trip() {
        let mut rng = StdRng::seed_from_u64(41);
        let mut parameters = Parameters::default();
        parameters.set_int(param::N_CLIENTS, 2);
        parameters.set_int(param::N_TRUSTEES, 1);
        parameters.set_int(param::PAYLOAD_SIZE, 1500);
        parameters.set_bool(param::USE_UDP, false);
        parameters.set_str(param::DCNET_TYPE, "Simple");
        parameters.trustee_keys = vec![Keypair::generate(&mut rng).public];

        assert_eq!(parameters.int_or(param::N_CLIENTS, -1), 2);
        assert_eq!(parameters.int_or("Missing", -1), -1);
        assert!(!parameters.bool_or(param::USE_UDP, true));
        assert_eq!(parameters.str_or(param::DCNET_TYPE, "?"), "Simple");

        round_trip(Message::Parameters(parameters));
    }

    #[test]
    fn test_setup_messages_round_trip() {
        let mut rng = StdRng::seed_from_u64(42);
        let keypair = Keypair::generate(&mut rng);
        let eph = Keypair::generate(&mut rng);

        round_trip(Message::Shutdown);
        round_trip(Message::TrusteePublicKeys {
            keys: vec![keypair.public, eph.public],
        });
        round_trip(Message::ClientKeys {
            client_id: 3,
            public: keypair.public,
            ephemeral: eph.public,
        });

        let step = shuffle::shuffle(&mut rng, &generator(), &[eph.public]);
        let payload = shuffle::sign_payload(&step.base, &step.keys);
        let signature = schnorr::sign(&mut rng, &keypair.private, &payload);
        round_trip(Message::SlotAssignment {
            base: step.base,
            keys: step.keys.clone(),
            signatures: vec![signature.clone()],
        });
        round_trip(Message::ShuffleInput {
            base: generator(),
            keys: vec![eph.public],
        });
        round_trip(Message::ShuffleOutput { step: step.clone() });
        round_trip(Message::Transcript {
            keys: vec![eph.public],
            steps: vec![step],
        });
        round_trip(Message::TranscriptSignature {
            trustee_id: 0,
            signature,
        });
        round_trip(Message::TrusteeIdentity {
            trustee_id: 1,
            key: keypair.public,
        });
    }

    #[test]
    fn test_round_messages_round_trip() {
        round_trip(Message::Downstream(Downstream {
            round: 7,
            ownership_id: -1,
            flag_resync: true,
            flag_open_closed: false,
            data: vec![1, 2, 3],
        }));
        round_trip(Message::Upstream {
            client_id: 0,
            round: 7,
            data: vec![0xAA; 16],
        });
        round_trip(Message::OpenClosedContribution {
            client_id: 1,
            round: 8,
            data: vec![0b1000_0000],
        });
        round_trip(Message::TrusteeCipher {
            trustee_id: 0,
            round: 7,
            data: vec![0x55; 16],
        });
        round_trip(Message::RateChange { round: 9 });
        round_trip(Message::LastUploadFailed { conn_id: 4 });
    }

    #[test]
    fn test_blame_messages_round_trip() {
        let mut rng = StdRng::seed_from_u64(43);
        let keypair = Keypair::generate(&mut rng);
        let peer = Keypair::generate(&mut rng);

        round_trip(Message::DisruptionBlame {
            round: 17,
            bit_pos: 9,
            ephemeral: keypair.public,
            proof: DlogProof::prove(
                &mut rng,
                &keypair.private,
                &crate::crypto::generator(),
                b"blame",
            ),
        });
        round_trip(Message::DisruptionReveal {
            round: 17,
            bit_pos: 9,
        });

        let (secret, proof) =
            crate::crypto::nizk::DlogEqProof::prove(&mut rng, &keypair.private, &peer.public);
        round_trip(Message::ClientSecrets {
            client_id: 1,
            secrets: vec![RevealedSecret { secret, proof }],
        });
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let mut buf = bytes::Bytes::new();
        assert!(matches!(
            Message::decode_payload(0xFFFF, &mut buf),
            Err(CodecError::UnknownMessage(0xFFFF))
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let message = Message::LastUploadFailed { conn_id: 1 };
        let mut payload = message.encode_payload();
        payload.extend_from_slice(&[0u8]);
        assert!(matches!(
            Message::decode_payload(message.tag(), &mut payload.freeze()),
            Err(CodecError::ExtraData(1))
        ));
    }
}
