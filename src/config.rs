//! Construction-time configuration.
//!
//! One [`Config`] value is built by the binary and threaded to every
//! component; nothing reads configuration from globals. Identity and
//! trustee-bundle files are YAML with hex-encoded key material, and the
//! relay may checkpoint its identity to `<state-dir>/prifi.bin`.

use std::path::Path;
use std::time::Duration;

use curve25519_dalek_ng::ristretto::RistrettoPoint;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::codec::Codec;
use crate::crypto::{self, Keypair};
use crate::message::{param, Parameters};
use crate::Error;

/// File name of the relay identity checkpoint inside the state directory.
pub const STATE_FILE: &str = "prifi.bin";

/// Default cap on outstanding downstream cells.
pub const DEFAULT_WINDOW: usize = 2;

/// Default per-peer read deadline during cell collection.
pub const CLIENT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// How many rounds ahead of the relay's acknowledged round a trustee will
/// stream ciphers.
pub const TRUSTEE_WINDOW: u32 = 10;

/// Protocol-wide parameters, authoritative at the relay.
#[derive(Clone, Debug)]
pub struct Config {
    pub n_clients: usize,
    pub n_trustees: usize,
    pub payload_size: usize,
    pub use_udp: bool,
    pub dcnet_type: String,
    pub disruption_protection: bool,
    pub equivocation_protection: bool,
    /// Periodically run open/closed scheduling rounds instead of keeping
    /// every slot open.
    pub open_closed_scheduling: bool,
    pub window: usize,
    pub client_read_timeout: Duration,
    /// Stop after this many completed rounds (used by harnesses); `None`
    /// runs forever.
    pub reporting_limit: Option<u64>,
    /// Optional sleep between round iterations.
    pub round_pacing: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            n_clients: 2,
            n_trustees: 1,
            payload_size: 1500,
            use_udp: false,
            dcnet_type: "Simple".to_string(),
            disruption_protection: false,
            equivocation_protection: false,
            open_closed_scheduling: false,
            window: DEFAULT_WINDOW,
            client_read_timeout: CLIENT_READ_TIMEOUT,
            reporting_limit: None,
            round_pacing: Duration::ZERO,
        }
    }
}

impl Config {
    /// Validates relay-side invariants.
    pub fn validate(&self) -> Result<(), Error> {
        if self.n_clients < 2 {
            return Err(Error::Config("n_clients must be at least 2".into()));
        }
        if self.n_trustees < 1 {
            return Err(Error::Config("n_trustees must be at least 1".into()));
        }
        if self.window < 1 {
            return Err(Error::Config("window must be at least 1".into()));
        }
        RoundParams::check_payload(
            self.payload_size,
            self.disruption_protection,
            self.equivocation_protection,
        )?;
        Ok(())
    }

    /// Builds the parameter bag broadcast at setup.
    pub fn to_parameters(
        &self,
        next_free_client_id: i64,
        trustee_keys: Vec<RistrettoPoint>,
    ) -> Parameters {
        let mut parameters = Parameters::default();
        parameters.set_int(param::NEXT_FREE_CLIENT_ID, next_free_client_id);
        parameters.set_int(param::N_CLIENTS, self.n_clients as i64);
        parameters.set_int(param::N_TRUSTEES, self.n_trustees as i64);
        parameters.set_int(param::PAYLOAD_SIZE, self.payload_size as i64);
        parameters.set_bool(param::USE_UDP, self.use_udp);
        parameters.set_str(param::DCNET_TYPE, &self.dcnet_type);
        parameters.set_bool(param::DISRUPTION_PROTECTION, self.disruption_protection);
        parameters.set_bool(param::EQUIVOCATION_PROTECTION, self.equivocation_protection);
        parameters.trustee_keys = trustee_keys;
        parameters
    }
}

/// The per-setup parameters a client or trustee accepts from the relay.
#[derive(Clone, Debug, PartialEq)]
pub struct RoundParams {
    pub client_id: i64,
    pub n_clients: usize,
    pub n_trustees: usize,
    pub payload_size: usize,
    pub use_udp: bool,
    pub disruption_protection: bool,
    pub equivocation_protection: bool,
}

impl RoundParams {
    /// Extracts and sanity-checks the parameter bag, as received over the
    /// wire.
    pub fn from_parameters(parameters: &Parameters) -> Result<Self, Error> {
        let client_id = parameters.int_or(param::NEXT_FREE_CLIENT_ID, -1);
        let n_clients = parameters.int_or(param::N_CLIENTS, 0);
        let n_trustees = parameters.int_or(param::N_TRUSTEES, 0);
        let payload_size = parameters.int_or(param::PAYLOAD_SIZE, 0);
        if client_id < -1 {
            return Err(Error::Config("client id cannot be negative".into()));
        }
        if n_clients < 1 {
            return Err(Error::Config("n_clients cannot be smaller than 1".into()));
        }
        if n_trustees < 1 {
            return Err(Error::Config("n_trustees cannot be smaller than 1".into()));
        }
        if payload_size < 1 {
            return Err(Error::Config("payload_size cannot be 0".into()));
        }
        match parameters.str_or(param::DCNET_TYPE, "Simple") {
            "Simple" => {}
            other => {
                return Err(Error::Config(format!("unsupported DCNetType {other:?}")));
            }
        }
        let disruption = parameters.bool_or(param::DISRUPTION_PROTECTION, false);
        let equivocation = parameters.bool_or(param::EQUIVOCATION_PROTECTION, false);
        Self::check_payload(payload_size as usize, disruption, equivocation)?;
        Ok(Self {
            client_id,
            n_clients: n_clients as usize,
            n_trustees: n_trustees as usize,
            payload_size: payload_size as usize,
            use_udp: parameters.bool_or(param::USE_UDP, false),
            disruption_protection: disruption,
            equivocation_protection: equivocation,
        })
    }

    fn check_payload(
        payload_size: usize,
        disruption: bool,
        equivocation: bool,
    ) -> Result<(), Error> {
        let mut needed = 1;
        if disruption {
            // Room for the b_echo_last byte.
            needed += 1;
        }
        if equivocation {
            needed += crate::coder::EQUIVOCATION_TAG_LEN;
        }
        if payload_size < needed {
            return Err(Error::Config(format!(
                "payload_size {payload_size} below minimum {needed} for the enabled protections"
            )));
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct IdentityFile {
    private_key: String,
}

#[derive(Serialize, Deserialize)]
struct TrusteeBundleFile {
    trustees: Vec<String>,
}

/// Loads a role identity (private key) from a YAML file.
pub fn load_identity(path: &Path) -> Result<Keypair, Error> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read identity {}: {e}", path.display())))?;
    let file: IdentityFile = serde_yaml::from_str(&raw)
        .map_err(|e| Error::Config(format!("cannot parse identity {}: {e}", path.display())))?;
    let bytes = crypto::from_hex(&file.private_key)
        .ok_or_else(|| Error::Config("private_key is not valid hex".into()))?;
    let mut bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| Error::Config("private_key must be 32 bytes".into()))?;
    let keypair = Keypair::from_private_bytes(bytes)
        .ok_or_else(|| Error::Config("private_key is not a canonical scalar".into()));
    bytes.zeroize();
    keypair
}

/// Writes a role identity to a YAML file.
pub fn store_identity(path: &Path, keypair: &Keypair) -> Result<(), Error> {
    let file = IdentityFile {
        private_key: crypto::hex(&keypair.private.to_bytes()),
    };
    let raw = serde_yaml::to_string(&file)
        .map_err(|e| Error::Config(format!("cannot serialize identity: {e}")))?;
    std::fs::write(path, raw)
        .map_err(|e| Error::Config(format!("cannot write identity {}: {e}", path.display())))
}

/// Loads the pre-agreed trustee public-key bundle.
pub fn load_trustee_bundle(path: &Path) -> Result<Vec<RistrettoPoint>, Error> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read bundle {}: {e}", path.display())))?;
    let file: TrusteeBundleFile = serde_yaml::from_str(&raw)
        .map_err(|e| Error::Config(format!("cannot parse bundle {}: {e}", path.display())))?;
    file.trustees
        .iter()
        .map(|encoded| {
            let bytes = crypto::from_hex(encoded)
                .ok_or_else(|| Error::Config("trustee key is not valid hex".into()))?;
            let bytes: [u8; 32] = bytes
                .try_into()
                .map_err(|_| Error::Config("trustee key must be 32 bytes".into()))?;
            crypto::decompress(&bytes)
                .ok_or_else(|| Error::Config("trustee key is not a valid point".into()))
        })
        .collect()
}

/// Loads the relay identity from `<state-dir>/prifi.bin`, generating and
/// checkpointing a fresh one on first start.
pub fn load_or_init_relay_identity<R: RngCore + CryptoRng>(
    state_dir: &Path,
    rng: &mut R,
) -> Result<Keypair, Error> {
    let path = state_dir.join(STATE_FILE);
    if path.exists() {
        let raw = std::fs::read(&path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let bytes = <[u8; 32]>::decode(&raw[..])
            .map_err(|e| Error::Config(format!("corrupt {}: {e}", path.display())))?;
        return Keypair::from_private_bytes(bytes)
            .ok_or_else(|| Error::Config(format!("corrupt {}: bad scalar", path.display())));
    }
    let keypair = Keypair::generate(rng);
    std::fs::create_dir_all(state_dir)
        .map_err(|e| Error::Config(format!("cannot create {}: {e}", state_dir.display())))?;
    std::fs::write(&path, keypair.private.to_bytes().encode())
        .map_err(|e| Error::Config(format!("cannot write {}: {e}", path.display())))?;
    Ok(keypair)
}
