//! The client role.
//!
//! A client reacts to relay messages and never originates a round on its
//! own, so the whole protocol surface is [`Client::process`]: one inbound
//! message in, zero or more outbound messages back. [`Client::run`] pumps
//! a connection through it.
//!
//! Setup: `ALL_ALL_PARAMETERS` carries the roster shape and the trustee
//! keys; the client derives one shared secret per trustee, generates an
//! ephemeral keypair, and answers with `CLI_REL_TELL_PK_AND_EPH_PK`. When
//! the shuffled slot assignment arrives it verifies every trustee
//! signature, recognizes its own slot, and seeds the pipeline with the
//! round-0 cell. In steady state each downstream broadcast is answered
//! with one upstream DC-net cell.

use std::collections::{HashMap, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use curve25519_dalek_ng::ristretto::RistrettoPoint;
use rand::rngs::StdRng;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::coder::{CellCoder, Role};
use crate::config::RoundParams;
use crate::crypto::{
    nizk::{DlogEqProof, DlogProof},
    schnorr::{self, Signature},
    shared_secret, shuffle, Keypair,
};
use crate::message::{Downstream, Message, RevealedSecret};
use crate::net::Connection;
use crate::socks;
use crate::state::{State, StateMachine};
use crate::Error;

/// Dropped protocol-violating messages tolerated before the peer is
/// considered hostile.
const VIOLATION_LIMIT: u32 = 8;

/// Client construction parameters.
pub struct ClientConfig {
    /// Long-term identity.
    pub keypair: Keypair,
    /// Pre-agreed trustee keys; when present, the relay-advertised set
    /// must match exactly.
    pub trustee_bundle: Option<Vec<RistrettoPoint>>,
    /// Emit latency pings from client 0 when the slot would otherwise be
    /// wasted.
    pub latency_test: bool,
}

/// One client instance.
pub struct Client {
    config: ClientConfig,
    machine: StateMachine,
    rng: StdRng,

    // Per-setup state, reset by every ALL_ALL_PARAMETERS.
    params: Option<RoundParams>,
    id: u32,
    trustee_keys: Vec<RistrettoPoint>,
    ephemeral: Option<Keypair>,
    shuffle_base: Option<RistrettoPoint>,
    coder: Option<CellCoder>,
    my_slot: i32,
    round_no: u32,
    buffered: HashMap<u32, Downstream>,
    violations: u32,

    // Disruption-protection bookkeeping.
    last_message: Vec<u8>,
    hash_previous: [u8; 32],
    echo_due: bool,
    owned_rounds: VecDeque<u32>,

    // Egress interface: data to send anonymously, data received.
    pending_data: VecDeque<Vec<u8>>,
    data_out: Option<mpsc::Sender<Bytes>>,
}

impl Client {
    pub fn new(config: ClientConfig, rng: StdRng) -> Self {
        Self {
            config,
            machine: StateMachine::new("client-?"),
            rng,
            params: None,
            id: 0,
            trustee_keys: Vec::new(),
            ephemeral: None,
            shuffle_base: None,
            coder: None,
            my_slot: -1,
            round_no: 0,
            buffered: HashMap::new(),
            violations: 0,
            last_message: Vec::new(),
            hash_previous: [0u8; 32],
            echo_due: false,
            owned_rounds: VecDeque::new(),
            pending_data: VecDeque::new(),
            data_out: None,
        }
    }

    /// Attaches the downstream sink (towards the local SOCKS/VPN).
    pub fn set_data_out(&mut self, sink: mpsc::Sender<Bytes>) {
        self.data_out = Some(sink);
    }

    /// Queues one payload for anonymous transmission.
    pub fn queue_data(&mut self, data: Vec<u8>) {
        self.pending_data.push_back(data);
    }

    pub fn state(&self) -> State {
        self.machine.current()
    }

    pub fn slot(&self) -> i32 {
        self.my_slot
    }

    pub fn round(&self) -> u32 {
        self.round_no
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Handles one inbound message, returning the messages to send back
    /// to the relay.
    pub fn process(&mut self, message: Message) -> Result<Vec<Message>, Error> {
        if self.machine.current() == State::Shutdown {
            return Ok(Vec::new());
        }
        match message {
            Message::Shutdown => {
                info!(client = self.id, "shutdown requested");
                self.machine.transition(State::Shutdown);
                Ok(Vec::new())
            }
            Message::Parameters(parameters) => self.on_parameters(&parameters),
            Message::TrusteePublicKeys { keys } => {
                self.machine
                    .expect(&[State::Initializing], "REL_CLI_TELL_TRUSTEES_PK")?;
                self.on_trustee_keys(keys)
            }
            Message::SlotAssignment {
                base,
                keys,
                signatures,
            } => {
                self.machine.expect(
                    &[State::EphKeysSent],
                    "REL_CLI_TELL_EPH_PKS_AND_TRUSTEES_SIG",
                )?;
                self.on_slot_assignment(base, keys, signatures)
            }
            Message::Downstream(downstream) | Message::DownstreamUdp(downstream) => {
                self.machine
                    .expect(&[State::Ready], "REL_CLI_DOWNSTREAM_DATA")?;
                self.on_downstream(downstream)
            }
            Message::DisruptionReveal { round, bit_pos } => {
                self.machine
                    .expect(&[State::Ready, State::Blaming], "REL_ALL_DISRUPTION_REVEAL")?;
                self.on_disruption_reveal(round, bit_pos)
            }
            Message::LastUploadFailed { conn_id } => {
                warn!(
                    client = self.id,
                    conn_id, "relay reported a failed upload, awaiting resync"
                );
                Ok(Vec::new())
            }
            other => self.violation(other),
        }
    }

    /// Counts an out-of-role message; repeated violations poison the
    /// connection.
    fn violation(&mut self, message: Message) -> Result<Vec<Message>, Error> {
        self.violations += 1;
        warn!(
            client = self.id,
            message = message.name(),
            violations = self.violations,
            "unexpected message dropped"
        );
        if self.violations > VIOLATION_LIMIT {
            return Err(Error::PeerLost("relay sent repeated garbage".into()));
        }
        Ok(Vec::new())
    }

    fn on_parameters(&mut self, parameters: &crate::message::Parameters) -> Result<Vec<Message>, Error> {
        let params = RoundParams::from_parameters(parameters)?;
        self.id = params.client_id.max(0) as u32;
        self.machine.set_entity(format!("client-{}", self.id));
        self.machine.transition(State::Initializing);

        self.my_slot = -1;
        self.round_no = 0;
        self.buffered.clear();
        self.owned_rounds.clear();
        self.echo_due = false;
        self.params = Some(params);

        info!(client = self.id, "initialized by parameters");

        // The parameter bag carries the trustee keys; continue as if they
        // had arrived separately.
        self.on_trustee_keys(parameters.trustee_keys.clone())
    }

    fn on_trustee_keys(&mut self, keys: Vec<RistrettoPoint>) -> Result<Vec<Message>, Error> {
        let params = self
            .params
            .clone()
            .ok_or_else(|| Error::Config("parameters not received".into()))?;
        if keys.len() != params.n_trustees {
            return Err(Error::Config(format!(
                "expected {} trustee keys, got {}",
                params.n_trustees,
                keys.len()
            )));
        }
        if let Some(bundle) = &self.config.trustee_bundle {
            if *bundle != keys {
                return Err(Error::Verification(
                    "advertised trustee keys do not match the pre-agreed bundle".into(),
                ));
            }
        }

        let secrets: Vec<RistrettoPoint> = keys
            .iter()
            .map(|key| shared_secret(&self.config.keypair.private, key))
            .collect();
        self.coder = Some(CellCoder::new(
            Role::Client,
            params.payload_size,
            params.equivocation_protection,
            secrets,
        ));
        self.trustee_keys = keys;

        // Fresh ephemeral keypair for every setup; the old one dies with
        // the previous shuffle.
        let ephemeral = Keypair::generate(&mut self.rng);
        let reply = Message::ClientKeys {
            client_id: self.id,
            public: self.config.keypair.public,
            ephemeral: ephemeral.public,
        };
        self.ephemeral = Some(ephemeral);
        self.machine.transition(State::EphKeysSent);
        Ok(vec![reply])
    }

    fn on_slot_assignment(
        &mut self,
        base: RistrettoPoint,
        keys: Vec<RistrettoPoint>,
        signatures: Vec<Signature>,
    ) -> Result<Vec<Message>, Error> {
        let params = self
            .params
            .clone()
            .ok_or_else(|| Error::Config("parameters not received".into()))?;
        if signatures.len() != params.n_trustees {
            return Err(Error::Verification(format!(
                "expected {} transcript signatures, got {}",
                params.n_trustees,
                signatures.len()
            )));
        }
        let payload = shuffle::sign_payload(&base, &keys);
        for (index, (anchor, signature)) in
            self.trustee_keys.iter().zip(&signatures).enumerate()
        {
            if !schnorr::verify(anchor, &payload, signature) {
                return Err(Error::Verification(format!(
                    "trustee {index} signature does not verify"
                )));
            }
        }

        let ephemeral = self
            .ephemeral
            .as_ref()
            .ok_or_else(|| Error::Config("no ephemeral key for this setup".into()))?;
        let slot = shuffle::recognize_slot(&ephemeral.private, &base, &keys).ok_or_else(|| {
            Error::Verification("cannot recognize our slot in the shuffle".into())
        })?;
        self.my_slot = slot as i32;
        self.shuffle_base = Some(base);
        self.round_no = 0;
        self.buffered.clear();
        self.machine.transition(State::Ready);
        info!(client = self.id, slot, "ready to communicate");

        // Round 0 is a blank cell; by convention client 0 takes the
        // responsibility for the first slot.
        let owner = self.id == 0;
        let cell = self.build_upstream_cell(owner, Vec::new())?;
        let out = Message::Upstream {
            client_id: self.id,
            round: self.round_no,
            data: cell,
        };
        if owner {
            self.owned_rounds.push_back(self.round_no);
        }
        self.round_no += 1;
        Ok(vec![out])
    }

    fn on_downstream(&mut self, downstream: Downstream) -> Result<Vec<Message>, Error> {
        if downstream.round < self.round_no {
            trace!(
                client = self.id,
                round = downstream.round,
                current = self.round_no,
                "stale downstream discarded"
            );
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        if downstream.round > self.round_no {
            debug!(
                client = self.id,
                from = self.round_no,
                to = downstream.round,
                "skipping rounds"
            );
            self.buffered.insert(downstream.round, downstream);
            self.round_no = self.buffered.keys().copied().min().unwrap_or(self.round_no);
        } else {
            out.extend(self.process_downstream(downstream)?);
        }

        // A buffered out-of-order message may already be the next round.
        while let Some(next) = self.buffered.remove(&self.round_no) {
            if self.machine.current() != State::Ready {
                break;
            }
            out.extend(self.process_downstream(next)?);
        }
        Ok(out)
    }

    fn process_downstream(&mut self, downstream: Downstream) -> Result<Vec<Message>, Error> {
        let params = self
            .params
            .clone()
            .ok_or_else(|| Error::Config("parameters not received".into()))?;

        // Deliver payload to the local egress and recognize latency
        // echoes on the way past.
        if downstream.data.len() > 1 {
            if let Some(sink) = &self.data_out {
                let _ = sink.try_send(Bytes::from(downstream.data.clone()));
            }
            if self.config.latency_test {
                if let Some((client_id, sent_ms)) = socks::parse_latency_ping(&downstream.data) {
                    if u32::from(client_id) == self.id {
                        let now = timestamp_ms();
                        info!(
                            client = self.id,
                            round = downstream.round,
                            latency_ms = now.saturating_sub(sent_ms),
                            "measured latency"
                        );
                    }
                }
            }
        }

        if downstream.flag_resync {
            info!(client = self.id, "relay wants to resync");
            // The ephemeral keypair is regenerated when the next setup
            // starts; dropping it here makes reuse impossible.
            self.ephemeral = None;
            self.shuffle_base = None;
            self.coder = None;
            self.machine.transition(State::BeforeInit);
            return Ok(Vec::new());
        }

        // The downstream history feeds equivocation protection; resync
        // broadcasts never make it here.
        if let Some(coder) = self.coder.as_mut() {
            coder.update_history(&downstream.data);
        }

        let out = if downstream.flag_open_closed {
            let wants = !self.pending_data.is_empty()
                || (self.config.latency_test && self.id == 0);
            let contribution =
                crate::schedule::contribution(params.n_clients, self.my_slot.max(0) as usize, wants);
            let cell = self.encode_plain(false, contribution)?;
            Message::OpenClosedContribution {
                client_id: self.id,
                round: self.round_no,
                data: cell,
            }
        } else {
            self.send_upstream(downstream.ownership_id)?
        };

        self.buffered.remove(&self.round_no.wrapping_sub(1));
        self.round_no += 1;
        Ok(vec![out])
    }

    /// Builds the upstream cell for a data round.
    fn send_upstream(&mut self, ownership_id: i32) -> Result<Message, Error> {
        let owner = ownership_id >= 0 && ownership_id == self.my_slot;
        let round = self.round_no;

        let payload = if owner {
            self.owned_rounds.push_back(round);
            let params = self.params.as_ref().expect("checked by caller");
            while self.owned_rounds.len() > 2 * params.n_clients {
                self.owned_rounds.pop_front();
            }
            self.next_owned_payload()?
        } else {
            Vec::new()
        };

        let cell = self.build_upstream_cell(owner, payload)?;
        Ok(Message::Upstream {
            client_id: self.id,
            round,
            data: cell,
        })
    }

    /// Chooses what the owned slot carries this round: an echo of the
    /// previous owned message when one is due, else fresh data, else a
    /// latency ping, else zeros.
    fn next_owned_payload(&mut self) -> Result<Vec<u8>, Error> {
        let params = self.params.as_ref().expect("checked by caller");
        if params.disruption_protection && self.echo_due {
            return Ok(self.last_message.clone());
        }
        if let Some(data) = self.pending_data.pop_front() {
            return Ok(data);
        }
        if self.config.latency_test && self.id == 0 {
            return Ok(socks::encode_latency_ping(
                self.id as u16,
                timestamp_ms(),
            ));
        }
        Ok(Vec::new())
    }

    /// Encodes one upstream cell, maintaining the disruption-protection
    /// ledger (`b_echo_last`, `LastMessage`, and its hash).
    fn build_upstream_cell(&mut self, owner: bool, payload: Vec<u8>) -> Result<Vec<u8>, Error> {
        let params = self.params.as_ref().expect("checked by caller");
        if !params.disruption_protection {
            return self.encode_plain(owner, payload);
        }

        let echoing = owner && self.echo_due;
        let b_echo_last = u8::from(echoing);
        let mut framed = Vec::with_capacity(1 + payload.len());
        framed.push(b_echo_last);
        framed.extend_from_slice(&payload);

        let round = self.round_no;
        let coder = self
            .coder
            .as_ref()
            .ok_or_else(|| Error::Config("coder not initialized".into()))?;
        let (cell, plain) = coder
            .encode_for_round(&mut self.rng, round, owner, &framed)
            .map_err(|e| Error::Config(e.to_string()))?;

        if owner {
            if echoing {
                // Echo sent; next owned round carries fresh data again.
                self.echo_due = false;
            } else {
                self.last_message = plain[1..].to_vec();
                self.hash_previous = Sha256::digest(&plain[1..]).into();
                self.echo_due = true;
            }
        } else if self.last_message.is_empty() {
            // Initialize the ledger so the first owned round has a
            // well-defined previous message.
            self.last_message = vec![0u8; plain.len().saturating_sub(1)];
            self.hash_previous = Sha256::digest(&self.last_message).into();
        }
        Ok(cell)
    }

    fn encode_plain(&mut self, owner: bool, payload: Vec<u8>) -> Result<Vec<u8>, Error> {
        let round = self.round_no;
        let coder = self
            .coder
            .as_ref()
            .ok_or_else(|| Error::Config("coder not initialized".into()))?;
        let (cell, _) = coder
            .encode_for_round(&mut self.rng, round, owner, &payload)
            .map_err(|e| Error::Config(e.to_string()))?;
        Ok(cell)
    }

    /// Answers a blame round: claim the disputed slot if we owned it,
    /// then open the shared secrets with every trustee. The claim must
    /// precede the openings; the relay reads each client up to its
    /// secrets message.
    fn on_disruption_reveal(&mut self, round: u32, bit_pos: u32) -> Result<Vec<Message>, Error> {
        self.machine.transition(State::Blaming);
        info!(client = self.id, round, bit_pos, "blame round opened");

        let mut out = Vec::new();
        if self.owned_rounds.contains(&round) {
            if let (Some(ephemeral), Some(base)) = (&self.ephemeral, &self.shuffle_base) {
                info!(
                    client = self.id,
                    round,
                    committed = crate::crypto::hex(&self.hash_previous),
                    "claiming the disputed slot"
                );
                let context = blame_context(round, bit_pos);
                out.push(Message::DisruptionBlame {
                    round,
                    bit_pos,
                    // The key as it appears in the final shuffle output,
                    // proven against the final base.
                    ephemeral: ephemeral.private * base,
                    proof: DlogProof::prove(&mut self.rng, &ephemeral.private, base, &context),
                });
            }
        }

        let secrets = self
            .trustee_keys
            .iter()
            .map(|trustee| {
                let (secret, proof) =
                    DlogEqProof::prove(&mut self.rng, &self.config.keypair.private, trustee);
                RevealedSecret { secret, proof }
            })
            .collect();
        out.push(Message::ClientSecrets {
            client_id: self.id,
            secrets,
        });
        Ok(out)
    }

    /// Pumps a relay connection through the state machine until shutdown
    /// or connection loss.
    pub async fn run(mut self, mut conn: Connection) -> Result<(), Error> {
        loop {
            let message = match conn.recv().await {
                Ok(message) => message,
                Err(e) => return Err(Error::PeerLost(format!("relay: {e}"))),
            };
            match self.process(message) {
                Ok(out) => {
                    for message in out {
                        conn.sender.send(&message).await?;
                    }
                }
                // Out-of-phase messages are logged and dropped; anything
                // else is fatal for this client.
                Err(Error::OutOfPhase { .. }) => continue,
                Err(e) => return Err(e),
            }
            if self.machine.current() == State::Shutdown {
                return Ok(());
            }
        }
    }
}

/// Domain-separated context for the slot-ownership proof.
pub fn blame_context(round: u32, bit_pos: u32) -> Vec<u8> {
    let mut context = b"dcnet-blame".to_vec();
    context.extend_from_slice(&round.to_be_bytes());
    context.extend_from_slice(&bit_pos.to_be_bytes());
    context
}

fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn client(seed: u64) -> Client {
        let mut rng = StdRng::seed_from_u64(seed);
        let keypair = Keypair::generate(&mut rng);
        Client::new(
            ClientConfig {
                keypair,
                trustee_bundle: None,
                latency_test: false,
            },
            rng,
        )
    }

    fn parameters(trustees: Vec<RistrettoPoint>) -> Message {
        let config = crate::config::Config::default();
        Message::Parameters(config.to_parameters(0, trustees))
    }

    #[test]
    fn test_parameters_elicit_keys() {
        let mut rng = StdRng::seed_from_u64(1);
        let trustee = Keypair::generate(&mut rng);
        let mut client = client(2);

        let out = client.process(parameters(vec![trustee.public])).unwrap();
        assert_eq!(client.state(), State::EphKeysSent);
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], Message::ClientKeys { client_id: 0, .. }));
    }

    #[test]
    fn test_bundle_mismatch_is_fatal() {
        let mut rng = StdRng::seed_from_u64(3);
        let advertised = Keypair::generate(&mut rng);
        let pinned = Keypair::generate(&mut rng);

        let keypair = Keypair::generate(&mut rng);
        let mut client = Client::new(
            ClientConfig {
                keypair,
                trustee_bundle: Some(vec![pinned.public]),
                latency_test: false,
            },
            rng,
        );
        let result = client.process(parameters(vec![advertised.public]));
        assert!(matches!(result, Err(Error::Verification(_))));
    }

    #[test]
    fn test_downstream_out_of_phase_is_dropped() {
        let mut client = client(4);
        let result = client.process(Message::Downstream(Downstream {
            round: 0,
            ownership_id: -1,
            flag_resync: false,
            flag_open_closed: false,
            data: vec![],
        }));
        assert!(matches!(result, Err(Error::OutOfPhase { .. })));
    }

    #[test]
    fn test_repeated_violations_poison() {
        let mut client = client(5);
        for _ in 0..VIOLATION_LIMIT {
            assert!(client.process(Message::RateChange { round: 0 }).unwrap().is_empty());
        }
        assert!(client.process(Message::RateChange { round: 0 }).is_err());
    }

    #[test]
    fn test_shutdown_from_any_state() {
        let mut client = client(6);
        client.process(Message::Shutdown).unwrap();
        assert_eq!(client.state(), State::Shutdown);
        // Further messages are ignored.
        assert!(client.process(Message::RateChange { round: 0 }).unwrap().is_empty());
    }
}
