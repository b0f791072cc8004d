//! The trustee role.
//!
//! Trustees never see payload data: they contribute one pad cell per
//! round, perform one link of the shuffle chain during setup, and
//! arbitrate blame. Cells are streamed ahead of the relay's acknowledged
//! round up to a fixed window, so the relay never waits on a trustee in
//! steady state but a stalled relay cannot be flooded either.

use curve25519_dalek_ng::ristretto::RistrettoPoint;
use rand::rngs::StdRng;
use tracing::{debug, info, warn};

use crate::coder::{CellCoder, Role};
use crate::config::{RoundParams, TRUSTEE_WINDOW};
use crate::crypto::{generator, nizk::DlogEqProof, schnorr, shared_secret, shuffle, Keypair};
use crate::message::{Message, RevealedSecret};
use crate::net::Connection;
use crate::state::{State, StateMachine};
use crate::Error;

const VIOLATION_LIMIT: u32 = 8;

pub struct TrusteeConfig {
    pub id: u32,
    pub keypair: Keypair,
}

pub struct Trustee {
    config: TrusteeConfig,
    machine: StateMachine,
    rng: StdRng,

    params: Option<RoundParams>,
    client_keys: Vec<RistrettoPoint>,
    coder: Option<CellCoder>,
    my_step: Option<shuffle::ShuffleStep>,

    /// Next round for which a cipher has not yet been produced.
    next_cipher_round: u32,
    /// Highest round the relay has acknowledged consuming.
    relay_round: u32,
    violations: u32,
}

impl Trustee {
    pub fn new(config: TrusteeConfig, rng: StdRng) -> Self {
        let entity = format!("trustee-{}", config.id);
        Self {
            config,
            machine: StateMachine::new(entity),
            rng,
            params: None,
            client_keys: Vec::new(),
            coder: None,
            my_step: None,
            next_cipher_round: 0,
            relay_round: 0,
            violations: 0,
        }
    }

    pub fn state(&self) -> State {
        self.machine.current()
    }

    pub fn public_key(&self) -> RistrettoPoint {
        self.config.keypair.public
    }

    /// Handles one relay message.
    pub fn process(&mut self, message: Message) -> Result<Vec<Message>, Error> {
        if self.machine.current() == State::Shutdown {
            return Ok(Vec::new());
        }
        match message {
            Message::Shutdown => {
                info!(trustee = self.config.id, "shutdown requested");
                self.machine.transition(State::Shutdown);
                Ok(Vec::new())
            }
            Message::Parameters(parameters) => {
                let params = RoundParams::from_parameters(&parameters)?;
                self.params = Some(params);
                self.client_keys.clear();
                self.coder = None;
                self.my_step = None;
                self.next_cipher_round = 0;
                self.relay_round = 0;
                self.machine.transition(State::Initializing);
                // Answering with our identity doubles as the epoch
                // barrier: everything the relay reads before this reply
                // belongs to the previous setup.
                Ok(vec![Message::TrusteeIdentity {
                    trustee_id: self.config.id,
                    key: self.config.keypair.public,
                }])
            }
            Message::ClientPublicKeys { keys } => {
                self.machine
                    .expect(&[State::Initializing], "REL_TRU_TELL_CLIENTS_PKS")?;
                self.on_client_keys(keys)
            }
            Message::ShuffleInput { base, keys } => {
                self.machine
                    .expect(&[State::EphKeysSent], "REL_TRU_TELL_SHUFFLE_INPUT")?;
                let step = shuffle::shuffle(&mut self.rng, &base, &keys);
                self.my_step = Some(step.clone());
                debug!(trustee = self.config.id, keys = keys.len(), "shuffled");
                Ok(vec![Message::ShuffleOutput { step }])
            }
            Message::Transcript { keys, steps } => {
                self.machine
                    .expect(&[State::EphKeysSent], "REL_TRU_TELL_TRANSCRIPT")?;
                self.on_transcript(keys, steps)
            }
            Message::RateChange { round } => {
                self.relay_round = self.relay_round.max(round);
                Ok(Vec::new())
            }
            Message::DisruptionReveal { round, bit_pos } => {
                self.machine
                    .expect(&[State::Ready, State::Blaming], "REL_ALL_DISRUPTION_REVEAL")?;
                self.machine.transition(State::Blaming);
                info!(trustee = self.config.id, round, bit_pos, "blame round opened");
                let secrets = self
                    .client_keys
                    .iter()
                    .map(|client| {
                        let (secret, proof) = DlogEqProof::prove(
                            &mut self.rng,
                            &self.config.keypair.private,
                            client,
                        );
                        RevealedSecret { secret, proof }
                    })
                    .collect();
                Ok(vec![Message::TrusteeSecrets {
                    trustee_id: self.config.id,
                    secrets,
                }])
            }
            other => {
                self.violations += 1;
                warn!(
                    trustee = self.config.id,
                    message = other.name(),
                    violations = self.violations,
                    "unexpected message dropped"
                );
                if self.violations > VIOLATION_LIMIT {
                    return Err(Error::PeerLost("relay sent repeated garbage".into()));
                }
                Ok(Vec::new())
            }
        }
    }

    fn on_client_keys(&mut self, keys: Vec<RistrettoPoint>) -> Result<Vec<Message>, Error> {
        let params = self
            .params
            .clone()
            .ok_or_else(|| Error::Config("parameters not received".into()))?;
        if keys.len() != params.n_clients {
            return Err(Error::Config(format!(
                "expected {} client keys, got {}",
                params.n_clients,
                keys.len()
            )));
        }
        let secrets: Vec<RistrettoPoint> = keys
            .iter()
            .map(|client| shared_secret(&self.config.keypair.private, client))
            .collect();
        self.coder = Some(CellCoder::new(
            Role::Trustee,
            params.payload_size,
            params.equivocation_protection,
            secrets,
        ));
        self.client_keys = keys;
        self.machine.transition(State::EphKeysSent);
        Ok(Vec::new())
    }

    fn on_transcript(
        &mut self,
        keys: Vec<RistrettoPoint>,
        steps: Vec<shuffle::ShuffleStep>,
    ) -> Result<Vec<Message>, Error> {
        let params = self
            .params
            .clone()
            .ok_or_else(|| Error::Config("parameters not received".into()))?;
        if steps.len() != params.n_trustees {
            return Err(Error::Verification(format!(
                "transcript has {} links, expected {}",
                steps.len(),
                params.n_trustees
            )));
        }
        if !shuffle::verify_chain(&generator(), &keys, &steps) {
            return Err(Error::Verification("shuffle chain does not verify".into()));
        }
        let mine = self
            .my_step
            .as_ref()
            .ok_or_else(|| Error::Verification("no shuffle step of our own".into()))?;
        if !steps.iter().any(|step| step == mine) {
            return Err(Error::Verification(
                "our shuffle link is missing from the transcript".into(),
            ));
        }

        let last = steps.last().ok_or_else(|| {
            Error::Verification("transcript cannot be empty".into())
        })?;
        let payload = shuffle::sign_payload(&last.base, &last.keys);
        let signature = schnorr::sign(&mut self.rng, &self.config.keypair.private, &payload);
        self.machine.transition(State::Ready);
        info!(trustee = self.config.id, "transcript signed, streaming ciphers");
        Ok(vec![Message::TranscriptSignature {
            trustee_id: self.config.id,
            signature,
        }])
    }

    /// Produces cipher cells up to the streaming window.
    pub fn next_ciphers(&mut self) -> Vec<Message> {
        let mut out = Vec::new();
        if self.machine.current() != State::Ready {
            return out;
        }
        let Some(coder) = self.coder.as_ref() else {
            return out;
        };
        let horizon = self.relay_round.saturating_add(TRUSTEE_WINDOW);
        while self.next_cipher_round < horizon {
            out.push(Message::TrusteeCipher {
                trustee_id: self.config.id,
                round: self.next_cipher_round,
                data: coder.encode_trustee(self.next_cipher_round),
            });
            self.next_cipher_round += 1;
        }
        out
    }

    /// Pumps a relay connection until shutdown or loss.
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
                Err(Error::OutOfPhase { .. }) => continue,
                Err(e) => return Err(e),
            }
            for message in self.next_ciphers() {
                conn.sender.send(&message).await?;
            }
            if self.machine.current() == State::Shutdown {
                return Ok(());
            }
        }
    }
}
