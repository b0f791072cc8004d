//! The strictly sequential setup phase.
//!
//! 1. Broadcast individualized `ALL_ALL_PARAMETERS` to clients, collect
//!    each client's `(pk, eph_pk)`.
//! 2. Re-parameterize trustees (their identity reply doubles as the epoch
//!    barrier against stale frames), hand them the client keys.
//! 3. Walk the shuffle chain trustee by trustee, verifying each link.
//! 4. Broadcast the transcript to the trustees and collect signatures.
//! 5. Broadcast the final slot assignment to clients.
//!
//! A peer that fails or cheats mid-setup is expelled before the error
//! propagates, so the next setup attempt runs with the survivors instead
//! of wedging on the same peer again.

use std::collections::HashMap;

use curve25519_dalek_ng::ristretto::RistrettoPoint;
use tracing::{debug, info, warn};

use super::{Relay, SetupContext};
use crate::crypto::{generator, shuffle};
use crate::message::Message;
use crate::Error;

/// A setup abort attributed to one peer.
enum SetupFailure {
    Client(usize, String),
    Trustee(usize, String),
}

impl Relay {
    pub(crate) async fn setup(&mut self) -> Result<SetupContext, Error> {
        match self.run_setup().await {
            Ok(context) => Ok(context),
            Err(SetupFailure::Client(index, reason)) => {
                warn!(client = index, reason, "setup failed on client");
                self.remove_client(index);
                Err(Error::PeerLost(format!("client {index}: {reason}")))
            }
            Err(SetupFailure::Trustee(index, reason)) => {
                warn!(trustee = index, reason, "setup failed on trustee");
                self.remove_trustee(index);
                Err(Error::PeerLost(format!("trustee {index}: {reason}")))
            }
        }
    }

    async fn run_setup(&mut self) -> Result<SetupContext, SetupFailure> {
        // Anything still queued belongs to the previous epoch.
        for peer in self.clients.iter_mut().chain(self.trustees.iter_mut()) {
            peer.conn.drain();
        }
        self.config.n_clients = self.clients.len();
        self.config.n_trustees = self.trustees.len();
        self.refresh_udp_targets();
        info!(
            clients = self.config.n_clients,
            trustees = self.config.n_trustees,
            payload = self.config.payload_size,
            "new setup"
        );

        let trustee_statics: Vec<RistrettoPoint> =
            self.trustees.iter().map(|peer| peer.public).collect();

        // Parameters go to clients first; each reply carries the static
        // and ephemeral keys we need for the rest of the setup.
        for index in 0..self.clients.len() {
            let parameters = self
                .config
                .to_parameters(index as i64, trustee_statics.clone());
            self.clients[index]
                .conn
                .sender
                .send(&Message::Parameters(parameters))
                .await
                .map_err(|e| SetupFailure::Client(index, e.to_string()))?;
        }
        let timeout = self.config.client_read_timeout;
        for index in 0..self.clients.len() {
            loop {
                let message = self.clients[index]
                    .conn
                    .recv_timeout(timeout)
                    .await
                    .map_err(|e| SetupFailure::Client(index, e.to_string()))?;
                match message {
                    Message::ClientKeys {
                        public, ephemeral, ..
                    } => {
                        if public != self.clients[index].public {
                            return Err(SetupFailure::Client(
                                index,
                                "changed its static key".into(),
                            ));
                        }
                        self.clients[index].ephemeral = Some(ephemeral);
                        break;
                    }
                    other => {
                        debug!(client = index, message = other.name(), "stale frame in setup");
                        continue;
                    }
                }
            }
        }
        info!("collected all ephemeral public keys");

        // Trustees next: parameters, barrier reply, then the client keys
        // they derive pads from.
        let client_statics: Vec<RistrettoPoint> =
            self.clients.iter().map(|peer| peer.public).collect();
        let trustee_parameters = self.config.to_parameters(-1, trustee_statics.clone());
        for index in 0..self.trustees.len() {
            self.trustees[index]
                .conn
                .sender
                .send(&Message::Parameters(trustee_parameters.clone()))
                .await
                .map_err(|e| SetupFailure::Trustee(index, e.to_string()))?;
            loop {
                let message = self.trustees[index]
                    .conn
                    .recv_timeout(timeout)
                    .await
                    .map_err(|e| SetupFailure::Trustee(index, e.to_string()))?;
                match message {
                    Message::TrusteeIdentity { key, .. } => {
                        if key != self.trustees[index].public {
                            return Err(SetupFailure::Trustee(
                                index,
                                "changed its static key".into(),
                            ));
                        }
                        break;
                    }
                    other => {
                        debug!(trustee = index, message = other.name(), "stale frame in setup");
                        continue;
                    }
                }
            }
            self.trustees[index]
                .conn
                .sender
                .send(&Message::ClientPublicKeys {
                    keys: client_statics.clone(),
                })
                .await
                .map_err(|e| SetupFailure::Trustee(index, e.to_string()))?;
        }

        // The shuffle chain: each trustee's output is the next one's
        // input.
        let initial_keys: Vec<RistrettoPoint> = self
            .clients
            .iter()
            .enumerate()
            .map(|(index, peer)| {
                peer.ephemeral
                    .ok_or_else(|| SetupFailure::Client(index, "missing ephemeral key".into()))
            })
            .collect::<Result<_, _>>()?;
        let mut base = generator();
        let mut keys = initial_keys.clone();
        let mut steps = Vec::with_capacity(self.trustees.len());
        for index in 0..self.trustees.len() {
            self.trustees[index]
                .conn
                .sender
                .send(&Message::ShuffleInput {
                    base,
                    keys: keys.clone(),
                })
                .await
                .map_err(|e| SetupFailure::Trustee(index, e.to_string()))?;
            info!(trustee = index, "shuffling");
            let step = loop {
                let message = self.trustees[index]
                    .conn
                    .recv_timeout(timeout)
                    .await
                    .map_err(|e| SetupFailure::Trustee(index, e.to_string()))?;
                match message {
                    Message::ShuffleOutput { step } => break step,
                    other => {
                        debug!(trustee = index, message = other.name(), "stale frame in setup");
                        continue;
                    }
                }
            };
            if !shuffle::verify_step(&base, &keys, &step) {
                return Err(SetupFailure::Trustee(
                    index,
                    "produced an invalid shuffle step".into(),
                ));
            }
            base = step.base;
            keys = step.keys.clone();
            steps.push(step);
        }
        info!("all trustees have shuffled, sending the transcript");

        // Transcript broadcast and signature collection.
        let transcript = Message::Transcript {
            keys: initial_keys,
            steps,
        };
        for index in 0..self.trustees.len() {
            self.trustees[index]
                .conn
                .sender
                .send(&transcript)
                .await
                .map_err(|e| SetupFailure::Trustee(index, e.to_string()))?;
        }
        let mut signatures = Vec::with_capacity(self.trustees.len());
        for index in 0..self.trustees.len() {
            loop {
                let message = self.trustees[index]
                    .conn
                    .recv_timeout(timeout)
                    .await
                    .map_err(|e| SetupFailure::Trustee(index, e.to_string()))?;
                match message {
                    Message::TranscriptSignature { signature, .. } => {
                        signatures.push(signature);
                        break;
                    }
                    other => {
                        debug!(trustee = index, message = other.name(), "stale frame in setup");
                        continue;
                    }
                }
            }
            debug!(trustee = index, "collected transcript signature");
        }

        // Final slot assignment to every client.
        let assignment = Message::SlotAssignment {
            base,
            keys: keys.clone(),
            signatures,
        };
        for index in 0..self.clients.len() {
            self.clients[index]
                .conn
                .sender
                .send(&assignment)
                .await
                .map_err(|e| SetupFailure::Client(index, e.to_string()))?;
        }
        info!("oblivious shuffle and signatures sent");

        Ok(SetupContext {
            final_base: base,
            final_keys: keys,
            client_statics,
            trustee_statics,
            round_kinds: HashMap::new(),
        })
    }
}
