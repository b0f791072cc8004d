//! Disruption arbitration.
//!
//! Only the disputed bit is ever opened. Every client and trustee reveals
//! its pairwise shared-secret points for the disputed round, each bound
//! to its static key by a discrete-log-equality proof, and the slot owner
//! claims the slot with a proof against the final shuffle base. The relay
//! then recomputes each party's pad bits at the disputed position and
//! compares them with the retained ciphertexts: walking clients in
//! ascending id order and then trustees, the first inconsistent party is
//! the disruptor. A party whose proof fails verification, or who refuses
//! to answer, is the disruptor outright.

use std::collections::VecDeque;

use curve25519_dalek_ng::ristretto::RistrettoPoint;
use tracing::{debug, info, warn};

use super::round::{byte_bit, cell_bit, RoundRecord};
use super::{Relay, RoundKind, SetupContext};
use crate::client::blame_context;
use crate::crypto::pad;
use crate::message::{Message, RevealedSecret};
use crate::state::RelayPhase;

/// Who the arbitration pinned down.
#[derive(Debug, PartialEq, Eq)]
enum Culprit {
    Client(usize),
    Trustee(usize),
    Nobody,
}

impl Relay {
    /// Runs one blame round; the culprit (if any) is expelled from the
    /// roster before returning. The caller resyncs afterwards either
    /// way.
    pub(crate) async fn run_blame(
        &mut self,
        ctx: &SetupContext,
        round: u32,
        bit_pos: u32,
        records: &VecDeque<RoundRecord>,
    ) {
        self.phase = RelayPhase::Blaming;
        info!(round, bit_pos, "disruption suspected, opening blame round");

        let Some(record) = records.iter().find(|record| record.round == round) else {
            warn!(round, "disputed round no longer retained, cannot arbitrate");
            return;
        };
        let RoundKind::Data { owner } = record.kind else {
            warn!(round, "disputed round was not a data round");
            return;
        };
        if owner < 0 {
            warn!(round, "disputed round had no owner");
            return;
        }

        let roster = (self.clients.len(), self.trustees.len());
        self.broadcast_all(&Message::DisruptionReveal { round, bit_pos })
            .await;
        if (self.clients.len(), self.trustees.len()) != roster {
            warn!("roster changed during the reveal broadcast, aborting blame");
            return;
        }

        match self.arbitrate(ctx, record, owner as usize, bit_pos).await {
            Culprit::Client(index) => {
                info!(client = index, "disruptor identified, excluding");
                self.remove_client(index);
            }
            Culprit::Trustee(index) => {
                info!(trustee = index, "disrupting trustee identified, excluding");
                self.remove_trustee(index);
            }
            Culprit::Nobody => {
                warn!(round, "blame round inconclusive");
            }
        }
    }

    async fn arbitrate(
        &mut self,
        ctx: &SetupContext,
        record: &RoundRecord,
        owner_slot: usize,
        bit_pos: u32,
    ) -> Culprit {
        let round = record.round;
        let timeout = self.config.client_read_timeout;
        let n_trustees = self.trustees.len();
        let n_clients = self.clients.len();
        let context = blame_context(round, bit_pos);

        // Collect openings; the owner's slot claim rides along.
        let mut client_secrets: Vec<Option<Vec<RevealedSecret>>> = vec![None; n_clients];
        let mut accuser: Option<usize> = None;
        for index in 0..n_clients {
            loop {
                let message = match self.clients[index].conn.recv_timeout(timeout).await {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(client = index, error = %e, "no blame answer");
                        return Culprit::Client(index);
                    }
                };
                match message {
                    Message::ClientSecrets { secrets, .. } => {
                        client_secrets[index] = Some(secrets);
                        break;
                    }
                    Message::DisruptionBlame {
                        round: r,
                        bit_pos: bp,
                        ephemeral,
                        proof,
                    } if r == round && bp == bit_pos => {
                        let claimed = ctx.final_keys.get(owner_slot) == Some(&ephemeral)
                            && proof.verify(&ephemeral, &ctx.final_base, &context);
                        if claimed {
                            debug!(client = index, "slot claim verified");
                            accuser = Some(index);
                        } else {
                            warn!(client = index, "invalid slot claim");
                            return Culprit::Client(index);
                        }
                    }
                    other => {
                        debug!(client = index, message = other.name(), "skipped in blame");
                    }
                }
            }
        }
        let mut trustee_secrets: Vec<Option<Vec<RevealedSecret>>> = vec![None; n_trustees];
        for index in 0..n_trustees {
            loop {
                let message = match self.trustees[index].conn.recv_timeout(timeout).await {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(trustee = index, error = %e, "no blame answer");
                        return Culprit::Trustee(index);
                    }
                };
                match message {
                    Message::TrusteeSecrets { secrets, .. } => {
                        trustee_secrets[index] = Some(secrets);
                        break;
                    }
                    other => {
                        debug!(trustee = index, message = other.name(), "skipped in blame");
                    }
                }
            }
        }

        // Verify every opening before trusting a single pad bit.
        for (index, secrets) in client_secrets.iter().enumerate() {
            let secrets = secrets.as_ref().expect("collected above");
            if secrets.len() != n_trustees {
                warn!(client = index, "wrong number of openings");
                return Culprit::Client(index);
            }
            for (trustee, opening) in secrets.iter().enumerate() {
                if !opening.proof.verify(
                    &ctx.client_statics[index],
                    &ctx.trustee_statics[trustee],
                    &opening.secret,
                ) {
                    warn!(client = index, trustee, "opening proof failed");
                    return Culprit::Client(index);
                }
            }
        }
        for (index, secrets) in trustee_secrets.iter().enumerate() {
            let secrets = secrets.as_ref().expect("collected above");
            if secrets.len() != n_clients {
                warn!(trustee = index, "wrong number of openings");
                return Culprit::Trustee(index);
            }
            for (client, opening) in secrets.iter().enumerate() {
                if !opening.proof.verify(
                    &ctx.trustee_statics[index],
                    &ctx.client_statics[client],
                    &opening.secret,
                ) {
                    warn!(trustee = index, client, "opening proof failed");
                    return Culprit::Trustee(index);
                }
            }
        }

        let Some(accuser) = accuser else {
            warn!("no verified slot claim, cannot attribute the owner bit");
            return Culprit::Nobody;
        };

        // Open the single disputed bit, party by party. The decoded bit
        // at the disputed position is by definition the corrupted one, so
        // the owner's committed bit is its negation.
        let equivocation = self.config.equivocation_protection;
        let body_len = record.plain.len();
        let plain_bit = !byte_bit(&record.plain, bit_pos);
        let blind_bit = if equivocation && record.equiv_key != 0 {
            byte_bit(
                &pad::blind_stream(record.equiv_key, round, body_len),
                bit_pos,
            )
        } else {
            false
        };
        for index in 0..n_clients {
            let secrets = client_secrets[index].as_ref().expect("collected above");
            let mut expected = false;
            for opening in secrets {
                expected ^= pad_bit(&opening.secret, round, body_len, bit_pos);
            }
            if index == accuser {
                expected ^= plain_bit ^ blind_bit;
            }
            let actual = cell_bit(&record.client_cells[index], bit_pos, equivocation);
            if expected != actual {
                return Culprit::Client(index);
            }
        }
        for index in 0..n_trustees {
            let secrets = trustee_secrets[index].as_ref().expect("collected above");
            let mut expected = false;
            for opening in secrets {
                expected ^= pad_bit(&opening.secret, round, body_len, bit_pos);
            }
            let actual = cell_bit(&record.trustee_cells[index], bit_pos, equivocation);
            if expected != actual {
                return Culprit::Trustee(index);
            }
        }
        Culprit::Nobody
    }
}

/// One pad bit, recomputed from a revealed shared secret.
fn pad_bit(secret: &RistrettoPoint, round: u32, body_len: usize, bit_pos: u32) -> bool {
    byte_bit(&pad::pad_bytes(secret, round, body_len), bit_pos)
}
