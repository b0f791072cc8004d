//! The pipelined round loop.
//!
//! The relay keeps a window `W` of outstanding downstream cells. Each
//! iteration drains the resync signal, pops one downstream payload
//! (priority queue first), broadcasts it, and once the pipeline is full
//! collects the matching upstream cells with a per-peer read deadline,
//! XOR-combines them, and dispatches the anonymous plaintext.

use std::collections::{BTreeMap, HashMap, VecDeque};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{JoinRequest, Relay, RoundKind, SetupContext};
use crate::coder::{RelayDecoder, EQUIVOCATION_TAG_LEN};
use crate::message::{Downstream, Message};
use crate::schedule::Schedule;
use crate::socks;
use crate::Error;

/// Why the main loop ended.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Tear the setup down and run a new one with the current roster.
    Resync,
    /// Orderly shutdown of the whole process.
    Shutdown,
}

/// A retained round, kept for disruption arbitration.
pub(crate) struct RoundRecord {
    pub round: u32,
    pub kind: RoundKind,
    pub client_cells: Vec<Vec<u8>>,
    pub trustee_cells: Vec<Vec<u8>>,
    pub plain: Vec<u8>,
    pub equiv_key: u128,
}

/// A peer that failed during collection.
struct RoundFailure {
    is_client: bool,
    index: usize,
}

/// Per-peer buffers for cells that arrived ahead of their round.
pub(crate) struct Pending {
    clients: Vec<BTreeMap<u32, Vec<u8>>>,
    trustees: Vec<BTreeMap<u32, Vec<u8>>>,
}

impl Relay {
    pub(crate) async fn main_loop(
        &mut self,
        mut ctx: SetupContext,
        joins: &mut mpsc::Receiver<JoinRequest>,
    ) -> Result<Outcome, Error> {
        let n_clients = self.clients.len();
        let n_trustees = self.trustees.len();
        let mut decoder = RelayDecoder::new(
            self.config.payload_size,
            self.config.equivocation_protection,
        );
        let mut pending = Pending {
            clients: vec![BTreeMap::new(); n_clients],
            trustees: vec![BTreeMap::new(); n_trustees],
        };
        let mut schedule = Schedule::all_open(n_clients);
        let mut records: VecDeque<RoundRecord> = VecDeque::new();
        // Last non-echo payload per slot, for echo verification.
        let mut slot_ledger: HashMap<i32, (u32, Vec<u8>)> = HashMap::new();
        let mut pending_blame: Option<(u32, u32)> = None;

        // Clients encode the cell for round r under the downstream
        // history through round r; the snapshot per in-flight round keeps
        // decoding aligned while the pipeline runs ahead.
        let mut history = crate::coder::initial_history();
        let mut history_by_round: HashMap<u32, [u8; 32]> = HashMap::new();
        history_by_round.insert(0, history);

        // Round 0 is outstanding from the moment clients accept the slot
        // assignment; there is no broadcast that elicits it.
        ctx.round_kinds.insert(0, RoundKind::Data { owner: -1 });
        let mut next_round: u32 = 1;
        let mut collect_round: u32 = 0;
        let mut inflight: usize = 1;
        let mut completed: u64 = 0;
        let mut tell_resync = false;
        let mut last_conn_id: u32 = 0;

        loop {
            if !self.config.round_pacing.is_zero() {
                tokio::time::sleep(self.config.round_pacing).await;
            }

            // A join mid-run finishes the current cell and resyncs.
            while let Ok(join) = joins.try_recv() {
                info!("new participant during main loop, resync scheduled");
                let _ = self.admit(join).await;
                tell_resync = true;
            }

            // Pop the next downstream payload and decide the round shape.
            let unit = self.egress.next_downstream();
            last_conn_id = unit.conn_id;
            let open_closed = self.config.open_closed_scheduling
                && schedule.exhausted()
                && !tell_resync;
            let ownership_id = if open_closed {
                -1
            } else {
                if schedule.exhausted() {
                    schedule = Schedule::all_open(n_clients);
                }
                schedule
                    .next_owner()
                    .map(|slot| slot as i32)
                    .unwrap_or(-1)
            };
            let kind = if open_closed {
                RoundKind::Schedule
            } else {
                RoundKind::Data {
                    owner: ownership_id,
                }
            };
            ctx.round_kinds.insert(next_round, kind);

            let downstream = Downstream {
                round: next_round,
                ownership_id,
                flag_resync: tell_resync,
                flag_open_closed: open_closed,
                data: unit.data.to_vec(),
            };
            self.metrics.downstream_cells.inc();
            self.metrics
                .downstream_bytes
                .inc_by(downstream.data.len() as u64);
            self.broadcast_downstream(&Message::Downstream(downstream.clone()))
                .await;
            if tell_resync {
                info!("resync broadcast sent, leaving main loop");
                return Ok(Outcome::Resync);
            }
            if self.clients.len() != n_clients {
                warn!("client lost during broadcast, resyncing");
                return Ok(Outcome::Resync);
            }
            history = crate::coder::chain_history(&history, &downstream.data);
            history_by_round.insert(next_round, history);
            next_round += 1;
            inflight += 1;

            // Keep the pipeline full, except across a schedule round: its
            // bitmap decides the ownership of everything that follows.
            if inflight < self.config.window && !open_closed {
                continue;
            }
            let target = if open_closed { next_round } else { collect_round + 1 };
            while collect_round < target {
                let round_history = history_by_round
                    .remove(&collect_round)
                    .unwrap_or_else(crate::coder::initial_history);
                let round_kind = ctx
                    .round_kinds
                    .remove(&collect_round)
                    .unwrap_or(RoundKind::Data { owner: -1 });
                let record = match self
                    .collect_round(
                        &mut decoder,
                        &mut pending,
                        &mut pending_blame,
                        collect_round,
                        round_history,
                        round_kind,
                    )
                    .await
                {
                    Ok(record) => record,
                    Err(failure) => {
                        warn!(
                            round = collect_round,
                            client = failure.is_client,
                            peer = failure.index,
                            "cell invalid, peer failed; warning the clients"
                        );
                        self.broadcast_downstream(&Message::LastUploadFailed {
                            conn_id: last_conn_id,
                        })
                        .await;
                        if failure.is_client {
                            self.remove_client(failure.index);
                        } else {
                            self.remove_trustee(failure.index);
                        }
                        return Ok(Outcome::Resync);
                    }
                };
                inflight -= 1;
                collect_round += 1;
                completed += 1;
                self.metrics.rounds.inc();

                // Let trustees stream further ahead.
                for index in 0..self.trustees.len() {
                    let _ = self.trustees[index]
                        .conn
                        .sender
                        .send(&Message::RateChange {
                            round: collect_round,
                        })
                        .await;
                }

                match record.kind {
                    RoundKind::Schedule => {
                        schedule = Schedule::from_combined(&record.plain, n_clients);
                        debug!(open = ?schedule.open_slots(), "new schedule");
                    }
                    RoundKind::Data { owner } => {
                        if let Some((round, bit_pos)) =
                            self.process_data_round(&record, owner, &mut slot_ledger)
                        {
                            pending_blame = Some((round, bit_pos));
                        }
                    }
                }
                records.push_back(record);
                while records.len() > 2 * n_clients + self.config.window + 2 {
                    records.pop_front();
                }
            }

            if let Some((round, bit_pos)) = pending_blame.take() {
                self.metrics.disruptions.inc();
                self.run_blame(&ctx, round, bit_pos, &records).await;
                return Ok(Outcome::Resync);
            }

            if let Some(limit) = self.config.reporting_limit {
                if completed >= limit {
                    info!(completed, "reporting limit matched; exiting the relay");
                    return Ok(Outcome::Shutdown);
                }
            }
        }
    }

    /// Collects and decodes every cell for one round.
    async fn collect_round(
        &mut self,
        decoder: &mut RelayDecoder,
        pending: &mut Pending,
        pending_blame: &mut Option<(u32, u32)>,
        round: u32,
        history: [u8; 32],
        kind: RoundKind,
    ) -> Result<RoundRecord, RoundFailure> {
        decoder.start(round, history);
        let timeout = self.config.client_read_timeout;
        let mut trustee_cells = Vec::with_capacity(self.trustees.len());
        for index in 0..self.trustees.len() {
            let cell = if let Some(cell) = pending.trustees[index].remove(&round) {
                cell
            } else {
                loop {
                    let message = self.trustees[index]
                        .conn
                        .recv_timeout(timeout)
                        .await
                        .map_err(|e| {
                            warn!(trustee = index, error = %e, "trustee read failed");
                            RoundFailure {
                                is_client: false,
                                index,
                            }
                        })?;
                    match message {
                        Message::TrusteeCipher {
                            round: r, data, ..
                        } => {
                            if r == round {
                                break data;
                            } else if r > round {
                                pending.trustees[index].insert(r, data);
                            } else {
                                debug!(trustee = index, round = r, "stale cipher discarded");
                            }
                        }
                        other => {
                            debug!(
                                trustee = index,
                                message = other.name(),
                                "unexpected message during collection"
                            );
                        }
                    }
                }
            };
            decoder.decode_trustee(&cell).map_err(|e| {
                warn!(trustee = index, error = %e, "trustee cell rejected");
                RoundFailure {
                    is_client: false,
                    index,
                }
            })?;
            trustee_cells.push(cell);
        }

        let mut client_cells = Vec::with_capacity(self.clients.len());
        for index in 0..self.clients.len() {
            let cell = if let Some(cell) = pending.clients[index].remove(&round) {
                cell
            } else {
                loop {
                    let message = self.clients[index]
                        .conn
                        .recv_timeout(timeout)
                        .await
                        .map_err(|e| {
                            warn!(client = index, error = %e, "client read failed");
                            RoundFailure {
                                is_client: true,
                                index,
                            }
                        })?;
                    match message {
                        Message::Upstream { round: r, data, .. }
                        | Message::OpenClosedContribution { round: r, data, .. } => {
                            if r == round {
                                break data;
                            } else if r > round {
                                pending.clients[index].insert(r, data);
                            } else {
                                debug!(client = index, round = r, "stale cell discarded");
                            }
                        }
                        Message::DisruptionBlame {
                            round: disputed,
                            bit_pos,
                            ..
                        } => {
                            // A client-side accusation; arbitrated after
                            // the current cell completes.
                            info!(client = index, disputed, bit_pos, "blame received");
                            pending_blame.get_or_insert((disputed, bit_pos));
                        }
                        other => {
                            debug!(
                                client = index,
                                message = other.name(),
                                "unexpected message during collection"
                            );
                        }
                    }
                }
            };
            decoder.decode_client(&cell).map_err(|e| {
                warn!(client = index, error = %e, "client cell rejected");
                RoundFailure {
                    is_client: true,
                    index,
                }
            })?;
            client_cells.push(cell);
        }

        let plain = decoder.finish().map_err(|_| RoundFailure {
            is_client: true,
            index: 0,
        })?;
        self.metrics.upstream_cells.inc();
        self.metrics.upstream_bytes.inc_by(plain.len() as u64);
        Ok(RoundRecord {
            round,
            kind,
            client_cells,
            trustee_cells,
            plain,
            equiv_key: decoder.last_key,
        })
    }

    /// Handles one decoded data round: echo verification, then upstream
    /// dispatch. Returns a disputed `(round, bit_pos)` on an echo
    /// mismatch.
    fn process_data_round(
        &mut self,
        record: &RoundRecord,
        owner: i32,
        slot_ledger: &mut HashMap<i32, (u32, Vec<u8>)>,
    ) -> Option<(u32, u32)> {
        let payload: &[u8] = if self.config.disruption_protection {
            let (echo, payload) = match record.plain.split_first() {
                Some((b, rest)) => (*b == 1, rest),
                None => (false, &record.plain[..]),
            };
            if owner >= 0 {
                if echo {
                    match slot_ledger.get(&owner) {
                        Some((ledger_round, last)) => {
                            if last != payload {
                                warn!(
                                    slot = owner,
                                    round = record.round,
                                    "echoed cell differs from the committed one"
                                );
                                let bit_pos = first_divergent_bit(last, payload);
                                return Some((*ledger_round, bit_pos));
                            }
                            debug!(slot = owner, round = record.round, "echo verified");
                        }
                        None => {
                            // First echo after setup; nothing to compare
                            // against yet.
                            slot_ledger.insert(owner, (record.round, payload.to_vec()));
                        }
                    }
                } else {
                    slot_ledger.insert(owner, (record.round, payload.to_vec()));
                }
                // The echo flag is protocol overhead; what follows is the
                // anonymous payload.
            }
            payload
        } else {
            &record.plain
        };

        self.egress.dispatch(socks::classify_upstream(payload));
        None
    }
}

/// First differing bit between two equal-purpose payloads, indexed over
/// the full decoded plaintext (the echo byte occupies bits 0..8).
fn first_divergent_bit(a: &[u8], b: &[u8]) -> u32 {
    for (index, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        let diff = x ^ y;
        if diff != 0 {
            return 8 + (index as u32) * 8 + diff.leading_zeros();
        }
    }
    8 + (a.len().min(b.len()) as u32) * 8
}

/// Reads one bit at `bit_pos` of a decoded plaintext from a raw cell,
/// skipping the equivocation tag when present.
pub(crate) fn cell_bit(cell: &[u8], bit_pos: u32, equivocation: bool) -> bool {
    let offset = if equivocation { EQUIVOCATION_TAG_LEN } else { 0 };
    byte_bit(&cell[offset..], bit_pos)
}

/// Reads one bit at `bit_pos` (big-endian bit order) of a byte slice.
pub(crate) fn byte_bit(bytes: &[u8], bit_pos: u32) -> bool {
    let byte = (bit_pos / 8) as usize;
    if byte >= bytes.len() {
        return false;
    }
    bytes[byte] & (0x80 >> (bit_pos % 8)) != 0
}
