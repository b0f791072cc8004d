//! The relay role: the star center of the network.
//!
//! One control task owns all relay state (the roster, the decoder, the
//! egress queues) and cycles `SETUP -> MAIN_LOOP -> RESYNC -> SETUP`.
//! Reader tasks (one per connection) feed typed messages into per-peer
//! queues; an admission task turns raw sockets into join requests. All
//! coordination is message passing over channels held as fields, never
//! global state.

mod blame;
mod round;
mod setup;

pub use round::Outcome;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use curve25519_dalek_ng::ristretto::RistrettoPoint;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};

use crate::config::Config;
use crate::crypto::Keypair;
use crate::message::Message;
use crate::metrics::Metrics;
use crate::net::{self, udp, Connection, INBOX_CAPACITY};
use crate::socks::Egress;
use crate::state::RelayPhase;
use crate::Error;

/// How long an unidentified socket may sit in admission before being
/// dropped.
const ADMISSION_TIMEOUT: Duration = Duration::from_secs(10);

/// An admitted participant waiting for, or part of, the active roster.
pub struct Peer {
    pub conn: Connection,
    pub public: RistrettoPoint,
    pub addr: Option<SocketAddr>,
    /// Ephemeral key collected during the current setup (clients only).
    pub ephemeral: Option<RistrettoPoint>,
}

/// A participant announcing itself.
pub enum JoinRequest {
    Client {
        conn: Connection,
        public: RistrettoPoint,
        addr: Option<SocketAddr>,
    },
    Trustee {
        conn: Connection,
        trustee_id: u32,
        public: RistrettoPoint,
        addr: Option<SocketAddr>,
    },
}

/// Counters shared with the accept path: how many peers of each kind are
/// waiting. Guarded by one `RwLock`; mutation takes `write`, lookup takes
/// `read`.
#[derive(Default)]
pub struct WaitingSet {
    pub clients: usize,
    pub trustees: usize,
}

pub struct Relay {
    pub(crate) config: Config,
    pub(crate) keypair: Keypair,
    pub(crate) trustee_bundle: Option<Vec<RistrettoPoint>>,
    pub(crate) metrics: Metrics,
    pub(crate) phase: RelayPhase,

    pub(crate) clients: Vec<Peer>,
    pub(crate) trustees: Vec<Peer>,
    pub(crate) waiting: Arc<RwLock<WaitingSet>>,

    pub(crate) egress: Egress,
    pub(crate) udp: Option<udp::Broadcaster>,

    /// Roster size the first setup waits for; resyncs run with whoever
    /// remains.
    initial_clients: usize,
    started_once: bool,
}

impl Relay {
    pub fn new(config: Config, keypair: Keypair, metrics: Metrics) -> Self {
        let initial_clients = config.n_clients.max(2);
        Self {
            config,
            keypair,
            trustee_bundle: None,
            metrics,
            phase: RelayPhase::Init,
            clients: Vec::new(),
            trustees: Vec::new(),
            waiting: Arc::new(RwLock::new(WaitingSet::default())),
            egress: Egress::new(),
            udp: None,
            initial_clients,
            started_once: false,
        }
    }

    /// Pins the pre-agreed trustee keys; announced trustee identities must
    /// then match.
    pub fn set_trustee_bundle(&mut self, bundle: Vec<RistrettoPoint>) {
        self.trustee_bundle = Some(bundle);
    }

    /// The egress dispatcher (for wiring SOCKS collaborators).
    pub fn egress(&mut self) -> &mut Egress {
        &mut self.egress
    }

    /// The shared waiting-set handle for the accept path.
    pub fn waiting(&self) -> Arc<RwLock<WaitingSet>> {
        self.waiting.clone()
    }

    fn transition(&mut self, phase: RelayPhase) {
        info!(from = self.phase.name(), to = phase.name(), "relay phase");
        self.phase = phase;
    }

    /// Accepts one join request into the roster.
    async fn admit(&mut self, join: JoinRequest) -> Result<(), Error> {
        {
            let mut waiting = self.waiting.write().await;
            match &join {
                JoinRequest::Client { .. } => waiting.clients = waiting.clients.saturating_sub(1),
                JoinRequest::Trustee { .. } => {
                    waiting.trustees = waiting.trustees.saturating_sub(1)
                }
            }
        }
        match join {
            JoinRequest::Client { conn, public, addr } => {
                info!(clients = self.clients.len() + 1, "client admitted");
                self.clients.push(Peer {
                    conn,
                    public,
                    addr,
                    ephemeral: None,
                });
            }
            JoinRequest::Trustee {
                conn,
                trustee_id,
                public,
                addr,
            } => {
                if let Some(bundle) = &self.trustee_bundle {
                    let expected = bundle.get(trustee_id as usize);
                    if expected != Some(&public) {
                        warn!(trustee_id, "trustee key does not match the bundle, rejected");
                        return Err(Error::Verification(
                            "trustee key does not match the pre-agreed bundle".into(),
                        ));
                    }
                }
                info!(trustee_id, "trustee admitted");
                self.trustees.push(Peer {
                    conn,
                    public,
                    addr,
                    ephemeral: None,
                });
                // Keep the chain order deterministic across joins.
                self.trustees
                    .sort_by_key(|peer| peer.public.compress().to_bytes());
            }
        }
        Ok(())
    }

    fn have_quorum(&self) -> bool {
        let needed = if self.started_once {
            2
        } else {
            self.initial_clients
        };
        self.clients.len() >= needed && !self.trustees.is_empty()
    }

    /// The relay control loop: admit peers, run setups, resync forever.
    pub async fn run(mut self, mut joins: mpsc::Receiver<JoinRequest>) -> Result<(), Error> {
        info!(
            identity = crate::crypto::hex(self.keypair.public.compress().as_bytes()),
            "relay started"
        );
        if self.config.use_udp {
            self.udp = Some(udp::Broadcaster::bind().await?);
        }
        loop {
            // Absorb every waiting join before (re)starting.
            while let Ok(join) = joins.try_recv() {
                let _ = self.admit(join).await;
            }
            if !self.have_quorum() {
                self.transition(RelayPhase::Init);
                info!(
                    clients = self.clients.len(),
                    trustees = self.trustees.len(),
                    "waiting for participants"
                );
                match joins.recv().await {
                    Some(join) => {
                        let _ = self.admit(join).await;
                        continue;
                    }
                    None => return Ok(()),
                }
            }

            self.transition(RelayPhase::Setup);
            self.started_once = true;
            let context = match self.setup().await {
                Ok(context) => context,
                Err(e) => {
                    warn!(error = %e, "setup failed, resyncing");
                    self.metrics.resyncs.inc();
                    self.transition(RelayPhase::Resync);
                    continue;
                }
            };

            self.transition(RelayPhase::MainLoop);
            match self.main_loop(context, &mut joins).await {
                Ok(Outcome::Resync) => {
                    self.metrics.resyncs.inc();
                    self.transition(RelayPhase::Resync);
                }
                Ok(Outcome::Shutdown) => {
                    self.transition(RelayPhase::Shutdown);
                    self.broadcast_all(&Message::Shutdown).await;
                    return Ok(());
                }
                Err(e) => {
                    warn!(error = %e, "main loop failed, resyncing");
                    self.metrics.resyncs.inc();
                    self.transition(RelayPhase::Resync);
                }
            }
        }
    }

    /// Broadcasts to every connected participant, dropping any peer whose
    /// write fails.
    pub(crate) async fn broadcast_all(&mut self, message: &Message) {
        let failed = {
            let senders: Vec<_> = self
                .clients
                .iter()
                .chain(self.trustees.iter())
                .map(|peer| peer.conn.sender.clone())
                .collect();
            net::broadcast(&senders, message).await
        };
        if !failed.is_empty() {
            let n_clients = self.clients.len();
            for index in failed.into_iter().rev() {
                if index < n_clients {
                    self.remove_client(index);
                } else {
                    self.remove_trustee(index - n_clients);
                }
            }
        }
    }

    /// Broadcasts a downstream cell to all clients (TCP, plus UDP when
    /// enabled).
    pub(crate) async fn broadcast_downstream(&mut self, message: &Message) {
        if let (Some(udp), Message::Downstream(downstream)) = (&self.udp, message) {
            udp.send(downstream).await;
        }
        let failed = {
            let senders: Vec<_> = self
                .clients
                .iter()
                .map(|peer| peer.conn.sender.clone())
                .collect();
            net::broadcast(&senders, message).await
        };
        for index in failed.into_iter().rev() {
            self.remove_client(index);
        }
    }

    pub(crate) fn remove_client(&mut self, index: usize) {
        if index < self.clients.len() {
            warn!(client = index, "client removed from roster");
            self.metrics.peers_expelled.inc();
            self.clients.remove(index);
        }
    }

    pub(crate) fn remove_trustee(&mut self, index: usize) {
        if index < self.trustees.len() {
            warn!(trustee = index, "trustee removed from roster");
            self.metrics.peers_expelled.inc();
            self.trustees.remove(index);
        }
    }

    /// Refreshes the UDP fan-out targets from client addresses.
    pub(crate) fn refresh_udp_targets(&mut self) {
        if let Some(udp) = self.udp.as_mut() {
            let targets: Vec<SocketAddr> =
                self.clients.iter().filter_map(|peer| peer.addr).collect();
            udp.set_targets(targets);
        }
    }
}

/// Reads the first message off a fresh socket and classifies the peer.
///
/// Spawned per pending connection so a silent socket cannot stall the
/// control task.
pub fn spawn_admission(
    stream: TcpStream,
    addr: SocketAddr,
    joins: mpsc::Sender<JoinRequest>,
    waiting: Arc<RwLock<WaitingSet>>,
) {
    tokio::spawn(async move {
        let mut conn = Connection::open(stream, INBOX_CAPACITY);
        let hello = match conn.recv_timeout(ADMISSION_TIMEOUT).await {
            Ok(message) => message,
            Err(e) => {
                warn!(%addr, error = %e, "admission read failed");
                return;
            }
        };
        let join = match hello {
            Message::ClientKeys { public, .. } => {
                waiting.write().await.clients += 1;
                JoinRequest::Client {
                    conn,
                    public,
                    addr: Some(addr),
                }
            }
            Message::TrusteeIdentity { trustee_id, key } => {
                waiting.write().await.trustees += 1;
                JoinRequest::Trustee {
                    conn,
                    trustee_id,
                    public: key,
                    addr: Some(addr),
                }
            }
            other => {
                warn!(%addr, message = other.name(), "unexpected hello, dropping peer");
                return;
            }
        };
        let _ = joins.send(join).await;
    });
}

/// Bookkeeping the main loop threads through one setup.
pub(crate) struct SetupContext {
    /// Final shuffle base.
    pub final_base: RistrettoPoint,
    /// Final shuffled ephemeral keys (slot order).
    pub final_keys: Vec<RistrettoPoint>,
    /// Client static keys, roster order.
    pub client_statics: Vec<RistrettoPoint>,
    /// Trustee static keys, chain order.
    pub trustee_statics: Vec<RistrettoPoint>,
    /// What each in-flight round is, keyed by round number.
    pub round_kinds: HashMap<u32, RoundKind>,
}

/// What a given round number was broadcast as.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum RoundKind {
    Data { owner: i32 },
    Schedule,
}
