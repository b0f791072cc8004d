//! End-to-end protocol scenarios: all three roles wired in-process over
//! duplex transports, driven through real setup, rounds, resync, and
//! blame.

use std::time::Duration;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use dcnet::client::{Client, ClientConfig};
use dcnet::config::Config;
use dcnet::crypto::Keypair;
use dcnet::message::Message;
use dcnet::metrics::Metrics;
use dcnet::net::{Connection, INBOX_CAPACITY};
use dcnet::relay::{JoinRequest, Relay};
use dcnet::socks;
use dcnet::trustee::{Trustee, TrusteeConfig};

const TEST_TIMEOUT: Duration = Duration::from_secs(60);

struct Harness {
    relay: JoinHandle<Result<(), dcnet::Error>>,
    metrics: Metrics,
    join_tx: mpsc::Sender<JoinRequest>,
    new_conns: mpsc::Receiver<(u32, mpsc::Receiver<Bytes>)>,
    tasks: Vec<JoinHandle<Result<(), dcnet::Error>>>,
}

impl Harness {
    async fn start(config: Config) -> Self {
        let mut registry = prometheus_client::registry::Registry::default();
        let metrics = Metrics::new(&mut registry);
        let keypair = Keypair::generate(&mut StdRng::seed_from_u64(0xE2E0));
        let mut relay = Relay::new(config, keypair, metrics.clone());

        let (sink, new_conns) = mpsc::channel(16);
        relay.egress().set_connection_sink(sink);

        let (join_tx, join_rx) = mpsc::channel(16);
        let relay = tokio::spawn(relay.run(join_rx));
        Self {
            relay,
            metrics,
            join_tx,
            new_conns,
            tasks: Vec::new(),
        }
    }

    /// Spawns an honest client and registers it with the relay.
    async fn add_client(&mut self, seed: u64, latency_test: bool, data: Vec<Vec<u8>>) {
        let (task, _) = spawn_client(&self.join_tx, seed, latency_test, data, None).await;
        self.tasks.push(task);
    }

    async fn add_trustee(&mut self, seed: u64, id: u32) {
        let mut rng = StdRng::seed_from_u64(seed);
        let keypair = Keypair::generate(&mut rng);
        let (near, far) = tokio::io::duplex(1 << 16);
        let relay_conn = Connection::open(far, INBOX_CAPACITY);
        self.join_tx
            .send(JoinRequest::Trustee {
                conn: relay_conn,
                trustee_id: id,
                public: keypair.public,
                addr: None,
            })
            .await
            .unwrap();
        let trustee = Trustee::new(TrusteeConfig { id, keypair }, rng);
        self.tasks
            .push(tokio::spawn(trustee.run(Connection::open(near, INBOX_CAPACITY))));
    }

    /// Polls a condition on the metrics until it holds.
    async fn wait_for(&self, condition: impl Fn(&Metrics) -> bool) {
        timeout(TEST_TIMEOUT, async {
            loop {
                if condition(&self.metrics) {
                    return;
                }
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn abort(self) {
        self.relay.abort();
        for task in self.tasks {
            task.abort();
        }
    }
}

/// Wires one client to the relay, optionally exposing its downstream
/// sink.
async fn spawn_client(
    join_tx: &mpsc::Sender<JoinRequest>,
    seed: u64,
    latency_test: bool,
    data: Vec<Vec<u8>>,
    data_out: Option<mpsc::Sender<Bytes>>,
) -> (JoinHandle<Result<(), dcnet::Error>>, Keypair) {
    let mut rng = StdRng::seed_from_u64(seed);
    let keypair = Keypair::generate(&mut rng);
    let (near, far) = tokio::io::duplex(1 << 16);
    let relay_conn = Connection::open(far, INBOX_CAPACITY);
    join_tx
        .send(JoinRequest::Client {
            conn: relay_conn,
            public: keypair.public,
            addr: None,
        })
        .await
        .unwrap();

    let mut client = Client::new(
        ClientConfig {
            keypair: keypair.clone(),
            trustee_bundle: None,
            latency_test,
        },
        rng,
    );
    for payload in data {
        client.queue_data(payload);
    }
    if let Some(sink) = data_out {
        client.set_data_out(sink);
    }
    let task = tokio::spawn(client.run(Connection::open(near, INBOX_CAPACITY)));
    (task, keypair)
}

fn small_config(payload: usize, limit: Option<u64>) -> Config {
    Config {
        payload_size: payload,
        reporting_limit: limit,
        client_read_timeout: Duration::from_secs(10),
        ..Config::default()
    }
}

#[tokio::test]
async fn test_upstream_data_reaches_egress() {
    let mut harness = Harness::start(small_config(64, Some(12))).await;
    let payload = socks::encode_upstream(9, b"HELLO_WORLD_AAAA", 64).unwrap();
    harness.add_client(1, false, vec![payload]).await;
    harness.add_client(2, false, vec![]).await;
    harness.add_trustee(3, 0).await;

    let (conn_id, mut rx) = timeout(TEST_TIMEOUT, harness.new_conns.recv())
        .await
        .expect("relay produced no egress connection")
        .expect("sink closed");
    assert_eq!(conn_id, 9);
    let data = timeout(TEST_TIMEOUT, rx.recv())
        .await
        .expect("no upstream data")
        .expect("queue closed");
    assert_eq!(data.as_ref(), b"HELLO_WORLD_AAAA");

    let result = timeout(TEST_TIMEOUT, harness.relay)
        .await
        .expect("relay did not stop")
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_empty_rounds_produce_no_egress() {
    let mut harness = Harness::start(small_config(32, Some(10))).await;
    harness.add_client(11, false, vec![]).await;
    harness.add_client(12, false, vec![]).await;
    harness.add_trustee(13, 0).await;

    harness.wait_for(|metrics| metrics.rounds.get() >= 10).await;
    assert!(harness.new_conns.try_recv().is_err());
}

#[tokio::test]
async fn test_latency_echo_comes_back_downstream() {
    let mut harness = Harness::start(small_config(32, Some(20))).await;

    // Client 0 pings; the observer just watches its downstream.
    harness.add_client(21, true, vec![]).await;
    let (observer_sink, mut observed) = mpsc::channel(64);
    let (task, _) = spawn_client(&harness.join_tx, 22, false, vec![], Some(observer_sink)).await;
    harness.tasks.push(task);
    harness.add_trustee(23, 0).await;

    let found = timeout(TEST_TIMEOUT, async {
        while let Some(data) = observed.recv().await {
            if let Some((client_id, _)) = socks::parse_latency_ping(&data) {
                return client_id;
            }
        }
        panic!("observer stream ended without an echo");
    })
    .await
    .expect("no latency echo observed");
    assert_eq!(found, 0);
}

#[tokio::test]
async fn test_join_triggers_resync() {
    let mut harness = Harness::start(small_config(32, None)).await;
    harness.add_client(31, false, vec![]).await;
    harness.add_client(32, false, vec![]).await;
    harness.add_trustee(33, 0).await;

    harness.wait_for(|metrics| metrics.rounds.get() >= 5).await;
    let before = harness.metrics.rounds.get();

    // A third client arrives mid-run.
    harness.add_client(34, false, vec![]).await;
    harness.wait_for(|metrics| metrics.resyncs.get() >= 1).await;

    // The next setup must complete with three clients and keep rounding.
    harness
        .wait_for(|metrics| metrics.rounds.get() >= before + 5)
        .await;
    harness.abort();
}

#[tokio::test]
async fn test_trustee_disconnect_causes_resync() {
    let mut harness = Harness::start(small_config(32, None)).await;
    harness.add_client(41, false, vec![]).await;
    harness.add_client(42, false, vec![]).await;
    harness.add_trustee(43, 0).await;
    harness.add_trustee(44, 1).await;

    harness.wait_for(|metrics| metrics.rounds.get() >= 5).await;

    // Kill trustee 1: its connection drops and the relay must recover
    // with the surviving trustee.
    let victim = harness.tasks.pop().unwrap();
    victim.abort();

    harness
        .wait_for(|metrics| metrics.peers_expelled.get() >= 1 && metrics.resyncs.get() >= 1)
        .await;
    let before = harness.metrics.rounds.get();
    harness
        .wait_for(|metrics| metrics.rounds.get() >= before + 5)
        .await;
    harness.abort();
}

#[tokio::test]
async fn test_disruptor_is_blamed_and_expelled() {
    let config = Config {
        payload_size: 32,
        disruption_protection: true,
        reporting_limit: None,
        client_read_timeout: Duration::from_secs(10),
        ..Config::default()
    };
    let mut harness = Harness::start(config).await;
    harness.add_client(51, false, vec![]).await;

    // The disruptor: an otherwise honest client whose wire cells we flip
    // once, in the second data round owned by the other slot.
    let mut rng = StdRng::seed_from_u64(52);
    let keypair = Keypair::generate(&mut rng);
    let (near, far) = tokio::io::duplex(1 << 16);
    let relay_conn = Connection::open(far, INBOX_CAPACITY);
    harness
        .join_tx
        .send(JoinRequest::Client {
            conn: relay_conn,
            public: keypair.public,
            addr: None,
        })
        .await
        .unwrap();
    let mut marauder = Client::new(
        ClientConfig {
            keypair,
            trustee_bundle: None,
            latency_test: false,
        },
        rng,
    );
    harness.tasks.push(tokio::spawn(async move {
        let mut conn = Connection::open(near, INBOX_CAPACITY);
        let mut peer_rounds = 0u32;
        let mut flipped = false;
        loop {
            let message = match conn.recv().await {
                Ok(message) => message,
                Err(_) => return Ok(()),
            };
            let flip_now = match &message {
                Message::Downstream(downstream)
                    if downstream.ownership_id >= 0
                        && downstream.ownership_id != marauder.slot() =>
                {
                    peer_rounds += 1;
                    peer_rounds == 2 && !flipped
                }
                _ => false,
            };
            let out = match marauder.process(message) {
                Ok(out) => out,
                Err(_) => return Ok(()),
            };
            for mut message in out {
                if flip_now {
                    if let Message::Upstream { data, .. } = &mut message {
                        let last = data.len() - 1;
                        data[last] ^= 0x01;
                        flipped = true;
                    }
                }
                if conn.sender.send(&message).await.is_err() {
                    return Ok(());
                }
            }
        }
    }));
    harness.add_trustee(53, 0).await;

    harness
        .wait_for(|metrics| metrics.disruptions.get() >= 1 && metrics.peers_expelled.get() >= 1)
        .await;
    harness.abort();
}

#[tokio::test]
async fn test_open_closed_scheduling_delivers_reserved_data() {
    let config = Config {
        payload_size: 32,
        open_closed_scheduling: true,
        reporting_limit: Some(16),
        client_read_timeout: Duration::from_secs(10),
        ..Config::default()
    };
    let mut harness = Harness::start(config).await;
    let first = socks::encode_upstream(5, b"first", 32).unwrap();
    let second = socks::encode_upstream(5, b"second", 32).unwrap();
    harness.add_client(61, false, vec![first, second]).await;
    harness.add_client(62, false, vec![]).await;
    harness.add_trustee(63, 0).await;

    let (conn_id, mut rx) = timeout(TEST_TIMEOUT, harness.new_conns.recv())
        .await
        .expect("no egress connection")
        .expect("sink closed");
    assert_eq!(conn_id, 5);
    let mut received = Vec::new();
    while received.len() < 2 {
        let data = timeout(TEST_TIMEOUT, rx.recv())
            .await
            .expect("missing reserved-slot data")
            .expect("queue closed");
        received.push(data);
    }
    assert_eq!(received[0].as_ref(), b"first");
    assert_eq!(received[1].as_ref(), b"second");
}
