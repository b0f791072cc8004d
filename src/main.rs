//! Role launcher for the DC-net relay.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::mpsc;
use tracing::{error, info, Level};

use dcnet::client::{Client, ClientConfig};
use dcnet::config::{self, Config};
use dcnet::crypto::Keypair;
use dcnet::message::Message;
use dcnet::metrics::Metrics;
use dcnet::net::{self, Connection, INBOX_CAPACITY};
use dcnet::relay::{spawn_admission, Relay};
use dcnet::trustee::{Trustee, TrusteeConfig};
use dcnet::Error;

/// Anonymous-communication relay on a dining-cryptographers network.
#[derive(Parser)]
pub struct App {
    #[command(flatten)]
    runtime_args: RuntimeArgs,

    #[command(subcommand)]
    subcommand: Subcommands,
}

#[derive(Args)]
pub struct RuntimeArgs {
    /// The log level for traces. opts: (error, warn, info, debug, trace)
    #[arg(long, default_value_t = Level::INFO)]
    log_level: Level,
}

#[derive(Subcommand)]
pub enum Subcommands {
    /// Start the relay (the star center).
    Relay(RelayArgs),

    /// Start a trustee.
    Trustee(TrusteeArgs),

    /// Start a client.
    Client(ClientArgs),
}

#[derive(Args)]
pub struct RelayArgs {
    /// Listen address, `:port` or `host:port`.
    #[arg(long, default_value = ":7000")]
    port: String,

    /// Expected number of clients before the first setup starts.
    #[arg(long, default_value_t = 2)]
    nclients: usize,

    /// Expected number of trustees before the first setup starts.
    #[arg(long, default_value_t = 1)]
    ntrustees: usize,

    /// DC-net cell size in bytes.
    #[arg(long, default_value_t = 1500)]
    payload: usize,

    /// Duplicate downstream broadcasts over UDP.
    #[arg(long)]
    udp: bool,

    /// Outstanding downstream cells before collection.
    #[arg(long, default_value_t = config::DEFAULT_WINDOW)]
    window: usize,

    /// Enable the disruption-protection echo protocol.
    #[arg(long)]
    disruption: bool,

    /// Enable equivocation protection.
    #[arg(long)]
    equivocation: bool,

    /// Enable open/closed slot scheduling.
    #[arg(long)]
    openclosed: bool,

    /// Stop after this many completed rounds.
    #[arg(long)]
    reporting_limit: Option<u64>,

    /// Directory for the identity checkpoint.
    #[arg(long, default_value = "./state")]
    state_dir: PathBuf,

    /// Pre-agreed trustee public-key bundle (YAML).
    #[arg(long)]
    keys: Option<PathBuf>,
}

#[derive(Args)]
pub struct TrusteeArgs {
    /// Relay address, `host:port`.
    #[arg(long)]
    relay: String,

    /// This trustee's position in the pre-agreed bundle.
    #[arg(long)]
    id: u32,

    /// Identity file (YAML with a hex private key).
    #[arg(long)]
    keys: Option<PathBuf>,
}

#[derive(Args)]
pub struct ClientArgs {
    /// Relay address, `host:port`.
    #[arg(long)]
    relay: String,

    /// Identity file (YAML with a hex private key).
    #[arg(long)]
    keys: Option<PathBuf>,

    /// Pre-agreed trustee public-key bundle (YAML).
    #[arg(long)]
    bundle: Option<PathBuf>,

    /// Send latency pings when the slot would otherwise go unused.
    #[arg(long)]
    latency_test: bool,
}

fn main() -> ExitCode {
    let app = App::parse();
    tracing_subscriber::fmt()
        .with_max_level(app.runtime_args.log_level)
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "cannot build runtime");
            return ExitCode::from(3);
        }
    };

    let result = runtime.block_on(async {
        match app.subcommand {
            Subcommands::Relay(args) => run_relay(args).await,
            Subcommands::Trustee(args) => run_trustee(args).await,
            Subcommands::Client(args) => run_client(args).await,
        }
    });
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "exiting");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

async fn run_relay(args: RelayArgs) -> Result<(), Error> {
    let mut rng = StdRng::from_entropy();
    let keypair = config::load_or_init_relay_identity(&args.state_dir, &mut rng)?;

    let config = Config {
        n_clients: args.nclients,
        n_trustees: args.ntrustees,
        payload_size: args.payload,
        use_udp: args.udp,
        disruption_protection: args.disruption,
        equivocation_protection: args.equivocation,
        open_closed_scheduling: args.openclosed,
        window: args.window,
        reporting_limit: args.reporting_limit,
        ..Config::default()
    };
    config.validate()?;

    let mut registry = prometheus_client::registry::Registry::default();
    let metrics = Metrics::new(&mut registry);
    let mut relay = Relay::new(config, keypair, metrics);
    if let Some(path) = &args.keys {
        relay.set_trustee_bundle(config::load_trustee_bundle(path)?);
    }

    let (conn_tx, mut conn_rx) = mpsc::channel(16);
    let (join_tx, join_rx) = mpsc::channel(16);
    let (addr, _listener) = net::spawn_listener(&args.port, conn_tx).await?;
    info!(%addr, "relay listening");

    let waiting = relay.waiting();
    tokio::spawn(async move {
        while let Some((stream, peer)) = conn_rx.recv().await {
            spawn_admission(stream, peer, join_tx.clone(), waiting.clone());
        }
    });

    tokio::select! {
        result = relay.run(join_rx) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            Ok(())
        }
    }
}

async fn run_trustee(args: TrusteeArgs) -> Result<(), Error> {
    let mut rng = StdRng::from_entropy();
    let keypair = match &args.keys {
        Some(path) => config::load_identity(path)?,
        None => Keypair::generate(&mut rng),
    };

    let stream = net::connect_with_retry(&args.relay, 30, Duration::from_secs(2)).await?;
    let conn = Connection::open(stream, INBOX_CAPACITY);
    info!(relay = %args.relay, id = args.id, "connected to relay");

    // Announce ourselves; the relay classifies the peer by this first
    // message.
    conn.sender
        .send(&Message::TrusteeIdentity {
            trustee_id: args.id,
            key: keypair.public,
        })
        .await?;

    let trustee = Trustee::new(
        TrusteeConfig {
            id: args.id,
            keypair,
        },
        rng,
    );
    tokio::select! {
        result = trustee.run(conn) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            Ok(())
        }
    }
}

async fn run_client(args: ClientArgs) -> Result<(), Error> {
    let mut rng = StdRng::from_entropy();
    let keypair = match &args.keys {
        Some(path) => config::load_identity(path)?,
        None => Keypair::generate(&mut rng),
    };
    let trustee_bundle = match &args.bundle {
        Some(path) => Some(config::load_trustee_bundle(path)?),
        None => None,
    };

    let stream = net::connect_with_retry(&args.relay, 30, Duration::from_secs(2)).await?;
    let conn = Connection::open(stream, INBOX_CAPACITY);
    info!(relay = %args.relay, "connected to relay");

    // Announce ourselves. The ephemeral key slot in the hello is filled
    // with the static key; real ephemerals are minted per setup.
    conn.sender
        .send(&Message::ClientKeys {
            client_id: 0,
            public: keypair.public,
            ephemeral: keypair.public,
        })
        .await?;

    let client = Client::new(
        ClientConfig {
            keypair,
            trustee_bundle,
            latency_test: args.latency_test,
        },
        rng,
    );
    tokio::select! {
        result = client.run(conn) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            Ok(())
        }
    }
}
