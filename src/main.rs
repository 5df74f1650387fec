//! destore node binary
//!
//! Wires the object store, the TCP transport and the server together and
//! runs until SIGINT or SIGTERM.

use anyhow::{Context, Result};
use clap::Parser;
use destore::network::{codec::BinaryCodec, nop_handshake};
use destore::storage::{ShardedPathResolver, StoreConfig};
use destore::{Config, ObjectStore, Server, ServerOpts, TcpTransport, TcpTransportConfig};
use env_logger::Env;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[derive(Parser, Debug)]
#[command(name = "destore")]
#[command(about = "Peer-to-peer content-addressable file store node", long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overrides the config file (e.g., 0.0.0.0:4000)
    #[arg(short, long)]
    listen: Option<String>,

    /// Store root directory, overrides the config file
    #[arg(short, long)]
    root: Option<PathBuf>,
}

fn install_signal_handlers() -> Result<()> {
    // with the termination feature this also catches SIGTERM
    ctrlc::set_handler(|| SHUTDOWN.store(true, Ordering::SeqCst))
        .context("failed to install signal handler")
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => Config::default(),
    };

    if let Some(listen) = &args.listen {
        config.server.listen_addr = listen.clone();
    }
    if let Some(root) = &args.root {
        config.store.root = root.clone();
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn build_server(config: &Config) -> Result<Server> {
    let resolver = ShardedPathResolver::new(
        config.store.path_strategy.into(),
        config.store.segment_len,
    );
    let store = ObjectStore::new(StoreConfig {
        root: config.store.root.clone(),
        resolver: Some(Arc::new(resolver)),
    });

    let codec = Arc::new(BinaryCodec::new(config.transport.max_message_size));
    let mut transport_config = TcpTransportConfig::new(config.server.listen_addr.clone());
    transport_config.handshake = Some(Arc::new(nop_handshake));
    transport_config.encoder = codec.clone();
    transport_config.decoder = codec;
    transport_config.queue_capacity = config.transport.queue_capacity;
    transport_config.stream_timeout = Duration::from_secs(config.transport.stream_timeout_secs);

    let server = Server::new(ServerOpts {
        listen_addr: config.server.listen_addr.clone(),
        transport: Some(Arc::new(TcpTransport::new(transport_config))),
        store: Some(Arc::new(store)),
        bootstrap_nodes: config.server.bootstrap_nodes.clone(),
        ..ServerOpts::default()
    })?;
    Ok(server)
}

fn run(args: Args) -> Result<()> {
    let config = load_config(&args)?;

    env_logger::Builder::from_env(Env::default().default_filter_or(config.server.log_level.as_str()))
        .init();

    log::info!("Starting destore node");
    log::info!("  Listen address: {}", config.server.listen_addr);
    log::info!("  Store root: {}", config.store.root.display());
    log::info!("  Path strategy: {:?}", config.store.path_strategy);

    let server = build_server(&config).context("failed to create server")?;
    install_signal_handlers()?;

    server.start(&SHUTDOWN).context("server exited with error")?;
    log::info!("Shutting down");
    Ok(())
}

fn main() {
    let args = Args::parse();

    if let Err(e) = run(args) {
        // the logger may not be up yet if the config failed to load
        eprintln!("destore: {:#}", e);
        process::exit(1);
    }
}
