//! Chunk server binary: serves a durable chunk store over the transport.
//!
//! Usage: cargo run --release --bin chunk_server -- [OPTIONS]
//!
//! Options:
//!   --config <PATH>   Streaming config JSON (default: built-in defaults)
//!   --db <PATH>       Database directory (overrides config)
//!   --addr <ADDR>     Listen address host:port (overrides config)
//!
//! Press Enter (or close stdin) to stop.

use std::path::PathBuf;
use std::sync::Arc;

use brickstream::core::{StreamingConfig, logging};
use brickstream::core::types::Result;
use brickstream::store::{ServerStore, StoreService};
use brickstream_net::{RequestHandler, TransportServer};

fn main() {
    logging::init();

    if let Err(e) = run() {
        log::error!("Chunk server failed: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    let mut config = match parse_str_arg(&args, "--config") {
        Some(path) => StreamingConfig::load_sync(&PathBuf::from(path))?,
        None => StreamingConfig::default(),
    };
    if let Some(db) = parse_str_arg(&args, "--db") {
        config.store.path = PathBuf::from(db);
    }
    if let Some(addr) = parse_str_arg(&args, "--addr") {
        config.server.addr = addr;
    }

    let store = Arc::new(ServerStore::open(&config.store)?);
    let handler: Arc<tokio::sync::Mutex<dyn RequestHandler>> =
        Arc::new(tokio::sync::Mutex::new(StoreService::new(store.clone())));
    let mut server = TransportServer::start(config.server.clone(), handler)?;

    log::info!(
        "Serving {} ({} chunks) on {}",
        config.store.path.display(),
        store.len(),
        server.local_addr()
    );

    // Block until Enter or EOF
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;

    log::info!("Shutting down");
    server.shutdown();
    store.flush()?;
    Ok(())
}

fn parse_str_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}
