//! castlink client entry point.
//!
//! ```text
//! castlink-client                    Discover a host on the LAN and connect
//! castlink-client --code K7M2PQ      Pair by code
//! castlink-client --share <payload>  Pair from a scanned share payload
//! castlink-client --host 10.0.0.7    Connect directly
//! castlink-client --list             Print discovered hosts and exit
//! castlink-client --gen-config       Dump default config and exit
//! ```
//!
//! With `--stdin-input`, each line on stdin is one input message
//! (`{"Type":"keyboard","Key":65,"Down":true}`) forwarded to the host.

use std::path::PathBuf;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use castlink_client::config::{ClientConfig, Transport};
use castlink_client::connection::{ClientStats, Connection};
use castlink_client::resolve::{discover, resolve};
use castlink_core::ClientMessage;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "castlink-client", about = "castlink thin client")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "castlink-client.toml")]
    config: PathBuf,

    /// Host address (overrides config). Example: 192.168.1.20
    #[arg(long)]
    host: Option<String>,

    /// Pairing code shown by the host.
    #[arg(long)]
    code: Option<String>,

    /// Share payload (QR content) from the host.
    #[arg(long)]
    share: Option<String>,

    /// Receive over the reliable stream transport instead of datagrams.
    #[arg(long)]
    stream: bool,

    /// Forward input messages read line by line from stdin.
    #[arg(long)]
    stdin_input: bool,

    /// Print hosts found by LAN discovery and exit.
    #[arg(long)]
    list: bool,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        let text = toml::to_string_pretty(&ClientConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let mut config = ClientConfig::load(&cli.config);
    if let Some(host) = cli.host {
        config.network.host = host;
    }
    if let Some(code) = cli.code {
        config.pairing.code = code;
    }
    if let Some(share) = cli.share {
        config.pairing.share = share;
    }
    if cli.stream {
        config.network.transport = Transport::Stream;
    }

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("castlink-client v{}", env!("CARGO_PKG_VERSION"));

    if cli.list {
        for host in discover(&config).await? {
            println!(
                "{}\t{}\t{}",
                host.addr,
                host.descriptor.hostname,
                host.descriptor.capabilities.join(",")
            );
        }
        return Ok(());
    }

    // ── 1. Find the host ────────────────────────────────────────

    let endpoints = resolve(&config).await?;
    info!(route = ?endpoints.route, stream = %endpoints.stream, datagram = %endpoints.datagram, "host resolved");

    // ── 2. Connect and read the handshake ───────────────────────

    let (connection, stream_info) =
        Connection::open(&endpoints, config.network.transport, config.timeout()).await?;
    info!(
        "receiving {}x{} @ {} fps ({})",
        stream_info.width, stream_info.height, stream_info.fps, stream_info.codec
    );

    // ── 3. Input and shutdown ───────────────────────────────────

    let cancel = CancellationToken::new();
    let (input_tx, input_rx) = mpsc::channel(64);
    if cli.stdin_input {
        tokio::spawn(forward_stdin(input_tx));
    } else {
        drop(input_tx);
    }

    let stop = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, disconnecting");
        stop.cancel();
    });

    // ── 4. Receive until stopped ────────────────────────────────

    let (stats_tx, _stats_rx) = watch::channel(ClientStats::default());
    let totals = connection.run(&config, input_rx, stats_tx, cancel).await?;
    println!("{}", serde_json::to_string(&totals)?);
    Ok(())
}

/// Parse stdin lines as input messages; malformed lines are skipped.
async fn forward_stdin(tx: mpsc::Sender<ClientMessage>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("stdin read failed: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match ClientMessage::parse(line.as_bytes()) {
            Ok(message) => {
                if tx.send(message).await.is_err() {
                    break;
                }
            }
            Err(e) => warn!("skipping input line: {e}"),
        }
    }
}
