//! castlink host entry point.
//!
//! ```text
//! castlink-host                  Run in the foreground
//! castlink-host --config <path>  Load a custom config TOML
//! castlink-host --gen-config     Write default config to stdout
//! castlink-host --no-rendezvous  Skip STUN and the pairing code
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use castlink_host::config::HostConfig;
use castlink_host::injector::LoggingInjector;
use castlink_host::service::HostService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "castlink-host", about = "castlink streaming host")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "castlink-host.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    /// Override the target frame rate.
    #[arg(long)]
    fps: Option<u32>,

    /// Override the mapping profile TOML.
    #[arg(long)]
    profile: Option<PathBuf>,

    /// Disable pairing-code rendezvous.
    #[arg(long)]
    no_rendezvous: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&HostConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    // Load config, then apply CLI overrides.
    let mut config = HostConfig::load(&cli.config);
    if let Some(fps) = cli.fps {
        config.stream.fps = fps;
    }
    if let Some(profile) = cli.profile {
        config.input.profile = profile.display().to_string();
    }
    if cli.no_rendezvous {
        config.rendezvous.enabled = false;
    }

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("castlink-host v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "stream: {}x{} @ {} fps ({})",
        config.stream.width, config.stream.height, config.stream.fps, config.stream.codec
    );

    let injector = Arc::new(LoggingInjector::new());
    let service = HostService::bind(config, injector.clone()).await?;
    let stop = service.stop_handle();

    // Ctrl-C handler.
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop.cancel();
    });

    service.run().await?;

    let counts = injector.counts();
    info!(
        gamepad = counts.gamepad,
        mouse = counts.mouse,
        keys = counts.keys,
        special = counts.special,
        "input totals"
    );
    Ok(())
}
