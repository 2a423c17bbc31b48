mod config;
mod logging;
mod peer_server;
mod server;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::info;

use chorus_sfu::{build_api, PassthroughFactory, SessionRegistry};

use server::AppState;

#[derive(Parser, Debug)]
#[command(name = "chorus")]
#[command(about = "Chorus SFU signaling server", long_about = None)]
struct Args {
    /// Config file (YAML, TOML or JSON)
    #[arg(short, long, env = "CHORUS_CONFIG_PATH")]
    config: Option<String>,

    /// Listen host, overrides the config file
    #[arg(long)]
    host: Option<String>,

    /// Listen port, overrides the config file
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load and validate configuration
    let mut config = config::load_config(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("Chorus starting...");
    info!(
        address = %config.http_address(),
        max_size = config.sfu.max_size,
        max_duration_secs = config.sfu.max_duration_secs,
        stun_urls = ?config.webrtc.stun_urls,
        "Configuration"
    );

    // 3. WebRTC stack and session registry
    let api = build_api()?;
    let registry = SessionRegistry::new(config.sfu.clone(), Arc::new(PassthroughFactory));

    // 4. Serve signaling until shutdown
    server::serve(AppState {
        config: Arc::new(config),
        registry,
        api: Arc::new(api),
    })
    .await?;

    info!("Chorus stopped");
    Ok(())
}
