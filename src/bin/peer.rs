//! Peer Voice
//!
//! Runs one side of a two-party voice session and exposes the control API.
//!
//! ```text
//! peer owner [PEER_NAME]            wait for the joining device's announce
//! peer client OWNER_IP [OWNER_NAME] announce to the group owner
//!
//! options:
//!   --config PATH   load settings from PATH instead of the default location
//!   --synthetic     use a generated tone instead of the sound card
//! ```

use anyhow::{bail, Context, Result};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use peer_voice::{
    audio::{list_devices, AudioBackend, CpalBackend, SyntheticBackend},
    config::AppConfig,
    protocol::ConnectionDescriptor,
    session::{spawn_observer, PeerSessionManager},
    ui::{BroadcastObserver, WebServer},
};

struct Args {
    descriptor: ConnectionDescriptor,
    config_path: Option<PathBuf>,
    synthetic: bool,
}

fn parse_args() -> Result<Args> {
    let mut positional = Vec::new();
    let mut config_path = None;
    let mut synthetic = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--synthetic" => synthetic = true,
            "--config" => {
                let path = args.next().context("--config needs a path")?;
                config_path = Some(PathBuf::from(path));
            }
            _ => positional.push(arg),
        }
    }

    let descriptor = match positional.first().map(String::as_str) {
        Some("owner") => ConnectionDescriptor::owner(
            positional.get(1).cloned().unwrap_or_else(|| "peer".to_string()),
        ),
        Some("client") => {
            let owner: IpAddr = positional
                .get(1)
                .context("client mode needs the owner's address")?
                .parse()
                .context("invalid owner address")?;
            ConnectionDescriptor::client(
                positional.get(2).cloned().unwrap_or_else(|| owner.to_string()),
                owner,
            )
        }
        _ => bail!("usage: peer (owner [PEER_NAME] | client OWNER_IP [OWNER_NAME]) [--config PATH] [--synthetic]"),
    };

    Ok(Args {
        descriptor,
        config_path,
        synthetic,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = parse_args()?;
    let config = match &args.config_path {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::load_or_default()?,
    };

    tracing::info!("Starting Peer Voice");

    let backend: Arc<dyn AudioBackend> = if args.synthetic {
        tracing::info!("Using synthetic audio");
        Arc::new(SyntheticBackend::new())
    } else {
        println!("\n=== Audio Devices ===");
        for device in list_devices() {
            let direction = match (device.is_input, device.is_output) {
                (true, true) => "Input/Output",
                (true, false) => "Input",
                (false, true) => "Output",
                _ => "Unknown",
            };
            let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
            println!("  {} ({}){}", device.name, direction, default_marker);
        }
        println!();
        Arc::new(CpalBackend::default())
    };

    let (manager, events) = PeerSessionManager::new(config.session.clone(), backend)?;
    let manager = Arc::new(manager);

    let web_server = WebServer::new(config.ui.clone(), manager.clone());
    let _observer = spawn_observer(events, BroadcastObserver::new(web_server.events()))?;
    let _web_handle = web_server.start_background();

    tracing::info!(
        "Control API at http://{}:{}",
        config.ui.bind_address,
        config.ui.http_port
    );

    // Session setup blocks on sockets; keep it off the async workers
    let setup_manager = manager.clone();
    let descriptor = args.descriptor;
    tokio::task::spawn_blocking(move || match setup_manager.select_peer(descriptor) {
        Ok(completion) => match completion.wait() {
            Ok(endpoint) => tracing::info!(
                "Connected to {} at {} as {:?}; POST /api/transmit/start to talk",
                endpoint.display_name,
                endpoint.address,
                endpoint.role
            ),
            Err(e) => tracing::error!("Session setup failed: {}", e),
        },
        Err(e) => tracing::error!("Could not start session: {}", e),
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    tokio::task::spawn_blocking(move || manager.disconnect()).await?;
    Ok(())
}
