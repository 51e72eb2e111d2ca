//! Run both tunnel roles in one process over a simulated BLE link.
//!
//! The device side dials `--target` for every logical connection; the host
//! side accepts TCP clients on `--listen` (or serves one session over
//! stdin/stdout with `--stdio`) and carries them across the simulated link.
//! Useful for exercising the tunnel end to end without radios.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin loopback -- --listen 127.0.0.1:2222 --target localhost:22
//! ssh -p 2222 localhost
//!
//! # As an SSH ProxyCommand
//! ssh -o ProxyCommand="loopback --stdio --target %h:%p" somehost
//! ```

use ble_tunnel::link::loopback::{pair, LoopbackConfig};
use ble_tunnel::{bridge, Device, Host, Stdio, TunnelConfig};
use clap::Parser;
use log::{error, info, warn};
use std::error::Error;
use std::sync::Arc;
use tokio::net::TcpListener;

/// BLE tunnel over an in-process loopback link
#[derive(Parser, Debug)]
#[command(name = "loopback")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Local address accepting tunnel clients
    #[arg(short, long, default_value = "127.0.0.1:2222")]
    listen: String,

    /// Address the device connects to for every tunnelled connection
    #[arg(short, long, default_value = "localhost:22")]
    target: String,

    /// Largest single write the simulated link accepts
    #[arg(long, default_value_t = 185)]
    link_mtu: usize,

    /// Use this MTU instead of probing the link
    #[arg(long)]
    mtu: Option<usize>,

    /// Deliver notifications in order instead of on concurrent threads
    #[arg(long)]
    ordered: bool,

    /// Tunnel a single session over stdin/stdout instead of listening
    #[arg(long)]
    stdio: bool,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let link_config = if cli.ordered {
        LoopbackConfig::inline(cli.link_mtu)
    } else {
        LoopbackConfig::detached(cli.link_mtu)
    };
    let (peripheral, central) = pair(link_config);
    let config = TunnelConfig {
        fixed_mtu: cli.mtu,
        ..Default::default()
    };

    let device = Arc::new(Device::new(Arc::new(peripheral), config)?);
    let server = device.clone();
    let target = cli.target.clone();
    tokio::spawn(async move {
        if let Err(e) = server.serve(&target).await {
            error!("device stopped: {}", e);
        }
    });

    let host = Host::new(Arc::new(central), config).await?;
    info!("link up with MTU {}", host.mtu());

    if cli.stdio {
        let conn = host.open().await?;
        tokio::select! {
            stats = bridge(conn, Stdio::new()) => {
                info!("session done: {} bytes sent, {} bytes received", stats.b_to_a, stats.a_to_b);
            }
            _ = tokio::signal::ctrl_c() => info!("interrupted"),
        }
        return Ok(());
    }

    let listener = TcpListener::bind(&cli.listen).await?;
    info!("accepting tunnel clients on {} (Ctrl+C to exit)", cli.listen);

    // One logical connection per link: clients are served one at a time.
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                return Ok(());
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            warn!("failed to set TCP_NODELAY for {}: {}", peer, e);
        }
        info!("client {} connected", peer);

        let conn = host.open().await?;
        let session = bridge(conn, stream);
        tokio::pin!(session);
        // The device side can end first (target closed or unreachable); the
        // host only learns that when the client goes away.
        let mut device_done = false;
        loop {
            tokio::select! {
                stats = &mut session => {
                    info!(
                        "client {} done: {} bytes to client, {} bytes from client",
                        peer, stats.a_to_b, stats.b_to_a
                    );
                    break;
                }
                _ = device.idle(), if !device_done => {
                    device_done = true;
                    info!(
                        "target side of client {} ended; waiting for the client to disconnect",
                        peer
                    );
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("shutting down");
                    return Ok(());
                }
            }
        }
    }
}
