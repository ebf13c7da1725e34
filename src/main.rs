use std::net::SocketAddr;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use driftnet::{GLOBAL_SUBNET, Node, Signatory};

/// Content type tag for lines typed on stdin.
const TEXT_CONTENT: u8 = 1;

#[derive(Clone, Debug)]
struct BootstrapPeer {
    addr: SocketAddr,
    signatory: Signatory,
}

impl FromStr for BootstrapPeer {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr_part, sig_part) = s
            .rsplit_once('/')
            .context("bootstrap peer must include a signatory (format: IP:PORT/SIGNATORY)")?;

        let addr: SocketAddr = addr_part.parse().context("invalid socket address")?;
        let signatory = Signatory::from_hex(sig_part).context("signatory must be 64 hex characters")?;
        if !signatory.is_valid() {
            anyhow::bail!("signatory is not a valid Ed25519 public key");
        }

        Ok(BootstrapPeer { addr, signatory })
    }
}

#[derive(Parser, Debug)]
#[command(name = "driftnet")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    /// Address other peers should dial, if different from the bound one.
    #[arg(short, long)]
    advertise: Option<String>,

    #[arg(short = 'B', long = "bootstrap", value_name = "PEER")]
    bootstrap: Vec<BootstrapPeer>,

    #[arg(short, long, default_value = "300")]
    telemetry_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let mut builder = Node::builder();
    if let Some(addr) = &args.advertise {
        builder = builder.with_advertised_addr(addr.clone());
    }
    let node = builder.build(&args.bind.to_string()).await?;
    info!("Node signatory: {}", node.signatory());
    info!("Listening on {}", node.local_addr());

    for peer in &args.bootstrap {
        info!("Bootstrapping from {}/{}", peer.addr, &peer.signatory.to_hex()[..16]);
        node.add_peer(peer.signatory, peer.addr.to_string()).await;
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    let runner = node.clone();
    let running = tokio::spawn(async move { runner.run(stop_rx).await });

    let mut received = node.received().await?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut interval = time::interval(Duration::from_secs(args.telemetry_interval.max(1)));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) if !line.trim().is_empty() => {
                    match node.broadcast(GLOBAL_SUBNET, TEXT_CONTENT, line.into_bytes()).await {
                        Ok(digest) => info!(digest = %hex::encode(&digest[..8]), "broadcast"),
                        Err(e) => warn!(error = %e, "broadcast failed"),
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!(error = %e, "stdin read failed");
                    stdin_open = false;
                }
            },
            Some(content) = received.recv() => {
                let text = String::from_utf8_lossy(&content.data);
                info!(
                    from = %hex::encode(&content.from.as_bytes()[..8]),
                    content_type = content.content_type,
                    digest = %hex::encode(&content.digest[..8]),
                    "received: {}",
                    text
                );
            }
            _ = interval.tick() => {
                let peers = node.peers().await;
                let connected = peers.iter().filter(|p| node.is_connected(&p.signatory)).count();
                info!(
                    peers = peers.len(),
                    connected,
                    rumors = node.num_rumors(),
                    "telemetry snapshot"
                );
            }
        }
    }

    let _ = stop_tx.send(true);
    running.await.context("node task panicked")??;
    Ok(())
}
