use std::net::SocketAddr;

use anyhow::Result;
use clap::Parser;
use rendezvous_mesh::{NodeConfig, PeerAddress, PeerNode, RegistryClient};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Parser)]
#[clap(name = "rendezvous-chat")]
#[clap(about = "Console chat over direct TCP peer connections")]
struct Args {
    /// Port to listen on for other peers (0 picks one)
    #[clap(long, env = "PEER_PORT", default_value = "0")]
    port: u16,

    /// Registry endpoint as host:port
    #[clap(long, env = "REGISTRY_ADDR", default_value = "127.0.0.1:5000")]
    registry: PeerAddress,

    /// Host to advertise to the registry
    #[clap(long, default_value = "127.0.0.1")]
    advertise_host: String,

    /// Peers to connect to at startup, as host:port
    #[clap(long)]
    connect: Vec<PeerAddress>,

    /// Enable verbose logging
    #[clap(short, long)]
    verbose: bool,
}

const HELP: &str = "\
/peers               list open connections
/discover            connect to every registered peer
/connect host:port   open a connection
/msg host:port text  send to one peer
/quit                leave
anything else is broadcast";

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { tracing::Level::DEBUG } else { tracing::Level::INFO })
        .init();

    let config = NodeConfig::default()
        .listen_addr(SocketAddr::from(([0, 0, 0, 0], args.port)))
        .advertise_host(args.advertise_host);
    let registry = RegistryClient::new(args.registry);
    let (node, mut incoming) = PeerNode::start_with_rendezvous(config, registry).await?;

    info!("Listening on {} as {}", node.local_addr(), node.advertised_addr());

    if !args.connect.is_empty() {
        let report = node.connect_all(args.connect).await;
        for (addr, e) in &report.failed {
            warn!("Failed to connect to {addr}: {e}");
        }
    }

    tokio::spawn(async move {
        while let Some(msg) = incoming.recv().await {
            println!("[{}] {}", msg.from, msg.payload.trim_end());
        }
    });

    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line? {
                Some(line) => line,
                None => break,
            },
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match line.split_once(' ').unwrap_or((line, "")) {
            ("/quit", _) => break,
            ("/peers", _) => {
                for peer in node.connected_peers().await {
                    println!("  {peer}");
                }
            }
            ("/discover", _) => match node.discover().await {
                Ok(report) => println!(
                    "connected {}, skipped {}, failed {}",
                    report.connected.len(),
                    report.skipped.len(),
                    report.failed.len()
                ),
                Err(e) => warn!("Discovery failed: {e}"),
            },
            ("/connect", target) => match target.trim().parse::<PeerAddress>() {
                Ok(addr) => match node.connect(&addr).await {
                    Ok(outcome) => println!("{addr}: {outcome:?}"),
                    Err(e) => warn!("Failed to connect to {addr}: {e}"),
                },
                Err(e) => warn!("{e}"),
            },
            ("/msg", rest) => {
                let Some((target, text)) = rest.split_once(' ') else {
                    println!("usage: /msg host:port text");
                    continue;
                };
                match target.parse::<PeerAddress>() {
                    Ok(addr) => {
                        if let Err(e) = node.unicast(text, &addr).await {
                            warn!("Send failed: {e}");
                        }
                    }
                    Err(e) => warn!("{e}"),
                }
            }
            _ => {
                node.broadcast(line).await;
            }
        }
    }

    info!("Shutting down...");
    node.shutdown().await?;
    Ok(())
}
