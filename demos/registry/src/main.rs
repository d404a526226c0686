use std::time::Duration;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use rendezvous_mesh::{CleanupPolicy, RegistryConfig, RegistryServer};
use tracing::info;

#[derive(Parser)]
#[clap(name = "rendezvous-registry")]
#[clap(about = "Rendezvous registry for direct TCP peers")]
struct Args {
    /// Address to listen on
    #[clap(long, env = "REGISTRY_BIND", default_value = "0.0.0.0:5000")]
    bind: String,

    /// What to evict when a client connection resets mid-request
    #[clap(long, value_enum, default_value = "source-host")]
    cleanup: Cleanup,

    /// Expire registrations not refreshed within this many seconds
    #[clap(long)]
    ttl_secs: Option<u64>,

    /// Enable verbose logging
    #[clap(short, long)]
    verbose: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum Cleanup {
    SourceHost,
    Exact,
    Disabled,
}

impl From<Cleanup> for CleanupPolicy {
    fn from(c: Cleanup) -> Self {
        match c {
            Cleanup::SourceHost => CleanupPolicy::SourceHost,
            Cleanup::Exact => CleanupPolicy::ExactAddress,
            Cleanup::Disabled => CleanupPolicy::Disabled,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { tracing::Level::DEBUG } else { tracing::Level::INFO })
        .init();

    let mut config = RegistryConfig::default().cleanup(args.cleanup.into());
    if let Some(secs) = args.ttl_secs {
        config = config.entry_ttl(Duration::from_secs(secs));
    }

    let server = RegistryServer::bind(args.bind.as_str(), config).await?;
    info!("Registry running on {}", server.local_addr()?);

    server
        .serve_with_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    info!("Shutting down...");
    Ok(())
}
