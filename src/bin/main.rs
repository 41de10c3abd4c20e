//! dock-dns binary entry point.

use clap::Parser;
use dock_dns::{telemetry, Config, DnsServer, DockerClient};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Authoritative DNS server for the containers of a Docker host.
#[derive(Parser, Debug)]
#[command(name = "dock-dns")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML). Missing files are ignored.
    #[arg(short, long, default_value = "dock-dns.toml")]
    config: PathBuf,

    /// Address to bind the DNS socket to. The configured port is kept.
    #[arg(short, long)]
    bind: Option<IpAddr>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config: Config = config::Config::builder()
        .add_source(config::File::from(args.config.clone()).required(false))
        .add_source(
            config::Environment::with_prefix("DOCK_DNS")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()?;

    if let Some(ip) = args.bind {
        config.dns.listen_addr = SocketAddr::new(ip, config.dns.listen_addr.port());
    }

    telemetry::init(&config.telemetry).map_err(|e| e as Box<dyn std::error::Error>)?;

    info!(
        config_file = %args.config.display(),
        listen_addr = %config.dns.listen_addr,
        domain = %config.dns.domain,
        "starting dock-dns"
    );

    let docker = DockerClient::new(&config.docker)?;
    info!(endpoint = %docker.endpoint(), "using Docker Engine API");

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("interrupt received, stopping");
                    shutdown.cancel();
                }
                Err(e) => error!(error = %e, "failed to listen for interrupt"),
            }
        }
    });

    let server = DnsServer::new(config, Arc::new(docker));
    let result = server.run(shutdown).await;

    telemetry::shutdown();

    if let Err(e) = result {
        error!(error = %e, "DNS server error");
        return Err(e.into());
    }

    info!("dock-dns shutdown complete");
    Ok(())
}
