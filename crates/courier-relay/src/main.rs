use std::net::SocketAddr;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "courier-relay")]
#[command(about = "Broadcast relay for courier chat clients")]
struct Cli {
    /// Address to listen on, e.g. 0.0.0.0:5000
    #[arg(long, env = "COURIER_RELAY_LISTEN", default_value = "127.0.0.1:5000")]
    listen: SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let listener = TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("bind {}", cli.listen))?;
    tracing::info!(addr = %listener.local_addr()?, "listening");

    courier_relay::serve(listener, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}
