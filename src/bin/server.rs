use anyhow::Result;
use clap::Parser;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use relay::config::{DEFAULT_HOST, DEFAULT_PORT};
use relay::{Server, ServerConfig};

#[derive(Parser)]
#[command(name = "server", about = "Chat relay hub")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = DEFAULT_HOST)]
    host: String,

    /// TCP port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Largest accepted frame in bytes
    #[arg(long, default_value_t = relay::codec::DEFAULT_MAX_FRAME_BYTES)]
    max_frame_bytes: usize,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let config = ServerConfig {
        max_frame_bytes: args.max_frame_bytes,
        ..ServerConfig::new(args.host, args.port)
    };
    let server = Server::bind(config).await?;
    println!("Server running on {}", server.local_addr()?);

    server
        .run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
                std::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}
