use anyhow::Result;
use chrono::Local;
use clap::Parser;
use tokio::io::BufReader;
use tracing::error;
use tracing_subscriber::EnvFilter;

use relay::config::DEFAULT_PORT;
use relay::{ClientConfig, Session, SessionEvent};

#[derive(Parser)]
#[command(name = "client", about = "Chat relay client")]
struct Args {
    /// Hub host name or address
    host: String,

    /// Hub port
    #[arg(default_value_t = DEFAULT_PORT)]
    port: u16,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
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
    let config = ClientConfig::new(args.host, args.port);

    let (session, mut inbox) = Session::connect(&config).await?;
    println!("Connected to {}", config.server_addr());

    let printer = tokio::spawn(async move {
        while let Some(event) = inbox.recv().await {
            match event {
                SessionEvent::Message(message) => {
                    println!("[{}] {}", Local::now().format("%H:%M:%S"), message)
                }
                SessionEvent::Closed(reason) => {
                    if let Some(notice) = reason.notice() {
                        println!("{notice}");
                    }
                    break;
                }
            }
        }
    });

    let stdin = BufReader::new(tokio::io::stdin());
    tokio::select! {
        sent = session.pump_lines(stdin) => {
            if let Err(err) = sent {
                error!(error = %err, "stopped sending");
            }
        }
        _ = session.closed() => {}
        _ = tokio::signal::ctrl_c() => {}
    }

    session.terminate().await;
    printer.await.ok();

    // A pending stdin read would otherwise hold the runtime open.
    std::process::exit(0);
}
