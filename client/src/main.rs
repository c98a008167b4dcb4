use clap::Parser;
use log::{error, info, warn};
use relay_client::network::{Client, ClientError};
use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::{interval, sleep};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:3010")]
    server: SocketAddr,

    /// uid to log in with
    #[arg(short = 'u', long, default_value = "guest")]
    uid: String,

    /// Chat lines to send after logging in
    #[arg(short = 'm', long)]
    message: Vec<String>,

    /// Seconds to keep listening for pushes
    #[arg(short = 'l', long, default_value = "5")]
    listen: u64,

    /// Seconds to wait for any single answer
    #[arg(long, default_value = "5")]
    timeout: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    info!("Starting client...");
    let mut client = Client::connect(
        args.server,
        relay_shared::PROTOCOL_VERSION,
        Duration::from_secs(args.timeout),
    )
    .await?;

    let entry = client
        .request("connector.entry", json!({ "uid": args.uid }))
        .await?;
    info!("Logged in: {}", entry);

    for text in &args.message {
        let reply = client.request("chat.send", json!({ "text": text })).await?;
        info!("Sent {:?}: {}", text, reply);
    }

    let mut heartbeat = interval(
        client
            .heartbeat_interval()
            .unwrap_or(Duration::from_secs(args.listen.max(1))),
    );
    let deadline = sleep(Duration::from_secs(args.listen));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            push = client.next_push() => {
                match push {
                    Ok((route, body)) => info!("Push {}: {}", route, body),
                    Err(ClientError::Timeout(_)) => {}
                    Err(ClientError::Kicked(reason)) => {
                        warn!("Kicked: {}", reason);
                        return Ok(());
                    }
                    Err(e) => error!("Error receiving push: {}", e),
                }
            }
            _ = heartbeat.tick() => {
                if client.heartbeat_interval().is_some() {
                    client.heartbeat().await?;
                }
            }
            _ = &mut deadline => break,
        }
    }

    client.disconnect("client exit").await?;
    Ok(())
}
