//! Ping server
//!
//! Serves `ping.PingService` over WebSocket, echoing each nonce and payload
//! with the server's clock.

#[path = "shared/ping_proto.rs"]
mod ping_proto;

use std::time::{SystemTime, UNIX_EPOCH};

use clap::Parser;
use tracing::{error, info};
use wsrpc::ws::WebSocketListener;
use wsrpc::{Server, ServerEvent, ServerOptions};

use ping_proto::{PingRequest, PingResponse, ping_service};

#[derive(Parser, Debug)]
#[command(author, version, about = "WebSocket RPC ping server", long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    listen: String,

    /// Keep-alive ping interval in seconds, 0 to disable
    #[arg(long, default_value_t = 10)]
    ping_interval: u64,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let log_level = if args.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(log_level).init();

    let options = ServerOptions::default()
        .ping_interval(std::time::Duration::from_secs(args.ping_interval));
    let server = Server::new([ping_service()], options)?;

    server.implement("Ping", |request: PingRequest, connection| async move {
        let server_time_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)?
            .as_millis()
            .try_into()?;

        tracing::debug!(
            connection_id = connection.id(),
            nonce = request.nonce,
            "Ping"
        );

        Ok::<_, anyhow::Error>(PingResponse {
            nonce: request.nonce,
            payload: request.payload,
            server_time_ms,
        })
    })?;

    let mut events = server.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ServerEvent::Listening { address } => info!("Listening on {:?}", address),
                ServerEvent::Connection(connection) => {
                    info!("Peer {} connected from {:?}", connection.id(), connection.peer());
                }
                ServerEvent::Error(e) => error!("{}", e),
            }
        }
    });

    let listener = WebSocketListener::bind(&args.listen).await?;
    server.listen(listener);

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    server.close().await;

    Ok(())
}
