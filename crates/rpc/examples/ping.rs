//! Ping client
//!
//! Calls `ping.PingService.Ping` at a fixed interval and prints round-trip
//! times. Ctrl-C prints a summary.

#[path = "shared/ping_proto.rs"]
mod ping_proto;

use std::time::{Duration, Instant};

use bytes::Bytes;
use clap::Parser;
use rand::RngCore;
use tracing::warn;
use wsrpc::{Client, ClientError, ClientOptions};

use ping_proto::{PingRequest, PingResponse, SERVICE, ping_service};

#[derive(Parser, Debug)]
#[command(author, version, about = "WebSocket RPC ping client", long_about = None)]
struct Args {
    /// Server URL
    #[arg(default_value = "ws://127.0.0.1:8080")]
    url: String,

    /// Milliseconds between pings
    #[arg(short, long, default_value_t = 1000)]
    interval: u64,

    /// Random payload bytes per ping
    #[arg(short, long, default_value_t = 64)]
    size: usize,

    /// Per-call timeout in milliseconds
    #[arg(short, long, default_value_t = 5000)]
    timeout: u64,

    /// Stop after this many pings
    #[arg(short, long)]
    count: Option<u64>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Debug, Default)]
struct Stats {
    sent: u64,
    rtts: Vec<f64>,
}

impl Stats {
    fn print(&self, url: &str) {
        let received = self.rtts.len() as u64;
        let lost = self.sent.saturating_sub(received);
        let loss = if self.sent == 0 {
            0.0
        } else {
            lost as f64 * 100.0 / self.sent as f64
        };

        println!();
        println!("--- {url} ping statistics ---");
        println!(
            "{} calls, {} answered, {:.1}% loss",
            self.sent, received, loss
        );

        if self.rtts.is_empty() {
            return;
        }

        let min = self.rtts.iter().copied().fold(f64::INFINITY, f64::min);
        let max = self.rtts.iter().copied().fold(0.0, f64::max);
        let avg = self.rtts.iter().sum::<f64>() / self.rtts.len() as f64;
        let variance = self
            .rtts
            .iter()
            .map(|rtt| (rtt - avg).powi(2))
            .sum::<f64>()
            / self.rtts.len() as f64;

        println!(
            "rtt min/avg/max/stddev = {min:.3}/{avg:.3}/{max:.3}/{:.3} ms",
            variance.sqrt()
        );
    }
}

async fn ping(client: &Client, size: usize) -> Result<(u64, Duration), ClientError> {
    let mut payload = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut payload);

    let request = PingRequest {
        nonce: rand::random(),
        payload: Bytes::from(payload),
    };

    let started = Instant::now();
    let response: PingResponse = client.service(SERVICE)?.call("Ping", &request).await?;
    let rtt = started.elapsed();

    if response.nonce != request.nonce || response.payload != request.payload {
        warn!(nonce = request.nonce, "Mismatched ping response");
    }

    Ok((response.payload.len() as u64, rtt))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let log_level = if args.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt().with_max_level(log_level).init();

    let options = ClientOptions::default().send_timeout(Duration::from_millis(args.timeout));
    let client = Client::new(&args.url, [ping_service()], options);
    client.connect().await?;

    println!("PING {} with {} bytes of payload", args.url, args.size);

    let mut stats = Stats::default();
    let mut ticker = tokio::time::interval(Duration::from_millis(args.interval.max(1)));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {}
        }

        stats.sent += 1;
        let seq = stats.sent;
        match ping(&client, args.size).await {
            Ok((bytes, rtt)) => {
                let millis = rtt.as_secs_f64() * 1000.0;
                stats.rtts.push(millis);
                println!("{bytes} bytes from {}: seq={seq} time={millis:.3} ms", args.url);
            }
            Err(e) => println!("seq={seq} failed: {e}"),
        }

        if args.count.is_some_and(|count| stats.sent >= count) {
            break;
        }
    }

    stats.print(&args.url);
    client.disconnect().await;

    Ok(())
}
