use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use strainer::{
    DEFAULT_MAX_SUBSCRIPTIONS, Envelope, FilterConfig, FilterFullNode, Host, Keypair, Message, MessageBus, TcpHost,
};

#[derive(Parser, Debug)]
#[command(name = "strainer")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    /// Hex-encoded Ed25519 secret key. A fresh identity is generated when absent.
    #[arg(long, value_name = "HEX")]
    secret_key: Option<String>,

    #[arg(long, default_value_t = DEFAULT_MAX_SUBSCRIPTIONS)]
    max_subscriptions: usize,

    #[arg(long, default_value = "20")]
    push_timeout_secs: u64,

    #[arg(long, default_value = "300")]
    subscription_timeout_secs: u64,

    #[arg(short, long, default_value = "60")]
    stats_interval: u64,
}

/// Parse `pubsub_topic content_topic payload...` into an envelope.
fn parse_line(line: &str) -> Result<Envelope> {
    let mut parts = line.trim().splitn(3, char::is_whitespace);
    let pubsub_topic = parts.next().filter(|s| !s.is_empty()).context("missing pubsub topic")?;
    let content_topic = parts.next().context("missing content topic")?;
    let payload = parts.next().unwrap_or_default();

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock before unix epoch")?;
    let message = Message::new(content_topic, payload.as_bytes().to_vec())
        .with_timestamp(i64::try_from(now.as_nanos()).unwrap_or(i64::MAX));
    Ok(Envelope::new(message, pubsub_topic))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let keypair = match &args.secret_key {
        Some(hex_key) => Keypair::from_secret_key_hex(hex_key).context("invalid --secret-key")?,
        None => Keypair::generate(),
    };

    let host = Arc::new(TcpHost::bind(args.bind, keypair).await?);
    info!("Node identity: {}", host.local_peer());
    info!("Listening on {}", host.local_addr());

    let config = FilterConfig {
        max_subscriptions: args.max_subscriptions,
        push_timeout: Duration::from_secs(args.push_timeout_secs),
        subscription_timeout: Duration::from_secs(args.subscription_timeout_secs),
        ..Default::default()
    };

    let bus = MessageBus::new();
    let node = FilterFullNode::new(host.clone(), config);
    node.start(bus.subscribe(None)).await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut interval = time::interval(Duration::from_secs(args.stats_interval.max(1)));

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                let stats = node.stats();
                info!(
                    subscribers = node.subscriptions().count(),
                    requests = stats.requests_handled,
                    delivered = stats.pushes_delivered,
                    dial_failures = stats.dial_failures,
                    push_timeouts = stats.push_timeouts,
                    write_failures = stats.write_failures,
                    decode_failures = stats.decode_failures,
                    "filter stats"
                );
            }
            line = lines.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) if line.trim().is_empty() => {}
                    Ok(Some(line)) => match parse_line(&line) {
                        Ok(envelope) => {
                            let reached = bus.publish(envelope).await;
                            info!(reached, "published message");
                        }
                        Err(e) => warn!(error = %e, "ignoring malformed input line"),
                    },
                    Ok(None) => {
                        info!("stdin closed; serving until shutdown");
                        stdin_open = false;
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to read stdin");
                        stdin_open = false;
                    }
                }
            }
        }
    }

    node.stop().await;
    Ok(())
}
