//! ECH Tunnel client
//!
//! Long-running client process:
//! - Discovers and caches the relay's ECHConfigList (DoH → UDP DNS)
//! - Brings up the carrier pool (WebSocket over TLS 1.3 + ECH)
//! - Serves the ingress selected by the `-l` URL scheme until SIGINT

use anyhow::{Context, Result};
use clap::Parser;
use ech_tunnel::config::{self, IngressMode};
use ech_tunnel::ech::EchCache;
use ech_tunnel::ingress;
use ech_tunnel::pool::EchPool;
use ech_tunnel::transport::EchDialer;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// ECH Tunnel - multiplex TCP/UDP over TLS1.3+ECH WebSocket carriers
#[derive(Parser, Debug)]
#[command(name = "ech-tunnel")]
#[command(about = "Tunnel TCP/UDP traffic over a pool of TLS1.3+ECH WebSocket carriers")]
#[command(version)]
struct Args {
    /// Ingress URL: tcp://listen/target[,listen/target...] or
    /// proxy://[user:pass@]host:port
    #[arg(short = 'l', long)]
    listen: String,

    /// Relay URL (wss://host[:port]/path)
    #[arg(short = 'f', long)]
    forward: String,

    /// Connect to this IP instead of resolving the relay host (TLS SNI
    /// stays on the hostname)
    #[arg(long)]
    ip: Option<String>,

    /// Credential sent as the WebSocket subprotocol
    #[arg(long)]
    token: Option<String>,

    /// Source allow-list CIDRs (only meaningful to the relay server;
    /// accepted and ignored here)
    #[arg(long, default_value = "0.0.0.0/0,::/0")]
    cidr: String,

    /// UDP DNS server used as the ECH discovery fallback
    #[arg(long, default_value = "119.29.29.29:53")]
    dns: String,

    /// DNS-over-HTTPS endpoint tried first for ECH discovery
    #[arg(long, default_value = "https://doh.pub/dns-query")]
    doh: String,

    /// Domain whose HTTPS record carries the ECHConfigList
    #[arg(long, default_value = "cloudflare-ech.com")]
    ech: String,

    /// Number of WebSocket carriers in the pool
    #[arg(short = 'n', long, default_value_t = ech_tunnel::DEFAULT_POOL_SIZE)]
    pool_size: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(args.log_level.as_str())
        .init();

    info!("ECH Tunnel v{}", ech_tunnel::VERSION);
    debug!(cidr = %args.cidr, "allow-list is a relay-side setting, ignored in client mode");

    let ingress_mode = config::parse_ingress(&args.listen).context("invalid -l ingress URL")?;
    let relay = config::parse_relay(&args.forward, args.token.clone(), args.ip.clone())
        .context("invalid -f relay URL")?;
    info!(relay = %relay.host, port = relay.port, "relay configured");

    // No carrier is ever dialed without cached ECH material; this
    // blocks (retrying) until discovery succeeds.
    let ech = Arc::new(EchCache::new(
        args.ech.clone(),
        args.doh.clone(),
        args.dns.clone(),
    ));
    info!(domain = %args.ech, "fetching ECHConfigList");
    ech.prepare().await;

    let dialer = Arc::new(EchDialer::new(relay, ech));
    let pool = EchPool::new(dialer, args.pool_size);
    pool.start().await;

    match ingress_mode {
        IngressMode::Forward(rules) => {
            info!(rules = rules.len(), "starting tcp forwarders");
            let tasks: Vec<JoinHandle<ech_tunnel::Result<()>>> = rules
                .into_iter()
                .map(|rule| {
                    let pool = Arc::clone(&pool);
                    tokio::spawn(ingress::forward::run(rule, pool))
                })
                .collect();

            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("interrupt received, shutting down"),
                (result, _, _) = futures_util::future::select_all(tasks) => {
                    match result {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            error!(error = %e, "forwarder failed");
                            return Err(e).context("tcp forwarder failed");
                        }
                        Err(e) => return Err(e).context("forwarder task panicked"),
                    }
                }
            }
        }
        IngressMode::Proxy(cfg) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("interrupt received, shutting down"),
                result = ingress::run_proxy(cfg, Arc::clone(&pool)) => {
                    result.context("proxy server failed")?;
                }
            }
        }
    }

    Ok(())
}
