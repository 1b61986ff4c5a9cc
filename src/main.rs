//! Shoplink: storefront realtime channel tool
//!
//! Watches a storefront's realtime channel from the terminal, or runs the
//! development relay hub that stands in for the backend's `/ws` endpoint.
//!
//! Usage:
//!   shoplink watch --origin https://shop.example.com --production
//!   shoplink watch --origin http://localhost:3000 --type inventory_updated
//!   shoplink serve                               # Dev hub on 127.0.0.1:5000
//!   shoplink serve --port 0                      # OS-assigned port

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use shoplink_protocol::Envelope;
use shoplink_transport::{
    ClientConfig, ClientEvent, DEFAULT_CONNECT_TIMEOUT, DEFAULT_RECONNECT_DELAY, DevHub,
    EndpointConfig, Environment, HubConfig, RealtimeClient,
};
use shoplink_transport::endpoint::{DEFAULT_DEV_HOST, DEFAULT_PATH};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "shoplink", about = "Storefront realtime channel client and dev hub")]
struct Cli {
    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,

    /// Write logs to a file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to a realtime channel, print inbound messages, send stdin lines
    Watch(WatchArgs),
    /// Run the development relay hub
    Serve(ServeArgs),
}

#[derive(Args, Debug)]
struct WatchArgs {
    /// Page origin the dashboard is served from
    #[arg(long, default_value = "http://localhost:5000")]
    origin: String,

    /// Connect to the origin's own host instead of the dev host
    #[arg(long)]
    production: bool,

    /// Backend host used outside production
    #[arg(long, default_value = DEFAULT_DEV_HOST)]
    dev_host: String,

    /// Realtime endpoint path
    #[arg(long, default_value = DEFAULT_PATH)]
    path: String,

    /// Delay before each reconnect attempt, in milliseconds
    #[arg(long, default_value_t = DEFAULT_RECONNECT_DELAY.as_millis() as u64)]
    reconnect_delay_ms: u64,

    /// Give up on a dial that has not completed after this many milliseconds
    #[arg(long, default_value_t = DEFAULT_CONNECT_TIMEOUT.as_millis() as u64)]
    connect_timeout_ms: u64,

    /// Only print messages of this type (repeatable)
    #[arg(long = "type")]
    types: Vec<String>,
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Hostname to bind to
    #[arg(long, default_value = "127.0.0.1")]
    hostname: String,

    /// Port to listen on (0 for OS-assigned)
    #[arg(long, default_value = "5000")]
    port: u16,

    /// Maximum concurrent connections
    #[arg(long, default_value = "32")]
    max_connections: usize,
}

fn init_tracing(verbose: bool, log_file: Option<&PathBuf>) -> anyhow::Result<()> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    // stdout carries message output, so logs never go there.
    if let Some(log_path) = log_file {
        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .with_context(|| format!("Failed to open log file {}", log_path.display()))?;

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .init();

        eprintln!("Logging to {}", log_path.display());
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_file.as_ref())?;

    match cli.command {
        Command::Watch(args) => watch(args).await,
        Command::Serve(args) => serve(args).await,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// watch
// ─────────────────────────────────────────────────────────────────────────────

async fn watch(args: WatchArgs) -> anyhow::Result<()> {
    let config = ClientConfig {
        endpoint: EndpointConfig {
            origin: args.origin,
            environment: if args.production {
                Environment::Production
            } else {
                Environment::Development
            },
            dev_host: args.dev_host,
            path: args.path,
        },
        reconnect_delay: Duration::from_millis(args.reconnect_delay_ms),
        connect_timeout: Duration::from_millis(args.connect_timeout_ms),
    };

    let client = RealtimeClient::new(config).context("Invalid endpoint configuration")?;
    eprintln!("Watching {}", client.endpoint());

    let print = |envelope: &Envelope| println!("{}", envelope.to_text());
    if args.types.is_empty() {
        client.on_message(print);
    } else {
        for kind in &args.types {
            client.subscribe(kind.as_str(), print);
        }
    }

    client.on_lifecycle(|event| match event {
        ClientEvent::Disconnected { retry_in } => {
            eprintln!("Disconnected, retrying in {}ms", retry_in.as_millis());
        }
        ClientEvent::Open => eprintln!("Connected"),
        ClientEvent::Connecting | ClientEvent::Closed => {}
    });

    client.connect();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,

            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match Envelope::parse(line) {
                        Ok(envelope) => {
                            if !client.send(&envelope) {
                                eprintln!("Not connected ({}), dropped: {line}", client.state());
                            }
                        }
                        Err(e) => eprintln!("Not a message ({e}): {line}"),
                    }
                }
                Ok(None) => {
                    info!("stdin closed, still watching");
                    stdin_open = false;
                }
                Err(e) => {
                    warn!("Failed to read stdin: {e}");
                    stdin_open = false;
                }
            },
        }
    }

    client.close();
    client.closed().await;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// serve
// ─────────────────────────────────────────────────────────────────────────────

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let config = HubConfig {
        port: args.port,
        hostname: args.hostname.clone(),
        max_connections: Some(args.max_connections),
        ..Default::default()
    };

    let mut hub = DevHub::start(config).await.context("Failed to start dev hub")?;

    println!();
    println!("  Shoplink dev hub running");
    println!();
    println!("  WebSocket endpoint:");
    println!("    ws://{}:{}{}", args.hostname, hub.port(), hub.path());
    println!();
    println!("  Lines typed here are broadcast to every client.");
    println!("  Press Ctrl+C to stop.");
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,

            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => match Envelope::parse(line.trim()) {
                    Ok(envelope) => {
                        hub.broadcast(&envelope);
                        info!(kind = %envelope.kind, clients = hub.client_count(), "Broadcast");
                    }
                    Err(e) => warn!("Not broadcasting invalid message: {e}"),
                },
                Ok(None) | Err(_) => stdin_open = false,
            },
        }
    }

    println!();
    println!("  Shutting down...");
    hub.stop().await;
    println!("  Hub stopped.");
    Ok(())
}
