//! Gemini Gateway
//!
//! WebSocket gateway that forwards client text messages to Gemini and
//! streams the generated reply back as a sequence of text frames.

mod ai;
mod config;
mod server;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use ai::{GeminiClient, GeminiOptions, TextGenerator, DEFAULT_BASE_URL, DEFAULT_MODEL};
use config::Env;
use server::{ServerConfig, WebSocketServer, DEFAULT_PING_PERIOD, DEFAULT_TIMEOUT};

/// Gemini Gateway
///
/// Streams Gemini replies to WebSocket clients
#[derive(Parser, Debug)]
#[command(name = "gemini-gateway")]
#[command(version, about, long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Bind address
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Environment file holding the API keys [default: .env]
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Seconds between keepalive pings
    #[arg(long, default_value_t = DEFAULT_PING_PERIOD.as_secs())]
    ping_secs: u64,

    /// Seconds an unanswered ping is tolerated before the connection is dropped
    #[arg(long, default_value_t = DEFAULT_TIMEOUT.as_secs())]
    timeout_secs: u64,

    /// Gemini model
    #[arg(long, default_value = DEFAULT_MODEL)]
    model: String,

    /// Gemini API base URL
    #[arg(long, default_value = DEFAULT_BASE_URL)]
    base_url: String,

    /// Send one prompt, print the full reply and exit instead of serving
    #[arg(long)]
    prompt: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging; RUST_LOG overrides the flag
    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(log_level.into())
                .from_env_lossy(),
        )
        .with_target(false)
        .compact()
        .init();

    info!("Gemini Gateway v{}", env!("CARGO_PKG_VERSION"));

    // Fatal on any schema violation
    let env = match &args.env_file {
        Some(path) => Env::load_from(path)?,
        None => Env::load()?,
    };

    let options = GeminiOptions {
        model: args.model,
        base_url: args.base_url,
    };
    let client = GeminiClient::new(&env, options)?;
    info!("Using model {}", client.model());

    if let Some(prompt) = args.prompt {
        let response = client.generate_content(client.model(), &prompt, None).await?;
        println!("{}", response.text().unwrap_or_default());
        return Ok(());
    }

    let generator: Arc<dyn TextGenerator> = Arc::new(client);
    let config = ServerConfig::new(args.bind, args.port).with_keepalive(
        Duration::from_secs(args.ping_secs),
        Duration::from_secs(args.timeout_secs),
    );

    // Create and start the WebSocket server
    let server = Arc::new(WebSocketServer::new(config, generator));
    let server_handle = Arc::clone(&server);

    // Spawn shutdown signal handler
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        server_handle.shutdown();
    });

    // Run the server
    server.run().await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
