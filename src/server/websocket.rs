//! WebSocket server implementation
//!
//! Accepts connections on `/ws` and answers every text frame with the
//! generated reply, one text frame per streamed chunk.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::BoxStream;
use futures_util::{future, SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::{interval_at, timeout, Instant};
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::ai::{AiResult, TextGenerator};

/// Path accepted for WebSocket upgrades
pub const WS_PATH: &str = "/ws";

/// Client message that ends the session
pub const BYE_MESSAGE: &str = "bye";

/// Close reason sent after [`BYE_MESSAGE`]
pub const BYE_CLOSE_REASON: &str = "Client said BYE";

/// Default interval between server pings
pub const DEFAULT_PING_PERIOD: Duration = Duration::from_secs(15);

/// Default grace period after a missed ping before the connection is dropped
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// How long shutdown waits for open connections to close
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Configuration for the WebSocket server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Interval between pings
    pub ping_period: Duration,
    /// How long past a ping a silent connection is kept
    pub timeout: Duration,
}

impl ServerConfig {
    /// Create a new server configuration
    pub fn new(bind: String, port: u16) -> Self {
        Self {
            bind,
            port,
            ping_period: DEFAULT_PING_PERIOD,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set the keepalive timings
    pub fn with_keepalive(mut self, ping_period: Duration, timeout: Duration) -> Self {
        self.ping_period = ping_period;
        self.timeout = timeout;
        self
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    fn keepalive(&self) -> Keepalive {
        Keepalive {
            ping_period: self.ping_period,
            timeout: self.timeout,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Keepalive {
    ping_period: Duration,
    timeout: Duration,
}

impl Keepalive {
    fn idle_limit(&self) -> Duration {
        self.ping_period + self.timeout
    }
}

/// Whether a client message ends the session
pub fn is_bye(text: &str) -> bool {
    text.eq_ignore_ascii_case(BYE_MESSAGE)
}

/// WebSocket server streaming generated replies to clients
pub struct WebSocketServer {
    config: ServerConfig,
    generator: Arc<dyn TextGenerator>,
    shutdown_tx: broadcast::Sender<()>,
    active: Arc<AtomicUsize>,
}

impl WebSocketServer {
    /// Create a new WebSocket server
    pub fn new(config: ServerConfig, generator: Arc<dyn TextGenerator>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            generator,
            shutdown_tx,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Number of open connections
    pub fn connection_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Bind to the configured address and serve until shutdown
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(&addr).await?;
        info!("WebSocket server listening on ws://{}{}", addr, WS_PATH);

        self.serve(listener).await
    }

    /// Serve connections from an already bound listener until shutdown.
    ///
    /// Returns once every open connection has been sent its Close frame, or
    /// after [`SHUTDOWN_GRACE`], whichever comes first.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let keepalive = self.config.keepalive();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let generator = Arc::clone(&self.generator);
                            let shutdown_rx = self.shutdown_tx.subscribe();
                            let active = Arc::clone(&self.active);

                            active.fetch_add(1, Ordering::SeqCst);
                            connections.spawn(async move {
                                if let Err(e) = handle_connection(stream, peer_addr, generator, shutdown_rx, keepalive).await {
                                    error!("Connection error from {}: {}", peer_addr, e);
                                }
                                active.fetch_sub(1, Ordering::SeqCst);
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                // Reap finished connections
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        if !connections.is_empty() {
            info!("Closing {} open connections...", connections.len());
            let drain = async { while connections.join_next().await.is_some() {} };
            if timeout(SHUTDOWN_GRACE, drain).await.is_err() {
                warn!("Connections still open after {:?}, aborting them", SHUTDOWN_GRACE);
                connections.shutdown().await;
            }
        }

        Ok(())
    }
}

/// Only `/ws` is upgraded; anything else gets a 404
fn route_upgrade(request: &Request, response: Response) -> Result<Response, ErrorResponse> {
    let path = request.uri().path();
    if path == WS_PATH {
        return Ok(response);
    }

    debug!("Rejecting upgrade for {}", path);
    let mut error = ErrorResponse::new(Some(format!("No route for {}", path)));
    *error.status_mut() = StatusCode::NOT_FOUND;
    Err(error)
}

fn ws_config() -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = None;
    config.max_frame_size = None;
    config
}

/// Reply being streamed to the client
struct Reply {
    text: String,
    chunks: BoxStream<'static, AiResult<String>>,
    sent: usize,
}

impl Reply {
    fn start(generator: &dyn TextGenerator, text: String) -> Self {
        let chunks = generator.generate(&text);
        Self {
            text,
            chunks,
            sent: 0,
        }
    }
}

/// Next chunk of the in-flight reply; never resolves when there is none
async fn next_chunk(reply: &mut Option<Reply>) -> Option<AiResult<String>> {
    match reply {
        Some(reply) => reply.chunks.next().await,
        None => future::pending().await,
    }
}

/// Handle a single WebSocket connection
///
/// Replies are streamed one message at a time, in arrival order. Inbound
/// frames, pings and shutdown are still serviced while a reply streams.
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    generator: Arc<dyn TextGenerator>,
    mut shutdown_rx: broadcast::Receiver<()>,
    keepalive: Keepalive,
) -> anyhow::Result<()> {
    let connection_id = Uuid::new_v4();
    info!("New connection {} from {}", connection_id, peer_addr);

    let ws_stream = accept_hdr_async_with_config(stream, route_upgrade, Some(ws_config())).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let mut last_seen = Instant::now();
    let mut ping = interval_at(Instant::now() + keepalive.ping_period, keepalive.ping_period);
    let mut queued: VecDeque<String> = VecDeque::new();
    let mut reply: Option<Reply> = None;

    loop {
        if reply.is_none() {
            if let Some(text) = queued.pop_front() {
                reply = Some(Reply::start(generator.as_ref(), text));
            }
        }

        tokio::select! {
            msg = ws_receiver.next() => {
                if let Some(Ok(_)) = msg {
                    last_seen = Instant::now();
                }

                match msg {
                    Some(Ok(Message::Text(text))) => {
                        debug!("Received message on {}: {} bytes", connection_id, text.len());
                        queued.push_back(text);
                    }
                    Some(Ok(Message::Binary(data))) => {
                        warn!("Received binary message on {} ({} bytes), ignoring", connection_id, data.len());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        info!("Client {} requested close", connection_id);
                        break;
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => {
                        error!("WebSocket error on {}: {}", connection_id, e);
                        break;
                    }
                    None => {
                        info!("Connection {} closed by peer", connection_id);
                        break;
                    }
                }
            }
            chunk = next_chunk(&mut reply), if reply.is_some() => {
                match chunk {
                    Some(Ok(chunk)) => {
                        ws_sender.send(Message::Text(chunk)).await?;
                        if let Some(reply) = reply.as_mut() {
                            reply.sent += 1;
                        }
                        continue;
                    }
                    // A generation failure ends this reply but not the connection
                    Some(Err(e)) => error!("Generation failed on {}: {}", connection_id, e),
                    None => {}
                }

                let Some(done) = reply.take() else { continue };
                debug!("Sent {} chunks on {}", done.sent, connection_id);

                if is_bye(&done.text) {
                    info!("Client {} said bye", connection_id);
                    ws_sender
                        .send(Message::Close(Some(CloseFrame {
                            code: CloseCode::Normal,
                            reason: BYE_CLOSE_REASON.into(),
                        })))
                        .await?;
                    break;
                }
            }
            _ = ping.tick() => {
                if last_seen.elapsed() > keepalive.idle_limit() {
                    warn!("Connection {} timed out", connection_id);
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
                ws_sender.send(Message::Ping(Vec::new())).await?;
            }
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received, closing connection {}", connection_id);
                let _ = ws_sender.send(Message::Close(None)).await;
                break;
            }
        }
    }

    info!("Connection {} from {} closed", connection_id, peer_addr);
    Ok(())
}
