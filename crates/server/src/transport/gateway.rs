//! WebSocket client for the WhatsApp Web gateway.
//!
//! The gateway owns the WhatsApp Web session and relays its events as JSON
//! frames. [`GatewayClient`] keeps one socket open, reconnects with
//! exponential backoff, forwards inbound chat messages to the bot and
//! correlates command results with the callers waiting on them.

use super::{ChatTransport, ConnectionState, TransportError};
use crate::config::GatewayConfig;
use crate::metrics::Metrics;
use crate::util::generate_id;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use poquida_proto::{
    BotUser, CommandResult, ConnectionPhase, ConnectionUpdate, GatewayCommand, GatewayEvent,
    OutboundContent, WireMessage, decode_event, encode_command,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};

pub const SELF_TEST_TEXT: &str = "🤖 Bot online e pronto para enviar códigos!";
const INBOUND_QUEUE: usize = 256;
const COMMAND_QUEUE: usize = 64;

type GatewaySocket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PendingReply = oneshot::Sender<Result<CommandResult, TransportError>>;

/// How a socket session ended.
#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    Closed(String),
    LoggedOut,
    /// Nobody consumes inbound messages anymore.
    Shutdown,
}

/// Backoff before reconnect `attempt` (1-based), with ±12.5 % jitter.
pub fn reconnect_delay(initial: Duration, max: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(30) as i32;
    let base = initial.as_secs_f64() * 2.0f64.powi(exponent);
    let capped = base.min(max.as_secs_f64());
    let jitter = (rand::random::<f64>() - 0.5) * capped * 0.25;
    Duration::from_secs_f64((capped + jitter).max(0.0))
}

pub struct GatewayClient {
    config: GatewayConfig,
    public_url: String,
    metrics: Arc<Metrics>,
    state: RwLock<ConnectionState>,
    user: RwLock<Option<BotUser>>,
    qr: RwLock<Option<String>>,
    outbound: RwLock<Option<mpsc::Sender<GatewayCommand>>>,
    pending: Mutex<HashMap<String, PendingReply>>,
}

impl GatewayClient {
    /// Spawns the connection task and returns the inbound message stream.
    pub fn start(
        config: GatewayConfig,
        public_url: String,
        metrics: Arc<Metrics>,
    ) -> (Arc<Self>, mpsc::Receiver<WireMessage>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let client = Arc::new(Self {
            config,
            public_url,
            metrics,
            state: RwLock::new(ConnectionState::Disconnected),
            user: RwLock::new(None),
            qr: RwLock::new(None),
            outbound: RwLock::new(None),
            pending: Mutex::new(HashMap::new()),
        });
        tokio::spawn(Arc::clone(&client).run(inbound_tx));
        (client, inbound_rx)
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Latest pairing QR payload while the gateway waits for a scan.
    pub async fn qr(&self) -> Option<String> {
        self.qr.read().await.clone()
    }

    async fn set_state(&self, state: ConnectionState) {
        *self.state.write().await = state;
    }

    async fn run(self: Arc<Self>, inbound: mpsc::Sender<WireMessage>) {
        let mut attempt = 0u32;
        loop {
            if attempt > 0 {
                if self.config.max_reconnect_attempts > 0
                    && attempt > self.config.max_reconnect_attempts
                {
                    error!(
                        attempts = attempt - 1,
                        "gateway reconnect attempts exhausted, giving up"
                    );
                    self.set_state(ConnectionState::Disconnected).await;
                    return;
                }
                self.set_state(ConnectionState::Reconnecting(attempt)).await;
                let delay = reconnect_delay(
                    self.config.initial_backoff,
                    self.config.max_backoff,
                    attempt,
                );
                info!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "reconnecting to gateway"
                );
                sleep(delay).await;
                self.metrics.mark_reconnect();
            } else {
                self.set_state(ConnectionState::Connecting).await;
            }

            let socket = match self.connect().await {
                Ok(socket) => socket,
                Err(err) => {
                    warn!(error = %err, url = %self.config.url, "gateway connection failed");
                    attempt = attempt.saturating_add(1);
                    continue;
                }
            };
            let (end, was_open) = self.drive(socket, &inbound).await;
            *self.outbound.write().await = None;
            self.fail_pending().await;
            match end {
                SessionEnd::LoggedOut => {
                    warn!("gateway session logged out; pair the device again to resume");
                    self.set_state(ConnectionState::LoggedOut).await;
                    return;
                }
                SessionEnd::Shutdown => {
                    info!("inbound consumer gone, stopping gateway client");
                    self.set_state(ConnectionState::Disconnected).await;
                    return;
                }
                SessionEnd::Closed(reason) => {
                    warn!(reason = %reason, "gateway connection closed");
                    self.set_state(ConnectionState::Disconnected).await;
                    attempt = if was_open {
                        1
                    } else {
                        attempt.saturating_add(1)
                    };
                }
            }
        }
    }

    async fn connect(&self) -> Result<GatewaySocket, TransportError> {
        let mut request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .map_err(|err| TransportError::Network(err.to_string()))?;
        if let Some(token) = &self.config.token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|err| TransportError::Network(err.to_string()))?;
            request.headers_mut().insert("authorization", value);
        }
        let (socket, _) = timeout(self.config.connect_timeout, connect_async(request))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|err| TransportError::Network(err.to_string()))?;
        info!(url = %self.config.url, "gateway socket established");
        Ok(socket)
    }

    /// Pumps one socket until it ends. Returns whether the session reached `open`.
    async fn drive(
        self: &Arc<Self>,
        socket: GatewaySocket,
        inbound: &mpsc::Sender<WireMessage>,
    ) -> (SessionEnd, bool) {
        let (mut sink, mut source) = socket.split();
        let (command_tx, mut command_rx) = mpsc::channel::<GatewayCommand>(COMMAND_QUEUE);
        *self.outbound.write().await = Some(command_tx);
        let mut was_open = false;

        let end = loop {
            tokio::select! {
                Some(command) = command_rx.recv() => {
                    let encoded = match encode_command(&command) {
                        Ok(encoded) => encoded,
                        Err(err) => {
                            if let Some(request_id) = command.request_id() {
                                self.resolve_failure(request_id, TransportError::Codec(err)).await;
                            }
                            continue;
                        }
                    };
                    if let Err(err) = sink.send(Message::Text(encoded)).await {
                        break SessionEnd::Closed(format!("write failed: {}", err));
                    }
                }
                frame = source.next() => {
                    let payload = match frame {
                        Some(Ok(Message::Text(text))) => text.into_bytes(),
                        Some(Ok(Message::Binary(data))) => data,
                        Some(Ok(Message::Close(_))) | None => {
                            break SessionEnd::Closed("socket closed by gateway".to_string());
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(err)) => {
                            break SessionEnd::Closed(format!("read failed: {}", err));
                        }
                    };
                    let event = match decode_event(&payload) {
                        Ok(event) => event,
                        Err(err) => {
                            warn!(error = %err, bytes = payload.len(), "dropping undecodable gateway frame");
                            continue;
                        }
                    };
                    if let Some(end) = self.handle_event(event, inbound, &mut was_open).await {
                        break end;
                    }
                }
            }
        };

        if matches!(end, SessionEnd::Closed(_))
            && let Ok(encoded) = encode_command(&GatewayCommand::End {
                reason: "reconnecting".to_string(),
            })
        {
            let _ = sink.send(Message::Text(encoded)).await;
            let _ = sink.close().await;
        }
        (end, was_open)
    }

    async fn handle_event(
        self: &Arc<Self>,
        event: GatewayEvent,
        inbound: &mpsc::Sender<WireMessage>,
        was_open: &mut bool,
    ) -> Option<SessionEnd> {
        match event {
            GatewayEvent::ConnectionUpdate(update) => {
                self.handle_connection_update(update, was_open).await
            }
            GatewayEvent::MessagesUpsert { messages } => {
                for message in messages {
                    if inbound.send(message).await.is_err() {
                        return Some(SessionEnd::Shutdown);
                    }
                }
                None
            }
            GatewayEvent::CredsUpdate {} => {
                debug!("gateway persisted session credentials");
                None
            }
            GatewayEvent::CommandResult(result) => {
                match self.pending.lock().await.remove(&result.request_id) {
                    Some(waiter) => {
                        let _ = waiter.send(Ok(result));
                    }
                    None => debug!(request_id = %result.request_id, "result for unknown command"),
                }
                None
            }
        }
    }

    async fn handle_connection_update(
        self: &Arc<Self>,
        update: ConnectionUpdate,
        was_open: &mut bool,
    ) -> Option<SessionEnd> {
        if let Some(qr) = update.qr {
            info!(
                qr = %qr,
                url = %format!("{}/qr", self.public_url),
                "pairing QR code available, scan it with WhatsApp"
            );
            *self.qr.write().await = Some(qr);
        }
        match update.connection {
            Some(ConnectionPhase::Open) => {
                *was_open = true;
                *self.qr.write().await = None;
                let user = update.user;
                info!(
                    jid = user.as_ref().map(|u| u.id.as_str()).unwrap_or("N/A"),
                    name = user
                        .as_ref()
                        .and_then(|u| u.name.as_deref())
                        .unwrap_or("unknown"),
                    "gateway session open"
                );
                if user.is_some() {
                    *self.user.write().await = user;
                }
                self.set_state(ConnectionState::Open).await;
                self.spawn_self_test();
                None
            }
            Some(ConnectionPhase::Close) => {
                let disconnect = update.last_disconnect.unwrap_or_default();
                if disconnect.is_logged_out() {
                    return Some(SessionEnd::LoggedOut);
                }
                Some(SessionEnd::Closed(format!(
                    "gateway reported close (status {:?}, {})",
                    disconnect.status_code,
                    disconnect.message.as_deref().unwrap_or("no message")
                )))
            }
            Some(ConnectionPhase::Connecting) => {
                debug!("gateway connecting to WhatsApp");
                None
            }
            None => None,
        }
    }

    fn spawn_self_test(self: &Arc<Self>) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            sleep(client.config.self_test_delay).await;
            let Some(jid) = client.own_jid().await else {
                return;
            };
            match client.send(&jid, OutboundContent::text(SELF_TEST_TEXT)).await {
                Ok(message_id) => info!(message_id = %message_id, "gateway self-test delivered"),
                Err(err) => warn!(error = %err, "gateway self-test failed"),
            }
        });
    }

    async fn fail_pending(&self) {
        let mut pending = self.pending.lock().await;
        for (_, waiter) in pending.drain() {
            let _ = waiter.send(Err(TransportError::Disconnected));
        }
    }

    async fn resolve_failure(&self, request_id: &str, error: TransportError) {
        if let Some(waiter) = self.pending.lock().await.remove(request_id) {
            let _ = waiter.send(Err(error));
        }
    }

    async fn request<F>(&self, build: F) -> Result<CommandResult, TransportError>
    where
        F: FnOnce(String) -> GatewayCommand,
    {
        if !self.state().await.is_open() {
            return Err(TransportError::NotConnected);
        }
        let sender = self
            .outbound
            .read()
            .await
            .clone()
            .ok_or(TransportError::NotConnected)?;
        let request_id = generate_id("gateway-command");
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending
            .lock()
            .await
            .insert(request_id.clone(), reply_tx);
        if sender.send(build(request_id.clone())).await.is_err() {
            self.pending.lock().await.remove(&request_id);
            return Err(TransportError::Disconnected);
        }
        match timeout(self.config.request_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Disconnected),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                Err(TransportError::Timeout)
            }
        }
    }
}

#[async_trait]
impl ChatTransport for GatewayClient {
    async fn send(&self, jid: &str, content: OutboundContent) -> Result<String, TransportError> {
        let result = self
            .request(|request_id| GatewayCommand::SendMessage {
                request_id,
                jid: jid.to_string(),
                content,
            })
            .await?;
        if !result.ok {
            return Err(TransportError::Rejected(
                result.error.unwrap_or_else(|| "send failed".to_string()),
            ));
        }
        Ok(result.message_id.unwrap_or_default())
    }

    async fn is_registered(&self, jid: &str) -> Result<bool, TransportError> {
        let result = self
            .request(|request_id| GatewayCommand::CheckNumber {
                request_id,
                jid: jid.to_string(),
            })
            .await?;
        if !result.ok {
            return Err(TransportError::Rejected(
                result.error.unwrap_or_else(|| "lookup failed".to_string()),
            ));
        }
        Ok(result.exists.unwrap_or(false))
    }

    async fn is_ready(&self) -> bool {
        self.state().await.is_open() && self.outbound.read().await.is_some()
    }

    async fn own_jid(&self) -> Option<String> {
        self.user.read().await.as_ref().map(|user| user.id.clone())
    }
}
