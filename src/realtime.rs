use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        self,
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::credentials::{Credential, CredentialStore};
use crate::error::{ApiError, RealtimeError};
use crate::events::{self, ClientEvent, EventKind, Incoming, OutgoingMessage, Room, ServerEvent};
use crate::subscriptions::{HandlerRegistry, SubscriptionId};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone)]
pub struct RealtimeSettings {
    pub url: String,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub max_reconnect_attempts: u32,
    pub ack_timeout: Duration,
    pub buffer: usize,
}

impl RealtimeSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            url: config.socket_url.clone(),
            reconnect_base: Duration::from_millis(config.reconnect_base_ms),
            reconnect_max: Duration::from_millis(config.reconnect_max_ms),
            max_reconnect_attempts: config.max_reconnect_attempts,
            ack_timeout: Duration::from_millis(config.ack_timeout_ms),
            buffer: config.event_buffer.max(1),
        }
    }
}

struct Shared {
    settings: RealtimeSettings,
    registry: HandlerRegistry,
    state: watch::Sender<ChannelState>,
    pending_acks: DashMap<u64, oneshot::Sender<Value>>,
    sessions: AtomicU64,
    shutdown: CancellationToken,
}

impl Shared {
    fn set_state(&self, next: ChannelState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(?previous, ?next, "realtime state changed");
        }
    }

    fn handle_text(&self, text: &str) {
        match events::decode_frame(text) {
            Ok(Incoming::Event(event)) => {
                self.registry.dispatch(&event);
            }
            Ok(Incoming::Ack(ack)) => match self.pending_acks.remove(&ack.id) {
                Some((_, waiter)) => {
                    let _ = waiter.send(ack.data);
                }
                None => debug!(id = ack.id, "ack with no waiter"),
            },
            Ok(Incoming::Unknown(name)) => debug!(event = %name, "ignoring unregistered event"),
            Err(e) => warn!(error = %e, "malformed realtime frame"),
        }
    }
}

/// Duplex event channel bound to the current credential.
///
/// One socket session exists at a time. It is replaced when the credential
/// changes, re-established with backoff when lost, and closed for good when the
/// credential is cleared or `disconnect` is called. Handlers outlive sessions.
pub struct RealtimeChannel {
    shared: Arc<Shared>,
    outbound: mpsc::Sender<String>,
    next_ack: AtomicU64,
    task: Option<JoinHandle<()>>,
}

impl RealtimeChannel {
    pub fn connect(settings: RealtimeSettings, credentials: &CredentialStore) -> Result<Self, ApiError> {
        let mut credential_rx = credentials.watch();
        let credential = credential_rx
            .borrow_and_update()
            .clone()
            .ok_or(ApiError::NotAuthenticated)?;

        let (outbound, outbound_rx) = mpsc::channel(settings.buffer);
        let (state, _) = watch::channel(ChannelState::Connecting);
        let shared = Arc::new(Shared {
            settings,
            registry: HandlerRegistry::new(),
            state,
            pending_acks: DashMap::new(),
            sessions: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        });

        let task = tokio::spawn(run_sessions(
            shared.clone(),
            credential,
            credential_rx,
            outbound_rx,
        ));

        Ok(Self {
            shared,
            outbound,
            next_ack: AtomicU64::new(0),
            task: Some(task),
        })
    }

    pub fn state(&self) -> ChannelState {
        *self.shared.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ChannelState> {
        self.shared.state.subscribe()
    }

    pub async fn wait_for(&self, target: ChannelState) -> Result<(), RealtimeError> {
        let mut states = self.shared.state.subscribe();
        states
            .wait_for(|state| *state == target)
            .await
            .map(|_| ())
            .map_err(|_| RealtimeError::Closed)
    }

    /// Number of socket sessions opened so far.
    pub fn sessions_opened(&self) -> u64 {
        self.shared.sessions.load(Ordering::SeqCst)
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        self.shared.registry.subscribe(kind, Arc::new(handler))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.registry.unsubscribe(id)
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.shared.registry.handler_count(kind)
    }

    pub async fn emit(&self, event: &ClientEvent) -> Result<(), RealtimeError> {
        let text = events::encode_client(event, None)?;
        self.send_text(text).await
    }

    /// Sends `event` and waits for the server's matching `ack` frame.
    pub async fn emit_with_ack(&self, event: &ClientEvent) -> Result<Value, RealtimeError> {
        let id = self.next_ack.fetch_add(1, Ordering::SeqCst) + 1;
        let text = events::encode_client(event, Some(id))?;

        let (tx, rx) = oneshot::channel();
        self.shared.pending_acks.insert(id, tx);

        if let Err(e) = self.send_text(text).await {
            self.shared.pending_acks.remove(&id);
            return Err(e);
        }

        let timeout = self.shared.settings.ack_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(_)) => Err(RealtimeError::Closed),
            Err(_) => {
                self.shared.pending_acks.remove(&id);
                warn!(id, event = event.name(), "ack timed out");
                Err(RealtimeError::AckTimeout(timeout))
            }
        }
    }

    pub async fn join_room(&self, room: Room) -> Result<(), RealtimeError> {
        self.emit(&ClientEvent::JoinRoom(room)).await
    }

    pub async fn send_message(&self, content: impl Into<String>, room: Room) -> Result<(), RealtimeError> {
        self.emit(&ClientEvent::SendMessage(OutgoingMessage {
            content: content.into(),
            room,
        }))
        .await
    }

    /// Closes the session without reconnecting.
    pub fn disconnect(&self) {
        self.shared.shutdown.cancel();
    }

    /// Closes the session and waits for the socket task to finish.
    pub async fn shutdown(mut self) {
        self.shared.shutdown.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "realtime task failed");
            }
        }
    }

    async fn send_text(&self, text: String) -> Result<(), RealtimeError> {
        if self.state() == ChannelState::Disconnected {
            return Err(RealtimeError::Closed);
        }
        self.outbound
            .send(text)
            .await
            .map_err(|_| RealtimeError::Closed)
    }
}

impl Drop for RealtimeChannel {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

enum SessionEnd {
    Shutdown,
    CredentialCleared,
    CredentialChanged(Credential),
    Lost(String),
}

enum CredentialChange {
    Replaced(Credential),
    Cleared,
}

async fn run_sessions(
    shared: Arc<Shared>,
    mut credential: Credential,
    mut credentials: watch::Receiver<Option<Credential>>,
    mut outbound: mpsc::Receiver<String>,
) {
    let settings = shared.settings.clone();
    let mut failures: u32 = 0;
    let mut backoff = false;

    loop {
        if backoff {
            if failures >= settings.max_reconnect_attempts {
                warn!(failures, "giving up on realtime reconnect");
                break;
            }
            shared.set_state(ChannelState::Reconnecting);

            let delay = backoff_delay(settings.reconnect_base, settings.reconnect_max, failures);
            debug!(?delay, failures, "waiting before reconnect");
            tokio::select! {
                _ = shared.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
                change = credential_change(&mut credentials, &credential) => match change {
                    CredentialChange::Replaced(next) => credential = next,
                    CredentialChange::Cleared => break,
                },
            }
        } else {
            shared.set_state(ChannelState::Connecting);
        }

        let opened = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            opened = open_socket(&settings.url, &credential) => opened,
        };

        let socket = match opened {
            Ok(socket) => socket,
            Err(e) => {
                failures += 1;
                backoff = true;
                warn!(error = %e, failures, "realtime connect failed");
                continue;
            }
        };

        failures = 0;
        shared.sessions.fetch_add(1, Ordering::SeqCst);
        shared.set_state(ChannelState::Connected);
        info!(url = %settings.url, "realtime connected");

        match pump(&shared, socket, &mut credentials, &credential, &mut outbound).await {
            SessionEnd::Shutdown => {
                info!("realtime channel closed");
                break;
            }
            SessionEnd::CredentialCleared => {
                info!("credential cleared, closing realtime channel");
                break;
            }
            SessionEnd::CredentialChanged(next) => {
                info!("credential changed, reopening realtime session");
                credential = next;
                backoff = false;
            }
            SessionEnd::Lost(reason) => {
                warn!(%reason, "realtime session lost");
                backoff = true;
            }
        }
    }

    // Waiters for acks that can no longer arrive see the channel as closed.
    shared.pending_acks.clear();
    shared.set_state(ChannelState::Disconnected);
}

async fn pump(
    shared: &Shared,
    socket: WsStream,
    credentials: &mut watch::Receiver<Option<Credential>>,
    current: &Credential,
    outbound: &mut mpsc::Receiver<String>,
) -> SessionEnd {
    let (mut sink, mut stream) = socket.split();

    let end = loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break SessionEnd::Shutdown,
            change = credential_change(credentials, current) => match change {
                CredentialChange::Replaced(next) => break SessionEnd::CredentialChanged(next),
                CredentialChange::Cleared => break SessionEnd::CredentialCleared,
            },
            frame = outbound.recv() => match frame {
                Some(text) => {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        break SessionEnd::Lost(e.to_string());
                    }
                }
                None => break SessionEnd::Shutdown,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => shared.handle_text(&text),
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| f.reason.to_string())
                        .unwrap_or_else(|| "closed by server".into());
                    break SessionEnd::Lost(reason);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break SessionEnd::Lost(e.to_string()),
                None => break SessionEnd::Lost("stream ended".into()),
            },
        }
    };

    if !matches!(end, SessionEnd::Lost(_)) {
        let _ = sink.send(Message::Close(None)).await;
    }
    end
}

async fn credential_change(
    credentials: &mut watch::Receiver<Option<Credential>>,
    current: &Credential,
) -> CredentialChange {
    loop {
        if credentials.changed().await.is_err() {
            return CredentialChange::Cleared;
        }
        match credentials.borrow_and_update().clone() {
            None => return CredentialChange::Cleared,
            Some(next) if next != *current => return CredentialChange::Replaced(next),
            Some(_) => {}
        }
    }
}

async fn open_socket(url: &str, credential: &Credential) -> Result<WsStream, RealtimeError> {
    let mut request = url.into_client_request()?;
    let bearer = HeaderValue::from_str(&credential.bearer())
        .map_err(|e| RealtimeError::Handshake(format!("invalid credential header: {e}")))?;
    request.headers_mut().insert(AUTHORIZATION, bearer);

    let (socket, response) = connect_async(request).await.map_err(|e| match e {
        tungstenite::Error::Http(response) => {
            RealtimeError::Handshake(format!("server answered {}", response.status()))
        }
        other => RealtimeError::Socket(other),
    })?;

    debug!(status = %response.status(), "websocket handshake complete");
    Ok(socket)
}

fn backoff_delay(base: Duration, max: Duration, failures: u32) -> Duration {
    let factor = 2u32.saturating_pow(failures.min(16));
    base.saturating_mul(factor).min(max)
}
