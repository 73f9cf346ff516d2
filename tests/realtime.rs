use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{header::AUTHORIZATION, HeaderMap},
    response::IntoResponse,
    routing::get,
    Router,
};
use feedwire::{
    credentials::{Credential, CredentialStore},
    error::RealtimeError,
    events::{ClientEvent, EventKind, OutgoingMessage, Room, ServerEvent},
    realtime::{ChannelState, RealtimeChannel, RealtimeSettings},
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
enum Command {
    Push(String),
    Close,
}

#[derive(Clone)]
struct FakeServer {
    auth_headers: Arc<Mutex<Vec<String>>>,
    received: Arc<Mutex<Vec<Value>>>,
    accepted: Arc<AtomicUsize>,
    commands: broadcast::Sender<Command>,
}

impl FakeServer {
    fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    fn push(&self, frame: Value) {
        let _ = self.commands.send(Command::Push(frame.to_string()));
    }

    fn close_all(&self) {
        let _ = self.commands.send(Command::Close);
    }
}

async fn upgrade(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(server): State<FakeServer>,
) -> impl IntoResponse {
    let auth = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    server.auth_headers.lock().push(auth);
    ws.on_upgrade(move |socket| serve(socket, server))
}

async fn serve(mut socket: WebSocket, server: FakeServer) {
    let mut commands = server.commands.subscribe();
    server.accepted.fetch_add(1, Ordering::SeqCst);

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Ok(Command::Push(text)) => {
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Ok(Command::Close) => {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
                Err(_) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let Ok(frame) = serde_json::from_str::<Value>(&text) else {
                        continue;
                    };
                    let ack = frame.get("ack").and_then(Value::as_u64);
                    server.received.lock().push(frame);
                    if let Some(id) = ack {
                        let reply = json!({"event": "ack", "data": {"id": id, "data": {"ok": true}}});
                        if socket.send(Message::Text(reply.to_string())).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}

async fn start_server() -> (String, FakeServer) {
    let (commands, _) = broadcast::channel(16);
    let server = FakeServer {
        auth_headers: Arc::default(),
        received: Arc::default(),
        accepted: Arc::default(),
        commands,
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new()
        .route("/ws", get(upgrade))
        .with_state(server.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("ws://{addr}/ws"), server)
}

fn settings(url: String) -> RealtimeSettings {
    RealtimeSettings {
        url,
        reconnect_base: Duration::from_millis(20),
        reconnect_max: Duration::from_millis(200),
        max_reconnect_attempts: 5,
        ack_timeout: Duration::from_secs(2),
        buffer: 16,
    }
}

fn store_with(token: &str) -> CredentialStore {
    let store = CredentialStore::in_memory();
    store.set(Credential::new(token));
    store
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn error_frame(message: &str) -> Value {
    json!({"event": "error", "data": {"message": message}})
}

#[tokio::test]
async fn handlers_survive_server_reconnect_without_duplicates() {
    let (url, server) = start_server().await;
    let credentials = store_with("t");
    let channel = RealtimeChannel::connect(settings(url), &credentials).unwrap();

    let seen = Arc::new(Mutex::new(Vec::<String>::new()));
    let sink = seen.clone();
    channel.subscribe(EventKind::Error, move |event| {
        if let ServerEvent::Error(notice) = event {
            sink.lock().push(notice.message.clone());
        }
    });

    eventually(|| server.accepted() == 1).await;
    server.push(error_frame("first"));
    eventually(|| seen.lock().len() == 1).await;

    server.close_all();
    eventually(|| server.accepted() == 2).await;
    channel.wait_for(ChannelState::Connected).await.unwrap();

    server.push(error_frame("second"));
    eventually(|| seen.lock().len() == 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(*seen.lock(), vec!["first".to_string(), "second".to_string()]);
    assert_eq!(channel.handler_count(EventKind::Error), 1);
    assert_eq!(channel.sessions_opened(), 2);

    channel.shutdown().await;
}

#[tokio::test]
async fn cleared_credential_closes_channel_for_good() {
    let (url, server) = start_server().await;
    let credentials = store_with("t");
    let channel = RealtimeChannel::connect(settings(url), &credentials).unwrap();

    eventually(|| server.accepted() == 1).await;
    credentials.clear();

    tokio::time::timeout(
        Duration::from_secs(5),
        channel.wait_for(ChannelState::Disconnected),
    )
    .await
    .unwrap()
    .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(server.accepted(), 1);
    let err = channel.join_room(Room::single("u2")).await.unwrap_err();
    assert!(matches!(err, RealtimeError::Closed));
}

#[tokio::test]
async fn new_credential_reopens_session_with_it() {
    let (url, server) = start_server().await;
    let credentials = store_with("first");
    let channel = RealtimeChannel::connect(settings(url), &credentials).unwrap();

    eventually(|| server.accepted() == 1).await;
    credentials.set(Credential::new("second"));
    eventually(|| server.accepted() == 2).await;
    channel.wait_for(ChannelState::Connected).await.unwrap();

    assert_eq!(
        *server.auth_headers.lock(),
        vec!["Bearer first".to_string(), "Bearer second".to_string()]
    );
    channel.shutdown().await;
}

#[tokio::test]
async fn emit_with_ack_returns_server_reply() {
    let (url, server) = start_server().await;
    let credentials = store_with("t");
    let channel = RealtimeChannel::connect(settings(url), &credentials).unwrap();
    channel.wait_for(ChannelState::Connected).await.unwrap();

    channel.join_room(Room::single("u2")).await.unwrap();
    let reply = channel
        .emit_with_ack(&ClientEvent::SendMessage(OutgoingMessage {
            content: "hi".into(),
            room: Room::single("u2"),
        }))
        .await
        .unwrap();

    assert_eq!(reply, json!({"ok": true}));
    let received = server.received.lock().clone();
    assert_eq!(received[0]["event"], "chat:join");
    assert_eq!(received[1]["event"], "chat:message");
    assert_eq!(received[1]["data"]["content"], "hi");

    channel.shutdown().await;
}

#[tokio::test]
async fn disconnect_stops_reconnecting() {
    let (url, server) = start_server().await;
    let credentials = store_with("t");
    let channel = RealtimeChannel::connect(settings(url), &credentials).unwrap();

    eventually(|| server.accepted() == 1).await;
    channel.disconnect();
    channel.wait_for(ChannelState::Disconnected).await.unwrap();
    server.close_all();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(server.accepted(), 1);
}
