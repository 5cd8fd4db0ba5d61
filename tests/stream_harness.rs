use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use fshttpstream_sdk::stream::proto::{EventHeaders, END_OF_FILTERS, PING_EVENT};
use fshttpstream_sdk::{
    callbacks, ConnectionState, SessionEvent, StreamClient, StreamOptions, StreamSession,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;

const TEST_FILTERS: [&str; 2] = ["Event-Name: CHANNEL_ANSWER", "Event-Name: HEARTBEAT"];

#[derive(Debug, PartialEq)]
enum Observed {
    Open(ConnectionState),
    Message(String),
    Close(ConnectionState),
}

#[derive(Debug)]
struct ServerObserved {
    filters: Vec<String>,
    client_closed: bool,
}

#[derive(Clone)]
struct WsState {
    events: Vec<String>,
    close_after_events: bool,
    observed_tx: Arc<Mutex<Option<oneshot::Sender<Result<ServerObserved, String>>>>>,
}

impl WsState {
    fn new(
        events: Vec<String>,
        close_after_events: bool,
    ) -> (Self, oneshot::Receiver<Result<ServerObserved, String>>) {
        let (observed_tx, observed_rx) = oneshot::channel();
        let state = Self {
            events,
            close_after_events,
            observed_tx: Arc::new(Mutex::new(Some(observed_tx))),
        };
        (state, observed_rx)
    }
}

fn answer_event() -> String {
    let headers: EventHeaders = [
        ("Event-Name", "CHANNEL_ANSWER"),
        ("Unique-ID", "0b9cbd3e-5d2a-4b8f-9a53-6c1f3f0d4e21"),
        ("Caller-Caller-ID-Number", "1000"),
    ]
    .into_iter()
    .map(|(name, value)| (name.to_string(), json!(value)))
    .collect();
    headers.to_text().expect("encode event headers")
}

fn options_for(addr: SocketAddr) -> StreamOptions {
    StreamOptions::new(addr.ip().to_string())
        .with_port(addr.port().to_string())
        .with_filters(TEST_FILTERS)
        .with_connect_timeout(Some(Duration::from_secs(2)))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stream_client_sends_filters_then_forwards_raw_messages() {
    let events = vec![PING_EVENT.to_string(), answer_event(), "not json".to_string()];
    let (ws_state, observed_rx) = WsState::new(events.clone(), true);
    let (addr, shutdown_tx, server_task) = spawn_server(ws_router(ws_state)).await;

    let (observed_tx, mut observed) = mpsc::unbounded_channel();
    let on_message_tx = observed_tx.clone();
    let on_open_tx = observed_tx.clone();
    let client = StreamClient::connect(
        options_for(addr),
        callbacks(
            move |_, payload| {
                let _ = on_message_tx.send(Observed::Message(payload));
            },
            move |client| {
                let _ = on_open_tx.send(Observed::Open(client.state()));
            },
            move |client| {
                let _ = observed_tx.send(Observed::Close(client.state()));
            },
        ),
    )
    .expect("connect stream client to mock ws server");

    assert_eq!(client.url(), format!("ws://{addr}/websock"));
    assert_eq!(client.address(), addr.to_string());
    assert_eq!(client.mode_label(), "WebSocket");

    let mut seen = Vec::new();
    while let Some(event) = timeout(Duration::from_secs(2), observed.recv())
        .await
        .expect("timed out waiting for client callback")
    {
        let closed = matches!(event, Observed::Close(_));
        seen.push(event);
        if closed {
            break;
        }
    }

    let mut expected = vec![Observed::Open(ConnectionState::Connected)];
    expected.extend(events.into_iter().map(Observed::Message));
    expected.push(Observed::Close(ConnectionState::Disconnected));
    assert_eq!(seen, expected);
    assert_eq!(client.state(), ConnectionState::Disconnected);

    let server = timeout(Duration::from_secs(2), observed_rx)
        .await
        .expect("timed out waiting for ws server observations")
        .expect("ws observation channel closed")
        .expect("ws protocol assertions failed");
    assert_eq!(server.filters, TEST_FILTERS);

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock ws server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stream_session_decodes_events_and_drops_malformed_payloads() {
    let events = vec![
        PING_EVENT.to_string(),
        "{\"Event-Name\": ".to_string(),
        answer_event(),
    ];
    let (ws_state, observed_rx) = WsState::new(events, true);
    let (addr, shutdown_tx, server_task) = spawn_server(ws_router(ws_state)).await;

    let mut session = StreamSession::connect(options_for(addr)).expect("connect session");

    let mut received = Vec::new();
    while let Some(event) = timeout(Duration::from_secs(2), session.recv())
        .await
        .expect("timed out waiting for session event")
    {
        received.push(event);
    }

    assert_eq!(received.len(), 4, "unexpected events: {received:?}");
    assert_eq!(received[0], SessionEvent::Opened);
    assert_eq!(received[1], SessionEvent::Ping);
    let SessionEvent::Event(headers) = &received[2] else {
        panic!("expected decoded event, got {:?}", received[2]);
    };
    assert_eq!(headers.event_name(), Some("CHANNEL_ANSWER"));
    assert_eq!(headers.get("Caller-Caller-ID-Number"), Some("1000"));
    assert_eq!(received[3], SessionEvent::Closed);

    let server = timeout(Duration::from_secs(2), observed_rx)
        .await
        .expect("timed out waiting for ws server observations")
        .expect("ws observation channel closed")
        .expect("ws protocol assertions failed");
    assert_eq!(server.filters, TEST_FILTERS);

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock ws server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stream_session_close_disconnects_from_server() {
    let (ws_state, observed_rx) = WsState::new(vec![answer_event()], false);
    let (addr, shutdown_tx, server_task) = spawn_server(ws_router(ws_state)).await;

    let mut session = StreamSession::connect(options_for(addr)).expect("connect session");
    let headers = timeout(Duration::from_secs(2), session.next_event())
        .await
        .expect("timed out waiting for event")
        .expect("event before close");
    assert_eq!(headers.event_name(), Some("CHANNEL_ANSWER"));
    assert!(session.client().is_connected());

    session.close();
    let closed = timeout(Duration::from_secs(2), session.recv())
        .await
        .expect("timed out waiting for close");
    assert_eq!(closed, Some(SessionEvent::Closed));
    assert!(!session.client().is_connected());

    let server = timeout(Duration::from_secs(2), observed_rx)
        .await
        .expect("timed out waiting for ws server observations")
        .expect("ws observation channel closed")
        .expect("ws protocol assertions failed");
    assert!(server.client_closed, "server should observe client close");

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock ws server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_endpoint_closes_without_opening() {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind unused listener");
    let addr = listener.local_addr().expect("unused listener address");
    drop(listener);

    let mut session = StreamSession::connect(options_for(addr)).expect("connect session");
    let first = timeout(Duration::from_secs(3), session.recv())
        .await
        .expect("timed out waiting for close");
    assert_eq!(first, Some(SessionEvent::Closed));
    assert_eq!(session.recv().await, None);
}

fn ws_router(state: WsState) -> Router {
    Router::new()
        .route("/websock", get(ws_handler))
        .with_state(state)
}

async fn ws_handler(State(state): State<WsState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let result = run_stream_protocol(socket, state.events, state.close_after_events).await;
        if let Some(tx) = state.observed_tx.lock().await.take() {
            let _ = tx.send(result);
        }
    })
}

async fn run_stream_protocol(
    mut socket: WebSocket,
    events: Vec<String>,
    close_after_events: bool,
) -> Result<ServerObserved, String> {
    let mut filters = Vec::new();
    loop {
        match recv_text(&mut socket).await? {
            Some(text) if text == END_OF_FILTERS => break,
            Some(text) => filters.push(text),
            None => return Err("websocket closed before EOF".to_string()),
        }
    }

    for payload in events {
        socket
            .send(Message::Text(payload))
            .await
            .map_err(|err| format!("failed to send event: {err}"))?;
    }

    if close_after_events {
        socket
            .send(Message::Close(Some(CloseFrame {
                code: 1000,
                reason: "done".into(),
            })))
            .await
            .map_err(|err| format!("failed to send close: {err}"))?;
        return Ok(ServerObserved {
            filters,
            client_closed: false,
        });
    }

    match recv_text(&mut socket).await? {
        None => Ok(ServerObserved {
            filters,
            client_closed: true,
        }),
        Some(text) => Err(format!("unexpected client message after EOF: {text}")),
    }
}

async fn recv_text(socket: &mut WebSocket) -> Result<Option<String>, String> {
    loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) => return Ok(Some(text)),
            Some(Ok(Message::Ping(payload))) => {
                socket
                    .send(Message::Pong(payload))
                    .await
                    .map_err(|err| format!("failed to send pong: {err}"))?;
            }
            Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) | None => return Ok(None),
            Some(Ok(_)) => return Err("received unexpected non-text websocket frame".to_string()),
            Some(Err(err)) => return Err(format!("websocket receive error: {err}")),
        }
    }
}

async fn spawn_server(
    app: Router,
) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server listener");
    let addr = listener
        .local_addr()
        .expect("read mock server listener address");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("mock server should run");
    });
    (addr, shutdown_tx, task)
}
