use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use super::*;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use shared::protocol::{AttendanceMarked, ImageCaptured};
use tokio::{
    net::TcpListener,
    sync::{oneshot, Mutex},
    time::timeout,
};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct WsState {
    open: String,
    script: Arc<Vec<String>>,
    close_after_script: bool,
    connections: Arc<AtomicUsize>,
    pongs: Arc<AtomicUsize>,
    closed_tx: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

struct FakeServer {
    endpoint: Endpoint,
    connections: Arc<AtomicUsize>,
    pongs: Arc<AtomicUsize>,
    closed: oneshot::Receiver<()>,
}

fn open_packet(ping_interval_ms: u64, ping_timeout_ms: u64) -> String {
    format!(
        r#"0{{"sid":"eio-sid","upgrades":[],"pingInterval":{ping_interval_ms},"pingTimeout":{ping_timeout_ms},"maxPayload":1000000}}"#
    )
}

fn frame(image: &str) -> String {
    format!(r#"42["camera_frame",{{"image":"{image}"}}]"#)
}

fn marked(name: &str) -> String {
    format!(
        r#"42["attendance_marked",{{"student_id":1,"name":"{name}","timestamp":"2024-03-01T09:00:00"}}]"#
    )
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<WsState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_session(state, socket))
}

async fn ws_session(state: WsState, mut socket: WebSocket) {
    state.connections.fetch_add(1, Ordering::SeqCst);
    if socket.send(WsMessage::Text(state.open.clone())).await.is_err() {
        return;
    }
    loop {
        match socket.recv().await {
            Some(Ok(WsMessage::Text(text))) if text == "40" => break,
            Some(Ok(_)) => continue,
            _ => return,
        }
    }
    let joined = WsMessage::Text(r#"40{"sid":"namespace-sid"}"#.to_string());
    if socket.send(joined).await.is_err() {
        return;
    }
    for text in state.script.iter() {
        if socket.send(WsMessage::Text(text.clone())).await.is_err() {
            return;
        }
    }
    if state.close_after_script {
        let _ = socket.send(WsMessage::Text("41".to_string())).await;
        return;
    }
    while let Some(Ok(msg)) = socket.recv().await {
        if matches!(msg, WsMessage::Text(ref text) if text == "3") {
            state.pongs.fetch_add(1, Ordering::SeqCst);
        }
    }
    if let Some(tx) = state.closed_tx.lock().await.take() {
        let _ = tx.send(());
    }
}

async fn spawn_socket_io_server(
    open: String,
    script: Vec<String>,
    close_after_script: bool,
) -> FakeServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (closed_tx, closed) = oneshot::channel();
    let connections = Arc::new(AtomicUsize::new(0));
    let pongs = Arc::new(AtomicUsize::new(0));
    let state = WsState {
        open,
        script: Arc::new(script),
        close_after_script,
        connections: Arc::clone(&connections),
        pongs: Arc::clone(&pongs),
        closed_tx: Arc::new(Mutex::new(Some(closed_tx))),
    };
    let app = Router::new()
        .route("/socket.io/", get(ws_handler))
        .with_state(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    FakeServer {
        endpoint: Endpoint::parse(&format!("http://{addr}")).expect("endpoint"),
        connections,
        pongs,
        closed,
    }
}

async fn spawn_ws_server(script: Vec<String>, close_after_script: bool) -> FakeServer {
    spawn_socket_io_server(open_packet(25_000, 20_000), script, close_after_script).await
}

fn fast_policy(max_attempts: u32) -> ReconnectPolicy {
    ReconnectPolicy {
        initial_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        max_attempts,
    }
}

#[test]
fn backoff_doubles_until_capped() {
    let policy = ReconnectPolicy::default();
    assert_eq!(policy.delay_for(1), Duration::from_millis(500));
    assert_eq!(policy.delay_for(2), Duration::from_millis(1000));
    assert_eq!(policy.delay_for(4), Duration::from_millis(4000));
    assert_eq!(policy.delay_for(6), Duration::from_secs(10));
    assert_eq!(policy.delay_for(60), Duration::from_secs(10));
}

#[tokio::test]
async fn events_fan_out_and_only_latest_frame_is_kept() {
    let script = vec![
        frame("first"),
        frame("second"),
        marked("ASHA"),
        "not a packet".to_string(),
        r#"42["card_scanned",{"card_id":"7"}]"#.to_string(),
        r#"42/admin,["attendance_marked",{"name":"NOBODY","timestamp":"2024-03-01T09:00:00"}]"#
            .to_string(),
        r#"42["image_captured",{"success":true}]"#.to_string(),
    ];
    let server = spawn_ws_server(script, false).await;

    let channel = LiveChannel::open(&server.endpoint, fast_policy(0));
    let mut events = channel.subscribe();
    let frames = channel.frames();

    let first = timeout(WAIT, events.recv()).await.expect("wait").expect("event");
    assert!(matches!(
        first,
        ServerEvent::AttendanceMarked(AttendanceMarked { ref name, .. }) if name == "ASHA"
    ));

    let second = timeout(WAIT, events.recv()).await.expect("wait").expect("event");
    assert_eq!(
        second,
        ServerEvent::ImageCaptured(ImageCaptured {
            success: true,
            card_id: None
        })
    );

    let latest = frames.borrow().clone();
    assert_eq!(latest.map(|frame| frame.image), Some("second".to_string()));
    assert_eq!(*channel.status().borrow(), ChannelStatus::Connected);
}

#[tokio::test]
async fn answers_server_pings() {
    let server = spawn_ws_server(vec!["2".to_string(), marked("ASHA")], false).await;

    let channel = LiveChannel::open(&server.endpoint, fast_policy(0));
    let mut events = channel.subscribe();
    timeout(WAIT, events.recv()).await.expect("wait").expect("event");

    timeout(WAIT, async {
        while server.pongs.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("pong");
    assert_eq!(*channel.status().borrow(), ChannelStatus::Connected);
}

#[tokio::test]
async fn reconnects_after_server_disconnects() {
    let server = spawn_ws_server(vec![marked("RAVI")], true).await;

    let channel = LiveChannel::open(&server.endpoint, fast_policy(5));
    let mut events = channel.subscribe();

    for _ in 0..2 {
        let event = timeout(WAIT, events.recv()).await.expect("wait").expect("event");
        assert!(matches!(event, ServerEvent::AttendanceMarked(_)));
    }
    assert!(server.connections.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn silent_server_is_treated_as_gone() {
    let server = spawn_socket_io_server(open_packet(20, 20), vec![marked("RAVI")], false).await;

    let channel = LiveChannel::open(&server.endpoint, fast_policy(5));
    let mut events = channel.subscribe();

    for _ in 0..2 {
        let event = timeout(WAIT, events.recv()).await.expect("wait").expect("event");
        assert!(matches!(event, ServerEvent::AttendanceMarked(_)));
    }
    assert!(server.connections.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn gives_up_after_bounded_attempts() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    let endpoint = Endpoint::parse(&format!("http://{addr}")).expect("endpoint");

    let channel = LiveChannel::open(&endpoint, fast_policy(2));
    let mut status = channel.status();
    let mut seen_reconnecting = false;
    timeout(WAIT, async {
        loop {
            match *status.borrow_and_update() {
                ChannelStatus::Reconnecting { .. } => seen_reconnecting = true,
                ChannelStatus::Closed => break,
                _ => {}
            }
            if status.changed().await.is_err() {
                break;
            }
        }
    })
    .await
    .expect("channel closes");
    assert!(seen_reconnecting);
    assert_eq!(*status.borrow(), ChannelStatus::Closed);
}

#[tokio::test]
async fn dropping_the_channel_closes_the_connection() {
    let server = spawn_ws_server(vec![marked("ASHA")], false).await;

    let channel = LiveChannel::open(&server.endpoint, fast_policy(0));
    let mut events = channel.subscribe();
    timeout(WAIT, events.recv()).await.expect("wait").expect("event");
    let status = channel.status();

    channel.close();

    timeout(WAIT, server.closed)
        .await
        .expect("server saw close")
        .expect("signal");
    assert_eq!(*status.borrow(), ChannelStatus::Closed);
    assert_eq!(server.connections.load(Ordering::SeqCst), 1);
}
