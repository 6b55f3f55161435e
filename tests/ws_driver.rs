//! Loopback tests for the tokio/WebSocket driver.

#![cfg(feature = "runtime")]

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use framescope::client::ws::StreamDriver;
use framescope::client::{
    ConnectionState, ReconnectPolicy, RECONNECT_EXHAUSTED_MESSAGE, TRANSPORT_ERROR_MESSAGE,
};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

const FRAME: &str = r#"{"type":"frame","data":{"timestamp":1700000000000,"width":1920,"height":1080,"fps":29.5,"processingMode":0,"processingTime":4.0}}"#;
const STATS: &str = r#"{"type":"stats","data":{"averageFPS":20,"maxFPS":30,"minFPS":10,"averageProcessingTime":9,"totalFrames":42,"uptime":1000}}"#;

#[derive(Debug, Clone, PartialEq)]
enum Seen {
    Connection(bool),
    Frame(u32),
    Stats(u64),
    Error(String),
}

type Log = Rc<RefCell<Vec<Seen>>>;

fn driver(url: String, policy: ReconnectPolicy) -> (StreamDriver, Log) {
    let mut driver = StreamDriver::new(url, policy);
    let seen: Log = Rc::new(RefCell::new(Vec::new()));
    let client = driver.client_mut();

    let log = Rc::clone(&seen);
    client.on_frame(move |f| log.borrow_mut().push(Seen::Frame(f.width)));
    let log = Rc::clone(&seen);
    client.on_stats(move |s| log.borrow_mut().push(Seen::Stats(s.total_frames)));
    let log = Rc::clone(&seen);
    client.on_error(move |e| log.borrow_mut().push(Seen::Error(e.to_string())));
    let log = Rc::clone(&seen);
    client.on_connection(move |c| log.borrow_mut().push(Seen::Connection(c)));

    (driver, seen)
}

async fn pump_until(driver: &mut StreamDriver, seen: &Log, done: impl Fn(&[Seen]) -> bool) {
    let pumped = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if done(&seen.borrow()) {
                break;
            }
            let event = driver.recv().await.expect("driver channel open");
            driver.dispatch(event);
        }
    })
    .await;
    assert!(pumped.is_ok(), "timed out; saw {:?}", seen.borrow());
}

async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

fn fast_policy(max_attempts: u32, base_ms: u64) -> ReconnectPolicy {
    ReconnectPolicy {
        max_attempts,
        base_delay: Duration::from_millis(base_ms),
    }
}

#[tokio::test]
async fn receives_frames_and_recovers_from_server_close() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        ws.send(Message::Text(
            r#"{"type":"info","data":"welcome"}"#.to_string().into(),
        ))
        .await
        .unwrap();
        ws.send(Message::Text(FRAME.to_string().into())).await.unwrap();
        ws.close(None).await.unwrap();
        while let Some(Ok(_)) = ws.next().await {}

        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        ws.send(Message::Text(STATS.to_string().into())).await.unwrap();
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return text.as_str().to_owned(),
                Some(Ok(_)) => continue,
                other => panic!("expected a command, got {other:?}"),
            }
        }
    });

    let (mut driver, seen) = driver(format!("ws://{addr}/ws"), fast_policy(5, 20));
    driver.client_mut().connect();

    pump_until(&mut driver, &seen, |s| s.contains(&Seen::Stats(42))).await;
    assert_eq!(
        *seen.borrow(),
        [
            Seen::Connection(true),
            Seen::Frame(1920),
            Seen::Connection(false),
            Seen::Connection(true),
            Seen::Stats(42),
        ]
    );
    assert!(driver.client().is_connected());
    assert_eq!(driver.client().reconnect_attempts(), 0);

    assert!(driver
        .client_mut()
        .send(&serde_json::json!({"command": "setMode", "mode": 1})));
    let received = tokio::time::timeout(Duration::from_secs(10), server)
        .await
        .expect("server finished")
        .unwrap();
    assert_eq!(received, r#"{"command":"setMode","mode":1}"#);

    driver.client_mut().disconnect();
    assert_eq!(driver.client().state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn gives_up_after_max_attempts() {
    let addr = closed_port().await;
    let (mut driver, seen) = driver(format!("ws://{addr}/ws"), fast_policy(2, 10));
    driver.client_mut().connect();

    let exhausted = Seen::Error(RECONNECT_EXHAUSTED_MESSAGE.to_string());
    pump_until(&mut driver, &seen, |s| s.contains(&exhausted)).await;

    let seen = seen.borrow();
    let count = |needle: &Seen| seen.iter().filter(|s| *s == needle).count();
    assert_eq!(count(&exhausted), 1);
    assert_eq!(count(&Seen::Connection(false)), 3);
    assert_eq!(
        count(&Seen::Error(TRANSPORT_ERROR_MESSAGE.to_string())),
        3
    );
    assert_eq!(driver.client().state(), ConnectionState::Disconnected);
    assert!(!driver.client().has_pending_retry());
    assert_eq!(driver.client().reconnect_attempts(), 2);
}

#[tokio::test]
async fn disconnect_cancels_scheduled_reconnect() {
    let addr = closed_port().await;
    let (mut driver, seen) = driver(format!("ws://{addr}/ws"), fast_policy(5, 200));
    driver.client_mut().connect();

    pump_until(&mut driver, &seen, |s| s.contains(&Seen::Connection(false))).await;
    assert!(driver.client().has_pending_retry());

    driver.client_mut().disconnect();
    assert!(!driver.client().has_pending_retry());

    // Nothing is left to fire: the retry timer was aborted and the failed
    // session has already reported its close.
    let idle = tokio::time::timeout(Duration::from_millis(600), driver.recv()).await;
    assert!(idle.is_err(), "unexpected event {idle:?}");
    assert_eq!(driver.client().state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn invalid_url_is_reported_without_retry() {
    let (mut driver, seen) = driver("definitely not a url".to_string(), fast_policy(5, 10));
    driver.client_mut().connect();

    assert_eq!(
        *seen.borrow(),
        [Seen::Error(
            framescope::client::CONNECT_FAILED_MESSAGE.to_string()
        )]
    );
    assert_eq!(driver.client().state(), ConnectionState::Disconnected);
    assert!(!driver.client().has_pending_retry());
}

#[tokio::test]
async fn run_disconnects_when_shutdown_fires() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        while let Some(Ok(_)) = ws.next().await {}
    });

    let (mut driver, seen) = driver(format!("ws://{addr}/ws"), fast_policy(5, 20));
    let shutdown = CancellationToken::new();

    let cancel = shutdown.clone();
    let log = Rc::clone(&seen);
    let cancel_once_connected = async move {
        while !log.borrow().contains(&Seen::Connection(true)) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
    };

    let finished = tokio::time::timeout(Duration::from_secs(10), async {
        tokio::join!(driver.run(shutdown), cancel_once_connected)
    })
    .await;
    assert!(finished.is_ok(), "timed out; saw {:?}", seen.borrow());

    assert_eq!(
        *seen.borrow(),
        [Seen::Connection(true), Seen::Connection(false)]
    );
    assert_eq!(driver.client().state(), ConnectionState::Disconnected);
    assert!(!driver.client().has_pending_retry());
    assert_eq!(driver.client().reconnect_attempts(), 0);
}
