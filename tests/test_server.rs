//! Whole-server tests over a loopback listener

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use streamgate::config::Config;
use streamgate::server::{AppState, listener};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, connect_async};

const WAIT: Duration = Duration::from_secs(5);

async fn unused_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr.to_string()
}

async fn echo_upstream() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Ok(mut ws) = accept_async(socket).await else {
                    return;
                };
                while let Some(Ok(msg)) = ws.next().await {
                    if msg.is_text() && ws.send(msg).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    format!("ws://{addr}")
}

async fn start_server(config: Config) -> (String, Arc<AppState>) {
    let app = Arc::new(AppState::new(config).unwrap());
    let socket = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap().to_string();
    tokio::spawn(listener::serve(socket, app.clone()));
    (addr, app)
}

async fn default_server() -> (String, Arc<AppState>) {
    let mut config = Config::default();
    config.http.upstream_url = format!("http://{}", unused_addr().await);
    config.signaling.upstream_url = format!("ws://{}", unused_addr().await);
    start_server(config).await
}

/// Send one request with `Connection: close` and return the whole reply.
async fn raw_request(addr: &str, head: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(head.as_bytes()).await.unwrap();
    let mut out = Vec::new();
    timeout(WAIT, stream.read_to_end(&mut out))
        .await
        .unwrap()
        .unwrap();
    String::from_utf8_lossy(&out).into_owned()
}

fn body_of(response: &str) -> &str {
    response.split_once("\r\n\r\n").map(|(_, b)| b).unwrap_or("")
}

#[tokio::test]
async fn test_health_endpoint() {
    let (addr, _app) = default_server().await;
    let response = raw_request(
        &addr,
        "GET /health HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    let body: serde_json::Value = serde_json::from_str(body_of(&response)).unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "streamgate");
}

#[tokio::test]
async fn test_status_endpoint() {
    let (addr, _app) = default_server().await;
    let response = raw_request(
        &addr,
        "GET /api/status HTTP/1.1\r\nConnection: close\r\n\r\n",
    )
    .await;

    let body: serde_json::Value = serde_json::from_str(body_of(&response)).unwrap();
    assert_eq!(body["active_connections"], 0);
    assert!(body["idle_seconds"].is_u64());
    assert!(body["last_activity"].as_str().unwrap().ends_with('Z'));
    assert_eq!(body["media"]["state"], "stopped");
    assert_eq!(body["media"]["subscribers"], 0);
}

#[tokio::test]
async fn test_keep_alive_serves_multiple_requests() {
    let (addr, _app) = default_server().await;
    let response = raw_request(
        &addr,
        "GET /health HTTP/1.1\r\n\r\nHEAD /health HTTP/1.1\r\nConnection: close\r\n\r\n",
    )
    .await;

    assert_eq!(response.matches("HTTP/1.1 200 OK").count(), 2);
}

#[tokio::test]
async fn test_websocket_paths_require_upgrade() {
    let (addr, _app) = default_server().await;

    for path in ["/ws/signaling", "/ws/stream"] {
        let response = raw_request(
            &addr,
            &format!("GET {path} HTTP/1.1\r\nConnection: close\r\n\r\n"),
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{path}");
    }
}

#[tokio::test]
async fn test_unreachable_upstream_is_bad_gateway() {
    let (addr, _app) = default_server().await;
    let response = raw_request(
        &addr,
        "GET /some/page?x=1 HTTP/1.1\r\nConnection: close\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
    assert!(body_of(&response).starts_with("Proxy error: "));
}

#[tokio::test]
async fn test_chunked_request_is_not_implemented() {
    let (addr, _app) = default_server().await;
    let response = raw_request(
        &addr,
        "POST /api HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n0\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 501 Not Implemented\r\n"));
}

#[tokio::test]
async fn test_malformed_request_is_bad_request() {
    let (addr, _app) = default_server().await;
    let response = raw_request(&addr, "NONSENSE\r\n\r\n").await;

    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
}

#[tokio::test]
async fn test_absolute_form_target_is_bad_request() {
    let (addr, _app) = default_server().await;
    let response = raw_request(
        &addr,
        "GET http://internal.example/admin HTTP/1.1\r\nHost: x\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert!(body_of(&response).contains("request target must start with '/'"));
}

#[tokio::test]
async fn test_signaling_upgrade_end_to_end() {
    let mut config = Config::default();
    config.http.upstream_url = format!("http://{}", unused_addr().await);
    config.signaling.upstream_url = echo_upstream().await;
    let (addr, app) = start_server(config).await;

    let (mut client, response) = connect_async(format!("ws://{addr}/ws/signaling"))
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 101);

    client.send(Message::Text("hello".into())).await.unwrap();
    let reply = timeout(WAIT, client.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(reply, Message::Text("hello".into()));
    assert_eq!(app.activity.active_sessions(), 1);

    client.close(None).await.unwrap();
    timeout(WAIT, async {
        while app.activity.active_sessions() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_shutdown_stops_accepting() {
    let (addr, app) = default_server().await;
    app.shutdown().await;

    // Give the accept loop a moment to observe cancellation
    tokio::time::sleep(Duration::from_millis(50)).await;
    let connected = TcpStream::connect(&addr).await;
    if let Ok(mut stream) = connected {
        // The listener may linger in the backlog; it must never answer
        let _ = stream.write_all(b"GET /health HTTP/1.1\r\n\r\n").await;
        let mut buf = [0u8; 16];
        let read = timeout(Duration::from_millis(300), stream.read(&mut buf)).await;
        assert!(!matches!(read, Ok(Ok(n)) if n > 0));
    }
}

#[cfg(unix)]
mod stream_viewer {
    use super::*;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

    const FTYP: &str = r"\000\000\000\020ftypisom\000\000\000\000";
    const MOOF: &str = r"\000\000\000\010moof";

    /// Server whose producer is a shell printing `boxes` and then idling.
    async fn media_server(boxes: &str, queue: usize) -> (String, Arc<AppState>) {
        let mut config = Config::default();
        config.http.upstream_url = format!("http://{}", unused_addr().await);
        config.signaling.upstream_url = format!("ws://{}", unused_addr().await);
        config.media.program = "sh".to_string();
        config.media.extra_args = Some(vec![
            "-c".to_string(),
            format!("printf '{boxes}'; exec sleep 30"),
        ]);
        config.media.idle_ping_secs = 1;
        config.media.subscriber_queue = queue;
        start_server(config).await
    }

    #[tokio::test]
    async fn test_viewer_gets_init_box_then_idle_ping() {
        let (addr, app) = media_server(FTYP, 16).await;
        let (mut viewer, _) = connect_async(format!("ws://{addr}/ws/stream"))
            .await
            .unwrap();

        match timeout(WAIT, viewer.next()).await.unwrap().unwrap().unwrap() {
            Message::Binary(data) => {
                assert_eq!(data.len(), 16);
                assert_eq!(&data[4..8], b"ftyp");
            }
            other => panic!("expected binary frame, got {other:?}"),
        }

        match timeout(WAIT, viewer.next()).await.unwrap().unwrap().unwrap() {
            Message::Text(text) => {
                let ping: serde_json::Value = serde_json::from_str(&text).unwrap();
                assert_eq!(ping["type"], "ping");
            }
            other => panic!("expected text ping, got {other:?}"),
        }
        assert_eq!(app.media.subscriber_count(), 1);

        viewer.close(None).await.unwrap();
        timeout(WAIT, async {
            while app.media.subscriber_count() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("viewer was not detached");

        app.media.stop().await;
    }

    #[tokio::test]
    async fn test_lagging_viewer_is_closed_with_policy_code() {
        // Queue of one and a burst of boxes: the reader overruns the queue
        // before the viewer task gets to drain it
        let boxes = format!("{FTYP}{}", MOOF.repeat(8));
        let (addr, app) = media_server(&boxes, 1).await;
        let (mut viewer, _) = connect_async(format!("ws://{addr}/ws/stream"))
            .await
            .unwrap();

        let frame = loop {
            match timeout(WAIT, viewer.next()).await.unwrap() {
                Some(Ok(Message::Close(frame))) => break frame,
                Some(Ok(Message::Binary(_))) => continue,
                other => panic!("expected binary or close, got {other:?}"),
            }
        };
        let frame = frame.expect("close frame without a code");
        assert_eq!(frame.code, CloseCode::Policy);
        assert_eq!(frame.reason, "viewer fell behind");
        assert_eq!(app.media.subscriber_count(), 0);

        app.media.stop().await;
    }
}
