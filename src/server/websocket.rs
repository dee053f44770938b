//! WebSocket handshake and the media viewer endpoint

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{Instant, sleep};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use crate::http::request::Request;
use crate::http::response::{Response, ResponseBuilder, StatusCode};
use crate::media::Subscription;
use crate::proxy::signaling::close_frame;
use crate::server::AppState;

/// Application-level keep-alive sent to idle viewers
pub const VIEWER_PING: &str = r#"{"type":"ping"}"#;

/// `Sec-WebSocket-Accept` value for a valid RFC 6455 upgrade request.
pub fn accept_key(req: &Request) -> Option<String> {
    if !req.is_websocket_upgrade() {
        return None;
    }
    if req.header("Sec-WebSocket-Version").map(str::trim) != Some("13") {
        return None;
    }
    let key = req.header("Sec-WebSocket-Key")?.trim();
    if key.is_empty() {
        return None;
    }
    Some(derive_accept_key(key.as_bytes()))
}

/// `101 Switching Protocols` for a valid upgrade request.
pub fn switching_protocols(req: &Request) -> Option<Response> {
    let accept = accept_key(req)?;
    Some(
        ResponseBuilder::new(StatusCode::SWITCHING_PROTOCOLS)
            .header("Upgrade", "websocket")
            .header("Connection", "Upgrade")
            .header("Sec-WebSocket-Accept", accept)
            .build(),
    )
}

/// Attach one viewer to the broadcast and stream boxes to it until either
/// side goes away.
pub async fn serve_stream_viewer<S>(mut ws: WebSocketStream<S>, app: &AppState)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    app.activity.touch();

    let subscription = match app.media.attach().await {
        Ok(subscription) => subscription,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start media stream");
            let _ = ws
                .close(Some(close_frame(CloseCode::Error, &e.to_string())))
                .await;
            return;
        }
    };
    let id = subscription.id();

    if let Err(e) = relay_to_viewer(ws, subscription, app).await {
        tracing::debug!(subscriber = id, error = %format!("{e:#}"), "Viewer stream ended");
    }

    app.media.detach(id);
    app.activity.touch();
}

async fn relay_to_viewer<S>(
    ws: WebSocketStream<S>,
    mut subscription: Subscription,
    app: &AppState,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let id = subscription.id();
    let idle_ping = app.config.media.idle_ping();
    let (mut tx, mut rx) = ws.split();
    let idle = sleep(idle_ping);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            data = subscription.recv() => match data {
                Some(data) => {
                    tx.send(Message::Binary(data.to_vec()))
                        .await
                        .context("Viewer send failed")?;
                    idle.as_mut().reset(Instant::now() + idle_ping);
                }
                None => {
                    // Dropped by the broadcaster after a failed delivery
                    tracing::info!(
                        subscriber = id,
                        subscribers = app.media.subscriber_count(),
                        "Viewer fell behind, closing"
                    );
                    let _ = tx
                        .send(Message::Close(Some(close_frame(
                            CloseCode::Policy,
                            "viewer fell behind",
                        ))))
                        .await;
                    return Ok(());
                }
            },
            msg = rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    tracing::debug!(subscriber = id, message = %text, "Viewer message");
                }
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Err(e)) => return Err(e).context("Viewer receive failed"),
                Some(Ok(_)) => {}
            },
            _ = &mut idle => {
                tx.send(Message::Text(VIEWER_PING.to_string()))
                    .await
                    .context("Viewer ping failed")?;
                idle.as_mut().reset(Instant::now() + idle_ping);
            }
            _ = app.shutdown.cancelled() => {
                let _ = tx
                    .send(Message::Close(Some(close_frame(
                        CloseCode::Away,
                        "server shutting down",
                    ))))
                    .await;
                return Ok(());
            }
        }
    }
}
