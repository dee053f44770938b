//! Duplex WebSocket relay to the internal signaling endpoint
//!
//! Each inbound WebSocket gets exactly one outbound connection. Messages are
//! relayed verbatim in both directions until either side closes, either
//! side errors, or the process shuts down. The proxy never looks inside the
//! payloads.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep_until, timeout};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{
    Connector, MaybeTlsStream, WebSocketStream, connect_async_tls_with_config,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::activity::{ActivityTracker, SessionId};
use crate::config::SignalingConfig;

/// Longest reason a close frame can carry
const MAX_CLOSE_REASON: usize = 123;

/// How long teardown waits to deliver each close frame
const CLOSE_GRACE: Duration = Duration::from_secs(2);

type UpstreamSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// How a session ended, from the proxy's point of view
#[derive(Debug)]
pub enum SessionEnd {
    /// The outbound connection could not be established
    ConnectFailed(anyhow::Error),
    /// The client closed (or dropped) its connection
    ClientClosed,
    /// The internal endpoint closed its connection
    UpstreamClosed,
    /// A relay leg failed
    Failed(anyhow::Error),
    /// The process is shutting down
    Shutdown,
}

impl SessionEnd {
    /// Close frames sent to (client, upstream) when the session is torn down.
    fn close_frames(&self) -> (CloseFrame<'static>, CloseFrame<'static>) {
        match self {
            SessionEnd::ClientClosed => (
                close_frame(CloseCode::Normal, "client closed"),
                close_frame(CloseCode::Normal, "client closed"),
            ),
            SessionEnd::UpstreamClosed => (
                close_frame(CloseCode::Normal, "upstream closed"),
                close_frame(CloseCode::Normal, "upstream closed"),
            ),
            SessionEnd::ConnectFailed(e) | SessionEnd::Failed(e) => {
                let reason = format!("{e:#}");
                (
                    close_frame(CloseCode::Error, &reason),
                    close_frame(CloseCode::Error, &reason),
                )
            }
            SessionEnd::Shutdown => (
                close_frame(CloseCode::Away, "server shutting down"),
                close_frame(CloseCode::Away, "server shutting down"),
            ),
        }
    }
}

/// Build a close frame, truncating the reason at a character boundary.
pub fn close_frame(code: CloseCode, reason: &str) -> CloseFrame<'static> {
    let mut end = reason.len().min(MAX_CLOSE_REASON);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    CloseFrame {
        code,
        reason: Cow::Owned(reason[..end].to_string()),
    }
}

/// Outbound keep-alive probing parameters
#[derive(Debug, Clone, Copy)]
struct Keepalive {
    interval: Duration,
    timeout: Duration,
}

/// Removes the session from the tracker however the session future ends,
/// including cancellation.
struct SessionGuard<'a> {
    id: SessionId,
    activity: &'a ActivityTracker,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.activity.unregister(self.id);
        self.activity.touch();
    }
}

pub struct SignalingProxy {
    config: SignalingConfig,
    connector: Connector,
    activity: Arc<ActivityTracker>,
    shutdown: CancellationToken,
}

impl SignalingProxy {
    pub fn new(
        config: SignalingConfig,
        activity: Arc<ActivityTracker>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        // The internal endpoint uses a self-signed certificate
        let tls = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
            .context("Failed to build TLS connector")?;

        Ok(Self {
            config,
            connector: Connector::NativeTls(tls),
            activity,
            shutdown,
        })
    }

    /// Relay one inbound WebSocket until the session ends.
    pub async fn serve<S>(&self, inbound: WebSocketStream<S>) -> SessionEnd
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let id = Uuid::new_v4();
        let started = Instant::now();

        self.activity.register(id);
        let _guard = SessionGuard {
            id,
            activity: &self.activity,
        };
        self.activity.touch();

        tracing::info!(
            session_id = %id,
            active = self.activity.active_sessions(),
            "Signaling session opened"
        );

        let end = self.run_session(id, inbound).await;

        match &end {
            SessionEnd::ConnectFailed(e) | SessionEnd::Failed(e) => tracing::error!(
                session_id = %id,
                error = %format!("{e:#}"),
                duration_ms = started.elapsed().as_millis() as u64,
                "Signaling session failed"
            ),
            other => tracing::info!(
                session_id = %id,
                end = ?other,
                duration_ms = started.elapsed().as_millis() as u64,
                "Signaling session closed"
            ),
        }

        end
    }

    async fn connect_upstream(&self) -> Result<UpstreamSocket> {
        let (socket, _response) = timeout(
            self.config.connect_timeout(),
            connect_async_tls_with_config(
                self.config.upstream_url.as_str(),
                None,
                true,
                Some(self.connector.clone()),
            ),
        )
        .await
        .context("Signaling connect timeout")?
        .with_context(|| format!("Failed to connect to {}", self.config.upstream_url))?;

        Ok(socket)
    }

    async fn run_session<S>(&self, id: SessionId, mut inbound: WebSocketStream<S>) -> SessionEnd
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let upstream = tokio::select! {
            res = self.connect_upstream() => res,
            _ = self.shutdown.cancelled() => {
                let (client_frame, _) = SessionEnd::Shutdown.close_frames();
                let _ = inbound.close(Some(client_frame)).await;
                return SessionEnd::Shutdown;
            }
        };

        let upstream = match upstream {
            Ok(socket) => socket,
            Err(e) => {
                let end = SessionEnd::ConnectFailed(e);
                let (client_frame, _) = end.close_frames();
                let _ = inbound.close(Some(client_frame)).await;
                return end;
            }
        };

        tracing::debug!(
            session_id = %id,
            upstream = %self.config.upstream_url,
            "Connected to signaling upstream"
        );

        let (mut client_tx, mut client_rx) = inbound.split();
        let (mut upstream_tx, mut upstream_rx) = upstream.split();
        let (pong_tx, pong_rx) = watch::channel(Instant::now());
        let keepalive = Keepalive {
            interval: self.config.ping_interval(),
            timeout: self.config.ping_timeout(),
        };

        // Whichever leg finishes first ends the session; dropping the other
        // future cancels its pending receive or send
        let end = tokio::select! {
            res = client_to_upstream(
                &mut client_rx,
                &mut upstream_tx,
                pong_rx,
                keepalive,
                &self.activity,
            ) => match res {
                Ok(()) => SessionEnd::ClientClosed,
                Err(e) => SessionEnd::Failed(e.context("client -> upstream")),
            },
            res = upstream_to_client(
                &mut upstream_rx,
                &mut client_tx,
                pong_tx,
                &self.activity,
            ) => match res {
                Ok(()) => SessionEnd::UpstreamClosed,
                Err(e) => SessionEnd::Failed(e.context("upstream -> client")),
            },
            _ = self.shutdown.cancelled() => SessionEnd::Shutdown,
        };

        let (client_frame, upstream_frame) = end.close_frames();
        // Either side may already be gone or stalled; failures are ignored
        let _ = timeout(CLOSE_GRACE, async {
            let _ = client_tx.send(Message::Close(Some(client_frame))).await;
            let _ = client_tx.close().await;
        })
        .await;
        let _ = timeout(CLOSE_GRACE, async {
            let _ = upstream_tx.send(Message::Close(Some(upstream_frame))).await;
            let _ = upstream_tx.close().await;
        })
        .await;

        end
    }
}

/// Data frames are relayed; control frames are handled by each socket.
fn is_payload(msg: &Message) -> bool {
    matches!(msg, Message::Text(_) | Message::Binary(_))
}

async fn client_to_upstream<R, W>(
    client_rx: &mut R,
    upstream_tx: &mut W,
    mut pong_rx: watch::Receiver<Instant>,
    keepalive: Keepalive,
    activity: &ActivityTracker,
) -> Result<()>
where
    R: Stream<Item = Result<Message, WsError>> + Unpin,
    W: Sink<Message, Error = WsError> + Unpin,
{
    let mut ping = interval_at(Instant::now() + keepalive.interval, keepalive.interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut awaiting_pong: Option<Instant> = None;

    loop {
        tokio::select! {
            msg = client_rx.next() => match msg {
                None | Some(Ok(Message::Close(_))) => return Ok(()),
                Some(Err(e)) => return Err(e).context("Client receive failed"),
                Some(Ok(msg)) if is_payload(&msg) => {
                    activity.touch();
                    // An upstream that stops reading stalls the send
                    timeout(keepalive.timeout, upstream_tx.send(msg))
                        .await
                        .map_err(|_| anyhow::anyhow!("upstream send timeout"))?
                        .context("Upstream send failed")?;
                }
                Some(Ok(_)) => {}
            },
            _ = ping.tick() => {
                if awaiting_pong.is_none() {
                    timeout(keepalive.timeout, upstream_tx.send(Message::Ping(Vec::new())))
                        .await
                        .map_err(|_| anyhow::anyhow!("keepalive ping timeout"))?
                        .context("Upstream ping failed")?;
                    awaiting_pong = Some(Instant::now());
                }
            }
            Ok(()) = pong_rx.changed() => {
                awaiting_pong = None;
            }
            _ = pong_deadline(awaiting_pong, keepalive.timeout) => {
                anyhow::bail!("keepalive ping timeout");
            }
        }
    }
}

async fn upstream_to_client<R, W>(
    upstream_rx: &mut R,
    client_tx: &mut W,
    pong_tx: watch::Sender<Instant>,
    activity: &ActivityTracker,
) -> Result<()>
where
    R: Stream<Item = Result<Message, WsError>> + Unpin,
    W: Sink<Message, Error = WsError> + Unpin,
{
    loop {
        match upstream_rx.next().await {
            None | Some(Ok(Message::Close(_))) => return Ok(()),
            Some(Err(e)) => return Err(e).context("Upstream receive failed"),
            Some(Ok(Message::Pong(_))) => {
                let _ = pong_tx.send(Instant::now());
            }
            Some(Ok(msg)) if is_payload(&msg) => {
                activity.touch();
                client_tx.send(msg).await.context("Client send failed")?;
            }
            Some(Ok(_)) => {}
        }
    }
}

async fn pong_deadline(sent: Option<Instant>, timeout: Duration) {
    match sent {
        Some(at) => sleep_until(at + timeout).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_reason_is_truncated_on_char_boundary() {
        let reason = "é".repeat(100);
        let frame = close_frame(CloseCode::Error, &reason);
        assert!(frame.reason.len() <= MAX_CLOSE_REASON);
        assert_eq!(frame.reason.len() % 2, 0);
    }

    #[test]
    fn failures_close_with_internal_error_code() {
        let end = SessionEnd::Failed(anyhow::anyhow!("boom"));
        let (client, upstream) = end.close_frames();
        assert_eq!(client.code, CloseCode::Error);
        assert_eq!(upstream.code, CloseCode::Error);
        assert_eq!(client.reason, "boom");
    }
}
