//! Listener, routing and shared application state

pub mod listener;
pub mod routes;
pub mod websocket;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::activity::ActivityTracker;
use crate::config::Config;
use crate::media::MediaBroadcaster;
use crate::proxy::{ProxyHandler, SignalingProxy};

/// How long shutdown waits for signaling sessions to close
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Everything a connection needs, shared across all connections
pub struct AppState {
    pub config: Config,
    pub activity: Arc<ActivityTracker>,
    pub http_proxy: ProxyHandler,
    pub signaling: SignalingProxy,
    pub media: MediaBroadcaster,
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self> {
        let activity = Arc::new(ActivityTracker::new());
        let shutdown = CancellationToken::new();

        let http_proxy = ProxyHandler::new(&config.http, activity.clone())?;
        let signaling =
            SignalingProxy::new(config.signaling.clone(), activity.clone(), shutdown.clone())?;
        let media = MediaBroadcaster::new(config.media.clone());

        Ok(Self {
            config,
            activity,
            http_proxy,
            signaling,
            media,
            shutdown,
        })
    }

    /// Close live sessions and stop the producer.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.media.stop().await;

        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        while self.activity.active_sessions() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let remaining = self.activity.active_sessions();
        if remaining > 0 {
            tracing::warn!(remaining, "Shutting down with signaling sessions still open");
        }
    }
}
