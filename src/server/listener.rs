use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::info;

use crate::http::connection::Connection;
use crate::server::AppState;

/// Pause after a failed accept (e.g. descriptor exhaustion)
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub async fn run(app: Arc<AppState>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&app.config.server.listen_addr).await?;
    info!("Listening on {}", listener.local_addr()?);
    serve(listener, app).await
}

/// Accept connections on an already-bound listener until shutdown.
pub async fn serve(listener: TcpListener, app: Arc<AppState>) -> anyhow::Result<()> {
    loop {
        let accepted = tokio::select! {
            res = listener.accept() => res,
            _ = app.shutdown.cancelled() => return Ok(()),
        };

        let (socket, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "Accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        tracing::debug!("Accepted connection from {}", peer);

        let app = app.clone();
        tokio::spawn(async move {
            let conn = Connection::new(socket, peer, app);
            if let Err(e) = conn.run().await {
                tracing::error!("Connection error from {}: {}", peer, e);
            }
        });
    }
}
