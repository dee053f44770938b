//! Request routing
//!
//! A handful of paths are served locally or upgraded to WebSocket; every
//! other request is forwarded to the internal HTTP endpoint.

use serde_json::json;

use crate::http::request::{Method, Request};
use crate::http::response::Response;
use crate::server::AppState;

pub const SIGNALING_PATH: &str = "/ws/signaling";
pub const STREAM_PATH: &str = "/ws/stream";
pub const HEALTH_PATH: &str = "/health";
pub const STATUS_PATH: &str = "/api/status";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Local(LocalRoute),
    Upgrade(UpgradeTarget),
    Proxy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalRoute {
    Health,
    Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeTarget {
    Signaling,
    MediaStream,
}

pub fn route(req: &Request) -> Route {
    match (&req.method, req.path_only()) {
        (_, SIGNALING_PATH) => Route::Upgrade(UpgradeTarget::Signaling),
        (_, STREAM_PATH) => Route::Upgrade(UpgradeTarget::MediaStream),
        (Method::GET | Method::HEAD, HEALTH_PATH) => Route::Local(LocalRoute::Health),
        (Method::GET | Method::HEAD, STATUS_PATH) => Route::Local(LocalRoute::Status),
        _ => Route::Proxy,
    }
}

pub async fn handle_local(app: &AppState, route: LocalRoute) -> Response {
    match route {
        LocalRoute::Health => Response::json(&json!({
            "status": "healthy",
            "service": env!("CARGO_PKG_NAME"),
        })),
        LocalRoute::Status => {
            let snapshot = app.activity.snapshot();
            let media = app.media.status();
            Response::json(&json!({
                "active_connections": snapshot.active_sessions,
                "idle_seconds": snapshot.idle.as_secs(),
                "last_activity": humantime::format_rfc3339_seconds(snapshot.last_activity).to_string(),
                "media": media,
            }))
        }
    }
}
