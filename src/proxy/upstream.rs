//! HTTP request forwarding
//!
//! Every request that is not handled locally is replayed against the fixed
//! internal HTTPS endpoint. The internal endpoint presents a self-signed
//! certificate, so certificate verification is disabled for this client.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};

use crate::activity::ActivityTracker;
use crate::config::HttpConfig;
use crate::http::headers::{Direction, HeaderList, HeaderSanitizer};
use crate::http::request::{Method, Request};
use crate::http::response::{Response, ResponseBuilder, StatusCode};

/// Forwards requests to the internal HTTP endpoint
pub struct ProxyHandler {
    client: reqwest::Client,

    /// Scheme, host and port, without a trailing slash
    base_url: String,

    sanitizer: HeaderSanitizer,

    activity: Arc<ActivityTracker>,
}

impl ProxyHandler {
    pub fn new(config: &HttpConfig, activity: Arc<ActivityTracker>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .redirect(reqwest::redirect::Policy::none())
            .timeout(config.request_timeout())
            .build()
            .context("Failed to build upstream HTTP client")?;

        Ok(Self {
            client,
            base_url: config.upstream_url.trim_end_matches('/').to_string(),
            sanitizer: HeaderSanitizer::new(&config.frame_ancestors),
            activity,
        })
    }

    /// Target URL for a request: base + path + raw query, unmodified.
    pub fn target_url(&self, path: &str, query: Option<&str>) -> String {
        let mut url = String::with_capacity(self.base_url.len() + path.len() + 16);
        url.push_str(&self.base_url);
        if !path.starts_with('/') {
            url.push('/');
        }
        url.push_str(path);
        if let Some(query) = query.filter(|q| !q.is_empty()) {
            url.push('?');
            url.push_str(query);
        }
        url
    }

    pub async fn forward_request(&self, request: &Request) -> Response {
        self.forward(
            &request.method,
            request.path_only(),
            request.query(),
            &request.headers,
            request.body.clone(),
        )
        .await
    }

    /// Forward one request and relay the upstream response.
    ///
    /// Transport failures never propagate: they become a 502 with a
    /// plain-text diagnostic.
    pub async fn forward(
        &self,
        method: &Method,
        path: &str,
        query: Option<&str>,
        headers: &HeaderList,
        body: Vec<u8>,
    ) -> Response {
        self.activity.touch();

        let url = self.target_url(path, query);
        let started = Instant::now();

        match self.send(method, &url, headers, body).await {
            Ok(response) => {
                tracing::info!(
                    method = %method,
                    path = %path,
                    status = response.status.as_u16(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Request forwarded"
                );
                response
            }
            Err(e) => {
                tracing::error!(
                    method = %method,
                    path = %path,
                    error = %format!("{e:#}"),
                    "HTTP proxy error"
                );
                Response::text(StatusCode::BAD_GATEWAY, format!("Proxy error: {e:#}"))
            }
        }
    }

    async fn send(
        &self,
        method: &Method,
        url: &str,
        headers: &HeaderList,
        body: Vec<u8>,
    ) -> Result<Response> {
        let method = reqwest::Method::from_bytes(method.as_str().as_bytes())
            .context("Invalid request method")?;

        let mut builder = self.client.request(method, url);
        for (name, value) in self.sanitizer.sanitize(headers, Direction::Request).iter() {
            builder = builder.header(name, value);
        }

        let upstream = builder
            .body(body)
            .send()
            .await
            .context("Upstream request failed")?;

        let status = StatusCode::from_u16(upstream.status().as_u16())
            .context("Upstream returned an invalid status")?;

        let mut raw = HeaderList::new();
        for (name, value) in upstream.headers() {
            raw.append(name.as_str(), String::from_utf8_lossy(value.as_bytes()));
        }
        let content_type = raw.get("content-type").map(str::to_string);

        let body = upstream
            .bytes()
            .await
            .context("Failed to read upstream body")?;

        let mut headers = self.sanitizer.sanitize(&raw, Direction::Response);
        if let Some(content_type) = content_type {
            headers.insert("Content-Type", content_type);
        }

        Ok(ResponseBuilder::new(status)
            .headers(headers)
            .body(body.to_vec())
            .build())
    }
}
