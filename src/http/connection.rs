use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::Role;

use crate::http::parser::{ParseError, parse_http_request};
use crate::http::request::{Method, Request};
use crate::http::response::{Response, StatusCode};
use crate::http::writer::ResponseWriter;
use crate::server::AppState;
use crate::server::routes::{self, Route, UpgradeTarget};
use crate::server::websocket;

const READ_CHUNK: usize = 4096;

pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    buffer: Vec<u8>,
    state: ConnectionState,
    app: Arc<AppState>,
}

pub enum ConnectionState {
    Reading,
    Processing(Request),
    Writing(ResponseWriter, bool), // bool = keep_alive?
    Upgrading(Request, UpgradeTarget),
    Closed,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr, app: Arc<AppState>) -> Self {
        Self {
            stream,
            peer,
            buffer: Vec::with_capacity(READ_CHUNK),
            state: ConnectionState::Reading,
            app,
        }
    }

    /// Serve requests until the client goes away or the connection is
    /// handed over to a WebSocket handler.
    pub async fn run(mut self) -> anyhow::Result<()> {
        loop {
            match std::mem::replace(&mut self.state, ConnectionState::Closed) {
                ConnectionState::Reading => match self.read_request().await {
                    Ok(Some(req)) => self.state = ConnectionState::Processing(req),
                    Ok(None) => self.state = ConnectionState::Closed,
                    Err(RequestError::Parse(e)) => {
                        tracing::warn!(peer = %self.peer, error = %e, "Rejecting malformed request");
                        let response = error_response(&e);
                        self.state =
                            ConnectionState::Writing(ResponseWriter::new(&response), false);
                    }
                    Err(RequestError::Io(e)) => return Err(e.into()),
                },

                ConnectionState::Processing(req) => {
                    self.state = self.process(req).await;
                }

                ConnectionState::Writing(mut writer, keep_alive) => {
                    writer.write_to_stream(&mut self.stream).await?;

                    if keep_alive {
                        self.state = ConnectionState::Reading;
                    } else {
                        self.state = ConnectionState::Closed;
                    }
                }

                ConnectionState::Upgrading(req, target) => {
                    return self.upgrade(req, target).await;
                }

                ConnectionState::Closed => {
                    break;
                }
            }
        }

        Ok(())
    }

    async fn process(&self, req: Request) -> ConnectionState {
        let keep_alive = req.keep_alive();
        let route = routes::route(&req);

        tracing::debug!(
            peer = %self.peer,
            method = %req.method,
            path = %req.path,
            route = ?route,
            "Request received"
        );

        let response = match route {
            Route::Upgrade(target) => {
                if websocket::accept_key(&req).is_some() {
                    return ConnectionState::Upgrading(req, target);
                }
                Response::bad_request("expected a WebSocket upgrade")
            }
            Route::Local(local) => routes::handle_local(&self.app, local).await,
            Route::Proxy => self.app.http_proxy.forward_request(&req).await,
        };

        let writer = if req.method == Method::HEAD {
            ResponseWriter::head_only(&response)
        } else {
            ResponseWriter::new(&response)
        };
        ConnectionState::Writing(writer, keep_alive)
    }

    async fn upgrade(mut self, req: Request, target: UpgradeTarget) -> anyhow::Result<()> {
        let response = match websocket::switching_protocols(&req) {
            Some(response) => response,
            None => Response::bad_request("expected a WebSocket upgrade"),
        };
        ResponseWriter::new(&response)
            .write_to_stream(&mut self.stream)
            .await?;
        if response.status != StatusCode::SWITCHING_PROTOCOLS {
            return Ok(());
        }

        // Bytes the client pipelined after the handshake belong to the
        // WebSocket stream
        let leftover = std::mem::take(&mut self.buffer);
        let ws = WebSocketStream::from_partially_read(self.stream, leftover, Role::Server, None)
            .await;

        tracing::info!(peer = %self.peer, target = ?target, "WebSocket upgraded");

        match target {
            UpgradeTarget::Signaling => {
                self.app.signaling.serve(ws).await;
            }
            UpgradeTarget::MediaStream => {
                websocket::serve_stream_viewer(ws, &self.app).await;
            }
        }

        Ok(())
    }

    pub async fn read_request(&mut self) -> Result<Option<Request>, RequestError> {
        loop {
            // Try parsing whatever we already have
            match parse_http_request(&self.buffer) {
                Ok((request, consumed)) => {
                    self.buffer.drain(..consumed);
                    return Ok(Some(request));
                }

                Err(ParseError::Incomplete) => {
                    // Need more data → fall through to read
                }

                Err(e) => return Err(RequestError::Parse(e)),
            }

            let mut temp = [0u8; READ_CHUNK];
            let n = self.stream.read(&mut temp).await.map_err(RequestError::Io)?;

            if n == 0 {
                if !self.buffer.is_empty() {
                    tracing::debug!(
                        peer = %self.peer,
                        buffered = self.buffer.len(),
                        "Client closed mid-request"
                    );
                }
                return Ok(None);
            }

            self.buffer.extend_from_slice(&temp[..n]);
        }
    }
}

#[derive(Debug)]
pub enum RequestError {
    Parse(ParseError),
    Io(std::io::Error),
}

fn error_response(error: &ParseError) -> Response {
    match error {
        ParseError::UnsupportedTransferEncoding => {
            Response::text(StatusCode::NOT_IMPLEMENTED, error.to_string())
        }
        ParseError::BodyTooLarge => Response::text(StatusCode::PAYLOAD_TOO_LARGE, error.to_string()),
        other => Response::bad_request(&other.to_string()),
    }
}
