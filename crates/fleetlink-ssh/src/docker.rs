//! Docker Engine API over a tunneled unix socket
//!
//! Every request dials a fresh stream to the engine socket and speaks
//! HTTP/1.1 on it. Paths are unversioned so the engine answers with its
//! own API version.

use crate::TransportError;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::{header, Request, Response};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tracing::debug;

/// Label every compose-managed container carries
pub const COMPOSE_SERVICE_LABEL: &str = "com.docker.compose.service";

/// Opens byte streams to a unix socket on the remote host
#[async_trait]
pub trait TunnelDialer: Send + Sync + 'static {
    /// Stream type produced by [`TunnelDialer::dial`]
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Open a new stream to `socket_path`
    async fn dial(&self, socket_path: &str) -> Result<Self::Stream, TransportError>;
}

/// Minimal Docker Engine client
pub struct EngineClient<D> {
    dialer: D,
    socket_path: String,
}

impl<D: TunnelDialer> EngineClient<D> {
    /// Create a client that reaches the engine at `socket_path` through `dialer`
    pub fn new(dialer: D, socket_path: impl Into<String>) -> Self {
        Self {
            dialer,
            socket_path: socket_path.into(),
        }
    }

    /// List compose-managed containers, including their sizes
    pub async fn list_compose_containers(&self) -> Result<Bytes, TransportError> {
        let filters = format!(r#"{{"label":["{COMPOSE_SERVICE_LABEL}"]}}"#);
        let path = format!(
            "/containers/json?size=true&filters={}",
            urlencoding::encode(&filters)
        );
        self.get_json(&path).await
    }

    /// Inspect one container, including its size
    pub async fn inspect_container(&self, id: &str) -> Result<Bytes, TransportError> {
        let path = format!("/containers/{}/json?size=true", container_segment(id)?);
        self.get_json(&path).await
    }

    /// Stream resource usage samples for one container
    pub async fn container_stats(&self, id: &str) -> Result<EngineResponse, TransportError> {
        let path = format!("/containers/{}/stats?stream=true", container_segment(id)?);
        self.stream(&path).await
    }

    /// Stream engine events
    pub async fn events(&self) -> Result<EngineResponse, TransportError> {
        self.stream("/events").await
    }

    /// GET `path` and return the whole body of a successful response
    pub async fn get_json(&self, path: &str) -> Result<Bytes, TransportError> {
        let mut response = self.stream(path).await?;
        response.collect().await
    }

    /// GET `path` and return the response for incremental reading
    pub async fn stream(&self, path: &str) -> Result<EngineResponse, TransportError> {
        debug!("Docker Engine GET {}", path);
        let stream = self.dialer.dial(&self.socket_path).await?;
        let (mut sender, connection) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| TransportError::EngineRequest(e.to_string()))?;

        let connection = tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("Docker Engine connection ended: {}", e);
            }
        });

        let request = Request::get(path)
            .header(header::HOST, "docker")
            .body(Empty::<Bytes>::new())
            .map_err(|e| TransportError::EngineRequest(e.to_string()))?;

        let response = match sender.send_request(request).await {
            Ok(response) => response,
            Err(e) => {
                connection.abort();
                return Err(TransportError::EngineRequest(e.to_string()));
            }
        };

        let mut response = EngineResponse::new(response, connection);
        if !response.status_ok() {
            let status = response.status;
            let body = response.collect_raw().await.unwrap_or_default();
            return Err(TransportError::Engine {
                status,
                message: engine_message(&body),
            });
        }
        Ok(response)
    }
}

/// A successful engine response whose body is read incrementally
pub struct EngineResponse {
    status: u16,
    body: Incoming,
    buffer: BytesMut,
    connection: JoinHandle<()>,
}

impl EngineResponse {
    fn new(response: Response<Incoming>, connection: JoinHandle<()>) -> Self {
        Self {
            status: response.status().as_u16(),
            body: response.into_body(),
            buffer: BytesMut::new(),
            connection,
        }
    }

    /// HTTP status code
    pub fn status(&self) -> u16 {
        self.status
    }

    fn status_ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Next non-empty newline-delimited record, or `None` at end of body
    pub async fn next_line(&mut self) -> Result<Option<Bytes>, TransportError> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
                let line = self.buffer.split_to(pos + 1);
                let line = trim_line(&line);
                if line.is_empty() {
                    continue;
                }
                return Ok(Some(Bytes::copy_from_slice(line)));
            }

            match self.body.frame().await {
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data() {
                        self.buffer.extend_from_slice(&data);
                    }
                }
                Some(Err(e)) => return Err(TransportError::EngineRequest(e.to_string())),
                None => {
                    let rest = self.buffer.split();
                    let rest = trim_line(&rest);
                    return Ok((!rest.is_empty()).then(|| Bytes::copy_from_slice(rest)));
                }
            }
        }
    }

    /// Read the remaining body in full
    pub async fn collect(&mut self) -> Result<Bytes, TransportError> {
        self.collect_raw()
            .await
            .map_err(|e| TransportError::EngineRequest(e.to_string()))
    }

    async fn collect_raw(&mut self) -> Result<Bytes, hyper::Error> {
        let mut out = self.buffer.split();
        while let Some(frame) = self.body.frame().await {
            if let Ok(data) = frame?.into_data() {
                out.extend_from_slice(&data);
            }
        }
        Ok(out.freeze())
    }
}

impl Drop for EngineResponse {
    fn drop(&mut self) {
        self.connection.abort();
    }
}

/// Percent-encode a container id or name for use as a path segment
fn container_segment(id: &str) -> Result<String, TransportError> {
    if id.is_empty() || id.contains('/') {
        return Err(TransportError::InvalidContainerId(id.to_string()));
    }
    Ok(urlencoding::encode(id).into_owned())
}

fn trim_line(line: &[u8]) -> &[u8] {
    let end = line
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |pos| pos + 1);
    &line[..end]
}

/// Pull `message` out of an engine error body, falling back to the raw text
fn engine_message(body: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| String::from_utf8_lossy(body).trim().to_string())
}

#[cfg(test)]
mod tests;
