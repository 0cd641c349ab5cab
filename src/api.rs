//! Request/response primitive: one short-lived connection per call.
//!
//! The backend speaks newline-delimited JSON; a call writes a single
//! [`Request`] line and reads a single [`Response`] line, bounded by one
//! timeout covering the whole round trip.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time;
use tracing::debug;

use crate::error::ClientError;
use crate::protocol::{Request, Response};

#[derive(Debug, Clone)]
pub struct ApiClient {
    endpoint: String,
    timeout: Duration,
}

impl ApiClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Issue one call with the client's default timeout.
    pub async fn call(&self, request: &Request) -> Result<Response, ClientError> {
        self.call_with_timeout(request, self.timeout).await
    }

    /// Issue one call with an explicit round-trip bound. A timeout counts as
    /// a transport failure, the same as a refused connection.
    pub async fn call_with_timeout(
        &self,
        request: &Request,
        limit: Duration,
    ) -> Result<Response, ClientError> {
        let response = time::timeout(limit, self.round_trip(request))
            .await
            .map_err(|_| ClientError::timeout("request/response call timed out"))??;

        match response {
            Response::Error { message } => Err(ClientError::Backend(message)),
            other => Ok(other),
        }
    }

    async fn round_trip(&self, request: &Request) -> Result<Response, ClientError> {
        let stream = TcpStream::connect(&self.endpoint).await?;
        let (reader, mut writer) = stream.into_split();

        let mut line = serde_json::to_string(request).map_err(ClientError::bad_wire)?;
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;
        debug!(endpoint = %self.endpoint, "request sent");

        let mut lines = BufReader::new(reader).lines();
        let reply = lines
            .next_line()
            .await?
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "backend closed early"))?;
        serde_json::from_str(&reply).map_err(ClientError::bad_wire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn one_shot_server(reply: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut lines = BufReader::new(reader).lines();
            let _request = lines.next_line().await.unwrap();
            writer.write_all(reply.as_bytes()).await.unwrap();
            writer.write_all(b"\n").await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn round_trips_a_health_call() {
        let addr = one_shot_server(r#"{"type":"Health","status":"healthy"}"#).await;
        let api = ApiClient::new(addr, Duration::from_secs(1));
        let resp = api.call(&Request::Health).await.unwrap();
        assert!(matches!(resp, Response::Health { .. }));
    }

    #[tokio::test]
    async fn backend_error_response_maps_to_backend_error() {
        let addr = one_shot_server(r#"{"type":"Error","message":"no such session"}"#).await;
        let api = ApiClient::new(addr, Duration::from_secs(1));
        let err = api.call(&Request::EndSession { session_id: 1 }).await;
        assert!(matches!(err, Err(ClientError::Backend(m)) if m.contains("no such session")));
    }

    #[tokio::test]
    async fn refused_connection_is_a_transport_error() {
        // Bind then drop to get a port with no listener.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let api = ApiClient::new(addr, Duration::from_secs(1));
        let err = api.call(&Request::Health).await;
        assert!(matches!(err, Err(ClientError::Transport(_))));
    }

    #[tokio::test]
    async fn silent_backend_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            // Accept and hold the connection without answering.
            let (_stream, _) = listener.accept().await.unwrap();
            time::sleep(Duration::from_secs(5)).await;
        });

        let api = ApiClient::new(addr, Duration::from_millis(100));
        let err = api.call(&Request::Health).await;
        assert!(
            matches!(err, Err(ClientError::Transport(ref inner)) if inner.kind() == io::ErrorKind::TimedOut)
        );
    }
}
