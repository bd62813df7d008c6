//! Webhook relay with exponential-backoff retry.
//!
//! [`WebhookRelay`] forwards every [`ChangeEvent`] on the bus to one
//! external URL via HTTP POST, standing in for a broadcast transport.
//! Failed attempts are retried with backoff (1 s, 2 s, 4 s) and then
//! dropped; relay failures are logged and never surface to publishers.

use std::time::Duration;

use tokio::sync::broadcast;

use crate::bus::ChangeEvent;

/// Retry delays (exponential backoff: 1s, 2s, 4s).
const RETRY_DELAYS: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];

/// HTTP request timeout for a single delivery attempt.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// The underlying HTTP request failed (network, DNS, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The remote server returned a non-2xx status code.
    #[error("Webhook returned HTTP {0}")]
    HttpStatus(u16),
}

// ---------------------------------------------------------------------------
// WebhookRelay
// ---------------------------------------------------------------------------

pub struct WebhookRelay {
    client: reqwest::Client,
    url: String,
    retry_delays: Vec<Duration>,
}

impl WebhookRelay {
    pub fn new(url: impl Into<String>) -> Result<Self, RelayError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            retry_delays: RETRY_DELAYS.to_vec(),
        })
    }

    /// Replace the backoff schedule. An empty schedule means one attempt.
    pub fn with_retry_delays(mut self, delays: Vec<Duration>) -> Self {
        self.retry_delays = delays;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Deliver one event, retrying per the backoff schedule.
    pub async fn deliver(&self, event: &ChangeEvent) -> Result<(), RelayError> {
        for (attempt, delay) in self.retry_delays.iter().enumerate() {
            match self.try_send(event).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        url = %self.url,
                        channel = %event.channel,
                        error = %e,
                        "Change relay attempt failed, retrying"
                    );
                    tokio::time::sleep(*delay).await;
                }
            }
        }

        // Final attempt after the last backoff.
        self.try_send(event).await.inspect_err(|e| {
            tracing::error!(
                url = %self.url,
                channel = %event.channel,
                error = %e,
                "Change relay failed after all retries"
            );
        })
    }

    /// Relay loop. Exits when the bus is dropped.
    pub async fn run(self, mut receiver: broadcast::Receiver<ChangeEvent>) {
        tracing::info!(url = %self.url, "Change relay started");
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    // Errors are already logged by `deliver`.
                    let _ = self.deliver(&event).await;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Change relay lagged, some events were dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::info!("Event bus closed, change relay shutting down");
                    break;
                }
            }
        }
    }

    async fn try_send(&self, event: &ChangeEvent) -> Result<(), RelayError> {
        let response = self.client.post(&self.url).json(event).send().await?;
        if !response.status().is_success() {
            return Err(RelayError::HttpStatus(response.status().as_u16()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    /// Accept one connection, read a full request, answer with `status`, and
    /// hand back the request body.
    async fn one_shot_server(status: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let url = format!("http://{}/hook", listener.local_addr().expect("addr"));
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = socket.read(&mut chunk).await.expect("read");
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf).to_string();
                if let Some(split) = text.find("\r\n\r\n") {
                    let length = text[..split]
                        .lines()
                        .find_map(|l| {
                            let lower = l.to_ascii_lowercase();
                            lower
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                        })
                        .unwrap_or(0);
                    if buf.len() >= split + 4 + length {
                        break;
                    }
                }
            }
            let response = format!("HTTP/1.1 {status}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
            socket.write_all(response.as_bytes()).await.expect("write");
            let text = String::from_utf8_lossy(&buf).to_string();
            text.split_once("\r\n\r\n")
                .map(|(_, body)| body.to_string())
                .unwrap_or_default()
        });
        (url, handle)
    }

    #[tokio::test]
    async fn delivers_event_as_json() {
        let (url, server) = one_shot_server("200 OK").await;
        let relay = WebhookRelay::new(url).expect("relay").with_retry_delays(vec![]);
        let event = ChangeEvent::new("host-updates.9", "workflow.completed")
            .with_payload(serde_json::json!({"id": 9}));

        relay.deliver(&event).await.expect("delivered");

        let body = server.await.expect("server");
        let received: ChangeEvent = serde_json::from_str(&body).expect("json body");
        assert_eq!(received.channel, "host-updates.9");
        assert_eq!(received.payload["id"], 9);
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let (url, _server) = one_shot_server("503 Service Unavailable").await;
        let relay = WebhookRelay::new(url).expect("relay").with_retry_delays(vec![]);
        let err = relay
            .deliver(&ChangeEvent::new("host-updates.1", "workflow.updated"))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::HttpStatus(503)));
    }

    #[test]
    fn relay_error_display_http_status() {
        let err = RelayError::HttpStatus(502);
        assert_eq!(err.to_string(), "Webhook returned HTTP 502");
    }

    #[test]
    fn relay_error_display_request() {
        let req_err = reqwest::Client::new().get("://bad").build().unwrap_err();
        let err = RelayError::Request(req_err);
        assert!(err.to_string().contains("HTTP request failed"));
    }
}
