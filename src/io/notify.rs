//! Best-effort stage notifications.
//!
//! Sinks report errors to the caller, which logs them and moves on. A
//! notification never fails or delays the pipeline beyond its timeout.

use crate::config::NotifyConfig;
use crate::io::ledger::EntryStatus;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// A stage status change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageEvent {
    pub stage: String,
    pub status: EntryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl StageEvent {
    pub fn new(stage: impl Into<String>, status: EntryStatus, message: Option<String>) -> Self {
        Self {
            stage: stage.into(),
            status,
            message,
            timestamp: Utc::now(),
        }
    }
}

/// Receives stage events.
pub trait NotificationSink: Send + Sync {
    fn notify<'a>(&'a self, event: &'a StageEvent) -> BoxFuture<'a, Result<()>>;
}

/// Writes events to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify<'a>(&'a self, event: &'a StageEvent) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            match &event.message {
                Some(message) => info!("Stage {} {}: {}", event.stage, event.status, message),
                None => info!("Stage {} {}", event.stage, event.status),
            }
            Ok(())
        })
    }
}

/// POSTs each event as JSON to a webhook.
#[derive(Debug, Clone)]
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(config: &NotifyConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build notification HTTP client")?;
        Ok(Self {
            client,
            url: config.url.clone(),
        })
    }
}

impl NotificationSink for WebhookSink {
    fn notify<'a>(&'a self, event: &'a StageEvent) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.client
                .post(&self.url)
                .json(event)
                .send()
                .await
                .with_context(|| format!("POST {}", self.url))?
                .error_for_status()
                .with_context(|| format!("{} rejected notification", self.url))?;
            Ok(())
        })
    }
}

/// Sink for the configured endpoint, or the log when none is set.
pub fn build_sink(config: Option<&NotifyConfig>) -> Result<Arc<dyn NotificationSink>> {
    match config {
        Some(notify) => Ok(Arc::new(WebhookSink::new(notify)?)),
        None => Ok(Arc::new(LogSink)),
    }
}

/// Deliver an event, logging instead of failing when the sink errors or hangs.
pub async fn deliver(sink: &dyn NotificationSink, event: &StageEvent, timeout: Duration) {
    match tokio::time::timeout(timeout, sink.notify(event)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Notification for stage {} failed: {:#}", event.stage, e),
        Err(_) => warn!(
            "Notification for stage {} timed out after {:?}",
            event.stage, timeout
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Accept one request, reply with `status`, return the request body.
    async fn serve_once(listener: TcpListener, status: &'static str) -> String {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            request.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&request).to_string();
            if let Some(split) = text.find("\r\n\r\n") {
                let length = text[..split]
                    .lines()
                    .find_map(|l| {
                        let lower = l.to_ascii_lowercase();
                        lower
                            .strip_prefix("content-length:")
                            .map(|v| v.trim().parse::<usize>().unwrap())
                    })
                    .unwrap_or(0);
                if text.len() >= split + 4 + length {
                    let response =
                        format!("HTTP/1.1 {}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n", status);
                    socket.write_all(response.as_bytes()).await.unwrap();
                    return text[split + 4..].to_string();
                }
            }
            if n == 0 {
                return String::new();
            }
        }
    }

    #[tokio::test]
    async fn test_webhook_posts_event() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve_once(listener, "200 OK"));

        let sink = WebhookSink::new(&NotifyConfig {
            url: format!("http://{}/hook", addr),
            timeout_secs: 5,
        })
        .unwrap();
        let event = StageEvent::new("process", EntryStatus::Succeeded, Some("42 objects".into()));
        sink.notify(&event).await.unwrap();

        let body = server.await.unwrap();
        let received: StageEvent = serde_json::from_str(&body).unwrap();
        assert_eq!(received, event);
    }

    #[tokio::test]
    async fn test_webhook_error_status_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve_once(listener, "500 Internal Server Error"));

        let sink = WebhookSink::new(&NotifyConfig {
            url: format!("http://{}/hook", addr),
            timeout_secs: 5,
        })
        .unwrap();
        let event = StageEvent::new("upload", EntryStatus::Failed, None);
        assert!(sink.notify(&event).await.is_err());
        server.await.unwrap();
    }

    struct HangingSink;

    impl NotificationSink for HangingSink {
        fn notify<'a>(&'a self, _event: &'a StageEvent) -> BoxFuture<'a, Result<()>> {
            Box::pin(futures::future::pending())
        }
    }

    #[tokio::test]
    async fn test_deliver_never_blocks_past_timeout() {
        let event = StageEvent::new("import", EntryStatus::Running, None);
        let started = std::time::Instant::now();
        deliver(&HangingSink, &event, Duration::from_millis(20)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_swallowed() {
        let sink = build_sink(Some(&NotifyConfig {
            url: "http://127.0.0.1:1/hook".into(),
            timeout_secs: 1,
        }))
        .unwrap();
        let event = StageEvent::new("import", EntryStatus::Succeeded, None);
        deliver(sink.as_ref(), &event, Duration::from_secs(2)).await;
    }
}
