// Alert Sink - outbound messaging client
// Trait seam with a transient/permanent error split; Telegram Bot API impl

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::alerts::format::split_text;
use crate::core::config::SinkConfig;

/// Sink message size limit (Telegram: 4096 chars per message).
const MAX_MESSAGE_LEN: usize = 4096;

#[derive(Debug, Error)]
pub enum SinkError {
    /// Worth retrying: network failure, timeout, rate limit, server error.
    #[error("transient sink error: {0}")]
    Transient(String),
    /// Not worth retrying: auth failure, bad request, unknown chat.
    #[error("permanent sink error: {0}")]
    Permanent(String),
}

/// Resolved destination: a chat plus an optional forum thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelHandle {
    pub chat_id: i64,
    pub thread_id: Option<i64>,
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(
        &self,
        channel: &ChannelHandle,
        text: &str,
        parse_mode: &str,
    ) -> Result<(), SinkError>;
}

// ============================================================================
// Telegram implementation
// ============================================================================

pub struct TelegramSink {
    client: Client,
    send_message_url: String,
    send_delay: Duration,
}

impl TelegramSink {
    pub fn new(cfg: &SinkConfig) -> Result<Self, SinkError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.call_timeout_secs))
            .build()
            .map_err(|e| SinkError::Permanent(e.to_string()))?;
        Ok(Self {
            client,
            send_message_url: format!(
                "https://api.telegram.org/bot{}/sendMessage",
                cfg.sink_token
            ),
            send_delay: Duration::from_millis(cfg.send_delay_ms),
        })
    }

    async fn send_chunk(
        &self,
        channel: &ChannelHandle,
        text: &str,
        parse_mode: &str,
    ) -> Result<(), SinkError> {
        let mut body = serde_json::json!({
            "chat_id": channel.chat_id,
            "text": text,
        });
        if !parse_mode.is_empty() {
            body["parse_mode"] = serde_json::json!(parse_mode);
        }
        if let Some(thread_id) = channel.thread_id {
            body["message_thread_id"] = serde_json::json!(thread_id);
        }

        let resp = self
            .client
            .post(&self.send_message_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| SinkError::Transient(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            debug!(chat_id = channel.chat_id, thread_id = ?channel.thread_id, "alert sent");
            return Ok(());
        }

        let detail = resp.text().await.unwrap_or_default();
        if status.as_u16() == 429 || status.is_server_error() {
            Err(SinkError::Transient(format!("HTTP {}: {}", status, detail)))
        } else {
            Err(SinkError::Permanent(format!("HTTP {}: {}", status, detail)))
        }
    }
}

#[async_trait]
impl AlertSink for TelegramSink {
    async fn send(
        &self,
        channel: &ChannelHandle,
        text: &str,
        parse_mode: &str,
    ) -> Result<(), SinkError> {
        let chunks = split_text(text, MAX_MESSAGE_LEN);
        let chunked = chunks.len() > 1;
        for chunk in chunks {
            self.send_chunk(channel, &chunk, parse_mode).await?;
            if chunked {
                tokio::time::sleep(self.send_delay).await;
            }
        }
        Ok(())
    }
}

/// In-memory sink for unit tests of alert producers.
#[cfg(test)]
pub struct MemorySink {
    pub sent: parking_lot::Mutex<Vec<(ChannelHandle, String)>>,
}

#[cfg(test)]
impl MemorySink {
    pub fn new() -> Self {
        Self {
            sent: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn texts(&self) -> Vec<String> {
        self.sent.lock().iter().map(|(_, t)| t.clone()).collect()
    }
}

#[cfg(test)]
#[async_trait]
impl AlertSink for MemorySink {
    async fn send(
        &self,
        channel: &ChannelHandle,
        text: &str,
        _parse_mode: &str,
    ) -> Result<(), SinkError> {
        self.sent.lock().push((channel.clone(), text.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_builds() {
        let mut cfg = SinkConfig::default();
        cfg.sink_token = "123:abc".to_string();
        let sink = TelegramSink::new(&cfg).unwrap();
        assert!(sink.send_message_url.contains("bot123:abc"));
    }
}
