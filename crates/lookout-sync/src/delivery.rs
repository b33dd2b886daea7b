//! Delivery sinks: where finished records and board messages go.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use lookout_core::NormalizedRecord;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

pub const PATCH_NOTES_CHANNEL: &str = "patch-notes";

pub const DEFAULT_FOOTER: &str = "Lookout | v0.1";

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("webhook request for channel `{channel}` failed: {source}")]
    Request {
        channel: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("webhook for channel `{channel}` answered http {status}")]
    Status { channel: String, status: u16 },
}

#[async_trait]
pub trait DeliverySink: Send + Sync {
    async fn deliver_record(
        &self,
        channel: &str,
        record: &NormalizedRecord,
    ) -> Result<(), DeliveryError>;

    async fn deliver_text(&self, channel: &str, text: &str) -> Result<(), DeliveryError>;
}

/// Writes deliveries to the tracing log. Used when no webhook is configured.
#[derive(Debug, Default, Clone)]
pub struct LogSink;

#[async_trait]
impl DeliverySink for LogSink {
    async fn deliver_record(
        &self,
        channel: &str,
        record: &NormalizedRecord,
    ) -> Result<(), DeliveryError> {
        info!(
            channel,
            source = %record.name,
            title = %record.title,
            url = %record.url,
            date = %record.date,
            "new update"
        );
        Ok(())
    }

    async fn deliver_text(&self, channel: &str, text: &str) -> Result<(), DeliveryError> {
        info!(channel, "{text}");
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct EmbedMedia {
    url: String,
}

#[derive(Debug, Serialize)]
struct EmbedAuthor {
    name: String,
}

#[derive(Debug, Serialize)]
struct EmbedFooter {
    text: String,
}

#[derive(Debug, Serialize)]
struct EmbedField {
    name: &'static str,
    value: String,
    inline: bool,
}

#[derive(Debug, Serialize)]
struct Embed {
    title: String,
    description: String,
    url: String,
    color: u32,
    image: EmbedMedia,
    thumbnail: EmbedMedia,
    author: EmbedAuthor,
    footer: EmbedFooter,
    fields: Vec<EmbedField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<String>,
}

#[derive(Debug, Serialize)]
struct WebhookPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    embeds: Vec<Embed>,
}

impl WebhookPayload {
    fn text(text: &str) -> Self {
        Self {
            content: Some(text.to_string()),
            embeds: Vec::new(),
        }
    }

    fn record(record: &NormalizedRecord, footer: &str) -> Self {
        let embed = Embed {
            title: record.title.clone(),
            description: record.description.clone(),
            url: record.url.clone(),
            color: record.color.0,
            image: EmbedMedia {
                url: record.thumbnail.clone(),
            },
            thumbnail: EmbedMedia {
                url: record.thumbnail.clone(),
            },
            author: EmbedAuthor {
                name: record.name.clone(),
            },
            footer: EmbedFooter {
                text: footer.to_string(),
            },
            fields: vec![
                EmbedField {
                    name: "Date",
                    value: record.date.clone(),
                    inline: true,
                },
                EmbedField {
                    name: "Author",
                    value: record.author.clone(),
                    inline: true,
                },
            ],
            timestamp: record.published_at.map(|at| at.to_rfc3339()),
        };
        Self {
            content: None,
            embeds: vec![embed],
        }
    }
}

/// Posts to one Discord webhook per channel. Channels without a webhook go to the log.
#[derive(Debug, Clone)]
pub struct DiscordWebhookSink {
    client: reqwest::Client,
    webhooks: HashMap<String, String>,
    timeout: Duration,
    max_retries: u8,
}

impl DiscordWebhookSink {
    pub fn new(webhooks: HashMap<String, String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            webhooks,
            timeout: Duration::from_secs(5),
            max_retries: 3,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }

    pub fn with_retries(mut self, retries: u8) -> Self {
        self.max_retries = retries.max(1);
        self
    }

    pub fn has_channel(&self, channel: &str) -> bool {
        self.webhooks.contains_key(channel)
    }

    async fn post(
        &self,
        channel: &str,
        webhook: &str,
        payload: &WebhookPayload,
    ) -> Result<(), DeliveryError> {
        let mut attempt: u8 = 0;
        loop {
            attempt += 1;
            let res = self
                .client
                .post(webhook)
                .timeout(self.timeout)
                .json(payload)
                .send()
                .await;

            let failure = match res {
                Ok(rsp) if rsp.status().is_success() => {
                    debug!(channel, attempt, "webhook delivered");
                    return Ok(());
                }
                Ok(rsp) => DeliveryError::Status {
                    channel: channel.to_string(),
                    status: rsp.status().as_u16(),
                },
                Err(source) => DeliveryError::Request {
                    channel: channel.to_string(),
                    source,
                },
            };

            if attempt >= self.max_retries {
                return Err(failure);
            }
            debug!(channel, attempt, error = %failure, "retrying webhook");
            tokio::time::sleep(Duration::from_millis(500u64 << (attempt - 1))).await;
        }
    }
}

#[async_trait]
impl DeliverySink for DiscordWebhookSink {
    async fn deliver_record(
        &self,
        channel: &str,
        record: &NormalizedRecord,
    ) -> Result<(), DeliveryError> {
        let Some(webhook) = self.webhooks.get(channel) else {
            return LogSink.deliver_record(channel, record).await;
        };
        let payload = WebhookPayload::record(record, DEFAULT_FOOTER);
        self.post(channel, webhook, &payload).await?;
        info!(channel, source = %record.name, "update sent");
        Ok(())
    }

    async fn deliver_text(&self, channel: &str, text: &str) -> Result<(), DeliveryError> {
        let Some(webhook) = self.webhooks.get(channel) else {
            return LogSink.deliver_text(channel, text).await;
        };
        self.post(channel, webhook, &WebhookPayload::text(text)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use lookout_core::Color;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn record() -> NormalizedRecord {
        NormalizedRecord {
            name: "Valorant Updates Patch".into(),
            title: "VALORANT Patch Notes 8.04".into(),
            description: "Agent updates".into(),
            url: "https://playvalorant.com/en-us/news/8-04".into(),
            thumbnail: "https://img.example/8-04.jpg".into(),
            author: "Riot Games".into(),
            date: "2024-03-05T17:00:00Z".into(),
            published_at: Some(Utc.with_ymd_and_hms(2024, 3, 5, 17, 0, 0).unwrap()),
            color: Color(0x800080),
        }
    }

    #[test]
    fn record_embed_carries_all_display_fields() {
        let payload = serde_json::to_value(WebhookPayload::record(&record(), "Lookout | test")).unwrap();
        let embed = &payload["embeds"][0];

        assert!(payload.get("content").is_none());
        assert_eq!(embed["title"], "VALORANT Patch Notes 8.04");
        assert_eq!(embed["color"], 0x800080);
        assert_eq!(embed["image"]["url"], "https://img.example/8-04.jpg");
        assert_eq!(embed["thumbnail"]["url"], "https://img.example/8-04.jpg");
        assert_eq!(embed["author"]["name"], "Valorant Updates Patch");
        assert_eq!(embed["footer"]["text"], "Lookout | test");
        assert_eq!(
            embed["fields"],
            json!([
                { "name": "Date", "value": "2024-03-05T17:00:00Z", "inline": true },
                { "name": "Author", "value": "Riot Games", "inline": true }
            ])
        );
        assert_eq!(embed["timestamp"], "2024-03-05T17:00:00+00:00");
    }

    #[test]
    fn text_payload_has_no_embeds() {
        let payload = serde_json::to_value(WebhookPayload::text("```diff\n```")).unwrap();
        assert_eq!(payload, json!({ "content": "```diff\n```" }));
    }

    #[tokio::test]
    async fn channels_without_webhook_fall_back_to_log() {
        let sink = DiscordWebhookSink::new(HashMap::new());
        assert!(!sink.has_channel(PATCH_NOTES_CHANNEL));
        sink.deliver_record(PATCH_NOTES_CHANNEL, &record()).await.unwrap();
        sink.deliver_text("hunted", "board").await.unwrap();
    }

    fn sink_for(server: &MockServer, channel: &str) -> DiscordWebhookSink {
        DiscordWebhookSink::new(HashMap::from([(
            channel.to_string(),
            format!("{}/webhook", server.uri()),
        )]))
    }

    #[tokio::test]
    async fn webhook_receives_the_record_embed_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/webhook"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let sink = sink_for(&server, PATCH_NOTES_CHANNEL);
        sink.deliver_record(PATCH_NOTES_CHANNEL, &record()).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body["embeds"][0]["footer"]["text"], DEFAULT_FOOTER);
        assert_eq!(body["embeds"][0]["title"], "VALORANT Patch Notes 8.04");
    }

    #[tokio::test]
    async fn webhook_server_errors_retry_then_surface_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/webhook"))
            .respond_with(ResponseTemplate::new(500))
            .expect(2)
            .mount(&server)
            .await;

        let sink = sink_for(&server, "hunted").with_retries(2);
        let err = sink.deliver_text("hunted", "board").await.unwrap_err();
        assert!(matches!(
            err,
            DeliveryError::Status { ref channel, status: 500 } if channel == "hunted"
        ));
    }
}
