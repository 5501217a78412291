use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

use crate::error::RelayError;
use crate::inbound::InboundMessage;
use crate::util::truncate_with_ellipsis;

/// Body posted to the webhook.
///
/// `from` and `message` are the contract; everything else is diagnostic
/// and may grow.
#[derive(Debug, Serialize)]
pub struct WebhookPayload<'a> {
    pub from: &'a str,
    pub message: &'a str,
    pub chat: &'a str,
    pub message_id: &'a str,
    pub is_group: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push_name: Option<&'a str>,
    pub timestamp: i64,
}

impl<'a> From<&'a InboundMessage> for WebhookPayload<'a> {
    fn from(msg: &'a InboundMessage) -> Self {
        Self {
            from: &msg.sender,
            message: &msg.text,
            chat: &msg.raw_source,
            message_id: &msg.id,
            is_group: msg.is_group,
            push_name: msg.push_name.as_deref(),
            timestamp: msg.timestamp.timestamp(),
        }
    }
}

pub struct WebhookClient {
    url: String,
    client: reqwest::Client,
}

impl WebhookClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build webhook HTTP client")?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Post `msg` and return the reply the automation chose, if any.
    pub async fn call(&self, msg: &InboundMessage) -> Result<Option<String>> {
        let resp = self
            .client
            .post(&self.url)
            .json(&WebhookPayload::from(msg))
            .send()
            .await
            .map_err(|e| RelayError::TransientNetwork(format!("webhook request failed: {e}")))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| RelayError::TransientNetwork(format!("webhook body read failed: {e}")))?;

        if !status.is_success() {
            return Err(RelayError::TransientNetwork(format!(
                "webhook returned {status}: {}",
                truncate_with_ellipsis(&body, 200)
            ))
            .into());
        }

        if body.trim().is_empty() {
            return Ok(None);
        }
        let parsed: Value = serde_json::from_str(&body).with_context(|| {
            format!(
                "webhook returned non-JSON body: {}",
                truncate_with_ellipsis(&body, 200)
            )
        })?;
        Ok(extract_reply(&parsed))
    }
}

/// Reply text from a webhook response.
///
/// Arrays use their first element. Accepts `reply` or `Reply`; blank
/// strings and non-string values mean no reply.
pub fn extract_reply(body: &Value) -> Option<String> {
    let body = match body {
        Value::Array(items) => items.first()?,
        other => other,
    };
    let object = body.as_object()?;
    ["reply", "Reply"]
        .iter()
        .filter_map(|key| object.get(*key))
        .filter_map(Value::as_str)
        .find(|reply| !reply.trim().is_empty())
        .map(str::to_string)
}
