use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::{header, Client, Method};
use serde::Deserialize;
use tera::{Context, Tera};

use super::{NotificationSender, SenderError};
use crate::notifications::models::OutboundNotification;

pub const DEFAULT_BODY_TEMPLATE: &str = r#"{"event":"{{ event }}","clients":{{ clients | json_encode() }},"message":{{ message | json_encode() }},"emoji":"{{ emoji }}","time":"{{ time }}"}"#;

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub body_template: Option<String>,
}

fn default_method() -> String {
    "POST".to_string()
}

/// A sender for pushing notifications via a custom webhook.
pub struct WebhookSender {
    client: Client,
    config: WebhookConfig,
    method: Method,
}

impl WebhookSender {
    pub fn new(config: WebhookConfig) -> Result<Self, SenderError> {
        let method = match config.method.to_uppercase().as_str() {
            "POST" => Method::POST,
            "GET" => Method::GET,
            other => {
                return Err(SenderError::InvalidConfiguration(format!(
                    "Unsupported HTTP method: {other}"
                )))
            }
        };
        if config.url.is_empty() {
            return Err(SenderError::InvalidConfiguration(
                "webhook url is empty".to_string(),
            ));
        }
        Ok(Self {
            client: Client::new(),
            config,
            method,
        })
    }

    pub fn render_body(&self, notification: &OutboundNotification) -> Result<String, SenderError> {
        let template = self
            .config
            .body_template
            .as_deref()
            .unwrap_or(DEFAULT_BODY_TEMPLATE);
        let context = Context::from_serialize(notification)
            .map_err(|e| SenderError::TemplatingError(e.to_string()))?;
        Tera::one_off(template, &context, false).map_err(|e| SenderError::TemplatingError(e.to_string()))
    }

    fn headers(&self) -> Result<header::HeaderMap, SenderError> {
        let mut header_map = header::HeaderMap::new();
        for (key, value) in &self.config.headers {
            let header_name = header::HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| SenderError::InvalidConfiguration(format!("Invalid header name: {e}")))?;
            let header_value = header::HeaderValue::from_str(value)
                .map_err(|e| SenderError::InvalidConfiguration(format!("Invalid header value: {e}")))?;
            header_map.insert(header_name, header_value);
        }
        Ok(header_map)
    }
}

#[async_trait]
impl NotificationSender for WebhookSender {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn send(&self, notification: &OutboundNotification) -> Result<(), SenderError> {
        let mut request_builder = self
            .client
            .request(self.method.clone(), &self.config.url)
            .headers(self.headers()?);

        if self.method == Method::POST {
            request_builder = request_builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(self.render_body(notification)?);
        } else {
            request_builder = request_builder.query(&[
                ("event", notification.event.as_str()),
                ("message", notification.message.as_str()),
            ]);
        }

        let response = request_builder.send().await?;
        let status = response.status();

        if !status.is_success() {
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error body".to_string());
            return Err(SenderError::SendFailed(format!(
                "Webhook returned non-success status: {status}. Body: {error_body}"
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn notification() -> OutboundNotification {
        OutboundNotification {
            event: "offline".into(),
            clients: vec!["alpha".into()],
            message: "alpha \"edge\" is offline".into(),
            emoji: "!".into(),
            time: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    fn config() -> WebhookConfig {
        WebhookConfig {
            url: "http://127.0.0.1:9/hook".into(),
            method: "post".into(),
            headers: HashMap::new(),
            body_template: None,
        }
    }

    #[test]
    fn default_body_is_valid_json() {
        let sender = WebhookSender::new(config()).unwrap();
        let body = sender.render_body(&notification()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["event"], "offline");
        assert_eq!(value["clients"][0], "alpha");
        assert_eq!(value["message"], "alpha \"edge\" is offline");
    }

    #[test]
    fn custom_template_is_used() {
        let mut cfg = config();
        cfg.body_template = Some("{{ emoji }} {{ message }}".into());
        let sender = WebhookSender::new(cfg).unwrap();
        assert_eq!(
            sender.render_body(&notification()).unwrap(),
            "! alpha \"edge\" is offline"
        );
    }

    #[test]
    fn unsupported_method_is_rejected() {
        let mut cfg = config();
        cfg.method = "PATCH".into();
        assert!(matches!(
            WebhookSender::new(cfg),
            Err(SenderError::InvalidConfiguration(_))
        ));
    }
}
