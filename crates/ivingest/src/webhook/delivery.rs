//! One HTTP POST per delivery attempt.

use std::time::Duration;

use crate::config::WebhookConfig;
use crate::error::WebhookError;

pub const HEADER_SIGNATURE: &str = "X-Webhook-Signature";
pub const HEADER_EVENT: &str = "X-Webhook-Event";
pub const HEADER_DELIVERY: &str = "X-Webhook-Delivery";
pub const HEADER_ATTEMPT: &str = "X-Webhook-Attempt";

/// Outcome of a single attempt.
///
/// No completed response is classified as a permanent failure in this
/// version: anything outside [200, 300) and every transport error or timeout
/// is transient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { status: u16 },
    TransientFail { status: Option<u16>, reason: String },
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }
}

/// Parameters for one attempt.
#[derive(Debug, Clone)]
pub struct DeliveryRequest<'a> {
    pub url: &'a str,
    /// The exact serialized body the signature was computed over.
    pub body: &'a str,
    pub signature: &'a str,
    pub event_type: &'a str,
    /// Per-attempt delivery id.
    pub delivery_id: &'a str,
    /// 1-indexed attempt number.
    pub attempt: u32,
}

pub struct DeliveryClient {
    client: reqwest::Client,
}

impl DeliveryClient {
    pub fn new(config: &WebhookConfig) -> Result<Self, WebhookError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self { client })
    }

    pub async fn deliver(&self, request: DeliveryRequest<'_>) -> DeliveryOutcome {
        let response = self
            .client
            .post(request.url)
            .header("Content-Type", "application/json")
            .header(HEADER_SIGNATURE, request.signature)
            .header(HEADER_EVENT, request.event_type)
            .header(HEADER_DELIVERY, request.delivery_id)
            .header(HEADER_ATTEMPT, request.attempt.to_string())
            .body(request.body.to_string())
            .send()
            .await;

        match response {
            Ok(response) => {
                let status = response.status().as_u16();
                if (200..300).contains(&status) {
                    DeliveryOutcome::Delivered { status }
                } else {
                    DeliveryOutcome::TransientFail {
                        status: Some(status),
                        reason: format!("endpoint returned {}", status),
                    }
                }
            }
            Err(e) => DeliveryOutcome::TransientFail {
                status: None,
                reason: if e.is_timeout() {
                    "request timed out".to_string()
                } else {
                    format!("transport error: {}", e)
                },
            },
        }
    }
}
