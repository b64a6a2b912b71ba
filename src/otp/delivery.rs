//! Pluggable SMS transport.
//!
//! Callers depend only on [`DeliveryProvider`]; the concrete implementation
//! (console logging for development, an HTTP SMS gateway for production) is
//! chosen once at startup by [`provider_from_config`], never by conditional
//! branching at call sites.

use crate::phone;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

/// Provider outcome. A failed receipt is a user-retryable delivery failure,
/// distinct from a validation failure and from infrastructure errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub success: bool,
    pub message_id: Option<String>,
    pub error: Option<String>,
}

impl DeliveryReceipt {
    #[must_use]
    pub fn delivered(message_id: Option<String>) -> Self {
        Self {
            success: true,
            message_id,
            error: None,
        }
    }

    #[must_use]
    pub fn failed(error: &str) -> Self {
        Self {
            success: false,
            message_id: None,
            error: Some(error.to_string()),
        }
    }
}

#[async_trait]
pub trait DeliveryProvider: Send + Sync {
    async fn send_code(&self, phone: &str, code: &str) -> Result<DeliveryReceipt>;

    /// Free-form message delivery. Optional; the default reports the
    /// capability as unsupported without erroring the request.
    async fn send_message(&self, phone: &str, text: &str) -> Result<DeliveryReceipt> {
        let _ = (phone, text);
        Ok(DeliveryReceipt::failed(
            "provider does not support free-form messages",
        ))
    }
}

/// Development transport: writes the code to the log instead of sending it.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleDelivery;

#[async_trait]
impl DeliveryProvider for ConsoleDelivery {
    async fn send_code(&self, phone: &str, code: &str) -> Result<DeliveryReceipt> {
        info!(phone = %phone::format_masked(phone), %code, "console delivery: verification code");
        Ok(DeliveryReceipt::delivered(None))
    }

    async fn send_message(&self, phone: &str, text: &str) -> Result<DeliveryReceipt> {
        info!(phone = %phone::format_masked(phone), %text, "console delivery: message");
        Ok(DeliveryReceipt::delivered(None))
    }
}

/// Production transport: POSTs to an SMS gateway's `/messages` endpoint with
/// bearer authentication. Provider-reported failures come back as failed
/// receipts; transport-level failures propagate as infrastructure errors.
pub struct HttpGatewayDelivery {
    client: Client,
    endpoint: Url,
    api_token: String,
}

impl HttpGatewayDelivery {
    /// # Errors
    /// Returns error if the gateway URL cannot be joined or the HTTP client
    /// cannot be built.
    pub fn new(base_url: &Url, api_token: String) -> Result<Self> {
        let endpoint = base_url
            .join("messages")
            .context("invalid SMS gateway URL")?;
        let client = Client::builder()
            .user_agent(crate::APP_USER_AGENT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            endpoint,
            api_token,
        })
    }

    async fn post(&self, phone: &str, body: &str) -> Result<DeliveryReceipt> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_token)
            .json(&serde_json::json!({ "to": phone, "body": body }))
            .send()
            .await
            .context("SMS gateway unreachable")?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            warn!(phone = %phone::format_masked(phone), %status, "SMS gateway rejected message");
            return Ok(DeliveryReceipt::failed(&format!(
                "gateway returned {status}: {detail}"
            )));
        }

        let message_id = response
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|value| value.get("id").and_then(|id| id.as_str().map(String::from)));
        Ok(DeliveryReceipt::delivered(message_id))
    }
}

#[async_trait]
impl DeliveryProvider for HttpGatewayDelivery {
    async fn send_code(&self, phone: &str, code: &str) -> Result<DeliveryReceipt> {
        // The raw code goes only to the gateway; logs see the masked phone.
        self.post(phone, &format!("Your verification code is {code}"))
            .await
    }

    async fn send_message(&self, phone: &str, text: &str) -> Result<DeliveryReceipt> {
        self.post(phone, text).await
    }
}

/// Transport selection, resolved once at startup.
#[derive(Debug, Clone)]
pub enum DeliveryConfig {
    Console,
    Gateway { url: Url, api_token: String },
}

/// Build the configured provider. All call sites hold the trait object.
///
/// # Errors
/// Returns error if the gateway configuration is invalid.
pub fn provider_from_config(config: &DeliveryConfig) -> Result<Arc<dyn DeliveryProvider>> {
    match config {
        DeliveryConfig::Console => Ok(Arc::new(ConsoleDelivery)),
        DeliveryConfig::Gateway { url, api_token } => Ok(Arc::new(HttpGatewayDelivery::new(
            url,
            api_token.clone(),
        )?)),
    }
}
