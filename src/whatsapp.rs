use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;

use crate::{
    config::{Config, WhatsappCredentials},
    error::{PanelError, PanelResult, ProviderFailure},
    types::TemplateRef,
};

/// What the provider hands back for an accepted send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderReceipt {
    pub message_id: String,
}

/// The outbound half of the messaging provider.
///
/// Implementations report missing credentials as `PanelError::Unconfigured`
/// and provider rejections as `PanelError::Provider`.
#[async_trait]
pub trait MessagingApi: Send + Sync {
    async fn send_text(&self, to: &str, text: &str) -> PanelResult<ProviderReceipt>;

    async fn send_template(&self, to: &str, template: &TemplateRef) -> PanelResult<ProviderReceipt>;
}

/// WhatsApp Cloud API client over the Graph `/{phone_number_id}/messages` endpoint.
pub struct CloudApiClient {
    http: reqwest::Client,
    credentials: Option<WhatsappCredentials>,
    api_base: String,
    api_version: String,
}

impl CloudApiClient {
    pub fn new(
        http: reqwest::Client,
        credentials: Option<WhatsappCredentials>,
        api_base: impl Into<String>,
        api_version: impl Into<String>,
    ) -> Self {
        Self {
            http,
            credentials,
            api_base: api_base.into(),
            api_version: api_version.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            reqwest::Client::new(),
            config.credentials.clone(),
            config.api_base.clone(),
            config.api_version.clone(),
        )
    }

    fn credentials(&self) -> PanelResult<&WhatsappCredentials> {
        self.credentials.as_ref().ok_or_else(|| {
            PanelError::Unconfigured(
                "missing WHATSAPP_TOKEN or WHATSAPP_PHONE_NUMBER_ID".to_string(),
            )
        })
    }

    async fn post_message(&self, payload: Value) -> PanelResult<ProviderReceipt> {
        let credentials = self.credentials()?;
        let url = format!(
            "{}/{}/{}/messages",
            self.api_base, self.api_version, credentials.phone_number_id
        );

        let response = self
            .http
            .post(url)
            .bearer_auth(&credentials.access_token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| PanelError::Provider(ProviderFailure::transport(e)))?;

        let status = response.status();
        let raw_body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(PanelError::Provider(ProviderFailure::from_response(
                status.as_u16(),
                raw_body,
            )));
        }

        parse_receipt(&raw_body).ok_or_else(|| {
            PanelError::Provider(ProviderFailure {
                status_code: status.as_u16(),
                code: None,
                subcode: None,
                message: "provider response carried no message id".to_string(),
                details: None,
                raw_body,
            })
        })
    }
}

pub fn text_payload(to: &str, text: &str) -> Value {
    json!({
        "messaging_product": "whatsapp",
        "recipient_type": "individual",
        "to": to,
        "type": "text",
        "text": {
            "preview_url": false,
            "body": text
        }
    })
}

pub fn template_payload(to: &str, template: &TemplateRef) -> Value {
    json!({
        "messaging_product": "whatsapp",
        "to": to,
        "type": "template",
        "template": {
            "name": template.name,
            "language": { "code": template.language }
        }
    })
}

/// Pulls `messages[0].id` out of a successful send response.
pub fn parse_receipt(raw_body: &str) -> Option<ProviderReceipt> {
    let body = serde_json::from_str::<Value>(raw_body).ok()?;
    let message_id = body
        .get("messages")
        .and_then(Value::as_array)
        .and_then(|messages| messages.first())
        .and_then(|m| m.get("id"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|id| !id.is_empty())?;
    Some(ProviderReceipt {
        message_id: message_id.to_string(),
    })
}

#[async_trait]
impl MessagingApi for CloudApiClient {
    async fn send_text(&self, to: &str, text: &str) -> PanelResult<ProviderReceipt> {
        self.post_message(text_payload(to, text)).await
    }

    async fn send_template(&self, to: &str, template: &TemplateRef) -> PanelResult<ProviderReceipt> {
        self.post_message(template_payload(to, template)).await
    }
}

/// Checks the `X-Hub-Signature-256` header against the raw webhook body.
/// An empty `app_secret` disables the check.
pub fn verify_signature(app_secret: &str, signature_header: Option<&str>, body: &[u8]) -> bool {
    if app_secret.is_empty() {
        return true;
    }
    let signature = signature_header.unwrap_or("").trim();
    let signature = signature
        .strip_prefix("sha256=")
        .unwrap_or(signature)
        .trim();
    if signature.is_empty() {
        return false;
    }
    let Ok(signature_bytes) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature_bytes).is_ok()
}

#[cfg(test)]
pub(crate) fn sign(app_secret: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(app_secret.as_bytes()).expect("hmac key");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}
