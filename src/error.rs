use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

/// A failure reported by the messaging provider, kept whole for operators.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderFailure {
    /// HTTP status, or 0 when the request never got a response.
    pub status_code: u16,
    pub code: Option<i64>,
    pub subcode: Option<i64>,
    pub message: String,
    pub details: Option<String>,
    pub raw_body: String,
}

impl ProviderFailure {
    pub fn transport(err: impl ToString) -> Self {
        let message = err.to_string();
        Self {
            status_code: 0,
            code: None,
            subcode: None,
            raw_body: message.clone(),
            message,
            details: None,
        }
    }

    /// Builds a failure from a Graph API error response.
    pub fn from_response(status_code: u16, raw_body: String) -> Self {
        let body = serde_json::from_str::<Value>(&raw_body).unwrap_or(Value::Null);
        let error = body.get("error").cloned().unwrap_or(Value::Null);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("provider returned HTTP {status_code}"));
        let details = error
            .get("error_data")
            .and_then(|d| d.get("details"))
            .and_then(Value::as_str)
            .map(str::to_string);
        Self {
            status_code,
            code: error.get("code").and_then(Value::as_i64),
            subcode: error.get("error_subcode").and_then(Value::as_i64),
            message,
            details,
            raw_body,
        }
    }

    /// Message plus details, the text the window classifier inspects.
    pub fn full_text(&self) -> String {
        match &self.details {
            Some(details) if !details.is_empty() => format!("{} {}", self.message, details),
            _ => self.message.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PanelError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("messaging provider is not configured: {0}")]
    Unconfigured(String),
    #[error("provider error: {}", .0.message)]
    Provider(ProviderFailure),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub type PanelResult<T> = Result<T, PanelError>;

impl PanelError {
    pub fn kind(&self) -> &'static str {
        match self {
            PanelError::InvalidInput(_) => "invalid_input",
            PanelError::Unconfigured(_) => "unconfigured",
            PanelError::Provider(_) => "provider_error",
            PanelError::NotFound(_) => "not_found",
            PanelError::Database(_) | PanelError::Migration(_) => "storage_error",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            PanelError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            PanelError::NotFound(_) => StatusCode::NOT_FOUND,
            PanelError::Provider(_) => StatusCode::BAD_GATEWAY,
            PanelError::Unconfigured(_)
            | PanelError::Database(_)
            | PanelError::Migration(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for PanelError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "error": self.to_string(),
            "kind": self.kind(),
        });
        if let PanelError::Provider(failure) = &self {
            body["detail"] = json!(failure);
        }
        (self.status_code(), Json(body)).into_response()
    }
}
