use std::{collections::HashMap, sync::Arc};

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    error::PanelError,
    phone::normalize_wa_id,
    store::ConversationStore,
    types::{iso_from_unix, now_iso, DeliveryStatus, Direction, NewMessage, StatusUpdate},
};

/// Why a single webhook event was skipped. Never leaves the reconciler.
#[derive(Debug, Error)]
enum EventError {
    #[error("malformed webhook event: {0}")]
    Malformed(String),
    #[error(transparent)]
    Store(#[from] PanelError),
}

fn malformed(reason: impl Into<String>) -> EventError {
    EventError::Malformed(reason.into())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub messages_stored: usize,
    pub messages_duplicate: usize,
    pub statuses_applied: usize,
    pub statuses_unchanged: usize,
    pub statuses_dropped: usize,
    pub skipped: usize,
}

/// Applies webhook deliveries (inbound messages and status callbacks) to the store.
pub struct Reconciler {
    store: Arc<dyn ConversationStore>,
    country_code: String,
    forward_only: bool,
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// The `{messages, statuses, contacts}` groupings in a delivery.
///
/// Accepts the Cloud API envelope (`entry[].changes[].value`), a bare array of
/// groupings, or a single grouping.
fn groupings(payload: &Value) -> Vec<&Value> {
    if let Some(entries) = payload.get("entry").and_then(Value::as_array) {
        return entries
            .iter()
            .filter_map(|entry| entry.get("changes").and_then(Value::as_array))
            .flatten()
            .filter_map(|change| change.get("value"))
            .collect();
    }
    match payload {
        Value::Array(items) => items.iter().collect(),
        Value::Object(map)
            if map.contains_key("messages") || map.contains_key("statuses") =>
        {
            vec![payload]
        }
        _ => Vec::new(),
    }
}

fn items<'a>(grouping: &'a Value, key: &str) -> &'a [Value] {
    grouping
        .get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// Display text for an inbound message; structured payloads become placeholders.
pub fn inbound_text(message: &Value) -> Result<String, String> {
    let msg_type = message
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    match msg_type.as_str() {
        "" => Err("message without type".to_string()),
        "text" => message
            .get("text")
            .and_then(|t| t.get("body"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| "text message without body".to_string()),
        "button" => Ok("[button]".to_string()),
        "interactive" => Ok("[interactive]".to_string()),
        other => Ok(format!("[{other}]")),
    }
}

fn event_timestamp(event: &Value) -> Option<String> {
    match event.get("timestamp")? {
        Value::String(raw) => iso_from_unix(raw),
        Value::Number(n) => iso_from_unix(&n.to_string()),
        _ => None,
    }
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        country_code: impl Into<String>,
        forward_only: bool,
    ) -> Self {
        Self {
            store,
            country_code: country_code.into(),
            forward_only,
        }
    }

    pub fn from_config(config: &Config, store: Arc<dyn ConversationStore>) -> Self {
        Self::new(store, config.country_code.clone(), config.status_forward_only)
    }

    fn profile_names(&self, grouping: &Value) -> HashMap<String, String> {
        let mut names = HashMap::new();
        if let Some(profile) = grouping.get("contactProfile") {
            let raw_id = str_field(profile, "waId")
                .or_else(|| str_field(profile, "wa_id"))
                .unwrap_or("");
            let wa_id = normalize_wa_id(raw_id, &self.country_code);
            if let (false, Some(name)) = (wa_id.is_empty(), str_field(profile, "name")) {
                names.insert(wa_id, name.to_string());
            }
        }
        for contact in items(grouping, "contacts") {
            let raw_id = str_field(contact, "wa_id")
                .or_else(|| str_field(contact, "input"))
                .unwrap_or("");
            let wa_id = normalize_wa_id(raw_id, &self.country_code);
            if wa_id.is_empty() {
                continue;
            }
            let name = contact
                .get("profile")
                .and_then(|p| str_field(p, "name"))
                .unwrap_or("");
            if !name.is_empty() {
                names.insert(wa_id, name.to_string());
            }
        }
        names
    }

    /// Applies every event in the delivery. Individual failures are logged and
    /// skipped; this never fails.
    pub async fn apply(&self, payload: &Value) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        for grouping in groupings(payload) {
            if !grouping.is_object() {
                warn!("skipping webhook grouping that is not an object");
                report.skipped += 1;
                continue;
            }
            let names = self.profile_names(grouping);

            for message in items(grouping, "messages") {
                match self.apply_message(message, &names).await {
                    Ok(true) => report.messages_stored += 1,
                    Ok(false) => report.messages_duplicate += 1,
                    Err(err) => {
                        warn!(error = %err, event = %message, "skipping inbound message");
                        report.skipped += 1;
                    }
                }
            }

            for status in items(grouping, "statuses") {
                match self.apply_status(status).await {
                    Ok(StatusUpdate::Applied) => report.statuses_applied += 1,
                    Ok(StatusUpdate::Unchanged) => report.statuses_unchanged += 1,
                    Ok(StatusUpdate::UnknownMessage) => report.statuses_dropped += 1,
                    Err(err) => {
                        warn!(error = %err, event = %status, "skipping status event");
                        report.skipped += 1;
                    }
                }
            }
        }

        info!(
            stored = report.messages_stored,
            duplicate = report.messages_duplicate,
            applied = report.statuses_applied,
            unchanged = report.statuses_unchanged,
            dropped = report.statuses_dropped,
            skipped = report.skipped,
            "webhook delivery reconciled"
        );
        report
    }

    /// `Ok(false)` when the provider id was already stored (redelivery).
    async fn apply_message(
        &self,
        message: &Value,
        names: &HashMap<String, String>,
    ) -> Result<bool, EventError> {
        if !message.is_object() {
            return Err(malformed("message is not an object"));
        }
        let from = str_field(message, "from").ok_or_else(|| malformed("message without sender"))?;
        let wa_id = normalize_wa_id(from, &self.country_code);
        if wa_id.is_empty() {
            return Err(malformed(format!("sender '{from}' is not a phone number")));
        }
        let text = inbound_text(message).map_err(EventError::Malformed)?;
        let at = event_timestamp(message).unwrap_or_else(now_iso);
        let provider_id = str_field(message, "id").map(str::to_string);

        self.store
            .upsert_conversation(&wa_id, names.get(&wa_id).map(String::as_str), &at)
            .await?;
        let inserted = self
            .store
            .insert_message(NewMessage {
                wa_id: wa_id.clone(),
                direction: Direction::In,
                text,
                at: at.clone(),
                status: DeliveryStatus::Read,
                provider_message_id: provider_id.clone(),
                template_name: None,
            })
            .await?;
        if inserted.is_none() {
            debug!(%wa_id, provider_id = ?provider_id, "inbound message already stored");
            return Ok(false);
        }
        self.store.touch_conversation(&wa_id, &at).await?;
        Ok(true)
    }

    async fn apply_status(&self, event: &Value) -> Result<StatusUpdate, EventError> {
        if !event.is_object() {
            return Err(malformed("status is not an object"));
        }
        let provider_id = str_field(event, "id").ok_or_else(|| malformed("status without id"))?;
        let raw_status = event
            .get("status")
            .and_then(Value::as_str)
            .ok_or_else(|| malformed("status without status field"))?;
        let status = DeliveryStatus::normalize(raw_status);

        if status == DeliveryStatus::Failed {
            let reason = event
                .get("errors")
                .and_then(Value::as_array)
                .and_then(|errors| errors.first())
                .map(|e| {
                    format!(
                        "{} {}",
                        e.get("code").map(Value::to_string).unwrap_or_default(),
                        str_field(e, "title").unwrap_or("")
                    )
                })
                .unwrap_or_default();
            warn!(%provider_id, reason = %reason.trim(), "provider reports delivery failure");
        }

        let update = self
            .store
            .update_status(provider_id, status, self.forward_only)
            .await?;
        match update {
            StatusUpdate::Applied => debug!(%provider_id, %status, "status applied"),
            StatusUpdate::Unchanged => debug!(%provider_id, %status, "status unchanged"),
            StatusUpdate::UnknownMessage => {
                debug!(%provider_id, %status, "status for unknown message dropped")
            }
        }
        Ok(update)
    }
}
