use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    error::{PanelError, PanelResult},
    types::{Conversation, ConversationSummary, DeliveryStatus, Message, NewMessage, StatusUpdate},
};

/// Persistence for conversations and their message histories.
///
/// Every operation is a single atomic step; callers never hold a
/// transaction across calls. Ids passed in are already canonical.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Creates the conversation or enriches its name. A `None` or blank name
    /// never replaces an existing one; a new conversation falls back to its id.
    async fn upsert_conversation(
        &self,
        wa_id: &str,
        name: Option<&str>,
        at: &str,
    ) -> PanelResult<Conversation>;

    /// Moves `last_message_at` forward to `at` (never backwards).
    async fn touch_conversation(&self, wa_id: &str, at: &str) -> PanelResult<()>;

    /// Inserts a message. Returns `None` when a message with the same
    /// provider id is already stored.
    async fn insert_message(&self, message: NewMessage) -> PanelResult<Option<Message>>;

    async fn update_status(
        &self,
        provider_message_id: &str,
        status: DeliveryStatus,
        forward_only: bool,
    ) -> PanelResult<StatusUpdate>;

    async fn get_conversation(&self, wa_id: &str) -> PanelResult<Option<Conversation>>;

    /// Most recently active first, each with its latest message.
    async fn list_conversations(&self) -> PanelResult<Vec<ConversationSummary>>;

    /// Oldest first.
    async fn list_messages(&self, wa_id: &str) -> PanelResult<Vec<Message>>;

    /// Deletes the conversation and its messages. `false` when it did not exist.
    async fn delete_conversation(&self, wa_id: &str) -> PanelResult<bool>;
}

pub(crate) fn display_name(wa_id: &str, name: Option<&str>) -> String {
    name.map(str::trim)
        .filter(|n| !n.is_empty())
        .unwrap_or(wa_id)
        .to_string()
}

fn activity_key(conversation: &Conversation) -> &str {
    conversation
        .last_message_at
        .as_deref()
        .unwrap_or(&conversation.created_at)
}

#[derive(Default)]
struct MemoryState {
    conversations: HashMap<String, Conversation>,
    /// Kept in insertion order; histories are sorted on read.
    messages: Vec<Message>,
}

/// In-process store used when no database is configured, and by tests.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn upsert_conversation(
        &self,
        wa_id: &str,
        name: Option<&str>,
        at: &str,
    ) -> PanelResult<Conversation> {
        let mut state = self.state.write().await;
        let conversation = state
            .conversations
            .entry(wa_id.to_string())
            .or_insert_with(|| Conversation {
                wa_id: wa_id.to_string(),
                name: wa_id.to_string(),
                created_at: at.to_string(),
                last_message_at: None,
            });
        if let Some(name) = name.map(str::trim).filter(|n| !n.is_empty()) {
            conversation.name = name.to_string();
        }
        Ok(conversation.clone())
    }

    async fn touch_conversation(&self, wa_id: &str, at: &str) -> PanelResult<()> {
        let mut state = self.state.write().await;
        let Some(conversation) = state.conversations.get_mut(wa_id) else {
            return Err(PanelError::NotFound(format!("conversation {wa_id}")));
        };
        let newer = conversation
            .last_message_at
            .as_deref()
            .map_or(true, |current| at > current);
        if newer {
            conversation.last_message_at = Some(at.to_string());
        }
        Ok(())
    }

    async fn insert_message(&self, message: NewMessage) -> PanelResult<Option<Message>> {
        let mut state = self.state.write().await;
        if !state.conversations.contains_key(&message.wa_id) {
            return Err(PanelError::NotFound(format!("conversation {}", message.wa_id)));
        }
        if let Some(provider_id) = message.provider_message_id.as_deref() {
            let duplicate = state
                .messages
                .iter()
                .any(|m| m.provider_message_id.as_deref() == Some(provider_id));
            if duplicate {
                return Ok(None);
            }
        }
        let stored = Message {
            id: Uuid::new_v4().to_string(),
            wa_id: message.wa_id,
            direction: message.direction,
            text: message.text,
            at: message.at,
            status: message.status,
            provider_message_id: message.provider_message_id,
            template_name: message.template_name,
        };
        state.messages.push(stored.clone());
        Ok(Some(stored))
    }

    async fn update_status(
        &self,
        provider_message_id: &str,
        status: DeliveryStatus,
        forward_only: bool,
    ) -> PanelResult<StatusUpdate> {
        let mut state = self.state.write().await;
        let Some(message) = state
            .messages
            .iter_mut()
            .find(|m| m.provider_message_id.as_deref() == Some(provider_message_id))
        else {
            return Ok(StatusUpdate::UnknownMessage);
        };
        if !message.status.can_transition_to(status, forward_only) {
            return Ok(StatusUpdate::Unchanged);
        }
        message.status = status;
        Ok(StatusUpdate::Applied)
    }

    async fn get_conversation(&self, wa_id: &str) -> PanelResult<Option<Conversation>> {
        let state = self.state.read().await;
        Ok(state.conversations.get(wa_id).cloned())
    }

    async fn list_conversations(&self) -> PanelResult<Vec<ConversationSummary>> {
        let state = self.state.read().await;
        let mut conversations = state.conversations.values().collect::<Vec<_>>();
        conversations.sort_by(|a, b| activity_key(b).cmp(activity_key(a)));
        Ok(conversations
            .into_iter()
            .map(|c| {
                // Latest by timestamp; ties go to the later insert.
                let last = state
                    .messages
                    .iter()
                    .filter(|m| m.wa_id == c.wa_id)
                    .fold(None::<&Message>, |best, m| match best {
                        Some(b) if b.at > m.at => Some(b),
                        _ => Some(m),
                    })
                    .cloned();
                ConversationSummary {
                    wa_id: c.wa_id.clone(),
                    name: c.name.clone(),
                    created_at: c.created_at.clone(),
                    last_message_at: c.last_message_at.clone(),
                    last,
                }
            })
            .collect())
    }

    async fn list_messages(&self, wa_id: &str) -> PanelResult<Vec<Message>> {
        let state = self.state.read().await;
        let mut messages = state
            .messages
            .iter()
            .filter(|m| m.wa_id == wa_id)
            .cloned()
            .collect::<Vec<_>>();
        messages.sort_by(|a, b| a.at.cmp(&b.at));
        Ok(messages)
    }

    async fn delete_conversation(&self, wa_id: &str) -> PanelResult<bool> {
        let mut state = self.state.write().await;
        if state.conversations.remove(wa_id).is_none() {
            return Ok(false);
        }
        state.messages.retain(|m| m.wa_id != wa_id);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Direction;

    fn outbound(wa_id: &str, at: &str, provider_id: &str) -> NewMessage {
        NewMessage {
            wa_id: wa_id.to_string(),
            direction: Direction::Out,
            text: "hi".to_string(),
            at: at.to_string(),
            status: DeliveryStatus::Sent,
            provider_message_id: Some(provider_id.to_string()),
            template_name: None,
        }
    }

    #[tokio::test]
    async fn name_defaults_to_id_and_is_never_blanked() {
        let store = MemoryStore::new();
        let created = store
            .upsert_conversation("5511999990000", Some(""), "2026-01-01T00:00:00.000Z")
            .await
            .unwrap();
        assert_eq!(created.name, "5511999990000");

        let enriched = store
            .upsert_conversation("5511999990000", Some("Maria"), "2026-01-01T00:00:01.000Z")
            .await
            .unwrap();
        assert_eq!(enriched.name, "Maria");
        assert_eq!(enriched.created_at, "2026-01-01T00:00:00.000Z");

        let kept = store
            .upsert_conversation("5511999990000", Some("  "), "2026-01-01T00:00:02.000Z")
            .await
            .unwrap();
        assert_eq!(kept.name, "Maria");
        let kept = store
            .upsert_conversation("5511999990000", None, "2026-01-01T00:00:03.000Z")
            .await
            .unwrap();
        assert_eq!(kept.name, "Maria");
    }

    #[tokio::test]
    async fn duplicate_provider_id_is_not_inserted() {
        let store = MemoryStore::new();
        store
            .upsert_conversation("551", None, "2026-01-01T00:00:00.000Z")
            .await
            .unwrap();
        let first = store
            .insert_message(outbound("551", "2026-01-01T00:00:01.000Z", "wamid.A"))
            .await
            .unwrap();
        assert!(first.is_some());
        let second = store
            .insert_message(outbound("551", "2026-01-01T00:00:02.000Z", "wamid.A"))
            .await
            .unwrap();
        assert!(second.is_none());
        assert_eq!(store.list_messages("551").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn insert_requires_conversation() {
        let store = MemoryStore::new();
        let err = store
            .insert_message(outbound("551", "2026-01-01T00:00:01.000Z", "wamid.A"))
            .await
            .unwrap_err();
        assert!(matches!(err, PanelError::NotFound(_)));
    }

    #[tokio::test]
    async fn status_updates_follow_rank() {
        let store = MemoryStore::new();
        store
            .upsert_conversation("551", None, "2026-01-01T00:00:00.000Z")
            .await
            .unwrap();
        store
            .insert_message(outbound("551", "2026-01-01T00:00:01.000Z", "wamid.A"))
            .await
            .unwrap();

        let read = store
            .update_status("wamid.A", DeliveryStatus::Read, true)
            .await
            .unwrap();
        assert_eq!(read, StatusUpdate::Applied);
        let late = store
            .update_status("wamid.A", DeliveryStatus::Delivered, true)
            .await
            .unwrap();
        assert_eq!(late, StatusUpdate::Unchanged);
        let unknown = store
            .update_status("wamid.X", DeliveryStatus::Delivered, true)
            .await
            .unwrap();
        assert_eq!(unknown, StatusUpdate::UnknownMessage);

        let messages = store.list_messages("551").await.unwrap();
        assert_eq!(messages[0].status, DeliveryStatus::Read);
    }

    #[tokio::test]
    async fn lists_by_recent_activity_with_preview() {
        let store = MemoryStore::new();
        store
            .upsert_conversation("551", None, "2026-01-01T00:00:00.000Z")
            .await
            .unwrap();
        store
            .upsert_conversation("552", None, "2026-01-01T00:00:00.000Z")
            .await
            .unwrap();
        store
            .insert_message(outbound("552", "2026-01-01T00:00:05.000Z", "wamid.B"))
            .await
            .unwrap();
        store
            .touch_conversation("552", "2026-01-01T00:00:05.000Z")
            .await
            .unwrap();
        // An older event never moves activity backwards.
        store
            .touch_conversation("552", "2026-01-01T00:00:01.000Z")
            .await
            .unwrap();

        let list = store.list_conversations().await.unwrap();
        assert_eq!(list[0].wa_id, "552");
        assert_eq!(
            list[0].last_message_at.as_deref(),
            Some("2026-01-01T00:00:05.000Z")
        );
        assert_eq!(
            list[0].last.as_ref().and_then(|m| m.provider_message_id.as_deref()),
            Some("wamid.B")
        );
        assert!(list[1].last.is_none());
    }

    #[tokio::test]
    async fn delete_cascades_messages() {
        let store = MemoryStore::new();
        store
            .upsert_conversation("551", None, "2026-01-01T00:00:00.000Z")
            .await
            .unwrap();
        store
            .insert_message(outbound("551", "2026-01-01T00:00:01.000Z", "wamid.A"))
            .await
            .unwrap();
        assert!(store.delete_conversation("551").await.unwrap());
        assert!(!store.delete_conversation("551").await.unwrap());
        assert!(store.list_messages("551").await.unwrap().is_empty());
        assert_eq!(
            store
                .update_status("wamid.A", DeliveryStatus::Read, true)
                .await
                .unwrap(),
            StatusUpdate::UnknownMessage
        );
    }
}
