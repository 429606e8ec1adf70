use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use uuid::Uuid;

use crate::{
    error::PanelResult,
    store::{display_name, ConversationStore},
    types::{
        Conversation, ConversationSummary, DeliveryStatus, Direction, Message, NewMessage,
        StatusUpdate,
    },
};

const MESSAGE_COLUMNS: &str =
    "id, wa_id, direction, text, at, status, provider_message_id, template_name";

/// Postgres-backed store. Schema lives in `migrations/`.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> PanelResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn parse_conversation_row(row: &sqlx::postgres::PgRow) -> Conversation {
    Conversation {
        wa_id: row.get("wa_id"),
        name: row.get("name"),
        created_at: row.get("created_at"),
        last_message_at: row.get("last_message_at"),
    }
}

fn parse_message_row(row: &sqlx::postgres::PgRow) -> Message {
    let direction: String = row.get("direction");
    let status: String = row.get("status");
    Message {
        id: row.get("id"),
        wa_id: row.get("wa_id"),
        direction: Direction::parse(&direction).unwrap_or(Direction::In),
        text: row.get("text"),
        at: row.get("at"),
        status: DeliveryStatus::normalize(&status),
        provider_message_id: row.get("provider_message_id"),
        template_name: row.get("template_name"),
    }
}

#[async_trait]
impl ConversationStore for PgStore {
    async fn upsert_conversation(
        &self,
        wa_id: &str,
        name: Option<&str>,
        at: &str,
    ) -> PanelResult<Conversation> {
        let enrich = name.map(str::trim).filter(|n| !n.is_empty());
        let row = sqlx::query(
            r#"
            INSERT INTO conversations (wa_id, name, created_at, last_message_at)
            VALUES ($1, $2, $3, NULL)
            ON CONFLICT (wa_id) DO UPDATE SET
                name = COALESCE($4, conversations.name)
            RETURNING wa_id, name, created_at, last_message_at
            "#,
        )
        .bind(wa_id)
        .bind(display_name(wa_id, name))
        .bind(at)
        .bind(enrich)
        .fetch_one(&self.pool)
        .await?;
        Ok(parse_conversation_row(&row))
    }

    async fn touch_conversation(&self, wa_id: &str, at: &str) -> PanelResult<()> {
        sqlx::query(
            "UPDATE conversations \
             SET last_message_at = GREATEST(COALESCE(last_message_at, ''), $2) \
             WHERE wa_id = $1",
        )
        .bind(wa_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_message(&self, message: NewMessage) -> PanelResult<Option<Message>> {
        let row = sqlx::query(&format!(
            "INSERT INTO messages ({MESSAGE_COLUMNS}) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8) \
             ON CONFLICT (provider_message_id) DO NOTHING \
             RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(&message.wa_id)
        .bind(message.direction.as_str())
        .bind(&message.text)
        .bind(&message.at)
        .bind(message.status.as_str())
        .bind(&message.provider_message_id)
        .bind(&message.template_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(parse_message_row))
    }

    async fn update_status(
        &self,
        provider_message_id: &str,
        status: DeliveryStatus,
        forward_only: bool,
    ) -> PanelResult<StatusUpdate> {
        let from = DeliveryStatus::allowed_predecessors(status, forward_only)
            .into_iter()
            .map(|s| s.as_str().to_string())
            .collect::<Vec<_>>();
        let updated = sqlx::query(
            "UPDATE messages SET status = $2 \
             WHERE provider_message_id = $1 AND status = ANY($3::text[])",
        )
        .bind(provider_message_id)
        .bind(status.as_str())
        .bind(&from)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() > 0 {
            return Ok(StatusUpdate::Applied);
        }

        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM messages WHERE provider_message_id = $1)",
        )
        .bind(provider_message_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(if exists {
            StatusUpdate::Unchanged
        } else {
            StatusUpdate::UnknownMessage
        })
    }

    async fn get_conversation(&self, wa_id: &str) -> PanelResult<Option<Conversation>> {
        let row = sqlx::query(
            "SELECT wa_id, name, created_at, last_message_at FROM conversations WHERE wa_id = $1",
        )
        .bind(wa_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(parse_conversation_row))
    }

    async fn list_conversations(&self) -> PanelResult<Vec<ConversationSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT c.wa_id, c.name, c.created_at, c.last_message_at,
                   m.id AS m_id, m.direction AS m_direction, m.text AS m_text, m.at AS m_at,
                   m.status AS m_status, m.provider_message_id AS m_provider_message_id,
                   m.template_name AS m_template_name
            FROM conversations c
            LEFT JOIN LATERAL (
                SELECT id, direction, text, at, status, provider_message_id, template_name
                FROM messages
                WHERE messages.wa_id = c.wa_id
                ORDER BY at DESC, seq DESC
                LIMIT 1
            ) m ON true
            ORDER BY COALESCE(c.last_message_at, c.created_at) DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let conversation = parse_conversation_row(row);
                let last = row.get::<Option<String>, _>("m_id").map(|id| {
                    let direction: String = row.get("m_direction");
                    let status: String = row.get("m_status");
                    Message {
                        id,
                        wa_id: conversation.wa_id.clone(),
                        direction: Direction::parse(&direction).unwrap_or(Direction::In),
                        text: row.get("m_text"),
                        at: row.get("m_at"),
                        status: DeliveryStatus::normalize(&status),
                        provider_message_id: row.get("m_provider_message_id"),
                        template_name: row.get("m_template_name"),
                    }
                });
                ConversationSummary {
                    wa_id: conversation.wa_id,
                    name: conversation.name,
                    created_at: conversation.created_at,
                    last_message_at: conversation.last_message_at,
                    last,
                }
            })
            .collect())
    }

    async fn list_messages(&self, wa_id: &str) -> PanelResult<Vec<Message>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE wa_id = $1 ORDER BY at ASC, seq ASC"
        ))
        .bind(wa_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(parse_message_row).collect())
    }

    async fn delete_conversation(&self, wa_id: &str) -> PanelResult<bool> {
        let deleted = sqlx::query("DELETE FROM conversations WHERE wa_id = $1")
            .bind(wa_id)
            .execute(&self.pool)
            .await?;
        Ok(deleted.rows_affected() > 0)
    }
}
