use super::{build_message, next_created_at, MessageStore};
use crate::error::AppResult;
use crate::models::{
    conversation_key, direct_conversation_key, room_conversation_key, Conversation,
    ConversationKind, Message, NewMessage, Target, Translation,
};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::HashMap;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

pub async fn create_pool(database_url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
        .context("Failed to connect to PostgreSQL")?;

    Ok(pool)
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS conversations (
        id UUID PRIMARY KEY,
        conversation_key TEXT NOT NULL UNIQUE,
        kind TEXT NOT NULL,
        participant_low TEXT,
        participant_high TEXT,
        room_id TEXT,
        message_count BIGINT NOT NULL DEFAULT 0,
        last_message_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS messages (
        id UUID PRIMARY KEY,
        conversation_id UUID NOT NULL REFERENCES conversations(id),
        position BIGINT NOT NULL,
        sender_id TEXT NOT NULL,
        receiver_id TEXT,
        room_id TEXT,
        text_original TEXT NOT NULL,
        text_translated TEXT NOT NULL,
        source_lang TEXT NOT NULL,
        target_lang TEXT NOT NULL,
        translator_model TEXT NOT NULL,
        image_url TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        UNIQUE (conversation_id, position)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS message_translations (
        message_id UUID NOT NULL REFERENCES messages(id),
        lang TEXT NOT NULL,
        text TEXT NOT NULL,
        model TEXT NOT NULL,
        PRIMARY KEY (message_id, lang)
    )
    "#,
];

#[derive(Debug, sqlx::FromRow)]
struct ConversationRow {
    id: Uuid,
    kind: String,
    participant_low: Option<String>,
    participant_high: Option<String>,
    room_id: Option<String>,
    message_count: i64,
    last_message_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl ConversationRow {
    fn into_conversation(self, message_ids: Vec<Uuid>) -> Conversation {
        let kind = match (self.kind.as_str(), self.room_id) {
            ("room", Some(room_id)) => ConversationKind::Room { room_id },
            _ => ConversationKind::Direct {
                participants: [
                    self.participant_low.unwrap_or_default(),
                    self.participant_high.unwrap_or_default(),
                ],
            },
        };

        Conversation {
            id: self.id,
            kind,
            message_ids,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct MessageRow {
    id: Uuid,
    sender_id: String,
    receiver_id: Option<String>,
    room_id: Option<String>,
    text_original: String,
    text_translated: String,
    source_lang: String,
    target_lang: String,
    translator_model: String,
    image_url: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Message {
            id: row.id,
            sender_id: row.sender_id,
            receiver_id: row.receiver_id,
            room_id: row.room_id,
            text_original: row.text_original,
            text_translated: row.text_translated,
            source_lang: row.source_lang,
            target_lang: row.target_lang,
            translator_model: row.translator_model,
            image_url: row.image_url,
            created_at: row.created_at,
            translations: Vec::new(),
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TranslationRow {
    message_id: Uuid,
    lang: String,
    text: String,
    model: String,
}

/// PostgreSQL-backed message store.
///
/// The unique `conversation_key` column serializes concurrent first sends:
/// both writers insert with `ON CONFLICT DO NOTHING` and read back the single
/// surviving row. Appends lock the conversation row, so positions and
/// timestamps within a conversation never go backwards.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the messaging tables if they do not exist.
    pub async fn init_schema(&self) -> anyhow::Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("Failed to create messaging schema")?;
        }
        info!("Messaging schema ready");
        Ok(())
    }

    async fn ensure_conversation(
        tx: &mut Transaction<'_, Postgres>,
        key: &str,
        kind: &ConversationKind,
    ) -> AppResult<()> {
        let (kind_name, low, high, room_id) = match kind {
            ConversationKind::Direct { participants } => (
                "direct",
                Some(participants[0].as_str()),
                Some(participants[1].as_str()),
                None,
            ),
            ConversationKind::Room { room_id } => ("room", None, None, Some(room_id.as_str())),
        };

        sqlx::query(
            r#"
            INSERT INTO conversations (id, conversation_key, kind, participant_low, participant_high, room_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (conversation_key) DO NOTHING
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(key)
        .bind(kind_name)
        .bind(low)
        .bind(high)
        .bind(room_id)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    async fn messages_by_key(&self, key: &str) -> AppResult<Vec<Message>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT m.id, m.sender_id, m.receiver_id, m.room_id, m.text_original,
                   m.text_translated, m.source_lang, m.target_lang, m.translator_model,
                   m.image_url, m.created_at
            FROM messages m
            JOIN conversations c ON c.id = m.conversation_id
            WHERE c.conversation_key = $1
            ORDER BY m.position
            "#,
        )
        .bind(key)
        .fetch_all(&self.pool)
        .await?;

        let mut messages: Vec<Message> = rows.into_iter().map(Message::from).collect();
        if messages.is_empty() {
            return Ok(messages);
        }

        let ids: Vec<Uuid> = messages.iter().map(|m| m.id).collect();
        let translation_rows = sqlx::query_as::<_, TranslationRow>(
            r#"
            SELECT message_id, lang, text, model
            FROM message_translations
            WHERE message_id = ANY($1)
            ORDER BY lang
            "#,
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut by_message: HashMap<Uuid, Vec<Translation>> = HashMap::new();
        for row in translation_rows {
            by_message.entry(row.message_id).or_default().push(Translation {
                lang: row.lang,
                text: row.text,
                model: row.model,
            });
        }
        for message in &mut messages {
            if let Some(translations) = by_message.remove(&message.id) {
                message.translations = translations;
            }
        }

        Ok(messages)
    }
}

#[async_trait]
impl MessageStore for PgStore {
    async fn get_or_create_direct(&self, user_a: &str, user_b: &str) -> AppResult<Conversation> {
        let key = direct_conversation_key(user_a, user_b);
        let mut participants = [user_a.to_string(), user_b.to_string()];
        participants.sort();

        let mut tx = self.pool.begin().await?;
        Self::ensure_conversation(&mut tx, &key, &ConversationKind::Direct { participants })
            .await?;

        let row = sqlx::query_as::<_, ConversationRow>(
            r#"
            SELECT id, kind, participant_low, participant_high, room_id,
                   message_count, last_message_at, created_at
            FROM conversations
            WHERE conversation_key = $1
            "#,
        )
        .bind(&key)
        .fetch_one(&mut *tx)
        .await?;

        let message_ids: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id FROM messages
            WHERE conversation_id = $1
            ORDER BY position
            "#,
        )
        .bind(row.id)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(row.into_conversation(message_ids.into_iter().map(|(id,)| id).collect()))
    }

    async fn create_message(&self, message: NewMessage) -> AppResult<Message> {
        message.validate()?;

        let key = conversation_key(&message.sender_id, &message.target);
        let kind = match &message.target {
            Target::Direct { receiver_id } => {
                let mut participants = [message.sender_id.clone(), receiver_id.clone()];
                participants.sort();
                ConversationKind::Direct { participants }
            }
            Target::Room { room_id } => ConversationKind::Room {
                room_id: room_id.clone(),
            },
        };

        let mut tx = self.pool.begin().await?;
        Self::ensure_conversation(&mut tx, &key, &kind).await?;

        let conversation = sqlx::query_as::<_, ConversationRow>(
            r#"
            SELECT id, kind, participant_low, participant_high, room_id,
                   message_count, last_message_at, created_at
            FROM conversations
            WHERE conversation_key = $1
            FOR UPDATE
            "#,
        )
        .bind(&key)
        .fetch_one(&mut *tx)
        .await?;

        let position = conversation.message_count + 1;
        let created_at = next_created_at(conversation.last_message_at);
        let message = build_message(Uuid::now_v7(), message, created_at);

        sqlx::query(
            r#"
            INSERT INTO messages (
                id, conversation_id, position, sender_id, receiver_id, room_id,
                text_original, text_translated, source_lang, target_lang,
                translator_model, image_url, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(message.id)
        .bind(conversation.id)
        .bind(position)
        .bind(&message.sender_id)
        .bind(&message.receiver_id)
        .bind(&message.room_id)
        .bind(&message.text_original)
        .bind(&message.text_translated)
        .bind(&message.source_lang)
        .bind(&message.target_lang)
        .bind(&message.translator_model)
        .bind(&message.image_url)
        .bind(message.created_at)
        .execute(&mut *tx)
        .await?;

        for translation in &message.translations {
            sqlx::query(
                r#"
                INSERT INTO message_translations (message_id, lang, text, model)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(message.id)
            .bind(&translation.lang)
            .bind(&translation.text)
            .bind(&translation.model)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            UPDATE conversations
            SET message_count = $2, last_message_at = $3
            WHERE id = $1
            "#,
        )
        .bind(conversation.id)
        .bind(position)
        .bind(message.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(message)
    }

    async fn conversation_messages(&self, user_a: &str, user_b: &str) -> AppResult<Vec<Message>> {
        self.messages_by_key(&direct_conversation_key(user_a, user_b))
            .await
    }

    async fn room_messages(&self, room_id: &str) -> AppResult<Vec<Message>> {
        self.messages_by_key(&room_conversation_key(room_id)).await
    }
}
