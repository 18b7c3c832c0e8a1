//! Message persistence.
//!
//! A message and its place in the conversation sequence are written as one
//! unit. Direct conversations are keyed by the normalized participant pair,
//! so concurrent first sends between two users converge on one record.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::{create_pool, PgStore};

use crate::error::AppResult;
use crate::models::{Conversation, Message, NewMessage, Target};
use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use uuid::Uuid;

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Look up the direct conversation for an unordered pair, creating it if
    /// it does not exist yet. Calling this concurrently for the same pair
    /// yields one conversation.
    async fn get_or_create_direct(&self, user_a: &str, user_b: &str) -> AppResult<Conversation>;

    /// Validate and persist a message, appending it to its conversation.
    async fn create_message(&self, message: NewMessage) -> AppResult<Message>;

    /// Messages between two users in conversation order; empty if they
    /// never talked.
    async fn conversation_messages(&self, user_a: &str, user_b: &str) -> AppResult<Vec<Message>>;

    /// Messages posted to a room in conversation order.
    async fn room_messages(&self, room_id: &str) -> AppResult<Vec<Message>>;
}

/// Timestamp for the next message in a conversation: the wall clock, but
/// never earlier than the message before it. Kept to microseconds, the
/// precision `TIMESTAMPTZ` stores, so a message reads back exactly as it was
/// returned.
pub(crate) fn next_created_at(last: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now().trunc_subsecs(6);
    match last {
        Some(last) if last > now => last.trunc_subsecs(6),
        _ => now,
    }
}

/// Materialize a validated [`NewMessage`] into the persisted shape.
pub(crate) fn build_message(id: Uuid, new: NewMessage, created_at: DateTime<Utc>) -> Message {
    let (receiver_id, room_id) = match new.target {
        Target::Direct { receiver_id } => (Some(receiver_id), None),
        Target::Room { room_id } => (None, Some(room_id)),
    };

    Message {
        id,
        sender_id: new.sender_id,
        receiver_id,
        room_id,
        text_original: new.text_original,
        text_translated: new.text_translated,
        source_lang: new.source_lang,
        target_lang: new.target_lang,
        translator_model: new.translator_model,
        image_url: new.image_url.filter(|url| !url.trim().is_empty()),
        created_at,
        translations: new.translations,
    }
}
