use crate::error::{AppError, AppResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type UserId = String;
pub type RoomId = String;

/// Translator model tag meaning no translation was necessary or possible.
pub const NOOP_MODEL: &str = "noop";

/// A user profile, owned by the account service. Only read here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub full_name: String,
    /// ISO 639-1 code; unset means English
    pub preferred_language: Option<String>,
}

/// A room as seen by the delivery path: its id, name and current members.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    pub members: Vec<UserId>,
}

impl Room {
    pub fn is_member(&self, user_id: &str) -> bool {
        self.members.iter().any(|member| member == user_id)
    }
}

/// Where a message goes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Direct { receiver_id: UserId },
    Room { room_id: RoomId },
}

impl Target {
    /// Build a target from the two optional request fields. Exactly one must be set.
    pub fn from_fields(receiver_id: Option<String>, room_id: Option<String>) -> AppResult<Self> {
        let receiver_id = receiver_id.filter(|id| !id.trim().is_empty());
        let room_id = room_id.filter(|id| !id.trim().is_empty());

        match (receiver_id, room_id) {
            (Some(receiver_id), None) => Ok(Target::Direct { receiver_id }),
            (None, Some(room_id)) => Ok(Target::Room { room_id }),
            (Some(_), Some(_)) => Err(AppError::Validation(
                "Provide either receiverId or roomId, not both".to_string(),
            )),
            (None, None) => Err(AppError::Validation(
                "receiverId or roomId is required".to_string(),
            )),
        }
    }
}

/// One rendering of a room message in a recipient's language.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Translation {
    pub lang: String,
    pub text: String,
    pub model: String,
}

/// A persisted message. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub sender_id: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<UserId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
    pub text_original: String,
    pub text_translated: String,
    pub source_lang: String,
    pub target_lang: String,
    pub translator_model: String,
    pub image_url: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Per-language renderings of a room message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub translations: Vec<Translation>,
}

impl Message {
    /// Render the message for someone reading in `lang`.
    ///
    /// Room messages carry one translation per recipient language; the
    /// matching one replaces the canonical translated fields. Anything without
    /// a matching translation is returned in its canonical form.
    pub fn for_viewer(&self, lang: &str) -> Message {
        let mut view = Message {
            translations: Vec::new(),
            ..self.clone()
        };

        if lang != self.target_lang {
            if let Some(translation) = self.translations.iter().find(|t| t.lang == lang) {
                view.text_translated = translation.text.clone();
                view.target_lang = translation.lang.clone();
                view.translator_model = translation.model.clone();
            }
        }

        view
    }
}

/// Everything needed to persist a message.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender_id: UserId,
    pub target: Target,
    pub text_original: String,
    pub image_url: Option<String>,
    pub source_lang: String,
    pub target_lang: String,
    pub text_translated: String,
    pub translator_model: String,
    pub translations: Vec<Translation>,
}

impl NewMessage {
    /// Check the message invariants before anything is written.
    pub fn validate(&self) -> AppResult<()> {
        let has_text = !self.text_original.trim().is_empty();
        let has_image = self
            .image_url
            .as_deref()
            .is_some_and(|url| !url.trim().is_empty());
        if !has_text && !has_image {
            return Err(AppError::Validation(
                "Message needs text or an image".to_string(),
            ));
        }

        if self.source_lang == self.target_lang
            && (self.translator_model != NOOP_MODEL || self.text_translated != self.text_original)
        {
            return Err(AppError::Validation(format!(
                "Message in {} needs no translation but carries one from {}",
                self.source_lang, self.translator_model
            )));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationKind {
    /// Participants are stored in normalized order
    Direct { participants: [UserId; 2] },
    Room { room_id: RoomId },
}

/// A message thread: a direct pair or a room.
#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    pub id: Uuid,
    pub kind: ConversationKind,
    /// Append-only, in conversation order
    pub message_ids: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Order-independent key identifying the conversation for a pair of users.
pub fn direct_conversation_key(user_a: &str, user_b: &str) -> String {
    let (low, high) = if user_a <= user_b {
        (user_a, user_b)
    } else {
        (user_b, user_a)
    };
    // Length prefix keeps ids containing ':' from colliding
    format!("direct:{}:{}:{}", low.len(), low, high)
}

pub fn room_conversation_key(room_id: &str) -> String {
    format!("room:{}", room_id)
}

/// Conversation key for the thread a message to `target` belongs to.
pub fn conversation_key(sender_id: &str, target: &Target) -> String {
    match target {
        Target::Direct { receiver_id } => direct_conversation_key(sender_id, receiver_id),
        Target::Room { room_id } => room_conversation_key(room_id),
    }
}
