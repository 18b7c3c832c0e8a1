use super::{build_message, next_created_at, MessageStore};
use crate::error::AppResult;
use crate::models::{
    conversation_key, direct_conversation_key, room_conversation_key, Conversation,
    ConversationKind, Message, NewMessage, Target,
};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct State {
    conversations: HashMap<String, Conversation>,
    messages: HashMap<Uuid, Message>,
}

impl State {
    fn conversation_entry(&mut self, key: String, kind: ConversationKind) -> &mut Conversation {
        self.conversations
            .entry(key)
            .or_insert_with(|| Conversation {
                id: Uuid::now_v7(),
                kind,
                message_ids: Vec::new(),
                created_at: next_created_at(None),
            })
    }

    fn messages_for(&self, key: &str) -> Vec<Message> {
        self.conversations
            .get(key)
            .map(|conversation| {
                conversation
                    .message_ids
                    .iter()
                    .filter_map(|id| self.messages.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn direct_kind(user_a: &str, user_b: &str) -> ConversationKind {
    let mut participants = [user_a.to_string(), user_b.to_string()];
    participants.sort();
    ConversationKind::Direct { participants }
}

/// Process-local store. Every write takes the single write lock, which is
/// what makes get-or-create atomic and `created_at` monotonic.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn get_or_create_direct(&self, user_a: &str, user_b: &str) -> AppResult<Conversation> {
        let mut state = self.state.write().await;
        let conversation = state.conversation_entry(
            direct_conversation_key(user_a, user_b),
            direct_kind(user_a, user_b),
        );
        Ok(conversation.clone())
    }

    async fn create_message(&self, message: NewMessage) -> AppResult<Message> {
        message.validate()?;

        let key = conversation_key(&message.sender_id, &message.target);
        let kind = match &message.target {
            Target::Direct { receiver_id } => direct_kind(&message.sender_id, receiver_id),
            Target::Room { room_id } => ConversationKind::Room {
                room_id: room_id.clone(),
            },
        };

        let mut state = self.state.write().await;

        let last = state
            .conversations
            .get(&key)
            .and_then(|conversation| conversation.message_ids.last())
            .and_then(|id| state.messages.get(id))
            .map(|message| message.created_at);

        let message = build_message(Uuid::now_v7(), message, next_created_at(last));

        state
            .conversation_entry(key, kind)
            .message_ids
            .push(message.id);
        state.messages.insert(message.id, message.clone());

        Ok(message)
    }

    async fn conversation_messages(&self, user_a: &str, user_b: &str) -> AppResult<Vec<Message>> {
        let state = self.state.read().await;
        Ok(state.messages_for(&direct_conversation_key(user_a, user_b)))
    }

    async fn room_messages(&self, room_id: &str) -> AppResult<Vec<Message>> {
        let state = self.state.read().await;
        Ok(state.messages_for(&room_conversation_key(room_id)))
    }
}
