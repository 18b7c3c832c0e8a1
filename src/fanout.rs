//! Delivery fan-out: the send pipeline and pull-based history.
//!
//! A send resolves recipients from current membership, decides source and
//! target languages, translates where they differ, persists, and only then
//! emits. Emission runs detached from the caller and never fails the send;
//! offline recipients catch up through history.

use crate::channels::{
    Address, ChannelRegistry, ConnectionId, InviterSummary, RoomInviteEvent, RoomSummary,
    ServerEvent, TypingEvent,
};
use crate::directory::Directory;
use crate::error::{AppError, AppResult};
use crate::i18n::{resolve_target_language, LanguageResolver, DEFAULT_LANGUAGE};
use crate::models::{Message, NewMessage, Room, Target, Translation, UserId, NOOP_MODEL};
use crate::store::MessageStore;
use crate::translation::{TranslationResult, Translator};
use futures::future::join_all;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What the sender wrote.
#[derive(Debug, Clone, Default)]
pub struct Content {
    pub text: String,
    pub image_url: Option<String>,
    /// Trusted as the source language when set
    pub source_lang_override: Option<String>,
}

impl Content {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
            && self
                .image_url
                .as_deref()
                .map_or(true, |url| url.trim().is_empty())
    }
}

#[derive(Debug, Clone)]
struct Recipient {
    user_id: UserId,
    lang: String,
}

pub struct Fanout {
    store: Arc<dyn MessageStore>,
    directory: Arc<dyn Directory>,
    translator: Arc<Translator>,
    resolver: LanguageResolver,
    channels: Arc<ChannelRegistry>,
}

impl Fanout {
    pub fn new(
        store: Arc<dyn MessageStore>,
        directory: Arc<dyn Directory>,
        translator: Arc<Translator>,
        resolver: LanguageResolver,
        channels: Arc<ChannelRegistry>,
    ) -> Self {
        Self {
            store,
            directory,
            translator,
            resolver,
            channels,
        }
    }

    pub fn channels(&self) -> &Arc<ChannelRegistry> {
        &self.channels
    }

    pub fn translator(&self) -> &Arc<Translator> {
        &self.translator
    }

    /// Preferred language of `user_id`, or the default for unknown users.
    pub async fn viewer_language(&self, user_id: &str) -> String {
        language_of(self.directory.as_ref(), user_id).await
    }

    /// Addresses `user_id` should be listening on: their personal address
    /// plus every room they are currently a member of.
    pub async fn addresses_for(&self, user_id: &str) -> AppResult<HashSet<Address>> {
        let mut addresses = HashSet::from([Address::Personal(user_id.to_string())]);
        addresses.extend(
            self.directory
                .rooms_of(user_id)
                .await?
                .into_iter()
                .map(Address::Room),
        );
        Ok(addresses)
    }

    async fn existing_room(&self, room_id: &str) -> AppResult<Room> {
        self.directory
            .room(room_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Room {} not found", room_id)))
    }

    async fn member_room(&self, room_id: &str, user_id: &str) -> AppResult<Room> {
        let room = self.existing_room(room_id).await?;
        if !room.is_member(user_id) {
            return Err(AppError::Forbidden(format!(
                "Not a member of room {}",
                room_id
            )));
        }
        Ok(room)
    }

    /// Everyone who should receive a message to `target`, read fresh.
    async fn recipients(&self, sender_id: &str, target: &Target) -> AppResult<Vec<Recipient>> {
        match target {
            Target::Direct { receiver_id } => {
                let receiver = self.directory.user(receiver_id).await?.ok_or_else(|| {
                    AppError::NotFound(format!("User {} not found", receiver_id))
                })?;
                Ok(vec![Recipient {
                    lang: resolve_target_language(&receiver),
                    user_id: receiver.id,
                }])
            }
            Target::Room { room_id } => {
                let room = self.member_room(room_id, sender_id).await?;

                let mut seen = HashSet::new();
                let mut recipients = Vec::new();
                for member in room.members {
                    if member == sender_id || !seen.insert(member.clone()) {
                        continue;
                    }
                    let lang = language_of(self.directory.as_ref(), &member).await;
                    recipients.push(Recipient {
                        user_id: member,
                        lang,
                    });
                }
                Ok(recipients)
            }
        }
    }

    /// Check that `sender_id` may send to `target` right now, without side
    /// effects. Lets callers refuse a send before storing an attachment.
    pub async fn authorize_send(&self, sender_id: &str, target: &Target) -> AppResult<()> {
        self.recipients(sender_id, target).await.map(|_| ())
    }

    async fn translate_if_needed(&self, text: &str, source: &str, target: &str) -> TranslationResult {
        if source == target {
            return TranslationResult::noop(text);
        }
        self.translator.translate(text, source, target).await
    }

    /// Send a message and return it as persisted.
    ///
    /// Direct messages are translated once into the receiver's language. Room
    /// messages keep the original as their canonical text and carry one
    /// translation per distinct recipient language; each reader gets the
    /// rendering for their own language.
    pub async fn send(&self, sender_id: &str, target: Target, content: Content) -> AppResult<Message> {
        if content.is_empty() {
            return Err(AppError::Validation(
                "Message needs text or an image".to_string(),
            ));
        }

        let recipients = self.recipients(sender_id, &target).await?;
        let source_lang = self
            .resolver
            .resolve_source_language(&content.text, content.source_lang_override.as_deref());

        let new_message = match &target {
            Target::Direct { .. } => {
                let target_lang = recipients
                    .first()
                    .map(|r| r.lang.clone())
                    .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string());
                let result = self
                    .translate_if_needed(&content.text, &source_lang, &target_lang)
                    .await;

                NewMessage {
                    sender_id: sender_id.to_string(),
                    target: target.clone(),
                    text_original: content.text,
                    image_url: content.image_url,
                    source_lang,
                    target_lang,
                    text_translated: result.translated_text,
                    translator_model: result.model_tag,
                    translations: Vec::new(),
                }
            }
            Target::Room { .. } => {
                let languages: BTreeSet<&str> = recipients
                    .iter()
                    .map(|r| r.lang.as_str())
                    .filter(|lang| *lang != source_lang)
                    .collect();

                let results = join_all(languages.iter().map(|lang| {
                    self.translate_if_needed(&content.text, &source_lang, lang)
                }))
                .await;

                let translations = languages
                    .iter()
                    .zip(results)
                    .filter(|(_, result)| !result.is_noop())
                    .map(|(lang, result)| Translation {
                        lang: lang.to_string(),
                        text: result.translated_text,
                        model: result.model_tag,
                    })
                    .collect();

                NewMessage {
                    sender_id: sender_id.to_string(),
                    target: target.clone(),
                    text_translated: content.text.clone(),
                    text_original: content.text,
                    image_url: content.image_url,
                    target_lang: source_lang.clone(),
                    source_lang,
                    translator_model: NOOP_MODEL.to_string(),
                    translations,
                }
            }
        };

        let message = self.store.create_message(new_message).await?;
        info!(
            "Message {} from {} persisted ({} -> {}, {})",
            message.id, sender_id, message.source_lang, message.target_lang, message.translator_model
        );

        let channels = Arc::clone(&self.channels);
        let directory = Arc::clone(&self.directory);
        let emitted = message.clone();
        let sender_id = sender_id.to_string();
        tokio::spawn(async move {
            let sender_lang = language_of(directory.as_ref(), &sender_id).await;
            emit_new_message(
                &channels,
                directory.as_ref(),
                &emitted,
                &recipients,
                &sender_id,
                &sender_lang,
            )
            .await;
        });

        Ok(message)
    }

    /// Direct history between two users, readable by either participant.
    pub async fn conversation_history(
        &self,
        caller_id: &str,
        user_a: &str,
        user_b: &str,
    ) -> AppResult<Vec<Message>> {
        if caller_id != user_a && caller_id != user_b {
            return Err(AppError::Forbidden(
                "Not a participant in this conversation".to_string(),
            ));
        }
        self.store.conversation_messages(user_a, user_b).await
    }

    /// Room history rendered in the caller's language. Members only.
    pub async fn room_history(&self, caller_id: &str, room_id: &str) -> AppResult<Vec<Message>> {
        self.member_room(room_id, caller_id).await?;
        let lang = self.viewer_language(caller_id).await;
        let messages = self.store.room_messages(room_id).await?;
        Ok(messages.iter().map(|m| m.for_viewer(&lang)).collect())
    }

    /// Relay a typing indicator. Returns the number of connections reached.
    pub async fn typing(&self, user_id: &str, target: &Target) -> AppResult<usize> {
        match target {
            Target::Direct { receiver_id } => {
                let event = ServerEvent::Typing(TypingEvent {
                    user_id: user_id.to_string(),
                    receiver_id: Some(receiver_id.clone()),
                    room_id: None,
                });
                Ok(self
                    .channels
                    .deliver(&Address::Personal(receiver_id.clone()), &event)
                    .await)
            }
            Target::Room { room_id } => {
                let room = self.member_room(room_id, user_id).await?;
                let event = ServerEvent::Typing(TypingEvent {
                    user_id: user_id.to_string(),
                    receiver_id: None,
                    room_id: Some(room_id.clone()),
                });
                let listeners: HashSet<UserId> = room
                    .members
                    .into_iter()
                    .filter(|member| member != user_id)
                    .collect();
                Ok(self
                    .channels
                    .deliver_to_users(&Address::Room(room_id.clone()), &event, &listeners)
                    .await)
            }
        }
    }

    /// Subscribe one connection to a room address after a membership check.
    pub async fn join_room(
        &self,
        connection_id: ConnectionId,
        user_id: &str,
        room_id: &str,
    ) -> AppResult<()> {
        self.member_room(room_id, user_id).await?;
        if !self.channels.join(connection_id, room_id).await {
            return Err(AppError::NotFound("Connection is closed".to_string()));
        }
        debug!("{} joined room {}", user_id, room_id);
        Ok(())
    }

    pub async fn leave_room(&self, connection_id: ConnectionId, room_id: &str) -> bool {
        self.channels.leave(connection_id, room_id).await
    }

    /// React to `invitee_id` having been added to a room: their live
    /// connections start listening on the room address and they get a
    /// `room-invite` event.
    pub async fn room_invite(
        &self,
        room_id: &str,
        inviter_id: &str,
        invitee_id: &str,
    ) -> AppResult<usize> {
        let room = self.member_room(room_id, inviter_id).await?;
        if !room.is_member(invitee_id) {
            return Err(AppError::Validation(format!(
                "{} is not a member of room {}",
                invitee_id, room_id
            )));
        }
        let inviter = self
            .directory
            .user(inviter_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("User {} not found", inviter_id)))?;

        let subscribed = self.channels.subscribe_user(invitee_id, room_id).await;
        let event = ServerEvent::RoomInvite(RoomInviteEvent {
            room: RoomSummary {
                id: room.id,
                name: room.name,
            },
            inviter: InviterSummary {
                id: inviter.id,
                full_name: inviter.full_name,
            },
        });
        self.channels
            .deliver(&Address::Personal(invitee_id.to_string()), &event)
            .await;

        info!(
            "{} invited {} to room {} ({} live connections subscribed)",
            inviter_id, invitee_id, room_id, subscribed
        );
        Ok(subscribed)
    }

    /// React to `user_id` having left or been removed from a room.
    pub async fn room_member_removed(
        &self,
        room_id: &str,
        remover_id: &str,
        user_id: &str,
    ) -> AppResult<usize> {
        let room = self.existing_room(room_id).await?;
        if remover_id != user_id && !room.is_member(remover_id) {
            return Err(AppError::Forbidden(format!(
                "Not a member of room {}",
                room_id
            )));
        }
        if room.is_member(user_id) {
            return Err(AppError::Validation(format!(
                "{} is still a member of room {}",
                user_id, room_id
            )));
        }

        let unsubscribed = self.channels.unsubscribe_user(user_id, room_id).await;
        info!(
            "{} removed from room {} ({} live connections unsubscribed)",
            user_id, room_id, unsubscribed
        );
        Ok(unsubscribed)
    }
}

async fn language_of(directory: &dyn Directory, user_id: &str) -> String {
    match directory.user(user_id).await {
        Ok(Some(user)) => resolve_target_language(&user),
        Ok(None) => DEFAULT_LANGUAGE.to_string(),
        Err(e) => {
            warn!("Failed to load language of {}: {}", user_id, e);
            DEFAULT_LANGUAGE.to_string()
        }
    }
}

/// Push a persisted message to every recipient, the sender's other sessions
/// and, for rooms, members who joined after the recipient list was read.
/// Each user is served once, in their own language. Room address listeners
/// that are no longer members get nothing.
async fn emit_new_message(
    channels: &ChannelRegistry,
    directory: &dyn Directory,
    message: &Message,
    recipients: &[Recipient],
    sender_id: &str,
    sender_lang: &str,
) {
    let mut served: HashSet<UserId> = HashSet::new();
    let mut delivered = 0;

    let targets = recipients
        .iter()
        .map(|r| (r.user_id.as_str(), r.lang.as_str()))
        .chain(std::iter::once((sender_id, sender_lang)));

    for (user_id, lang) in targets {
        if !served.insert(user_id.to_string()) {
            continue;
        }
        let event = ServerEvent::NewMessage(message.for_viewer(lang));
        delivered += channels
            .deliver(&Address::Personal(user_id.to_string()), &event)
            .await;
    }

    if let Some(room_id) = &message.room_id {
        let late_members: HashSet<UserId> = match directory.room(room_id).await {
            Ok(Some(room)) => room
                .members
                .into_iter()
                .filter(|member| !served.contains(member))
                .collect(),
            Ok(None) => HashSet::new(),
            Err(e) => {
                warn!("Failed to re-read members of room {}: {}", room_id, e);
                HashSet::new()
            }
        };

        if !late_members.is_empty() {
            let event = ServerEvent::NewMessage(message.for_viewer(&message.target_lang));
            delivered += channels
                .deliver_to_users(&Address::Room(room_id.clone()), &event, &late_members)
                .await;
        }
    }

    debug!("Message {} reached {} live connections", message.id, delivered);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::ConnectionHandle;
    use crate::directory::MemoryDirectory;
    use crate::i18n::LanguageDetector;
    use crate::models::{Conversation, User};
    use crate::store::MemoryStore;
    use crate::translation::tests::{FakeBackend, Outcome};
    use crate::translation::TranslationBackend;
    use async_trait::async_trait;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    /// Recognizes a handful of words, English otherwise.
    struct KeywordDetector;

    impl LanguageDetector for KeywordDetector {
        fn detect(&self, text: &str) -> String {
            if text.contains("Bonjour") {
                "fra".to_string()
            } else if text.contains("Hola") {
                "spa".to_string()
            } else {
                "eng".to_string()
            }
        }
    }

    struct Fixture {
        fanout: Fanout,
        store: Arc<MemoryStore>,
        directory: Arc<MemoryDirectory>,
        channels: Arc<ChannelRegistry>,
        primary: Arc<FakeBackend>,
    }

    fn user(id: &str, lang: Option<&str>) -> User {
        User {
            id: id.to_string(),
            full_name: format!("{} Example", id),
            preferred_language: lang.map(str::to_string),
        }
    }

    async fn fixture(outcome: Outcome) -> Fixture {
        let primary = FakeBackend::new("OPUS-MT", outcome);
        fixture_with_backends(primary.clone(), vec![primary]).await
    }

    async fn fixture_with_backends(
        primary: Arc<FakeBackend>,
        backends: Vec<Arc<FakeBackend>>,
    ) -> Fixture {
        let directory = Arc::new(MemoryDirectory::new());
        directory.insert_user(user("alice", Some("en"))).await;
        directory.insert_user(user("bob", Some("fr"))).await;
        directory.insert_user(user("carol", Some("es"))).await;
        directory.insert_user(user("dave", None)).await;
        directory
            .insert_room(Room {
                id: "lobby".to_string(),
                name: "Lobby".to_string(),
                members: vec!["alice".to_string(), "bob".to_string(), "carol".to_string()],
            })
            .await;

        let backends: Vec<Arc<dyn TranslationBackend>> = backends
            .into_iter()
            .map(|b| b as Arc<dyn TranslationBackend>)
            .collect();
        let translator = Arc::new(Translator::new(backends, Duration::from_millis(200)));
        let store = Arc::new(MemoryStore::new());
        let channels = Arc::new(ChannelRegistry::new());

        let fanout = Fanout::new(
            store.clone(),
            directory.clone(),
            translator,
            LanguageResolver::new(Arc::new(KeywordDetector)),
            channels.clone(),
        );

        Fixture {
            fanout,
            store,
            directory,
            channels,
            primary,
        }
    }

    fn direct(receiver: &str) -> Target {
        Target::Direct {
            receiver_id: receiver.to_string(),
        }
    }

    fn lobby() -> Target {
        Target::Room {
            room_id: "lobby".to_string(),
        }
    }

    async fn next_event(handle: &mut ConnectionHandle) -> ServerEvent {
        tokio::time::timeout(Duration::from_secs(1), handle.events.recv())
            .await
            .expect("event should arrive in time")
            .expect("channel should be open")
    }

    async fn next_message(handle: &mut ConnectionHandle) -> Message {
        match next_event(handle).await {
            ServerEvent::NewMessage(message) => message,
            other => panic!("expected new_message, got {:?}", other),
        }
    }

    async fn assert_silent(handle: &mut ConnectionHandle) {
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.events.try_recv().is_err());
    }

    // ==================== Direct messages ====================

    #[tokio::test]
    async fn test_same_language_is_not_translated() {
        let f = fixture(Outcome::Translate("unused")).await;

        let message = f
            .fanout
            .send("alice", direct("bob"), Content::text("Bonjour tout le monde"))
            .await
            .unwrap();

        assert_eq!(message.source_lang, "fr");
        assert_eq!(message.target_lang, "fr");
        assert_eq!(message.text_translated, "Bonjour tout le monde");
        assert_eq!(message.translator_model, NOOP_MODEL);
        assert_eq!(f.primary.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_short_greeting_defaults_to_english() {
        let f = fixture(Outcome::Prefix).await;

        let message = f
            .fanout
            .send("alice", direct("bob"), Content::text("Bonjour"))
            .await
            .unwrap();

        assert_eq!(message.source_lang, "en");
        assert_eq!(message.target_lang, "fr");
        assert_eq!(message.text_translated, "[fr] Bonjour");
    }

    #[tokio::test]
    async fn test_direct_message_translated_by_primary() {
        let f = fixture(Outcome::Translate("Hola")).await;

        let message = f
            .fanout
            .send("alice", direct("carol"), Content::text("Hello"))
            .await
            .unwrap();

        assert_eq!(message.source_lang, "en");
        assert_eq!(message.target_lang, "es");
        assert_eq!(message.text_original, "Hello");
        assert_eq!(message.text_translated, "Hola");
        assert_eq!(message.translator_model, "OPUS-MT");
    }

    #[tokio::test]
    async fn test_source_override_is_trusted() {
        let f = fixture(Outcome::Translate("unused")).await;

        let content = Content {
            source_lang_override: Some("es".to_string()),
            ..Content::text("Hello there friend")
        };
        let message = f.fanout.send("alice", direct("carol"), content).await.unwrap();

        assert_eq!(message.source_lang, "es");
        assert_eq!(message.translator_model, NOOP_MODEL);
    }

    #[tokio::test]
    async fn test_unset_preference_means_english() {
        let f = fixture(Outcome::Translate("unused")).await;

        let message = f
            .fanout
            .send("alice", direct("dave"), Content::text("Hello"))
            .await
            .unwrap();

        assert_eq!(message.target_lang, "en");
        assert_eq!(message.translator_model, NOOP_MODEL);
    }

    #[tokio::test]
    async fn test_translation_outage_still_sends() {
        let failing = FakeBackend::new("OPUS-MT", Outcome::Fail);
        let also_failing = FakeBackend::new("gpt-3.5-turbo", Outcome::Fail);
        let f = fixture_with_backends(failing.clone(), vec![failing, also_failing]).await;

        let message = f
            .fanout
            .send("alice", direct("bob"), Content::text("hello"))
            .await
            .unwrap();

        assert_eq!(message.text_translated, "hello");
        assert_eq!(message.translator_model, NOOP_MODEL);
        assert_eq!(message.target_lang, "fr");
    }

    #[tokio::test]
    async fn test_direct_emission_reaches_receiver_and_sender_sessions() {
        let f = fixture(Outcome::Translate("Bonjour")).await;
        let mut bob = f.channels.connect("bob").await;
        let mut alice_phone = f.channels.connect("alice").await;
        let mut alice_laptop = f.channels.connect("alice").await;

        let sent = f
            .fanout
            .send("alice", direct("bob"), Content::text("Hello"))
            .await
            .unwrap();

        assert_eq!(next_message(&mut bob).await, sent);
        assert_eq!(next_message(&mut alice_phone).await, sent);
        assert_eq!(next_message(&mut alice_laptop).await, sent);
    }

    #[tokio::test]
    async fn test_offline_receiver_catches_up_from_history() {
        let f = fixture(Outcome::Translate("Bonjour")).await;

        let sent = f
            .fanout
            .send("alice", direct("bob"), Content::text("Hello"))
            .await
            .unwrap();

        let history = f
            .fanout
            .conversation_history("bob", "bob", "alice")
            .await
            .unwrap();
        assert_eq!(history, vec![sent]);
    }

    #[tokio::test]
    async fn test_history_preserves_send_order() {
        let f = fixture(Outcome::Prefix).await;

        let mut sent = Vec::new();
        for (from, to, text) in [
            ("alice", "bob", "first"),
            ("bob", "alice", "second"),
            ("alice", "bob", "third"),
        ] {
            sent.push(
                f.fanout
                    .send(from, direct(to), Content::text(text))
                    .await
                    .unwrap(),
            );
        }

        let history = f
            .fanout
            .conversation_history("alice", "alice", "bob")
            .await
            .unwrap();
        assert_eq!(history, sent);
    }

    #[tokio::test]
    async fn test_history_of_strangers_is_empty() {
        let f = fixture(Outcome::Prefix).await;
        let history = f
            .fanout
            .conversation_history("alice", "alice", "dave")
            .await
            .unwrap();
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn test_history_requires_participant() {
        let f = fixture(Outcome::Prefix).await;
        let err = f
            .fanout
            .conversation_history("carol", "alice", "bob")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    // ==================== Validation ====================

    #[tokio::test]
    async fn test_empty_content_rejected_before_side_effects() {
        let f = fixture(Outcome::Prefix).await;

        let err = f
            .fanout
            .send("alice", direct("bob"), Content::text("   "))
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(f.primary.calls.load(Ordering::SeqCst), 0);
        let conversation: Conversation = f.store.get_or_create_direct("alice", "bob").await.unwrap();
        assert!(conversation.message_ids.is_empty());
    }

    #[tokio::test]
    async fn test_image_only_message() {
        let f = fixture(Outcome::Prefix).await;

        let content = Content {
            image_url: Some("/media/cat.png".to_string()),
            ..Content::default()
        };
        let message = f.fanout.send("alice", direct("bob"), content).await.unwrap();

        assert_eq!(message.image_url.as_deref(), Some("/media/cat.png"));
        assert_eq!(message.text_original, "");
        assert_eq!(message.translator_model, NOOP_MODEL);
        assert_eq!(f.primary.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_receiver_is_not_found() {
        let f = fixture(Outcome::Prefix).await;
        let err = f
            .fanout
            .send("alice", direct("ghost"), Content::text("Hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_unknown_room_is_not_found() {
        let f = fixture(Outcome::Prefix).await;
        let target = Target::Room {
            room_id: "attic".to_string(),
        };
        let err = f
            .fanout
            .send("alice", target, Content::text("Hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_non_member_cannot_post_to_room() {
        let f = fixture(Outcome::Prefix).await;
        let err = f
            .fanout
            .send("dave", lobby(), Content::text("Hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    // ==================== Persistence failure ====================

    struct BrokenStore;

    #[async_trait]
    impl MessageStore for BrokenStore {
        async fn get_or_create_direct(&self, _: &str, _: &str) -> AppResult<Conversation> {
            Err(AppError::Persistence(sqlx::Error::PoolTimedOut))
        }

        async fn create_message(&self, _: NewMessage) -> AppResult<Message> {
            Err(AppError::Persistence(sqlx::Error::PoolTimedOut))
        }

        async fn conversation_messages(&self, _: &str, _: &str) -> AppResult<Vec<Message>> {
            Err(AppError::Persistence(sqlx::Error::PoolTimedOut))
        }

        async fn room_messages(&self, _: &str) -> AppResult<Vec<Message>> {
            Err(AppError::Persistence(sqlx::Error::PoolTimedOut))
        }
    }

    #[tokio::test]
    async fn test_persistence_failure_aborts_without_emission() {
        let f = fixture(Outcome::Prefix).await;
        let fanout = Fanout::new(
            Arc::new(BrokenStore),
            f.directory.clone(),
            Arc::clone(f.fanout.translator()),
            LanguageResolver::new(Arc::new(KeywordDetector)),
            f.channels.clone(),
        );
        let mut bob = f.channels.connect("bob").await;

        let err = fanout
            .send("alice", direct("bob"), Content::text("Hello"))
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Persistence(_)));
        assert_silent(&mut bob).await;
    }

    // ==================== Rooms ====================

    #[tokio::test]
    async fn test_room_broadcast_renders_per_member() {
        let f = fixture(Outcome::Prefix).await;
        let mut alice = f.channels.connect("alice").await;
        let mut bob = f.channels.connect("bob").await;
        let mut carol = f.channels.connect("carol").await;

        let sent = f
            .fanout
            .send("alice", lobby(), Content::text("Hello everyone"))
            .await
            .unwrap();

        assert_eq!(sent.target_lang, "en");
        assert_eq!(sent.translator_model, NOOP_MODEL);
        let langs: Vec<&str> = sent.translations.iter().map(|t| t.lang.as_str()).collect();
        assert_eq!(langs, vec!["es", "fr"]);

        let to_bob = next_message(&mut bob).await;
        assert_eq!(to_bob.text_translated, "[fr] Hello everyone");
        assert_eq!(to_bob.target_lang, "fr");
        assert_eq!(to_bob.text_original, "Hello everyone");

        let to_carol = next_message(&mut carol).await;
        assert_eq!(to_carol.text_translated, "[es] Hello everyone");
        assert_eq!(to_carol.translator_model, "OPUS-MT");

        let to_alice = next_message(&mut alice).await;
        assert_eq!(to_alice.text_translated, "Hello everyone");
        assert_eq!(to_alice.translator_model, NOOP_MODEL);
        assert_eq!(to_alice.id, sent.id);
    }

    #[tokio::test]
    async fn test_room_translates_once_per_language() {
        let f = fixture(Outcome::Prefix).await;
        f.directory.insert_user(user("erin", Some("fr"))).await;
        f.directory.add_member("lobby", "erin").await;

        f.fanout
            .send("alice", lobby(), Content::text("Hello everyone"))
            .await
            .unwrap();

        // bob and erin share French
        assert_eq!(f.primary.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_room_member_joined_on_address_gets_one_copy() {
        let f = fixture(Outcome::Prefix).await;
        let mut bob = f.channels.connect("bob").await;
        f.fanout.join_room(bob.id, "bob", "lobby").await.unwrap();

        f.fanout
            .send("alice", lobby(), Content::text("Hello everyone"))
            .await
            .unwrap();

        assert_eq!(next_message(&mut bob).await.target_lang, "fr");
        assert_silent(&mut bob).await;
    }

    #[tokio::test]
    async fn test_removed_member_is_excluded() {
        let f = fixture(Outcome::Prefix).await;
        let mut alice = f.channels.connect("alice").await;
        let mut bob = f.channels.connect("bob").await;
        let mut carol = f.channels.connect("carol").await;
        f.fanout.join_room(carol.id, "carol", "lobby").await.unwrap();

        f.directory.remove_member("lobby", "carol").await;
        f.fanout
            .room_member_removed("lobby", "alice", "carol")
            .await
            .unwrap();

        let sent = f
            .fanout
            .send("alice", lobby(), Content::text("Hello everyone"))
            .await
            .unwrap();

        assert!(sent.translations.iter().all(|t| t.lang != "es"));
        next_message(&mut bob).await;
        next_message(&mut alice).await;
        assert_silent(&mut carol).await;
    }

    #[tokio::test]
    async fn test_removed_member_excluded_even_without_removal_event() {
        let f = fixture(Outcome::Prefix).await;
        let mut alice = f.channels.connect("alice").await;
        let mut carol = f.channels.connect("carol").await;

        f.directory.remove_member("lobby", "carol").await;
        f.fanout
            .send("alice", lobby(), Content::text("Hello everyone"))
            .await
            .unwrap();

        next_message(&mut alice).await;
        assert_silent(&mut carol).await;
    }

    #[tokio::test]
    async fn test_removed_member_still_on_room_address_gets_nothing() {
        let f = fixture(Outcome::Prefix).await;
        let mut bob = f.channels.connect("bob").await;
        let mut carol = f.channels.connect("carol").await;
        f.fanout.join_room(bob.id, "bob", "lobby").await.unwrap();
        f.fanout.join_room(carol.id, "carol", "lobby").await.unwrap();

        // Room administration drops carol; the removal event never arrives
        f.directory.remove_member("lobby", "carol").await;
        f.fanout
            .send("alice", lobby(), Content::text("Secret plans for everyone"))
            .await
            .unwrap();

        assert_eq!(next_message(&mut bob).await.room_id.as_deref(), Some("lobby"));
        assert_silent(&mut bob).await;
        assert_silent(&mut carol).await;
    }

    #[tokio::test]
    async fn test_removed_member_gets_no_room_typing() {
        let f = fixture(Outcome::Prefix).await;
        let mut bob = f.channels.connect("bob").await;
        let mut carol = f.channels.connect("carol").await;
        f.fanout.join_room(bob.id, "bob", "lobby").await.unwrap();
        f.fanout.join_room(carol.id, "carol", "lobby").await.unwrap();
        f.directory.remove_member("lobby", "carol").await;

        assert_eq!(f.fanout.typing("alice", &lobby()).await.unwrap(), 1);
        assert!(matches!(next_event(&mut bob).await, ServerEvent::Typing(_)));
        assert_silent(&mut carol).await;
    }

    #[tokio::test]
    async fn test_room_history_rendered_for_caller() {
        let f = fixture(Outcome::Prefix).await;
        f.fanout
            .send("alice", lobby(), Content::text("Hello everyone"))
            .await
            .unwrap();

        let for_carol = f.fanout.room_history("carol", "lobby").await.unwrap();
        assert_eq!(for_carol.len(), 1);
        assert_eq!(for_carol[0].text_translated, "[es] Hello everyone");
        assert!(for_carol[0].translations.is_empty());

        let err = f.fanout.room_history("dave", "lobby").await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    // ==================== Membership events ====================

    #[tokio::test]
    async fn test_invite_subscribes_and_notifies() {
        let f = fixture(Outcome::Prefix).await;
        let mut dave = f.channels.connect("dave").await;

        f.directory.add_member("lobby", "dave").await;
        let subscribed = f.fanout.room_invite("lobby", "alice", "dave").await.unwrap();
        assert_eq!(subscribed, 1);

        match next_event(&mut dave).await {
            ServerEvent::RoomInvite(invite) => {
                assert_eq!(invite.room.id, "lobby");
                assert_eq!(invite.room.name, "Lobby");
                assert_eq!(invite.inviter.full_name, "alice Example");
            }
            other => panic!("expected room-invite, got {:?}", other),
        }

        f.fanout
            .send("bob", lobby(), Content::text("Bonjour tout le monde"))
            .await
            .unwrap();
        let message = next_message(&mut dave).await;
        assert_eq!(message.text_translated, "[en] Bonjour tout le monde");
        assert_silent(&mut dave).await;
    }

    #[tokio::test]
    async fn test_invite_requires_current_membership() {
        let f = fixture(Outcome::Prefix).await;
        let err = f
            .fanout
            .room_invite("lobby", "alice", "dave")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let err = f
            .fanout
            .room_invite("lobby", "dave", "bob")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_removal_of_current_member_is_rejected() {
        let f = fixture(Outcome::Prefix).await;
        let err = f
            .fanout
            .room_member_removed("lobby", "alice", "bob")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    // ==================== Typing and joins ====================

    #[tokio::test]
    async fn test_typing_direct() {
        let f = fixture(Outcome::Prefix).await;
        let mut bob = f.channels.connect("bob").await;

        let reached = f.fanout.typing("alice", &direct("bob")).await.unwrap();
        assert_eq!(reached, 1);
        assert_eq!(
            next_event(&mut bob).await,
            ServerEvent::Typing(TypingEvent {
                user_id: "alice".to_string(),
                receiver_id: Some("bob".to_string()),
                room_id: None,
            })
        );
    }

    #[tokio::test]
    async fn test_typing_in_room_skips_typist() {
        let f = fixture(Outcome::Prefix).await;
        let mut alice = f.channels.connect("alice").await;
        let mut bob = f.channels.connect("bob").await;
        f.fanout.join_room(alice.id, "alice", "lobby").await.unwrap();
        f.fanout.join_room(bob.id, "bob", "lobby").await.unwrap();

        let reached = f.fanout.typing("alice", &lobby()).await.unwrap();
        assert_eq!(reached, 1);
        assert!(matches!(next_event(&mut bob).await, ServerEvent::Typing(_)));
        assert_silent(&mut alice).await;

        let err = f.fanout.typing("dave", &lobby()).await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_join_requires_membership() {
        let f = fixture(Outcome::Prefix).await;
        let dave = f.channels.connect("dave").await;

        let err = f.fanout.join_room(dave.id, "dave", "lobby").await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));

        let bob = f.channels.connect("bob").await;
        f.fanout.join_room(bob.id, "bob", "lobby").await.unwrap();
        assert!(f.fanout.leave_room(bob.id, "lobby").await);
    }

    #[tokio::test]
    async fn test_addresses_follow_membership() {
        let f = fixture(Outcome::Prefix).await;

        assert_eq!(
            f.fanout.addresses_for("bob").await.unwrap(),
            HashSet::from([
                Address::Personal("bob".to_string()),
                Address::Room("lobby".to_string()),
            ])
        );
        assert_eq!(
            f.fanout.addresses_for("dave").await.unwrap(),
            HashSet::from([Address::Personal("dave".to_string())])
        );

        f.directory.remove_member("lobby", "bob").await;
        assert_eq!(
            f.fanout.addresses_for("bob").await.unwrap(),
            HashSet::from([Address::Personal("bob".to_string())])
        );
    }
}
