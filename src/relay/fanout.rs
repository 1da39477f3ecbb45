//! # Translation Fan-Out
//!
//! Delivers one source message to every room member in that member's own
//! listening language. The sender gets the original text immediately; every
//! other recipient gets its own translate → synthesize → deliver pipeline,
//! and all recipient pipelines run concurrently. A failure in one recipient's
//! pipeline produces an error notice for that recipient only.

use crate::engines::{MessageStore, SpeechSynthesizer, Translator};
use crate::relay::connection::ConnectionRegistry;
use crate::relay::protocol::ServerMessage;
use crate::relay::room::Participant;
use chrono::Utc;
use futures_util::future::join_all;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// The message being fanned out, before any per-recipient work.
#[derive(Debug, Clone)]
pub struct SourceMessage {
    pub room_code: String,
    pub sender_id: String,
    pub sender_name: String,
    pub text: String,
    pub source_language: String,
    /// Opaque emotion tag supplied upstream; passed through untouched
    pub emotion: Option<String>,
    pub session_id: Option<String>,
}

/// What happened for one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { translated: bool },
    ErrorNotified { reason: String },
    Unreachable,
}

#[derive(Debug, Clone)]
pub struct RecipientOutcome {
    pub identity: String,
    pub outcome: DeliveryOutcome,
}

/// Per-recipient outcome report for one fan-out.
#[derive(Debug, Clone, Default)]
pub struct FanoutReport {
    pub outcomes: Vec<RecipientOutcome>,
}

impl FanoutReport {
    pub fn delivered_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.outcome, DeliveryOutcome::Delivered { .. }))
            .count()
    }

    pub fn translated_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.outcome, DeliveryOutcome::Delivered { translated: true }))
            .count()
    }

    pub fn error_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.outcome, DeliveryOutcome::ErrorNotified { .. }))
            .count()
    }

    /// Identities the caller should evict from the room.
    pub fn unreachable_ids(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|o| o.outcome == DeliveryOutcome::Unreachable)
            .map(|o| o.identity.clone())
            .collect()
    }
}

/// Routes one message through translation and synthesis to each recipient.
pub struct TranslationFanoutRouter {
    translator: Arc<dyn Translator>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    store: Arc<dyn MessageStore>,
}

impl TranslationFanoutRouter {
    pub fn new(
        translator: Arc<dyn Translator>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        store: Arc<dyn MessageStore>,
    ) -> Self {
        Self {
            translator,
            synthesizer,
            store,
        }
    }

    /// Fan `message` out to `members`.
    ///
    /// Never fails as a whole; every per-recipient problem is captured in the
    /// returned report. The caller owns eviction of unreachable recipients.
    pub async fn fan_out(
        &self,
        registry: &ConnectionRegistry,
        message: &SourceMessage,
        members: &[Participant],
    ) -> FanoutReport {
        self.persist(message);

        let mut outcomes = Vec::new();

        // Sender sees the original right away, marked untranslated
        if let Some(sender) = members.iter().find(|m| m.id == message.sender_id) {
            let echo = self.room_message(message, &message.source_language, &message.text, false, None);
            let outcome = match registry.send(&sender.id, echo) {
                Ok(()) => DeliveryOutcome::Delivered { translated: false },
                Err(_) => DeliveryOutcome::Unreachable,
            };
            outcomes.push(RecipientOutcome {
                identity: sender.id.clone(),
                outcome,
            });
        }

        let recipient_futures = members
            .iter()
            .filter(|m| m.id != message.sender_id)
            .map(|recipient| self.deliver_to(registry, message, recipient));
        outcomes.extend(join_all(recipient_futures).await);

        debug!(
            room_code = %message.room_code,
            recipients = outcomes.len(),
            "fan-out complete"
        );
        FanoutReport { outcomes }
    }

    /// One recipient's full pipeline: translate if needed, synthesize,
    /// deliver text then audio.
    async fn deliver_to(
        &self,
        registry: &ConnectionRegistry,
        message: &SourceMessage,
        recipient: &Participant,
    ) -> RecipientOutcome {
        let target = recipient.listen_language.clone();
        let needs_translation = target != message.source_language;

        let content = if needs_translation {
            match self
                .translator
                .translate(&message.text, &message.source_language, &target)
                .await
            {
                Ok(translated) => translated,
                Err(err) => {
                    warn!(identity = %recipient.id, %err, "translation failed");
                    return self.notify_error(registry, recipient, "translation_failed");
                }
            }
        } else {
            message.text.clone()
        };

        // Same-language recipients still get synthesized audio
        let audio_url = match self.synthesizer.synthesize(&content, &target, None).await {
            Ok(url) => Some(url),
            Err(err) => {
                warn!(identity = %recipient.id, %err, "synthesis failed");
                return self.notify_error(registry, recipient, "synthesis_failed");
            }
        };

        let room_message =
            self.room_message(message, &target, &content, needs_translation, audio_url.clone());
        if registry.send(&recipient.id, room_message).is_err() {
            return RecipientOutcome {
                identity: recipient.id.clone(),
                outcome: DeliveryOutcome::Unreachable,
            };
        }

        if let Some(url) = audio_url {
            let tts = ServerMessage::TtsAudio {
                audio_url: url,
                text: content,
                language: target,
            };
            if registry.send(&recipient.id, tts).is_err() {
                return RecipientOutcome {
                    identity: recipient.id.clone(),
                    outcome: DeliveryOutcome::Unreachable,
                };
            }
        }

        RecipientOutcome {
            identity: recipient.id.clone(),
            outcome: DeliveryOutcome::Delivered {
                translated: needs_translation,
            },
        }
    }

    fn notify_error(
        &self,
        registry: &ConnectionRegistry,
        recipient: &Participant,
        code: &str,
    ) -> RecipientOutcome {
        let notice = ServerMessage::Error {
            code: code.to_string(),
            message: "message could not be delivered in your language".to_string(),
        };
        let outcome = match registry.send(&recipient.id, notice) {
            Ok(()) => DeliveryOutcome::ErrorNotified {
                reason: code.to_string(),
            },
            Err(_) => DeliveryOutcome::Unreachable,
        };
        RecipientOutcome {
            identity: recipient.id.clone(),
            outcome,
        }
    }

    fn room_message(
        &self,
        message: &SourceMessage,
        target_language: &str,
        content: &str,
        translated: bool,
        audio_url: Option<String>,
    ) -> ServerMessage {
        ServerMessage::RoomMessage {
            room_code: message.room_code.clone(),
            content: content.to_string(),
            original_text: message.text.clone(),
            original_language: message.source_language.clone(),
            target_language: target_language.to_string(),
            translated,
            speaker_name: message.sender_name.clone(),
            emotion: message.emotion.clone(),
            audio_url,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    /// Fire-and-forget persistence; delivery never waits on the store.
    fn persist(&self, message: &SourceMessage) {
        let store = Arc::clone(&self.store);
        let session_id = message
            .session_id
            .clone()
            .unwrap_or_else(|| message.room_code.clone());
        let speaker_id = message.sender_id.clone();
        let content = message.text.clone();
        let metadata = json!({
            "room_code": message.room_code,
            "source_language": message.source_language,
            "emotion": message.emotion,
            "timestamp": Utc::now().to_rfc3339(),
        });
        tokio::spawn(async move {
            if let Err(err) = store
                .persist_message(&session_id, &speaker_id, &content, metadata)
                .await
            {
                error!(%err, session_id, "failed to persist message");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::local::LogOnlyStore;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    struct CountingTranslator {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Translator for CountingTranslator {
        async fn translate(
            &self,
            text: &str,
            _source_lang: &str,
            target_lang: &str,
        ) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{}:{}", target_lang, text))
        }
    }

    struct FailingTranslator {
        fail_for: String,
    }

    #[async_trait]
    impl Translator for FailingTranslator {
        async fn translate(
            &self,
            text: &str,
            _source_lang: &str,
            target_lang: &str,
        ) -> anyhow::Result<String> {
            if target_lang == self.fail_for {
                Err(anyhow!("engine unavailable"))
            } else {
                Ok(format!("{}:{}", target_lang, text))
            }
        }
    }

    struct SilentSynthesizer;

    #[async_trait]
    impl SpeechSynthesizer for SilentSynthesizer {
        async fn synthesize(
            &self,
            _text: &str,
            _language: &str,
            _voice_style: Option<&str>,
        ) -> anyhow::Result<String> {
            Ok("data:audio/pcm;base64,AAAA".to_string())
        }
    }

    fn member(id: &str, language: &str) -> Participant {
        Participant {
            id: id.to_string(),
            name: id.to_string(),
            language: language.to_string(),
            listen_language: language.to_string(),
            joined_at: Utc::now(),
        }
    }

    fn source(sender: &str) -> SourceMessage {
        SourceMessage {
            room_code: "room-1".to_string(),
            sender_id: sender.to_string(),
            sender_name: sender.to_string(),
            text: "hello everyone".to_string(),
            source_language: "en".to_string(),
            emotion: None,
            session_id: None,
        }
    }

    fn connect(registry: &ConnectionRegistry, id: &str) -> mpsc::UnboundedReceiver<ServerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        registry.register(id, tx);
        rx
    }

    #[tokio::test]
    async fn three_member_room_makes_exactly_two_translate_calls() {
        let translator = Arc::new(CountingTranslator {
            calls: AtomicUsize::new(0),
        });
        let router = TranslationFanoutRouter::new(
            translator.clone(),
            Arc::new(SilentSynthesizer),
            Arc::new(LogOnlyStore),
        );
        let registry = ConnectionRegistry::new();
        let mut alice_rx = connect(&registry, "alice");
        let mut bob_rx = connect(&registry, "bob");
        let mut carol_rx = connect(&registry, "carol");

        let members = vec![member("alice", "en"), member("bob", "es"), member("carol", "fr")];
        let report = router.fan_out(&registry, &source("alice"), &members).await;

        // es and fr each translated once; the en sender never is
        assert_eq!(translator.calls.load(Ordering::SeqCst), 2);
        assert_eq!(report.delivered_count(), 3);
        assert_eq!(report.translated_count(), 2);

        match alice_rx.try_recv().unwrap() {
            ServerMessage::RoomMessage { translated, content, .. } => {
                assert!(!translated);
                assert_eq!(content, "hello everyone");
            }
            other => panic!("unexpected first message for sender: {:?}", other),
        }
        match bob_rx.try_recv().unwrap() {
            ServerMessage::RoomMessage { translated, content, .. } => {
                assert!(translated);
                assert_eq!(content, "es:hello everyone");
            }
            other => panic!("unexpected message for bob: {:?}", other),
        }
        // text first, then the tts audio
        assert!(matches!(bob_rx.try_recv().unwrap(), ServerMessage::TtsAudio { .. }));
        assert!(matches!(carol_rx.try_recv().unwrap(), ServerMessage::RoomMessage { .. }));
    }

    #[tokio::test]
    async fn one_failing_recipient_does_not_block_the_others() {
        let router = TranslationFanoutRouter::new(
            Arc::new(FailingTranslator {
                fail_for: "fr".to_string(),
            }),
            Arc::new(SilentSynthesizer),
            Arc::new(LogOnlyStore),
        );
        let registry = ConnectionRegistry::new();
        let _alice_rx = connect(&registry, "alice");
        let mut bob_rx = connect(&registry, "bob");
        let mut carol_rx = connect(&registry, "carol");

        let members = vec![member("alice", "en"), member("bob", "es"), member("carol", "fr")];
        let report = router.fan_out(&registry, &source("alice"), &members).await;

        assert_eq!(report.delivered_count(), 2); // sender + bob
        assert_eq!(report.error_count(), 1);

        assert!(matches!(bob_rx.try_recv().unwrap(), ServerMessage::RoomMessage { .. }));
        match carol_rx.try_recv().unwrap() {
            ServerMessage::Error { code, .. } => assert_eq!(code, "translation_failed"),
            other => panic!("carol should get an error notice, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn unreachable_recipients_are_reported_for_eviction() {
        let router = TranslationFanoutRouter::new(
            Arc::new(CountingTranslator {
                calls: AtomicUsize::new(0),
            }),
            Arc::new(SilentSynthesizer),
            Arc::new(LogOnlyStore),
        );
        let registry = ConnectionRegistry::new();
        let _alice_rx = connect(&registry, "alice");
        // bob never registered a connection

        let members = vec![member("alice", "en"), member("bob", "es")];
        let report = router.fan_out(&registry, &source("alice"), &members).await;

        assert_eq!(report.unreachable_ids(), vec!["bob"]);
        assert_eq!(report.delivered_count(), 1);
    }
}
