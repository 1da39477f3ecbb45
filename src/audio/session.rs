//! # Streaming Session Management
//!
//! Lifecycle of chunked audio streaming sessions: creation, per-chunk
//! processing through the reorder buffer into transcription and fan-out,
//! explicit teardown, and the idle-timeout sweep.
//!
//! ## Session Lifecycle:
//! 1. **Created**: session registered, no audio seen yet
//! 2. **Active**: chunks flowing
//! 3. **Closed**: explicit end, owner disconnect, or idle timeout — all
//!    three run the same teardown
//!
//! ## Thread Safety:
//! The session table is a plain RwLock touched only in synchronous methods.
//! Per-session chunk processing is serialized by holding the session's
//! buffer mutex across the whole pipeline, so concurrent chunk deliveries
//! for one session cannot interleave their transcription output.

use crate::audio::buffer::{AudioChunk, AudioReorderBuffer, ReorderBufferConfig, SequenceGap};
use crate::engines::{MessageStore, SpeechSynthesizer, SpeechToText, Translator};
use crate::error::AppError;
use crate::relay::connection::ConnectionRegistry;
use crate::relay::fanout::{SourceMessage, TranslationFanoutRouter};
use crate::relay::protocol::ServerMessage;
use crate::relay::room::RoomRegistry;
use crate::state::AppMetrics;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Current state of a streaming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Created,
    Active,
    Closed,
}

impl StreamState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamState::Created => "created",
            StreamState::Active => "active",
            StreamState::Closed => "closed",
        }
    }
}

/// Parameters for opening a stream.
#[derive(Debug, Clone)]
pub struct StreamParams {
    pub owner_id: String,
    pub session_id: Option<String>,
    pub room_code: Option<String>,
    pub source_lang: String,
    pub target_lang: String,
    pub translate_enabled: bool,
    pub voice_profile_id: Option<String>,
}

/// One chunked audio streaming session.
pub struct StreamSession {
    pub session_id: String,
    pub owner_id: String,
    /// When set, transcripts fan out to this room; otherwise results go to
    /// the owner only
    pub room_code: Option<String>,
    pub source_lang: String,
    pub target_lang: String,
    pub translate_enabled: bool,
    pub voice_profile_id: Option<String>,
    pub created_at: DateTime<Utc>,
    state: RwLock<StreamState>,
    last_activity: RwLock<DateTime<Utc>>,
    /// Holding this across the pipeline serializes per-session processing
    buffer: Mutex<AudioReorderBuffer>,
}

impl StreamSession {
    fn new(params: StreamParams, buffer_config: ReorderBufferConfig) -> Self {
        let now = Utc::now();
        Self {
            session_id: params
                .session_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            owner_id: params.owner_id,
            room_code: params.room_code,
            source_lang: params.source_lang,
            target_lang: params.target_lang,
            translate_enabled: params.translate_enabled,
            voice_profile_id: params.voice_profile_id,
            created_at: now,
            state: RwLock::new(StreamState::Created),
            last_activity: RwLock::new(now),
            buffer: Mutex::new(AudioReorderBuffer::new(buffer_config)),
        }
    }

    pub fn state(&self) -> StreamState {
        *self.state.read().unwrap()
    }

    fn set_state(&self, state: StreamState) {
        *self.state.write().unwrap() = state;
    }

    /// Refresh the activity timestamp; never moves it backwards.
    fn touch(&self) {
        let now = Utc::now();
        let mut last = self.last_activity.write().unwrap();
        if now > *last {
            *last = now;
        }
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.read().unwrap()
    }

    fn idle_seconds(&self, now: DateTime<Utc>) -> i64 {
        now.signed_duration_since(self.last_activity()).num_seconds()
    }
}

/// What one chunk delivery accomplished.
#[derive(Debug, Clone)]
pub struct ChunkReport {
    /// Chunks released and transcribed during this call
    pub released: usize,
    /// Gap introduced by capacity eviction, if any
    pub gap: Option<SequenceGap>,
}

/// Read-only stream listing entry for the REST surface.
#[derive(Debug, Clone, Serialize)]
pub struct StreamOverview {
    pub session_id: String,
    pub owner_id: String,
    pub room_code: Option<String>,
    pub state: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// Owns all streaming sessions and wires buffer output into transcription
/// and translation fan-out.
pub struct StreamingSessionManager {
    sessions: RwLock<HashMap<String, Arc<StreamSession>>>,
    rooms: Arc<RoomRegistry>,
    registry: Arc<ConnectionRegistry>,
    router: Arc<TranslationFanoutRouter>,
    transcriber: Arc<dyn SpeechToText>,
    translator: Arc<dyn Translator>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    store: Arc<dyn MessageStore>,
    /// Shared with AppState; this manager owns the stream-session gauge and
    /// the stream fan-out counters
    metrics: Arc<RwLock<AppMetrics>>,
    buffer_config: ReorderBufferConfig,
    idle_timeout_secs: u64,
}

impl StreamingSessionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rooms: Arc<RoomRegistry>,
        registry: Arc<ConnectionRegistry>,
        router: Arc<TranslationFanoutRouter>,
        transcriber: Arc<dyn SpeechToText>,
        translator: Arc<dyn Translator>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        store: Arc<dyn MessageStore>,
        metrics: Arc<RwLock<AppMetrics>>,
        buffer_config: ReorderBufferConfig,
        idle_timeout_secs: u64,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            rooms,
            registry,
            router,
            transcriber,
            translator,
            synthesizer,
            store,
            metrics,
            buffer_config,
            idle_timeout_secs,
        }
    }

    /// Open a stream, or return the existing one for the same id.
    ///
    /// The active-session gauge only moves for genuinely new sessions.
    pub fn create_session(&self, params: StreamParams) -> Arc<StreamSession> {
        let mut sessions = self.sessions.write().unwrap();
        if let Some(id) = &params.session_id {
            if let Some(existing) = sessions.get(id) {
                return Arc::clone(existing);
            }
        }
        let session = Arc::new(StreamSession::new(params, self.buffer_config.clone()));
        info!(
            session_id = %session.session_id,
            owner_id = %session.owner_id,
            room_code = ?session.room_code,
            "stream session created"
        );
        sessions.insert(session.session_id.clone(), Arc::clone(&session));
        self.metrics.write().unwrap().stream_session_opened();
        session
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<StreamSession>> {
        self.sessions.read().unwrap().get(session_id).cloned()
    }

    pub fn active_count(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    pub fn overviews(&self) -> Vec<StreamOverview> {
        let sessions = self.sessions.read().unwrap();
        let mut overviews: Vec<StreamOverview> = sessions
            .values()
            .map(|s| StreamOverview {
                session_id: s.session_id.clone(),
                owner_id: s.owner_id.clone(),
                room_code: s.room_code.clone(),
                state: s.state().as_str().to_string(),
                created_at: s.created_at,
                last_activity: s.last_activity(),
            })
            .collect();
        overviews.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        overviews
    }

    /// Route one chunk into its session and run the downstream pipeline for
    /// everything the buffer releases.
    pub async fn process_chunk(
        &self,
        session_id: &str,
        chunk: AudioChunk,
    ) -> Result<ChunkReport, AppError> {
        let session = self
            .get(session_id)
            .ok_or_else(|| AppError::NotFound(format!("stream session '{}' not found", session_id)))?;

        // Serializes all processing for this session
        let mut buffer = session.buffer.lock().await;

        let gap = buffer.accept(chunk);
        if let Some(gap) = gap {
            warn!(
                session_id,
                lost_from = gap.from,
                lost_to = gap.to,
                "audio lost to buffer eviction"
            );
            let _ = self.registry.send(
                &session.owner_id,
                ServerMessage::StreamGap {
                    session_id: session.session_id.clone(),
                    lost_from: gap.from,
                    lost_to: gap.to,
                },
            );
        }

        let released = buffer.drain();
        session.set_state(StreamState::Active);
        session.touch();

        let count = released.len();
        for chunk in released {
            self.process_released(&session, chunk).await;
        }

        Ok(ChunkReport {
            released: count,
            gap,
        })
    }

    /// Transcribe one released chunk and deliver the results.
    async fn process_released(&self, session: &StreamSession, chunk: AudioChunk) {
        let transcription = match self
            .transcriber
            .transcribe(&chunk.payload, &session.source_lang)
            .await
        {
            Ok(t) => t,
            Err(err) => {
                warn!(session_id = %session.session_id, %err, "transcription failed");
                let _ = self.registry.send(
                    &session.owner_id,
                    ServerMessage::Error {
                        code: "transcription_failed".to_string(),
                        message: "audio could not be transcribed".to_string(),
                    },
                );
                return;
            }
        };

        // Empty transcript means no speech
        if transcription.text.trim().is_empty() {
            return;
        }

        let _ = self.registry.send(
            &session.owner_id,
            ServerMessage::Transcript {
                session_id: session.session_id.clone(),
                text: transcription.text.clone(),
                language: transcription.detected_language.clone(),
                sequence: chunk.sequence,
            },
        );

        self.persist_transcript(session, &transcription.text, chunk.sequence);

        if !session.translate_enabled {
            return;
        }

        match &session.room_code {
            Some(room_code) => self.fan_out_to_room(session, room_code, &transcription.text).await,
            None => self.deliver_solo_translation(session, &transcription.text).await,
        }
    }

    async fn fan_out_to_room(&self, session: &StreamSession, room_code: &str, text: &str) {
        let members = match self.rooms.members(room_code) {
            Some(members) => members,
            None => {
                debug!(room_code, "stream room gone, skipping fan-out");
                return;
            }
        };
        let sender_name = members
            .iter()
            .find(|m| m.id == session.owner_id)
            .map(|m| m.name.clone())
            .unwrap_or_else(|| session.owner_id.clone());

        let message = SourceMessage {
            room_code: room_code.to_string(),
            sender_id: session.owner_id.clone(),
            sender_name,
            text: text.to_string(),
            source_language: session.source_lang.clone(),
            emotion: None,
            session_id: Some(session.session_id.clone()),
        };
        let report = self.router.fan_out(&self.registry, &message, &members).await;
        let unreachable = report.unreachable_ids();
        let lost = unreachable.len() as u64;
        for identity in unreachable {
            self.rooms.leave_room(&identity, room_code);
            self.registry.unregister(&identity);
            self.rooms.broadcast(
                &self.registry,
                room_code,
                &ServerMessage::UserLeft {
                    room_code: room_code.to_string(),
                    user_id: identity,
                },
                None,
            );
        }
        self.rooms.record_message(room_code);
        self.metrics.write().unwrap().record_fanout(
            report.translated_count() as u64,
            report.error_count() as u64,
            lost,
        );
    }

    /// Room-less stream: translate for the owner alone.
    async fn deliver_solo_translation(&self, session: &StreamSession, text: &str) {
        let translated = match self
            .translator
            .translate(text, &session.source_lang, &session.target_lang)
            .await
        {
            Ok(t) => t,
            Err(err) => {
                warn!(session_id = %session.session_id, %err, "solo translation failed");
                let _ = self.registry.send(
                    &session.owner_id,
                    ServerMessage::Error {
                        code: "translation_failed".to_string(),
                        message: "transcript could not be translated".to_string(),
                    },
                );
                return;
            }
        };

        let audio_url = match self
            .synthesizer
            .synthesize(
                &translated,
                &session.target_lang,
                session.voice_profile_id.as_deref(),
            )
            .await
        {
            Ok(url) => Some(url),
            Err(err) => {
                warn!(session_id = %session.session_id, %err, "solo synthesis failed");
                None
            }
        };

        let _ = self.registry.send(
            &session.owner_id,
            ServerMessage::Translation {
                session_id: session.session_id.clone(),
                text: translated,
                target_lang: session.target_lang.clone(),
                audio_url,
            },
        );
    }

    fn persist_transcript(&self, session: &StreamSession, text: &str, sequence: u64) {
        let store = Arc::clone(&self.store);
        let session_id = session.session_id.clone();
        let speaker_id = session.owner_id.clone();
        let text = text.to_string();
        let metadata = json!({
            "sequence": sequence,
            "source_lang": session.source_lang,
            "room_code": session.room_code,
        });
        tokio::spawn(async move {
            if let Err(err) = store
                .persist_message(&session_id, &speaker_id, &text, metadata)
                .await
            {
                warn!(%err, session_id, "failed to persist transcript");
            }
        });
    }

    /// Close and remove a session. Unknown ids are a no-op.
    ///
    /// Every teardown path (explicit end, REST, disconnect, idle sweep) goes
    /// through here, so the gauge cannot drift.
    pub fn end_session(&self, session_id: &str) -> bool {
        let removed = self.sessions.write().unwrap().remove(session_id);
        match removed {
            Some(session) => {
                session.set_state(StreamState::Closed);
                self.metrics.write().unwrap().stream_session_closed();
                info!(session_id, "stream session ended");
                true
            }
            None => false,
        }
    }

    /// Tear down every session the identity owns (disconnect path).
    pub fn end_sessions_owned_by(&self, owner_id: &str) -> Vec<String> {
        let owned: Vec<String> = {
            let sessions = self.sessions.read().unwrap();
            sessions
                .values()
                .filter(|s| s.owner_id == owner_id)
                .map(|s| s.session_id.clone())
                .collect()
        };
        for session_id in &owned {
            self.end_session(session_id);
        }
        owned
    }

    /// Close sessions idle longer than the configured timeout.
    ///
    /// Runs from the background sweep task; owners still connected get a
    /// session_status notice.
    pub fn sweep_idle(&self) -> Vec<String> {
        let now = Utc::now();
        let expired: Vec<(String, String)> = {
            let sessions = self.sessions.read().unwrap();
            sessions
                .values()
                .filter(|s| s.idle_seconds(now) >= self.idle_timeout_secs as i64)
                .map(|s| (s.session_id.clone(), s.owner_id.clone()))
                .collect()
        };

        let mut closed = Vec::new();
        for (session_id, owner_id) in expired {
            if self.end_session(&session_id) {
                info!(session_id, "stream session closed by idle timeout");
                let _ = self.registry.send(
                    &owner_id,
                    ServerMessage::SessionStatus {
                        session_id: session_id.clone(),
                        status: "closed".to_string(),
                        message: Some("session closed after idle timeout".to_string()),
                    },
                );
                closed.push(session_id);
            }
        }
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::local::{LocalSpeechToText, LocalSynthesizer, LocalTranslator, LogOnlyStore};
    use crate::engines::Transcription;
    use anyhow::Result;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    struct EchoingStt;

    #[async_trait]
    impl SpeechToText for EchoingStt {
        async fn transcribe(&self, audio: &[u8], hint_language: &str) -> Result<Transcription> {
            Ok(Transcription {
                text: format!("{} bytes", audio.len()),
                detected_language: hint_language.to_string(),
            })
        }
    }

    struct SilentStt;

    #[async_trait]
    impl SpeechToText for SilentStt {
        async fn transcribe(&self, _audio: &[u8], hint_language: &str) -> Result<Transcription> {
            Ok(Transcription {
                text: String::new(),
                detected_language: hint_language.to_string(),
            })
        }
    }

    fn manager_with(
        transcriber: Arc<dyn SpeechToText>,
    ) -> (
        StreamingSessionManager,
        Arc<ConnectionRegistry>,
        Arc<RwLock<AppMetrics>>,
    ) {
        let registry = Arc::new(ConnectionRegistry::new());
        let rooms = Arc::new(RoomRegistry::new());
        let metrics = Arc::new(RwLock::new(AppMetrics::default()));
        let router = Arc::new(TranslationFanoutRouter::new(
            Arc::new(LocalTranslator),
            Arc::new(LocalSynthesizer::new(16000)),
            Arc::new(LogOnlyStore),
        ));
        let manager = StreamingSessionManager::new(
            rooms,
            Arc::clone(&registry),
            router,
            transcriber,
            Arc::new(LocalTranslator),
            Arc::new(LocalSynthesizer::new(16000)),
            Arc::new(LogOnlyStore),
            Arc::clone(&metrics),
            ReorderBufferConfig::default(),
            3600,
        );
        (manager, registry, metrics)
    }

    fn params(owner: &str, session_id: &str) -> StreamParams {
        StreamParams {
            owner_id: owner.to_string(),
            session_id: Some(session_id.to_string()),
            room_code: None,
            source_lang: "en".to_string(),
            target_lang: "es".to_string(),
            translate_enabled: false,
            voice_profile_id: None,
        }
    }

    fn chunk(sequence: u64) -> AudioChunk {
        let sample: i16 = 8000;
        AudioChunk {
            payload: (0..160).flat_map(|_| sample.to_le_bytes()).collect(),
            sequence,
            timestamp_ms: sequence * 20,
            sample_rate: 16000,
            channels: 1,
        }
    }

    #[tokio::test]
    async fn transcripts_arrive_in_sequence_order() {
        let (manager, registry, _metrics) = manager_with(Arc::new(EchoingStt));
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register("alice", tx);
        manager.create_session(params("alice", "s1"));

        // out-of-order arrival: 1 before 0
        manager.process_chunk("s1", chunk(1)).await.unwrap();
        let report = manager.process_chunk("s1", chunk(0)).await.unwrap();
        assert_eq!(report.released, 2);

        let mut sequences = Vec::new();
        while let Ok(message) = rx.try_recv() {
            if let ServerMessage::Transcript { sequence, .. } = message {
                sequences.push(sequence);
            }
        }
        assert_eq!(sequences, vec![0, 1]);
    }

    #[tokio::test]
    async fn empty_transcripts_are_dropped_silently() {
        let (manager, registry, _metrics) = manager_with(Arc::new(SilentStt));
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register("alice", tx);
        manager.create_session(params("alice", "s1"));

        manager.process_chunk("s1", chunk(0)).await.unwrap();
        assert!(rx.try_recv().is_err(), "no speech should produce no messages");
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let (manager, _registry, _metrics) = manager_with(Arc::new(EchoingStt));
        let err = manager.process_chunk("ghost", chunk(0)).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn end_session_is_idempotent() {
        let (manager, _registry, _metrics) = manager_with(Arc::new(EchoingStt));
        manager.create_session(params("alice", "s1"));
        assert!(manager.end_session("s1"));
        assert!(!manager.end_session("s1"));
        assert!(!manager.end_session("never-existed"));
    }

    #[tokio::test]
    async fn disconnect_ends_only_owned_sessions() {
        let (manager, _registry, _metrics) = manager_with(Arc::new(EchoingStt));
        manager.create_session(params("alice", "s1"));
        manager.create_session(params("alice", "s2"));
        manager.create_session(params("bob", "s3"));

        let mut ended = manager.end_sessions_owned_by("alice");
        ended.sort();
        assert_eq!(ended, vec!["s1", "s2"]);
        assert_eq!(manager.active_count(), 1);
    }

    #[tokio::test]
    async fn idle_sweep_closes_stale_sessions_only() {
        let (manager, registry, _metrics) = manager_with(Arc::new(EchoingStt));
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register("alice", tx);

        let stale = manager.create_session(params("alice", "stale"));
        manager.create_session(params("alice", "fresh"));
        *stale.last_activity.write().unwrap() = Utc::now() - chrono::Duration::seconds(7200);

        let closed = manager.sweep_idle();
        assert_eq!(closed, vec!["stale"]);
        assert!(manager.get("stale").is_none());
        assert!(manager.get("fresh").is_some());

        match rx.try_recv().unwrap() {
            ServerMessage::SessionStatus { session_id, status, .. } => {
                assert_eq!(session_id, "stale");
                assert_eq!(status, "closed");
            }
            other => panic!("expected session_status, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn eviction_gap_is_reported_to_the_owner() {
        let registry = Arc::new(ConnectionRegistry::new());
        let rooms = Arc::new(RoomRegistry::new());
        let router = Arc::new(TranslationFanoutRouter::new(
            Arc::new(LocalTranslator),
            Arc::new(LocalSynthesizer::new(16000)),
            Arc::new(LogOnlyStore),
        ));
        let manager = StreamingSessionManager::new(
            rooms,
            Arc::clone(&registry),
            router,
            Arc::new(LocalSpeechToText),
            Arc::new(LocalTranslator),
            Arc::new(LocalSynthesizer::new(16000)),
            Arc::new(LogOnlyStore),
            Arc::new(RwLock::new(AppMetrics::default())),
            ReorderBufferConfig {
                capacity: 2,
                ..ReorderBufferConfig::default()
            },
            3600,
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register("alice", tx);
        manager.create_session(params("alice", "s1"));

        // sequence 0 never arrives, so 1..=3 overflow the capacity-2 buffer
        manager.process_chunk("s1", chunk(1)).await.unwrap();
        manager.process_chunk("s1", chunk(2)).await.unwrap();
        let report = manager.process_chunk("s1", chunk(3)).await.unwrap();
        assert!(report.gap.is_some());

        let mut saw_gap = false;
        while let Ok(message) = rx.try_recv() {
            if let ServerMessage::StreamGap { lost_from, lost_to, .. } = message {
                saw_gap = true;
                assert!(lost_from <= lost_to);
            }
        }
        assert!(saw_gap, "owner should be told about the gap");
    }

    #[tokio::test]
    async fn session_gauge_tracks_create_end_and_sweep() {
        let (manager, _registry, metrics) = manager_with(Arc::new(EchoingStt));

        manager.create_session(params("alice", "s1"));
        // re-opening the same id must not double-count
        manager.create_session(params("alice", "s1"));
        let stale = manager.create_session(params("alice", "s2"));
        assert_eq!(metrics.read().unwrap().active_stream_sessions, 2);

        assert!(manager.end_session("s1"));
        assert!(!manager.end_session("s1"));
        assert_eq!(metrics.read().unwrap().active_stream_sessions, 1);

        *stale.last_activity.write().unwrap() = Utc::now() - chrono::Duration::seconds(7200);
        assert_eq!(manager.sweep_idle(), vec!["s2"]);
        assert_eq!(metrics.read().unwrap().active_stream_sessions, 0);
    }

    #[tokio::test]
    async fn room_stream_fanout_is_counted_in_metrics() {
        let registry = Arc::new(ConnectionRegistry::new());
        let rooms = Arc::new(RoomRegistry::new());
        let metrics = Arc::new(RwLock::new(AppMetrics::default()));
        let router = Arc::new(TranslationFanoutRouter::new(
            Arc::new(LocalTranslator),
            Arc::new(LocalSynthesizer::new(16000)),
            Arc::new(LogOnlyStore),
        ));
        let manager = StreamingSessionManager::new(
            Arc::clone(&rooms),
            Arc::clone(&registry),
            router,
            Arc::new(EchoingStt),
            Arc::new(LocalTranslator),
            Arc::new(LocalSynthesizer::new(16000)),
            Arc::new(LogOnlyStore),
            Arc::clone(&metrics),
            ReorderBufferConfig::default(),
            3600,
        );

        let (alice_tx, _alice_rx) = mpsc::unbounded_channel();
        let (bob_tx, _bob_rx) = mpsc::unbounded_channel();
        registry.register("alice", alice_tx);
        registry.register("bob", bob_tx);
        rooms.join(
            "room-1",
            crate::relay::room::Participant {
                id: "alice".to_string(),
                name: "alice".to_string(),
                language: "en".to_string(),
                listen_language: "en".to_string(),
                joined_at: Utc::now(),
            },
        );
        rooms.join(
            "room-1",
            crate::relay::room::Participant {
                id: "bob".to_string(),
                name: "bob".to_string(),
                language: "es".to_string(),
                listen_language: "es".to_string(),
                joined_at: Utc::now(),
            },
        );

        manager.create_session(StreamParams {
            owner_id: "alice".to_string(),
            session_id: Some("s1".to_string()),
            room_code: Some("room-1".to_string()),
            source_lang: "en".to_string(),
            target_lang: "es".to_string(),
            translate_enabled: true,
            voice_profile_id: None,
        });
        manager.process_chunk("s1", chunk(0)).await.unwrap();

        let snapshot = metrics.read().unwrap();
        assert_eq!(snapshot.messages_relayed, 1);
        assert_eq!(snapshot.translations_completed, 1, "bob's es translation");
        assert_eq!(snapshot.delivery_failures, 0);
    }
}
