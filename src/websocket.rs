//! # WebSocket Relay Handler
//!
//! One actor per connected participant. Clients connect to `/ws/{user_id}`
//! and exchange the JSON messages defined in `relay::protocol`.
//!
//! ## Connection lifecycle:
//! 1. **Connect**: an outbound mpsc channel is created; its sender is
//!    registered with the ConnectionRegistry, its receiver is bridged into
//!    the actor so anything the relay core sends lands on this socket
//! 2. **Messages**: room operations mutate the registries synchronously;
//!    translation/transcription paths run in spawned tasks and deliver
//!    results through the registry sinks
//! 3. **Disconnect**: unregister, leave the room (with a `user_left`
//!    broadcast), leave any multiparty session, end owned stream sessions

use crate::audio::buffer::AudioChunk;
use crate::audio::processor::{AudioFormat, AudioValidator};
use crate::audio::session::StreamParams;
use crate::relay::fanout::SourceMessage;
use crate::relay::protocol::{ClientMessage, ServerMessage};
use crate::relay::room::Participant;
use crate::state::{AppState, RelayServices};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use base64::Engine as _;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Fan-out work queued behind one connection's worker task.
enum RelayJob {
    Text { room_code: String, content: String },
    Voice { room_code: String, audio: Vec<u8> },
}

fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// WebSocket actor for one participant connection.
pub struct RelayWebSocket {
    /// Participant identity from the connection path
    identity: String,

    state: web::Data<AppState>,

    /// Receiver half of the outbound sink, consumed in `started`
    outbound: Option<mpsc::UnboundedReceiver<ServerMessage>>,

    /// Queue into this connection's fan-out worker; messages fan out in
    /// arrival order even when an earlier translation is slow
    jobs: Option<mpsc::UnboundedSender<RelayJob>>,

    last_heartbeat: Instant,
}

impl RelayWebSocket {
    pub fn new(identity: String, state: web::Data<AppState>) -> Self {
        Self {
            identity,
            state,
            outbound: None,
            jobs: None,
            last_heartbeat: Instant::now(),
        }
    }

    fn enqueue(&self, ctx: &mut ws::WebsocketContext<Self>, job: RelayJob) {
        match &self.jobs {
            Some(jobs) if jobs.send(job).is_ok() => {}
            _ => self.send_error(ctx, "internal_error", "message could not be queued"),
        }
    }

    fn services(&self) -> RelayServices {
        self.state.services.clone()
    }

    fn send_message(&self, ctx: &mut ws::WebsocketContext<Self>, message: &ServerMessage) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(err) => error!(%err, "failed to serialize outbound message"),
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, code: &str, message: &str) {
        warn!(identity = %self.identity, code, message, "relay error sent to client");
        self.send_message(
            ctx,
            &ServerMessage::Error {
                code: code.to_string(),
                message: message.to_string(),
            },
        );
    }

    fn handle_setup_languages(
        &self,
        ctx: &mut ws::WebsocketContext<Self>,
        user_language: String,
        listen_language: String,
    ) {
        let services = self.services();
        if !services
            .rooms
            .set_languages(&self.identity, &user_language, &listen_language)
        {
            self.send_error(ctx, "not_in_room", "join a room before setting languages");
            return;
        }
        self.send_message(
            ctx,
            &ServerMessage::LanguagesSetup {
                user_language,
                listen_language,
                message: "language preferences updated".to_string(),
            },
        );
    }

    fn handle_join_room(
        &self,
        ctx: &mut ws::WebsocketContext<Self>,
        room_code: Option<String>,
        user_name: Option<String>,
        user_language: Option<String>,
        listen_language: Option<String>,
    ) {
        let services = self.services();
        let room_code = room_code
            .filter(|code| !code.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string()[..8].to_string());

        let language = user_language.unwrap_or_else(|| "en".to_string());
        let participant = Participant {
            id: self.identity.clone(),
            name: user_name.unwrap_or_else(|| self.identity.clone()),
            listen_language: listen_language.unwrap_or_else(|| language.clone()),
            language,
            joined_at: chrono::Utc::now(),
        };
        let joined = participant.clone();

        let (snapshot, left) = services.rooms.join(&room_code, participant);

        // Tell the old room, if the join implied a leave
        if let Some(old_room) = left {
            services.rooms.broadcast(
                &services.registry,
                &old_room,
                &ServerMessage::UserLeft {
                    room_code: old_room.clone(),
                    user_id: self.identity.clone(),
                },
                None,
            );
        }

        self.send_message(
            ctx,
            &ServerMessage::RoomJoined {
                room_code: room_code.clone(),
                users: snapshot.members,
                message: format!("joined room {}", room_code),
            },
        );

        services.rooms.broadcast(
            &services.registry,
            &room_code,
            &ServerMessage::UserJoined {
                room_code: room_code.clone(),
                user: joined,
            },
            Some(&self.identity),
        );
    }

    fn handle_leave_room(&self, ctx: &mut ws::WebsocketContext<Self>, room_code: String) {
        let services = self.services();
        if !services.rooms.leave_room(&self.identity, &room_code) {
            self.send_error(ctx, "not_in_room", "you are not a member of that room");
            return;
        }
        let notice = ServerMessage::UserLeft {
            room_code: room_code.clone(),
            user_id: self.identity.clone(),
        };
        services
            .rooms
            .broadcast(&services.registry, &room_code, &notice, None);
        self.send_message(ctx, &notice);
    }

    /// Text message: fan out to the room in each member's language.
    fn handle_text_message(
        &self,
        ctx: &mut ws::WebsocketContext<Self>,
        room_code: String,
        content: String,
    ) {
        if content.trim().is_empty() {
            self.send_error(ctx, "empty_message", "message content is empty");
            return;
        }
        self.enqueue(ctx, RelayJob::Text { room_code, content });
    }

    /// Whole-utterance voice message: transcribe, echo the transcription to
    /// the speaker, then fan out like a text message.
    fn handle_voice_message(
        &self,
        ctx: &mut ws::WebsocketContext<Self>,
        room_code: String,
        audio_data: String,
    ) {
        let audio = match base64::engine::general_purpose::STANDARD.decode(audio_data.as_bytes()) {
            Ok(audio) => audio,
            Err(err) => {
                self.send_error(ctx, "invalid_audio", &format!("bad base64 audio: {}", err));
                return;
            }
        };
        self.enqueue(ctx, RelayJob::Voice { room_code, audio });
    }

    fn handle_start_stream(
        &self,
        ctx: &mut ws::WebsocketContext<Self>,
        session_id: Option<String>,
        room_code: Option<String>,
        source_lang: Option<String>,
        target_lang: Option<String>,
        translate_enabled: Option<bool>,
        voice_profile_id: Option<String>,
    ) {
        let services = self.services();
        let room_code = room_code.or_else(|| services.rooms.room_of(&self.identity));
        let session = services.sessions.create_session(StreamParams {
            owner_id: self.identity.clone(),
            session_id,
            room_code,
            source_lang: source_lang.unwrap_or_else(|| "auto".to_string()),
            target_lang: target_lang.unwrap_or_else(|| "en".to_string()),
            translate_enabled: translate_enabled.unwrap_or(true),
            voice_profile_id,
        });

        self.send_message(
            ctx,
            &ServerMessage::StreamStarted {
                session_id: session.session_id.clone(),
            },
        );
    }

    fn handle_audio_chunk(
        &self,
        ctx: &mut ws::WebsocketContext<Self>,
        session_id: String,
        sequence: u64,
        data: String,
        timestamp: Option<u64>,
    ) {
        let payload = match base64::engine::general_purpose::STANDARD.decode(data.as_bytes()) {
            Ok(payload) => payload,
            Err(err) => {
                self.send_error(ctx, "invalid_audio", &format!("bad base64 audio: {}", err));
                return;
            }
        };

        let config = self.state.get_config();
        let validator = AudioValidator::new(AudioFormat::new(
            config.audio.sample_rate,
            config.audio.channels,
            config.audio.bit_depth,
        ));
        if let Err(reason) = validator.validate_chunk(&payload, None) {
            self.send_error(ctx, "invalid_audio", &reason);
            return;
        }

        let chunk = AudioChunk {
            payload,
            sequence,
            timestamp_ms: timestamp.unwrap_or_else(epoch_millis),
            sample_rate: config.audio.sample_rate,
            channels: config.audio.channels,
        };

        let services = self.services();
        let identity = self.identity.clone();
        tokio::spawn(async move {
            if let Err(err) = services.sessions.process_chunk(&session_id, chunk).await {
                debug!(%identity, session_id, %err, "audio chunk rejected");
                let _ = services.registry.send(
                    &identity,
                    ServerMessage::Error {
                        code: "chunk_rejected".to_string(),
                        message: err.to_string(),
                    },
                );
            }
        });
    }

    fn handle_end_stream(&self, ctx: &mut ws::WebsocketContext<Self>, session_id: String) {
        let services = self.services();
        services.sessions.end_session(&session_id);
        self.send_message(
            ctx,
            &ServerMessage::SessionStatus {
                session_id,
                status: "ended".to_string(),
                message: None,
            },
        );
    }

    /// Full teardown shared by disconnect and actor stop.
    fn cleanup(&self) {
        let services = self.services();
        services.registry.unregister(&self.identity);

        if let Some(room_code) = services.rooms.leave(&self.identity) {
            services.rooms.broadcast(
                &services.registry,
                &room_code,
                &ServerMessage::UserLeft {
                    room_code: room_code.clone(),
                    user_id: self.identity.clone(),
                },
                None,
            );
        }

        services.multiparty.leave(&self.identity);
        services.sessions.end_sessions_owned_by(&self.identity);
    }
}

impl Actor for RelayWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(identity = %self.identity, "relay connection started");

        // Bridge the outbound channel into this socket
        let (tx, rx) = mpsc::unbounded_channel();
        self.outbound = Some(rx);
        self.services().registry.register(&self.identity, tx);
        if let Some(rx) = self.outbound.take() {
            ctx.add_stream(UnboundedReceiverStream::new(rx));
        }
        self.jobs = Some(spawn_fanout_worker(
            self.services(),
            self.state.clone(),
            self.identity.clone(),
        ));
        self.state.connection_opened();

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(identity = %act.identity, "heartbeat timeout, closing connection");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(identity = %self.identity, "relay connection stopped");
        self.cleanup();
        self.state.connection_closed();
    }
}

/// Relay-core messages flowing out to this client.
impl StreamHandler<ServerMessage> for RelayWebSocket {
    fn handle(&mut self, message: ServerMessage, ctx: &mut Self::Context) {
        self.send_message(ctx, &message);
    }
}

/// Frames arriving from the client.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RelayWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::SetupLanguages {
                    user_language,
                    listen_language,
                }) => self.handle_setup_languages(ctx, user_language, listen_language),
                Ok(ClientMessage::JoinRoom {
                    room_code,
                    user_name,
                    user_language,
                    listen_language,
                }) => self.handle_join_room(ctx, room_code, user_name, user_language, listen_language),
                Ok(ClientMessage::LeaveRoom { room_code }) => {
                    self.handle_leave_room(ctx, room_code)
                }
                Ok(ClientMessage::TextMessage { room_code, content }) => {
                    self.handle_text_message(ctx, room_code, content)
                }
                Ok(ClientMessage::VoiceMessage {
                    room_code,
                    audio_data,
                }) => self.handle_voice_message(ctx, room_code, audio_data),
                Ok(ClientMessage::StartStream {
                    session_id,
                    room_code,
                    source_lang,
                    target_lang,
                    translate_enabled,
                    voice_profile_id,
                }) => self.handle_start_stream(
                    ctx,
                    session_id,
                    room_code,
                    source_lang,
                    target_lang,
                    translate_enabled,
                    voice_profile_id,
                ),
                Ok(ClientMessage::AudioChunk {
                    session_id,
                    sequence,
                    data,
                    timestamp,
                }) => self.handle_audio_chunk(ctx, session_id, sequence, data, timestamp),
                Ok(ClientMessage::EndStream { session_id }) => {
                    self.handle_end_stream(ctx, session_id)
                }
                Ok(ClientMessage::Ping { timestamp }) => {
                    self.last_heartbeat = Instant::now();
                    self.send_message(ctx, &ServerMessage::Pong { timestamp });
                }
                Err(err) => {
                    self.send_error(ctx, "invalid_json", &format!("invalid message: {}", err))
                }
            },
            Ok(ws::Message::Binary(_)) => {
                self.send_error(
                    ctx,
                    "binary_unsupported",
                    "send audio as base64 audio_chunk messages",
                );
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(identity = %self.identity, "websocket closed: {:?}", reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(identity = %self.identity, %err, "websocket protocol error");
                ctx.stop();
            }
        }
    }
}

/// Spawn the long-lived worker that drains one connection's fan-out queue.
///
/// One job completes before the next starts, so a recipient sees a sender's
/// messages in the order they were sent even when an earlier message's
/// translation stalls. The worker exits when the actor drops its sender.
fn spawn_fanout_worker(
    services: RelayServices,
    state: web::Data<AppState>,
    identity: String,
) -> mpsc::UnboundedSender<RelayJob> {
    let (tx, mut rx) = mpsc::unbounded_channel::<RelayJob>();
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            match job {
                RelayJob::Text { room_code, content } => {
                    fan_out_text(&services, &state, &identity, &room_code, &content, None).await;
                }
                RelayJob::Voice { room_code, audio } => {
                    transcribe_and_fan_out(&services, &state, &identity, &room_code, audio).await;
                }
            }
        }
        debug!(%identity, "fan-out worker stopped");
    });
    tx
}

/// Voice-message pipeline: transcribe, echo the transcription back to the
/// speaker, then fan out like a text message in the detected language.
async fn transcribe_and_fan_out(
    services: &RelayServices,
    state: &web::Data<AppState>,
    identity: &str,
    room_code: &str,
    audio: Vec<u8>,
) {
    let speaker = services
        .rooms
        .members(room_code)
        .and_then(|members| members.into_iter().find(|m| m.id == identity));
    let hint = speaker
        .as_ref()
        .map(|p| p.language.clone())
        .unwrap_or_else(|| "auto".to_string());

    let transcription = match services.transcriber.transcribe(&audio, &hint).await {
        Ok(t) => t,
        Err(err) => {
            warn!(%identity, %err, "voice message transcription failed");
            let _ = services.registry.send(
                identity,
                ServerMessage::Error {
                    code: "transcription_failed".to_string(),
                    message: "voice message could not be transcribed".to_string(),
                },
            );
            return;
        }
    };

    if transcription.text.trim().is_empty() {
        return;
    }

    let _ = services.registry.send(
        identity,
        ServerMessage::VoiceTranscription {
            transcription: transcription.text.clone(),
            detected_language: transcription.detected_language.clone(),
            speaker_name: speaker
                .map(|p| p.name)
                .unwrap_or_else(|| identity.to_string()),
            emotion: None,
        },
    );

    fan_out_text(
        services,
        state,
        identity,
        room_code,
        &transcription.text,
        Some(transcription.detected_language),
    )
    .await;
}

/// Shared text/voice fan-out path: look up the room, run the router, evict
/// anything unreachable, and fold the report into the metrics.
async fn fan_out_text(
    services: &RelayServices,
    state: &web::Data<AppState>,
    identity: &str,
    room_code: &str,
    content: &str,
    detected_language: Option<String>,
) {
    let members = match services.rooms.members(room_code) {
        Some(members) => members,
        None => {
            let _ = services.registry.send(
                identity,
                ServerMessage::Error {
                    code: "room_not_found".to_string(),
                    message: format!("room '{}' does not exist", room_code),
                },
            );
            return;
        }
    };

    let sender = match members.iter().find(|m| m.id == identity) {
        Some(sender) => sender.clone(),
        None => {
            let _ = services.registry.send(
                identity,
                ServerMessage::Error {
                    code: "not_in_room".to_string(),
                    message: "join the room before sending messages".to_string(),
                },
            );
            return;
        }
    };

    let message = SourceMessage {
        room_code: room_code.to_string(),
        sender_id: identity.to_string(),
        sender_name: sender.name.clone(),
        text: content.to_string(),
        source_language: detected_language.unwrap_or(sender.language),
        emotion: None,
        session_id: None,
    };

    let report = services
        .router
        .fan_out(&services.registry, &message, &members)
        .await;

    for unreachable in report.unreachable_ids() {
        services.rooms.leave_room(&unreachable, room_code);
        services.registry.unregister(&unreachable);
        services.rooms.broadcast(
            &services.registry,
            room_code,
            &ServerMessage::UserLeft {
                room_code: room_code.to_string(),
                user_id: unreachable,
            },
            None,
        );
    }

    services.rooms.record_message(room_code);
    state.record_fanout(
        report.translated_count() as u64,
        report.error_count() as u64,
        report.unreachable_ids().len() as u64,
    );
}

/// HTTP → WebSocket upgrade for `/ws/{user_id}`.
pub async fn relay_websocket(
    req: HttpRequest,
    stream: web::Payload,
    path: web::Path<String>,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let identity = path.into_inner();
    info!(%identity, peer = ?req.connection_info().peer_addr(), "new relay connection request");
    ws::start(RelayWebSocket::new(identity, app_state), &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::ReorderBufferConfig;
    use crate::audio::session::StreamingSessionManager;
    use crate::config::AppConfig;
    use crate::engines::local::{LocalSpeechToText, LocalSynthesizer, LogOnlyStore};
    use crate::engines::Translator;
    use crate::relay::connection::ConnectionRegistry;
    use crate::relay::fanout::TranslationFanoutRouter;
    use crate::relay::multiparty::MultipartyManager;
    use crate::relay::room::RoomRegistry;
    use crate::state::AppMetrics;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, RwLock};

    /// Stalls only its first translate call, so a later message would
    /// overtake an earlier one if fan-outs ran concurrently.
    struct SlowFirstTranslator {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Translator for SlowFirstTranslator {
        async fn translate(
            &self,
            text: &str,
            _source_lang: &str,
            target_lang: &str,
        ) -> Result<String> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Ok(format!("{}:{}", target_lang, text))
        }
    }

    fn member(id: &str, language: &str) -> Participant {
        Participant {
            id: id.to_string(),
            name: id.to_string(),
            language: language.to_string(),
            listen_language: language.to_string(),
            joined_at: chrono::Utc::now(),
        }
    }

    fn services_with(translator: Arc<dyn Translator>) -> (RelayServices, web::Data<AppState>) {
        let registry = Arc::new(ConnectionRegistry::new());
        let rooms = Arc::new(RoomRegistry::new());
        let multiparty = Arc::new(MultipartyManager::new(4));
        let metrics = Arc::new(RwLock::new(AppMetrics::default()));
        let transcriber: Arc<dyn crate::engines::SpeechToText> = Arc::new(LocalSpeechToText);
        let synthesizer: Arc<dyn crate::engines::SpeechSynthesizer> =
            Arc::new(LocalSynthesizer::new(16000));
        let store: Arc<dyn crate::engines::MessageStore> = Arc::new(LogOnlyStore);
        let router = Arc::new(TranslationFanoutRouter::new(
            Arc::clone(&translator),
            Arc::clone(&synthesizer),
            Arc::clone(&store),
        ));
        let sessions = Arc::new(StreamingSessionManager::new(
            Arc::clone(&rooms),
            Arc::clone(&registry),
            Arc::clone(&router),
            Arc::clone(&transcriber),
            translator,
            synthesizer,
            store,
            Arc::clone(&metrics),
            ReorderBufferConfig::default(),
            3600,
        ));
        let services = RelayServices {
            registry,
            rooms,
            multiparty,
            sessions,
            router,
            transcriber,
        };
        let state = web::Data::new(AppState::new(
            AppConfig::default(),
            metrics,
            services.clone(),
        ));
        (services, state)
    }

    #[test]
    fn epoch_millis_is_sane() {
        // after 2020, before 2100
        let now = epoch_millis();
        assert!(now > 1_577_836_800_000);
        assert!(now < 4_102_444_800_000);
    }

    #[tokio::test]
    async fn queued_messages_fan_out_in_send_order() {
        let (services, state) = services_with(Arc::new(SlowFirstTranslator {
            calls: AtomicUsize::new(0),
        }));
        let (alice_tx, _alice_rx) = mpsc::unbounded_channel();
        let (bob_tx, mut bob_rx) = mpsc::unbounded_channel();
        services.registry.register("alice", alice_tx);
        services.registry.register("bob", bob_tx);
        services.rooms.join("room-1", member("alice", "en"));
        services.rooms.join("room-1", member("bob", "es"));

        let jobs = spawn_fanout_worker(services.clone(), state, "alice".to_string());
        jobs.send(RelayJob::Text {
            room_code: "room-1".to_string(),
            content: "first".to_string(),
        })
        .unwrap();
        jobs.send(RelayJob::Text {
            room_code: "room-1".to_string(),
            content: "second".to_string(),
        })
        .unwrap();

        // "first" stalls 100ms in translation; "second" must still not
        // overtake it on bob's connection
        let mut texts = Vec::new();
        while texts.len() < 2 {
            match tokio::time::timeout(Duration::from_secs(2), bob_rx.recv()).await {
                Ok(Some(ServerMessage::RoomMessage { content, .. })) => texts.push(content),
                Ok(Some(_)) => {}
                _ => panic!("timed out waiting for bob's messages"),
            }
        }
        assert_eq!(texts, vec!["es:first", "es:second"]);
    }
}
