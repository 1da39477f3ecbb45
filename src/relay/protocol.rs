//! # Wire Protocol
//!
//! JSON message types exchanged over the WebSocket connection. Clients send
//! `ClientMessage` variants; the relay replies and broadcasts with
//! `ServerMessage` variants. Both use a `type` tag with snake_case names so
//! the protocol stays readable in browser dev tools.

use crate::relay::room::Participant;
use serde::{Deserialize, Serialize};

/// Messages accepted from clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Update the sender's spoken/listening language preferences
    #[serde(rename = "setup_languages")]
    SetupLanguages {
        user_language: String,
        listen_language: String,
    },

    /// Join a room (created lazily); omitting the code generates one
    #[serde(rename = "join_room")]
    JoinRoom {
        room_code: Option<String>,
        user_name: Option<String>,
        user_language: Option<String>,
        listen_language: Option<String>,
    },

    /// Leave a room explicitly
    #[serde(rename = "leave_room")]
    LeaveRoom { room_code: String },

    /// Text message to be translated and fanned out to the room
    #[serde(rename = "text_message")]
    TextMessage { room_code: String, content: String },

    /// Whole-utterance voice message (base64 PCM) to transcribe and fan out
    #[serde(rename = "voice_message")]
    VoiceMessage { room_code: String, audio_data: String },

    /// Open a streaming session for sequenced audio chunks
    #[serde(rename = "start_stream")]
    StartStream {
        session_id: Option<String>,
        room_code: Option<String>,
        source_lang: Option<String>,
        target_lang: Option<String>,
        translate_enabled: Option<bool>,
        voice_profile_id: Option<String>,
    },

    /// One sequenced audio chunk for an open streaming session
    #[serde(rename = "audio_chunk")]
    AudioChunk {
        session_id: String,
        sequence: u64,
        /// Base64-encoded PCM payload
        data: String,
        /// Capture timestamp (ms since epoch); server time if omitted
        timestamp: Option<u64>,
    },

    /// Close a streaming session (idempotent)
    #[serde(rename = "end_stream")]
    EndStream { session_id: String },

    /// Heartbeat
    #[serde(rename = "ping")]
    Ping { timestamp: u64 },
}

/// Messages sent to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Acknowledges a language preference update
    #[serde(rename = "languages_setup")]
    LanguagesSetup {
        user_language: String,
        listen_language: String,
        message: String,
    },

    /// Sent to the joining participant with the room snapshot
    #[serde(rename = "room_joined")]
    RoomJoined {
        room_code: String,
        users: Vec<Participant>,
        message: String,
    },

    /// Broadcast to existing members when someone joins
    #[serde(rename = "user_joined")]
    UserJoined { room_code: String, user: Participant },

    /// Broadcast when a member leaves or is evicted
    #[serde(rename = "user_left")]
    UserLeft { room_code: String, user_id: String },

    /// Echo of the sender's own transcription (voice path)
    #[serde(rename = "voice_transcription")]
    VoiceTranscription {
        transcription: String,
        detected_language: String,
        speaker_name: String,
        emotion: Option<String>,
    },

    /// Per-recipient translated (or original) room message
    #[serde(rename = "room_message")]
    RoomMessage {
        room_code: String,
        content: String,
        original_text: String,
        original_language: String,
        target_language: String,
        /// False when the recipient's language matched the source
        translated: bool,
        speaker_name: String,
        emotion: Option<String>,
        audio_url: Option<String>,
        timestamp: String,
    },

    /// Synthesized audio reference, sent separately for immediate playback
    #[serde(rename = "tts_audio")]
    TtsAudio {
        audio_url: String,
        text: String,
        language: String,
    },

    /// Acknowledges stream creation
    #[serde(rename = "stream_started")]
    StreamStarted { session_id: String },

    /// Capacity eviction introduced a permanent sequence gap
    #[serde(rename = "stream_gap")]
    StreamGap {
        session_id: String,
        lost_from: u64,
        lost_to: u64,
    },

    /// Transcript of a released chunk, sent to the session owner
    #[serde(rename = "transcript")]
    Transcript {
        session_id: String,
        text: String,
        language: String,
        sequence: u64,
    },

    /// Solo-session translation result for the session owner
    #[serde(rename = "translation")]
    Translation {
        session_id: String,
        text: String,
        target_lang: String,
        audio_url: Option<String>,
    },

    /// Streaming session lifecycle updates
    #[serde(rename = "session_status")]
    SessionStatus {
        session_id: String,
        status: String,
        message: Option<String>,
    },

    /// Error notice; `code` is machine-readable
    #[serde(rename = "error")]
    Error { code: String, message: String },

    /// Heartbeat reply
    #[serde(rename = "pong")]
    Pong { timestamp: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_message_round_trips() {
        let json = r#"{"type":"audio_chunk","session_id":"s1","sequence":7,"data":"AAA=","timestamp":1234}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            ClientMessage::AudioChunk {
                session_id,
                sequence,
                timestamp,
                ..
            } => {
                assert_eq!(session_id, "s1");
                assert_eq!(sequence, 7);
                assert_eq!(timestamp, Some(1234));
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn server_error_carries_code_and_message() {
        let msg = ServerMessage::Error {
            code: "translation_failed".to_string(),
            message: "upstream engine unavailable".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"error""#));
        assert!(json.contains("translation_failed"));
    }

    #[test]
    fn join_room_accepts_missing_optionals() {
        let json = r#"{"type":"join_room"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        assert!(matches!(
            msg,
            ClientMessage::JoinRoom {
                room_code: None,
                user_name: None,
                ..
            }
        ));
    }
}
