//! # Collaborator Engines
//!
//! Narrow interfaces for the external engines the relay depends on:
//! speech-to-text, translation, speech synthesis, and message persistence.
//! The relay core treats all four as black boxes that eventually resolve to
//! success or failure; it never imposes timeouts or retries of its own.
//!
//! ## Failure contract:
//! - **transcribe**: errors when audio is empty/unintelligible. An `Ok` result
//!   with empty text means "no speech" and is dropped silently upstream.
//! - **translate / synthesize**: errors are isolated to the affected
//!   recipient by the fan-out router; they never abort a broadcast.
//! - **persist_message**: fire-and-forget; delivery never waits on it.

pub mod local;

use anyhow::Result;
use async_trait::async_trait;

/// Result of a speech-to-text invocation.
#[derive(Debug, Clone)]
pub struct Transcription {
    /// Transcribed text; empty means no speech was detected
    pub text: String,

    /// Language the engine detected (falls back to the hint)
    pub detected_language: String,
}

/// Speech-to-text collaborator.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Transcribe raw PCM audio, using `hint_language` as a decoding hint.
    async fn transcribe(&self, audio: &[u8], hint_language: &str) -> Result<Transcription>;
}

/// Text translation collaborator.
#[async_trait]
pub trait Translator: Send + Sync {
    /// Translate `text` from `source_lang` to `target_lang`.
    async fn translate(&self, text: &str, source_lang: &str, target_lang: &str) -> Result<String>;
}

/// Text-to-speech collaborator.
///
/// Returns an opaque audio reference (typically a URL) rather than raw
/// samples; the relay forwards the reference without interpreting it.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(
        &self,
        text: &str,
        language: &str,
        voice_style: Option<&str>,
    ) -> Result<String>;
}

/// Conversation persistence collaborator (fire-and-forget).
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn persist_message(
        &self,
        session_id: &str,
        speaker_id: &str,
        content: &str,
        metadata: serde_json::Value,
    ) -> Result<()>;
}
