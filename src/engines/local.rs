//! # Local-Mode Engines
//!
//! Loopback implementations of the collaborator traits so the server runs
//! with no network access or API keys. Useful for development and for
//! exercising the relay end to end: transcripts and translations are
//! deterministic placeholders, and synthesis renders a short sine tone as a
//! base64 `data:` URL that a client can actually play.

use crate::engines::{MessageStore, SpeechSynthesizer, SpeechToText, Transcription, Translator};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::Engine as _;
use tracing::debug;

/// Placeholder speech-to-text engine.
///
/// Produces a deterministic transcript describing the audio it received.
/// Errors on empty input, matching the transcription failure contract.
pub struct LocalSpeechToText;

#[async_trait]
impl SpeechToText for LocalSpeechToText {
    async fn transcribe(&self, audio: &[u8], hint_language: &str) -> Result<Transcription> {
        if audio.is_empty() {
            return Err(anyhow!("cannot transcribe empty audio"));
        }

        let detected = if hint_language.is_empty() || hint_language == "auto" {
            "en".to_string()
        } else {
            hint_language.to_string()
        };

        Ok(Transcription {
            text: format!("[local asr] {} bytes of {} audio", audio.len(), detected),
            detected_language: detected,
        })
    }
}

/// Placeholder translator that tags text with the target language.
pub struct LocalTranslator;

#[async_trait]
impl Translator for LocalTranslator {
    async fn translate(&self, text: &str, _source_lang: &str, target_lang: &str) -> Result<String> {
        Ok(format!("[{}] {}", target_lang.to_uppercase(), text))
    }
}

/// Sine-tone synthesizer.
///
/// Generates 16-bit mono PCM at the configured sample rate, roughly 0.1 s
/// per character of input (capped), and returns it inline as a base64
/// `data:` URL so no file storage is needed.
pub struct LocalSynthesizer {
    sample_rate: u32,
}

impl LocalSynthesizer {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }

    fn render_tone(&self, duration_secs: f64) -> Vec<u8> {
        const FREQUENCY: f64 = 440.0;
        const AMPLITUDE: f64 = 0.1;

        let samples = (duration_secs * self.sample_rate as f64) as usize;
        let mut pcm = Vec::with_capacity(samples * 2);
        for n in 0..samples {
            let t = n as f64 / self.sample_rate as f64;
            let value = (2.0 * std::f64::consts::PI * FREQUENCY * t).sin() * AMPLITUDE;
            let sample = (value * 32767.0) as i16;
            pcm.extend_from_slice(&sample.to_le_bytes());
        }
        pcm
    }
}

#[async_trait]
impl SpeechSynthesizer for LocalSynthesizer {
    async fn synthesize(
        &self,
        text: &str,
        language: &str,
        _voice_style: Option<&str>,
    ) -> Result<String> {
        // ~0.1s per character, bounded so long messages stay cheap
        let duration = (text.len() as f64 * 0.1).clamp(1.0, 5.0);
        let pcm = self.render_tone(duration);

        debug!(
            language,
            chars = text.len(),
            bytes = pcm.len(),
            "local synthesis rendered tone"
        );

        let encoded = base64::engine::general_purpose::STANDARD.encode(&pcm);
        Ok(format!("data:audio/pcm;base64,{}", encoded))
    }
}

/// Persistence collaborator that only logs.
pub struct LogOnlyStore;

#[async_trait]
impl MessageStore for LogOnlyStore {
    async fn persist_message(
        &self,
        session_id: &str,
        speaker_id: &str,
        content: &str,
        _metadata: serde_json::Value,
    ) -> Result<()> {
        debug!(
            session_id,
            speaker_id,
            chars = content.len(),
            "message persisted (local mode: log only)"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transcribe_rejects_empty_audio() {
        let stt = LocalSpeechToText;
        assert!(stt.transcribe(&[], "en").await.is_err());
    }

    #[tokio::test]
    async fn transcribe_resolves_auto_language() {
        let stt = LocalSpeechToText;
        let result = stt.transcribe(&[0u8; 64], "auto").await.unwrap();
        assert_eq!(result.detected_language, "en");
        assert!(!result.text.is_empty());
    }

    #[tokio::test]
    async fn translator_tags_target_language() {
        let translator = LocalTranslator;
        let out = translator.translate("hello", "en", "es").await.unwrap();
        assert_eq!(out, "[ES] hello");
    }

    #[tokio::test]
    async fn synthesizer_returns_data_url() {
        let tts = LocalSynthesizer::new(16000);
        let url = tts.synthesize("hi there", "en", None).await.unwrap();
        assert!(url.starts_with("data:audio/pcm;base64,"));
    }
}
