//! # Audio Pipeline
//!
//! Chunked audio streaming: sequence reordering with voice-activity gating,
//! format validation, and session lifecycle management.
//!
//! ## Audio Format Requirements:
//! - **Sample Rate**: 16kHz (16,000 Hz)
//! - **Bit Depth**: 16-bit PCM
//! - **Channels**: Mono (1 channel)
//! - **Encoding**: Little-endian signed integers

pub mod buffer;
pub mod processor;
pub mod session;
