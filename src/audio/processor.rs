//! # Audio Validation
//!
//! Format checks applied to incoming chunks before they enter a session's
//! reorder buffer. Catches malformed payloads and clients whose declared
//! format disagrees with the server configuration.

use byteorder::{LittleEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// Audio format a client declares when opening a stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u8,
    pub bit_depth: u8,
}

impl AudioFormat {
    pub fn new(sample_rate: u32, channels: u8, bit_depth: u8) -> Self {
        Self {
            sample_rate,
            channels,
            bit_depth,
        }
    }
}

/// Validates raw PCM payloads against the configured format.
pub struct AudioValidator {
    expected: AudioFormat,
}

impl AudioValidator {
    pub fn new(expected: AudioFormat) -> Self {
        Self { expected }
    }

    /// Check a chunk payload and optional declared format.
    ///
    /// ## Checks:
    /// 1. Payload is non-empty and even-length (16-bit samples)
    /// 2. Declared format (if any) matches the server's expectations
    /// 3. Payload parses as 16-bit little-endian PCM
    pub fn validate_chunk(
        &self,
        payload: &[u8],
        declared: Option<&AudioFormat>,
    ) -> Result<(), String> {
        if payload.is_empty() {
            return Err("audio payload is empty".to_string());
        }
        if payload.len() % 2 != 0 {
            return Err("audio payload length must be even for 16-bit samples".to_string());
        }

        if let Some(declared) = declared {
            if declared.sample_rate != self.expected.sample_rate {
                return Err(format!(
                    "sample rate mismatch: expected {}, got {}",
                    self.expected.sample_rate, declared.sample_rate
                ));
            }
            if declared.channels != self.expected.channels {
                return Err(format!(
                    "channel count mismatch: expected {}, got {}",
                    self.expected.channels, declared.channels
                ));
            }
            if declared.bit_depth != self.expected.bit_depth {
                return Err(format!(
                    "bit depth mismatch: expected {}, got {}",
                    self.expected.bit_depth, declared.bit_depth
                ));
            }
        }

        let mut cursor = Cursor::new(payload);
        if cursor.read_i16::<LittleEndian>().is_err() {
            return Err("no valid PCM samples found".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> AudioValidator {
        AudioValidator::new(AudioFormat::new(16000, 1, 16))
    }

    #[test]
    fn accepts_valid_pcm() {
        let mut payload = Vec::new();
        for i in 0..8i16 {
            payload.extend_from_slice(&(i * 1000).to_le_bytes());
        }
        assert!(validator().validate_chunk(&payload, None).is_ok());
    }

    #[test]
    fn rejects_odd_length_and_empty_payloads() {
        assert!(validator().validate_chunk(&[0u8; 15], None).is_err());
        assert!(validator().validate_chunk(&[], None).is_err());
    }

    #[test]
    fn rejects_mismatched_declared_format() {
        let payload = vec![0u8; 16];
        let declared = AudioFormat::new(44100, 2, 16);
        assert!(validator().validate_chunk(&payload, Some(&declared)).is_err());
    }
}
