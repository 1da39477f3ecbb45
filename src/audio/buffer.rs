//! # Audio Reorder Buffer
//!
//! Per-session sequence reordering for audio chunks arriving over the
//! network. Chunks carry client-assigned sequence numbers and may arrive out
//! of order; the buffer holds them until a contiguous run from the next
//! expected sequence exists, then releases that run in order.
//!
//! ## Key Features:
//! - **Contiguous-prefix release**: never emits chunks out of order
//! - **Last-write-wins duplicates**: retransmits overwrite, never re-release
//! - **Bounded memory**: over capacity, the oldest sequences are evicted and
//!   the resulting gap is surfaced to the caller instead of stalling
//! - **Voice-activity gating**: silent chunks are suppressed on release but
//!   still advance the cursor

use byteorder::{LittleEndian, ReadBytesExt};
use std::collections::BTreeMap;
use std::io::Cursor;
use tracing::{debug, warn};

/// One sequenced audio chunk as received from a client.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Raw PCM payload (16-bit little-endian expected)
    pub payload: Vec<u8>,
    pub sequence: u64,
    /// Capture timestamp, milliseconds since epoch
    pub timestamp_ms: u64,
    pub sample_rate: u32,
    pub channels: u8,
}

/// Tuning knobs for the reorder buffer.
#[derive(Debug, Clone)]
pub struct ReorderBufferConfig {
    /// Maximum chunks held while waiting for a missing sequence
    pub capacity: usize,

    /// Normalized mean-amplitude threshold below which a chunk is silence
    pub vad_threshold: f64,
}

impl Default for ReorderBufferConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            vad_threshold: 0.01,
        }
    }
}

/// A run of sequences permanently lost to capacity eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceGap {
    pub from: u64,
    pub to: u64,
}

/// Counters for observability; cheap to copy into metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct BufferStats {
    pub received: u64,
    pub released: u64,
    pub suppressed: u64,
    pub duplicates: u64,
    pub evicted: u64,
}

/// Reorders sequenced chunks and gates them on voice activity.
///
/// Not internally synchronized; the owning session wraps it in a mutex and
/// holds that lock across its whole processing pipeline.
pub struct AudioReorderBuffer {
    /// Pending chunks keyed by sequence; BTreeMap gives ordered eviction
    chunks: BTreeMap<u64, AudioChunk>,
    /// Next sequence eligible for release
    next_sequence: u64,
    config: ReorderBufferConfig,
    stats: BufferStats,
}

impl AudioReorderBuffer {
    pub fn new(config: ReorderBufferConfig) -> Self {
        Self {
            chunks: BTreeMap::new(),
            next_sequence: 0,
            config,
            stats: BufferStats::default(),
        }
    }

    /// Accept one chunk into the buffer.
    ///
    /// Chunks whose sequence is already behind the release cursor are
    /// dropped (stale retransmits). If accepting pushes the buffer over
    /// capacity, the oldest sequences are evicted and the release cursor
    /// jumps past them; the returned `SequenceGap` covers everything between
    /// the old cursor and the last evicted sequence, all permanently lost.
    pub fn accept(&mut self, chunk: AudioChunk) -> Option<SequenceGap> {
        self.stats.received += 1;

        if chunk.sequence < self.next_sequence {
            self.stats.duplicates += 1;
            debug!(sequence = chunk.sequence, "dropping stale chunk behind cursor");
            return None;
        }

        if self.chunks.insert(chunk.sequence, chunk).is_some() {
            self.stats.duplicates += 1;
        }

        if self.chunks.len() <= self.config.capacity {
            return None;
        }

        // Over capacity: evict oldest sequences until back at the limit
        let gap_from = self.next_sequence;
        let mut last_evicted = self.next_sequence;
        while self.chunks.len() > self.config.capacity {
            if let Some((sequence, _)) = self.chunks.pop_first() {
                last_evicted = sequence;
                self.stats.evicted += 1;
            }
        }
        self.next_sequence = last_evicted + 1;

        warn!(
            lost_from = gap_from,
            lost_to = last_evicted,
            "reorder buffer over capacity, audio permanently lost"
        );
        Some(SequenceGap {
            from: gap_from,
            to: last_evicted,
        })
    }

    /// Release the longest contiguous run starting at the expected sequence.
    ///
    /// Chunks failing the voice-activity gate are consumed (the cursor
    /// advances) but not returned. An empty result while chunks are pending
    /// just means the next expected sequence has not arrived.
    pub fn drain(&mut self) -> Vec<AudioChunk> {
        let mut released = Vec::new();
        while let Some(chunk) = self.chunks.remove(&self.next_sequence) {
            self.next_sequence += 1;
            if self.is_voice_active(&chunk.payload) {
                self.stats.released += 1;
                released.push(chunk);
            } else {
                self.stats.suppressed += 1;
            }
        }
        released
    }

    /// Mean absolute sample amplitude, normalized to [0, 1], against the
    /// threshold. Payloads that do not parse as 16-bit PCM pass the gate.
    fn is_voice_active(&self, payload: &[u8]) -> bool {
        if payload.is_empty() || payload.len() % 2 != 0 {
            return true;
        }

        let mut cursor = Cursor::new(payload);
        let mut total: u64 = 0;
        let mut count: u64 = 0;
        while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
            total += sample.unsigned_abs() as u64;
            count += 1;
        }
        if count == 0 {
            return true;
        }

        let energy = (total as f64 / count as f64) / 32768.0;
        energy > self.config.vad_threshold
    }

    pub fn pending(&self) -> usize {
        self.chunks.len()
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub fn stats(&self) -> BufferStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loud_chunk(sequence: u64) -> AudioChunk {
        // Constant amplitude 8000 — comfortably above the gate
        let sample: i16 = 8000;
        let payload: Vec<u8> = (0..160).flat_map(|_| sample.to_le_bytes()).collect();
        AudioChunk {
            payload,
            sequence,
            timestamp_ms: sequence * 20,
            sample_rate: 16000,
            channels: 1,
        }
    }

    fn silent_chunk(sequence: u64) -> AudioChunk {
        AudioChunk {
            payload: vec![0u8; 320],
            sequence,
            timestamp_ms: sequence * 20,
            sample_rate: 16000,
            channels: 1,
        }
    }

    #[test]
    fn out_of_order_arrival_releases_in_order() {
        let mut buffer = AudioReorderBuffer::new(ReorderBufferConfig::default());

        buffer.accept(loud_chunk(0));
        let released: Vec<u64> = buffer.drain().iter().map(|c| c.sequence).collect();
        assert_eq!(released, vec![0]);

        // sequence 2 arrives before 1: nothing releasable yet
        buffer.accept(loud_chunk(2));
        assert!(buffer.drain().is_empty());
        assert_eq!(buffer.pending(), 1);

        // the missing chunk arrives: both come out, in order
        buffer.accept(loud_chunk(1));
        let released: Vec<u64> = buffer.drain().iter().map(|c| c.sequence).collect();
        assert_eq!(released, vec![1, 2]);
    }

    #[test]
    fn duplicates_overwrite_and_never_release_twice() {
        let mut buffer = AudioReorderBuffer::new(ReorderBufferConfig::default());

        let mut replacement = loud_chunk(0);
        replacement.timestamp_ms = 999;
        buffer.accept(loud_chunk(0));
        buffer.accept(replacement);

        let released = buffer.drain();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].timestamp_ms, 999, "last write should win");

        // retransmit of an already-released sequence is dropped
        buffer.accept(loud_chunk(0));
        assert!(buffer.drain().is_empty());
        assert_eq!(buffer.stats().duplicates, 2);
    }

    #[test]
    fn silent_chunks_advance_the_cursor_without_releasing() {
        let mut buffer = AudioReorderBuffer::new(ReorderBufferConfig::default());
        buffer.accept(loud_chunk(0));
        buffer.accept(silent_chunk(1));
        buffer.accept(silent_chunk(2));
        buffer.accept(loud_chunk(3));

        let released: Vec<u64> = buffer.drain().iter().map(|c| c.sequence).collect();
        assert_eq!(released, vec![0, 3]);
        assert_eq!(buffer.next_sequence(), 4);
        assert_eq!(buffer.stats().suppressed, 2);
    }

    #[test]
    fn unparsable_payload_passes_the_gate() {
        let mut buffer = AudioReorderBuffer::new(ReorderBufferConfig::default());
        let mut odd = loud_chunk(0);
        odd.payload = vec![1, 2, 3]; // odd length, not valid 16-bit PCM
        buffer.accept(odd);
        assert_eq!(buffer.drain().len(), 1);
    }

    #[test]
    fn capacity_eviction_reports_the_gap_and_advances() {
        let mut buffer = AudioReorderBuffer::new(ReorderBufferConfig {
            capacity: 3,
            ..ReorderBufferConfig::default()
        });

        // sequence 0 never arrives; 1..=3 fill the buffer
        for sequence in 1..=3 {
            assert!(buffer.accept(loud_chunk(sequence)).is_none());
        }

        // the fourth pending chunk forces eviction of the oldest (1)
        let gap = buffer.accept(loud_chunk(4)).unwrap();
        assert_eq!(gap, SequenceGap { from: 0, to: 1 });
        assert_eq!(buffer.next_sequence(), 2);

        // the stream resumes from past the gap rather than stalling
        let released: Vec<u64> = buffer.drain().iter().map(|c| c.sequence).collect();
        assert_eq!(released, vec![2, 3, 4]);
    }

    #[test]
    fn release_order_is_never_violated() {
        let mut buffer = AudioReorderBuffer::new(ReorderBufferConfig::default());
        let arrival = [5u64, 0, 3, 1, 4, 2, 7, 6];
        let mut seen = Vec::new();
        for sequence in arrival {
            buffer.accept(loud_chunk(sequence));
            seen.extend(buffer.drain().iter().map(|c| c.sequence));
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5, 6, 7]);
    }
}
