//! Per-turn audio accumulation and the persisted-audio collaborator.

use async_trait::async_trait;
use bytes::Bytes;

/// Sample rate of model audio, and of every persisted turn artifact.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;
/// Persisted audio is mono.
pub const OUTPUT_CHANNELS: u16 = 1;
/// Persisted audio is 16-bit PCM.
pub const OUTPUT_BITS_PER_SAMPLE: u16 = 16;

#[derive(Debug, thiserror::Error)]
pub enum AudioSinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to encode audio: {0}")]
    Encode(String),
}

/// Raw audio chunks received during the current turn, in arrival order.
#[derive(Debug, Default, Clone)]
pub struct AudioTurnBuffer {
    chunks: Vec<Bytes>,
}

impl AudioTurnBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: Bytes) {
        self.chunks.push(chunk);
    }

    pub fn chunks(&self) -> &[Bytes] {
        &self.chunks
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Total number of audio bytes buffered.
    pub fn byte_len(&self) -> usize {
        self.chunks.iter().map(Bytes::len).sum()
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
    }
}

/// Persists one turn of model audio as a single contiguous artifact.
///
/// Implementations write mono, 16-bit, 24 kHz audio. Flushing no chunks is a
/// valid no-op and must not fail.
#[async_trait]
pub trait AudioSink: Send + Sync {
    async fn flush(&self, session_id: &str, chunks: &[Bytes]) -> Result<(), AudioSinkError>;
}
