//! Persists each turn of model audio as a WAV file.

use async_trait::async_trait;
use bytes::Bytes;
use hound::{SampleFormat, WavSpec, WavWriter};
use relay_core::{
    AudioSink, AudioSinkError,
    audio::{OUTPUT_BITS_PER_SAMPLE, OUTPUT_CHANNELS, OUTPUT_SAMPLE_RATE},
};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Writes `turn_audio_<session>_<timestamp>.wav` files into one directory.
pub struct WavAudioSink {
    dir: PathBuf,
}

impl WavAudioSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn file_path(&self, session_id: &str) -> PathBuf {
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S_%6f");
        self.dir
            .join(format!("turn_audio_{session_id}_{timestamp}.wav"))
    }
}

fn write_wav(path: &Path, pcm: &[u8]) -> Result<(), AudioSinkError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let spec = WavSpec {
        channels: OUTPUT_CHANNELS,
        sample_rate: OUTPUT_SAMPLE_RATE,
        bits_per_sample: OUTPUT_BITS_PER_SAMPLE,
        sample_format: SampleFormat::Int,
    };
    let encode = |e: hound::Error| AudioSinkError::Encode(e.to_string());
    let mut writer = WavWriter::create(path, spec).map_err(encode)?;
    for sample in pcm.chunks_exact(2) {
        writer
            .write_sample(i16::from_le_bytes([sample[0], sample[1]]))
            .map_err(encode)?;
    }
    writer.finalize().map_err(encode)
}

#[async_trait]
impl AudioSink for WavAudioSink {
    async fn flush(&self, session_id: &str, chunks: &[Bytes]) -> Result<(), AudioSinkError> {
        if chunks.is_empty() {
            debug!("No audio this turn. Nothing to persist.");
            return Ok(());
        }
        let pcm: Vec<u8> = chunks.iter().flat_map(|chunk| chunk.iter().copied()).collect();
        let path = self.file_path(session_id);
        let bytes = pcm.len();

        let target = path.clone();
        tokio::task::spawn_blocking(move || write_wav(&target, &pcm))
            .await
            .map_err(|e| AudioSinkError::Encode(format!("writer task failed: {e}")))??;

        info!(path = %path.display(), bytes, "Saved turn audio.");
        Ok(())
    }
}
