//! Chunk codec: the fixed constants that define chunk boundaries, the in-memory
//! decoded audio type, and the MP3 encode/decode pair used for chunk files.

mod decoder;
mod encoder;

pub use decoder::{decode_source_file, ChunkDecoder, SymphoniaChunkDecoder};
pub use encoder::ChunkEncoder;

use thiserror::Error;

/// Duration of every chunk window in seconds (the last chunk may be shorter)
pub const CHUNK_SECONDS: u32 = 60;

/// Samples of encoder/decoder delay at the start of every independently decoded chunk.
///
/// This is LAME's encoder delay (576) plus the MP3 synthesis filterbank delay (529) with
/// gapless trimming disabled on the decode side. Neither depends on the CBR bitrate; it
/// has to be re-measured if the encoder or decoder changes.
pub const ENCODER_PRIMING_SAMPLES: usize = 1105;

/// Number of frames fed to the encoder per call
pub const ENCODE_BLOCK_SAMPLES: usize = 1152;

/// Default constant bitrate for chunk files
pub const DEFAULT_BITRATE_KBPS: u32 = 128;

/// File extension of encoded chunk files
pub const CHUNK_EXTENSION: &str = "mp3";

/// Maximum channels carried into a chunk file
pub const MAX_CHUNK_CHANNELS: usize = 2;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Symphonia error: {0}")]
    Symphonia(#[from] symphonia::core::errors::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("No audio tracks found")]
    NoAudioTracks,
    #[error("No sample rate found")]
    MissingSampleRate,
    #[error("Unsupported sample rate: {0} Hz")]
    UnsupportedSampleRate(u32),
    #[error("Audio has no channels")]
    NoChannels,
    #[error("Encoder error: {0}")]
    Encoder(String),
}

/// Deterministic chunk file name for a chunk index
pub fn chunk_file_name(index: u32) -> String {
    format!("audio_segment_{}.{}", index, CHUNK_EXTENSION)
}

/// Number of samples per channel in a full chunk
pub fn chunk_sample_count(sample_rate: u32, chunk_seconds: u32) -> usize {
    sample_rate as usize * chunk_seconds as usize
}

/// Convert a float sample to 16-bit PCM.
///
/// Negative values scale by 32768 and non-negative values by 32767 so that -1.0 maps to
/// `i16::MIN` and 1.0 maps to `i16::MAX`.
pub fn quantize_sample(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

/// Planar decoded audio held in memory
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub sample_rate: u32,
    /// One sample vector per channel, all of equal length
    pub channels: Vec<Vec<f32>>,
}

impl DecodedAudio {
    pub fn new(sample_rate: u32, channels: Vec<Vec<f32>>) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// Zero-filled buffer of the given shape
    pub fn silent(sample_rate: u32, channel_count: usize, frames: usize) -> Self {
        Self {
            sample_rate,
            channels: vec![vec![0.0; frames]; channel_count],
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Samples per channel
    pub fn frames(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    pub fn channel(&self, index: usize) -> &[f32] {
        &self.channels[index]
    }
}
