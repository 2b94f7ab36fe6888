use crate::chunk_store::{ChunkStoreError, ChunkStoreManager};
use crate::codec::{
    chunk_sample_count, ChunkEncoder, CodecError, DecodedAudio, CHUNK_SECONDS,
    DEFAULT_BITRATE_KBPS,
};
use std::ops::Range;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ChunkingError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("Store error: {0}")]
    Store(#[from] ChunkStoreError),
    #[error("Source audio is empty")]
    EmptySource,
    #[error("Chunk duration must be greater than zero")]
    InvalidChunkDuration,
    #[error("Encode task failed: {0}")]
    Task(String),
}

/// Configuration for splitting a recording into chunk files
#[derive(Debug, Clone)]
pub struct ChunkingConfig {
    /// Length of each chunk window in seconds (default: 60)
    pub chunk_seconds: u32,
    /// Constant MP3 bitrate for chunk files (default: 128 kbps)
    pub bitrate_kbps: u32,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        ChunkingConfig {
            chunk_seconds: CHUNK_SECONDS,
            bitrate_kbps: DEFAULT_BITRATE_KBPS,
        }
    }
}

/// Summary of a finished splitting pass
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkingResult {
    pub total_chunks: usize,
    pub sample_rate: u32,
    pub channel_count: usize,
    pub total_frames: usize,
}

/// Frame windows `[i*D, (i+1)*D)` covering `total_frames`, last one truncated
pub fn chunk_windows(total_frames: usize, chunk_frames: usize) -> Vec<Range<usize>> {
    if chunk_frames == 0 {
        return Vec::new();
    }
    (0..total_frames.div_ceil(chunk_frames))
        .map(|i| {
            let start = i * chunk_frames;
            start..(start + chunk_frames).min(total_frames)
        })
        .collect()
}

/// Splits decoded recordings into fixed-duration MP3 chunks and persists them
#[derive(Debug, Clone)]
pub struct ChunkingService {
    config: ChunkingConfig,
    store: ChunkStoreManager,
    encoder: ChunkEncoder,
}

impl ChunkingService {
    /// Create a chunking service with the default configuration
    pub fn new(store: ChunkStoreManager) -> Self {
        Self::with_config(ChunkingConfig::default(), store)
    }

    pub fn with_config(config: ChunkingConfig, store: ChunkStoreManager) -> Self {
        let encoder = ChunkEncoder::new(config.bitrate_kbps);
        ChunkingService {
            config,
            store,
            encoder,
        }
    }

    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    /// Encode and store every chunk of `source` under `scope`.
    ///
    /// Chunks are written one at a time in index order and `on_progress(completed, total)`
    /// is called after each write. The first failure aborts the pass; chunks written
    /// before it stay in the store.
    pub async fn split<F>(
        &self,
        scope: &str,
        source: Arc<DecodedAudio>,
        on_progress: F,
    ) -> Result<ChunkingResult, ChunkingError>
    where
        F: Fn(usize, usize) + Send + Sync,
    {
        if self.config.chunk_seconds == 0 {
            return Err(ChunkingError::InvalidChunkDuration);
        }
        if source.channel_count() == 0 || source.frames() == 0 {
            return Err(ChunkingError::EmptySource);
        }

        let chunk_frames = chunk_sample_count(source.sample_rate, self.config.chunk_seconds);
        let windows = chunk_windows(source.frames(), chunk_frames);
        let total = windows.len();

        info!(
            "ChunkingService: splitting {} frames ({:.1}s) into {} chunks of {}s for {}",
            source.frames(),
            source.duration_secs(),
            total,
            self.config.chunk_seconds,
            scope
        );

        for (index, window) in windows.into_iter().enumerate() {
            let encoder = self.encoder;
            let chunk_source = source.clone();
            let frames = window.len();

            // Encoding is CPU-bound, keep it off the async workers
            let data = tokio::task::spawn_blocking(move || encoder.encode(&chunk_source, window))
                .await
                .map_err(|e| ChunkingError::Task(e.to_string()))??;

            self.store.write_chunk(scope, index as u32, &data).await?;

            debug!(
                "ChunkingService: chunk {} written ({} frames, {} bytes)",
                index,
                frames,
                data.len()
            );
            on_progress(index + 1, total);
        }

        info!("ChunkingService: completed {} chunks for {}", total, scope);

        Ok(ChunkingResult {
            total_chunks: total,
            sample_rate: source.sample_rate,
            channel_count: source.channel_count(),
            total_frames: source.frames(),
        })
    }
}
