use crate::chunk_store::{ChunkStoreError, ChunkStoreManager};
use crate::codec::{
    chunk_sample_count, ChunkDecoder, DecodedAudio, CHUNK_SECONDS, ENCODER_PRIMING_SAMPLES,
};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BufferError {
    #[error("Buffer not initialized")]
    NotInitialized,
    #[error("Chunk {index} not found")]
    MissingChunk { index: u32 },
    #[error("Failed to decode chunk {index}: {message}")]
    Decode { index: u32, message: String },
    #[error("Store error: {0}")]
    Store(String),
    #[error("Decode task failed: {0}")]
    Task(String),
    #[error("Invalid range: start {start_sec}s, duration {duration_sec}s")]
    InvalidRange { start_sec: f64, duration_sec: f64 },
    #[error("Chunk {index} decoded to {frames} frames, {needed} needed")]
    ShortChunk {
        index: u32,
        frames: usize,
        needed: usize,
    },
    #[error("Buffer was re-initialized")]
    Stale,
}

type ChunkFuture = Shared<BoxFuture<'static, Result<Arc<DecodedAudio>, BufferError>>>;

/// A cache slot is either a decode in flight, shared by every caller that wants the chunk,
/// or the finished decode.
enum CacheSlot {
    Pending(ChunkFuture),
    Resolved(Arc<DecodedAudio>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channel_count: usize,
}

#[derive(Default)]
struct BufferState {
    /// Bumped by every initialize; work started under an older generation must not
    /// touch the cache
    generation: u64,
    project: Option<String>,
    format: Option<AudioFormat>,
    slots: HashMap<u32, CacheSlot>,
    prefetch: Option<JoinHandle<()>>,
}

/// Lazy cache of decoded chunks for one project
///
/// Chunk 0 is decoded on initialize to learn the recording's format. Other chunks are
/// decoded the first time a range touches them and kept until the next initialize.
/// After every range request the chunk following the range is prefetched in the background.
#[derive(Clone)]
pub struct ChunkBuffer {
    store: ChunkStoreManager,
    decoder: Arc<dyn ChunkDecoder>,
    chunk_seconds: u32,
    state: Arc<Mutex<BufferState>>,
}

impl ChunkBuffer {
    pub fn new(store: ChunkStoreManager, decoder: Arc<dyn ChunkDecoder>) -> Self {
        Self::with_chunk_seconds(store, decoder, CHUNK_SECONDS)
    }

    pub fn with_chunk_seconds(
        store: ChunkStoreManager,
        decoder: Arc<dyn ChunkDecoder>,
        chunk_seconds: u32,
    ) -> Self {
        Self {
            store,
            decoder,
            chunk_seconds,
            state: Arc::new(Mutex::new(BufferState::default())),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load chunk 0 of `project` and reset the cache.
    ///
    /// Returns false if chunk 0 is missing or cannot be decoded.
    pub async fn initialize(&self, project: &str) -> bool {
        let generation = {
            let mut state = self.lock_state();
            state.generation += 1;
            state.slots.clear();
            state.project = Some(project.to_string());
            state.format = None;
            state.generation
        };

        info!("ChunkBuffer: initializing {}", project);

        let first = match self.chunk(project, 0, generation).await {
            Ok(first) => first,
            Err(e) => {
                warn!("ChunkBuffer: failed to load first chunk of {}: {}", project, e);
                self.reset_if_current(generation);
                return false;
            }
        };

        if first.channel_count() == 0 || first.sample_rate == 0 {
            warn!("ChunkBuffer: first chunk of {} has no audio", project);
            self.reset_if_current(generation);
            return false;
        }

        let mut state = self.lock_state();
        if state.generation != generation {
            return false;
        }
        let format = AudioFormat {
            sample_rate: first.sample_rate,
            channel_count: first.channel_count(),
        };
        state.format = Some(format);

        info!(
            "ChunkBuffer: {} ready ({} Hz, {} channels)",
            project, format.sample_rate, format.channel_count
        );
        true
    }

    fn reset_if_current(&self, generation: u64) {
        let mut state = self.lock_state();
        if state.generation == generation {
            state.project = None;
            state.format = None;
        }
    }

    pub fn is_ready(&self) -> bool {
        self.lock_state().format.is_some()
    }

    pub fn format(&self) -> Option<AudioFormat> {
        self.lock_state().format
    }

    pub fn project(&self) -> Option<String> {
        self.lock_state().project.clone()
    }

    pub fn chunk_seconds(&self) -> u32 {
        self.chunk_seconds
    }

    /// Whether a chunk has finished decoding into the cache
    pub fn is_cached(&self, index: u32) -> bool {
        matches!(
            self.lock_state().slots.get(&index),
            Some(CacheSlot::Resolved(_))
        )
    }

    /// Wait for the most recently started prefetch task, if any
    pub async fn wait_for_prefetch(&self) {
        let handle = self.lock_state().prefetch.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                debug!("ChunkBuffer: prefetch task ended abnormally: {}", e);
            }
        }
    }

    /// Decoded samples for `[start_sec, start_sec + duration_sec)` of `project`.
    ///
    /// The result holds exactly `floor((start+duration)*sr) - floor(start*sr)` frames per
    /// channel. Samples past the end of the recording's last chunk stay zero; any other
    /// chunk that decodes too short for its window is an error.
    pub async fn get_range(
        &self,
        start_sec: f64,
        duration_sec: f64,
        project: &str,
    ) -> Result<DecodedAudio, BufferError> {
        let (generation, format) = {
            let state = self.lock_state();
            match (&state.project, state.format) {
                (Some(current), Some(format)) if current == project => (state.generation, format),
                _ => return Err(BufferError::NotInitialized),
            }
        };

        if !start_sec.is_finite() || !duration_sec.is_finite() || start_sec < 0.0 || duration_sec < 0.0
        {
            return Err(BufferError::InvalidRange {
                start_sec,
                duration_sec,
            });
        }

        let sample_rate = format.sample_rate as f64;
        let start_sample = (start_sec * sample_rate).floor() as usize;
        let end_sample = ((start_sec + duration_sec) * sample_rate).floor() as usize;
        let total = end_sample.saturating_sub(start_sample);
        let chunk_samples = chunk_sample_count(format.sample_rate, self.chunk_seconds);

        let mut output = DecodedAudio::silent(format.sample_rate, format.channel_count, total);
        if total == 0 || chunk_samples == 0 {
            return Ok(output);
        }

        let windows = read_windows(start_sample, end_sample, chunk_samples);
        debug!(
            "ChunkBuffer: range {}..{} of {} touches chunks {:?}",
            start_sample,
            end_sample,
            project,
            windows.iter().map(|(index, _)| *index).collect::<Vec<_>>()
        );

        let mut chunks = Vec::with_capacity(windows.len());
        for (position, (index, window)) in windows.iter().enumerate() {
            let chunk = self.chunk(project, *index, generation).await?;
            let needed = ENCODER_PRIMING_SAMPLES + window.end;
            // Only the recording's last chunk may end early
            if chunk.frames() < needed
                && (position + 1 < windows.len() || self.has_chunk(project, index + 1).await?)
            {
                warn!(
                    "ChunkBuffer: chunk {} of {} is short ({} of {} frames)",
                    index,
                    project,
                    chunk.frames(),
                    needed
                );
                return Err(BufferError::ShortChunk {
                    index: *index,
                    frames: chunk.frames(),
                    needed,
                });
            }
            chunks.push((chunk, window.clone()));
        }

        for (ch, out) in output.channels.iter_mut().enumerate() {
            let mut write_offset = 0;
            for (chunk, window) in &chunks {
                if let Some(data) = chunk.channels.get(ch) {
                    let read_start = (ENCODER_PRIMING_SAMPLES + window.start).min(data.len());
                    let read_end = (ENCODER_PRIMING_SAMPLES + window.end).min(data.len());
                    let available = &data[read_start..read_end];
                    out[write_offset..write_offset + available.len()].copy_from_slice(available);
                }
                write_offset += window.len();
            }
        }

        if let Some((last, _)) = windows.last() {
            self.spawn_prefetch(project, last + 1, generation);
        }

        Ok(output)
    }

    async fn has_chunk(&self, project: &str, index: u32) -> Result<bool, BufferError> {
        self.store
            .chunk_exists(project, index)
            .await
            .map_err(|e| BufferError::Store(e.to_string()))
    }

    /// Start decoding `index` in the background unless it is already cached or pending
    fn spawn_prefetch(&self, project: &str, index: u32, generation: u64) {
        let mut state = self.lock_state();
        if state.generation != generation || state.slots.contains_key(&index) {
            return;
        }

        let this = self.clone();
        let project = project.to_string();
        let handle = tokio::spawn(async move {
            match this.store.chunk_exists(&project, index).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!("ChunkBuffer: no chunk {} to prefetch", index);
                    return;
                }
                Err(e) => {
                    debug!("ChunkBuffer: prefetch existence check failed: {}", e);
                    return;
                }
            }
            match this.chunk(&project, index, generation).await {
                Ok(_) => debug!("ChunkBuffer: prefetched chunk {}", index),
                Err(e) => debug!("ChunkBuffer: prefetch of chunk {} failed: {}", index, e),
            }
        });
        state.prefetch = Some(handle);
    }

    /// Resolve a chunk through the cache, joining an in-flight decode if there is one
    async fn chunk(
        &self,
        project: &str,
        index: u32,
        generation: u64,
    ) -> Result<Arc<DecodedAudio>, BufferError> {
        let future = {
            let mut state = self.lock_state();
            if state.generation != generation {
                return Err(BufferError::Stale);
            }
            match state.slots.get(&index) {
                Some(CacheSlot::Resolved(audio)) => {
                    debug!("ChunkBuffer: cache hit for chunk {}", index);
                    return Ok(audio.clone());
                }
                Some(CacheSlot::Pending(future)) => {
                    debug!("ChunkBuffer: joining in-flight decode of chunk {}", index);
                    future.clone()
                }
                None => {
                    debug!("ChunkBuffer: cache miss for chunk {}", index);
                    let this = self.clone();
                    let project = project.to_string();
                    let future = async move { this.load_and_settle(&project, index, generation).await }
                        .boxed()
                        .shared();
                    state
                        .slots
                        .insert(index, CacheSlot::Pending(future.clone()));
                    future
                }
            }
        };

        future.await
    }

    /// Load a chunk, then replace its pending slot with the result
    async fn load_and_settle(
        &self,
        project: &str,
        index: u32,
        generation: u64,
    ) -> Result<Arc<DecodedAudio>, BufferError> {
        let result = self.load(project, index).await;

        let mut state = self.lock_state();
        if state.generation != generation {
            debug!("ChunkBuffer: discarding chunk {} from an earlier generation", index);
            return result;
        }
        match &result {
            Ok(audio) => {
                state.slots.insert(index, CacheSlot::Resolved(audio.clone()));
            }
            Err(_) => {
                // Failed decodes are not cached so a later request can retry
                state.slots.remove(&index);
            }
        }
        result
    }

    async fn load(&self, project: &str, index: u32) -> Result<Arc<DecodedAudio>, BufferError> {
        let bytes = self
            .store
            .read_chunk(project, index)
            .await
            .map_err(|e| match e {
                ChunkStoreError::NotFound { .. } => BufferError::MissingChunk { index },
                other => BufferError::Store(other.to_string()),
            })?;

        let decoder = self.decoder.clone();
        let decoded = tokio::task::spawn_blocking(move || decoder.decode(&bytes))
            .await
            .map_err(|e| BufferError::Task(e.to_string()))?
            .map_err(|e| BufferError::Decode {
                index,
                message: e.to_string(),
            })?;

        debug!(
            "ChunkBuffer: decoded chunk {} ({} frames)",
            index,
            decoded.frames()
        );
        Ok(Arc::new(decoded))
    }
}

/// Chunk-local sample windows touched by `[start_sample, end_sample)`, in chunk order.
///
/// Windows exclude the priming offset. A trailing chunk that would contribute nothing
/// (the range ends exactly on a chunk boundary) is left out.
fn read_windows(start_sample: usize, end_sample: usize, chunk_samples: usize) -> Vec<(u32, Range<usize>)> {
    let start_chunk = start_sample / chunk_samples;
    let end_chunk = end_sample / chunk_samples;

    (start_chunk..=end_chunk)
        .filter_map(|chunk| {
            let chunk_start = chunk * chunk_samples;
            let local_start = if chunk == start_chunk {
                start_sample - chunk_start
            } else {
                0
            };
            let local_end = if chunk == end_chunk {
                end_sample - chunk_start
            } else {
                chunk_samples
            };
            (local_end > local_start).then(|| (chunk as u32, local_start..local_end))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::chunk_file_name;
    use crate::test_support::{mock_sample, MockChunkDecoder, MockChunkStore};

    const SAMPLE_RATE: u32 = 1000;
    const CHUNK_SECS: u32 = 2;

    /// 5 s recording in 2 s chunks: two full chunks and a 1 s tail
    fn setup() -> (Arc<MockChunkStore>, Arc<MockChunkDecoder>, ChunkBuffer) {
        let store = Arc::new(MockChunkStore::new());
        store.insert_mock_recording("p", SAMPLE_RATE, CHUNK_SECS, 5000);
        let decoder = Arc::new(MockChunkDecoder::new(SAMPLE_RATE, 2));
        let buffer = ChunkBuffer::with_chunk_seconds(
            ChunkStoreManager::from_storage(store.clone()),
            decoder.clone(),
            CHUNK_SECS,
        );
        (store, decoder, buffer)
    }

    fn expected(channel: usize, range: Range<usize>) -> Vec<f32> {
        range.map(|i| mock_sample(channel, i)).collect()
    }

    #[test]
    fn windows_follow_chunk_edges() {
        assert_eq!(read_windows(500, 1500, 2000), vec![(0, 500..1500)]);
        assert_eq!(
            read_windows(1500, 4500, 2000),
            vec![(0, 1500..2000), (1, 0..2000), (2, 0..500)]
        );
        // Ending on a boundary does not touch the next chunk
        assert_eq!(read_windows(3000, 4000, 2000), vec![(1, 1000..2000)]);
    }

    #[tokio::test]
    async fn initialize_reports_missing_first_chunk() {
        let store = Arc::new(MockChunkStore::new());
        let buffer = ChunkBuffer::with_chunk_seconds(
            ChunkStoreManager::from_storage(store),
            Arc::new(MockChunkDecoder::new(SAMPLE_RATE, 1)),
            CHUNK_SECS,
        );

        assert!(!buffer.initialize("p").await);
        assert!(!buffer.is_ready());
    }

    #[tokio::test]
    async fn get_range_requires_initialize() {
        let (_store, _decoder, buffer) = setup();

        let err = buffer.get_range(0.0, 1.0, "p").await.unwrap_err();
        assert_eq!(err, BufferError::NotInitialized);

        assert!(buffer.initialize("p").await);
        let err = buffer.get_range(0.0, 1.0, "other").await.unwrap_err();
        assert_eq!(err, BufferError::NotInitialized);
    }

    #[tokio::test]
    async fn initialize_learns_format() {
        let (_store, _decoder, buffer) = setup();
        assert!(buffer.initialize("p").await);
        assert!(buffer.is_ready());
        assert_eq!(
            buffer.format(),
            Some(AudioFormat {
                sample_rate: SAMPLE_RATE,
                channel_count: 2
            })
        );
        assert!(buffer.is_cached(0));
    }

    #[tokio::test]
    async fn range_length_is_exact() {
        let (_store, _decoder, buffer) = setup();
        assert!(buffer.initialize("p").await);

        for (start, duration) in [(0.3333, 1.7777), (0.0, 0.0011), (1.9999, 0.0002), (0.1, 4.85)] {
            let audio = buffer.get_range(start, duration, "p").await.unwrap();
            let sr = SAMPLE_RATE as f64;
            let want = ((start + duration) * sr).floor() as usize - (start * sr).floor() as usize;
            assert_eq!(audio.frames(), want, "start {} duration {}", start, duration);
            assert_eq!(audio.channel_count(), 2);
        }
    }

    #[tokio::test]
    async fn range_skips_priming_and_crosses_chunks() {
        let (_store, _decoder, buffer) = setup();
        assert!(buffer.initialize("p").await);

        let audio = buffer.get_range(1.5, 3.0, "p").await.unwrap();
        assert_eq!(audio.channel(0), expected(0, 1500..4500).as_slice());
        assert_eq!(audio.channel(1), expected(1, 1500..4500).as_slice());
    }

    #[tokio::test]
    async fn stitched_ranges_match_one_request() {
        let (_store, _decoder, buffer) = setup();
        assert!(buffer.initialize("p").await);

        let whole = buffer.get_range(0.5, 3.0, "p").await.unwrap();
        let inside = buffer.get_range(0.5, 1.0, "p").await.unwrap();
        let spanning = buffer.get_range(1.5, 2.0, "p").await.unwrap();

        for ch in 0..2 {
            let mut joined = inside.channel(ch).to_vec();
            joined.extend_from_slice(spanning.channel(ch));
            assert_eq!(joined.as_slice(), whole.channel(ch));
        }
    }

    #[tokio::test]
    async fn truncated_tail_is_zero_filled() {
        let (_store, _decoder, buffer) = setup();
        assert!(buffer.initialize("p").await);

        let audio = buffer.get_range(4.5, 1.0, "p").await.unwrap();
        assert_eq!(audio.frames(), 1000);
        assert_eq!(&audio.channel(0)[..500], expected(0, 4500..5000).as_slice());
        assert!(audio.channel(0)[500..].iter().all(|&s| s == 0.0));
    }

    #[tokio::test]
    async fn short_interior_chunk_is_an_error() {
        let (store, _decoder, buffer) = setup();
        // Chunk 0 lost its last 100 frames but chunk 1 follows it
        store.insert("p", &chunk_file_name(0), crate::test_support::mock_chunk_payload(0, 1900));
        assert!(buffer.initialize("p").await);

        let audio = buffer.get_range(0.5, 1.0, "p").await.unwrap();
        assert_eq!(audio.channel(0), expected(0, 500..1500).as_slice());

        let err = buffer.get_range(1.5, 1.0, "p").await.unwrap_err();
        assert_eq!(
            err,
            BufferError::ShortChunk {
                index: 0,
                frames: ENCODER_PRIMING_SAMPLES + 1900,
                needed: ENCODER_PRIMING_SAMPLES + 2000,
            }
        );

        // Same when the range ends inside the short chunk's missing tail
        let err = buffer.get_range(1.5, 0.45, "p").await.unwrap_err();
        assert!(matches!(err, BufferError::ShortChunk { index: 0, .. }));
    }

    #[tokio::test]
    async fn last_line_plays_when_recording_fills_its_chunks() {
        use crate::transcript::{build_segments, RawCue};

        // 4 s is exactly two chunks, so there is no chunk 2
        let store = Arc::new(MockChunkStore::new());
        store.insert_mock_recording("p", SAMPLE_RATE, CHUNK_SECS, 4000);
        let buffer = ChunkBuffer::with_chunk_seconds(
            ChunkStoreManager::from_storage(store),
            Arc::new(MockChunkDecoder::new(SAMPLE_RATE, 1)),
            CHUNK_SECS,
        );
        assert!(buffer.initialize("p").await);

        let segments = build_segments(vec![
            RawCue {
                start: 2.0,
                end: 2.9,
                text: "first".to_string(),
            },
            RawCue {
                start: 3.0,
                end: 3.9,
                text: "last".to_string(),
            },
        ]);
        let last = segments.last().unwrap();
        assert!(buffer
            .get_range(last.start_time, last.duration(), "p")
            .await
            .is_ok());

        let tail = buffer.get_range(3.5, 0.5, "p").await.unwrap();
        assert_eq!(tail.channel(0), expected(0, 3500..4000).as_slice());
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_read() {
        let (store, _decoder, buffer) = setup();
        assert!(buffer.initialize("p").await);

        let (a, b) = tokio::join!(
            buffer.get_range(2.1, 0.5, "p"),
            buffer.get_range(2.5, 0.5, "p")
        );
        assert_eq!(a.unwrap().channel(0), expected(0, 2100..2600).as_slice());
        assert_eq!(b.unwrap().channel(0), expected(0, 2500..3000).as_slice());

        assert_eq!(store.read_count("p", &chunk_file_name(1)), 1);
        assert_eq!(store.read_count("p", &chunk_file_name(0)), 1);
    }

    #[tokio::test]
    async fn missing_chunk_is_an_error_and_can_be_retried() {
        let (store, _decoder, buffer) = setup();
        assert!(buffer.initialize("p").await);

        let payload = crate::test_support::mock_chunk_payload(2000, 2000);
        store.remove("p", &chunk_file_name(1));

        let err = buffer.get_range(1.5, 1.0, "p").await.unwrap_err();
        assert_eq!(err, BufferError::MissingChunk { index: 1 });
        assert!(!buffer.is_cached(1));

        store.insert("p", &chunk_file_name(1), payload);
        let audio = buffer.get_range(1.5, 1.0, "p").await.unwrap();
        assert_eq!(audio.channel(0), expected(0, 1500..2500).as_slice());
    }

    #[tokio::test]
    async fn corrupt_chunk_is_a_decode_error() {
        let (store, _decoder, buffer) = setup();
        assert!(buffer.initialize("p").await);

        store.insert("p", &chunk_file_name(1), b"junk".to_vec());
        let err = buffer.get_range(2.0, 1.0, "p").await.unwrap_err();
        assert!(matches!(err, BufferError::Decode { index: 1, .. }));
    }

    #[tokio::test]
    async fn prefetch_fills_the_next_chunk() {
        let (store, _decoder, buffer) = setup();
        assert!(buffer.initialize("p").await);

        buffer.get_range(0.0, 1.0, "p").await.unwrap();
        buffer.wait_for_prefetch().await;

        assert!(buffer.is_cached(1));
        assert_eq!(store.read_count("p", &chunk_file_name(1)), 1);

        buffer.get_range(2.0, 0.5, "p").await.unwrap();
        assert_eq!(store.read_count("p", &chunk_file_name(1)), 1);
    }

    #[tokio::test]
    async fn prefetch_past_the_end_is_quiet() {
        let (store, _decoder, buffer) = setup();
        assert!(buffer.initialize("p").await);

        buffer.get_range(4.0, 1.0, "p").await.unwrap();
        buffer.wait_for_prefetch().await;

        assert!(!buffer.is_cached(3));
        assert_eq!(store.read_count("p", &chunk_file_name(3)), 0);
    }

    #[tokio::test]
    async fn reinitialize_discards_stale_prefetch() {
        let (store, _decoder, buffer) = setup();
        assert!(buffer.initialize("p").await);

        // The prefetch task cannot run before initialize bumps the generation
        buffer.get_range(0.0, 1.0, "p").await.unwrap();
        assert!(buffer.initialize("p").await);
        buffer.wait_for_prefetch().await;

        assert!(!buffer.is_cached(1));
        assert_eq!(store.read_count("p", &chunk_file_name(1)), 0);
        assert_eq!(store.read_count("p", &chunk_file_name(0)), 2);
    }
}
