// Test support utilities for both unit and integration tests

use crate::chunk_store::{ChunkStore, ChunkStoreError};
use crate::codec::{
    chunk_file_name, chunk_sample_count, ChunkDecoder, CodecError, DecodedAudio,
    ENCODER_PRIMING_SAMPLES,
};
use crate::playback::{Clip, ClipEndNotifier, ClipId, ClipOutput, OutputError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

type FileKey = (String, String);

fn key(scope: &str, name: &str) -> FileKey {
    (scope.to_string(), name.to_string())
}

/// Mock chunk store for testing
///
/// Keeps files in memory and counts reads per file so tests can check
/// how often a chunk was actually fetched.
#[derive(Default)]
pub struct MockChunkStore {
    files: Mutex<HashMap<FileKey, Vec<u8>>>,
    reads: Mutex<HashMap<FileKey, usize>>,
    /// Remaining successful writes before every write fails
    write_budget: Mutex<Option<usize>>,
}

impl MockChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Let the next `writes` writes succeed, then fail every write after that
    pub fn fail_writes_after(&self, writes: usize) {
        *self.write_budget.lock().unwrap() = Some(writes);
    }

    pub fn insert(&self, scope: &str, name: &str, data: Vec<u8>) {
        self.files.lock().unwrap().insert(key(scope, name), data);
    }

    pub fn remove(&self, scope: &str, name: &str) {
        self.files.lock().unwrap().remove(&key(scope, name));
    }

    pub fn contains(&self, scope: &str, name: &str) -> bool {
        self.files.lock().unwrap().contains_key(&key(scope, name))
    }

    pub fn read_count(&self, scope: &str, name: &str) -> usize {
        self.reads
            .lock()
            .unwrap()
            .get(&key(scope, name))
            .copied()
            .unwrap_or(0)
    }

    pub fn total_reads(&self) -> usize {
        self.reads.lock().unwrap().values().sum()
    }

    /// Store mock chunk payloads for a recording of `total_frames` frames.
    ///
    /// Payloads are understood by [`MockChunkDecoder`]. Returns the number of chunks written.
    pub fn insert_mock_recording(
        &self,
        scope: &str,
        sample_rate: u32,
        chunk_seconds: u32,
        total_frames: usize,
    ) -> u32 {
        let chunk_frames = chunk_sample_count(sample_rate, chunk_seconds);
        let mut index = 0u32;
        let mut start = 0usize;
        while start < total_frames {
            let frames = chunk_frames.min(total_frames - start);
            self.insert(
                scope,
                &chunk_file_name(index),
                mock_chunk_payload(start as u64, frames as u32),
            );
            start += frames;
            index += 1;
        }
        index
    }
}

#[async_trait::async_trait]
impl ChunkStore for MockChunkStore {
    async fn exists(&self, scope: &str, name: &str) -> Result<bool, ChunkStoreError> {
        Ok(self.contains(scope, name))
    }

    async fn read(&self, scope: &str, name: &str) -> Result<Vec<u8>, ChunkStoreError> {
        *self
            .reads
            .lock()
            .unwrap()
            .entry(key(scope, name))
            .or_insert(0) += 1;

        // Yield once so concurrent readers really interleave
        tokio::task::yield_now().await;

        self.files
            .lock()
            .unwrap()
            .get(&key(scope, name))
            .cloned()
            .ok_or_else(|| ChunkStoreError::NotFound {
                scope: scope.to_string(),
                name: name.to_string(),
            })
    }

    async fn write(&self, scope: &str, name: &str, data: &[u8]) -> Result<(), ChunkStoreError> {
        {
            let mut budget = self.write_budget.lock().unwrap();
            if let Some(remaining) = budget.as_mut() {
                if *remaining == 0 {
                    return Err(ChunkStoreError::Io(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "mock write failure",
                    )));
                }
                *remaining -= 1;
            }
        }
        self.insert(scope, name, data.to_vec());
        Ok(())
    }

    async fn clear(&self, scope: &str, extension: Option<&str>) -> Result<(), ChunkStoreError> {
        let suffix = extension.map(|ext| format!(".{}", ext));
        self.files.lock().unwrap().retain(|(s, name), _| {
            s != scope
                || match &suffix {
                    Some(suffix) => !name.ends_with(suffix.as_str()),
                    None => false,
                }
        });
        Ok(())
    }
}

/// Sample value the mock decoder produces for an absolute sample position.
///
/// Exact in f32 for positions below 2^23.
pub fn mock_sample(channel: usize, absolute_sample: usize) -> f32 {
    absolute_sample as f32 + channel as f32 * 0.5
}

/// Value of the priming samples the mock decoder puts in front of every chunk
pub const MOCK_PRIMING_VALUE: f32 = -1.0;

/// Encode a mock chunk covering `frames` frames starting at absolute sample `start`
pub fn mock_chunk_payload(start: u64, frames: u32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(12);
    payload.extend_from_slice(&start.to_le_bytes());
    payload.extend_from_slice(&frames.to_le_bytes());
    payload
}

/// Mock decoder for payloads written by [`MockChunkStore::insert_mock_recording`].
///
/// Every decoded chunk starts with [`ENCODER_PRIMING_SAMPLES`] of junk, like the real codec.
pub struct MockChunkDecoder {
    sample_rate: u32,
    channels: usize,
    calls: AtomicUsize,
}

impl MockChunkDecoder {
    pub fn new(sample_rate: u32, channels: usize) -> Self {
        Self {
            sample_rate,
            channels,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ChunkDecoder for MockChunkDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<DecodedAudio, CodecError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if bytes.len() != 12 {
            return Err(CodecError::NoAudioTracks);
        }
        let mut start = [0u8; 8];
        start.copy_from_slice(&bytes[0..8]);
        let mut frames = [0u8; 4];
        frames.copy_from_slice(&bytes[8..12]);
        let start = u64::from_le_bytes(start) as usize;
        let frames = u32::from_le_bytes(frames) as usize;

        let channels = (0..self.channels)
            .map(|ch| {
                let mut data = vec![MOCK_PRIMING_VALUE; ENCODER_PRIMING_SAMPLES];
                data.extend((0..frames).map(|i| mock_sample(ch, start + i)));
                data
            })
            .collect();

        Ok(DecodedAudio::new(self.sample_rate, channels))
    }
}

/// A clip handed to [`MockClipOutput`]
#[derive(Debug, Clone)]
pub struct StartedClip {
    pub id: ClipId,
    pub frames: usize,
    pub looping: bool,
    pub has_cue: bool,
    pub first_sample: Option<f32>,
}

#[derive(Default)]
struct MockOutputState {
    started: Vec<StartedClip>,
    notifiers: Vec<ClipEndNotifier>,
    active: Option<ClipId>,
    stops: usize,
}

/// Clip output that records what it was asked to play.
///
/// Clones share state, so a test can keep one handle while the controller owns another.
#[derive(Clone, Default)]
pub struct MockClipOutput {
    state: Arc<Mutex<MockOutputState>>,
}

impl MockClipOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn started(&self) -> Vec<StartedClip> {
        self.state.lock().unwrap().started.clone()
    }

    pub fn last_started(&self) -> Option<StartedClip> {
        self.state.lock().unwrap().started.last().cloned()
    }

    pub fn stop_count(&self) -> usize {
        self.state.lock().unwrap().stops
    }

    pub fn active(&self) -> Option<ClipId> {
        self.state.lock().unwrap().active
    }

    /// Fire the end-of-clip notifier of the clip that is currently playing
    pub fn finish_active(&self) -> bool {
        let active = self.state.lock().unwrap().active;
        match active {
            Some(id) => self.finish_clip(id),
            None => false,
        }
    }

    /// Fire the notifier of any clip ever started, even one that was stopped since
    pub fn finish_clip(&self, id: ClipId) -> bool {
        let state = self.state.lock().unwrap();
        match state.notifiers.iter().find(|n| n.id() == id) {
            Some(notifier) => {
                notifier.notify();
                true
            }
            None => false,
        }
    }
}

impl ClipOutput for MockClipOutput {
    fn start(&mut self, clip: Clip, on_end: ClipEndNotifier) -> Result<(), OutputError> {
        let mut state = self.state.lock().unwrap();
        state.started.push(StartedClip {
            id: on_end.id(),
            frames: clip.audio.frames(),
            looping: clip.looping,
            has_cue: clip.cue.is_some(),
            first_sample: clip.audio.channels.first().and_then(|c| c.first().copied()),
        });
        state.active = Some(on_end.id());
        state.notifiers.push(on_end);
        Ok(())
    }

    fn stop(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.active = None;
        state.stops += 1;
    }
}
