pub mod chunk_buffer;
pub mod controller;
mod cpal_output;
pub mod progress;
pub mod range;
pub mod service;

pub use chunk_buffer::{AudioFormat, BufferError, ChunkBuffer};
pub use controller::SegmentRangeController;
pub use cpal_output::{
    cue_tone, render_interleaved, Clip, ClipEndNotifier, ClipId, ClipOutput, CpalClipOutput,
    OutputError, CUE_DURATION_MS, CUE_FREQUENCY_HZ,
};
pub use progress::PlaybackProgress;
pub use range::{RangeInfo, RangeKind};
pub use service::{OutputFactory, PlaybackCommand, PlaybackHandle, PlaybackService, PlaybackState};
