use crate::codec::DecodedAudio;
use crate::playback::service::PlaybackCommand;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Stream, StreamConfig};
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc as tokio_mpsc;
use tracing::{debug, error, info};

/// Frequency of the tone played ahead of the first line of a scene
pub const CUE_FREQUENCY_HZ: f32 = 880.0;
/// Length of the scene cue tone
pub const CUE_DURATION_MS: u32 = 120;
const CUE_AMPLITUDE: f32 = 0.3;
/// Fade applied at both ends of the cue so it does not click
const CUE_FADE_MS: u32 = 10;

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("No output device found")]
    DeviceNotFound,
    #[error("Stream config error: {0}")]
    StreamConfig(String),
    #[error("Stream build error: {0}")]
    StreamBuild(String),
    #[error("Stream play error: {0}")]
    StreamPlay(String),
}

/// Identifies one started clip so stale end events can be told apart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClipId(pub u64);

impl fmt::Display for ClipId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "clip-{}", self.0)
    }
}

/// One in-memory clip handed to the output
#[derive(Debug, Clone)]
pub struct Clip {
    pub audio: DecodedAudio,
    /// Repeat `audio` until stopped; a cue is only played once
    pub looping: bool,
    /// Played once right before `audio`
    pub cue: Option<DecodedAudio>,
}

/// Posts `ClipEnded` for one clip back to the playback command channel
#[derive(Debug, Clone)]
pub struct ClipEndNotifier {
    id: ClipId,
    tx: tokio_mpsc::UnboundedSender<PlaybackCommand>,
}

impl ClipEndNotifier {
    pub fn new(id: ClipId, tx: tokio_mpsc::UnboundedSender<PlaybackCommand>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> ClipId {
        self.id
    }

    pub fn notify(&self) {
        let _ = self.tx.send(PlaybackCommand::ClipEnded(self.id));
    }
}

/// Something that can play one clip at a time
pub trait ClipOutput {
    /// Replace whatever is playing with `clip`. `on_end` fires once when a
    /// non-looping clip has been played to the end.
    fn start(&mut self, clip: Clip, on_end: ClipEndNotifier) -> Result<(), OutputError>;
    fn stop(&mut self);
}

/// Short sine beep marking a scene start
pub fn cue_tone(sample_rate: u32, channel_count: usize) -> DecodedAudio {
    let frames = (sample_rate as u64 * CUE_DURATION_MS as u64 / 1000) as usize;
    let fade = ((sample_rate as u64 * CUE_FADE_MS as u64 / 1000) as usize).max(1);

    let tone: Vec<f32> = (0..frames)
        .map(|i| {
            let envelope = (i.min(frames - 1 - i) as f32 / fade as f32).min(1.0);
            let phase = i as f32 * CUE_FREQUENCY_HZ * std::f32::consts::TAU / sample_rate as f32;
            phase.sin() * CUE_AMPLITUDE * envelope
        })
        .collect();

    DecodedAudio::new(sample_rate, vec![tone; channel_count.max(1)])
}

/// Interleave `audio` for a device running at `out_rate` with `out_channels` channels.
///
/// Rate conversion picks the nearest earlier source sample. Mono is duplicated to
/// stereo; extra source channels are dropped.
pub fn render_interleaved(audio: &DecodedAudio, out_rate: u32, out_channels: usize) -> Vec<f32> {
    let in_frames = audio.frames();
    let in_channels = audio.channel_count();
    if in_frames == 0 || in_channels == 0 || out_rate == 0 || out_channels == 0 {
        return Vec::new();
    }

    let ratio = audio.sample_rate as f64 / out_rate as f64;
    let out_frames = (in_frames as f64 / ratio) as usize;

    let mut out = Vec::with_capacity(out_frames * out_channels);
    for frame in 0..out_frames {
        let src = ((frame as f64 * ratio) as usize).min(in_frames - 1);
        for ch in 0..out_channels {
            let src_ch = if in_channels == 1 {
                0
            } else if ch < in_channels {
                ch
            } else {
                in_channels - 1
            };
            out.push(audio.channels[src_ch][src]);
        }
    }
    out
}

/// Clip output on the default cpal device
pub struct CpalClipOutput {
    device: Device,
    stream_config: StreamConfig,
    stream: Option<Stream>,
}

impl CpalClipOutput {
    pub fn new() -> Result<Self, OutputError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or(OutputError::DeviceNotFound)?;

        let default_config = device
            .default_output_config()
            .map_err(|e| OutputError::StreamConfig(e.to_string()))?;

        let sample_format = default_config.sample_format();
        let stream_config = StreamConfig::from(default_config);

        info!(
            "Audio device: {} channels, {} Hz, {:?}",
            stream_config.channels, stream_config.sample_rate.0, sample_format
        );

        Ok(Self {
            device,
            stream_config,
            stream: None,
        })
    }
}

impl ClipOutput for CpalClipOutput {
    fn start(&mut self, clip: Clip, on_end: ClipEndNotifier) -> Result<(), OutputError> {
        self.stop();

        let out_rate = self.stream_config.sample_rate.0;
        let out_channels = self.stream_config.channels as usize;

        let mut samples = match &clip.cue {
            Some(cue) => render_interleaved(cue, out_rate, out_channels),
            None => Vec::new(),
        };
        // Looping restarts after the cue
        let loop_start = samples.len();
        samples.extend(render_interleaved(&clip.audio, out_rate, out_channels));

        debug!(
            "Starting {} ({} samples, looping: {})",
            on_end.id(),
            samples.len(),
            clip.looping
        );

        let looping = clip.looping && samples.len() > loop_start;
        let mut position = 0usize;
        let mut finished = false;

        let stream = self
            .device
            .build_output_stream(
                &self.stream_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut output_pos = 0;
                    while output_pos < data.len() {
                        if position >= samples.len() {
                            if looping {
                                position = loop_start;
                            } else {
                                data[output_pos..].fill(0.0);
                                if !finished {
                                    finished = true;
                                    on_end.notify();
                                }
                                return;
                            }
                        }

                        let n = (data.len() - output_pos).min(samples.len() - position);
                        data[output_pos..output_pos + n]
                            .copy_from_slice(&samples[position..position + n]);
                        output_pos += n;
                        position += n;
                    }
                },
                |err| {
                    error!("Audio stream error: {:?}", err);
                },
                None,
            )
            .map_err(|e| OutputError::StreamBuild(e.to_string()))?;

        stream
            .play()
            .map_err(|e| OutputError::StreamPlay(e.to_string()))?;
        self.stream = Some(stream);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.pause() {
                debug!("Failed to pause stream before drop: {}", e);
            }
        }
    }
}
