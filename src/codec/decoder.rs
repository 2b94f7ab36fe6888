use super::{CodecError, DecodedAudio, CHUNK_EXTENSION};
use std::fs::File;
use std::io::Cursor;
use std::path::Path;
use symphonia::core::{
    audio::{AudioBuffer, Signal},
    codecs::{DecoderOptions, CODEC_TYPE_NULL},
    errors::Error as SymphoniaError,
    formats::FormatOptions,
    io::{MediaSource, MediaSourceStream},
    meta::MetadataOptions,
    probe::Hint,
};
use tracing::{debug, warn};

/// Turns encoded chunk bytes back into planar samples.
///
/// Implementations may be called from the blocking thread pool, so they must not
/// assume any async context.
pub trait ChunkDecoder: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<DecodedAudio, CodecError>;
}

/// Chunk decoder backed by symphonia's MP3 decoder.
///
/// Gapless trimming stays off so the decoded output keeps the full encoder priming
/// delay, which the buffer manager skips explicitly.
#[derive(Debug, Default, Clone, Copy)]
pub struct SymphoniaChunkDecoder;

impl SymphoniaChunkDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl ChunkDecoder for SymphoniaChunkDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<DecodedAudio, CodecError> {
        let cursor = Cursor::new(bytes.to_vec());
        decode_media(Box::new(cursor), Some(CHUNK_EXTENSION), PacketPolicy::Strict)
    }
}

/// Decode a whole source recording from disk (any format symphonia can probe)
pub fn decode_source_file(path: &Path) -> Result<DecodedAudio, CodecError> {
    let file = File::open(path)?;
    let extension = path.extension().and_then(|ext| ext.to_str());
    decode_media(Box::new(file), extension, PacketPolicy::Lenient)
}

/// What to do with a packet the codec rejects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PacketPolicy {
    /// Chunk files: a dropped packet would shift every later sample off the priming offset
    Strict,
    /// Source recordings: skip it and keep going
    Lenient,
}

fn bad_packet(policy: PacketPolicy, message: &'static str) -> Result<(), CodecError> {
    match policy {
        PacketPolicy::Strict => Err(CodecError::Symphonia(SymphoniaError::DecodeError(message))),
        PacketPolicy::Lenient => {
            warn!("Skipping undecodable packet: {}", message);
            Ok(())
        }
    }
}

fn decode_media(
    source: Box<dyn MediaSource>,
    extension: Option<&str>,
    policy: PacketPolicy,
) -> Result<DecodedAudio, CodecError> {
    let media_source = MediaSourceStream::new(source, Default::default());

    let mut hint = Hint::new();
    if let Some(extension) = extension {
        hint.with_extension(extension);
    }

    let format_opts = FormatOptions {
        enable_gapless: false,
        ..Default::default()
    };

    let probed = symphonia::default::get_probe().format(
        &hint,
        media_source,
        &format_opts,
        &MetadataOptions::default(),
    )?;

    let mut format_reader = probed.format;

    let track = format_reader
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or(CodecError::NoAudioTracks)?;

    let track_id = track.id;
    let mut sample_rate = track.codec_params.sample_rate;
    let declared_channels = track.codec_params.channels.map(|c| c.count());

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())?;

    let mut channels: Vec<Vec<f32>> = Vec::new();

    loop {
        let packet = match format_reader.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(e) => return Err(CodecError::Symphonia(e)),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(e)) => {
                bad_packet(policy, e)?;
                continue;
            }
            Err(e) => return Err(CodecError::Symphonia(e)),
        };

        let spec = *decoded.spec();
        if channels.is_empty() {
            channels = vec![Vec::new(); spec.channels.count()];
        }
        sample_rate.get_or_insert(spec.rate);

        let mut planar: AudioBuffer<f32> = decoded.make_equivalent();
        decoded.convert(&mut planar);

        for (ch, out) in channels.iter_mut().enumerate() {
            if ch < planar.spec().channels.count() {
                out.extend_from_slice(planar.chan(ch));
            }
        }
    }

    if channels.is_empty() {
        let count = declared_channels.ok_or(CodecError::NoChannels)?;
        channels = vec![Vec::new(); count];
    }

    let sample_rate = sample_rate.ok_or(CodecError::MissingSampleRate)?;
    let audio = DecodedAudio::new(sample_rate, channels);

    debug!(
        "Decoded {} frames, {} channels at {} Hz",
        audio.frames(),
        audio.channel_count(),
        audio.sample_rate
    );

    Ok(audio)
}
