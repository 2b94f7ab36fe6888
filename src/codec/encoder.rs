use super::{quantize_sample, CodecError, DecodedAudio, ENCODE_BLOCK_SAMPLES, MAX_CHUNK_CHANNELS};
use mp3lame_encoder::{Builder, DualPcm, FlushGap};
use std::ops::Range;

/// Extra output space reserved for the final flush (LAME worst case)
const FLUSH_RESERVE_BYTES: usize = 7200;

/// Encodes windows of decoded audio into standalone MP3 chunk files
#[derive(Debug, Clone, Copy)]
pub struct ChunkEncoder {
    bitrate_kbps: u32,
}

impl ChunkEncoder {
    pub fn new(bitrate_kbps: u32) -> Self {
        Self { bitrate_kbps }
    }

    pub fn bitrate_kbps(&self) -> u32 {
        self.bitrate_kbps
    }

    fn lame_bitrate(&self) -> mp3lame_encoder::Bitrate {
        match self.bitrate_kbps {
            0..=96 => mp3lame_encoder::Bitrate::Kbps96,
            97..=112 => mp3lame_encoder::Bitrate::Kbps112,
            113..=128 => mp3lame_encoder::Bitrate::Kbps128,
            129..=160 => mp3lame_encoder::Bitrate::Kbps160,
            161..=192 => mp3lame_encoder::Bitrate::Kbps192,
            193..=224 => mp3lame_encoder::Bitrate::Kbps224,
            225..=256 => mp3lame_encoder::Bitrate::Kbps256,
            _ => mp3lame_encoder::Bitrate::Kbps320,
        }
    }

    /// Encode `frames` of `audio` as one independently decodable MP3 stream.
    ///
    /// Up to two channels are kept. Samples are fed in fixed blocks of
    /// [`ENCODE_BLOCK_SAMPLES`] and the encoder is flushed at the end, so every chunk
    /// starts with the same priming delay.
    pub fn encode(&self, audio: &DecodedAudio, frames: Range<usize>) -> Result<Vec<u8>, CodecError> {
        let channel_count = audio.channel_count().min(MAX_CHUNK_CHANNELS);
        if channel_count == 0 {
            return Err(CodecError::NoChannels);
        }

        let mut builder = Builder::new()
            .ok_or_else(|| CodecError::Encoder("LAME encoder init failed".to_string()))?;
        builder
            .set_num_channels(channel_count as u8)
            .map_err(|e| CodecError::Encoder(format!("LAME set channels failed: {:?}", e)))?;
        builder
            .set_sample_rate(audio.sample_rate)
            .map_err(|e| CodecError::Encoder(format!("LAME set sample rate failed: {:?}", e)))?;
        builder
            .set_brate(self.lame_bitrate())
            .map_err(|e| CodecError::Encoder(format!("LAME set bitrate failed: {:?}", e)))?;
        builder
            .set_quality(mp3lame_encoder::Quality::Good)
            .map_err(|e| CodecError::Encoder(format!("LAME set quality failed: {:?}", e)))?;
        // The placeholder tag frame would decode as one extra frame of silence
        builder
            .set_to_write_vbr_tag(false)
            .map_err(|e| CodecError::Encoder(format!("LAME disable tag failed: {:?}", e)))?;
        let mut encoder = builder
            .build()
            .map_err(|e| CodecError::Encoder(format!("LAME build failed: {:?}", e)))?;

        let left = &audio.channels[0][frames.clone()];
        // Mono input is passed as a duplicated pair; LAME only reads the left side
        let right = if channel_count == 2 {
            &audio.channels[1][frames.clone()]
        } else {
            left
        };

        let total = frames.len();
        let mut output: Vec<u8> =
            Vec::with_capacity(mp3lame_encoder::max_required_buffer_size(total));
        let mut left_block: Vec<i16> = Vec::with_capacity(ENCODE_BLOCK_SAMPLES);
        let mut right_block: Vec<i16> = Vec::with_capacity(ENCODE_BLOCK_SAMPLES);

        let mut start = 0;
        while start < total {
            let end = (start + ENCODE_BLOCK_SAMPLES).min(total);

            left_block.clear();
            left_block.extend(left[start..end].iter().map(|&s| quantize_sample(s)));
            right_block.clear();
            right_block.extend(right[start..end].iter().map(|&s| quantize_sample(s)));

            output.reserve(mp3lame_encoder::max_required_buffer_size(end - start));
            let input = DualPcm {
                left: &left_block,
                right: &right_block,
            };
            let written = encoder
                .encode(input, output.spare_capacity_mut())
                .map_err(|e| CodecError::Encoder(format!("LAME encode failed: {:?}", e)))?;

            // SAFETY: encoder wrote `written` bytes into spare capacity
            unsafe {
                output.set_len(output.len() + written);
            }

            start = end;
        }

        // FlushGap pads past the delay line so the last input samples reach the file
        output.reserve(FLUSH_RESERVE_BYTES);
        let flushed = encoder
            .flush::<FlushGap>(output.spare_capacity_mut())
            .map_err(|e| CodecError::Encoder(format!("LAME flush failed: {:?}", e)))?;

        // SAFETY: encoder wrote `flushed` bytes into spare capacity
        unsafe {
            output.set_len(output.len() + flushed);
        }

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(sample_rate: u32, channels: usize, frames: usize) -> DecodedAudio {
        let data: Vec<f32> = (0..frames)
            .map(|i| (i as f32 * 440.0 * std::f32::consts::TAU / sample_rate as f32).sin() * 0.5)
            .collect();
        DecodedAudio::new(sample_rate, vec![data; channels])
    }

    #[test]
    fn encodes_mono_window_to_mpeg_frames() {
        let audio = sine(44100, 1, 44100);
        let bytes = ChunkEncoder::new(128).encode(&audio, 0..22050).unwrap();
        assert!(!bytes.is_empty());
        // Every MPEG audio frame begins with an 11-bit sync word
        assert!(bytes
            .windows(2)
            .any(|w| w[0] == 0xFF && (w[1] & 0xE0) == 0xE0));
    }

    #[test]
    fn keeps_at_most_two_channels() {
        let audio = sine(48000, 3, 4800);
        let bytes = ChunkEncoder::new(128).encode(&audio, 0..4800).unwrap();
        assert!(!bytes.is_empty());
    }

    #[test]
    fn rejects_audio_without_channels() {
        let audio = DecodedAudio::new(44100, Vec::new());
        let err = ChunkEncoder::new(128).encode(&audio, 0..0).unwrap_err();
        assert!(matches!(err, CodecError::NoChannels));
    }
}
