use crate::chunk_store::{ChunkStoreError, ChunkStoreManager};
use chardetng::EncodingDetector;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Cue text prefix that starts a new scene
pub const SCENE_MARKER: char = '#';

/// Silence budget shared between the two segments around a gap, in seconds
pub const GAP_BUDGET_SECS: f64 = 0.4;

/// Transcript file extensions, in lookup order
pub const TRANSCRIPT_EXTENSIONS: [&str; 2] = ["srt", "vtt"];

const TIMING_PATTERN: &str = r"^(?:(\d+):)?(\d{1,2}):(\d{2})[,.](\d{1,3})\s*-->\s*(?:(\d+):)?(\d{1,2}):(\d{2})[,.](\d{1,3})";
const TAG_PATTERN: &str = r"</?[^>]+>";

#[derive(Error, Debug)]
pub enum TranscriptError {
    #[error("Store error: {0}")]
    Store(#[from] ChunkStoreError),
    #[error("Pattern error: {0}")]
    Pattern(#[from] regex::Error),
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),
    #[error("No transcript found for {0}")]
    NotFound(String),
    #[error("Transcript has no cues")]
    Empty,
}

/// File name of the transcript stored alongside the chunks
pub fn transcript_file_name(extension: &str) -> String {
    format!("transcript.{}", extension)
}

/// One timed cue as it comes out of a parser
#[derive(Debug, Clone, PartialEq)]
pub struct RawCue {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SceneId(pub u32);

/// A transcript line with its (widened) time span
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextSegment {
    pub start_time: f64,
    pub end_time: f64,
    pub text: String,
    pub scene_id: SceneId,
}

impl TextSegment {
    pub fn duration(&self) -> f64 {
        (self.end_time - self.start_time).max(0.0)
    }
}

/// Turns caption text into timed cues
pub trait TranscriptParser: Send + Sync {
    fn parse(&self, text: &str) -> Result<Vec<RawCue>, TranscriptError>;
}

/// Parser for SubRip and WebVTT captions
#[derive(Debug, Default, Clone, Copy)]
pub struct SrtParser;

impl SrtParser {
    pub fn new() -> Self {
        Self
    }
}

fn timestamp(
    hours: Option<regex::Match>,
    minutes: Option<regex::Match>,
    seconds: Option<regex::Match>,
    fraction: Option<regex::Match>,
) -> Result<f64, TranscriptError> {
    let number = |m: Option<regex::Match>| -> Result<u64, TranscriptError> {
        match m {
            Some(m) => m
                .as_str()
                .parse::<u64>()
                .map_err(|_| TranscriptError::InvalidTimestamp(m.as_str().to_string())),
            None => Ok(0),
        }
    };

    let millis = match fraction {
        // "5" means 500 ms
        Some(m) => format!("{:0<3}", m.as_str())
            .parse::<u64>()
            .map_err(|_| TranscriptError::InvalidTimestamp(m.as_str().to_string()))?,
        None => 0,
    };

    let total_ms =
        ((number(hours)? * 60 + number(minutes)?) * 60 + number(seconds)?) * 1000 + millis;
    Ok(total_ms as f64 / 1000.0)
}

impl TranscriptParser for SrtParser {
    fn parse(&self, text: &str) -> Result<Vec<RawCue>, TranscriptError> {
        let timing = Regex::new(TIMING_PATTERN)?;
        let tags = Regex::new(TAG_PATTERN)?;
        let normalized = text.replace("\r\n", "\n").replace('\r', "\n");

        let mut cues = Vec::new();
        for block in normalized.split("\n\n") {
            let mut lines = block.lines().map(str::trim).filter(|l| !l.is_empty());

            // Cue numbers and VTT identifiers come before the timing line
            let Some(caps) = lines.by_ref().find_map(|line| timing.captures(line)) else {
                continue;
            };

            let start = timestamp(caps.get(1), caps.get(2), caps.get(3), caps.get(4))?;
            let end = timestamp(caps.get(5), caps.get(6), caps.get(7), caps.get(8))?;
            if end < start {
                warn!("Skipping cue with end {} before start {}", end, start);
                continue;
            }

            let text = lines
                .map(|line| tags.replace_all(line, "").trim().to_string())
                .filter(|line| !line.is_empty())
                .collect::<Vec<_>>()
                .join("\n");
            if text.is_empty() {
                continue;
            }

            cues.push(RawCue { start, end, text });
        }

        debug!("Parsed {} cues", cues.len());
        Ok(cues)
    }
}

/// Decode transcript bytes, detecting the encoding when they are not UTF-8
pub fn decode_transcript_bytes(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    if let Ok(text) = std::str::from_utf8(bytes) {
        return text.to_string();
    }

    let mut detector = EncodingDetector::new();
    detector.feed(bytes, true);
    let encoding = detector.guess(None, true);

    let (decoded, _, had_errors) = encoding.decode(bytes);
    if had_errors {
        warn!(
            "Decoding errors occurred while reading transcript as {}",
            encoding.name()
        );
    }
    decoded.into_owned()
}

/// Assign scenes and widen segment edges into the surrounding silence.
///
/// Cues are ordered by start time. A cue whose text starts with [`SCENE_MARKER`] opens a
/// new scene; the marker is removed from the text. Each gap between neighbours gives up
/// to [`GAP_BUDGET_SECS`] of padding, half to each side, and the start of the first
/// segment moves back by half the budget.
pub fn build_segments(mut cues: Vec<RawCue>) -> Vec<TextSegment> {
    cues.sort_by(|a, b| a.start.total_cmp(&b.start));

    let mut scene = 0u32;
    let mut segments: Vec<TextSegment> = cues
        .into_iter()
        .enumerate()
        .map(|(i, cue)| {
            let trimmed = cue.text.trim();
            let text = match trimmed.strip_prefix(SCENE_MARKER) {
                Some(rest) => {
                    if i > 0 {
                        scene += 1;
                    }
                    rest.trim().to_string()
                }
                None => trimmed.to_string(),
            };
            TextSegment {
                start_time: cue.start,
                end_time: cue.end,
                text,
                scene_id: SceneId(scene),
            }
        })
        .collect();

    for i in 1..segments.len() {
        let gap = segments[i].start_time - segments[i - 1].end_time;
        if gap > 0.0 {
            let pad = gap.min(GAP_BUDGET_SECS) / 2.0;
            segments[i - 1].end_time += pad;
            segments[i].start_time -= pad;
        }
    }

    // The end is left alone: the recording may stop right at the last cue
    if let Some(first) = segments.first_mut() {
        first.start_time = (first.start_time - GAP_BUDGET_SECS / 2.0).max(0.0);
    }

    segments
}

/// Read, decode and parse the transcript stored under `scope`
pub async fn load_transcript(
    store: &ChunkStoreManager,
    scope: &str,
    parser: &dyn TranscriptParser,
) -> Result<Vec<TextSegment>, TranscriptError> {
    for extension in TRANSCRIPT_EXTENSIONS {
        let name = transcript_file_name(extension);
        if !store.exists(scope, &name).await? {
            continue;
        }

        let bytes = store.read(scope, &name).await?;
        let cues = parser.parse(&decode_transcript_bytes(&bytes))?;
        if cues.is_empty() {
            return Err(TranscriptError::Empty);
        }

        let segments = build_segments(cues);
        let scenes = segments.last().map(|s| s.scene_id.0 + 1).unwrap_or(0);
        info!(
            "Loaded {} segments in {} scenes from {}/{}",
            segments.len(),
            scenes,
            scope,
            name
        );
        return Ok(segments);
    }

    Err(TranscriptError::NotFound(scope.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockChunkStore;
    use std::sync::Arc;

    const SRT: &str = "1\r\n00:00:01,000 --> 00:00:02,500\r\n<i>Hello</i> there\r\n\r\n2\r\n00:00:03,000 --> 00:00:04,000\r\n# Next scene\r\n\r\n3\r\n01:00:05,250 --> 01:00:06,000\r\nLate line\r\nsecond row\r\n";

    fn cue(start: f64, end: f64, text: &str) -> RawCue {
        RawCue {
            start,
            end,
            text: text.to_string(),
        }
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn parses_srt_blocks() {
        let cues = SrtParser::new().parse(SRT).unwrap();
        assert_eq!(cues.len(), 3);
        assert_eq!(cues[0], cue(1.0, 2.5, "Hello there"));
        assert_eq!(cues[1].text, "# Next scene");
        assert!(close(cues[2].start, 3605.25));
        assert_eq!(cues[2].text, "Late line\nsecond row");
    }

    #[test]
    fn parses_vtt_short_timestamps() {
        let vtt = "WEBVTT\n\nintro\n00:01.500 --> 00:03.000\nFirst\n\n00:04.000 --> 00:05.000 align:start\nSecond\n";
        let cues = SrtParser::new().parse(vtt).unwrap();
        assert_eq!(cues, vec![cue(1.5, 3.0, "First"), cue(4.0, 5.0, "Second")]);
    }

    #[test]
    fn scene_markers_start_scenes_and_are_stripped() {
        let segments = build_segments(vec![
            cue(0.0, 1.0, "# opening"),
            cue(1.0, 2.0, "a"),
            cue(2.0, 3.0, "#b"),
            cue(3.0, 4.0, "c"),
        ]);
        let scenes: Vec<u32> = segments.iter().map(|s| s.scene_id.0).collect();
        assert_eq!(scenes, vec![0, 0, 1, 1]);
        assert_eq!(segments[0].text, "opening");
        assert_eq!(segments[2].text, "b");
    }

    #[test]
    fn gaps_are_shared_between_neighbours() {
        let segments = build_segments(vec![
            cue(1.0, 2.0, "a"),
            cue(2.1, 3.0, "b"),
            cue(5.0, 6.0, "c"),
        ]);
        // 100 ms gap: 50 ms each side
        assert!(close(segments[0].end_time, 2.05));
        assert!(close(segments[1].start_time, 2.05));
        // 2 s gap is capped at the budget
        assert!(close(segments[1].end_time, 3.2));
        assert!(close(segments[2].start_time, 4.8));
        // Only the leading edge is widened
        assert!(close(segments[0].start_time, 0.8));
        assert!(close(segments[2].end_time, 6.0));
    }

    #[test]
    fn overlapping_cues_are_not_widened() {
        let segments = build_segments(vec![cue(0.1, 2.0, "a"), cue(1.5, 3.0, "b")]);
        assert!(close(segments[0].start_time, 0.0));
        assert!(close(segments[0].end_time, 2.0));
        assert!(close(segments[1].start_time, 1.5));
    }

    #[test]
    fn decodes_legacy_encodings() {
        assert_eq!(decode_transcript_bytes(b"\xEF\xBB\xBFplain"), "plain");
        // French text in windows-1252
        let text = decode_transcript_bytes(
            b"Le caf\xE9 est tr\xE8s bon. Il a \xE9t\xE9 pr\xE9par\xE9 avec soin, d\xE9j\xE0 \xE0 l'\xE9t\xE9.",
        );
        assert!(text.contains("café"));
        assert!(text.contains("déjà"));
    }

    #[tokio::test]
    async fn loads_stored_transcript() {
        let mock = Arc::new(MockChunkStore::new());
        mock.insert("talk", "transcript.srt", SRT.as_bytes().to_vec());
        let store = ChunkStoreManager::from_storage(mock);

        let segments = load_transcript(&store, "talk", &SrtParser::new())
            .await
            .unwrap();
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[1].scene_id, SceneId(1));

        let err = load_transcript(&store, "missing", &SrtParser::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TranscriptError::NotFound(_)));
    }
}
