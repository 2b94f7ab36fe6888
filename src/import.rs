use crate::chunk_store::{ChunkStoreError, ChunkStoreManager};
use crate::chunking::{ChunkingConfig, ChunkingError, ChunkingResult, ChunkingService};
use crate::codec::{decode_source_file, CodecError, CHUNK_EXTENSION};
use crate::transcript::{
    decode_transcript_bytes, transcript_file_name, SrtParser, TranscriptError, TranscriptParser,
    TRANSCRIPT_EXTENSIONS,
};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc as tokio_mpsc;
use tracing::{error, info};

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Store error: {0}")]
    Store(#[from] ChunkStoreError),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("Chunking error: {0}")]
    Chunking(#[from] ChunkingError),
    #[error("Transcript error: {0}")]
    Transcript(#[from] TranscriptError),
    #[error("Unsupported transcript file: {0}")]
    UnsupportedTranscript(String),
    #[error("Import task failed: {0}")]
    Task(String),
}

/// A recording and its transcript to import under one project name
#[derive(Debug, Clone)]
pub struct ImportRequest {
    pub project: String,
    pub audio_path: PathBuf,
    pub transcript_path: PathBuf,
}

/// Progress updates during import
#[derive(Debug, Clone, PartialEq)]
pub enum ImportProgress {
    Started {
        project: String,
    },
    Splitting {
        project: String,
        completed: usize,
        total: usize,
    },
    Complete {
        project: String,
        total_chunks: usize,
    },
    Failed {
        project: String,
        error: String,
    },
}

impl ImportProgress {
    /// Status line for the host
    pub fn status(&self) -> String {
        match self {
            ImportProgress::Started { project } => format!("importing {}", project),
            ImportProgress::Splitting {
                completed, total, ..
            } => format!("{}/{}", completed, total),
            ImportProgress::Complete { total_chunks, .. } => {
                format!("imported {} chunks", total_chunks)
            }
            ImportProgress::Failed { error, .. } => error.clone(),
        }
    }
}

/// Import a recording: store its transcript, then split the audio into chunks.
///
/// Chunks from an earlier import of the same project are removed first. A failure is
/// reported as [`ImportProgress::Failed`] and returned.
pub async fn import_project(
    store: &ChunkStoreManager,
    config: ChunkingConfig,
    request: &ImportRequest,
    progress_tx: &tokio_mpsc::UnboundedSender<ImportProgress>,
) -> Result<ChunkingResult, ImportError> {
    let project = request.project.clone();
    let _ = progress_tx.send(ImportProgress::Started {
        project: project.clone(),
    });

    match run_import(store, config, request, progress_tx).await {
        Ok(result) => {
            info!(
                "Imported {} as {} chunks",
                request.audio_path.display(),
                result.total_chunks
            );
            let _ = progress_tx.send(ImportProgress::Complete {
                project,
                total_chunks: result.total_chunks,
            });
            Ok(result)
        }
        Err(e) => {
            error!("Import of {} failed: {}", project, e);
            let _ = progress_tx.send(ImportProgress::Failed {
                project,
                error: e.to_string(),
            });
            Err(e)
        }
    }
}

async fn run_import(
    store: &ChunkStoreManager,
    config: ChunkingConfig,
    request: &ImportRequest,
    progress_tx: &tokio_mpsc::UnboundedSender<ImportProgress>,
) -> Result<ChunkingResult, ImportError> {
    let scope = request.project.as_str();

    let extension = request
        .transcript_path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_lowercase)
        .filter(|ext| TRANSCRIPT_EXTENSIONS.contains(&ext.as_str()))
        .ok_or_else(|| {
            ImportError::UnsupportedTranscript(request.transcript_path.display().to_string())
        })?;

    // Refuse transcripts that would leave the project unplayable
    let transcript = tokio::fs::read(&request.transcript_path).await?;
    if SrtParser::new()
        .parse(&decode_transcript_bytes(&transcript))?
        .is_empty()
    {
        return Err(TranscriptError::Empty.into());
    }

    store.clear(scope, Some(CHUNK_EXTENSION)).await?;
    for old in TRANSCRIPT_EXTENSIONS {
        store.clear(scope, Some(old)).await?;
    }
    store
        .write(scope, &transcript_file_name(&extension), &transcript)
        .await?;

    let audio_path = request.audio_path.clone();
    let source = tokio::task::spawn_blocking(move || decode_source_file(&audio_path))
        .await
        .map_err(|e| ImportError::Task(e.to_string()))??;

    let service = ChunkingService::with_config(config, store.clone());
    let result = service
        .split(scope, Arc::new(source), |completed, total| {
            let _ = progress_tx.send(ImportProgress::Splitting {
                project: scope.to_string(),
                completed,
                total,
            });
        })
        .await?;

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::chunk_file_name;
    use crate::test_support::MockChunkStore;
    use tempfile::TempDir;

    /// 16-bit mono PCM WAV with a quiet sine
    fn write_wav(path: &std::path::Path, sample_rate: u32, frames: usize) {
        let data_len = (frames * 2) as u32;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&(36 + data_len).to_le_bytes());
        bytes.extend_from_slice(b"WAVEfmt ");
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&sample_rate.to_le_bytes());
        bytes.extend_from_slice(&(sample_rate * 2).to_le_bytes());
        bytes.extend_from_slice(&2u16.to_le_bytes());
        bytes.extend_from_slice(&16u16.to_le_bytes());
        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&data_len.to_le_bytes());
        for i in 0..frames {
            let s = (i as f32 * 330.0 * std::f32::consts::TAU / sample_rate as f32).sin() * 8000.0;
            bytes.extend_from_slice(&(s as i16).to_le_bytes());
        }
        std::fs::write(path, bytes).unwrap();
    }

    fn drain(rx: &mut tokio_mpsc::UnboundedReceiver<ImportProgress>) -> Vec<ImportProgress> {
        let mut out = Vec::new();
        while let Ok(p) = rx.try_recv() {
            out.push(p);
        }
        out
    }

    #[tokio::test]
    async fn imports_transcript_and_chunks() {
        let temp_dir = TempDir::new().unwrap();
        let audio_path = temp_dir.path().join("talk.wav");
        let transcript_path = temp_dir.path().join("talk.SRT");
        write_wav(&audio_path, 44100, 66150);
        std::fs::write(&transcript_path, "1\n00:00:00,000 --> 00:00:01,000\nHi\n").unwrap();

        let mock = Arc::new(MockChunkStore::new());
        mock.insert("talk", &chunk_file_name(7), b"stale".to_vec());
        let store = ChunkStoreManager::from_storage(mock.clone());
        let (tx, mut rx) = tokio_mpsc::unbounded_channel();

        let request = ImportRequest {
            project: "talk".to_string(),
            audio_path,
            transcript_path,
        };
        let config = ChunkingConfig {
            chunk_seconds: 1,
            bitrate_kbps: 128,
        };
        let result = import_project(&store, config, &request, &tx).await.unwrap();

        assert_eq!(result.total_chunks, 2);
        assert_eq!(result.sample_rate, 44100);
        assert!(mock.contains("talk", "transcript.srt"));
        assert!(mock.contains("talk", &chunk_file_name(1)));
        assert!(!mock.contains("talk", &chunk_file_name(7)));

        let statuses: Vec<String> = drain(&mut rx).iter().map(|p| p.status()).collect();
        assert_eq!(
            statuses,
            vec!["importing talk", "1/2", "2/2", "imported 2 chunks"]
        );
    }

    #[tokio::test]
    async fn rejects_unknown_transcript_format() {
        let temp_dir = TempDir::new().unwrap();
        let request = ImportRequest {
            project: "talk".to_string(),
            audio_path: temp_dir.path().join("talk.wav"),
            transcript_path: temp_dir.path().join("talk.txt"),
        };
        let store = ChunkStoreManager::from_storage(Arc::new(MockChunkStore::new()));
        let (tx, mut rx) = tokio_mpsc::unbounded_channel();

        let err = import_project(&store, ChunkingConfig::default(), &request, &tx)
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::UnsupportedTranscript(_)));
        assert!(matches!(
            drain(&mut rx).last(),
            Some(ImportProgress::Failed { .. })
        ));
    }
}
