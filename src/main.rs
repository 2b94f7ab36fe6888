use clap::{Parser, Subcommand};
use lineloop::chunk_store::ChunkStoreManager;
use lineloop::chunking::ChunkingConfig;
use lineloop::codec::SymphoniaChunkDecoder;
use lineloop::config::Config;
use lineloop::import::{import_project, ImportProgress, ImportRequest};
use lineloop::playback::{
    ChunkBuffer, ClipOutput, CpalClipOutput, PlaybackHandle, PlaybackProgress, PlaybackService,
};
use lineloop::session::{PlaybackContext, SessionStore};
use lineloop::transcript::{load_transcript, SrtParser, TextSegment};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc as tokio_mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "lineloop")]
#[command(about = "Line-by-line looping playback of long recordings")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Split a recording into chunks and store its transcript
    Import {
        #[arg(short, long)]
        project: String,
        audio: PathBuf,
        transcript: PathBuf,
    },
    /// List the transcript segments of a project
    Segments {
        #[arg(short, long)]
        project: Option<String>,
    },
    /// Interactive playback
    Play {
        #[arg(short, long)]
        project: Option<String>,
        /// 1-based segment to start from
        #[arg(short, long)]
        index: Option<usize>,
    },
}

const HELP: &str = "commands: <n> play line n | c play | n next | p previous | l loop line | s loop scene | sel i j k | x stop | q quit";

#[tokio::main]
async fn main() {
    // Use RUST_LOG if set, otherwise info
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = Config::load();
    let store = ChunkStoreManager::local(&config.library_path);
    let session = Arc::new(SessionStore::open(config.session_path()).await);

    let code = match cli.command {
        Command::Import {
            project,
            audio,
            transcript,
        } => run_import(&config, &store, project, audio, transcript).await,
        Command::Segments { project } => match resolve_project(project, &session) {
            Some(project) => run_segments(&store, &project).await,
            None => 1,
        },
        Command::Play { project, index } => match resolve_project(project, &session) {
            Some(project) => run_play(&config, &store, session, project, index).await,
            None => 1,
        },
    };

    std::process::exit(code);
}

fn resolve_project(project: Option<String>, session: &SessionStore) -> Option<String> {
    let project = project.or_else(|| session.last_project());
    if project.is_none() {
        error!("No project given and no previous project recorded");
    }
    project
}

async fn run_import(
    config: &Config,
    store: &ChunkStoreManager,
    project: String,
    audio_path: PathBuf,
    transcript_path: PathBuf,
) -> i32 {
    let (progress_tx, mut progress_rx) = tokio_mpsc::unbounded_channel::<ImportProgress>();
    let printer = tokio::spawn(async move {
        while let Some(progress) = progress_rx.recv().await {
            println!("{}", progress.status());
        }
    });

    let chunking = ChunkingConfig {
        bitrate_kbps: config.bitrate_kbps,
        ..ChunkingConfig::default()
    };
    let request = ImportRequest {
        project,
        audio_path,
        transcript_path,
    };
    let result = import_project(store, chunking, &request, &progress_tx).await;

    drop(progress_tx);
    let _ = printer.await;

    match result {
        Ok(_) => 0,
        Err(_) => 1,
    }
}

async fn load_segments(store: &ChunkStoreManager, project: &str) -> Option<Vec<TextSegment>> {
    match load_transcript(store, project, &SrtParser::new()).await {
        Ok(segments) => Some(segments),
        Err(e) => {
            error!("Failed to load transcript for {}: {}", project, e);
            None
        }
    }
}

async fn run_segments(store: &ChunkStoreManager, project: &str) -> i32 {
    let Some(segments) = load_segments(store, project).await else {
        return 1;
    };
    for (i, segment) in segments.iter().enumerate() {
        println!(
            "{:>4} [{}] {:>8.2}-{:<8.2} {}",
            i + 1,
            segment.scene_id.0 + 1,
            segment.start_time,
            segment.end_time,
            segment.text.replace('\n', " ")
        );
    }
    0
}

async fn run_play(
    config: &Config,
    store: &ChunkStoreManager,
    session: Arc<SessionStore>,
    project: String,
    index: Option<usize>,
) -> i32 {
    let Some(segments) = load_segments(store, &project).await else {
        return 1;
    };
    if let Err(e) = session.set_last_project(&project).await {
        error!("Failed to save session: {}", e);
    }
    if let Some(index) = index.and_then(|i| i.checked_sub(1)) {
        if let Err(e) = session.set_last_play_index(index).await {
            error!("Failed to save session: {}", e);
        }
    }

    let buffer = ChunkBuffer::new(store.clone(), Arc::new(SymphoniaChunkDecoder::new()));
    let context = PlaybackContext::new(project.clone(), session).with_scene_cue(config.scene_cue);
    let handle = PlaybackService::start(
        buffer,
        segments,
        context,
        Box::new(|| CpalClipOutput::new().map(|output| Box::new(output) as Box<dyn ClipOutput>)),
        tokio::runtime::Handle::current(),
    );

    let mut progress_rx = handle.subscribe_progress();
    tokio::spawn(async move {
        while let Some(progress) = progress_rx.recv().await {
            if let PlaybackProgress::Status(status) = progress {
                println!("{}", status);
            }
        }
    });

    info!("Playing {}", project);
    println!("{}", HELP);
    handle.play_current();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !dispatch(&handle, line.trim()) {
            break;
        }
    }

    handle.shutdown();
    0
}

/// Send one interactive command; false means quit
fn dispatch(handle: &PlaybackHandle, line: &str) -> bool {
    let mut words = line.split_whitespace();
    match words.next() {
        Some("q") => return false,
        Some("c") => handle.play_current(),
        Some("n") => handle.next(),
        Some("p") => handle.previous(),
        Some("l") => handle.loop_current(),
        Some("s") => handle.loop_scene(),
        Some("x") => handle.stop(),
        Some("sel") => handle.selection_loop(parse_selection(words)),
        Some(word) => match word.parse::<usize>() {
            Ok(n) if n > 0 => handle.play_index(n - 1, false),
            _ => println!("{}", HELP),
        },
        None => {}
    }
    true
}

/// 1-based line numbers to 0-based indices; anything else is skipped
fn parse_selection<'a>(words: impl Iterator<Item = &'a str>) -> Vec<usize> {
    words
        .filter_map(|w| w.parse::<usize>().ok())
        .filter_map(|i| i.checked_sub(1))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_is_zero_based_and_skips_junk() {
        assert_eq!(parse_selection("3 1 x 0 12".split_whitespace()), vec![2, 0, 11]);
        assert!(parse_selection("".split_whitespace()).is_empty());
    }

    #[test]
    fn cli_parses_play_arguments() {
        let cli = Cli::try_parse_from(["lineloop", "play", "--project", "talk", "--index", "4"])
            .unwrap();
        match cli.command {
            Command::Play { project, index } => {
                assert_eq!(project.as_deref(), Some("talk"));
                assert_eq!(index, Some(4));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
