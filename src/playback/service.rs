use crate::playback::chunk_buffer::ChunkBuffer;
use crate::playback::controller::SegmentRangeController;
use crate::playback::cpal_output::{ClipId, ClipOutput, OutputError};
use crate::playback::progress::{PlaybackProgress, PlaybackProgressHandle};
use crate::playback::range::RangeInfo;
use crate::session::PlaybackContext;
use crate::transcript::TextSegment;
use tokio::sync::mpsc as tokio_mpsc;
use tracing::{error, info, warn};

/// Playback commands sent to the service
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackCommand {
    PlayIndex { index: usize, single_loop: bool },
    /// Resume at the current segment inside its scene
    PlayCurrent,
    LoopCurrent,
    LoopScene,
    SelectionLoop(Vec<usize>),
    Next,
    Previous,
    Stop,
    /// Posted by the output when a clip has played to its end
    ClipEnded(ClipId),
    Shutdown,
}

/// Current playback state
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackState {
    Idle {
        current_index: usize,
    },
    Playing {
        index: usize,
        range: Option<RangeInfo>,
        single_loop: bool,
    },
}

/// Builds the clip output on the playback thread
pub type OutputFactory = Box<dyn FnOnce() -> Result<Box<dyn ClipOutput>, OutputError> + Send>;

/// Handle to the playback service for sending commands
#[derive(Clone)]
pub struct PlaybackHandle {
    command_tx: tokio_mpsc::UnboundedSender<PlaybackCommand>,
    progress_handle: PlaybackProgressHandle,
}

impl PlaybackHandle {
    pub fn play_index(&self, index: usize, single_loop: bool) {
        let _ = self.command_tx.send(PlaybackCommand::PlayIndex { index, single_loop });
    }

    pub fn play_current(&self) {
        let _ = self.command_tx.send(PlaybackCommand::PlayCurrent);
    }

    pub fn loop_current(&self) {
        let _ = self.command_tx.send(PlaybackCommand::LoopCurrent);
    }

    pub fn loop_scene(&self) {
        let _ = self.command_tx.send(PlaybackCommand::LoopScene);
    }

    pub fn selection_loop(&self, indices: Vec<usize>) {
        let _ = self.command_tx.send(PlaybackCommand::SelectionLoop(indices));
    }

    pub fn next(&self) {
        let _ = self.command_tx.send(PlaybackCommand::Next);
    }

    pub fn previous(&self) {
        let _ = self.command_tx.send(PlaybackCommand::Previous);
    }

    pub fn stop(&self) {
        let _ = self.command_tx.send(PlaybackCommand::Stop);
    }

    /// Stop playback and end the service thread
    pub fn shutdown(&self) {
        let _ = self.command_tx.send(PlaybackCommand::Shutdown);
    }

    pub fn subscribe_progress(&self) -> tokio_mpsc::UnboundedReceiver<PlaybackProgress> {
        self.progress_handle.subscribe_all()
    }
}

/// Playback service that runs a segment controller on its own thread
pub struct PlaybackService {
    controller: SegmentRangeController,
    command_rx: tokio_mpsc::UnboundedReceiver<PlaybackCommand>,
}

impl PlaybackService {
    pub fn start(
        buffer: ChunkBuffer,
        segments: Vec<TextSegment>,
        context: PlaybackContext,
        output_factory: OutputFactory,
        runtime_handle: tokio::runtime::Handle,
    ) -> PlaybackHandle {
        let (command_tx, command_rx) = tokio_mpsc::unbounded_channel();
        let (progress_tx, progress_rx) = tokio_mpsc::unbounded_channel();

        let progress_handle = PlaybackProgressHandle::new(progress_rx, runtime_handle);

        let handle = PlaybackHandle {
            command_tx: command_tx.clone(),
            progress_handle,
        };

        // The service runs on a dedicated thread (CPAL Stream isn't Send-safe)
        std::thread::spawn(move || {
            let rt = match tokio::runtime::Runtime::new() {
                Ok(rt) => rt,
                Err(e) => {
                    error!("Failed to create playback runtime: {}", e);
                    return;
                }
            };

            rt.block_on(async move {
                let output = match output_factory() {
                    Ok(output) => output,
                    Err(e) => {
                        error!("Failed to initialize audio output: {}", e);
                        let _ = progress_tx.send(PlaybackProgress::Status(e.to_string()));
                        return;
                    }
                };

                let controller = SegmentRangeController::new(
                    buffer,
                    segments,
                    context,
                    output,
                    command_tx,
                    progress_tx,
                );

                let mut service = PlaybackService {
                    controller,
                    command_rx,
                };
                service.run().await;
            });
        });

        handle
    }

    async fn run(&mut self) {
        info!("PlaybackService started");

        if !self.controller.prepare().await {
            warn!("PlaybackService: buffer not ready, play commands will fail until it is");
        }

        while let Some(command) = self.command_rx.recv().await {
            if command == PlaybackCommand::Shutdown {
                self.controller.shutdown().await;
                break;
            }
            self.controller.handle(command).await;
        }

        info!("PlaybackService stopped");
    }
}
