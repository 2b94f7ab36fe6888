use crate::playback::chunk_buffer::ChunkBuffer;
use crate::playback::cpal_output::{cue_tone, Clip, ClipEndNotifier, ClipId, ClipOutput};
use crate::playback::progress::PlaybackProgress;
use crate::playback::range::{scene_range, selection_range, RangeInfo, RangeKind};
use crate::playback::service::{PlaybackCommand, PlaybackState};
use crate::session::PlaybackContext;
use crate::transcript::TextSegment;
use tokio::sync::mpsc as tokio_mpsc;
use tracing::{debug, error, info, warn};

/// What is playing right now
#[derive(Debug, Clone)]
enum ControllerState {
    Idle,
    Playing {
        index: usize,
        range: Option<RangeInfo>,
        clip: ClipId,
        single_loop: bool,
        /// Index chained to the end of this clip; None for single loops
        next_index: Option<usize>,
    },
}

/// Plays transcript segments one clip at a time
///
/// A range play chains clips through end-of-clip events: every started clip carries a
/// fresh [`ClipId`], and an end event is acted on only if it names the clip that is
/// currently playing.
pub struct SegmentRangeController {
    buffer: ChunkBuffer,
    segments: Vec<TextSegment>,
    context: PlaybackContext,
    output: Box<dyn ClipOutput>,
    command_tx: tokio_mpsc::UnboundedSender<PlaybackCommand>,
    progress_tx: tokio_mpsc::UnboundedSender<PlaybackProgress>,
    state: ControllerState,
    current_index: usize,
    next_clip_id: u64,
}

impl SegmentRangeController {
    pub fn new(
        buffer: ChunkBuffer,
        segments: Vec<TextSegment>,
        context: PlaybackContext,
        output: Box<dyn ClipOutput>,
        command_tx: tokio_mpsc::UnboundedSender<PlaybackCommand>,
        progress_tx: tokio_mpsc::UnboundedSender<PlaybackProgress>,
    ) -> Self {
        let current_index = context
            .session
            .last_play_index()
            .filter(|&i| i < segments.len())
            .unwrap_or(0);

        Self {
            buffer,
            segments,
            context,
            output,
            command_tx,
            progress_tx,
            state: ControllerState::Idle,
            current_index,
            next_clip_id: 0,
        }
    }

    pub fn segments(&self) -> &[TextSegment] {
        &self.segments
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn active_range(&self) -> Option<RangeInfo> {
        match &self.state {
            ControllerState::Playing { range, .. } => *range,
            ControllerState::Idle => None,
        }
    }

    pub fn state(&self) -> PlaybackState {
        match &self.state {
            ControllerState::Idle => PlaybackState::Idle {
                current_index: self.current_index,
            },
            ControllerState::Playing {
                index,
                range,
                single_loop,
                ..
            } => PlaybackState::Playing {
                index: *index,
                range: *range,
                single_loop: *single_loop,
            },
        }
    }

    fn publish_status(&self, status: impl Into<String>) {
        let _ = self.progress_tx.send(PlaybackProgress::Status(status.into()));
    }

    fn publish_state(&self) {
        let _ = self.progress_tx.send(PlaybackProgress::StateChanged {
            state: self.state(),
        });
    }

    /// Load the first chunk so ranges can be served
    pub async fn prepare(&mut self) -> bool {
        if self.segments.is_empty() {
            self.publish_status("segment not found");
            return false;
        }
        if self.buffer.is_ready()
            && self.buffer.project().as_deref() == Some(self.context.project.as_str())
        {
            return true;
        }

        self.publish_status("initializing");
        if self.buffer.initialize(&self.context.project).await {
            true
        } else {
            self.publish_status(format!("failed to load {}", self.context.project));
            false
        }
    }

    pub async fn handle(&mut self, command: PlaybackCommand) {
        match command {
            PlaybackCommand::PlayIndex { index, single_loop } => {
                self.play_index(index, single_loop, None).await
            }
            PlaybackCommand::PlayCurrent => self.play_current().await,
            PlaybackCommand::LoopCurrent => self.loop_current().await,
            PlaybackCommand::LoopScene => self.loop_scene().await,
            PlaybackCommand::SelectionLoop(indices) => self.selection_loop(&indices).await,
            PlaybackCommand::Next => self.navigate(1).await,
            PlaybackCommand::Previous => self.navigate(-1).await,
            PlaybackCommand::Stop => self.stop(),
            PlaybackCommand::ClipEnded(id) => self.on_clip_ended(id).await,
            PlaybackCommand::Shutdown => self.stop(),
        }
    }

    /// Stop the current clip; its end event is ignored from now on
    pub fn stop(&mut self) {
        if matches!(self.state, ControllerState::Playing { .. }) {
            self.halt();
            self.publish_state();
        }
    }

    /// Stop playback and let a running prefetch finish before the runtime goes away
    pub async fn shutdown(&mut self) {
        self.stop();
        self.buffer.wait_for_prefetch().await;
    }

    /// Drop back to Idle without publishing, returning the range that was active
    fn halt(&mut self) -> Option<RangeInfo> {
        match std::mem::replace(&mut self.state, ControllerState::Idle) {
            ControllerState::Playing { range, clip, .. } => {
                debug!("Stopping {}", clip);
                self.output.stop();
                range
            }
            ControllerState::Idle => None,
        }
    }

    /// Play one segment.
    ///
    /// Out-of-bounds indices are ignored. A single loop repeats the segment until stopped.
    /// Otherwise the segment plays inside a range, chosen from `explicit_range`, then the
    /// range that was active (if it contains `index`), then the segment's scene.
    pub async fn play_index(
        &mut self,
        index: usize,
        single_loop: bool,
        explicit_range: Option<RangeInfo>,
    ) {
        let Some(segment) = self.segments.get(index).cloned() else {
            debug!("Ignoring play of out-of-range index {}", index);
            return;
        };

        let previous_range = self.halt();

        let range = if single_loop {
            None
        } else {
            explicit_range
                .or(previous_range.filter(|r| r.contains(index)))
                .or_else(|| scene_range(&self.segments, index))
                .or_else(|| RangeInfo::new(index, self.segments.len(), RangeKind::Scene))
        };

        let audio = match self
            .buffer
            .get_range(segment.start_time, segment.duration(), &self.context.project)
            .await
        {
            Ok(audio) => audio,
            Err(e) => {
                error!("Failed to load segment {}: {}", index, e);
                self.fail(e.to_string());
                return;
            }
        };

        let cue = match range {
            Some(r) if r.kind == RangeKind::Scene && r.is_first(index) && self.context.scene_cue => {
                Some(cue_tone(audio.sample_rate, audio.channel_count()))
            }
            _ => None,
        };

        self.next_clip_id += 1;
        let clip = ClipId(self.next_clip_id);
        let notifier = ClipEndNotifier::new(clip, self.command_tx.clone());

        let started = self.output.start(
            Clip {
                audio,
                looping: single_loop,
                cue,
            },
            notifier,
        );
        if let Err(e) = started {
            error!("Failed to start segment {}: {}", index, e);
            self.fail(e.to_string());
            return;
        }

        let next_index = range.map(|r| r.next_index(index));
        self.state = ControllerState::Playing {
            index,
            range,
            clip,
            single_loop,
            next_index,
        };
        self.current_index = index;

        if let Err(e) = self.context.session.set_last_play_index(index).await {
            warn!("Failed to persist play index: {}", e);
        }

        info!("Playing segment {} as {}", index, clip);
        self.publish_state();
        self.publish_status(self.status_line());
    }

    fn fail(&mut self, message: String) {
        self.state = ControllerState::Idle;
        self.publish_status(message);
        self.publish_state();
    }

    /// Loop the covering window of `indices`, starting at the lowest one
    pub async fn selection_loop(&mut self, indices: &[usize]) {
        match selection_range(indices, self.segments.len()) {
            Some((range, start)) => self.play_index(start, false, Some(range)).await,
            None => debug!("Ignoring empty selection"),
        }
    }

    /// Single-loop the segment `delta` away from the current one, if there is one
    pub async fn navigate(&mut self, delta: isize) {
        let Some(target) = self.current_index.checked_add_signed(delta) else {
            return;
        };
        if target < self.segments.len() {
            self.play_index(target, true, None).await;
        }
    }

    /// Resume at the current segment, following its scene
    pub async fn play_current(&mut self) {
        let range = scene_range(&self.segments, self.current_index);
        self.play_index(self.current_index, false, range).await;
    }

    pub async fn loop_current(&mut self) {
        self.play_index(self.current_index, true, None).await;
    }

    /// Loop the current segment's scene from its first segment
    pub async fn loop_scene(&mut self) {
        if let Some(range) = scene_range(&self.segments, self.current_index) {
            self.play_index(range.begin_idx, false, Some(range)).await;
        }
    }

    pub async fn on_clip_ended(&mut self, id: ClipId) {
        let next = match &self.state {
            ControllerState::Playing {
                clip,
                single_loop: false,
                next_index: Some(next),
                ..
            } if *clip == id => *next,
            _ => {
                debug!("Ignoring end of stale {}", id);
                return;
            }
        };
        self.play_index(next, false, None).await;
    }

    fn status_line(&self) -> String {
        let mut status = format!(
            "current: {}/{}",
            self.current_index + 1,
            self.segments.len()
        );
        if let Some(range) = self.active_range() {
            status.push_str(&format!(
                " [{}-{}] [{}]",
                range.begin_idx + 1,
                range.end_idx,
                range.kind.label()
            ));
        }
        status
    }
}
