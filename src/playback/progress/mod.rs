pub mod handle;

use crate::playback::service::PlaybackState;
pub use handle::PlaybackProgressHandle;

/// Updates published by the playback service
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackProgress {
    StateChanged { state: PlaybackState },
    /// Human-readable status line
    Status(String),
}
