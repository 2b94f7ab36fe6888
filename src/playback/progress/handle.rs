use super::PlaybackProgress;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc as tokio_mpsc;
use tracing::info;

type Subscribers = Arc<Mutex<Vec<tokio_mpsc::UnboundedSender<PlaybackProgress>>>>;

fn lock(subscribers: &Subscribers) -> MutexGuard<'_, Vec<tokio_mpsc::UnboundedSender<PlaybackProgress>>> {
    subscribers.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fans playback progress out to any number of subscribers
#[derive(Clone)]
pub struct PlaybackProgressHandle {
    subscribers: Subscribers,
}

impl PlaybackProgressHandle {
    /// Forward everything arriving on `progress_rx` to subscribers from a task on `runtime_handle`
    pub fn new(
        mut progress_rx: tokio_mpsc::UnboundedReceiver<PlaybackProgress>,
        runtime_handle: tokio::runtime::Handle,
    ) -> Self {
        let subscribers: Subscribers = Arc::new(Mutex::new(Vec::new()));
        let dispatch_to = subscribers.clone();

        runtime_handle.spawn(async move {
            while let Some(progress) = progress_rx.recv().await {
                // Dropped receivers fail the send and are forgotten
                lock(&dispatch_to).retain(|tx| tx.send(progress.clone()).is_ok());
            }
            info!("Playback progress channel closed, exiting");
        });

        Self { subscribers }
    }

    /// Receive every update published after this call.
    /// Dropping the receiver ends the subscription.
    pub fn subscribe_all(&self) -> tokio_mpsc::UnboundedReceiver<PlaybackProgress> {
        let (tx, rx) = tokio_mpsc::unbounded_channel();
        lock(&self.subscribers).push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fans_out_and_forgets_dropped_subscribers() {
        let (tx, rx) = tokio_mpsc::unbounded_channel();
        let handle = PlaybackProgressHandle::new(rx, tokio::runtime::Handle::current());

        let mut first = handle.subscribe_all();
        let second = handle.subscribe_all();
        drop(second);

        tx.send(PlaybackProgress::Status("initializing".to_string()))
            .unwrap();
        assert_eq!(
            first.recv().await,
            Some(PlaybackProgress::Status("initializing".to_string()))
        );
        assert_eq!(handle.subscriber_count(), 1);
    }
}
