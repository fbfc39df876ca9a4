// Progress reporting
//
// The orchestrator emits a ProgressEvent after every stage transition. Sinks
// only observe; nothing they do can change the outcome of a run.

use crate::error::ErrorCategory;
use crate::models::PairStage;
use tokio::sync::broadcast;

/// How the transition that produced an event went.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StageOutcome {
    /// Pair entered `stage` normally
    Entered,

    /// Pair failed while in the previous stage
    Failed {
        category: ErrorCategory,
        message: String,
    },
}

/// One stage transition for one pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgressEvent {
    pub pair_name: String,
    pub stage: PairStage,
    pub outcome: StageOutcome,
}

impl ProgressEvent {
    pub fn entered(pair_name: impl Into<String>, stage: PairStage) -> Self {
        Self {
            pair_name: pair_name.into(),
            stage,
            outcome: StageOutcome::Entered,
        }
    }

    pub fn failed(
        pair_name: impl Into<String>,
        category: ErrorCategory,
        message: impl Into<String>,
    ) -> Self {
        Self {
            pair_name: pair_name.into(),
            stage: PairStage::Failed,
            outcome: StageOutcome::Failed {
                category,
                message: message.into(),
            },
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, StageOutcome::Failed { .. })
    }
}

/// Receiver of progress events.
///
/// Called from pair tasks, possibly from several at once. Within one pair,
/// events arrive in stage order.
pub trait ProgressSink: Send + Sync {
    fn notify(&self, event: &ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    fn notify(&self, event: &ProgressEvent) {
        self(event)
    }
}

/// Sink that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn notify(&self, _event: &ProgressEvent) {}
}

/// Sink that writes each event to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn notify(&self, event: &ProgressEvent) {
        match &event.outcome {
            StageOutcome::Entered => {
                tracing::info!("[{}] -> {}", event.pair_name, event.stage)
            }
            StageOutcome::Failed { category, message } => {
                tracing::error!("[{}] failed ({}): {}", event.pair_name, category, message)
            }
        }
    }
}

/// Fans events out to any number of tokio subscribers.
///
/// Events sent while nobody is subscribed are dropped; slow subscribers see
/// `RecvError::Lagged` once the buffer is full.
#[derive(Debug, Clone)]
pub struct ProgressBroadcaster {
    tx: broadcast::Sender<ProgressEvent>,
}

impl ProgressBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new(100)
    }
}

impl ProgressSink for ProgressBroadcaster {
    fn notify(&self, event: &ProgressEvent) {
        if self.tx.send(event.clone()).is_err() {
            tracing::trace!("No progress subscribers for {}", event.pair_name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_closure_sink_collects_events() {
        let seen = Mutex::new(Vec::new());
        let sink = |event: &ProgressEvent| seen.lock().unwrap().push(event.stage);

        sink.notify(&ProgressEvent::entered("P1", PairStage::Comparing));
        sink.notify(&ProgressEvent::entered("P1", PairStage::ConvertedCsv));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![PairStage::Comparing, PairStage::ConvertedCsv]
        );
    }

    #[test]
    fn test_failed_event() {
        let event = ProgressEvent::failed("P2", ErrorCategory::Timeout, "diff_label_processor");
        assert!(event.is_failure());
        assert_eq!(event.stage, PairStage::Failed);
        assert!(!ProgressEvent::entered("P2", PairStage::Diffed).is_failure());
    }

    #[tokio::test]
    async fn test_broadcaster_delivers_to_subscribers() {
        let broadcaster = ProgressBroadcaster::default();
        let mut rx1 = broadcaster.subscribe();
        let mut rx2 = broadcaster.subscribe();
        assert_eq!(broadcaster.receiver_count(), 2);

        let event = ProgressEvent::entered("P1", PairStage::Complete);
        broadcaster.notify(&event);

        assert_eq!(rx1.recv().await.unwrap(), event);
        assert_eq!(rx2.recv().await.unwrap(), event);
    }

    #[test]
    fn test_broadcaster_without_subscribers_does_not_panic() {
        let broadcaster = ProgressBroadcaster::new(0);
        broadcaster.notify(&ProgressEvent::entered("P1", PairStage::Comparing));
        LogProgress.notify(&ProgressEvent::failed("P1", ErrorCategory::Io, "disk full"));
        NoProgress.notify(&ProgressEvent::entered("P1", PairStage::Comparing));
    }
}
