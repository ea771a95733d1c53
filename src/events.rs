use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::worker::WorkerSnapshot;

/// Minimum spacing between `wip` emissions.
const WIP_THROTTLE: Duration = Duration::from_secs(2);

/// Events the manager publishes to embedders.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// Something went wrong in a background path (worker loop, cache
    /// refresh). Never fatal to the manager.
    Error {
        message: String,
        queue: Option<String>,
        worker: Option<Uuid>,
    },
    /// Snapshot of currently-busy workers, throttled to one per 2 seconds.
    Wip(Vec<WorkerSnapshot>),
}

/// Broadcast fan-out for manager events.
///
/// Emission never blocks and never fails: with no subscribers the event is
/// dropped, which is the desired behavior for an optional observability
/// surface.
#[derive(Clone)]
pub(crate) struct Events {
    sender: broadcast::Sender<QueueEvent>,
    last_wip: Arc<Mutex<Option<Instant>>>,
}

impl Events {
    pub(crate) fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Events {
            sender,
            last_wip: Arc::new(Mutex::new(None)),
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }

    pub(crate) fn emit_error(
        &self,
        message: impl Into<String>,
        queue: Option<String>,
        worker: Option<Uuid>,
    ) {
        let message = message.into();
        debug!(message, ?queue, ?worker, "Emitting error event");
        let _ = self.sender.send(QueueEvent::Error {
            message,
            queue,
            worker,
        });
    }

    /// Emit a `wip` snapshot unless one went out within the throttle window.
    pub(crate) fn emit_wip(&self, snapshot: Vec<WorkerSnapshot>) {
        let mut last = self
            .last_wip
            .lock()
            .expect("wip throttle lock poisoned");

        let now = Instant::now();
        if let Some(prev) = *last {
            if now.duration_since(prev) < WIP_THROTTLE {
                return;
            }
        }
        *last = Some(now);
        drop(last);

        let _ = self.sender.send(QueueEvent::Wip(snapshot));
    }
}
