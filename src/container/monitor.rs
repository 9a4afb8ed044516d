//! Lifecycle monitor
//!
//! Internal callers post events onto a bounded channel; one background loop
//! hands each event to the registered handler. A failing handler is logged
//! and the event is dropped, never retried, so handlers must be idempotent.

use crate::error::{HullError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Event posted to the monitor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    /// The runtime reported an OOM kill
    Oom { container_id: String },
    /// The container process exited
    Exit {
        container_id: String,
        pid: u32,
        exit_code: i64,
    },
}

impl MonitorEvent {
    pub fn container_id(&self) -> &str {
        match self {
            MonitorEvent::Oom { container_id } | MonitorEvent::Exit { container_id, .. } => {
                container_id
            }
        }
    }
}

/// Handler invoked by the monitor loop
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: MonitorEvent) -> Result<()>;
}

/// Posting side of the monitor
#[derive(Clone)]
pub struct Monitor {
    sender: mpsc::Sender<MonitorEvent>,
}

impl Monitor {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<MonitorEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    /// Post an event, waiting for room in the channel
    pub async fn post(&self, event: MonitorEvent) -> Result<()> {
        self.sender
            .send(event)
            .await
            .map_err(|_| HullError::Internal("monitor is not running".to_string()))
    }

    /// Post without waiting; a full channel is `ResourceExhausted`
    pub fn try_post(&self, event: MonitorEvent) -> Result<()> {
        self.sender.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                HullError::ResourceExhausted("monitor channel is full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => {
                HullError::Internal("monitor is not running".to_string())
            }
        })
    }
}

/// Consume events until cancelled or every sender is gone
pub async fn run_monitor(
    mut receiver: mpsc::Receiver<MonitorEvent>,
    handler: Arc<dyn EventHandler>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = receiver.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        debug!(container = %event.container_id(), ?event, "monitor event");
        if let Err(e) = handler.handle(event.clone()).await {
            warn!(container = %event.container_id(), "failed to handle monitor event: {}", e);
        }
    }
    debug!("monitor loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<MonitorEvent>>,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle(&self, event: MonitorEvent) -> Result<()> {
            let fail = event.container_id() == "bad";
            self.seen.lock().unwrap().push(event);
            if fail {
                return Err(HullError::Internal("handler failed".into()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_handler_failure_does_not_stop_loop() {
        let (monitor, rx) = Monitor::new(4);
        let recorder = Arc::new(Recorder::default());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_monitor(rx, recorder.clone(), cancel.clone()));

        monitor
            .post(MonitorEvent::Oom {
                container_id: "bad".into(),
            })
            .await
            .unwrap();
        monitor
            .post(MonitorEvent::Exit {
                container_id: "good".into(),
                pid: 100,
                exit_code: 1,
            })
            .await
            .unwrap();
        drop(monitor);
        task.await.unwrap();

        let seen = recorder.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].container_id(), "good");
    }

    #[tokio::test]
    async fn test_try_post_full_channel() {
        let (monitor, _rx) = Monitor::new(1);
        monitor
            .try_post(MonitorEvent::Oom {
                container_id: "a".into(),
            })
            .unwrap();
        let err = monitor
            .try_post(MonitorEvent::Oom {
                container_id: "b".into(),
            })
            .unwrap_err();
        assert!(matches!(err, HullError::ResourceExhausted(_)));
    }
}
