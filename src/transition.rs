use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::model::{State, StateId};

/// A side effect to run after a committed mutation or a timed change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Started {
        id: StateId,
        truncated_predecessor: Option<StateId>,
    },
    Ended {
        id: StateId,
        new_current: Option<StateId>,
    },
    Modified {
        before: State,
        after: State,
    },
}

impl Transition {
    pub fn label(&self) -> &'static str {
        match self {
            Transition::Started { .. } => "start",
            Transition::Ended { .. } => "end",
            Transition::Modified { .. } => "modified",
        }
    }
}

/// The venue-side effects of state changes (notifications, door systems, ...).
#[async_trait]
pub trait TransitionService: Send + Sync {
    async fn trigger_start(
        &self,
        id: StateId,
        truncated_predecessor: Option<StateId>,
    ) -> anyhow::Result<()>;

    async fn trigger_end(&self, id: StateId, new_current: Option<StateId>) -> anyhow::Result<()>;

    async fn trigger_modified(&self, before: State, after: State) -> anyhow::Result<()>;
}

async fn deliver(service: &dyn TransitionService, transition: Transition) -> anyhow::Result<()> {
    match transition {
        Transition::Started {
            id,
            truncated_predecessor,
        } => service.trigger_start(id, truncated_predecessor).await,
        Transition::Ended { id, new_current } => service.trigger_end(id, new_current).await,
        Transition::Modified { before, after } => service.trigger_modified(before, after).await,
    }
}

/// Logs every transition; the daemon's default service.
pub struct LoggingTransitionService;

#[async_trait]
impl TransitionService for LoggingTransitionService {
    async fn trigger_start(
        &self,
        id: StateId,
        truncated_predecessor: Option<StateId>,
    ) -> anyhow::Result<()> {
        info!(state = %id, truncated = ?truncated_predecessor, "state started");
        Ok(())
    }

    async fn trigger_end(&self, id: StateId, new_current: Option<StateId>) -> anyhow::Result<()> {
        info!(state = %id, new_current = ?new_current, "state ended");
        Ok(())
    }

    async fn trigger_modified(&self, before: State, after: State) -> anyhow::Result<()> {
        info!(
            state = %after.id,
            before = %serde_json::to_string(&before)?,
            after = %serde_json::to_string(&after)?,
            "state modified"
        );
        Ok(())
    }
}

enum Job {
    Fire(Transition),
    Flush(oneshot::Sender<()>),
}

/// Fire-and-forget queue in front of a [`TransitionService`].
///
/// A single worker task drains the queue in order. Each delivery runs in its
/// own task so a panicking service is logged and counted without taking the
/// worker down. Nothing here ever reaches back into the planning transaction.
#[derive(Clone)]
pub struct TriggerDispatcher {
    tx: mpsc::Sender<Job>,
}

impl TriggerDispatcher {
    pub fn spawn(service: Arc<dyn TransitionService>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(trigger_worker_loop(service, rx));
        Self { tx }
    }

    /// Queue a transition. Drops it with a warning when the queue is full.
    pub fn dispatch(&self, transition: Transition) {
        let label = transition.label();
        match self.tx.try_send(Job::Fire(transition)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("trigger queue full, dropping {label} transition");
                metrics::counter!(crate::observability::TRIGGERS_TOTAL, "trigger" => label, "status" => "dropped")
                    .increment(1);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("trigger worker gone, dropping {label} transition");
            }
        }
    }

    /// Wait until everything queued before this call has been delivered.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Job::Flush(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

async fn trigger_worker_loop(service: Arc<dyn TransitionService>, mut rx: mpsc::Receiver<Job>) {
    while let Some(job) = rx.recv().await {
        let transition = match job {
            Job::Fire(t) => t,
            Job::Flush(done) => {
                let _ = done.send(());
                continue;
            }
        };
        let label = transition.label();
        let svc = service.clone();
        let outcome = tokio::spawn(async move { deliver(svc.as_ref(), transition).await }).await;
        let status = match outcome {
            Ok(Ok(())) => "ok",
            Ok(Err(e)) => {
                warn!("{label} trigger failed: {e:#}");
                "failed"
            }
            Err(e) if e.is_panic() => {
                error!("{label} trigger panicked");
                "panicked"
            }
            Err(e) => {
                error!("{label} trigger aborted: {e}");
                "panicked"
            }
        };
        metrics::counter!(crate::observability::TRIGGERS_TOTAL, "trigger" => label, "status" => status)
            .increment(1);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;
    use ulid::Ulid;

    /// Records every transition it receives.
    #[derive(Default)]
    pub(crate) struct RecordingService {
        pub seen: Mutex<Vec<Transition>>,
    }

    impl RecordingService {
        pub fn take(&self) -> Vec<Transition> {
            std::mem::take(&mut *self.seen.lock().unwrap())
        }
    }

    #[async_trait]
    impl TransitionService for RecordingService {
        async fn trigger_start(
            &self,
            id: StateId,
            truncated_predecessor: Option<StateId>,
        ) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(Transition::Started {
                id,
                truncated_predecessor,
            });
            Ok(())
        }

        async fn trigger_end(&self, id: StateId, new_current: Option<StateId>) -> anyhow::Result<()> {
            self.seen
                .lock()
                .unwrap()
                .push(Transition::Ended { id, new_current });
            Ok(())
        }

        async fn trigger_modified(&self, before: State, after: State) -> anyhow::Result<()> {
            self.seen
                .lock()
                .unwrap()
                .push(Transition::Modified { before, after });
            Ok(())
        }
    }

    struct FaultyService;

    #[async_trait]
    impl TransitionService for FaultyService {
        async fn trigger_start(&self, _: StateId, _: Option<StateId>) -> anyhow::Result<()> {
            panic!("door controller unreachable");
        }

        async fn trigger_end(&self, _: StateId, _: Option<StateId>) -> anyhow::Result<()> {
            anyhow::bail!("notification gateway returned 503")
        }

        async fn trigger_modified(&self, _: State, _: State) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn delivers_in_order() {
        let service = Arc::new(RecordingService::default());
        let dispatcher = TriggerDispatcher::spawn(service.clone(), 16);

        let a = Ulid::new();
        let b = Ulid::new();
        dispatcher.dispatch(Transition::Ended {
            id: a,
            new_current: Some(b),
        });
        dispatcher.dispatch(Transition::Started {
            id: b,
            truncated_predecessor: Some(a),
        });
        dispatcher.flush().await;

        let seen = service.take();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].label(), "end");
        assert_eq!(seen[1].label(), "start");
    }

    #[tokio::test]
    async fn worker_survives_failures_and_panics() {
        let dispatcher = TriggerDispatcher::spawn(Arc::new(FaultyService), 16);
        dispatcher.dispatch(Transition::Started {
            id: Ulid::new(),
            truncated_predecessor: None,
        });
        dispatcher.dispatch(Transition::Ended {
            id: Ulid::new(),
            new_current: None,
        });
        dispatcher.flush().await;

        // Still accepting work afterwards
        dispatcher.dispatch(Transition::Ended {
            id: Ulid::new(),
            new_current: None,
        });
        dispatcher.flush().await;
    }
}
