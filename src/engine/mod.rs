mod error;
mod gate;
mod mutations;
mod queries;
mod recurrence;
mod resolver;
mod store;

pub use error::EngineError;
pub use gate::PlanningGate;
pub use recurrence::{first_on_or_after, local_date, local_instant, occurrence_dates};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono_tz::Tz;
use tokio::sync::{RwLock, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::identity::IdentityProvider;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::transition::{TransitionService, TriggerDispatcher};
use crate::wal::Wal;

use store::Transaction;

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        commit: Commit,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        commits: Vec<Commit>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
///
/// The planning lock means at most one Append is in flight per engine, so in
/// practice batches are small; the writer still owns the file exclusively.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { commit, response } => {
                let mut batch = vec![(commit, response)];
                let mut pending = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { commit, response }) => batch.push((commit, response)),
                        Ok(other) => {
                            pending = Some(other);
                            break;
                        }
                        Err(_) => break, // channel empty, flush batch
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
                let flush_start = Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = pending {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Commit, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (commit, _) in batch {
        if let Err(e) = wal.append_buffered(commit) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<(Commit, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { commits, response } => {
            let result = Wal::write_compact_file(wal.path(), &commits).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { commit, response } => {
            let result = wal.append_buffered(&commit).and_then(|()| wal.flush_sync());
            let _ = response.send(result);
        }
    }
}

/// Everything the engine talks to but does not own.
#[derive(Clone)]
pub struct Collaborators {
    pub clock: Arc<dyn Clock>,
    pub identity: Arc<dyn IdentityProvider>,
    pub transitions: Arc<dyn TransitionService>,
    pub notify: Arc<NotifyHub>,
}

/// The planning engine: one venue's timeline of states and weekly rules.
///
/// Reads take the timeline's read lock only. Every mutation goes through
/// [`Engine::mutate`]: planning gate, working copy, WAL commit, swap, then
/// notification and side effects once the gate is released.
pub struct Engine {
    timeline: RwLock<Timeline>,
    gate: PlanningGate,
    wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    triggers: TriggerDispatcher,
    identity: Arc<dyn IdentityProvider>,
    clock: Arc<dyn Clock>,
    tz: Tz,
}

impl Engine {
    /// Open the engine, replaying the WAL at `wal_path`. Must run inside a tokio runtime.
    pub fn new(wal_path: PathBuf, config: EngineConfig, deps: Collaborators) -> io::Result<Self> {
        let commits = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(64);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut timeline = Timeline::new();
        for commit in &commits {
            for event in &commit.events {
                timeline.apply(event);
            }
        }
        info!(
            "restored {} states and {} rules from {} commits",
            timeline.states.len(),
            timeline.rules.len(),
            commits.len()
        );
        metrics::gauge!(crate::observability::STATES_STORED).set(timeline.states.len() as f64);

        Ok(Self {
            timeline: RwLock::new(timeline),
            gate: PlanningGate::new(config.lock_timeout),
            wal_tx,
            notify: deps.notify,
            triggers: TriggerDispatcher::spawn(deps.transitions, config.trigger_queue),
            identity: deps.identity,
            clock: deps.clock,
            tz: config.tz,
        })
    }

    pub fn now(&self) -> Ms {
        self.clock.now()
    }

    pub fn time_zone(&self) -> Tz {
        self.tz
    }

    /// The trigger queue, shared with the scheduler for timed transitions.
    pub fn triggers(&self) -> &TriggerDispatcher {
        &self.triggers
    }

    /// Write a commit via the background group-commit writer.
    async fn wal_append(&self, commit: Commit) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { commit, response: tx })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    pub(super) async fn require_user(&self, id: UserId) -> Result<User, EngineError> {
        self.identity.get_user(id).await.ok_or(EngineError::UnknownUser(id))
    }

    pub(super) async fn require_admin(&self, id: UserId) -> Result<(), EngineError> {
        if self.identity.is_admin(id).await {
            Ok(())
        } else {
            Err(EngineError::Forbidden(id))
        }
    }

    /// Run one logical mutation as a transaction.
    ///
    /// `op` sees a working copy of the timeline. If it fails, or the WAL append
    /// fails, nothing is kept. On success the copy replaces the committed
    /// timeline, the gate is released, the scheduler is told the plan changed,
    /// and queued transitions go to the trigger worker.
    pub(super) async fn mutate<T>(
        &self,
        name: &'static str,
        op: impl FnOnce(&mut Transaction) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let started = Instant::now();
        let result = self.run_transaction(op).await;
        metrics::histogram!(crate::observability::OPERATION_DURATION_SECONDS, "op" => name)
            .record(started.elapsed().as_secs_f64());

        let status = match &result {
            Ok(_) => "ok",
            Err(e) => e.category(),
        };
        metrics::counter!(crate::observability::OPERATIONS_TOTAL, "op" => name, "status" => status).increment(1);
        match &result {
            Ok(_) => info!("{name} committed"),
            Err(EngineError::Conflict(ids)) => {
                metrics::counter!(crate::observability::CONFLICTS_TOTAL, "op" => name).increment(1);
                warn!("{name} rejected: overlaps {} state(s)", ids.len());
            }
            Err(e @ EngineError::Storage(_)) => error!("{name} rolled back: {e}"),
            Err(e) => warn!("{name} rejected: {e}"),
        }
        result
    }

    async fn run_transaction<T>(
        &self,
        op: impl FnOnce(&mut Transaction) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let guard = self.gate.acquire().await?;
        let now = self.clock.now();
        let mut tx = {
            let committed = self.timeline.read().await;
            Transaction::begin(&committed, now)
        };

        let value = op(&mut tx)?;

        let (timeline, events, transitions) = tx.into_parts();
        if !events.is_empty() {
            let count = events.len();
            self.wal_append(Commit { at: now, events }).await?;
            metrics::gauge!(crate::observability::STATES_STORED).set(timeline.states.len() as f64);
            *self.timeline.write().await = timeline;
            debug!("committed {count} event(s)");
        }
        drop(guard);

        self.notify.plan_changed();
        for transition in transitions {
            self.triggers.dispatch(transition);
        }
        Ok(value)
    }

    /// Rewrite the WAL as a single snapshot commit.
    ///
    /// Holds the planning gate so no commit can land between the snapshot
    /// and the file swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _guard = self.gate.acquire().await?;
        let snapshot = Commit {
            at: self.clock.now(),
            events: self.timeline.read().await.snapshot_events(),
        };

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                commits: vec![snapshot],
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
