use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::model::{Ms, State, StateId};
use crate::transition::Transition;

/// Longest the scheduler sleeps without re-reading the plan, so a wall
/// clock that jumps is caught up with.
const MAX_SLEEP: Duration = Duration::from_secs(60);

/// What the scheduler last saw in force.
///
/// Mutations fire their own triggers. After a plan change the scheduler only
/// fires what time did on its own before the change landed.
#[derive(Debug, Default)]
pub struct SchedulerState {
    /// Current state with the planned end it had when seen.
    current: Option<(StateId, Ms)>,
    /// Next state due to start, as of the last wake-up computation.
    upcoming: Option<StateId>,
}

impl SchedulerState {
    pub fn last_current(&self) -> Option<StateId> {
        self.current.map(|(id, _)| id)
    }

    fn adopt(&mut self, current: Option<&State>) {
        self.current = current.map(|s| (s.id, s.planned_end));
    }

    /// Remember which state is due to start next.
    pub fn expect(&mut self, upcoming: Option<&State>) {
        self.upcoming = upcoming.map(|s| s.id);
    }

    /// Adopt the plan after a mutation.
    ///
    /// `previous` is a fresh read of the state that was current before. It is
    /// reported ended only if it ran out by itself: still stored, not closed,
    /// with the planned end seen before, and that end reached. The new current
    /// state is reported started only if it is the one that was due next.
    pub fn resync(&mut self, now: Ms, current: Option<&State>, previous: Option<&State>) -> Vec<Transition> {
        let now_current = current.map(|s| s.id);
        let mut fired = Vec::new();
        if let (Some((id, end)), Some(prev)) = (self.current, previous) {
            let ran_out = prev.id == id && prev.ended_at.is_none() && prev.planned_end == end && end <= now;
            if ran_out && now_current != Some(id) {
                fired.push(Transition::Ended {
                    id,
                    new_current: now_current,
                });
            }
        }
        if let Some(id) = now_current {
            if self.upcoming == Some(id) && self.last_current() != Some(id) {
                fired.push(Transition::Started {
                    id,
                    truncated_predecessor: None,
                });
            }
        }
        self.adopt(current);
        fired
    }

    /// Compare `current` with what was seen last and return the transitions
    /// time has caused since. Observing the same state twice yields nothing.
    pub fn observe(&mut self, current: Option<&State>) -> Vec<Transition> {
        let now_current = current.map(|s| s.id);
        if now_current == self.last_current() {
            self.adopt(current);
            return Vec::new();
        }
        let mut fired = Vec::new();
        if let Some(id) = self.last_current() {
            fired.push(Transition::Ended {
                id,
                new_current: now_current,
            });
        }
        if let Some(id) = now_current {
            fired.push(Transition::Started {
                id,
                truncated_predecessor: None,
            });
        }
        self.adopt(current);
        fired
    }
}

/// The next instant something changes by itself: the current state's planned
/// end or the next planned start, whichever comes first.
pub fn next_wakeup(current: Option<&State>, nearest: Option<&State>) -> Option<Ms> {
    let end = current.map(|s| s.planned_end);
    let start = nearest.map(|s| s.start);
    match (end, start) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn dispatch(engine: &Engine, fired: Vec<Transition>) -> usize {
    let count = fired.len();
    for transition in fired {
        info!("scheduler: {} {:?}", transition.label(), transition);
        metrics::counter!(crate::observability::SCHEDULER_TRANSITIONS_TOTAL, "trigger" => transition.label())
            .increment(1);
        engine.triggers().dispatch(transition);
    }
    count
}

/// Observe the plan once and dispatch whatever time changed. Returns how
/// many transitions fired.
pub async fn tick(engine: &Engine, state: &mut SchedulerState) -> usize {
    let current = engine.get_current().await;
    let fired = state.observe(current.as_ref());
    dispatch(engine, fired)
}

/// Catch up with a plan change. Returns how many transitions fired.
pub async fn reconcile(engine: &Engine, state: &mut SchedulerState) -> usize {
    let current = engine.get_current().await;
    let previous = match state.last_current() {
        Some(id) => engine.get_state(id).await,
        None => None,
    };
    let fired = state.resync(engine.now(), current.as_ref(), previous.as_ref());
    if !fired.is_empty() {
        debug!("scheduler: {} time-driven transition(s) raced a plan change", fired.len());
    }
    dispatch(engine, fired)
}

async fn sleep_duration(engine: &Engine, state: &mut SchedulerState) -> Duration {
    let current = engine.get_current().await;
    let nearest = engine.get_nearest(None, None).await;
    state.expect(nearest.as_ref());
    match next_wakeup(current.as_ref(), nearest.as_ref()) {
        Some(at) => {
            let wait = Duration::from_millis((at - engine.now()).max(0) as u64);
            wait.min(MAX_SLEEP)
        }
        None => MAX_SLEEP,
    }
}

/// Background task firing start/end transitions at the planned instants.
///
/// Sleeps until the next planned boundary or until the plan changes,
/// whichever is first. Exits when the engine's notify hub is dropped.
pub async fn run_scheduler(engine: Arc<Engine>) {
    let mut changes = engine.notify.subscribe();
    let mut state = SchedulerState::default();
    state.resync(engine.now(), engine.get_current().await.as_ref(), None);

    loop {
        let wait = sleep_duration(&engine, &mut state).await;
        debug!("scheduler sleeping {wait:?}");
        tokio::select! {
            biased;
            _ = tokio::time::sleep(wait) => {
                tick(&engine, &mut state).await;
            }
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                reconcile(&engine, &mut state).await;
            }
        }
    }
}

/// Background task that compacts the WAL once enough commits have piled up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} commits"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::EngineConfig;
    use crate::engine::Collaborators;
    use crate::identity::InMemoryDirectory;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use crate::transition::tests::RecordingService;
    use std::path::PathBuf;
    use ulid::Ulid;

    const H: Ms = 3_600_000;
    const M: Ms = 60_000;
    /// 2026-01-05T00:00:00Z
    const DAY0: Ms = 1_767_571_200_000;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("venueplan_test_scheduler");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn state(start: Ms, end: Ms) -> State {
        State {
            id: Ulid::new(),
            creator: Ulid::new(),
            kind: StateKind::OpenPublic,
            start,
            planned_end: end,
            ended_at: None,
            closed_by: None,
            note_internal: None,
            note_public: None,
            next_id: None,
            rule_id: None,
            event_id: None,
        }
    }

    #[test]
    fn observe_is_idempotent() {
        let a = state(DAY0, DAY0 + H);
        let mut s = SchedulerState::default();
        assert_eq!(s.observe(Some(&a)).len(), 1);
        assert!(s.observe(Some(&a)).is_empty());
    }

    #[test]
    fn handover_ends_then_starts() {
        let a = state(DAY0, DAY0 + H);
        let b = state(DAY0 + H, DAY0 + 2 * H);
        let mut s = SchedulerState::default();
        s.resync(DAY0, Some(&a), None);
        assert_eq!(
            s.observe(Some(&b)),
            vec![
                Transition::Ended {
                    id: a.id,
                    new_current: Some(b.id)
                },
                Transition::Started {
                    id: b.id,
                    truncated_predecessor: None
                },
            ]
        );
        assert_eq!(
            s.observe(None),
            vec![Transition::Ended {
                id: b.id,
                new_current: None
            }]
        );
    }

    #[test]
    fn plan_change_after_an_end_still_reports_it() {
        let a = state(DAY0, DAY0 + H);
        let mut s = SchedulerState::default();
        s.resync(DAY0, Some(&a), None);
        assert_eq!(
            s.resync(DAY0 + H + 5 * M, None, Some(&a)),
            vec![Transition::Ended {
                id: a.id,
                new_current: None
            }]
        );
        assert_eq!(s.last_current(), None);
    }

    #[test]
    fn plan_change_that_ended_the_state_itself_fires_nothing() {
        let a = state(DAY0, DAY0 + 2 * H);
        let mut s = SchedulerState::default();
        s.resync(DAY0, Some(&a), None);

        // Closed early
        let mut closed = a.clone();
        closed.ended_at = Some(DAY0 + H);
        let mut fresh = SchedulerState::default();
        fresh.resync(DAY0, Some(&a), None);
        assert!(fresh.resync(DAY0 + H, None, Some(&closed)).is_empty());

        // Cut short by a plan starting now
        let mut cut = a.clone();
        cut.planned_end = DAY0 + H;
        let b = state(DAY0 + H, DAY0 + 3 * H);
        assert!(s.resync(DAY0 + H, Some(&b), Some(&cut)).is_empty());
        assert_eq!(s.last_current(), Some(b.id));
    }

    #[test]
    fn plan_change_after_a_start_still_reports_it() {
        let a = state(DAY0, DAY0 + H);
        let b = state(DAY0 + H, DAY0 + 2 * H);
        let mut s = SchedulerState::default();
        s.resync(DAY0, Some(&a), None);
        s.expect(Some(&b));
        assert_eq!(
            s.resync(DAY0 + H + M, Some(&b), Some(&a)),
            vec![
                Transition::Ended {
                    id: a.id,
                    new_current: Some(b.id)
                },
                Transition::Started {
                    id: b.id,
                    truncated_predecessor: None
                },
            ]
        );
        // Nothing is left for the next tick
        assert!(s.observe(Some(&b)).is_empty());
    }

    #[test]
    fn wakeup_picks_earliest_boundary() {
        let current = state(DAY0, DAY0 + 3 * H);
        let next = state(DAY0 + 5 * H, DAY0 + 6 * H);
        assert_eq!(next_wakeup(Some(&current), Some(&next)), Some(DAY0 + 3 * H));
        assert_eq!(next_wakeup(None, Some(&next)), Some(DAY0 + 5 * H));
        assert_eq!(next_wakeup(None, None), None);
    }

    #[tokio::test]
    async fn tick_fires_time_driven_transitions() {
        let directory = Arc::new(InMemoryDirectory::new());
        let creator = Ulid::new();
        directory.insert(User {
            id: creator,
            name: "Ola".into(),
            roles: vec![],
        });
        let clock = Arc::new(ManualClock::new(DAY0 + 8 * H));
        let service = Arc::new(RecordingService::default());
        let engine = Engine::new(
            test_wal_path("tick.wal"),
            EngineConfig::default(),
            Collaborators {
                clock: clock.clone(),
                identity: directory,
                transitions: service.clone(),
                notify: Arc::new(NotifyHub::new()),
            },
        )
        .unwrap();

        let plan = |start: Ms, end: Ms| NewState {
            creator,
            kind: StateKind::OpenPublic,
            start: Some(start),
            end: PlannedEnd::At(end),
            note_internal: None,
            note_public: None,
            event_id: None,
        };
        let a = engine.plan(plan(DAY0 + 9 * H, DAY0 + 10 * H)).await.unwrap().id;
        let b = engine.plan(plan(DAY0 + 10 * H, DAY0 + 11 * H)).await.unwrap().id;

        let mut sched = SchedulerState::default();
        sched.resync(engine.now(), engine.get_current().await.as_ref(), None);
        assert_eq!(tick(&engine, &mut sched).await, 0);

        clock.set(DAY0 + 9 * H);
        assert_eq!(tick(&engine, &mut sched).await, 1);
        clock.set(DAY0 + 10 * H);
        assert_eq!(tick(&engine, &mut sched).await, 2);
        // repeated wake-up at the same instant does nothing
        assert_eq!(tick(&engine, &mut sched).await, 0);
        clock.set(DAY0 + 12 * H);
        assert_eq!(tick(&engine, &mut sched).await, 1);

        engine.triggers().flush().await;
        assert_eq!(
            service.take(),
            vec![
                Transition::Started {
                    id: a,
                    truncated_predecessor: None
                },
                Transition::Ended {
                    id: a,
                    new_current: Some(b)
                },
                Transition::Started {
                    id: b,
                    truncated_predecessor: None
                },
                Transition::Ended {
                    id: b,
                    new_current: None
                },
            ]
        );
    }

    #[tokio::test]
    async fn reconcile_catches_boundaries_crossed_before_a_change() {
        let directory = Arc::new(InMemoryDirectory::new());
        let creator = Ulid::new();
        directory.insert(User {
            id: creator,
            name: "Ola".into(),
            roles: vec![],
        });
        let clock = Arc::new(ManualClock::new(DAY0 + 8 * H));
        let service = Arc::new(RecordingService::default());
        let engine = Engine::new(
            test_wal_path("reconcile.wal"),
            EngineConfig::default(),
            Collaborators {
                clock: clock.clone(),
                identity: directory,
                transitions: service.clone(),
                notify: Arc::new(NotifyHub::new()),
            },
        )
        .unwrap();
        let plan = |start: Ms, end: Ms| NewState {
            creator,
            kind: StateKind::OpenPublic,
            start: Some(start),
            end: PlannedEnd::At(end),
            note_internal: None,
            note_public: None,
            event_id: None,
        };
        let a = engine.plan(plan(DAY0 + 9 * H, DAY0 + 10 * H)).await.unwrap().id;
        let b = engine.plan(plan(DAY0 + 10 * H, DAY0 + 11 * H)).await.unwrap().id;

        let mut sched = SchedulerState::default();
        clock.set(DAY0 + 9 * H);
        assert_eq!(tick(&engine, &mut sched).await, 1);
        sleep_duration(&engine, &mut sched).await;

        // The handover to b is due, but an unrelated plan lands first
        clock.set(DAY0 + 10 * H + 5 * M);
        engine.plan(plan(DAY0 + 12 * H, DAY0 + 13 * H)).await.unwrap();
        assert_eq!(reconcile(&engine, &mut sched).await, 2);
        assert_eq!(tick(&engine, &mut sched).await, 0);

        engine.triggers().flush().await;
        assert_eq!(
            service.take(),
            vec![
                Transition::Started {
                    id: a,
                    truncated_predecessor: None
                },
                Transition::Ended {
                    id: a,
                    new_current: Some(b)
                },
                Transition::Started {
                    id: b,
                    truncated_predecessor: None
                },
            ]
        );
    }

    #[tokio::test]
    async fn reconcile_after_close_fires_nothing_more() {
        let directory = Arc::new(InMemoryDirectory::new());
        let creator = Ulid::new();
        directory.insert(User {
            id: creator,
            name: "Ola".into(),
            roles: vec![],
        });
        let clock = Arc::new(ManualClock::new(DAY0 + 9 * H));
        let service = Arc::new(RecordingService::default());
        let engine = Engine::new(
            test_wal_path("reconcile_close.wal"),
            EngineConfig::default(),
            Collaborators {
                clock: clock.clone(),
                identity: directory,
                transitions: service.clone(),
                notify: Arc::new(NotifyHub::new()),
            },
        )
        .unwrap();
        engine
            .plan(NewState {
                creator,
                kind: StateKind::OpenPublic,
                start: None,
                end: PlannedEnd::At(DAY0 + 12 * H),
                note_internal: None,
                note_public: None,
                event_id: None,
            })
            .await
            .unwrap();

        let mut sched = SchedulerState::default();
        sched.resync(engine.now(), engine.get_current().await.as_ref(), None);
        sleep_duration(&engine, &mut sched).await;

        clock.set(DAY0 + 10 * H);
        engine.close(creator).await.unwrap();
        assert_eq!(reconcile(&engine, &mut sched).await, 0);
        assert_eq!(tick(&engine, &mut sched).await, 0);
    }

    #[tokio::test]
    async fn sleep_is_capped() {
        let engine = Engine::new(
            test_wal_path("sleep_cap.wal"),
            EngineConfig::default(),
            Collaborators {
                clock: Arc::new(ManualClock::new(DAY0)),
                identity: Arc::new(InMemoryDirectory::new()),
                transitions: Arc::new(RecordingService::default()),
                notify: Arc::new(NotifyHub::new()),
            },
        )
        .unwrap();
        assert_eq!(sleep_duration(&engine, &mut SchedulerState::default()).await, MAX_SLEEP);
    }
}
