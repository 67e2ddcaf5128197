use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_test::{assert_err, assert_ok};
use ulid::Ulid;

use venueplan::clock::ManualClock;
use venueplan::config::EngineConfig;
use venueplan::engine::{Collaborators, Engine, EngineError};
use venueplan::identity::InMemoryDirectory;
use venueplan::model::*;
use venueplan::notify::NotifyHub;
use venueplan::transition::LoggingTransitionService;

const H: Ms = 3_600_000;
/// 2026-01-05T00:00:00Z
const DAY0: Ms = 1_767_571_200_000;

// ── Test infrastructure ──────────────────────────────────────

struct Venue {
    dir: PathBuf,
    clock: Arc<ManualClock>,
    directory: Arc<InMemoryDirectory>,
    user: UserId,
}

impl Venue {
    fn new() -> Self {
        let dir = std::env::temp_dir().join(format!("venueplan_int_test_{}", Ulid::new()));
        std::fs::create_dir_all(&dir).unwrap();
        let directory = Arc::new(InMemoryDirectory::new());
        let user = Ulid::new();
        directory.insert(User {
            id: user,
            name: "Robin".into(),
            roles: vec![],
        });
        Self {
            dir,
            clock: Arc::new(ManualClock::new(DAY0 + 8 * H)),
            directory,
            user,
        }
    }

    fn open(&self, lock_timeout: Duration) -> Arc<Engine> {
        let engine = Engine::new(
            self.dir.join("plan.wal"),
            EngineConfig {
                lock_timeout,
                ..Default::default()
            },
            Collaborators {
                clock: self.clock.clone(),
                identity: self.directory.clone(),
                transitions: Arc::new(LoggingTransitionService),
                notify: Arc::new(NotifyHub::new()),
            },
        )
        .unwrap();
        Arc::new(engine)
    }

    fn slot(&self, start: Ms, end: Ms) -> NewState {
        NewState {
            creator: self.user,
            kind: StateKind::Private,
            start: Some(start),
            end: PlannedEnd::At(end),
            note_internal: None,
            note_public: Some("birthday".into()),
            event_id: None,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overlapping_plans_race_one_winner() {
    let venue = Venue::new();
    let engine = venue.open(Duration::from_secs(5));

    let mut handles = Vec::new();
    for i in 0..8 {
        let engine = engine.clone();
        // Same start, different ends
        let req = venue.slot(DAY0 + 11 * H, DAY0 + 12 * H + i * 10 * 60_000);
        handles.push(tokio::spawn(async move { engine.plan(req).await }));
    }

    let mut winners = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => winners += 1,
            Err(EngineError::Conflict(ids)) => assert_eq!(ids.len(), 1),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(engine.list_states(DAY0, DAY0 + 24 * H).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disjoint_plans_all_commit_without_overlap() {
    let venue = Venue::new();
    let engine = venue.open(Duration::from_secs(5));

    let mut handles = Vec::new();
    for i in 0..24 {
        let engine = engine.clone();
        let req = venue.slot(DAY0 + 9 * H + i * 30 * 60_000, DAY0 + 9 * H + (i + 1) * 30 * 60_000);
        handles.push(tokio::spawn(async move { engine.plan(req).await }));
    }
    for h in handles {
        assert_ok!(h.await.unwrap());
    }

    let states = engine.list_states(DAY0, DAY0 + 24 * H).await.unwrap();
    assert_eq!(states.len(), 24);
    for pair in states.windows(2) {
        assert!(pair[0].planned_end <= pair[1].start);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rule_materialization_races_single_plans() {
    let venue = Venue::new();
    let engine = venue.open(Duration::from_secs(5));

    let rule = {
        let engine = engine.clone();
        let rule = NewRule {
            creator: venue.user,
            kind: StateKind::OpenTearoom,
            day_of_week: chrono::Weekday::Tue,
            effective_from: chrono::NaiveDate::from_ymd_opt(2026, 1, 6).unwrap(),
            effective_to: chrono::NaiveDate::from_ymd_opt(2026, 3, 31).unwrap(),
            time_from: chrono::NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
            time_to: chrono::NaiveTime::from_hms_opt(21, 0, 0).unwrap(),
            note_internal: None,
            note_public: None,
        };
        tokio::spawn(async move { engine.create_rule(rule).await })
    };

    // One plan per Tuesday evening, starting with the rule's occurrence
    let mut handles = Vec::new();
    for week in 0..12 {
        let engine = engine.clone();
        let tuesday = DAY0 + 24 * H + week * 7 * 24 * H;
        let req = venue.slot(tuesday + 18 * H, tuesday + 20 * H);
        handles.push(tokio::spawn(async move { engine.plan(req).await }));
    }

    let outcome = assert_ok!(rule.await.unwrap());
    let mut plans_won = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => plans_won += 1,
            Err(EngineError::Conflict(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    // Every Tuesday went to exactly one side
    assert_eq!(outcome.created.len() + outcome.overlapping.len(), 13);
    assert_eq!(outcome.overlapping.len(), plans_won);
    let states = engine.list_states(DAY0, DAY0 + 100 * 24 * H).await.unwrap();
    assert_eq!(states.len(), 13);
    for pair in states.windows(2) {
        assert!(pair[0].planned_end <= pair[1].start);
    }
}

#[tokio::test]
async fn restart_restores_plan() {
    let venue = Venue::new();
    let engine = venue.open(Duration::from_secs(1));

    let a = engine.plan(venue.slot(DAY0 + 10 * H, DAY0 + 12 * H)).await.unwrap().id;
    let b = engine.plan(venue.slot(DAY0 + 12 * H, DAY0 + 14 * H)).await.unwrap().id;
    assert_err!(engine.plan(venue.slot(DAY0 + 11 * H, DAY0 + 13 * H)).await);
    engine.compact_wal().await.unwrap();
    let c = engine.plan(venue.slot(DAY0 + 15 * H, DAY0 + 16 * H)).await.unwrap().id;
    engine.remove_state(c).await.unwrap();
    drop(engine);

    let restored = venue.open(Duration::from_secs(1));
    let states = restored.list_states(DAY0, DAY0 + 24 * H).await.unwrap();
    assert_eq!(states.iter().map(|s| s.id).collect::<Vec<_>>(), vec![a, b]);
    assert_eq!(states[0].next_id, None);
    assert_eq!(states[1].note_public.as_deref(), Some("birthday"));

    venue.clock.set(DAY0 + 11 * H);
    assert_eq!(restored.get_current().await.map(|s| s.id), Some(a));
}
