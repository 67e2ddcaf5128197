use chrono::{NaiveDate, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only instant type.
pub type Ms = i64;

pub type StateId = Ulid;
pub type RuleId = Ulid;
pub type UserId = Ulid;

pub const MINUTE_MS: Ms = 60_000;
pub const DAY_MS: Ms = 86_400_000;

/// Drop seconds and millis. Every persisted instant goes through this.
pub fn round_to_minute(t: Ms) -> Ms {
    t.div_euclid(MINUTE_MS) * MINUTE_MS
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// True when `t` lies strictly inside, excluding both edges.
    pub fn strictly_contains(&self, t: Ms) -> bool {
        self.start < t && t < self.end
    }
}

/// The mode the venue is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateKind {
    OpenPublic,
    OpenEvent,
    Private,
    /// Only ever synthesized for gaps; never planned.
    Closed,
    OpenTearoom,
    OpenForAll,
}

impl StateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateKind::OpenPublic => "open_public",
            StateKind::OpenEvent => "open_event",
            StateKind::Private => "private",
            StateKind::Closed => "closed",
            StateKind::OpenTearoom => "open_tearoom",
            StateKind::OpenForAll => "open_for_all",
        }
    }
}

/// Where a state sits relative to "now".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Ended early or reached its planned end.
    Past,
    /// `start <= now < planned_end` and not closed.
    Current,
    /// `start > now`.
    Planned,
}

/// One contiguous period the venue spends in a given mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub id: StateId,
    pub creator: UserId,
    pub kind: StateKind,
    pub start: Ms,
    pub planned_end: Ms,
    pub ended_at: Option<Ms>,
    pub closed_by: Option<UserId>,
    pub note_internal: Option<String>,
    pub note_public: Option<String>,
    /// Forward link to the state created to follow this one back-to-back.
    pub next_id: Option<StateId>,
    pub rule_id: Option<RuleId>,
    pub event_id: Option<Ulid>,
}

impl State {
    pub fn span(&self) -> Span {
        Span::new(self.start, self.planned_end)
    }

    /// `ended_at` when closed, `planned_end` otherwise.
    pub fn effective_end(&self) -> Ms {
        self.ended_at.unwrap_or(self.planned_end)
    }

    pub fn phase(&self, now: Ms) -> Phase {
        if self.ended_at.is_some() || self.planned_end <= now {
            Phase::Past
        } else if self.start <= now {
            Phase::Current
        } else {
            Phase::Planned
        }
    }
}

/// Weekly template that materializes states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepeatingRule {
    pub id: RuleId,
    pub creator: UserId,
    pub kind: StateKind,
    pub day_of_week: Weekday,
    /// Inclusive.
    pub effective_from: NaiveDate,
    /// Inclusive.
    pub effective_to: NaiveDate,
    pub time_from: NaiveTime,
    pub time_to: NaiveTime,
    pub note_internal: Option<String>,
    pub note_public: Option<String>,
}

impl RepeatingRule {
    /// Mutable while `effective_to` is today or later.
    pub fn is_open(&self, today: NaiveDate) -> bool {
        self.effective_to >= today
    }

    pub fn has_started(&self, today: NaiveDate) -> bool {
        self.effective_from <= today
    }
}

/// The committed plan: every state sorted by `start`, plus the rules.
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    /// Sorted by `start`. Starts are unique because states never overlap.
    pub states: Vec<State>,
    pub rules: Vec<RepeatingRule>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert state maintaining sort order by start.
    pub fn insert_state(&mut self, state: State) {
        let pos = self.states.partition_point(|s| s.start < state.start);
        self.states.insert(pos, state);
    }

    pub fn remove_state(&mut self, id: StateId) -> Option<State> {
        let pos = self.states.iter().position(|s| s.id == id)?;
        Some(self.states.remove(pos))
    }

    /// Replace a state by id, re-sorting if its start moved.
    pub fn replace_state(&mut self, state: State) {
        self.remove_state(state.id);
        self.insert_state(state);
    }

    pub fn state(&self, id: StateId) -> Option<&State> {
        self.states.iter().find(|s| s.id == id)
    }

    /// States whose start lies in the closed range `[from, to]`.
    pub fn starting_between(&self, from: Ms, to: Ms) -> impl Iterator<Item = &State> {
        let lo = self.states.partition_point(|s| s.start < from);
        let hi = self.states.partition_point(|s| s.start <= to);
        self.states[lo..hi.max(lo)].iter()
    }

    /// States whose planned range overlaps the query window.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &State> {
        let right_bound = self.states.partition_point(|s| s.start < query.end);
        self.states[..right_bound]
            .iter()
            .filter(move |s| s.span().overlaps(query))
    }

    /// The state whose planned range strictly contains `t`.
    pub fn strictly_containing(&self, t: Ms) -> Option<&State> {
        let idx = self.states.partition_point(|s| s.start < t);
        let candidate = self.states[..idx].last()?;
        candidate.span().strictly_contains(t).then_some(candidate)
    }

    /// First state starting strictly after `t`.
    pub fn next_after(&self, t: Ms) -> Option<&State> {
        let idx = self.states.partition_point(|s| s.start <= t);
        self.states.get(idx)
    }

    /// Last state starting at or before `t`.
    pub fn last_at_or_before(&self, t: Ms) -> Option<&State> {
        let idx = self.states.partition_point(|s| s.start <= t);
        idx.checked_sub(1).map(|i| &self.states[i])
    }

    /// The state linking forward to `id`, if any.
    pub fn predecessor_of(&self, id: StateId) -> Option<&State> {
        self.states.iter().find(|s| s.next_id == Some(id))
    }

    /// The open state covering `now`, ignoring ones closed early.
    pub fn current(&self, now: Ms) -> Option<&State> {
        self.last_at_or_before(now)
            .filter(|s| s.phase(now) == Phase::Current)
    }

    pub fn occurrences(&self, rule_id: RuleId) -> impl Iterator<Item = &State> {
        self.states.iter().filter(move |s| s.rule_id == Some(rule_id))
    }

    pub fn rule(&self, id: RuleId) -> Option<&RepeatingRule> {
        self.rules.iter().find(|r| r.id == id)
    }

    pub fn save_rule(&mut self, rule: RepeatingRule) {
        match self.rules.iter_mut().find(|r| r.id == rule.id) {
            Some(existing) => *existing = rule,
            None => self.rules.push(rule),
        }
    }

    pub fn remove_rule(&mut self, id: RuleId) -> Option<RepeatingRule> {
        let pos = self.rules.iter().position(|r| r.id == id)?;
        Some(self.rules.remove(pos))
    }

    /// Apply one replayed or committed event.
    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::StatePlanned { state } => self.insert_state(state.clone()),
            Event::StateUpdated { state } => self.replace_state(state.clone()),
            Event::StateRemoved { id } => {
                self.remove_state(*id);
            }
            Event::RuleSaved { rule } => self.save_rule(rule.clone()),
            Event::RuleRemoved { id } => {
                self.remove_rule(*id);
            }
        }
    }

    /// Minimal events that rebuild this timeline from scratch.
    pub fn snapshot_events(&self) -> Vec<Event> {
        let rules = self.rules.iter().map(|r| Event::RuleSaved { rule: r.clone() });
        let states = self.states.iter().map(|s| Event::StatePlanned { state: s.clone() });
        rules.chain(states).collect()
    }
}

/// WAL events. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    StatePlanned { state: State },
    /// Carries the full post-image.
    StateUpdated { state: State },
    StateRemoved { id: StateId },
    RuleSaved { rule: RepeatingRule },
    RuleRemoved { id: RuleId },
}

/// Every event written by one logical operation. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub at: Ms,
    pub events: Vec<Event>,
}

// ── Request types ───────────────────────────────────────────────

/// How the end of a new state is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlannedEnd {
    At(Ms),
    /// End where the given state starts.
    Until(StateId),
    /// End where the next planned state starts.
    UntilNext,
}

#[derive(Debug, Clone)]
pub struct NewState {
    pub creator: UserId,
    pub kind: StateKind,
    /// Defaults to now.
    pub start: Option<Ms>,
    pub end: PlannedEnd,
    pub note_internal: Option<String>,
    pub note_public: Option<String>,
    pub event_id: Option<Ulid>,
}

/// Which state a modification targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Id(StateId),
    Current,
}

/// Requested changes. `None` leaves the field alone; for notes `Some(None)` clears it.
#[derive(Debug, Clone, Default)]
pub struct StateChanges {
    pub start: Option<Ms>,
    pub planned_end: Option<Ms>,
    pub kind: Option<StateKind>,
    pub creator: Option<UserId>,
    pub note_internal: Option<Option<String>>,
    pub note_public: Option<Option<String>>,
}

impl StateChanges {
    pub fn touches_anything_but_internal_note(&self) -> bool {
        self.start.is_some()
            || self.planned_end.is_some()
            || self.kind.is_some()
            || self.creator.is_some()
            || self.note_public.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct NewRule {
    pub creator: UserId,
    pub kind: StateKind,
    pub day_of_week: Weekday,
    pub effective_from: NaiveDate,
    pub effective_to: NaiveDate,
    pub time_from: NaiveTime,
    pub time_to: NaiveTime,
    pub note_internal: Option<String>,
    pub note_public: Option<String>,
}

/// Edits to a rule's non-recurrence fields.
#[derive(Debug, Clone, Default)]
pub struct RuleChanges {
    pub kind: Option<StateKind>,
    pub creator: Option<UserId>,
    pub note_internal: Option<Option<String>>,
    pub note_public: Option<Option<String>>,
}

impl RuleChanges {
    pub fn apply_to_rule(&self, rule: &mut RepeatingRule) {
        if let Some(kind) = self.kind {
            rule.kind = kind;
        }
        if let Some(creator) = self.creator {
            rule.creator = creator;
        }
        if let Some(note) = &self.note_internal {
            rule.note_internal = note.clone();
        }
        if let Some(note) = &self.note_public {
            rule.note_public = note.clone();
        }
    }

    /// Copy the edited fields onto an occurrence, leaving the rest as they are.
    pub fn apply_to_state(&self, state: &mut State) {
        if let Some(kind) = self.kind {
            state.kind = kind;
        }
        if let Some(creator) = self.creator {
            state.creator = creator;
        }
        if let Some(note) = &self.note_internal {
            state.note_internal = note.clone();
        }
        if let Some(note) = &self.note_public {
            state.note_public = note.clone();
        }
    }
}

// ── Result types ────────────────────────────────────────────────

/// A neighbour whose planned end was cut short by an insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Truncated {
    pub id: StateId,
    pub planned_end: Ms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanOutcome {
    pub id: StateId,
    pub planned_end: Ms,
    pub truncated: Option<Truncated>,
}

/// A recurrence occurrence that was not created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Overlap {
    pub span: Span,
    pub conflicts: Vec<StateId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleOutcome {
    pub rule_id: RuleId,
    pub created: Vec<PlanOutcome>,
    pub overlapping: Vec<Overlap>,
    /// Occurrences deleted by a shorten.
    pub removed: Vec<StateId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleRemoval {
    /// Rule had not started; it and all its occurrences are gone.
    Deleted { removed: Vec<StateId> },
    /// Rule had started; it now ends today.
    Ended { removed: Vec<StateId> },
}

/// What the venue is doing at an instant, with gaps synthesized as `Closed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VenueStatus {
    pub kind: StateKind,
    pub state_id: Option<StateId>,
    pub since: Option<Ms>,
    pub until: Option<Ms>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    #[serde(default)]
    pub roles: Vec<String>,
}
