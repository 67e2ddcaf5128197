use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;
use super::store::Transaction;

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_STATE_DURATION_MS {
        return Err(EngineError::LimitExceeded("state too long"));
    }
    Ok(())
}

pub(crate) fn validate_note(note: Option<&String>) -> Result<(), EngineError> {
    if note.is_some_and(|n| n.len() > MAX_NOTE_LEN) {
        return Err(EngineError::LimitExceeded("note too long"));
    }
    Ok(())
}

/// A state about to be inserted. `start` is already rounded.
#[derive(Debug, Clone)]
pub(crate) struct Candidate {
    pub creator: UserId,
    pub kind: StateKind,
    pub start: Ms,
    pub end: PlannedEnd,
    pub note_internal: Option<String>,
    pub note_public: Option<String>,
    pub rule_id: Option<RuleId>,
    pub event_id: Option<Ulid>,
}

#[derive(Debug)]
pub(crate) enum Resolution {
    Inserted(PlanOutcome),
    /// Nothing was written.
    Conflicting(Vec<StateId>),
}

/// What lies in a proposed range.
#[derive(Debug, Default)]
pub(crate) struct Scan {
    /// States starting inside the range.
    pub blocking: Vec<StateId>,
    /// The state starting exactly at the range's end.
    pub successor: Option<StateId>,
}

/// Classify every state whose start lies in `[start, end]`.
///
/// One starting exactly at `end` abuts the range and becomes its successor;
/// every other one blocks. `exclude` skips the state being modified.
pub(crate) fn scan_range(timeline: &Timeline, start: Ms, end: Ms, exclude: Option<StateId>) -> Scan {
    let mut scan = Scan::default();
    for s in timeline.starting_between(start, end) {
        if Some(s.id) == exclude {
            continue;
        }
        if s.start == end {
            scan.successor = Some(s.id);
        } else {
            scan.blocking.push(s.id);
        }
    }
    scan
}

/// Turn a [`PlannedEnd`] into an instant.
fn resolve_end(timeline: &Timeline, start: Ms, end: PlannedEnd) -> Result<Ms, EngineError> {
    match end {
        PlannedEnd::At(t) => Ok(t),
        PlannedEnd::Until(id) => timeline
            .state(id)
            .map(|s| s.start)
            .ok_or(EngineError::NotFound(id)),
        PlannedEnd::UntilNext => timeline
            .next_after(start)
            .map(|s| s.start)
            .ok_or(EngineError::NoFollowingInterval),
    }
}

/// Insert a state without overlapping anything.
///
/// States starting inside the candidate's range reject it; the rejection
/// lists every state the candidate overlaps. Otherwise a state the
/// candidate starts in the middle of is cut short at the candidate's start and
/// linked to it. A state starting exactly at the candidate's end becomes its
/// successor. Both writes are staged in `tx`.
pub(crate) fn try_insert(tx: &mut Transaction, candidate: Candidate) -> Result<Resolution, EngineError> {
    let start = candidate.start;
    let planned_end = round_to_minute(resolve_end(&tx.timeline, start, candidate.end)?);
    if planned_end <= start {
        return Err(EngineError::InvalidRange { start, end: planned_end });
    }
    validate_span(&Span::new(start, planned_end))?;

    let scan = scan_range(&tx.timeline, start, planned_end, None);
    if !scan.blocking.is_empty() {
        // Report everything the candidate overlaps, the state it would have cut short included.
        let mut conflicts: Vec<StateId> =
            tx.timeline.strictly_containing(start).map(|s| s.id).into_iter().collect();
        conflicts.extend(scan.blocking);
        return Ok(Resolution::Conflicting(conflicts));
    }

    let id = Ulid::new();
    let truncated = tx.timeline.strictly_containing(start).cloned().map(|mut s| {
        s.planned_end = start;
        s.next_id = Some(id);
        s
    });

    tx.plan_state(State {
        id,
        creator: candidate.creator,
        kind: candidate.kind,
        start,
        planned_end,
        ended_at: None,
        closed_by: None,
        note_internal: candidate.note_internal,
        note_public: candidate.note_public,
        next_id: scan.successor,
        rule_id: candidate.rule_id,
        event_id: candidate.event_id,
    })?;

    let truncated = truncated.map(|s| {
        let t = Truncated {
            id: s.id,
            planned_end: s.planned_end,
        };
        tx.update_state(s);
        t
    });

    Ok(Resolution::Inserted(PlanOutcome {
        id,
        planned_end,
        truncated,
    }))
}
