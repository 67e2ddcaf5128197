use crate::model::*;
use crate::transition::Transition;

use super::resolver::{Candidate, Resolution, scan_range, try_insert, validate_note, validate_span};
use super::store::Transaction;
use super::{Engine, EngineError};

impl Engine {
    /// Plan a new state. Starts now when no start is given.
    ///
    /// If the new state is already under way, the start trigger fires for it
    /// (and the end trigger for the state it cut short).
    pub async fn plan(&self, req: NewState) -> Result<PlanOutcome, EngineError> {
        if req.kind == StateKind::Closed {
            return Err(EngineError::ClosedKind);
        }
        validate_note(req.note_internal.as_ref())?;
        validate_note(req.note_public.as_ref())?;
        self.require_user(req.creator).await?;

        let now = self.now();
        let start = round_to_minute(req.start.unwrap_or(now));
        if start < round_to_minute(now) {
            return Err(EngineError::StartInPast { start, now });
        }

        let candidate = Candidate {
            creator: req.creator,
            kind: req.kind,
            start,
            end: req.end,
            note_internal: req.note_internal,
            note_public: req.note_public,
            rule_id: None,
            event_id: req.event_id,
        };

        self.mutate("plan", move |tx| {
            let outcome = match try_insert(tx, candidate)? {
                Resolution::Inserted(outcome) => outcome,
                Resolution::Conflicting(ids) => return Err(EngineError::Conflict(ids)),
            };
            if start <= tx.now {
                if let Some(cut) = outcome.truncated
                    && tx.timeline.state(cut.id).is_some_and(|s| s.ended_at.is_none())
                {
                    tx.after_commit(Transition::Ended {
                        id: cut.id,
                        new_current: Some(outcome.id),
                    });
                }
                tx.after_commit(Transition::Started {
                    id: outcome.id,
                    truncated_predecessor: outcome.truncated.map(|t| t.id),
                });
            }
            Ok(outcome)
        })
        .await
    }

    /// Change a state. What may change depends on where it sits relative to now:
    /// ended states take only internal-note edits, a current state keeps its
    /// start, planned states are fully editable.
    pub async fn modify(
        &self,
        actor: UserId,
        target: Target,
        changes: StateChanges,
    ) -> Result<PlanOutcome, EngineError> {
        if changes.kind == Some(StateKind::Closed) {
            return Err(EngineError::ClosedKind);
        }
        if let Some(Some(note)) = &changes.note_internal {
            validate_note(Some(note))?;
        }
        if let Some(Some(note)) = &changes.note_public {
            validate_note(Some(note))?;
        }
        self.require_user(actor).await?;
        if let Some(new_creator) = changes.creator {
            self.require_admin(actor).await?;
            self.require_user(new_creator).await?;
        }

        self.mutate("modify", move |tx| modify_in(tx, target, changes)).await
    }

    /// Delete a state that has not started yet.
    pub async fn remove_state(&self, id: StateId) -> Result<State, EngineError> {
        self.mutate("remove", move |tx| {
            let state = tx.timeline.state(id).cloned().ok_or(EngineError::NotFound(id))?;
            if state.phase(tx.now) != Phase::Planned {
                return Err(EngineError::Immutable("only states that have not started can be removed"));
            }
            tx.delete_state(id);
            Ok(state)
        })
        .await
    }

    /// End the current state now. Returns its post-image.
    pub async fn close(&self, actor: UserId) -> Result<State, EngineError> {
        self.require_user(actor).await?;
        self.mutate("close", move |tx| {
            let mut state = tx
                .timeline
                .current(tx.now)
                .cloned()
                .ok_or(EngineError::NothingToClose)?;
            state.ended_at = Some(round_to_minute(tx.now).max(state.start));
            state.closed_by = Some(actor);
            state.next_id = None;
            tx.update_state(state.clone());
            tx.after_commit(Transition::Ended {
                id: state.id,
                new_current: None,
            });
            Ok(state)
        })
        .await
    }
}

fn modify_in(tx: &mut Transaction, target: Target, changes: StateChanges) -> Result<PlanOutcome, EngineError> {
    let now = tx.now;
    let before = match target {
        Target::Id(id) => tx.timeline.state(id).cloned().ok_or(EngineError::NotFound(id))?,
        Target::Current => tx.timeline.current(now).cloned().ok_or(EngineError::NoCurrentState)?,
    };
    let id = before.id;
    let phase = before.phase(now);

    match phase {
        Phase::Past if changes.touches_anything_but_internal_note() => {
            return Err(EngineError::Immutable("state has ended; only the internal note may change"));
        }
        Phase::Current if changes.start.is_some() => {
            return Err(EngineError::Immutable("a started state cannot move its start"));
        }
        Phase::Current if changes.kind.is_some() => {
            return Err(EngineError::Immutable("a started state cannot change its kind"));
        }
        _ => {}
    }

    let new_start = changes.start.map(round_to_minute).unwrap_or(before.start);
    let new_end = changes.planned_end.map(round_to_minute).unwrap_or(before.planned_end);
    if phase == Phase::Planned && new_start <= now {
        return Err(EngineError::StartInPast { start: new_start, now });
    }
    if new_end <= new_start {
        return Err(EngineError::InvalidRange {
            start: new_start,
            end: new_end,
        });
    }
    if phase == Phase::Current && new_end <= now {
        return Err(EngineError::InvalidRange { start: now, end: new_end });
    }
    if phase != Phase::Past {
        validate_span(&Span::new(new_start, new_end))?;
    }

    let mut after = before.clone();
    if let Some(note) = changes.note_internal {
        after.note_internal = note;
    }
    if let Some(note) = changes.note_public {
        after.note_public = note;
    }
    if let Some(kind) = changes.kind {
        after.kind = kind;
    }
    if let Some(creator) = changes.creator {
        after.creator = creator;
    }
    after.start = new_start;
    after.planned_end = new_end;

    let start_moved = new_start != before.start;
    let prolonging = new_end > before.planned_end || new_start < before.start;

    if prolonging {
        let scan = scan_range(&tx.timeline, new_start, new_end, Some(id));
        if !scan.blocking.is_empty() {
            return Err(EngineError::Conflict(scan.blocking));
        }
        after.next_id = scan.successor;
    } else if new_end < before.planned_end {
        after.next_id = None;
    }
    // A neighbour running across the new start is cut short, whichever way the start moved.
    let link_from = tx
        .timeline
        .strictly_containing(new_start)
        .filter(|s| start_moved && s.id != id && s.ended_at.is_none())
        .map(|s| s.id);

    if after == before {
        return Ok(PlanOutcome {
            id,
            planned_end: before.planned_end,
            truncated: None,
        });
    }

    if start_moved {
        tx.unlink_predecessor(id);
    }
    let truncated = match link_from.and_then(|pid| tx.timeline.state(pid).cloned()) {
        Some(mut pred) => {
            pred.planned_end = new_start;
            pred.next_id = Some(id);
            let cut = Truncated {
                id: pred.id,
                planned_end: new_start,
            };
            tx.update_state(pred);
            Some(cut)
        }
        None => None,
    };
    tx.update_state(after.clone());
    tx.after_commit(Transition::Modified { before, after });

    Ok(PlanOutcome {
        id,
        planned_end: new_end,
        truncated,
    })
}
