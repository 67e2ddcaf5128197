use chrono::{Datelike, Duration, LocalResult, NaiveDate, NaiveTime, TimeZone, Weekday};
use chrono_tz::Tz;
use ulid::Ulid;

use crate::limits::MAX_RULE_HORIZON_DAYS;
use crate::model::*;

use super::resolver::{Candidate, Resolution, try_insert, validate_note};
use super::store::Transaction;
use super::{Engine, EngineError};

/// The first `weekday` on or after `date`.
pub fn first_on_or_after(date: NaiveDate, weekday: Weekday) -> NaiveDate {
    let ahead = (7 + weekday.num_days_from_monday() - date.weekday().num_days_from_monday()) % 7;
    date + Duration::days(ahead as i64)
}

/// Every `weekday` in `[from, to]`.
pub fn occurrence_dates(from: NaiveDate, to: NaiveDate, weekday: Weekday) -> impl Iterator<Item = NaiveDate> {
    let first = first_on_or_after(from, weekday);
    std::iter::successors(Some(first), |d| Some(*d + Duration::days(7))).take_while(move |d| *d <= to)
}

/// Resolve a civil date and time in `tz` to an instant.
///
/// Ambiguous times (clocks going back) take the earlier instant. Times inside
/// a gap (clocks going forward) move forward minute by minute to the first
/// time that exists.
pub fn local_instant(tz: Tz, date: NaiveDate, time: NaiveTime) -> Option<Ms> {
    let mut local = date.and_time(time);
    // DST gaps are at most a couple of hours; give up well past that.
    for _ in 0..(4 * 60) {
        match tz.from_local_datetime(&local) {
            LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => return Some(dt.timestamp_millis()),
            LocalResult::None => local += Duration::minutes(1),
        }
    }
    None
}

/// The civil date of instant `t` in `tz`.
pub fn local_date(tz: Tz, t: Ms) -> NaiveDate {
    tz.timestamp_millis_opt(t)
        .single()
        .map(|dt| dt.date_naive())
        .unwrap_or_default()
}

fn occurrence_span(tz: Tz, rule: &RepeatingRule, date: NaiveDate) -> Option<Span> {
    let start = round_to_minute(local_instant(tz, date, rule.time_from)?);
    let end = round_to_minute(local_instant(tz, date, rule.time_to)?);
    (end > start).then(|| Span::new(start, end))
}

/// Insert one state per `rule` occurrence dated in `[from, to]`.
///
/// Occurrences that have already started are skipped. Occurrences that would
/// overlap something are left out and reported; the rest are still created.
fn materialize(
    tx: &mut Transaction,
    tz: Tz,
    rule: &RepeatingRule,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<(Vec<PlanOutcome>, Vec<Overlap>), EngineError> {
    let mut created = Vec::new();
    let mut overlapping = Vec::new();

    for date in occurrence_dates(from, to, rule.day_of_week) {
        let Some(span) = occurrence_span(tz, rule, date) else {
            continue;
        };
        if span.start <= tx.now {
            continue;
        }
        let candidate = Candidate {
            creator: rule.creator,
            kind: rule.kind,
            start: span.start,
            end: PlannedEnd::At(span.end),
            note_internal: rule.note_internal.clone(),
            note_public: rule.note_public.clone(),
            rule_id: Some(rule.id),
            event_id: None,
        };
        match try_insert(tx, candidate)? {
            Resolution::Inserted(outcome) => created.push(outcome),
            Resolution::Conflicting(conflicts) => overlapping.push(Overlap { span, conflicts }),
        }
    }

    Ok((created, overlapping))
}

/// Delete occurrences of `rule_id` starting at or after `cutoff` that have not started.
fn delete_occurrences_from(tx: &mut Transaction, rule_id: RuleId, cutoff: Ms) -> Vec<StateId> {
    let now = tx.now;
    let doomed: Vec<StateId> = tx
        .timeline
        .occurrences(rule_id)
        .filter(|s| s.start >= cutoff && s.start > now)
        .map(|s| s.id)
        .collect();
    for id in &doomed {
        tx.delete_state(*id);
    }
    doomed
}

fn check_horizon(from: NaiveDate, to: NaiveDate) -> Result<(), EngineError> {
    if (to - from).num_days() > MAX_RULE_HORIZON_DAYS {
        return Err(EngineError::LimitExceeded("rule spans too many days"));
    }
    Ok(())
}

fn shorten_in(
    tx: &mut Transaction,
    tz: Tz,
    mut rule: RepeatingRule,
    new_to: NaiveDate,
    today: NaiveDate,
) -> Result<RuleOutcome, EngineError> {
    if new_to < today {
        return Err(EngineError::InvalidRule("cannot end a rule before today"));
    }
    if new_to < rule.effective_from {
        return Err(EngineError::InvalidRule("effective_to before effective_from"));
    }
    let day_after = new_to + Duration::days(1);
    let cutoff = local_instant(tz, day_after, NaiveTime::MIN)
        .ok_or(EngineError::InvalidRule("cutoff does not exist in the venue time zone"))?;

    let removed = delete_occurrences_from(tx, rule.id, cutoff);
    rule.effective_to = new_to;
    let rule_id = rule.id;
    tx.save_rule(rule);

    Ok(RuleOutcome {
        rule_id,
        created: Vec::new(),
        overlapping: Vec::new(),
        removed,
    })
}

fn prolong_in(
    tx: &mut Transaction,
    tz: Tz,
    mut rule: RepeatingRule,
    new_to: NaiveDate,
) -> Result<RuleOutcome, EngineError> {
    check_horizon(rule.effective_from, new_to)?;
    let from = rule.effective_to + Duration::days(1);
    rule.effective_to = new_to;
    tx.save_rule(rule.clone());

    let (created, overlapping) = materialize(tx, tz, &rule, from, new_to)?;
    Ok(RuleOutcome {
        rule_id: rule.id,
        created,
        overlapping,
        removed: Vec::new(),
    })
}

impl Engine {
    /// Create a weekly rule and materialize all its occurrences in one transaction.
    ///
    /// `effective_from` is moved forward to the first matching weekday.
    /// Overlapping occurrences are reported in the outcome, not created.
    pub async fn create_rule(&self, req: NewRule) -> Result<RuleOutcome, EngineError> {
        if req.kind == StateKind::Closed {
            return Err(EngineError::ClosedKind);
        }
        if req.effective_to <= req.effective_from {
            return Err(EngineError::InvalidRule("effective_to must be after effective_from"));
        }
        if req.time_to <= req.time_from {
            return Err(EngineError::InvalidRule("time_to must be after time_from"));
        }
        check_horizon(req.effective_from, req.effective_to)?;
        validate_note(req.note_internal.as_ref())?;
        validate_note(req.note_public.as_ref())?;
        self.require_user(req.creator).await?;

        let tz = self.time_zone();
        if req.effective_to < local_date(tz, self.now()) {
            return Err(EngineError::InvalidRule("rule would end in the past"));
        }
        let first = first_on_or_after(req.effective_from, req.day_of_week);
        if first > req.effective_to {
            return Err(EngineError::InvalidRule("no occurrence between effective_from and effective_to"));
        }

        let rule = RepeatingRule {
            id: Ulid::new(),
            creator: req.creator,
            kind: req.kind,
            day_of_week: req.day_of_week,
            effective_from: first,
            effective_to: req.effective_to,
            time_from: req.time_from,
            time_to: req.time_to,
            note_internal: req.note_internal,
            note_public: req.note_public,
        };

        self.mutate("create_rule", move |tx| {
            tx.save_rule(rule.clone());
            let (created, overlapping) = materialize(tx, tz, &rule, rule.effective_from, rule.effective_to)?;
            Ok(RuleOutcome {
                rule_id: rule.id,
                created,
                overlapping,
                removed: Vec::new(),
            })
        })
        .await
    }

    /// Move a rule's `effective_to`, deleting or materializing occurrences to match.
    pub async fn set_rule_effective_to(&self, rule_id: RuleId, new_to: NaiveDate) -> Result<RuleOutcome, EngineError> {
        let tz = self.time_zone();
        self.mutate("set_rule_end", move |tx| {
            let rule = tx.timeline.rule(rule_id).cloned().ok_or(EngineError::NotFound(rule_id))?;
            let today = local_date(tz, tx.now);
            if !rule.is_open(today) {
                return Err(EngineError::Immutable("rule has ended"));
            }
            if new_to < rule.effective_to {
                shorten_in(tx, tz, rule, new_to, today)
            } else if new_to > rule.effective_to {
                prolong_in(tx, tz, rule, new_to)
            } else {
                Ok(RuleOutcome {
                    rule_id,
                    created: Vec::new(),
                    overlapping: Vec::new(),
                    removed: Vec::new(),
                })
            }
        })
        .await
    }

    /// Remove a rule. Before it starts it is deleted with every occurrence;
    /// once started it is shortened to end today, so today's occurrence stays.
    pub async fn remove_rule(&self, rule_id: RuleId) -> Result<RuleRemoval, EngineError> {
        let tz = self.time_zone();
        self.mutate("remove_rule", move |tx| {
            let rule = tx.timeline.rule(rule_id).cloned().ok_or(EngineError::NotFound(rule_id))?;
            let today = local_date(tz, tx.now);

            if !rule.has_started(today) {
                let occurrences: Vec<StateId> = tx.timeline.occurrences(rule_id).map(|s| s.id).collect();
                for id in &occurrences {
                    tx.delete_state(*id);
                }
                tx.delete_rule(rule_id);
                return Ok(RuleRemoval::Deleted { removed: occurrences });
            }
            if !rule.is_open(today) {
                return Err(EngineError::Immutable("rule has ended"));
            }

            let outcome = shorten_in(tx, tz, rule, today, today)?;
            Ok(RuleRemoval::Ended {
                removed: outcome.removed,
            })
        })
        .await
    }

    /// Edit a rule's kind, notes or owner and carry the edit to every
    /// occurrence that has not started. Reassigning the owner takes an admin.
    pub async fn edit_rule(
        &self,
        actor: UserId,
        rule_id: RuleId,
        changes: RuleChanges,
    ) -> Result<RepeatingRule, EngineError> {
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

        let tz = self.time_zone();
        self.mutate("edit_rule", move |tx| {
            let mut rule = tx.timeline.rule(rule_id).cloned().ok_or(EngineError::NotFound(rule_id))?;
            if !rule.is_open(local_date(tz, tx.now)) {
                return Err(EngineError::Immutable("rule has ended"));
            }
            changes.apply_to_rule(&mut rule);
            tx.save_rule(rule.clone());

            // Only the edited fields travel, so per-occurrence overrides of the others survive.
            let now = tx.now;
            let ahead: Vec<State> = tx
                .timeline
                .occurrences(rule_id)
                .filter(|s| s.phase(now) == Phase::Planned)
                .cloned()
                .collect();
            for state in ahead {
                let mut edited = state.clone();
                changes.apply_to_state(&mut edited);
                if edited != state {
                    tx.update_state(edited);
                }
            }
            Ok(rule)
        })
        .await
    }
}
