use crate::limits::MAX_QUERY_WINDOW_MS;
use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    pub async fn get_state(&self, id: StateId) -> Option<State> {
        self.timeline.read().await.state(id).cloned()
    }

    /// States whose planned range overlaps `[from, to)`, in start order.
    pub async fn list_states(&self, from: Ms, to: Ms) -> Result<Vec<State>, EngineError> {
        if to <= from {
            return Err(EngineError::InvalidRange { start: from, end: to });
        }
        if to - from > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let timeline = self.timeline.read().await;
        Ok(timeline.overlapping(&Span::new(from, to)).cloned().collect())
    }

    /// The state in force right now. A state closed early is not current.
    pub async fn get_current(&self) -> Option<State> {
        let now = self.now();
        self.timeline.read().await.current(now).cloned()
    }

    /// The first state starting strictly after `after` (default: now),
    /// optionally restricted to one kind.
    pub async fn get_nearest(&self, kind: Option<StateKind>, after: Option<Ms>) -> Option<State> {
        let after = after.unwrap_or_else(|| self.now());
        let timeline = self.timeline.read().await;
        let from = timeline.states.partition_point(|s| s.start <= after);
        timeline.states[from..]
            .iter()
            .find(|s| kind.is_none_or(|k| s.kind == k))
            .cloned()
    }

    pub async fn get_rule(&self, id: RuleId) -> Option<RepeatingRule> {
        self.timeline.read().await.rule(id).cloned()
    }

    pub async fn list_rules(&self) -> Vec<RepeatingRule> {
        let mut rules = self.timeline.read().await.rules.clone();
        rules.sort_by_key(|r| (r.effective_from, r.day_of_week.num_days_from_monday(), r.time_from));
        rules
    }

    /// Every materialized occurrence of a rule, in start order.
    pub async fn rule_occurrences(&self, rule_id: RuleId) -> Result<Vec<State>, EngineError> {
        let timeline = self.timeline.read().await;
        timeline.rule(rule_id).ok_or(EngineError::NotFound(rule_id))?;
        Ok(timeline.occurrences(rule_id).cloned().collect())
    }

    /// What the venue is doing at `t`.
    ///
    /// Time no state covers is Closed. The gap runs from the effective end of
    /// the state before it to the start of the state after it; either bound is
    /// `None` when there is no such state.
    pub async fn status_at(&self, t: Ms) -> VenueStatus {
        let timeline = self.timeline.read().await;
        let before = timeline.last_at_or_before(t);
        if let Some(s) = before
            && t < s.effective_end()
        {
            return VenueStatus {
                kind: s.kind,
                state_id: Some(s.id),
                since: Some(s.start),
                until: Some(s.effective_end()),
            };
        }
        VenueStatus {
            kind: StateKind::Closed,
            state_id: None,
            since: before.map(State::effective_end),
            until: timeline.next_after(t).map(|s| s.start),
        }
    }
}
