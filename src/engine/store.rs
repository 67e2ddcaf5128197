use crate::limits::MAX_STATES;
use crate::model::*;
use crate::transition::Transition;

use super::EngineError;

/// Working copy of the timeline for one logical operation.
///
/// Every write lands on the copy and is staged as an [`Event`]. The engine
/// either commits the staged events to the WAL and swaps the copy in, or drops
/// the whole thing. There is no partial commit.
pub(crate) struct Transaction {
    pub(crate) timeline: Timeline,
    /// Instant the transaction began at. All phase checks inside use this.
    pub(crate) now: Ms,
    events: Vec<Event>,
    transitions: Vec<Transition>,
}

impl Transaction {
    pub(crate) fn begin(committed: &Timeline, now: Ms) -> Self {
        Self {
            timeline: committed.clone(),
            now,
            events: Vec::new(),
            transitions: Vec::new(),
        }
    }

    pub(crate) fn plan_state(&mut self, state: State) -> Result<(), EngineError> {
        if self.timeline.states.len() >= MAX_STATES {
            return Err(EngineError::LimitExceeded("too many states"));
        }
        self.timeline.insert_state(state.clone());
        self.events.push(Event::StatePlanned { state });
        Ok(())
    }

    pub(crate) fn update_state(&mut self, state: State) {
        self.timeline.replace_state(state.clone());
        self.events.push(Event::StateUpdated { state });
    }

    /// Delete a state and clear the link of whichever state pointed at it.
    pub(crate) fn delete_state(&mut self, id: StateId) -> Option<State> {
        self.unlink_predecessor(id);
        let removed = self.timeline.remove_state(id)?;
        self.events.push(Event::StateRemoved { id });
        Some(removed)
    }

    /// Clear `next_id` on the state that links forward to `id`.
    pub(crate) fn unlink_predecessor(&mut self, id: StateId) -> Option<StateId> {
        let mut pred = self.timeline.predecessor_of(id).cloned()?;
        pred.next_id = None;
        let pred_id = pred.id;
        self.update_state(pred);
        Some(pred_id)
    }

    pub(crate) fn save_rule(&mut self, rule: RepeatingRule) {
        self.timeline.save_rule(rule.clone());
        self.events.push(Event::RuleSaved { rule });
    }

    pub(crate) fn delete_rule(&mut self, id: RuleId) -> Option<RepeatingRule> {
        let removed = self.timeline.remove_rule(id)?;
        self.events.push(Event::RuleRemoved { id });
        Some(removed)
    }

    /// Queue a side effect to run once this transaction has committed.
    pub(crate) fn after_commit(&mut self, transition: Transition) {
        self.transitions.push(transition);
    }

    pub(crate) fn into_parts(self) -> (Timeline, Vec<Event>, Vec<Transition>) {
        (self.timeline, self.events, self.transitions)
    }
}
