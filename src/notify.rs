use tokio::sync::watch;

/// "Plan changed" signal for the scheduler.
///
/// Carries a generation counter rather than the change itself: a listener
/// that wakes up re-reads the timeline, so missed or coalesced signals are
/// harmless.
pub struct NotifyHub {
    generation: watch::Sender<u64>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self { generation }
    }

    /// Subscribe to plan changes. The receiver starts at the current generation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    /// Signal a committed mutation. No-op if nobody is listening.
    pub fn plan_changed(&self) {
        self.generation.send_modify(|g| *g += 1);
    }

    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }
}
