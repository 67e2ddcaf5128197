use std::time::{Duration, Instant};

use tokio::sync::{Mutex, MutexGuard};

use super::EngineError;

/// The single lock every mutation passes through.
///
/// Waiting is bounded: a caller that cannot get in within `timeout` fails with
/// [`EngineError::Busy`] instead of queueing indefinitely. Reads never touch it.
pub struct PlanningGate {
    lock: Mutex<()>,
    timeout: Duration,
}

impl PlanningGate {
    pub fn new(timeout: Duration) -> Self {
        Self {
            lock: Mutex::new(()),
            timeout,
        }
    }

    pub async fn acquire(&self) -> Result<MutexGuard<'_, ()>, EngineError> {
        let started = Instant::now();
        let guard = tokio::time::timeout(self.timeout, self.lock.lock()).await;
        metrics::histogram!(crate::observability::LOCK_WAIT_SECONDS)
            .record(started.elapsed().as_secs_f64());
        guard.map_err(|_| {
            metrics::counter!(crate::observability::LOCK_BUSY_TOTAL).increment(1);
            EngineError::Busy
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_caller_times_out() {
        let gate = PlanningGate::new(Duration::from_millis(20));
        let held = gate.acquire().await.unwrap();
        let err = gate.acquire().await.unwrap_err();
        assert_eq!(err, EngineError::Busy);
        drop(held);
        assert!(gate.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn waiter_gets_in_once_released() {
        let gate = std::sync::Arc::new(PlanningGate::new(Duration::from_secs(1)));
        let held = gate.acquire().await.unwrap();
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(held);
        assert!(waiter.await.unwrap().is_ok());
    }
}
