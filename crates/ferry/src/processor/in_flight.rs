//! Count of submitted but unfinished units of work.

use std::sync::Arc;

use tokio::sync::watch;

/// Tracks in-flight work and lets callers wait until none is left.
///
/// Each unit of work holds an [`InFlightGuard`]; dropping it, on any exit
/// path, counts the unit as finished.
#[derive(Debug)]
pub(crate) struct InFlight {
    count: Arc<watch::Sender<usize>>,
}

impl InFlight {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            count: Arc::new(count),
        }
    }

    pub fn enter(&self) -> InFlightGuard {
        self.count.send_modify(|count| *count += 1);
        InFlightGuard {
            count: Arc::clone(&self.count),
        }
    }

    pub fn current(&self) -> usize {
        *self.count.borrow()
    }

    /// Wait until every guard handed out so far has been dropped.
    pub async fn wait_idle(&self) {
        let mut receiver = self.count.subscribe();
        // the sender lives in self, so the channel cannot close here
        let _ = receiver.wait_for(|count| *count == 0).await;
    }
}

#[derive(Debug)]
pub(crate) struct InFlightGuard {
    count: Arc<watch::Sender<usize>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.count.send_modify(|count| *count -= 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_idle_without_work() {
        let in_flight = InFlight::new();
        tokio::time::timeout(Duration::from_millis(100), in_flight.wait_idle())
            .await
            .expect("no work means idle");
    }

    #[tokio::test]
    async fn test_waits_for_all_guards() {
        let in_flight = Arc::new(InFlight::new());
        let first = in_flight.enter();
        let second = in_flight.enter();
        assert_eq!(in_flight.current(), 2);

        let waiter = tokio::spawn({
            let in_flight = Arc::clone(&in_flight);
            async move { in_flight.wait_idle().await }
        });

        drop(first);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(second);
        tokio::time::timeout(Duration::from_millis(500), waiter)
            .await
            .expect("waiter should finish")
            .unwrap();
        assert_eq!(in_flight.current(), 0);
    }
}
