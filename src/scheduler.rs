use async_trait::async_trait;
use std::time::Duration;
use tokio::{sync::broadcast, time::sleep};

/// One unit of scheduled work.
#[async_trait]
pub trait Cycle: Send + Sync {
    async fn run(&self) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Running,
    Stopped,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerReport {
    pub completed: u64,
    pub failed: u64,
}

/// Runs a [`Cycle`] forever, sleeping a fixed delay after each one finishes.
///
/// A failed cycle is logged and the loop carries on. The only way out is the
/// shutdown channel, which is watched both while a cycle runs and while
/// sleeping.
pub struct Scheduler<C: Cycle> {
    cycle: C,
    delay: Duration,
    state: SchedulerState,
}

impl<C: Cycle> Scheduler<C> {
    pub fn new(cycle: C, delay: Duration) -> Self {
        Self {
            cycle,
            delay,
            state: SchedulerState::Running,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub async fn run(&mut self, mut shutdown_rx: broadcast::Receiver<()>) -> SchedulerReport {
        let mut report = SchedulerReport::default();

        while self.state == SchedulerState::Running {
            let interrupted = tokio::select! {
                result = self.cycle.run() => {
                    match result {
                        Ok(output) => {
                            report.completed += 1;
                            tracing::debug!("Cycle output: {}", output);
                        }
                        Err(e) => {
                            report.failed += 1;
                            tracing::error!("Monitoring cycle failed: {:?}", e);
                        }
                    }
                    false
                },
                _ = shutdown_rx.recv() => {
                    tracing::info!("Shutdown received during a monitoring cycle");
                    true
                }
            };
            if interrupted {
                self.state = SchedulerState::Stopped;
                break;
            }

            tracing::info!(
                "Waiting {} seconds before next cycle...",
                self.delay.as_secs()
            );
            let interrupted = tokio::select! {
                _ = sleep(self.delay) => false,
                _ = shutdown_rx.recv() => true,
            };
            if interrupted {
                self.state = SchedulerState::Stopped;
            }
        }

        tracing::info!(
            "Monitoring stopped by user after {} completed and {} failed cycles",
            report.completed,
            report.failed
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    struct MockCycle {
        duration: Duration,
        starts: Arc<Mutex<Vec<Instant>>>,
        fail_first: bool,
    }

    impl MockCycle {
        fn new(duration: Duration) -> (Self, Arc<Mutex<Vec<Instant>>>) {
            let starts = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    duration,
                    starts: starts.clone(),
                    fail_first: false,
                },
                starts,
            )
        }
    }

    #[async_trait]
    impl Cycle for MockCycle {
        async fn run(&self) -> anyhow::Result<String> {
            let index = {
                let mut starts = self.starts.lock().unwrap();
                starts.push(Instant::now());
                starts.len()
            };
            sleep(self.duration).await;
            if self.fail_first && index == 1 {
                anyhow::bail!("agent runtime unavailable");
            }
            Ok(format!("cycle {}", index))
        }
    }

    fn spawn_scheduler(
        cycle: MockCycle,
        delay: Duration,
    ) -> (
        broadcast::Sender<()>,
        tokio::task::JoinHandle<(SchedulerReport, SchedulerState)>,
    ) {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(async move {
            let mut scheduler = Scheduler::new(cycle, delay);
            let report = scheduler.run(shutdown_rx).await;
            (report, scheduler.state())
        });
        (shutdown_tx, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_starts_are_separated_by_duration_plus_delay() {
        let cycle_duration = Duration::from_secs(2);
        let delay = Duration::from_secs(5);
        let (cycle, starts) = MockCycle::new(cycle_duration);
        let (shutdown_tx, handle) = spawn_scheduler(cycle, delay);

        // Starts at 0s, 7s and 14s; at 18s the scheduler is sleeping.
        sleep(Duration::from_secs(18)).await;
        shutdown_tx.send(()).unwrap();
        let (report, state) = handle.await.unwrap();

        let starts = starts.lock().unwrap();
        assert_eq!(starts.len(), 3);
        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] >= cycle_duration + delay);
        }
        assert_eq!(report.completed, 3);
        assert_eq!(state, SchedulerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_while_sleeping_starts_no_new_cycle() {
        let (cycle, starts) = MockCycle::new(Duration::from_secs(1));
        let (shutdown_tx, handle) = spawn_scheduler(cycle, Duration::from_secs(600));

        sleep(Duration::from_secs(30)).await;
        shutdown_tx.send(()).unwrap();
        let (report, state) = handle.await.unwrap();

        assert_eq!(starts.lock().unwrap().len(), 1);
        assert_eq!(report, SchedulerReport { completed: 1, failed: 0 });
        assert_eq!(state, SchedulerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_cycle_does_not_stop_the_loop() {
        let (mut cycle, starts) = MockCycle::new(Duration::from_secs(1));
        cycle.fail_first = true;
        let (shutdown_tx, handle) = spawn_scheduler(cycle, Duration::from_secs(10));

        // Starts at 0s and 11s; the second cycle ends at 12s.
        sleep(Duration::from_secs(15)).await;
        shutdown_tx.send(()).unwrap();
        let (report, _) = handle.await.unwrap();

        assert_eq!(starts.lock().unwrap().len(), 2);
        assert_eq!(report, SchedulerReport { completed: 1, failed: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_cycle_stops_immediately() {
        let (cycle, starts) = MockCycle::new(Duration::from_secs(120));
        let (shutdown_tx, handle) = spawn_scheduler(cycle, Duration::from_secs(5));

        sleep(Duration::from_secs(10)).await;
        shutdown_tx.send(()).unwrap();
        let (report, state) = handle.await.unwrap();

        assert_eq!(starts.lock().unwrap().len(), 1);
        assert_eq!(report, SchedulerReport::default());
        assert_eq!(state, SchedulerState::Stopped);
    }
}
