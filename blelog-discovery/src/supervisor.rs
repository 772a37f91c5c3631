use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, error, warn};

use blelog_domain::discover::DiscoveryEvent;
use blelog_domain::retry::RetryPolicy;

use crate::Scanner;

/// How a supervised scan ended.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub rounds: u32,
    pub failures: u32,
    pub gave_up: bool,
}

/// Runs a scanner round after round, fanning results out on a channel.
/// Failed rounds are retried after the policy's backoff; the backoff resets
/// after any successful round.
pub struct ScanSupervisor<S: Scanner> {
    scanner: S,
    retry: RetryPolicy,
    period: Option<Duration>,
}

impl<S: Scanner + 'static> ScanSupervisor<S> {
    pub fn new(scanner: S, retry: RetryPolicy) -> Self {
        ScanSupervisor {
            scanner,
            retry,
            period: None,
        }
    }

    /// Stop scanning once `period` has elapsed.
    #[must_use]
    pub fn with_period(mut self, period: Option<Duration>) -> Self {
        self.period = period;
        self
    }

    pub fn spawn(self, capacity: usize) -> (mpsc::Receiver<Vec<DiscoveryEvent>>, JoinHandle<ScanSummary>) {
        let (tx, rx) = mpsc::channel(capacity);
        let handle = tokio::spawn(self.run(tx));
        (rx, handle)
    }

    pub async fn run(mut self, tx: mpsc::Sender<Vec<DiscoveryEvent>>) -> ScanSummary {
        let deadline = self.period.map(|p| Instant::now() + p);
        let mut summary = ScanSummary::default();
        let mut consecutive_failures = 0;

        loop {
            if tx.is_closed() || deadline.is_some_and(|d| Instant::now() >= d) {
                break;
            }
            match self.scanner.scan().await {
                Ok(events) => {
                    consecutive_failures = 0;
                    summary.rounds += 1;
                    if tx.send(events).await.is_err() {
                        debug!("scan receiver dropped, stopping");
                        break;
                    }
                }
                Err(e) => {
                    consecutive_failures += 1;
                    summary.failures += 1;
                    let Some(delay) = self.retry.delay_after(consecutive_failures) else {
                        error!("scan failed {consecutive_failures} times in a row, giving up: {e}");
                        summary.gave_up = true;
                        break;
                    };
                    warn!("scan failed: {e}, retrying in {delay:?}");
                    let wake = Instant::now() + delay;
                    time::sleep_until(deadline.map_or(wake, |d| d.min(wake))).await;
                }
            }
        }
        summary
    }
}
