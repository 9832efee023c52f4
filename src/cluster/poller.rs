//! Periodic snapshot → select → publish loop
//!
//! Cycles never overlap: the next tick is only awaited after the previous
//! cycle's publish step returned, and missed ticks are delayed rather than
//! bursted.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use super::assignment::{build_assignments, log_cycle_summary};
use super::provider::{ClusterSnapshotProvider, ProviderError};
use super::publisher::{AssignmentPublisher, LoadBalancerTarget};
use super::selector::HostSelector;

/// Default poll interval in seconds
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;

/// Settings for the publisher loop
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub interval: Duration,
    pub selector: HostSelector,
    pub targets: Vec<LoadBalancerTarget>,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            selector: HostSelector::default(),
            targets: Vec::new(),
        }
    }
}

/// Summary of one completed cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub services: usize,
    pub nodes: usize,
    pub delivered: usize,
    pub failed: usize,
}

/// Drives the publisher side of the control plane
pub struct Poller<P> {
    provider: P,
    publisher: AssignmentPublisher,
    config: PollerConfig,
}

impl<P: ClusterSnapshotProvider> Poller<P> {
    pub fn new(provider: P, publisher: AssignmentPublisher, config: PollerConfig) -> Self {
        Self {
            provider,
            publisher,
            config,
        }
    }

    /// Run a single cycle.
    ///
    /// A listing failure ends the cycle before anything is published, so
    /// downstream agents keep their previous assignments.
    pub async fn run_cycle(&self) -> Result<CycleReport, ProviderError> {
        let mut snapshot = self.provider.snapshot().await?;

        let assignments = {
            let mut rng = rand::thread_rng();
            build_assignments(&mut snapshot, &self.config.selector, &mut rng)
        };
        log_cycle_summary(&assignments, &snapshot.nodes);

        let outcomes = self
            .publisher
            .publish(&assignments, &self.config.targets)
            .await;
        let delivered = outcomes.iter().filter(|o| o.is_delivered()).count();

        Ok(CycleReport {
            services: assignments.len(),
            nodes: snapshot.nodes.len(),
            delivered,
            failed: outcomes.len() - delivered,
        })
    }

    /// Loop until `shutdown` flips to true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_secs = self.config.interval.as_secs(),
            targets = self.config.targets.len(),
            host_limit = self.config.selector.limit(),
            "Starting assignment publisher"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let span = info_span!("cycle", id = %Uuid::new_v4());
                    if let Err(e) = self.run_cycle().instrument(span).await {
                        error!(error = %e, "Skipping cycle: cluster state unavailable");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Assignment publisher shutting down");
                        break;
                    }
                }
            }
        }
    }
}
