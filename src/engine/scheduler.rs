// SPDX-License-Identifier: PMPL-1.0-or-later

//! Periodic trigger: one cycle per interval, never two at once.

use super::ChaosEngine;
use crate::error::Result;
use crate::types::CycleReport;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info};

const POLL: Duration = Duration::from_millis(50);

pub struct Scheduler {
    engine: Arc<ChaosEngine>,
    interval: Duration,
    stop: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(engine: Arc<ChaosEngine>, interval: Duration) -> Self {
        Self {
            engine,
            interval,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that ends `run` after the current cycle.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Run cycles until stopped, `max_cycles` is reached, or a fatal error.
    /// Non-fatal cycle errors are logged and the loop carries on.
    pub fn run<F>(&self, max_cycles: Option<u64>, mut on_report: F) -> Result<u64>
    where
        F: FnMut(&CycleReport),
    {
        let mut completed = 0u64;
        info!(interval = ?self.interval, max_cycles, "chaos scheduler started");

        while !self.stop.load(Ordering::SeqCst) {
            let tick = Instant::now();
            match self.engine.run_cycle() {
                Ok(report) => on_report(&report),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => error!(error = %err, "chaos cycle failed"),
            }
            completed += 1;

            if max_cycles.is_some_and(|max| completed >= max) {
                break;
            }
            if !self.wait_until(tick + self.interval) {
                break;
            }
        }

        info!(cycles = completed, "chaos scheduler stopped");
        Ok(completed)
    }

    // false when stopped while waiting
    fn wait_until(&self, at: Instant) -> bool {
        while Instant::now() < at {
            if self.stop.load(Ordering::SeqCst) {
                return false;
            }
            thread::sleep(POLL.min(at.saturating_duration_since(Instant::now())));
        }
        !self.stop.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{DisruptionClient, ScriptOutput};
    use crate::config::ChaosConfig;
    use crate::credentials::CredentialSet;
    use crate::crawler::ChaosCrawler;
    use crate::error::ChaosError;
    use crate::ledger::{EventLedger, InMemoryLedger};
    use crate::types::{GroupType, InstanceGroup, Script};

    struct NoGroups;

    impl ChaosCrawler for NoGroups {
        fn group_types(&self) -> &[GroupType] {
            &[GroupType::Local]
        }

        fn groups(&self, _names: &[String]) -> Result<Vec<InstanceGroup>> {
            Ok(Vec::new())
        }
    }

    struct Unreachable;

    impl DisruptionClient for Unreachable {
        fn backend(&self) -> &'static str {
            "none"
        }

        fn terminate(&self, id: &str) -> Result<()> {
            Err(ChaosError::InstanceNotFound(id.to_string()))
        }

        fn credentials(&self, id: &str) -> Result<CredentialSet> {
            Err(ChaosError::InstanceNotFound(id.to_string()))
        }

        fn run_remote_script(
            &self,
            id: &str,
            _credentials: &CredentialSet,
            _script: &Script,
        ) -> Result<ScriptOutput> {
            Err(ChaosError::InstanceNotFound(id.to_string()))
        }
    }

    fn engine() -> Arc<ChaosEngine> {
        let ledger: Arc<dyn EventLedger> = Arc::new(InMemoryLedger::new());
        Arc::new(
            ChaosEngine::new(
                Arc::new(NoGroups),
                Arc::new(Unreachable),
                ledger,
                Arc::new(ChaosConfig::default()),
            )
            .expect("engine builds"),
        )
    }

    #[test]
    fn stops_after_requested_cycles() {
        let scheduler = Scheduler::new(engine(), Duration::from_millis(10));
        let mut seen = 0;
        let ran = scheduler.run(Some(3), |_| seen += 1).expect("runs");
        assert_eq!(ran, 3);
        assert_eq!(seen, 3);
    }

    #[test]
    fn stop_flag_interrupts_the_wait() {
        let scheduler = Scheduler::new(engine(), Duration::from_secs(3600));
        let stop = scheduler.stop_handle();
        let start = Instant::now();
        let ran = scheduler
            .run(None, |_| stop.store(true, Ordering::SeqCst))
            .expect("runs");
        assert_eq!(ran, 1);
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
