// SPDX-License-Identifier: PMPL-1.0-or-later

//! The chaos control loop.
//!
//! One cycle crawls the fleet, decides per group whether to disrupt a member,
//! picks the victim, runs the disruption and records what happened. Groups
//! are evaluated independently on a bounded pool; a group's ledger check and
//! append happen under that group's lock so a window is never double-spent.

mod scheduler;

pub use scheduler::Scheduler;

use crate::client::DisruptionClient;
use crate::config::ChaosConfig;
use crate::crawler::ChaosCrawler;
use crate::error::{ChaosError, Result};
use crate::ledger::EventLedger;
use crate::types::{
    ChaosEvent, CycleReport, CyclePhase, DisruptionMode, EligibilityDecision, GroupReport,
    GroupVerdict, InstanceGroup, Outcome, Script,
};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use rayon::ThreadPool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Start of the window containing `now`: `now` floored to a whole multiple
/// of `window` since the Unix epoch. A one-day window starts at UTC midnight.
pub fn window_start(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    let width = (window.as_millis() as i64).max(1);
    let millis = now.timestamp_millis();
    let floored = millis - millis.rem_euclid(width);
    Utc.timestamp_millis_opt(floored).single().unwrap_or(now)
}

type LockMap = Mutex<HashMap<String, Arc<Mutex<()>>>>;

/// A per-key lock checked out of a `LockMap`. The map entry is removed when
/// the last holder lets go, so the maps only hold keys in use.
struct KeyedLock<'a> {
    map: &'a LockMap,
    key: String,
    lock: Arc<Mutex<()>>,
}

impl<'a> KeyedLock<'a> {
    fn checkout(map: &'a LockMap, key: &str) -> Self {
        let lock = map.lock().entry(key.to_string()).or_default().clone();
        Self {
            map,
            key: key.to_string(),
            lock,
        }
    }
}

impl Drop for KeyedLock<'_> {
    fn drop(&mut self) {
        let mut locks = self.map.lock();
        // ours plus the map's own
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.key);
        }
    }
}

fn phase(group: &str, phase: CyclePhase) {
    debug!(group, phase = ?phase, "cycle phase");
}

/// What one disruption attempt produced
struct Attempt {
    disruption: String,
    outcome: Outcome,
    detail: Option<String>,
}

impl Attempt {
    fn from_error(disruption: &str, err: &ChaosError) -> Self {
        let outcome = match err {
            ChaosError::CredentialsDisabled(_) => Outcome::Skipped,
            ChaosError::UnsupportedOperation { .. } => Outcome::Unsupported,
            ChaosError::TimedOut { .. } | ChaosError::ScriptInterrupted { .. } => {
                Outcome::TimedOut
            }
            _ => Outcome::Failed,
        };
        Self {
            disruption: disruption.to_string(),
            outcome,
            detail: Some(err.to_string()),
        }
    }
}

pub struct ChaosEngine {
    crawler: Arc<dyn ChaosCrawler>,
    client: Arc<dyn DisruptionClient>,
    ledger: Arc<dyn EventLedger>,
    config: Arc<ChaosConfig>,
    pool: ThreadPool,
    cycle_lock: Mutex<()>,
    group_locks: LockMap,
    instance_locks: LockMap,
    // Seeds one independent generator per group per cycle.
    rng: Mutex<StdRng>,
}

impl ChaosEngine {
    pub fn new(
        crawler: Arc<dyn ChaosCrawler>,
        client: Arc<dyn DisruptionClient>,
        ledger: Arc<dyn EventLedger>,
        config: Arc<ChaosConfig>,
    ) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.max_concurrency.max(1))
            .thread_name(|i| format!("chaos-worker-{}", i))
            .build()
            .map_err(|e| ChaosError::Config(format!("worker pool: {}", e)))?;

        Ok(Self {
            crawler,
            client,
            ledger,
            config,
            pool,
            cycle_lock: Mutex::new(()),
            group_locks: Mutex::new(HashMap::new()),
            instance_locks: Mutex::new(HashMap::new()),
            rng: Mutex::new(StdRng::from_entropy()),
        })
    }

    /// Make every draw reproducible.
    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            ..self
        }
    }

    pub fn ledger(&self) -> &Arc<dyn EventLedger> {
        &self.ledger
    }

    #[cfg(test)]
    fn held_locks(&self) -> (usize, usize) {
        (self.group_locks.lock().len(), self.instance_locks.lock().len())
    }

    pub fn run_cycle(&self) -> Result<CycleReport> {
        self.run_cycle_at(Utc::now())
    }

    /// Run one cycle as if the wall clock read `now`. Cycles never overlap:
    /// a second caller waits until the running cycle finishes.
    pub fn run_cycle_at(&self, now: DateTime<Utc>) -> Result<CycleReport> {
        let _cycle = self.cycle_lock.lock();
        let started = Instant::now();
        let deadline = started + self.config.cycle_deadline;
        let window_start = window_start(now, self.config.window);

        phase("*", CyclePhase::Crawling);
        let mut groups = self.crawler.groups(&self.config.allow)?;
        groups.retain(|group| {
            let listed = self.config.is_listed(group.name());
            if !listed {
                debug!(group = group.name(), "group is deny-listed");
            }
            listed
        });
        info!(
            groups = groups.len(),
            window_start = %window_start,
            leashed = self.config.leashed,
            "starting chaos cycle"
        );

        let seeded: Vec<(InstanceGroup, u64)> = {
            let mut rng = self.rng.lock();
            groups.into_iter().map(|g| (g, rng.gen())).collect()
        };

        let results: Vec<Result<GroupReport>> = self.pool.install(|| {
            seeded
                .par_iter()
                .map(|(group, seed)| {
                    self.evaluate(group, *seed, window_start, deadline, now, started)
                })
                .collect()
        });

        let mut reports = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(report) => reports.push(report),
                Err(err) => {
                    error!(error = %err, "chaos cycle aborted");
                    return Err(err);
                }
            }
        }

        phase("*", CyclePhase::Idle);
        let report = CycleReport {
            started_at: now,
            finished_at: offset(now, started),
            window_start,
            groups: reports,
        };
        info!(
            groups = report.groups.len(),
            disruptions = report.disruptions().count(),
            "chaos cycle finished"
        );
        Ok(report)
    }

    fn evaluate(
        &self,
        group: &InstanceGroup,
        seed: u64,
        window_start: DateTime<Utc>,
        deadline: Instant,
        now: DateTime<Utc>,
        started: Instant,
    ) -> Result<GroupReport> {
        let name = group.name();
        let report = |verdict| GroupReport {
            group: name.to_string(),
            group_type: group.group_type(),
            members: group.instances().len(),
            verdict,
        };

        if Instant::now() >= deadline {
            warn!(group = name, "cycle deadline passed before group was evaluated");
            return Ok(report(GroupVerdict::DeadlineExceeded));
        }

        phase(name, CyclePhase::Evaluating);
        let enabled = self.config.group_enabled(name);
        if !enabled {
            debug!(group = name, "group is not enabled");
            return Ok(report(GroupVerdict::Disabled));
        }
        if group.is_empty() {
            info!(group = name, "group has no instances");
            return Ok(report(GroupVerdict::EmptyGroup));
        }

        // Held until the event is appended.
        let group_lock = KeyedLock::checkout(&self.group_locks, name);
        let _held = group_lock.lock.lock();

        let decision = EligibilityDecision {
            enabled,
            already_hit_this_window: self.ledger.has_recent_event(name, window_start)?,
            probability: self.config.probability(name),
        };
        if decision.already_hit_this_window {
            info!(
                group = name,
                window_start = %window_start,
                "group already disrupted this window"
            );
            return Ok(report(GroupVerdict::AlreadyHit));
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let roll: f64 = rng.gen();
        if !decision.is_eligible() || roll >= decision.probability {
            debug!(group = name, roll, probability = decision.probability, "group not selected");
            return Ok(report(GroupVerdict::NotSelected {
                roll,
                probability: decision.probability,
            }));
        }

        phase(name, CyclePhase::Selecting);
        let victim = match group.instances().choose(&mut rng) {
            Some(victim) => victim.clone(),
            None => return Ok(report(GroupVerdict::EmptyGroup)),
        };
        let mode = self.config.disruption(name);

        if self.config.leashed {
            info!(
                group = name,
                instance = %victim,
                disruption = mode.label(),
                "leashed: would disrupt instance"
            );
            return Ok(report(GroupVerdict::Leashed { instance: victim }));
        }

        phase(name, CyclePhase::Disrupting);
        let attempt = {
            let instance_lock = KeyedLock::checkout(&self.instance_locks, &victim);
            let _busy = instance_lock.lock.lock();
            self.disrupt(&victim, mode)
        };

        phase(name, CyclePhase::Recording);
        let outcome = attempt.outcome;
        let event = ChaosEvent {
            group: name.to_string(),
            group_type: group.group_type(),
            instance: victim.clone(),
            disruption: attempt.disruption,
            timestamp: offset(now, started),
            outcome,
            detail: attempt.detail,
        };
        self.ledger.append(event)?;

        info!(group = name, instance = %victim, outcome = %outcome, "recorded chaos event");
        Ok(report(GroupVerdict::Disrupted {
            instance: victim,
            outcome,
        }))
    }

    fn disrupt(&self, instance: &str, mode: &DisruptionMode) -> Attempt {
        match mode {
            DisruptionMode::Script(script) => self.run_script(instance, script),
            DisruptionMode::Terminate => match self.client.terminate(instance) {
                Ok(()) => {
                    info!(instance, backend = self.client.backend(), "terminated instance");
                    Attempt {
                        disruption: mode.label().to_string(),
                        outcome: Outcome::Succeeded,
                        detail: None,
                    }
                }
                Err(err @ ChaosError::UnsupportedOperation { .. }) => {
                    match &self.config.fallback_script {
                        Some(script) => {
                            info!(
                                instance,
                                backend = self.client.backend(),
                                script = %script.label,
                                "terminate unsupported, running fallback script"
                            );
                            self.run_script(instance, script)
                        }
                        None => {
                            warn!(
                                instance,
                                error = %err,
                                "terminate unsupported and no fallback script"
                            );
                            Attempt::from_error(mode.label(), &err)
                        }
                    }
                }
                Err(err) => {
                    warn!(instance, error = %err, "terminate failed");
                    Attempt::from_error(mode.label(), &err)
                }
            },
        }
    }

    fn run_script(&self, instance: &str, script: &Script) -> Attempt {
        let credentials = match self.client.credentials(instance) {
            Ok(credentials) => credentials,
            Err(err) => {
                warn!(instance, error = %err, "unable to resolve credentials");
                return Attempt::from_error(&script.label, &err);
            }
        };
        if !credentials.is_enabled() {
            warn!(instance, user = credentials.username(), "no ssh key or password, skipping");
            return Attempt::from_error(
                &script.label,
                &ChaosError::CredentialsDisabled(instance.to_string()),
            );
        }

        match self.client.run_remote_script(instance, &credentials, script) {
            Ok(output) => {
                let stdout = output.stdout.trim();
                Attempt {
                    disruption: script.label.clone(),
                    outcome: Outcome::Succeeded,
                    detail: (!stdout.is_empty()).then(|| stdout.to_string()),
                }
            }
            Err(err) => {
                warn!(instance, script = %script.label, error = %err, "disruption script failed");
                Attempt::from_error(&script.label, &err)
            }
        }
    }
}

fn offset(now: DateTime<Utc>, started: Instant) -> DateTime<Utc> {
    chrono::Duration::from_std(started.elapsed())
        .map(|elapsed| now + elapsed)
        .unwrap_or(now)
}
