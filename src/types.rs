// SPDX-License-Identifier: PMPL-1.0-or-later

//! Core type definitions for chaos-warden
//!
//! Groups and events are plain values: crawlers build a fresh set of
//! `InstanceGroup`s every cycle and the ledger only ever appends
//! `ChaosEvent`s.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which backend produced a group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupType {
    /// Statically described machines from an instance catalog
    Local,
    /// Groups backed by a provider that can terminate instances directly
    Cloud,
}

impl fmt::Display for GroupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupType::Local => write!(f, "LOCAL"),
            GroupType::Cloud => write!(f, "CLOUD"),
        }
    }
}

/// A named failure domain and its current members
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceGroup {
    name: String,
    group_type: GroupType,
    instances: Vec<String>,
}

impl InstanceGroup {
    pub fn new(name: impl Into<String>, group_type: GroupType) -> Self {
        Self {
            name: name.into(),
            group_type,
            instances: Vec::new(),
        }
    }

    /// Appends a member. Returns false (and leaves the group untouched) when
    /// the id is already present.
    pub fn add_instance(&mut self, id: impl Into<String>) -> bool {
        let id = id.into();
        if self.instances.contains(&id) {
            return false;
        }
        self.instances.push(id);
        true
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group_type(&self) -> GroupType {
        self.group_type
    }

    pub fn instances(&self) -> &[String] {
        &self.instances
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

/// A disruption script and the label it is recorded under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    pub label: String,
    pub body: String,
}

/// How a selected victim is disrupted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisruptionMode {
    /// Ask the backend to terminate the instance outright
    Terminate,
    /// Log in over ssh and run a script
    Script(Script),
}

impl DisruptionMode {
    pub fn label(&self) -> &str {
        match self {
            DisruptionMode::Terminate => "terminate",
            DisruptionMode::Script(script) => &script.label,
        }
    }
}

/// Result of one disruption attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    Failed,
    /// Nothing was attempted (e.g. no usable credentials)
    Skipped,
    /// The backend cannot perform the requested disruption
    Unsupported,
    /// The disruption started but its result is unknown
    TimedOut,
}

impl Outcome {
    /// Whether an event with this outcome consumes the group's window.
    pub fn counts_toward_window(&self) -> bool {
        !matches!(self, Outcome::Skipped)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Succeeded => write!(f, "SUCCEEDED"),
            Outcome::Failed => write!(f, "FAILED"),
            Outcome::Skipped => write!(f, "SKIPPED"),
            Outcome::Unsupported => write!(f, "UNSUPPORTED"),
            Outcome::TimedOut => write!(f, "TIMED_OUT"),
        }
    }
}

/// One recorded disruption attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChaosEvent {
    pub group: String,
    pub group_type: GroupType,
    pub instance: String,
    pub disruption: String,
    pub timestamp: DateTime<Utc>,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Per-group, per-cycle eligibility
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EligibilityDecision {
    pub enabled: bool,
    pub already_hit_this_window: bool,
    pub probability: f64,
}

impl EligibilityDecision {
    /// Eligible groups still have to win the probability draw.
    pub fn is_eligible(&self) -> bool {
        self.enabled && !self.already_hit_this_window && self.probability > 0.0
    }
}

/// Control loop state, logged as a cycle advances
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Idle,
    Crawling,
    Evaluating,
    Selecting,
    Disrupting,
    Recording,
}

/// What happened to one group during a cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum GroupVerdict {
    Disabled,
    AlreadyHit,
    NotSelected { roll: f64, probability: f64 },
    EmptyGroup,
    Leashed { instance: String },
    Disrupted { instance: String, outcome: Outcome },
    DeadlineExceeded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupReport {
    pub group: String,
    pub group_type: GroupType,
    pub members: usize,
    #[serde(flatten)]
    pub verdict: GroupVerdict,
}

/// Summary of one control-loop cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub window_start: DateTime<Utc>,
    pub groups: Vec<GroupReport>,
}

impl CycleReport {
    pub fn disruptions(&self) -> impl Iterator<Item = (&str, &str, Outcome)> {
        self.groups.iter().filter_map(|g| match &g.verdict {
            GroupVerdict::Disrupted { instance, outcome } => {
                Some((g.group.as_str(), instance.as_str(), *outcome))
            }
            _ => None,
        })
    }
}
