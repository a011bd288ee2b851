// SPDX-License-Identifier: PMPL-1.0-or-later

//! Event ledger: append-only history of disruption attempts.
//!
//! The engine asks the ledger whether a group was already hit in the current
//! window and appends one event per attempt. Nothing is ever updated or
//! removed.

mod file;

pub use file::JsonlLedger;

use crate::error::Result;
use crate::types::ChaosEvent;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;

pub trait EventLedger: Send + Sync {
    /// Whether `group` has an event that counts toward its window at or
    /// after `window_start`.
    fn has_recent_event(&self, group: &str, window_start: DateTime<Utc>) -> Result<bool>;

    fn append(&self, event: ChaosEvent) -> Result<()>;

    /// Full history, oldest first.
    fn events(&self) -> Result<Vec<ChaosEvent>>;
}

pub(crate) fn counts_in_window(
    event: &ChaosEvent,
    group: &str,
    window_start: DateTime<Utc>,
) -> bool {
    event.group == group
        && event.timestamp >= window_start
        && event.outcome.counts_toward_window()
}

#[derive(Debug, Default)]
pub struct InMemoryLedger {
    events: RwLock<Vec<ChaosEvent>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventLedger for InMemoryLedger {
    fn has_recent_event(&self, group: &str, window_start: DateTime<Utc>) -> Result<bool> {
        Ok(self
            .events
            .read()
            .iter()
            .any(|event| counts_in_window(event, group, window_start)))
    }

    fn append(&self, event: ChaosEvent) -> Result<()> {
        self.events.write().push(event);
        Ok(())
    }

    fn events(&self) -> Result<Vec<ChaosEvent>> {
        Ok(self.events.read().clone())
    }
}

/// Where events are kept
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerMode {
    Memory,
    File(PathBuf),
}

impl LedgerMode {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "memory" | "mem" => LedgerMode::Memory,
            _ => LedgerMode::File(PathBuf::from(value.trim())),
        }
    }

    pub fn open(&self) -> Result<Arc<dyn EventLedger>> {
        Ok(match self {
            LedgerMode::Memory => Arc::new(InMemoryLedger::new()),
            LedgerMode::File(path) => Arc::new(JsonlLedger::open(path)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GroupType, Outcome};
    use chrono::Duration;

    fn event(group: &str, at: DateTime<Utc>, outcome: Outcome) -> ChaosEvent {
        ChaosEvent {
            group: group.to_string(),
            group_type: GroupType::Local,
            instance: "i1".to_string(),
            disruption: "shutdown".to_string(),
            timestamp: at,
            outcome,
            detail: None,
        }
    }

    #[test]
    fn window_check_respects_group_time_and_outcome() {
        let ledger = InMemoryLedger::new();
        let now = Utc::now();
        let window_start = now - Duration::hours(1);

        ledger
            .append(event("old", now - Duration::hours(2), Outcome::Succeeded))
            .expect("append");
        ledger
            .append(event("skipped", now, Outcome::Skipped))
            .expect("append");
        ledger
            .append(event("failed", now, Outcome::Failed))
            .expect("append");

        assert!(!ledger.has_recent_event("old", window_start).expect("query"));
        assert!(!ledger.has_recent_event("skipped", window_start).expect("query"));
        assert!(ledger.has_recent_event("failed", window_start).expect("query"));
        assert!(!ledger.has_recent_event("other", window_start).expect("query"));
        assert_eq!(ledger.events().expect("events").len(), 3);
    }

    #[test]
    fn ledger_mode_parses() {
        assert_eq!(LedgerMode::parse("memory"), LedgerMode::Memory);
        assert_eq!(
            LedgerMode::parse("var/events.jsonl"),
            LedgerMode::File(PathBuf::from("var/events.jsonl"))
        );
    }
}
