// SPDX-License-Identifier: PMPL-1.0-or-later

//! Chaos-Warden: a fault-injection control loop for fleet resilience testing.
//!
//! Each cycle walks the same pipeline:
//!
//! 1. **Discovery**: a crawler lists instance groups from the backend
//!    (for local fleets, a JSON instance catalog).
//! 2. **Eligibility**: a group is considered only when enabled and not yet
//!    disrupted in the current window, then wins a probability draw.
//! 3. **Selection**: one member is picked uniformly at random.
//! 4. **Execution**: the victim is terminated through the backend or has a
//!    disruption script run over ssh, and the attempt is recorded in the
//!    event ledger.

pub mod backend;
pub mod catalog;
pub mod client;
pub mod config;
pub mod crawler;
pub mod credentials;
pub mod engine;
pub mod error;
pub mod keys;
pub mod ledger;
pub mod report;
pub mod types;

pub use config::ChaosConfig;
pub use engine::{window_start, ChaosEngine, Scheduler};
pub use error::{ChaosError, Result};
