// SPDX-License-Identifier: PMPL-1.0-or-later

//! Error taxonomy shared by the catalog, client, ledger and engine.

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ChaosError {
    #[error("instance catalog at '{0}' did not resolve to a file, URL, or embedded resource")]
    CatalogUnresolved(String),

    #[error("instance catalog at {location} could not be parsed: {reason}")]
    CatalogParse { location: String, reason: String },

    #[error("instance {0} not found in catalog")]
    InstanceNotFound(String),

    #[error("no usable ssh credentials for instance {0}")]
    CredentialsDisabled(String),

    #[error("private key for instance {instance} could not be loaded: {reason}")]
    KeyUnavailable { instance: String, reason: String },

    #[error("unable to connect to {endpoint}: {reason}")]
    ConnectFailure { endpoint: String, reason: String },

    #[error("script on {instance} failed (exit status {exit_status:?}): {reason}")]
    ScriptExecutionFailure {
        instance: String,
        exit_status: Option<i32>,
        reason: String,
    },

    /// The script started but its connection broke before a result came back.
    #[error("script on {instance} was interrupted, result unknown: {reason}")]
    ScriptInterrupted { instance: String, reason: String },

    #[error("{operation} on {instance} did not finish within {timeout:?}")]
    TimedOut {
        operation: &'static str,
        instance: String,
        timeout: Duration,
    },

    #[error("{backend} backend does not support {operation}")]
    UnsupportedOperation {
        backend: &'static str,
        operation: &'static str,
    },

    #[error("terminate of {instance} failed: {reason}")]
    TerminateFailure { instance: String, reason: String },

    #[error("event ledger unavailable: {0}")]
    LedgerUnavailable(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ChaosError {
    /// Errors that must stop the control loop instead of degrading to a
    /// recorded outcome for one group.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ChaosError::CatalogUnresolved(_) | ChaosError::LedgerUnavailable(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ChaosError>;
