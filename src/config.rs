// SPDX-License-Identifier: PMPL-1.0-or-later

//! Configuration loading (YAML or JSON) and per-group policy lookups.
//!
//! ```yaml
//! backend: local
//! catalog: ./instance_catalog.json
//! window: 1d
//! group_defaults:
//!   enabled: false
//!   probability: 1.0
//!   disruption: shutdown
//! groups:
//!   appServers: { enabled: true, probability: 0.5 }
//! ssh:
//!   user: ops
//!   key: ~/.ssh/chaos_rsa
//! ```

use crate::client::scripts;
use crate::credentials::GlobalSshDefaults;
use crate::ledger::LedgerMode;
use crate::types::{DisruptionMode, Script};
use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    backend: Option<String>,
    catalog: Option<String>,
    enabled: Option<bool>,
    leashed: Option<bool>,
    window: Option<String>,
    allow: Vec<String>,
    deny: Vec<String>,
    group_defaults: GroupFile,
    groups: HashMap<String, GroupFile>,
    ssh: SshFile,
    max_concurrency: Option<usize>,
    cycle_deadline: Option<String>,
    interval: Option<String>,
    ledger: Option<String>,
    terminate_command: Vec<String>,
    terminate_timeout: Option<String>,
    fallback_script: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct GroupFile {
    enabled: Option<bool>,
    probability: Option<f64>,
    disruption: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct SshFile {
    user: Option<String>,
    key: Option<String>,
    key_passphrase: Option<String>,
    connect_timeout: Option<String>,
    script_timeout: Option<String>,
}

/// Per-group overrides; unset fields fall back to `group_defaults`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupSettings {
    pub enabled: Option<bool>,
    pub probability: Option<f64>,
    pub disruption: Option<DisruptionMode>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupDefaults {
    pub enabled: bool,
    pub probability: f64,
    pub disruption: DisruptionMode,
}

#[derive(Clone)]
pub struct SshSettings {
    pub user: Option<String>,
    pub key: Option<Vec<u8>>,
    pub key_passphrase: Option<String>,
    pub connect_timeout: Duration,
    pub script_timeout: Duration,
}

impl fmt::Debug for SshSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshSettings")
            .field("user", &self.user)
            .field("key", &self.key.as_ref().map(|_| "<redacted>"))
            .field("key_passphrase", &self.key_passphrase.as_ref().map(|_| "<redacted>"))
            .field("connect_timeout", &self.connect_timeout)
            .field("script_timeout", &self.script_timeout)
            .finish()
    }
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            user: None,
            key: None,
            key_passphrase: None,
            connect_timeout: crate::client::ssh::DEFAULT_CONNECT_TIMEOUT,
            script_timeout: crate::client::DEFAULT_SCRIPT_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChaosConfig {
    pub backend: String,
    pub catalog: String,
    /// Global kill switch.
    pub enabled: bool,
    /// Decide but never disrupt or record.
    pub leashed: bool,
    pub window: Duration,
    pub allow: Vec<String>,
    pub deny: Vec<String>,
    pub group_defaults: GroupDefaults,
    pub groups: HashMap<String, GroupSettings>,
    pub ssh: SshSettings,
    pub max_concurrency: usize,
    pub cycle_deadline: Duration,
    pub interval: Duration,
    pub ledger: LedgerMode,
    pub terminate_command: Vec<String>,
    pub terminate_timeout: Duration,
    /// Script used when `terminate` is unsupported by the backend.
    pub fallback_script: Option<Script>,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            backend: "local".to_string(),
            catalog: "./instance_catalog.json".to_string(),
            enabled: true,
            leashed: false,
            window: Duration::from_secs(24 * 60 * 60),
            allow: Vec::new(),
            deny: Vec::new(),
            group_defaults: GroupDefaults {
                enabled: false,
                probability: 1.0,
                disruption: DisruptionMode::Script(
                    scripts::builtin("shutdown").unwrap_or_else(|| Script {
                        label: "shutdown".to_string(),
                        body: "shutdown -h now\n".to_string(),
                    }),
                ),
            },
            groups: HashMap::new(),
            ssh: SshSettings::default(),
            max_concurrency: 4,
            cycle_deadline: Duration::from_secs(10 * 60),
            interval: Duration::from_secs(60 * 60),
            ledger: LedgerMode::Memory,
            terminate_command: Vec::new(),
            terminate_timeout: Duration::from_secs(30),
            fallback_script: None,
        }
    }
}

impl ChaosConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let file: ConfigFile = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&content)
                .with_context(|| format!("parsing json config {}", path.display()))?,
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)
                .with_context(|| format!("parsing yaml config {}", path.display()))?,
            _ => bail!("unsupported config extension for {}", path.display()),
        };
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_file(file, base_dir)
    }

    fn from_file(file: ConfigFile, base_dir: &Path) -> Result<Self> {
        let mut config = ChaosConfig::default();

        if let Some(backend) = file.backend {
            config.backend = backend;
        }
        if let Some(catalog) = file.catalog {
            config.catalog = catalog;
        }
        config.enabled = file.enabled.unwrap_or(config.enabled);
        config.leashed = file.leashed.unwrap_or(config.leashed);
        if let Some(raw) = file.window {
            config.window = parse_duration(&raw).context("window")?;
            if config.window.is_zero() {
                bail!("window must be longer than zero");
            }
        }
        config.allow = file.allow;
        config.deny = file.deny;

        let defaults = file.group_defaults;
        config.group_defaults.enabled = defaults.enabled.unwrap_or(config.group_defaults.enabled);
        if let Some(p) = defaults.probability {
            config.group_defaults.probability = check_probability("group_defaults", p)?;
        }
        if let Some(raw) = defaults.disruption {
            config.group_defaults.disruption = scripts::parse_mode(&raw, base_dir)?;
        }

        for (name, group) in file.groups {
            let probability = match group.probability {
                Some(p) => Some(check_probability(&name, p)?),
                None => None,
            };
            let disruption = match group.disruption {
                Some(raw) => Some(
                    scripts::parse_mode(&raw, base_dir)
                        .with_context(|| format!("group '{}'", name))?,
                ),
                None => None,
            };
            config.groups.insert(
                name,
                GroupSettings {
                    enabled: group.enabled,
                    probability,
                    disruption,
                },
            );
        }

        config.ssh.user = file.ssh.user;
        config.ssh.key_passphrase = file.ssh.key_passphrase;
        if let Some(path) = file.ssh.key.filter(|p| !p.trim().is_empty()) {
            config.ssh.key = Some(crate::keys::read_key_file(&path)?);
        }
        if let Some(raw) = file.ssh.connect_timeout {
            config.ssh.connect_timeout = parse_duration(&raw).context("ssh.connect_timeout")?;
        }
        if let Some(raw) = file.ssh.script_timeout {
            config.ssh.script_timeout = parse_duration(&raw).context("ssh.script_timeout")?;
        }

        if let Some(n) = file.max_concurrency {
            if n == 0 {
                bail!("max_concurrency must be at least 1");
            }
            config.max_concurrency = n;
        }
        if let Some(raw) = file.cycle_deadline {
            config.cycle_deadline = parse_duration(&raw).context("cycle_deadline")?;
        }
        if let Some(raw) = file.interval {
            config.interval = parse_duration(&raw).context("interval")?;
        }
        if let Some(raw) = file.ledger {
            config.ledger = LedgerMode::parse(&raw);
        }
        config.terminate_command = file.terminate_command;
        if let Some(raw) = file.terminate_timeout {
            config.terminate_timeout = parse_duration(&raw).context("terminate_timeout")?;
        }
        if let Some(raw) = file.fallback_script {
            match scripts::parse_mode(&raw, base_dir)? {
                DisruptionMode::Script(script) => config.fallback_script = Some(script),
                DisruptionMode::Terminate => bail!("fallback_script cannot be terminate"),
            }
        }

        Ok(config)
    }

    pub fn group_enabled(&self, group: &str) -> bool {
        self.enabled
            && self
                .groups
                .get(group)
                .and_then(|g| g.enabled)
                .unwrap_or(self.group_defaults.enabled)
    }

    pub fn probability(&self, group: &str) -> f64 {
        self.groups
            .get(group)
            .and_then(|g| g.probability)
            .unwrap_or(self.group_defaults.probability)
    }

    pub fn disruption(&self, group: &str) -> &DisruptionMode {
        self.groups
            .get(group)
            .and_then(|g| g.disruption.as_ref())
            .unwrap_or(&self.group_defaults.disruption)
    }

    /// Whether `group` passes the allow and deny lists.
    pub fn is_listed(&self, group: &str) -> bool {
        let allowed = self.allow.is_empty() || self.allow.iter().any(|n| n == group);
        allowed && !self.deny.iter().any(|n| n == group)
    }

    pub fn global_ssh(&self) -> GlobalSshDefaults {
        GlobalSshDefaults {
            user: self.ssh.user.clone(),
            key: self.ssh.key.clone(),
            key_passphrase: self.ssh.key_passphrase.clone(),
        }
    }
}

fn check_probability(scope: &str, p: f64) -> Result<f64> {
    if !(0.0..=1.0).contains(&p) || p.is_nan() {
        bail!("probability for {} must be within [0, 1], got {}", scope, p);
    }
    Ok(p)
}

/// Parse `500ms`, `30s`, `5m`, `2h`, `1d`; a bare number is seconds.
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let trimmed = raw.trim().to_ascii_lowercase();
    if trimmed.is_empty() {
        return Err(anyhow!("duration cannot be empty"));
    }

    let (value_str, unit) = if let Some(v) = trimmed.strip_suffix("ms") {
        (v, "ms")
    } else if let Some(v) = trimmed.strip_suffix('s') {
        (v, "s")
    } else if let Some(v) = trimmed.strip_suffix('m') {
        (v, "m")
    } else if let Some(v) = trimmed.strip_suffix('h') {
        (v, "h")
    } else if let Some(v) = trimmed.strip_suffix('d') {
        (v, "d")
    } else {
        (trimmed.as_str(), "s")
    };

    let value: f64 = value_str
        .trim()
        .parse()
        .with_context(|| format!("invalid duration '{}'", raw))?;
    if value.is_sign_negative() || !value.is_finite() {
        return Err(anyhow!("duration must be a positive number: {}", raw));
    }

    let millis = match unit {
        "ms" => value,
        "m" => value * 60_000.0,
        "h" => value * 3_600_000.0,
        "d" => value * 86_400_000.0,
        _ => value * 1000.0,
    };
    Ok(Duration::from_millis(millis.round() as u64))
}
