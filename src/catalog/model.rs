// SPDX-License-Identifier: PMPL-1.0-or-later

//! Catalog document schema and the parsed instance model.

use crate::credentials::InstanceLogin;
use crate::keys;
use crate::types::{GroupType, InstanceGroup};
use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub const DEFAULT_SSH_PORT: u16 = 22;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroupEntry {
    id: String,
    #[serde(default)]
    instances: Vec<InstanceEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceEntry {
    id: String,
    ip_address: Option<String>,
    hostname: Option<String>,
    username: Option<String>,
    userpass: Option<String>,
    private_key_file_path: Option<String>,
    private_key_file_password: Option<String>,
    ssh_port: Option<u16>,
}

/// A statically described machine and everything needed to log in to it
#[derive(Clone, PartialEq, Eq)]
pub struct LocalInstance {
    id: String,
    host: String,
    username: Option<String>,
    password: Option<String>,
    private_key_path: Option<String>,
    private_key: Option<Vec<u8>>,
    private_key_password: Option<String>,
    // Set when privateKeyFilePath could not be read at load time.
    key_error: Option<String>,
    ssh_port: u16,
}

impl LocalInstance {
    pub fn new(id: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            username: None,
            password: None,
            private_key_path: None,
            private_key: None,
            private_key_password: None,
            key_error: None,
            ssh_port: DEFAULT_SSH_PORT,
        }
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_ssh_port(mut self, port: u16) -> Self {
        self.ssh_port = port;
        self
    }

    pub fn with_private_key(mut self, path: impl Into<String>, key: Vec<u8>) -> Self {
        self.private_key_path = Some(path.into());
        self.private_key = Some(key);
        self
    }

    /// Mark the configured key as unloadable. The instance stays in the
    /// catalog; disrupting it fails.
    pub fn with_key_error(mut self, path: impl Into<String>, reason: impl Into<String>) -> Self {
        self.private_key_path = Some(path.into());
        self.private_key = None;
        self.key_error = Some(reason.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// IP address or DNS name as written in the catalog.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn ssh_port(&self) -> u16 {
        self.ssh_port
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn private_key_path(&self) -> Option<&str> {
        self.private_key_path.as_deref()
    }

    pub fn key_error(&self) -> Option<&str> {
        self.key_error.as_deref()
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.ssh_port)
    }

    pub fn login(&self) -> InstanceLogin<'_> {
        InstanceLogin {
            username: self.username.as_deref(),
            password: self.password.as_deref(),
            private_key: self.private_key.as_deref(),
            private_key_password: self.private_key_password.as_deref(),
        }
    }
}

impl fmt::Debug for LocalInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalInstance")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint())
            .field("username", &self.username)
            .field("private_key_path", &self.private_key_path)
            .field("key_error", &self.key_error)
            .finish()
    }
}

/// One parsed catalog: groups plus the id index
#[derive(Debug, Default)]
pub struct CatalogSnapshot {
    pub groups: Vec<InstanceGroup>,
    pub instances: HashMap<String, Arc<LocalInstance>>,
}

impl CatalogSnapshot {
    pub fn parse(content: &str) -> Result<Self> {
        let entries: Vec<GroupEntry> =
            serde_json::from_str(content).context("catalog is not a list of instance groups")?;

        let mut snapshot = CatalogSnapshot::default();
        for entry in entries {
            if entry.id.trim().is_empty() {
                bail!("instance group with empty id");
            }
            if snapshot.groups.iter().any(|g| g.name() == entry.id) {
                bail!("duplicate instance group '{}'", entry.id);
            }
            tracing::debug!(
                group = %entry.id,
                instances = entry.instances.len(),
                "parsing local instance group"
            );

            let mut group = InstanceGroup::new(entry.id.clone(), GroupType::Local);
            for instance in entry.instances {
                let instance = build_instance(instance)
                    .with_context(|| format!("in instance group '{}'", entry.id))?;
                if snapshot.instances.contains_key(instance.id()) {
                    bail!("instance '{}' appears more than once", instance.id());
                }
                tracing::debug!(
                    instance = %instance.id(),
                    host = %instance.host(),
                    "parsing local instance"
                );
                group.add_instance(instance.id());
                snapshot
                    .instances
                    .insert(instance.id().to_string(), Arc::new(instance));
            }
            snapshot.groups.push(group);
        }
        Ok(snapshot)
    }
}

fn build_instance(entry: InstanceEntry) -> Result<LocalInstance> {
    if entry.id.trim().is_empty() {
        bail!("instance with empty id");
    }
    let host = entry
        .ip_address
        .filter(|h| !h.trim().is_empty())
        .or(entry.hostname.filter(|h| !h.trim().is_empty()))
        .ok_or_else(|| anyhow!("instance '{}' has neither ipAddress nor hostname", entry.id))?;

    let ssh_port = entry.ssh_port.unwrap_or(DEFAULT_SSH_PORT);
    if ssh_port == 0 {
        bail!("instance '{}' has sshPort 0", entry.id);
    }

    let private_key_path = entry.private_key_file_path.filter(|p| !p.trim().is_empty());
    let (private_key, key_error) = match &private_key_path {
        Some(path) => match keys::read_key_file(path) {
            Ok(key) => (Some(key), None),
            Err(err) => {
                let reason = format!("{:#}", err);
                tracing::warn!(
                    instance = %entry.id,
                    path = %path,
                    error = %reason,
                    "private key unreadable, instance cannot be disrupted"
                );
                (None, Some(reason))
            }
        },
        None => (None, None),
    };

    Ok(LocalInstance {
        id: entry.id,
        host: host.trim().to_string(),
        username: entry.username,
        password: entry.userpass,
        private_key_path,
        private_key,
        private_key_password: entry.private_key_file_password,
        key_error,
        ssh_port,
    })
}
