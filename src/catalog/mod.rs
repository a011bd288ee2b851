// SPDX-License-Identifier: PMPL-1.0-or-later

//! Instance catalog: statically described fleets loaded from JSON.
//!
//! The document is a list of groups, each with an id and its instances:
//!
//! ```json
//! [
//!   { "id": "appServers",
//!     "instances": [
//!       { "id": "instance1", "ipAddress": "127.0.0.2",
//!         "username": "foo", "userpass": "bar", "sshPort": 22 },
//!       { "id": "instance2", "hostname": "devtest.mydomain.com",
//!         "privateKeyFilePath": "/path/to/key",
//!         "privateKeyFilePassword": "k3yP@55w0rd" } ] } ]
//! ```
//!
//! The source is re-read on every `instance_groups` call. A malformed
//! document yields no groups for that call; it never takes the control loop
//! down.

mod model;
mod source;

pub use model::{CatalogSnapshot, LocalInstance, DEFAULT_SSH_PORT};
pub use source::{embedded_names, CatalogSource};

use crate::error::ChaosError;
use crate::types::InstanceGroup;
use arc_swap::ArcSwap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Provides the attackable instances of a statically described fleet
pub trait InstanceCatalog: Send + Sync {
    /// All groups visible right now. Empty when the source cannot be parsed.
    fn instance_groups(&self) -> Vec<InstanceGroup>;

    /// Connection metadata for one instance, if the last good load knew it.
    fn instance(&self, id: &str) -> Option<Arc<LocalInstance>>;
}

pub struct JsonInstanceCatalog {
    source: CatalogSource,
    fetch_timeout: Duration,
    snapshot: ArcSwap<CatalogSnapshot>,
}

impl JsonInstanceCatalog {
    /// Resolve `location` and load it once. Only resolution can fail here;
    /// a malformed first document simply starts with an empty snapshot.
    pub fn new(location: &str) -> Result<Self, ChaosError> {
        Self::with_timeout(location, DEFAULT_FETCH_TIMEOUT)
    }

    pub fn with_timeout(location: &str, fetch_timeout: Duration) -> Result<Self, ChaosError> {
        let source = CatalogSource::resolve(location, fetch_timeout)?;
        info!(source = %source, "created instance catalog");
        let catalog = Self {
            source,
            fetch_timeout,
            snapshot: ArcSwap::from_pointee(CatalogSnapshot::default()),
        };
        if let Err(err) = catalog.refresh() {
            error!(error = %err, "initial catalog load failed");
        }
        Ok(catalog)
    }

    pub fn source(&self) -> &CatalogSource {
        &self.source
    }

    /// Re-read the source and swap in a new snapshot. On failure the previous
    /// snapshot stays in place.
    pub fn refresh(&self) -> Result<Arc<CatalogSnapshot>, ChaosError> {
        info!(source = %self.source, "reading catalog data");
        let parsed = self
            .source
            .read(self.fetch_timeout)
            .and_then(|content| CatalogSnapshot::parse(&content))
            .map_err(|err| ChaosError::CatalogParse {
                location: self.source.to_string(),
                reason: format!("{:#}", err),
            })?;
        let parsed = Arc::new(parsed);
        self.snapshot.store(parsed.clone());
        Ok(parsed)
    }

    /// The snapshot from the last successful load.
    pub fn current(&self) -> Arc<CatalogSnapshot> {
        self.snapshot.load_full()
    }
}

impl InstanceCatalog for JsonInstanceCatalog {
    fn instance_groups(&self) -> Vec<InstanceGroup> {
        match self.refresh() {
            Ok(snapshot) => snapshot.groups.clone(),
            Err(err) => {
                error!(error = %err, "instance catalog unusable, no groups this crawl");
                Vec::new()
            }
        }
    }

    fn instance(&self, id: &str) -> Option<Arc<LocalInstance>> {
        self.snapshot.load().instances.get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn refresh_failure_keeps_previous_index() {
        let dir = TempDir::new().expect("tempdir should create");
        let path = dir.path().join("catalog.json");
        fs::write(&path, r#"[{"id":"g","instances":[{"id":"i1","hostname":"h"}]}]"#)
            .expect("catalog should write");

        let catalog = JsonInstanceCatalog::new(&path.to_string_lossy()).expect("resolves");
        assert!(catalog.instance("i1").is_some());

        fs::write(&path, "{ not json").expect("catalog should write");
        assert!(catalog.instance_groups().is_empty());
        // lookups still see the last good load
        assert!(catalog.instance("i1").is_some());
    }

    #[test]
    fn reload_replaces_snapshot() {
        let dir = TempDir::new().expect("tempdir should create");
        let path = dir.path().join("catalog.json");
        fs::write(&path, r#"[{"id":"g","instances":[{"id":"i1","hostname":"h"}]}]"#)
            .expect("catalog should write");
        let catalog = JsonInstanceCatalog::new(&path.to_string_lossy()).expect("resolves");
        let before = catalog.current();

        fs::write(&path, r#"[{"id":"g","instances":[{"id":"i2","hostname":"h"}]}]"#)
            .expect("catalog should write");
        let groups = catalog.instance_groups();
        assert_eq!(groups[0].instances(), ["i2".to_string()]);
        assert!(catalog.instance("i1").is_none());
        // readers holding the old snapshot are unaffected
        assert!(before.instances.contains_key("i1"));
    }
}
