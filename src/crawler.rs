// SPDX-License-Identifier: PMPL-1.0-or-later

//! Fleet crawlers: list instance groups, optionally filtered by name.

use crate::catalog::InstanceCatalog;
use crate::error::Result;
use crate::types::{GroupType, InstanceGroup};
use std::sync::Arc;
use tracing::info;

pub trait ChaosCrawler: Send + Sync {
    /// Group types this crawler produces.
    fn group_types(&self) -> &[GroupType];

    /// Current groups. An empty `names` means every group; otherwise only
    /// groups whose name matches one of `names` exactly. Unknown names are
    /// not an error.
    fn groups(&self, names: &[String]) -> Result<Vec<InstanceGroup>>;
}

/// Crawls an instance catalog and tags every group with one group type
pub struct CatalogCrawler {
    catalog: Arc<dyn InstanceCatalog>,
    group_type: [GroupType; 1],
}

impl CatalogCrawler {
    pub fn new(catalog: Arc<dyn InstanceCatalog>, group_type: GroupType) -> Self {
        Self {
            catalog,
            group_type: [group_type],
        }
    }

    pub fn local(catalog: Arc<dyn InstanceCatalog>) -> Self {
        Self::new(catalog, GroupType::Local)
    }
}

impl ChaosCrawler for CatalogCrawler {
    fn group_types(&self) -> &[GroupType] {
        &self.group_type
    }

    fn groups(&self, names: &[String]) -> Result<Vec<InstanceGroup>> {
        if names.is_empty() {
            info!("getting all instance groups");
        } else {
            info!(count = names.len(), "getting instance groups by name");
        }

        let group_type = self.group_type[0];
        let groups: Vec<InstanceGroup> = self
            .catalog
            .instance_groups()
            .into_iter()
            .filter(|group| names.is_empty() || names.iter().any(|n| n == group.name()))
            .map(|group| retag(group, group_type))
            .collect();

        info!(count = groups.len(), "got instance groups");
        Ok(groups)
    }
}

fn retag(group: InstanceGroup, group_type: GroupType) -> InstanceGroup {
    if group.group_type() == group_type {
        return group;
    }
    let mut tagged = InstanceGroup::new(group.name(), group_type);
    for id in group.instances() {
        tagged.add_instance(id.clone());
    }
    tagged
}
