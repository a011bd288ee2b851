// SPDX-License-Identifier: PMPL-1.0-or-later

//! Backend registry: the configured backend name picks the crawler and
//! disruption client pair once, at startup.

use crate::catalog::JsonInstanceCatalog;
use crate::client::{CommandClient, DisruptionClient, LocalClient, Ssh2Connector, SshConnector};
use crate::config::ChaosConfig;
use crate::crawler::{CatalogCrawler, ChaosCrawler};
use crate::error::{ChaosError, Result};
use crate::types::GroupType;
use std::sync::Arc;
use tracing::info;

pub struct Backend {
    pub name: &'static str,
    pub catalog: Arc<JsonInstanceCatalog>,
    pub crawler: Arc<dyn ChaosCrawler>,
    pub client: Arc<dyn DisruptionClient>,
}

type Constructor =
    fn(&ChaosConfig, Arc<JsonInstanceCatalog>, Arc<dyn SshConnector>) -> Result<Parts>;
type Parts = (Arc<dyn ChaosCrawler>, Arc<dyn DisruptionClient>);

static REGISTRY: &[(&str, Constructor)] = &[("local", local), ("command", command)];

pub fn names() -> impl Iterator<Item = &'static str> {
    REGISTRY.iter().map(|(name, _)| *name)
}

/// Build the named backend with the libssh2 connector.
pub fn build(name: &str, config: &ChaosConfig) -> Result<Backend> {
    let connector = Arc::new(Ssh2Connector::new(config.ssh.connect_timeout));
    build_with(name, config, connector)
}

pub fn build_with(
    name: &str,
    config: &ChaosConfig,
    connector: Arc<dyn SshConnector>,
) -> Result<Backend> {
    let (registered, constructor) = REGISTRY
        .iter()
        .find(|(candidate, _)| candidate.eq_ignore_ascii_case(name.trim()))
        .ok_or_else(|| {
            ChaosError::Config(format!(
                "unknown backend '{}' (expected one of: {})",
                name,
                names().collect::<Vec<_>>().join(", ")
            ))
        })?;

    let catalog = Arc::new(JsonInstanceCatalog::new(&config.catalog)?);
    let (crawler, client) = constructor(config, catalog.clone(), connector)?;
    info!(backend = *registered, catalog = %catalog.source(), "backend ready");
    Ok(Backend {
        name: registered,
        catalog,
        crawler,
        client,
    })
}

fn ssh_client(
    config: &ChaosConfig,
    catalog: Arc<JsonInstanceCatalog>,
    connector: Arc<dyn SshConnector>,
) -> LocalClient {
    LocalClient::new(catalog, connector, config.global_ssh(), config.ssh.script_timeout)
}

fn local(
    config: &ChaosConfig,
    catalog: Arc<JsonInstanceCatalog>,
    connector: Arc<dyn SshConnector>,
) -> Result<Parts> {
    let crawler = CatalogCrawler::new(catalog.clone(), GroupType::Local);
    let client = ssh_client(config, catalog, connector);
    Ok((Arc::new(crawler), Arc::new(client)))
}

fn command(
    config: &ChaosConfig,
    catalog: Arc<JsonInstanceCatalog>,
    connector: Arc<dyn SshConnector>,
) -> Result<Parts> {
    let crawler = CatalogCrawler::new(catalog.clone(), GroupType::Cloud);
    let client = CommandClient::new(
        config.terminate_command.clone(),
        config.terminate_timeout,
        ssh_client(config, catalog, connector),
    )?;
    Ok((Arc::new(crawler), Arc::new(client)))
}
