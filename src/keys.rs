// SPDX-License-Identifier: PMPL-1.0-or-later

//! Private key file loading shared by the catalog and configuration loaders.

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;

/// Expand a leading `~/` to the current user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    let path = path.trim();
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

pub fn read_key_file(path: &str) -> Result<Vec<u8>> {
    let resolved = expand_home(path);
    tracing::debug!(path = %resolved.display(), "reading ssh key");
    fs::read(&resolved).with_context(|| format!("unable to read ssh key {}", resolved.display()))
}
