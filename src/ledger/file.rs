// SPDX-License-Identifier: PMPL-1.0-or-later

//! JSON-lines ledger file: one serialized event per line.

use super::{counts_in_window, EventLedger};
use crate::error::{ChaosError, Result};
use crate::types::ChaosEvent;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

pub struct JsonlLedger {
    path: PathBuf,
    // Serializes appends from this process.
    writer: Mutex<()>,
}

impl JsonlLedger {
    /// Open (creating if needed) the ledger file. Failure here is fatal for
    /// the control loop.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| unavailable(path, e))?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| unavailable(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<Vec<ChaosEvent>> {
        let file = File::open(&self.path).map_err(|e| unavailable(&self.path, e))?;
        let mut events = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| unavailable(&self.path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ChaosEvent>(&line) {
                Ok(event) => events.push(event),
                // A torn last line from a crash must not wedge the loop.
                Err(err) => warn!(
                    path = %self.path.display(),
                    line = index + 1,
                    error = %err,
                    "skipping unreadable ledger line"
                ),
            }
        }
        Ok(events)
    }
}

/// True when the file is non-empty and its last byte is not a newline, as
/// left by a crash mid-append.
fn ends_torn(file: &mut File) -> std::io::Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

fn unavailable(path: &Path, err: impl std::fmt::Display) -> ChaosError {
    ChaosError::LedgerUnavailable(format!("{}: {}", path.display(), err))
}

impl EventLedger for JsonlLedger {
    fn has_recent_event(&self, group: &str, window_start: DateTime<Utc>) -> Result<bool> {
        Ok(self
            .read_all()?
            .iter()
            .any(|event| counts_in_window(event, group, window_start)))
    }

    fn append(&self, event: ChaosEvent) -> Result<()> {
        let mut line = serde_json::to_string(&event).map_err(|e| unavailable(&self.path, e))?;
        line.push('\n');

        let _guard = self.writer.lock();
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| unavailable(&self.path, e))?;
        if ends_torn(&mut file).map_err(|e| unavailable(&self.path, e))? {
            warn!(path = %self.path.display(), "terminating torn ledger line");
            line.insert(0, '\n');
        }
        file.write_all(line.as_bytes())
            .and_then(|_| file.sync_data())
            .map_err(|e| unavailable(&self.path, e))
    }

    fn events(&self) -> Result<Vec<ChaosEvent>> {
        self.read_all()
    }
}
