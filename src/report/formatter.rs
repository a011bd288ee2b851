// SPDX-License-Identifier: PMPL-1.0-or-later

//! Console rendering

use super::output::ReportOutputFormat;
use crate::catalog::{CatalogSnapshot, CatalogSource};
use crate::credentials::{Auth, CredentialSet};
use crate::types::*;
use anyhow::{Context, Result};
use colored::*;
use std::fs;
use std::path::{Path, PathBuf};

pub struct ReportFormatter;

impl ReportFormatter {
    pub fn new() -> Self {
        Self
    }

    pub fn print(&self, report: &CycleReport) {
        println!("\n{}", "=== CHAOS-WARDEN CYCLE REPORT ===".bold().cyan());
        println!(
            "  Started: {}  Window start: {}",
            report.started_at.to_rfc3339(),
            report.window_start.to_rfc3339()
        );
        let elapsed = report.finished_at - report.started_at;
        println!("  Duration: {:.2}s", elapsed.num_milliseconds() as f64 / 1000.0);
        println!();

        if report.groups.is_empty() {
            println!("{}", "No instance groups found".yellow());
            return;
        }

        println!("{}", "GROUPS".bold().yellow());
        for group in &report.groups {
            println!(
                "  {} [{}] ({} members): {}",
                group.group.bold(),
                group.group_type,
                group.members,
                colored_verdict(&group.verdict)
            );
        }
        println!();

        let disrupted = report.disruptions().count();
        if disrupted == 0 {
            println!("{}", "No instances disrupted".green());
        } else {
            println!("  Disrupted: {}", disrupted.to_string().red().bold());
        }
    }

    pub fn print_history(&self, events: &[ChaosEvent]) {
        println!("\n{}", "=== CHAOS EVENT HISTORY ===".bold().cyan());
        if events.is_empty() {
            println!("{}", "No events recorded".green());
            return;
        }
        for event in events {
            println!(
                "  {} {} {}/{} via {}",
                event.timestamp.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
                colored_outcome(event.outcome),
                event.group.bold(),
                event.instance,
                event.disruption
            );
            if let Some(detail) = &event.detail {
                println!("      {}", detail.dimmed());
            }
        }
        println!("  Total: {}", events.len());
    }

    pub fn print_catalog(&self, source: &CatalogSource, snapshot: &CatalogSnapshot) {
        println!("\n{}", "=== INSTANCE CATALOG ===".bold().cyan());
        println!("  Source: {}", source);
        if snapshot.groups.is_empty() {
            println!("{}", "No instance groups found".yellow());
            return;
        }
        for group in &snapshot.groups {
            println!(
                "  {} ({} instances)",
                group.name().bold(),
                group.instances().len()
            );
            for id in group.instances() {
                match snapshot.instances.get(id) {
                    Some(instance) => {
                        let key = if instance.private_key_path().is_some() {
                            " key".dimmed().to_string()
                        } else {
                            String::new()
                        };
                        println!(
                            "    - {} {} user={}{}",
                            id,
                            instance.endpoint(),
                            instance.username().unwrap_or("-"),
                            key
                        );
                    }
                    None => println!("    - {}", id),
                }
            }
        }
    }

    /// Summary without secrets.
    pub fn print_credentials(&self, instance: &str, credentials: &CredentialSet) {
        println!("\n{}", "=== RESOLVED CREDENTIALS ===".bold().cyan());
        println!("  Instance: {}", instance.bold());
        println!("  User: {}", credentials.username());
        let auth = match credentials.auth() {
            Auth::NoAuth => "none (disabled)".red().to_string(),
            Auth::Password(_) => "password".green().to_string(),
            Auth::PrivateKey { passphrase, .. } => {
                if passphrase.is_some() {
                    "private key (passphrase set)".green().to_string()
                } else {
                    "private key".green().to_string()
                }
            }
        };
        println!("  Auth: {}", auth);
        println!(
            "  Login password: {}",
            if credentials.login_password().is_some() {
                "known"
            } else {
                "none"
            }
        );
        println!(
            "  Sudo: {}{}",
            credentials.sudo(),
            if credentials.sudo_password().is_some() {
                " (password known)"
            } else {
                ""
            }
        );
    }

    /// Write the report in the format named by the file extension. Without a
    /// known extension it is written as JSON and `.json` is appended.
    pub fn save<P: AsRef<Path>>(&self, report: &CycleReport, path: P) -> Result<PathBuf> {
        let path = path.as_ref();
        let known = path
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(ReportOutputFormat::parse);
        let (format, path) = match known {
            Some(format) => (format, path.to_path_buf()),
            None => {
                let format = ReportOutputFormat::Json;
                let mut named = path.as_os_str().to_owned();
                named.push(".");
                named.push(format.extension());
                (format, PathBuf::from(named))
            }
        };
        let body = format.serialize(report)?;
        fs::write(&path, body).with_context(|| format!("writing report {}", path.display()))?;
        println!("Report saved to: {}", path.display());
        Ok(path)
    }
}

impl Default for ReportFormatter {
    fn default() -> Self {
        Self::new()
    }
}

/// Plain one-line description of a verdict.
pub fn describe_verdict(verdict: &GroupVerdict) -> String {
    match verdict {
        GroupVerdict::Disabled => "disabled".to_string(),
        GroupVerdict::AlreadyHit => "already disrupted this window".to_string(),
        GroupVerdict::NotSelected { roll, probability } => {
            format!("not selected (roll {:.3} vs p {:.3})", roll, probability)
        }
        GroupVerdict::EmptyGroup => "no instances".to_string(),
        GroupVerdict::Leashed { instance } => format!("leashed, would disrupt {}", instance),
        GroupVerdict::Disrupted { instance, outcome } => format!("{} {}", outcome, instance),
        GroupVerdict::DeadlineExceeded => "cycle deadline exceeded".to_string(),
    }
}

fn colored_verdict(verdict: &GroupVerdict) -> ColoredString {
    let text = describe_verdict(verdict);
    match verdict {
        GroupVerdict::Disrupted { outcome, .. } => match outcome {
            Outcome::Succeeded => text.red().bold(),
            Outcome::Skipped | Outcome::Unsupported => text.yellow(),
            Outcome::Failed | Outcome::TimedOut => text.magenta(),
        },
        GroupVerdict::Leashed { .. } => text.blue(),
        GroupVerdict::DeadlineExceeded => text.yellow(),
        _ => text.dimmed(),
    }
}

fn colored_outcome(outcome: Outcome) -> ColoredString {
    let text = outcome.to_string();
    match outcome {
        Outcome::Succeeded => text.green(),
        Outcome::Failed | Outcome::TimedOut => text.red(),
        Outcome::Skipped | Outcome::Unsupported => text.yellow(),
    }
}
