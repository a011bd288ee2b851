// SPDX-License-Identifier: PMPL-1.0-or-later

//! Human and machine readable reports for cycles, history and inventory

pub mod formatter;
pub mod output;

pub use formatter::ReportFormatter;
pub use output::ReportOutputFormat;

use crate::types::CycleReport;
use anyhow::Result;
use std::path::{Path, PathBuf};

/// Save a cycle report, format chosen by the file extension (JSON default).
/// Returns the path actually written.
pub fn save_report<P: AsRef<Path>>(report: &CycleReport, path: P) -> Result<PathBuf> {
    ReportFormatter::new().save(report, path)
}

/// Print a cycle report to the console
pub fn print_report(report: &CycleReport) {
    ReportFormatter::new().print(report);
}
