// SPDX-License-Identifier: PMPL-1.0-or-later

//! Disruption scripts and how they are invoked over ssh.

use crate::credentials::CredentialSet;
use crate::types::{DisruptionMode, Script};
use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::Path;

static BUILTIN: &[(&str, &str)] = &[
    ("shutdown", include_str!("../../resources/scripts/shutdown.sh")),
    ("burn-cpu", include_str!("../../resources/scripts/burn-cpu.sh")),
    (
        "kill-processes",
        include_str!("../../resources/scripts/kill-processes.sh"),
    ),
];

pub fn builtin(name: &str) -> Option<Script> {
    BUILTIN
        .iter()
        .find(|(candidate, _)| *candidate == name)
        .map(|(label, body)| Script {
            label: (*label).to_string(),
            body: (*body).to_string(),
        })
}

pub fn builtin_names() -> impl Iterator<Item = &'static str> {
    BUILTIN.iter().map(|(name, _)| *name)
}

/// Parse a configured disruption: `terminate`, a builtin script name, or
/// `script:<path>` (read now, relative paths against `base_dir`).
pub fn parse_mode(raw: &str, base_dir: &Path) -> Result<DisruptionMode> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("terminate") {
        return Ok(DisruptionMode::Terminate);
    }
    if let Some(path) = raw.strip_prefix("script:") {
        let path = base_dir.join(crate::keys::expand_home(path));
        let body = fs::read_to_string(&path)
            .with_context(|| format!("reading disruption script {}", path.display()))?;
        let label = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_else(|| "script".to_string());
        return Ok(DisruptionMode::Script(Script { label, body }));
    }
    builtin(&raw.to_ascii_lowercase())
        .map(DisruptionMode::Script)
        .ok_or_else(|| {
            anyhow!(
                "unknown disruption '{}' (expected terminate, {}, or script:<path>)",
                raw,
                builtin_names().collect::<Vec<_>>().join(", ")
            )
        })
}

/// The remote command and its stdin for running `script` as `credentials`.
///
/// The script body is fed on stdin to `/bin/sh -s`; non-root logins escalate
/// with sudo, reading the password from stdin when one is known.
pub fn invocation(credentials: &CredentialSet, script: &Script) -> (String, Vec<u8>) {
    let mut stdin = Vec::with_capacity(script.body.len() + 32);
    let command = if !credentials.sudo() {
        "/bin/sh -s".to_string()
    } else if let Some(password) = credentials.sudo_password() {
        stdin.extend_from_slice(password.as_bytes());
        stdin.push(b'\n');
        "sudo -S -p '' /bin/sh -s".to_string()
    } else {
        "sudo -n /bin/sh -s".to_string()
    };
    stdin.extend_from_slice(script.body.as_bytes());
    (command, stdin)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn builtins_parse() {
        for name in ["shutdown", "burn-cpu", "kill-processes"] {
            let mode = parse_mode(name, Path::new(".")).expect("builtin parses");
            assert_eq!(mode.label(), name);
        }
        assert_eq!(
            parse_mode("Terminate", Path::new(".")).expect("parses"),
            DisruptionMode::Terminate
        );
    }

    #[test]
    fn custom_script_is_read_relative_to_base() {
        let dir = TempDir::new().expect("tempdir should create");
        fs::write(dir.path().join("fill-disk.sh"), "dd if=/dev/zero of=/tmp/x\n")
            .expect("script should write");
        let mode = parse_mode("script:fill-disk.sh", dir.path()).expect("parses");
        match mode {
            DisruptionMode::Script(script) => {
                assert_eq!(script.label, "fill-disk");
                assert!(script.body.contains("dd if=/dev/zero"));
            }
            other => panic!("unexpected mode {:?}", other),
        }
    }

    #[test]
    fn unknown_disruption_lists_choices() {
        let err = parse_mode("melt", Path::new(".")).unwrap_err();
        assert!(err.to_string().contains("burn-cpu"));
    }

    #[test]
    fn root_runs_without_sudo() {
        let creds = CredentialSet::with_private_key("root", b"k".to_vec(), None);
        let script = builtin("shutdown").expect("builtin");
        let (command, stdin) = invocation(&creds, &script);
        assert_eq!(command, "/bin/sh -s");
        assert_eq!(stdin, script.body.as_bytes());
    }

    #[test]
    fn sudo_password_goes_first_on_stdin() {
        let creds = CredentialSet::with_password("scott", "tiger");
        let script = builtin("kill-processes").expect("builtin");
        let (command, stdin) = invocation(&creds, &script);
        assert!(command.starts_with("sudo -S"));
        assert!(stdin.starts_with(b"tiger\n"));
    }

    #[test]
    fn key_login_uses_non_interactive_sudo() {
        let creds = CredentialSet::with_private_key("deploy", b"k".to_vec(), None);
        let script = builtin("burn-cpu").expect("builtin");
        let (command, _) = invocation(&creds, &script);
        assert_eq!(command, "sudo -n /bin/sh -s");
    }
}
