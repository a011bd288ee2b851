// SPDX-License-Identifier: PMPL-1.0-or-later

//! Disruption clients: carry out one disruptive action against one instance.
//!
//! Clients never retry. A failed call is reported to the engine, which
//! records it and moves on.

pub mod scripts;
pub mod ssh;

pub use ssh::{Endpoint, ScriptOutput, SessionGuard, Ssh2Connector, SshConnector};

use crate::catalog::InstanceCatalog;
use crate::credentials::{self, CredentialSet, GlobalSshDefaults};
use crate::error::{ChaosError, Result};
use crate::types::Script;
use ssh::ExecError;
use std::process::{Command, Output, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub const DEFAULT_SCRIPT_TIMEOUT: Duration = Duration::from_secs(60);

pub trait DisruptionClient: Send + Sync {
    /// Backend name used in logs and errors.
    fn backend(&self) -> &'static str;

    /// Terminate through the provider API. Backends without one return
    /// `UnsupportedOperation`.
    fn terminate(&self, instance_id: &str) -> Result<()>;

    /// Effective login for an instance.
    fn credentials(&self, instance_id: &str) -> Result<CredentialSet>;

    /// Log in and run `script`. The session is closed before returning,
    /// whatever the outcome.
    fn run_remote_script(
        &self,
        instance_id: &str,
        credentials: &CredentialSet,
        script: &Script,
    ) -> Result<ScriptOutput>;
}

/// Client for statically described machines: ssh only, no provider API
pub struct LocalClient {
    catalog: Arc<dyn InstanceCatalog>,
    connector: Arc<dyn SshConnector>,
    global: GlobalSshDefaults,
    script_timeout: Duration,
}

impl LocalClient {
    pub fn new(
        catalog: Arc<dyn InstanceCatalog>,
        connector: Arc<dyn SshConnector>,
        global: GlobalSshDefaults,
        script_timeout: Duration,
    ) -> Self {
        Self {
            catalog,
            connector,
            global,
            script_timeout,
        }
    }

    fn endpoint(&self, instance_id: &str) -> Result<Endpoint> {
        let instance = self
            .catalog
            .instance(instance_id)
            .ok_or_else(|| ChaosError::InstanceNotFound(instance_id.to_string()))?;
        Ok(Endpoint {
            host: instance.host().to_string(),
            port: instance.ssh_port(),
        })
    }
}

impl DisruptionClient for LocalClient {
    fn backend(&self) -> &'static str {
        "local"
    }

    fn terminate(&self, _instance_id: &str) -> Result<()> {
        // Static machines have no provisioning API; the engine uses a script.
        Err(ChaosError::UnsupportedOperation {
            backend: self.backend(),
            operation: "terminate",
        })
    }

    fn credentials(&self, instance_id: &str) -> Result<CredentialSet> {
        let instance = self
            .catalog
            .instance(instance_id)
            .ok_or_else(|| ChaosError::InstanceNotFound(instance_id.to_string()))?;
        if let Some(reason) = instance.key_error() {
            return Err(ChaosError::KeyUnavailable {
                instance: instance_id.to_string(),
                reason: reason.to_string(),
            });
        }
        Ok(credentials::resolve(&instance.login(), &self.global))
    }

    fn run_remote_script(
        &self,
        instance_id: &str,
        credentials: &CredentialSet,
        script: &Script,
    ) -> Result<ScriptOutput> {
        if !credentials.is_enabled() {
            return Err(ChaosError::CredentialsDisabled(instance_id.to_string()));
        }
        let endpoint = self.endpoint(instance_id)?;
        info!(
            instance = instance_id,
            endpoint = %endpoint,
            user = credentials.username(),
            auth = credentials.auth().kind(),
            script = %script.label,
            "running disruption script"
        );

        let mut guard = SessionGuard::new(self.connector.connect(&endpoint, credentials)?);
        let (command, stdin) = scripts::invocation(credentials, script);
        let output = guard
            .session()
            .exec(&command, &stdin, self.script_timeout)
            .map_err(|err| match err {
                ExecError::TimedOut => ChaosError::TimedOut {
                    operation: "script",
                    instance: instance_id.to_string(),
                    timeout: self.script_timeout,
                },
                ExecError::NotStarted(reason) => ChaosError::ScriptExecutionFailure {
                    instance: instance_id.to_string(),
                    exit_status: None,
                    reason,
                },
                ExecError::Interrupted(reason) => ChaosError::ScriptInterrupted {
                    instance: instance_id.to_string(),
                    reason,
                },
            })?;

        if output.exit_status != 0 {
            return Err(ChaosError::ScriptExecutionFailure {
                instance: instance_id.to_string(),
                exit_status: Some(output.exit_status),
                reason: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }
}

/// Client that terminates through an external provider command, e.g.
/// `aws ec2 terminate-instances --instance-ids {instance}`. Scripted
/// disruptions go over ssh like the local client.
pub struct CommandClient {
    command: Vec<String>,
    timeout: Duration,
    ssh: LocalClient,
}

impl CommandClient {
    pub const PLACEHOLDER: &'static str = "{instance}";

    pub fn new(command: Vec<String>, timeout: Duration, ssh: LocalClient) -> Result<Self> {
        if command.is_empty() {
            return Err(ChaosError::Config(
                "terminate_command must name a program".to_string(),
            ));
        }
        if !command.iter().any(|arg| arg.contains(Self::PLACEHOLDER)) {
            return Err(ChaosError::Config(format!(
                "terminate_command must contain {}",
                Self::PLACEHOLDER
            )));
        }
        Ok(Self {
            command,
            timeout,
            ssh,
        })
    }

    fn argv(&self, instance_id: &str) -> Vec<String> {
        self.command
            .iter()
            .map(|arg| arg.replace(Self::PLACEHOLDER, instance_id))
            .collect()
    }
}

impl DisruptionClient for CommandClient {
    fn backend(&self) -> &'static str {
        "command"
    }

    fn terminate(&self, instance_id: &str) -> Result<()> {
        let argv = self.argv(instance_id);
        info!(instance = instance_id, command = ?argv, "terminating instance");
        let failure = |reason: String| ChaosError::TerminateFailure {
            instance: instance_id.to_string(),
            reason,
        };

        match run_with_deadline(&argv, self.timeout).map_err(|e| failure(e.to_string()))? {
            Some(output) if output.status.success() => Ok(()),
            Some(output) => Err(failure(format!(
                "exit code {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
            None => Err(ChaosError::TimedOut {
                operation: "terminate",
                instance: instance_id.to_string(),
                timeout: self.timeout,
            }),
        }
    }

    fn credentials(&self, instance_id: &str) -> Result<CredentialSet> {
        self.ssh.credentials(instance_id)
    }

    fn run_remote_script(
        &self,
        instance_id: &str,
        credentials: &CredentialSet,
        script: &Script,
    ) -> Result<ScriptOutput> {
        self.ssh.run_remote_script(instance_id, credentials, script)
    }
}

/// Run a command to completion or kill it at the deadline. `None` means the
/// deadline hit first.
fn run_with_deadline(argv: &[String], timeout: Duration) -> std::io::Result<Option<Output>> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"))?;
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let start = Instant::now();
    loop {
        if child.try_wait()?.is_some() {
            return child.wait_with_output().map(Some);
        }
        if start.elapsed() >= timeout {
            if let Err(err) = child.kill() {
                warn!(program = %program, error = %err, "failed to kill command at deadline");
            }
            let _ = child.wait();
            return Ok(None);
        }
        thread::sleep(Duration::from_millis(20));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::LocalInstance;
    use crate::types::InstanceGroup;
    use parking_lot::Mutex;
    use ssh::RemoteSession;

    struct OneInstance(Arc<LocalInstance>);

    impl InstanceCatalog for OneInstance {
        fn instance_groups(&self) -> Vec<InstanceGroup> {
            Vec::new()
        }

        fn instance(&self, id: &str) -> Option<Arc<LocalInstance>> {
            (id == self.0.id()).then(|| self.0.clone())
        }
    }

    #[derive(Default)]
    struct Recording {
        commands: Mutex<Vec<(String, String)>>,
        closes: Mutex<usize>,
        exit_status: i32,
        exec_error: Option<ExecError>,
    }

    struct RecordingSession {
        log: Arc<Recording>,
        endpoint: String,
    }

    impl RemoteSession for RecordingSession {
        fn exec(
            &mut self,
            command: &str,
            _stdin: &[u8],
            _timeout: Duration,
        ) -> std::result::Result<ScriptOutput, ExecError> {
            self.log
                .commands
                .lock()
                .push((self.endpoint.clone(), command.to_string()));
            if let Some(err) = &self.log.exec_error {
                return Err(err.clone());
            }
            Ok(ScriptOutput {
                exit_status: self.log.exit_status,
                stdout: String::new(),
                stderr: "boom".to_string(),
            })
        }

        fn close(&mut self) {
            *self.log.closes.lock() += 1;
        }
    }

    struct RecordingConnector(Arc<Recording>);

    impl SshConnector for RecordingConnector {
        fn connect(
            &self,
            endpoint: &Endpoint,
            _credentials: &CredentialSet,
        ) -> Result<Box<dyn RemoteSession>> {
            Ok(Box::new(RecordingSession {
                log: self.0.clone(),
                endpoint: endpoint.to_string(),
            }))
        }
    }

    fn client(log: Arc<Recording>) -> LocalClient {
        let instance = LocalInstance::new("i1", "10.1.1.1")
            .with_username("scott")
            .with_password("tiger")
            .with_ssh_port(2222);
        LocalClient::new(
            Arc::new(OneInstance(Arc::new(instance))),
            Arc::new(RecordingConnector(log)),
            GlobalSshDefaults::default(),
            DEFAULT_SCRIPT_TIMEOUT,
        )
    }

    #[test]
    fn local_terminate_is_unsupported() {
        let err = client(Arc::default()).terminate("i1").unwrap_err();
        assert!(matches!(
            err,
            ChaosError::UnsupportedOperation {
                backend: "local",
                operation: "terminate"
            }
        ));
    }

    #[test]
    fn script_runs_against_catalog_endpoint_and_closes() {
        let log = Arc::new(Recording::default());
        let client = client(log.clone());
        let creds = client.credentials("i1").expect("credentials");
        let script = scripts::builtin("shutdown").expect("builtin");
        client
            .run_remote_script("i1", &creds, &script)
            .expect("script runs");

        let commands = log.commands.lock();
        assert_eq!(commands[0].0, "10.1.1.1:2222");
        assert!(commands[0].1.starts_with("sudo -S"));
        assert_eq!(*log.closes.lock(), 1);
    }

    #[test]
    fn non_zero_exit_is_failure_and_still_closes() {
        let log = Arc::new(Recording {
            exit_status: 3,
            ..Default::default()
        });
        let client = client(log.clone());
        let creds = client.credentials("i1").expect("credentials");
        let script = scripts::builtin("shutdown").expect("builtin");
        let err = client.run_remote_script("i1", &creds, &script).unwrap_err();
        assert!(matches!(
            err,
            ChaosError::ScriptExecutionFailure {
                exit_status: Some(3),
                ..
            }
        ));
        assert_eq!(*log.closes.lock(), 1);
    }

    #[test]
    fn exec_errors_map_by_whether_the_script_started() {
        let cases: [(ExecError, fn(&ChaosError) -> bool); 3] = [
            (ExecError::NotStarted("channel refused".to_string()), |err| {
                matches!(err, ChaosError::ScriptExecutionFailure { exit_status: None, .. })
            }),
            (ExecError::TimedOut, |err| {
                matches!(err, ChaosError::TimedOut { operation: "script", .. })
            }),
            (ExecError::Interrupted("connection reset".to_string()), |err| {
                matches!(err, ChaosError::ScriptInterrupted { .. })
            }),
        ];
        for (exec_error, expected) in cases {
            let log = Arc::new(Recording {
                exec_error: Some(exec_error),
                ..Default::default()
            });
            let client = client(log.clone());
            let creds = client.credentials("i1").expect("credentials");
            let script = scripts::builtin("shutdown").expect("builtin");
            let err = client.run_remote_script("i1", &creds, &script).unwrap_err();
            assert!(expected(&err), "unexpected mapping: {:?}", err);
            assert_eq!(*log.closes.lock(), 1);
        }
    }

    #[test]
    fn unreadable_key_fails_credentials_for_that_instance_only() {
        let broken = LocalInstance::new("i4", "10.1.1.4")
            .with_key_error("/no/such/key", "unable to read ssh key /no/such/key");
        let client = LocalClient::new(
            Arc::new(OneInstance(Arc::new(broken))),
            Arc::new(RecordingConnector(Arc::default())),
            GlobalSshDefaults::default(),
            DEFAULT_SCRIPT_TIMEOUT,
        );
        let err = client.credentials("i4").unwrap_err();
        assert!(matches!(err, ChaosError::KeyUnavailable { .. }));
        assert!(err.to_string().contains("/no/such/key"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn unknown_instance_is_not_found() {
        let err = client(Arc::default()).credentials("ghost").unwrap_err();
        assert!(matches!(err, ChaosError::InstanceNotFound(_)));
    }

    #[test]
    fn disabled_credentials_never_connect() {
        let log = Arc::new(Recording::default());
        let client = client(log.clone());
        let script = scripts::builtin("shutdown").expect("builtin");
        let err = client
            .run_remote_script("i1", &CredentialSet::disabled("scott"), &script)
            .unwrap_err();
        assert!(matches!(err, ChaosError::CredentialsDisabled(_)));
        assert!(log.commands.lock().is_empty());
    }

    #[test]
    fn command_client_requires_placeholder() {
        let err = CommandClient::new(
            vec!["echo".to_string()],
            Duration::from_secs(1),
            client(Arc::default()),
        )
        .err()
        .expect("must be rejected");
        assert!(matches!(err, ChaosError::Config(_)));
    }

    #[cfg(unix)]
    #[test]
    fn command_client_terminates_and_reports_failures() {
        let ok = CommandClient::new(
            vec!["sh".into(), "-c".into(), "test {instance} = i1".into()],
            Duration::from_secs(5),
            client(Arc::default()),
        )
        .expect("valid command");
        assert!(ok.terminate("i1").is_ok());
        assert!(matches!(
            ok.terminate("i2").unwrap_err(),
            ChaosError::TerminateFailure { .. }
        ));
    }

    #[cfg(unix)]
    #[test]
    fn command_client_times_out() {
        let slow = CommandClient::new(
            vec!["sh".into(), "-c".into(), "sleep 5 # {instance}".into()],
            Duration::from_millis(200),
            client(Arc::default()),
        )
        .expect("valid command");
        let start = Instant::now();
        let err = slow.terminate("i1").unwrap_err();
        assert!(matches!(err, ChaosError::TimedOut { .. }));
        assert!(start.elapsed() < Duration::from_secs(3));
    }
}
