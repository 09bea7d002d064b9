// CCTESTBED: Automated Congestion-Control Experiments on Controlled Network Testbeds
// Copyright (C) 2024-2025 The cctestbed developers
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//! Remote command execution over the system `ssh` binary.
//!
//! No retry happens at this level. Polling callers (e.g. the cloud lifecycle
//! waiting for an instance to boot) repeatedly attempt and treat
//! [`Error::Connect`] as "not ready yet".

use std::{path::Path, process::Stdio, time::Duration};

use async_trait::async_trait;
use tokio::process::{Child, Command};

use crate::{error::Error, hosts::Host};

/// Captured result of a finished command.
#[derive(Clone, Debug)]
pub struct CmdOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Promote a non-zero exit status into [`Error::CommandFailure`].
    pub fn require_success(self, host: &Host, cmd: &str) -> Result<CmdOutput, Error> {
        if self.success() {
            Ok(self)
        } else {
            log::debug!("stderr of failed `{cmd}`: {}", self.stderr.trim());
            Err(Error::CommandFailure {
                host: host.ip_wan.clone(),
                cmd: cmd.to_string(),
                status: self.status,
            })
        }
    }
}

/// A process left running in the background, local or behind an SSH session.
#[async_trait]
pub trait BackgroundProcess: Send {
    /// Terminate the process and reap it.
    async fn terminate(self: Box<Self>) -> Result<(), Error>;
}

/// Handle on a spawned child whose output is already redirected to a file.
pub struct ChildHandle {
    child: Child,
}

impl ChildHandle {
    pub fn new(child: Child) -> Self {
        Self { child }
    }
}

#[async_trait]
impl BackgroundProcess for ChildHandle {
    async fn terminate(mut self: Box<Self>) -> Result<(), Error> {
        if let Err(e) = self.child.start_kill() {
            log::debug!("background process already gone: {e}");
        }
        self.child.wait().await?;
        Ok(())
    }
}

/// Seam through which every remote command is issued. Production code uses
/// [`SshExecutor`]; tests script a fake.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run `cmd` on `host`, blocking until the remote process exits.
    async fn execute(&self, host: &Host, cmd: &str) -> Result<CmdOutput, Error>;

    /// Like [`Executor::execute`], but bounded by `budget`.
    async fn execute_with_timeout(
        &self,
        host: &Host,
        cmd: &str,
        budget: Duration,
    ) -> Result<CmdOutput, Error> {
        match tokio::time::timeout(budget, self.execute(host, cmd)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                host: host.ip_wan.clone(),
                cmd: cmd.to_string(),
                budget,
            }),
        }
    }

    /// Spawn `cmd` on `host` and leave it running, its stdout appended to the
    /// local file `log`.
    async fn spawn_background(
        &self,
        host: &Host,
        cmd: &str,
        log: &Path,
    ) -> Result<Box<dyn BackgroundProcess>, Error>;

    /// Cheap connectivity probe used by readiness polling.
    async fn check_connection(&self, host: &Host) -> Result<(), Error> {
        self.execute(host, "echo 'TESTING SSH CONNECTION'")
            .await
            .map(|_| ())
    }
}

/// Executes commands through the system `ssh` binary with key-based auth.
pub struct SshExecutor {
    connect_timeout: Duration,
}

impl Default for SshExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl SshExecutor {
    pub fn new() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }

    fn command(&self, host: &Host) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs()))
            .arg("-i")
            .arg(&host.key_filename)
            .arg(format!("{}@{}", host.username, host.ip_wan));
        cmd
    }
}

#[async_trait]
impl Executor for SshExecutor {
    async fn execute(&self, host: &Host, cmd: &str) -> Result<CmdOutput, Error> {
        log::debug!("running cmd ({}): {cmd}", host.ip_wan);
        let output = self.command(host).arg(cmd).output().await?;
        let status = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        // ssh reserves 255 for transport and authentication failures, but the
        // remote command may also exit 255; the client diagnostic on stderr
        // tells the two apart
        if status == 255 && ssh_transport_failure(&stderr) {
            return Err(Error::Connect {
                host: host.ip_wan.clone(),
                reason: stderr.trim().to_string(),
            });
        }
        Ok(CmdOutput {
            status,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr,
        })
    }

    async fn spawn_background(
        &self,
        host: &Host,
        cmd: &str,
        log: &Path,
    ) -> Result<Box<dyn BackgroundProcess>, Error> {
        log::debug!(
            "spawning background cmd ({}): {cmd} -> {}",
            host.ip_wan,
            log.display()
        );
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log)?;
        let child = self
            .command(host)
            .arg(cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::null())
            .spawn()?;
        Ok(Box::new(ChildHandle::new(child)))
    }
}

fn ssh_transport_failure(stderr: &str) -> bool {
    stderr.lines().any(|line| {
        line.starts_with("ssh:")
            || line.contains("Permission denied")
            || line.contains("Connection timed out")
            || line.contains("Connection closed")
            || line.contains("Host key verification failed")
            || line.contains("ssh_exchange_identification")
            || line.contains("kex_exchange_identification")
    })
}

/// Run a command on the local machine through `sh -c`, blocking until it
/// exits. Used for the shaping pipeline and local diagnostics.
pub async fn run_local_command(cmd: &str) -> Result<CmdOutput, Error> {
    log::debug!("running local cmd: {cmd}");
    let output = Command::new("sh").arg("-c").arg(cmd).output().await?;
    Ok(CmdOutput {
        status: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn host() -> Host {
        Host::new(
            "eth0",
            "eth0",
            "192.0.0.1",
            "10.0.0.1",
            "00:00.0",
            "/tmp/key",
            "user",
        )
        .unwrap()
    }

    #[tokio::test]
    async fn local_command_captures_output() {
        let out = run_local_command("echo hello && exit 0").await.unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");

        let out = run_local_command("exit 3").await.unwrap();
        assert_eq!(out.status, 3);
    }

    #[test]
    fn exit_255_is_connect_only_for_transport_diagnostics() {
        assert!(ssh_transport_failure(
            "ssh: connect to host 10.0.0.1 port 22: Connection refused\r\n"
        ));
        assert!(ssh_transport_failure(
            "user@10.0.0.1: Permission denied (publickey).\r\n"
        ));
        assert!(ssh_transport_failure(
            "kex_exchange_identification: read: Connection reset by peer\r\n"
        ));
        // a remote tool exiting 255 with its own stderr is a command failure
        assert!(!ssh_transport_failure("tool: fatal error, giving up\n"));
        assert!(!ssh_transport_failure(""));
    }

    #[test]
    fn require_success_maps_exit_status() {
        let ok = CmdOutput {
            status: 0,
            stdout: String::new(),
            stderr: String::new(),
        };
        assert!(ok.require_success(&host(), "true").is_ok());

        let failed = CmdOutput {
            status: 1,
            stdout: String::new(),
            stderr: String::new(),
        };
        match failed.require_success(&host(), "false") {
            Err(Error::CommandFailure { status, .. }) => assert_eq!(status, 1),
            other => panic!("expected CommandFailure, got {other:?}"),
        }
    }
}
