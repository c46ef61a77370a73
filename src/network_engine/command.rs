//! Execution of kernel-facing commands.
//!
//! Every `mount`, `ip`, `iptables`, `ovs-vsctl` or `sshd` invocation made by the lab
//! goes through a [`CommandRunner`], so that the orchestration logic can be exercised
//! without root privileges.

use async_trait::async_trait;
use log::debug;
use std::process::Stdio;
use tokio::process::{Child, Command};

/// Captured result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    /// Exit code, `None` when the process was killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success() -> Self {
        CommandOutput {
            status: Some(0),
            ..Default::default()
        }
    }

    pub fn failure(stderr: impl Into<String>) -> Self {
        CommandOutput {
            status: Some(1),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Some(0)
    }
}

/// A long-running child process started by a runner.
#[derive(Debug)]
pub struct SpawnedProcess {
    pub pid: u32,
    /// Live handle when the process was spawned for real.
    pub child: Option<Child>,
}

/// Renders `program args...` for logs and error messages.
pub fn command_line(program: &str, args: &[String]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

pub fn to_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `program` to completion and captures its output.
    async fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput>;

    /// Starts `program` in the background and returns without waiting for it.
    async fn spawn(&self, program: &str, args: &[String]) -> std::io::Result<SpawnedProcess>;
}

/// Runs commands on the host with `tokio::process`.
#[derive(Debug, Default, Clone)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        SystemRunner
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput> {
        debug!("Running: {}", command_line(program, args));
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn spawn(&self, program: &str, args: &[String]) -> std::io::Result<SpawnedProcess> {
        debug!("Spawning: {}", command_line(program, args));
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let pid = child.id().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("{} exited before its pid could be read", program),
            )
        })?;

        Ok(SpawnedProcess {
            pid,
            child: Some(child),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line_rendering() {
        let args = to_args(&["-t", "nat", "-F"]);
        assert_eq!(command_line("iptables", &args), "iptables -t nat -F");
        assert_eq!(command_line("true", &[]), "true");
    }

    #[tokio::test]
    async fn test_system_runner_captures_output() {
        let runner = SystemRunner::new();
        let output = runner
            .run("sh", &to_args(&["-c", "echo out; echo err >&2; exit 3"]))
            .await
            .unwrap();
        assert_eq!(output.status, Some(3));
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
        assert!(!output.is_success());
    }

    #[tokio::test]
    async fn test_system_runner_spawn_reports_pid() {
        let runner = SystemRunner::new();
        let mut spawned = runner.spawn("sleep", &to_args(&["5"])).await.unwrap();
        assert!(spawned.pid > 0);
        if let Some(mut child) = spawned.child.take() {
            child.kill().await.unwrap();
        }
    }
}
