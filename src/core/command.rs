//! Opaque units of work.
//!
//! The orchestrator never interprets what a command does. It only observes
//! whether an invocation succeeded and what it printed. Shell strings from a
//! deployment plan become [`ShellCommand`]s; library callers and tests wrap
//! closures with [`from_fn`].

use futures::future::BoxFuture;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

/// Captured output of a successful invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn text(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Combined output, stdout first.
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr.trim_end()),
            (false, true) => self.stdout.trim_end().to_string(),
            (true, false) => self.stderr.trim_end().to_string(),
            (true, true) => String::new(),
        }
    }
}

/// A failed invocation: non-zero exit or a failure to launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandError {
    pub message: String,
    pub exit_code: Option<i32>,
    pub output: CommandOutput,
}

impl CommandError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            exit_code: None,
            output: CommandOutput::default(),
        }
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.exit_code {
            Some(code) => write!(f, "{} (exit code {})", self.message, code),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for CommandError {}

pub type CommandResult = std::result::Result<CommandOutput, CommandError>;
pub type CommandFuture = BoxFuture<'static, CommandResult>;

/// Something the orchestrator can invoke repeatedly.
///
/// Each call to `invoke` starts a fresh attempt. Dropping the returned
/// future must abandon the attempt; that is how timeouts terminate work.
pub trait Command: Send + Sync {
    fn invoke(&self) -> CommandFuture;

    /// Short human-readable form for logs.
    fn describe(&self) -> String {
        "<closure>".to_string()
    }
}

/// A script run through `sh -c`.
#[derive(Debug, Clone)]
pub struct ShellCommand {
    script: String,
    workdir: Option<PathBuf>,
    env: Vec<(String, String)>,
}

impl ShellCommand {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            workdir: None,
            env: Vec::new(),
        }
    }

    pub fn with_workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn script(&self) -> &str {
        &self.script
    }

    /// First word of the script, used to check the program is on PATH.
    pub fn program(&self) -> Option<&str> {
        self.script.split_whitespace().next()
    }
}

impl Command for ShellCommand {
    fn invoke(&self) -> CommandFuture {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(&self.script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // own group, so a timeout can kill subshells and background jobs too
        #[cfg(unix)]
        cmd.process_group(0);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        Box::pin(async move {
            let child = cmd
                .spawn()
                .map_err(|e| CommandError::new(format!("failed to launch: {}", e)))?;
            let group = ProcessGroupGuard::new(child.id());
            let output = child
                .wait_with_output()
                .await
                .map_err(|e| CommandError::new(format!("failed to wait: {}", e)))?;
            // the shell finished on its own; anything it left running was meant to
            group.disarm();

            let captured = CommandOutput {
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            };

            if output.status.success() {
                return Ok(captured);
            }

            let message = if captured.stderr.trim().is_empty() {
                "command exited unsuccessfully".to_string()
            } else {
                captured.stderr.trim().to_string()
            };
            Err(CommandError {
                message,
                exit_code: output.status.code(),
                output: captured,
            })
        })
    }

    fn describe(&self) -> String {
        self.script.clone()
    }
}

/// Kills a shell's whole process group unless disarmed.
///
/// Dropping an attempt's future (timeout, cancellation) drops the guard
/// while the shell is still running.
struct ProcessGroupGuard {
    pgid: Option<u32>,
}

impl ProcessGroupGuard {
    fn new(pid: Option<u32>) -> Self {
        Self { pgid: pid }
    }

    fn disarm(mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_process_group(pgid);
        }
    }
}

#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return;
    };
    // SAFETY: killpg only sends a signal; a group that already exited
    // yields ESRCH, which is ignored.
    unsafe {
        libc::killpg(pgid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: u32) {}

/// A closure producing a fresh future per attempt.
pub struct FnCommand<F> {
    f: F,
    label: String,
}

impl<F, Fut> Command for FnCommand<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = CommandResult> + Send + 'static,
{
    fn invoke(&self) -> CommandFuture {
        Box::pin((self.f)())
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

/// Wrap an async closure as a shareable command.
pub fn from_fn<F, Fut>(f: F) -> Arc<dyn Command>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CommandResult> + Send + 'static,
{
    Arc::new(FnCommand {
        f,
        label: "<closure>".to_string(),
    })
}

/// Like [`from_fn`] with a label shown in logs.
pub fn labeled<F, Fut>(label: impl Into<String>, f: F) -> Arc<dyn Command>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CommandResult> + Send + 'static,
{
    Arc::new(FnCommand {
        f,
        label: label.into(),
    })
}

/// Shorthand for a shell script command.
pub fn shell(script: impl Into<String>) -> Arc<dyn Command> {
    Arc::new(ShellCommand::new(script))
}
