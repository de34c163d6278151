//! Subprocess execution under an explicit identity
//!
//! Every external tool chanlock talks to (`nix-channel`, `git`, `readlink`,
//! `nix-instantiate`) goes through a [`CommandRunner`]. The identity to run
//! as, the verbosity and the cancellation flag travel in an [`ExecContext`]
//! that callers pass down explicitly.

use std::fmt;
use std::io::{self, Read, Write};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::error::{ChanlockError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(25);
const SUDO: &str = "sudo";

/// Cooperative cancellation signal shared with the caller
#[derive(Debug, Clone)]
pub enum CancelFlag {
    Owned(Arc<AtomicBool>),
    Static(&'static AtomicBool),
}

impl Default for CancelFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::Owned(Arc::new(AtomicBool::new(false)))
    }

    /// Wrap a flag owned by a signal handler
    pub fn from_static(flag: &'static AtomicBool) -> Self {
        Self::Static(flag)
    }

    pub fn cancel(&self) {
        self.flag().store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag().load(Ordering::SeqCst)
    }

    fn flag(&self) -> &AtomicBool {
        match self {
            Self::Owned(flag) => flag,
            Self::Static(flag) => flag,
        }
    }
}

/// The local user a command runs as
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    pub username: String,
    /// Allow `sudo -u <username>` when it differs from the running user
    pub use_sudo: bool,
}

impl Identity {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            use_sudo: false,
        }
    }

    pub fn with_sudo(mut self, use_sudo: bool) -> Self {
        self.use_sudo = use_sudo;
        self
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.username)
    }
}

/// Per-invocation execution settings
#[derive(Debug, Clone)]
pub struct ExecContext {
    pub current_user: String,
    /// Echo the stderr of every subprocess
    pub verbose: bool,
    pub cancel: CancelFlag,
}

impl ExecContext {
    pub fn new(current_user: impl Into<String>) -> Self {
        Self {
            current_user: current_user.into(),
            verbose: false,
            cancel: CancelFlag::new(),
        }
    }

    /// Build a context for the user running this process.
    ///
    /// `$USER` is trusted first, then `id -un`.
    pub fn detect() -> Result<Self> {
        if let Ok(user) = std::env::var("USER") {
            if !user.is_empty() {
                return Ok(Self::new(user));
            }
        }

        let output = Command::new("id").arg("-un").output()?;
        let user = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !output.status.success() || user.is_empty() {
            return Err(ChanlockError::ProcessFailed {
                command: "id -un".to_string(),
                status: output.status.to_string(),
            });
        }
        Ok(Self::new(user))
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn is_current(&self, identity: &Identity) -> bool {
        identity.username.is_empty() || identity.username == self.current_user
    }

    pub fn current_identity(&self) -> Identity {
        Identity::new(self.current_user.clone())
    }

    /// The same settings with a cancel flag that is not set
    pub fn uncancelled(&self) -> Self {
        Self {
            cancel: CancelFlag::new(),
            ..self.clone()
        }
    }
}

/// A fully built command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    /// Inherit stdin so sudo can prompt for a password
    pub interactive: bool,
}

impl Invocation {
    /// Build the command line for running `program` as `identity`.
    ///
    /// Running as a different user goes through `sudo -u` and fails closed
    /// unless the identity allows it.
    pub fn build(
        ctx: &ExecContext,
        identity: &Identity,
        program: &str,
        args: &[String],
    ) -> Result<Self> {
        if ctx.is_current(identity) {
            return Ok(Self {
                program: program.to_string(),
                args: args.to_vec(),
                interactive: false,
            });
        }

        if !identity.use_sudo {
            return Err(ChanlockError::EscalationDenied {
                username: identity.username.clone(),
            });
        }

        let mut sudo_args = vec![
            "-u".to_string(),
            identity.username.clone(),
            program.to_string(),
        ];
        sudo_args.extend_from_slice(args);

        Ok(Self {
            program: SUDO.to_string(),
            args: sudo_args,
            interactive: true,
        })
    }

    /// The program and arguments that eventually run, without any sudo prefix
    pub fn target(&self) -> (&str, &[String]) {
        if self.program == SUDO && self.args.len() >= 3 && self.args[0] == "-u" {
            (self.args[2].as_str(), &self.args[3..])
        } else {
            (self.program.as_str(), &self.args)
        }
    }

    /// The user a sudo-wrapped invocation runs as
    pub fn sudo_user(&self) -> Option<&str> {
        if self.program == SUDO && self.args.len() >= 3 && self.args[0] == "-u" {
            Some(self.args[1].as_str())
        } else {
            None
        }
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Runs invocations and returns their stdout
pub trait CommandRunner: Send + Sync {
    fn run(&self, ctx: &ExecContext, invocation: &Invocation) -> Result<String>;
}

/// Runs invocations as real subprocesses
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, ctx: &ExecContext, invocation: &Invocation) -> Result<String> {
        let command = invocation.to_string();
        if ctx.cancel.is_cancelled() {
            return Err(ChanlockError::Cancelled { command });
        }

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if invocation.interactive {
                Stdio::inherit()
            } else {
                Stdio::null()
            });

        let mut child = cmd.spawn().map_err(|e| ChanlockError::ProcessFailed {
            command: command.clone(),
            status: e.to_string(),
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let verbose = ctx.verbose;

        let stdout_reader = thread::spawn(move || {
            let mut buf = Vec::new();
            if let Some(mut pipe) = stdout {
                let _ = pipe.read_to_end(&mut buf);
            }
            buf
        });
        let stderr_reader = thread::spawn(move || {
            let mut buf = Vec::new();
            if let Some(mut pipe) = stderr {
                let mut chunk = [0u8; 4096];
                while let Ok(n) = pipe.read(&mut chunk) {
                    if n == 0 {
                        break;
                    }
                    if verbose {
                        let _ = io::stderr().write_all(&chunk[..n]);
                    }
                    buf.extend_from_slice(&chunk[..n]);
                }
            }
            buf
        });

        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if ctx.cancel.is_cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ChanlockError::Cancelled { command });
            }
            thread::sleep(POLL_INTERVAL);
        };

        let stdout = stdout_reader.join().unwrap_or_default();
        let stderr = stderr_reader.join().unwrap_or_default();

        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr).trim().to_string();
            if stderr.is_empty() {
                return Err(ChanlockError::ProcessFailed {
                    command,
                    status: status.to_string(),
                });
            }
            return Err(ChanlockError::CommandFailed {
                command,
                code: status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(String::from_utf8_lossy(&stdout).into_owned())
    }
}

/// A runner bound to an execution context
#[derive(Clone, Copy)]
pub struct Executor<'a> {
    runner: &'a dyn CommandRunner,
    ctx: &'a ExecContext,
}

impl<'a> Executor<'a> {
    pub fn new(runner: &'a dyn CommandRunner, ctx: &'a ExecContext) -> Self {
        Self { runner, ctx }
    }

    pub fn context(&self) -> &'a ExecContext {
        self.ctx
    }

    /// The same runner bound to another context
    pub fn with_context<'b>(&self, ctx: &'b ExecContext) -> Executor<'b>
    where
        'a: 'b,
    {
        Executor {
            runner: self.runner,
            ctx,
        }
    }

    /// Run `program` as `identity` and return its stdout
    pub fn run_as(&self, identity: &Identity, program: &str, args: &[String]) -> Result<String> {
        let invocation = Invocation::build(self.ctx, identity, program, args)?;
        tracing::debug!(user = %identity, command = %invocation, "running command");
        self.runner.run(self.ctx, &invocation)
    }

    /// Run `program` as the current user and return its stdout
    pub fn run(&self, program: &str, args: &[String]) -> Result<String> {
        self.run_as(&self.ctx.current_identity(), program, args)
    }
}
