//! Narrow subprocess interface.
//!
//! Every external tool (nmap, snmpget, ip, ifconfig, hostname) is reached through
//! [`CommandRunner`]; parsing of their output lives next to the callers as pure functions.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::io;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};

use crate::error::{Result, ScanError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: Some(0),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

pub trait CommandRunner: Send + Sync + 'static {
    /// Run `program` with `args`, killing it if it outlives `timeout`.
    ///
    /// A program that is not installed yields [`ScanError::ToolUnavailable`].
    fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> impl Future<Output = Result<CommandOutput>> + Send;

    /// Like [`run`](Self::run), but a program still running at `timeout` is killed and the
    /// stdout it printed so far is returned with `exit_code: None`. Stderr is discarded.
    fn run_partial(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> impl Future<Output = Result<CommandOutput>> + Send {
        self.run(program, args, timeout)
    }
}

/// Runs real processes via `tokio::process`.
#[derive(Debug)]
pub struct SystemRunner {
    output_limit: usize,
    missing: Mutex<HashSet<String>>,
}

impl SystemRunner {
    pub fn new(output_limit: usize) -> Self {
        Self {
            output_limit,
            missing: Mutex::new(HashSet::new()),
        }
    }

    fn known_missing(&self, program: &str) -> bool {
        self.missing
            .lock()
            .map(|m| m.contains(program))
            .unwrap_or(false)
    }

    fn remember_missing(&self, program: &str) {
        if let Ok(mut m) = self.missing.lock() {
            m.insert(program.to_string());
        }
    }
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self::new(10 * 1024 * 1024)
    }
}

impl SystemRunner {
    fn spawn(&self, program: &str, args: &[String], stderr: Stdio) -> Result<Child> {
        if self.known_missing(program) {
            return Err(ScanError::ToolUnavailable {
                tool: program.to_string(),
            });
        }
        match Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn()
        {
            Ok(c) => Ok(c),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(program, "tool not installed");
                self.remember_missing(program);
                Err(ScanError::ToolUnavailable {
                    tool: program.to_string(),
                })
            }
            Err(e) => Err(ScanError::Command {
                program: program.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String], timeout: Duration) -> Result<CommandOutput> {
        let mut child = self.spawn(program, args, Stdio::piped())?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let limit = self.output_limit;

        // Dropping the child on timeout kills it.
        let collect = async move {
            let (out, err) = tokio::join!(read_capped(stdout, limit), read_capped(stderr, 64 * 1024));
            let status = child.wait().await?;
            Ok::<_, io::Error>((out?, err?, status))
        };

        match tokio::time::timeout(timeout, collect).await {
            Ok(Ok(((stdout, truncated), (stderr, _), status))) => {
                if truncated {
                    tracing::warn!(program, limit, "command output truncated");
                }
                Ok(CommandOutput {
                    stdout: String::from_utf8_lossy(&stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&stderr).into_owned(),
                    exit_code: status.code(),
                })
            }
            Ok(Err(e)) => Err(ScanError::Command {
                program: program.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(ScanError::ProbeTimeout {
                target: program.to_string(),
                after: timeout,
            }),
        }
    }

    async fn run_partial(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let mut child = self.spawn(program, args, Stdio::null())?;
        let stdout = child.stdout.take();
        let mut kept = Vec::new();

        let collect = async {
            read_into(stdout, &mut kept, self.output_limit).await?;
            child.wait().await
        };
        let finished = tokio::time::timeout(timeout, collect).await;

        let exit_code = match finished {
            Ok(Ok(status)) => status.code(),
            Ok(Err(e)) => {
                return Err(ScanError::Command {
                    program: program.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                tracing::warn!(program, ?timeout, bytes = kept.len(), "command timed out, keeping partial output");
                if let Err(e) = child.kill().await {
                    tracing::debug!(program, error = %e, "kill after timeout failed");
                }
                None
            }
        };
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&kept).into_owned(),
            stderr: String::new(),
            exit_code,
        })
    }
}

/// Read a pipe to EOF, keeping at most `limit` bytes. The rest is drained so the child never
/// blocks on a full pipe.
async fn read_capped<R>(reader: Option<R>, limit: usize) -> io::Result<(Vec<u8>, bool)>
where
    R: AsyncRead + Unpin,
{
    let mut kept = Vec::new();
    let truncated = read_into(reader, &mut kept, limit).await?;
    Ok((kept, truncated))
}

/// Append a pipe's bytes to `kept` as they arrive, up to `limit`. Returns whether anything was
/// dropped. Whatever was read stays in `kept` if the future is cancelled.
async fn read_into<R>(reader: Option<R>, kept: &mut Vec<u8>, limit: usize) -> io::Result<bool>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok(false);
    };
    let mut truncated = false;
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let room = limit.saturating_sub(kept.len());
        if room < n {
            truncated = true;
        }
        kept.extend_from_slice(&buf[..n.min(room)]);
    }
    Ok(truncated)
}

type Responder = Box<dyn Fn(&[String]) -> Result<CommandOutput> + Send + Sync>;

/// Canned runner: answers from registered closures and records every invocation.
/// Programs without a responder behave as if they were not installed.
#[derive(Default)]
pub struct ScriptedRunner {
    responders: HashMap<String, Responder>,
    calls: Mutex<Vec<(String, Vec<String>)>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<F>(mut self, program: &str, f: F) -> Self
    where
        F: Fn(&[String]) -> Result<CommandOutput> + Send + Sync + 'static,
    {
        self.responders.insert(program.to_string(), Box::new(f));
        self
    }

    pub fn with_stdout(self, program: &str, stdout: &str) -> Self {
        let stdout = stdout.to_string();
        self.with(program, move |_| Ok(CommandOutput::ok(stdout.clone())))
    }

    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn calls_to(&self, program: &str) -> usize {
        self.calls().iter().filter(|(p, _)| p == program).count()
    }
}

impl CommandRunner for ScriptedRunner {
    async fn run(&self, program: &str, args: &[String], _timeout: Duration) -> Result<CommandOutput> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((program.to_string(), args.to_vec()));
        }
        match self.responders.get(program) {
            Some(f) => f(args),
            None => Err(ScanError::ToolUnavailable {
                tool: program.to_string(),
            }),
        }
    }
}

/// Convert `&str` literals into the owned argument vector `run` takes.
pub fn args<const N: usize>(items: [&str; N]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
