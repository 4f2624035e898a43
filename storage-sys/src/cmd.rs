// SPDX-License-Identifier: GPL-3.0-only

//! Execution of volume-management binaries
//!
//! Every pool operation is expressed as an argv invocation of a named binary.
//! A non-zero exit status is always an error here; retry policy belongs to
//! callers because `mkfs` and friends are not safe to repeat.

use std::path::PathBuf;
use std::process::Command;
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::error::{Result, SysError};

/// Captured result of a successful command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Runs external binaries on behalf of the pool backends.
pub trait CommandExecutor: Send + Sync {
    /// Run `argv[0]` with the remaining arguments and wait for it to exit.
    fn execute(&self, argv: &[String]) -> Result<CommandOutput>;

    /// Resolve a binary by name, `None` when it is not installed.
    fn find_tool(&self, name: &str) -> Option<PathBuf>;

    /// True when mutations are only being reported, not performed.
    fn dry_run(&self) -> bool {
        false
    }
}

/// Queries that never change pool state.
pub fn is_read_only(argv: &[String]) -> bool {
    let words: Vec<&str> = argv.iter().take(3).map(String::as_str).collect();
    matches!(
        words.as_slice(),
        ["btrfs", "filesystem", "show", ..]
            | ["zpool", "list", ..]
            | ["zpool", "status", ..]
            | ["zfs", "get", ..]
            | ["zfs", "list", ..]
    )
}

/// Build an owned argv from borrowed parts.
pub fn argv<I, S>(parts: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    parts
        .into_iter()
        .map(|part| part.as_ref().to_string())
        .collect()
}

pub fn render(argv: &[String]) -> String {
    argv.join(" ")
}

/// Executor backed by `std::process::Command` and `$PATH` lookup.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemExecutor;

impl CommandExecutor for SystemExecutor {
    fn execute(&self, argv: &[String]) -> Result<CommandOutput> {
        let rendered = render(argv);
        let Some((program, args)) = argv.split_first() else {
            return Err(SysError::ToolExecution {
                command: rendered,
                exit_code: -1,
                stdout: String::new(),
                stderr: "empty command line".to_string(),
            });
        };

        debug!("Running {}", rendered);
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|error| SysError::ToolExecution {
                command: rendered.clone(),
                exit_code: -1,
                stdout: String::new(),
                stderr: error.to_string(),
            })?;

        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !output.status.success() {
            warn!("{} exited with {}: {}", rendered, exit_code, stderr.trim());
            return Err(SysError::ToolExecution {
                command: rendered,
                exit_code,
                stdout,
                stderr,
            });
        }

        Ok(CommandOutput {
            command: rendered,
            stdout,
            stderr,
            exit_code,
        })
    }

    fn find_tool(&self, name: &str) -> Option<PathBuf> {
        which::which(name).ok()
    }
}

#[derive(Debug, Clone)]
enum Reply {
    Stdout(String),
    Failure { exit_code: i32, stderr: String },
}

#[derive(Debug, Clone)]
struct ScriptedReply {
    prefix: Vec<String>,
    reply: Reply,
}

/// Executor that records argv instead of running anything.
///
/// Replies are matched by the longest registered argv prefix; unmatched
/// commands succeed with empty output.
#[derive(Debug, Default)]
pub struct RecordingExecutor {
    replies: Vec<ScriptedReply>,
    missing_tools: Vec<String>,
    calls: Mutex<Vec<Vec<String>>>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands starting with `prefix` with `stdout`.
    pub fn respond(mut self, prefix: &[&str], stdout: &str) -> Self {
        self.replies.push(ScriptedReply {
            prefix: argv(prefix),
            reply: Reply::Stdout(stdout.to_string()),
        });
        self
    }

    /// Fail commands starting with `prefix`.
    pub fn fail(mut self, prefix: &[&str], exit_code: i32, stderr: &str) -> Self {
        self.replies.push(ScriptedReply {
            prefix: argv(prefix),
            reply: Reply::Failure {
                exit_code,
                stderr: stderr.to_string(),
            },
        });
        self
    }

    /// Report `name` as not installed.
    pub fn without_tool(mut self, name: &str) -> Self {
        self.missing_tools.push(name.to_string());
        self
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn rendered_calls(&self) -> Vec<String> {
        self.calls().iter().map(|call| render(call)).collect()
    }

    fn reply_for(&self, argv: &[String]) -> Option<&Reply> {
        let mut best: Option<&ScriptedReply> = None;
        for scripted in &self.replies {
            if !argv.starts_with(&scripted.prefix) {
                continue;
            }
            if best.is_none_or(|current| scripted.prefix.len() >= current.prefix.len()) {
                best = Some(scripted);
            }
        }
        best.map(|scripted| &scripted.reply)
    }
}

impl CommandExecutor for RecordingExecutor {
    fn execute(&self, argv: &[String]) -> Result<CommandOutput> {
        let rendered = render(argv);
        debug!("Recording {}", rendered);
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(argv.to_vec());

        match self.reply_for(argv) {
            Some(Reply::Failure { exit_code, stderr }) => Err(SysError::ToolExecution {
                command: rendered,
                exit_code: *exit_code,
                stdout: String::new(),
                stderr: stderr.clone(),
            }),
            Some(Reply::Stdout(stdout)) => Ok(CommandOutput {
                command: rendered,
                stdout: stdout.clone(),
                stderr: String::new(),
                exit_code: 0,
            }),
            None => Ok(CommandOutput {
                command: rendered,
                ..CommandOutput::default()
            }),
        }
    }

    fn find_tool(&self, name: &str) -> Option<PathBuf> {
        if self.missing_tools.iter().any(|missing| missing == name) {
            None
        } else {
            Some(PathBuf::from("/usr/sbin").join(name))
        }
    }
}

/// Runs read-only queries through `inner` and records everything else.
#[derive(Debug, Default)]
pub struct DryRunExecutor<E> {
    inner: E,
    calls: Mutex<Vec<Vec<String>>>,
}

impl<E: CommandExecutor> DryRunExecutor<E> {
    pub fn new(inner: E) -> Self {
        Self {
            inner,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Mutating commands that were skipped, in order.
    pub fn rendered_calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|call| render(call))
            .collect()
    }
}

impl<E: CommandExecutor> CommandExecutor for DryRunExecutor<E> {
    fn execute(&self, argv: &[String]) -> Result<CommandOutput> {
        if is_read_only(argv) {
            return self.inner.execute(argv);
        }

        let rendered = render(argv);
        debug!("Dry run, skipping {}", rendered);
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(argv.to_vec());
        Ok(CommandOutput {
            command: rendered,
            ..CommandOutput::default()
        })
    }

    fn find_tool(&self, name: &str) -> Option<PathBuf> {
        self.inner.find_tool(name)
    }

    fn dry_run(&self) -> bool {
        true
    }
}
