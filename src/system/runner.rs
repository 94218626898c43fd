//! External tool execution: spawn, stream output, honour cancellation.
//!
//! Every line a tool writes is forwarded to the progress channel. The root PID
//! is registered with the `ProcessRegistry` for the lifetime of the child so a
//! cancel (or the next launch's sweep) can walk and kill its whole tree.

use crate::config::ToolCommand;
use crate::error::CollaboratorError;
use crate::log_collector::ProgressChannel;
use crate::recovery::{CancelSignal, ProcessRegistry};
use once_cell::sync::Lazy;
use regex::Regex;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{([a-z_]+)\}").expect("static regex"));

/// Captured result of a finished tool.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub stdout: Vec<String>,
}

/// Substitute `{name}` placeholders. Unknown placeholders are left as-is.
pub fn render_args(command: &ToolCommand, vars: &[(&str, String)]) -> Vec<String> {
    command
        .args
        .iter()
        .map(|arg| {
            PLACEHOLDER
                .replace_all(arg, |caps: &regex::Captures| {
                    vars.iter()
                        .find(|(name, _)| *name == &caps[1])
                        .map(|(_, value)| value.clone())
                        .unwrap_or_else(|| caps[0].to_string())
                })
                .into_owned()
        })
        .collect()
}

/// Spawns external tools on behalf of the collaborators.
#[derive(Clone)]
pub struct ToolRunner {
    progress: Arc<dyn ProgressChannel>,
    registry: ProcessRegistry,
    cancel: CancelSignal,
}

impl ToolRunner {
    pub fn new(progress: Arc<dyn ProgressChannel>, registry: ProcessRegistry, cancel: CancelSignal) -> Self {
        ToolRunner {
            progress,
            registry,
            cancel,
        }
    }

    /// A runner sharing this one's channel and registry that ignores
    /// cancellation. Used for teardown steps that must run after a cancel.
    pub fn detached(&self) -> Self {
        let (_, cancel) = crate::recovery::cancel_pair();
        ToolRunner {
            progress: self.progress.clone(),
            registry: self.registry.clone(),
            cancel,
        }
    }

    /// Run `command` with placeholders filled from `vars`.
    ///
    /// Returns the captured stdout lines on a zero exit status. On
    /// cancellation the child's process tree is killed and
    /// `CollaboratorError::Cancelled` is returned.
    pub async fn run(&self, command: &ToolCommand, vars: &[(&str, String)]) -> Result<ToolOutput, CollaboratorError> {
        if self.cancel.is_cancelled() {
            return Err(CollaboratorError::Cancelled);
        }

        let args = render_args(command, vars);
        log::info!("[Tool] Running: {} {}", command.program, args.join(" "));

        let mut child = Command::new(&command.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CollaboratorError::Spawn {
                program: command.program.clone(),
                reason: e.to_string(),
            })?;

        let pid = child.id();
        if let Some(pid) = pid {
            self.registry.register(pid);
        }

        let stdout = child.stdout.take().ok_or_else(|| CollaboratorError::ToolFailed {
            program: command.program.clone(),
            reason: "Failed to capture stdout".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| CollaboratorError::ToolFailed {
            program: command.program.clone(),
            reason: "Failed to capture stderr".to_string(),
        })?;

        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();
        let mut stdout_closed = false;
        let mut stderr_closed = false;
        let mut captured = Vec::new();
        let mut cancel = self.cancel.clone();

        // The exit wait sits in the same select as the cancel branch: a tool
        // that closes its pipes early and keeps running can still be killed
        let outcome = loop {
            let step = tokio::select! {
                line = stdout_lines.next_line(), if !stdout_closed => {
                    match line {
                        Ok(Some(line)) => {
                            self.progress.log(&line);
                            captured.push(line);
                        }
                        _ => stdout_closed = true,
                    }
                    Step::Output
                }
                line = stderr_lines.next_line(), if !stderr_closed => {
                    match line {
                        Ok(Some(line)) => self.progress.log(&format!("[STDERR] {}", line)),
                        _ => stderr_closed = true,
                    }
                    Step::Output
                }
                status = child.wait(), if stdout_closed && stderr_closed => Step::Exited(status),
                _ = cancel.cancelled() => Step::Cancelled,
            };

            match step {
                Step::Output => {}
                Step::Exited(status) => {
                    break status.map_err(|e| CollaboratorError::ToolFailed {
                        program: command.program.clone(),
                        reason: format!("Failed to wait for process: {}", e),
                    });
                }
                Step::Cancelled => {
                    log::warn!("[Tool] Cancellation requested, terminating {}", command.program);
                    if let Some(pid) = pid {
                        crate::recovery::kill_tree_with(self.registry.table().as_ref(), pid);
                    }
                    let _ = child.kill().await;
                    if let Some(pid) = pid {
                        self.registry.unregister(pid);
                    }
                    return Err(CollaboratorError::Cancelled);
                }
            }
        };

        if let Some(pid) = pid {
            self.registry.unregister(pid);
        }

        let status = outcome?;
        if status.success() {
            Ok(ToolOutput { stdout: captured })
        } else {
            let reason = match status.code() {
                Some(code) => format!("exit code {}", code),
                None => "terminated by signal".to_string(),
            };
            Err(CollaboratorError::ToolFailed {
                program: command.program.clone(),
                reason,
            })
        }
    }
}

/// What one turn of the output loop observed.
enum Step {
    Output,
    Exited(std::io::Result<std::process::ExitStatus>),
    Cancelled,
}

/// Locate `program` the way a shell would. Paths containing a separator are
/// checked directly.
pub fn find_on_path(program: &str) -> Option<std::path::PathBuf> {
    let candidate = std::path::Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }

    let path = std::env::var_os("PATH")?;
    let extensions: Vec<String> = if cfg!(windows) {
        std::env::var("PATHEXT")
            .unwrap_or_else(|_| ".EXE;.CMD;.BAT".to_string())
            .split(';')
            .map(|s| s.to_lowercase())
            .collect()
    } else {
        Vec::new()
    };

    for dir in std::env::split_paths(&path) {
        let direct = dir.join(program);
        if direct.is_file() {
            return Some(direct);
        }
        for ext in &extensions {
            let with_ext = dir.join(format!("{}{}", program, ext));
            if with_ext.is_file() {
                return Some(with_ext);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_collector::MemoryChannel;
    use crate::recovery::cancel_pair;

    #[test]
    fn test_render_args_substitutes_known_placeholders() {
        let command = ToolCommand::new("dism", &["/ImageFile:{image}", "/Index:{index}", "{unknown}"]);
        let args = render_args(
            &command,
            &[("image", "C:\\install.wim".to_string()), ("index", "6".to_string())],
        );
        assert_eq!(args, vec!["/ImageFile:C:\\install.wim", "/Index:6", "{unknown}"]);
    }

    #[test]
    fn test_find_on_path_rejects_missing_program() {
        assert!(find_on_path("definitely-not-a-real-tool-7f3a").is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_streams_and_captures_stdout() {
        let channel = Arc::new(MemoryChannel::new());
        let (_trigger, cancel) = cancel_pair();
        let registry = ProcessRegistry::default();
        let runner = ToolRunner::new(channel.clone(), registry.clone(), cancel);

        let command = ToolCommand::new("sh", &["-c", "echo {word}; echo oops >&2"]);
        let output = runner.run(&command, &[("word", "running".to_string())]).await.unwrap();

        assert_eq!(output.stdout, vec!["running".to_string()]);
        let lines = channel.lines();
        assert!(lines.contains(&"running".to_string()));
        assert!(lines.contains(&"[STDERR] oops".to_string()));
        assert!(registry.pids().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_tool_failure() {
        let channel = Arc::new(MemoryChannel::new());
        let (_trigger, cancel) = cancel_pair();
        let runner = ToolRunner::new(channel, ProcessRegistry::default(), cancel);

        let err = runner
            .run(&ToolCommand::new("sh", &["-c", "exit 3"]), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, CollaboratorError::ToolFailed { ref reason, .. } if reason == "exit code 3"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_terminates_running_tool() {
        let channel = Arc::new(MemoryChannel::new());
        let (trigger, cancel) = cancel_pair();
        let registry = ProcessRegistry::default();
        let runner = ToolRunner::new(channel, registry.clone(), cancel);

        let handle = tokio::spawn(async move {
            runner
                .run(&ToolCommand::new("sh", &["-c", "sleep 30"]), &[])
                .await
        });
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        trigger.cancel();

        let result = tokio::time::timeout(std::time::Duration::from_secs(10), handle)
            .await
            .expect("tool did not stop")
            .unwrap();
        assert!(matches!(result, Err(CollaboratorError::Cancelled)));
        assert!(registry.pids().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_reaches_tool_with_closed_output() {
        let channel = Arc::new(MemoryChannel::new());
        let (trigger, cancel) = cancel_pair();
        let registry = ProcessRegistry::default();
        let runner = ToolRunner::new(channel, registry.clone(), cancel);

        // Output ends right away, the process does not
        let handle = tokio::spawn(async move {
            runner
                .run(
                    &ToolCommand::new("sh", &["-c", "exec >/dev/null 2>&1; sleep 30"]),
                    &[],
                )
                .await
        });
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        trigger.cancel();

        let result = tokio::time::timeout(std::time::Duration::from_secs(10), handle)
            .await
            .expect("tool did not stop")
            .unwrap();
        assert!(matches!(result, Err(CollaboratorError::Cancelled)));
        assert!(registry.pids().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_detached_runner_ignores_cancellation() {
        let channel = Arc::new(MemoryChannel::new());
        let (trigger, cancel) = cancel_pair();
        let runner = ToolRunner::new(channel, ProcessRegistry::default(), cancel);
        trigger.cancel();

        let command = ToolCommand::new("sh", &["-c", "echo teardown"]);
        assert!(matches!(runner.run(&command, &[]).await, Err(CollaboratorError::Cancelled)));
        let output = runner.detached().run(&command, &[]).await.unwrap();
        assert_eq!(output.stdout, vec!["teardown".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let channel = Arc::new(MemoryChannel::new());
        let (_trigger, cancel) = cancel_pair();
        let runner = ToolRunner::new(channel, ProcessRegistry::default(), cancel);
        let err = runner
            .run(&ToolCommand::new("definitely-not-a-real-tool-7f3a", &[]), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, CollaboratorError::Spawn { .. }));
    }
}
