//! StepProcessor: executes a single step's command, streaming output to a
//! listener and to a per-step log file.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use crate::listener::Listener;
use crate::model::Status;
use crate::tokenize::tokenize;

/// Construction-time configuration for a [`StepProcessor`]. Carries the
/// launcher override as an injected dependency rather than mutable global
/// state, so tests can substitute `echo` without touching process-wide
/// settings.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Command prefix used to invoke the shell. Default: `["sh", "-c"]`.
    pub launcher: Vec<String>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        ProcessorConfig {
            launcher: vec!["sh".to_string(), "-c".to_string()],
        }
    }
}

/// The outcome of running one step or predicate.
#[derive(Debug, Clone, Copy)]
pub struct RunOutcome {
    pub status: Status,
    pub exit_code: Option<i32>,
}

/// Runs `command` under `config`'s launcher, in `cwd`, with `env` merged
/// atop the parent environment, streaming merged stdout/stderr to
/// `listener` and appending each line to `log_path`. `step_name` is used
/// only for listener/log labeling.
pub async fn run_step(
    step_name: &str,
    command: &str,
    cwd: Option<&Path>,
    env: &std::collections::HashMap<String, String>,
    delay_seconds: u64,
    config: &ProcessorConfig,
    log_path: &Path,
    listener: &Arc<dyn Listener>,
) -> std::io::Result<RunOutcome> {
    listener.on_start(step_name, command);

    if delay_seconds > 0 {
        tokio::time::sleep(std::time::Duration::from_secs(delay_seconds)).await;
    }

    let argv = build_argv(command, config);
    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..]);
    cmd.envs(env);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            listener.on_completion(step_name, Status::Failed);
            return Err(e);
        }
    };

    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");

    let mut log_file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .await?;

    let mut out_lines = BufReader::new(stdout).lines();
    let mut err_lines = BufReader::new(stderr).lines();

    loop {
        tokio::select! {
            line = out_lines.next_line() => {
                match line? {
                    Some(line) => emit_line(step_name, &line, listener, &mut log_file).await?,
                    None => break,
                }
            }
            line = err_lines.next_line() => {
                match line? {
                    Some(line) => emit_line(step_name, &line, listener, &mut log_file).await?,
                    None => continue,
                }
            }
        }
    }
    // Drain any remaining stderr after stdout has closed.
    while let Some(line) = err_lines.next_line().await? {
        emit_line(step_name, &line, listener, &mut log_file).await?;
    }

    let exit = child.wait().await?;
    let status = if exit.success() { Status::Succeeded } else { Status::Failed };
    listener.on_completion(step_name, status);

    Ok(RunOutcome {
        status,
        exit_code: exit.code(),
    })
}

async fn emit_line(
    step_name: &str,
    line: &str,
    listener: &Arc<dyn Listener>,
    log_file: &mut tokio::fs::File,
) -> std::io::Result<()> {
    listener.on_output(step_name, line);
    log_file.write_all(line.as_bytes()).await?;
    log_file.write_all(b"\n").await?;
    Ok(())
}

fn build_argv(command: &str, config: &ProcessorConfig) -> Vec<String> {
    if config.launcher.is_empty() {
        tokenize(command)
    } else {
        let mut argv = config.launcher.clone();
        argv.push(command.to_string());
        argv
    }
}

/// Runs a bare `if`/`unless` predicate command (no output capture, no log
/// file) and reports only whether it exited zero.
pub async fn run_predicate(command: &str, cwd: Option<&Path>, config: &ProcessorConfig) -> std::io::Result<bool> {
    let argv = build_argv(command, config);
    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..]);
    cmd.stdout(Stdio::null());
    cmd.stderr(Stdio::null());
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    let status = cmd.status().await?;
    Ok(status.success())
}

/// Resolves `<logDir>/<stepName>.log`.
pub fn log_path(log_dir: &Path, step_name: &str) -> PathBuf {
    log_dir.join(format!("{step_name}.log"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::Listener;
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct Capture {
        lines: Mutex<Vec<String>>,
        completions: Mutex<Vec<Status>>,
    }

    impl Listener for Capture {
        fn on_output(&self, _step: &str, line: &str) {
            self.lines.lock().unwrap().push(line.to_string());
        }
        fn on_completion(&self, _step: &str, status: Status) {
            self.completions.lock().unwrap().push(status);
        }
    }

    #[tokio::test]
    async fn echo_launcher_tokenizes_and_reports_success() {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("step.log");
        let listener: Arc<dyn Listener> = Arc::new(Capture {
            lines: Mutex::new(Vec::new()),
            completions: Mutex::new(Vec::new()),
        });
        let config = ProcessorConfig {
            launcher: vec!["echo".to_string()],
        };

        let outcome = run_step(
            "s",
            "hello world",
            None,
            &Default::default(),
            0,
            &config,
            &log_path,
            &listener,
        )
        .await
        .unwrap();

        assert!(matches!(outcome.status, Status::Succeeded));
        let contents = std::fs::read_to_string(&log_path).unwrap();
        assert!(contents.contains("hello world"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_failed() {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("step.log");
        let listener: Arc<dyn Listener> = Arc::new(Capture {
            lines: Mutex::new(Vec::new()),
            completions: Mutex::new(Vec::new()),
        });
        let config = ProcessorConfig::default();

        let outcome = run_step(
            "s",
            "exit 1",
            None,
            &Default::default(),
            0,
            &config,
            &log_path,
            &listener,
        )
        .await
        .unwrap();

        assert!(matches!(outcome.status, Status::Failed));
    }
}
