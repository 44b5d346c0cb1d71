//! Модуль запуска внешних процессов
//!
//! Любой вызов внешней программы идёт с жёстким таймаутом: по его истечении
//! процесс убивается, а вызывающая сторона получает `ProcessError::Timeout`.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use log::{debug, error};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command as TokioCommand;
use tokio::time::timeout;

use crate::error::DubSyncError;

/// Результат успешного запуска
#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

/// Ошибки запуска внешнего процесса
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Failed to start {program}: {source}")]
    Spawn { program: String, source: std::io::Error },

    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    #[error("{program} exited with {status}: {stderr}")]
    Failed { program: String, status: ExitStatus, stderr: String },

    #[error("IO error while talking to {program}: {source}")]
    Io { program: String, source: std::io::Error },
}

impl From<ProcessError> for DubSyncError {
    fn from(err: ProcessError) -> Self {
        DubSyncError::Transcoder(err.to_string())
    }
}

/// Найти программу в PATH
pub fn ensure_program(program: &str) -> Result<PathBuf, DubSyncError> {
    which::which(program).map_err(|e| {
        DubSyncError::Configuration(format!("Required program '{}' not found in PATH: {}", program, e))
    })
}

/// Запустить программу, передать `stdin` и дождаться завершения не дольше `limit`
pub async fn run_with_timeout(
    program: &str,
    args: &[String],
    stdin: Option<&str>,
    limit: Duration,
) -> Result<ProcessOutput, ProcessError> {
    debug!("Running: {} {}", program, args.join(" "));

    let mut cmd = TokioCommand::new(program);
    cmd.args(args)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
        program: program.to_string(),
        source,
    })?;

    if let (Some(text), Some(mut pipe)) = (stdin, child.stdin.take()) {
        let bytes = text.as_bytes().to_vec();
        let name = program.to_string();
        // запись в отдельной задаче: процесс может не читать stdin до конца
        tokio::spawn(async move {
            if let Err(e) = pipe.write_all(&bytes).await {
                debug!("{} closed stdin early: {}", name, e);
            }
        });
    }

    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();
    // таймаут покрывает и чтение каналов: их может держать потомок процесса
    let finished = timeout(limit, async {
        let (status, stdout, stderr) = tokio::join!(child.wait(), read_pipe(stdout_pipe), read_pipe(stderr_pipe));
        status.map(|status| (status, stdout, stderr))
    })
    .await;

    let (status, stdout, stderr) = match finished {
        Ok(Ok(done)) => done,
        Ok(Err(source)) => {
            return Err(ProcessError::Io { program: program.to_string(), source });
        }
        Err(_) => {
            error!("{} timed out after {:?}, killing it", program, limit);
            let _ = child.kill().await;
            return Err(ProcessError::Timeout { program: program.to_string(), timeout: limit });
        }
    };
    let stderr = String::from_utf8_lossy(&stderr).into_owned();

    if !status.success() {
        return Err(ProcessError::Failed {
            program: program.to_string(),
            status,
            stderr: tail_lines(&stderr, 5),
        });
    }

    Ok(ProcessOutput { status, stdout, stderr })
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        if let Err(e) = pipe.read_to_end(&mut buf).await {
            debug!("Pipe read stopped early: {}", e);
        }
    }
    buf
}

/// Последние `n` строк в исходном порядке через ` | `
fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(n)..].join(" | ")
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_captures_stdout_and_stdin() {
        let out = run_with_timeout("cat", &[], Some("hello"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.stdout, b"hello");
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let started = std::time::Instant::now();
        let err = run_with_timeout("sleep", &["10".to_string()], None, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_non_zero_exit() {
        let err = run_with_timeout("sh", &["-c".to_string(), "echo bad >&2; exit 3".to_string()], None, Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            ProcessError::Failed { stderr, .. } => assert!(stderr.contains("bad")),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_covers_pipes_held_by_grandchild() {
        let started = std::time::Instant::now();
        let script = "sleep 10 & echo started".to_string();
        let err = run_with_timeout("sh", &["-c".to_string(), script], None, Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Timeout { .. }), "{}", err);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_failure_keeps_last_stderr_lines_in_order() {
        let script = "for i in 1 2 3 4 5 6 7; do echo line$i >&2; done; exit 3".to_string();
        let err = run_with_timeout("sh", &["-c".to_string(), script], None, Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            ProcessError::Failed { stderr, .. } => assert_eq!(stderr, "line3 | line4 | line5 | line6 | line7"),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_tail_lines() {
        assert_eq!(tail_lines("a\nb\nc", 5), "a | b | c");
        assert_eq!(tail_lines("a\nb\nc", 2), "b | c");
        assert_eq!(tail_lines("", 5), "");
    }

    #[tokio::test]
    async fn test_missing_program() {
        let err = run_with_timeout("definitely-not-a-program-xyz", &[], None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
    }
}
