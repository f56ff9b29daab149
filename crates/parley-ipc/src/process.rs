use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::error::{IpcError, Result};

/// A child process spoken to over line-delimited stdio.
pub struct ProcessHandle {
    child: Child,
    stdin_tx: mpsc::Sender<String>,
}

impl ProcessHandle {
    /// Spawn `command` and forward each stdout line to `line_tx`. Stderr is logged.
    pub fn spawn(
        working_dir: &Path,
        command: &str,
        args: &[&str],
        line_tx: mpsc::Sender<String>,
    ) -> Result<Self> {
        let mut child = Command::new(command)
            .args(args)
            .current_dir(working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| IpcError::SpawnFailed(format!("{command}: {e}")))?;

        let stdout = child.stdout.take().ok_or(IpcError::ProcessNotRunning)?;
        let stderr = child.stderr.take().ok_or(IpcError::ProcessNotRunning)?;
        let mut stdin = child.stdin.take().ok_or(IpcError::ProcessNotRunning)?;

        let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(100);

        tokio::spawn(async move {
            while let Some(line) = stdin_rx.recv().await {
                if stdin.write_all(line.as_bytes()).await.is_err() || stdin.flush().await.is_err()
                {
                    tracing::warn!("Bridge stdin closed");
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line_tx.send(line).await.is_err() {
                    break;
                }
            }
            tracing::debug!("Bridge stdout reached EOF");
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::warn!(target: "parley_ipc::bridge", "stderr: {}", line);
            }
        });

        Ok(Self { child, stdin_tx })
    }

    /// Writer half; lines must already be newline-terminated.
    pub fn writer(&self) -> mpsc::Sender<String> {
        self.stdin_tx.clone()
    }

    pub async fn kill(&mut self) -> Result<()> {
        self.child.kill().await.map_err(IpcError::Io)
    }

    pub fn start_kill(&mut self) {
        let _ = self.child.start_kill();
    }

    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }
}
