//! The bridge is a sidecar process that holds the actual network connections.
//! Commands go out on its stdin, events come back on its stdout, one JSON
//! envelope per line. Every command except `Shutdown` is acknowledged by a
//! `CommandResult` carrying the command's envelope id.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, info, warn};

use parley_core::{BridgeCommand, BridgeEvent, BridgeMessage, DisconnectReason, SessionEvent};

use crate::error::{IpcError, Result};
use crate::process::ProcessHandle;

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

struct CommandOutcome {
    success: bool,
    error: Option<String>,
}

struct Subscriber {
    token: u64,
    events: mpsc::Sender<SessionEvent>,
}

struct Link {
    writer: mpsc::Sender<String>,
    process: Option<ProcessHandle>,
}

pub struct BridgeProcess {
    bridge_dir: PathBuf,
    command_timeout: Duration,
    link: Mutex<Option<Link>>,
    pending: Mutex<HashMap<String, oneshot::Sender<CommandOutcome>>>,
    subscribers: Mutex<HashMap<String, Subscriber>>,
    next_token: AtomicU64,
}

impl BridgeProcess {
    pub fn new(bridge_dir: PathBuf) -> Self {
        Self {
            bridge_dir,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            link: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn bridge_dir(&self) -> &Path {
        &self.bridge_dir
    }

    pub async fn ensure_dependencies(&self) -> Result<()> {
        let package_json = self.bridge_dir.join("package.json");
        let node_modules = self.bridge_dir.join("node_modules");

        if !package_json.exists() {
            return Err(IpcError::DependencyInstallFailed(format!(
                "package.json not found in {}",
                self.bridge_dir.display()
            )));
        }

        if node_modules.exists() {
            return Ok(());
        }

        info!("Installing bridge dependencies with bun");
        let output = Command::new("bun")
            .arg("install")
            .current_dir(&self.bridge_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| IpcError::DependencyInstallFailed(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(IpcError::DependencyInstallFailed(stderr.to_string()));
        }

        info!("bun install completed");
        Ok(())
    }

    /// Spawn the bridge and start routing its output. No-op when already running.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut link = self.link.lock().await;
        if link.is_some() {
            return Ok(());
        }

        self.ensure_dependencies().await?;

        info!(dir = %self.bridge_dir.display(), "Starting bridge process");
        let (line_tx, line_rx) = mpsc::channel(1000);
        let process = ProcessHandle::spawn(&self.bridge_dir, "bun", &["run", "index.ts"], line_tx)?;

        *link = Some(Link {
            writer: process.writer(),
            process: Some(process),
        });
        drop(link);

        self.spawn_router(line_rx);
        info!("Bridge process started");
        Ok(())
    }

    /// Wire the bridge to in-process pipes instead of a child process.
    pub async fn attach(self: &Arc<Self>, writer: mpsc::Sender<String>, lines: mpsc::Receiver<String>) {
        *self.link.lock().await = Some(Link {
            writer,
            process: None,
        });
        self.spawn_router(lines);
    }

    fn spawn_router(self: &Arc<Self>, mut lines: mpsc::Receiver<String>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(line) = lines.recv().await {
                this.handle_line(&line).await;
            }
            debug!("Bridge output closed");
            // wake anyone still waiting on an acknowledgement
            this.pending.lock().await.clear();
        });
    }

    pub async fn stop(&self) -> Result<()> {
        let Some(mut link) = self.link.lock().await.take() else {
            return Ok(());
        };

        info!("Stopping bridge process");
        let _ = write_message(&link.writer, &BridgeMessage::new_command(BridgeCommand::Shutdown)).await;
        if let Some(process) = link.process.as_mut() {
            tokio::time::sleep(Duration::from_millis(500)).await;
            let _ = process.kill().await;
        }
        self.pending.lock().await.clear();
        info!("Bridge process stopped");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        let mut link = self.link.lock().await;
        match link.as_mut() {
            Some(Link {
                process: Some(process),
                ..
            }) => process.is_alive(),
            Some(Link { process: None, .. }) => true,
            None => false,
        }
    }

    /// Send a command and wait for its acknowledgement.
    pub async fn request(&self, command: BridgeCommand) -> Result<()> {
        let name = command.name();
        match command.tenant_id() {
            Some(tenant_id) => debug!(command = name, tenant_id, "Sending bridge command"),
            None => debug!(command = name, "Sending bridge command"),
        }

        let message = BridgeMessage::new_command(command);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(message.id.clone(), tx);

        if let Err(err) = self.write(&message).await {
            self.pending.lock().await.remove(&message.id);
            return Err(err);
        }

        match tokio::time::timeout(self.command_timeout, rx).await {
            Ok(Ok(CommandOutcome { success: true, .. })) => Ok(()),
            Ok(Ok(CommandOutcome { error, .. })) => Err(IpcError::CommandFailed {
                command: name,
                reason: error.unwrap_or_else(|| "unknown error".to_string()),
            }),
            Ok(Err(_)) => Err(IpcError::ChannelClosed),
            Err(_) => {
                self.pending.lock().await.remove(&message.id);
                Err(IpcError::Timeout)
            }
        }
    }

    async fn write(&self, message: &BridgeMessage) -> Result<()> {
        let writer = self
            .link
            .lock()
            .await
            .as_ref()
            .map(|link| link.writer.clone())
            .ok_or(IpcError::ProcessNotRunning)?;
        write_message(&writer, message).await
    }

    /// Route events for `tenant_id` to `events`, replacing any previous
    /// subscriber. The returned token identifies this subscription.
    pub async fn subscribe(&self, tenant_id: &str, events: mpsc::Sender<SessionEvent>) -> u64 {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .await
            .insert(tenant_id.to_string(), Subscriber { token, events });
        token
    }

    /// Remove the subscription, unless it has since been replaced.
    pub async fn unsubscribe(&self, tenant_id: &str, token: u64) {
        let mut subscribers = self.subscribers.lock().await;
        if subscribers.get(tenant_id).is_some_and(|s| s.token == token) {
            subscribers.remove(tenant_id);
        }
    }

    pub(crate) async fn handle_line(&self, line: &str) {
        let Some(event) = BridgeMessage::from_line(line).and_then(BridgeMessage::into_event) else {
            if !line.trim().is_empty() {
                debug!("bridge: {}", line);
            }
            return;
        };

        match event {
            BridgeEvent::CommandResult {
                command_id,
                success,
                error,
            } => {
                if let Some(waiter) = self.pending.lock().await.remove(&command_id) {
                    let _ = waiter.send(CommandOutcome { success, error });
                } else {
                    debug!(command_id, "Acknowledgement for unknown command");
                }
            }
            BridgeEvent::Ready { tenant_id } => {
                info!(tenant_id = tenant_id.as_deref().unwrap_or("-"), "Bridge ready");
            }
            BridgeEvent::Error { tenant_id, error } => {
                warn!(tenant_id = tenant_id.as_deref().unwrap_or("-"), "Bridge error: {}", error);
            }
            other => {
                if let Some((tenant_id, event)) = session_event(other) {
                    self.dispatch(&tenant_id, event).await;
                }
            }
        }
    }

    async fn dispatch(&self, tenant_id: &str, event: SessionEvent) {
        let Some(events) = self
            .subscribers
            .lock()
            .await
            .get(tenant_id)
            .map(|s| s.events.clone())
        else {
            debug!(tenant_id, "Dropping event for unsubscribed tenant");
            return;
        };

        if events.send(event).await.is_err() {
            debug!(tenant_id, "Subscriber gone");
        }
    }
}

impl Drop for BridgeProcess {
    fn drop(&mut self) {
        if let Some(Link {
            process: Some(process),
            ..
        }) = self.link.get_mut().as_mut()
        {
            process.start_kill();
        }
    }
}

async fn write_message(writer: &mpsc::Sender<String>, message: &BridgeMessage) -> Result<()> {
    let line = message.to_line()?;
    writer.send(line).await.map_err(|_| IpcError::ChannelClosed)
}

fn session_event(event: BridgeEvent) -> Option<(String, SessionEvent)> {
    match event {
        BridgeEvent::QrCode { tenant_id, qr } => Some((tenant_id, SessionEvent::QrIssued { qr })),
        BridgeEvent::Connected {
            tenant_id,
            phone_number,
        } => Some((tenant_id, SessionEvent::Opened { phone_number })),
        BridgeEvent::Disconnected {
            tenant_id,
            status_code,
            reason,
        } => Some((
            tenant_id,
            SessionEvent::Closed {
                reason: DisconnectReason::new(status_code, reason),
            },
        )),
        BridgeEvent::AuthStateUpdated { tenant_id, files } => {
            Some((tenant_id, SessionEvent::CredentialsUpdated { files }))
        }
        _ => None,
    }
}
