//! Media bridge supervision
//!
//! A bridge is an external encoder or player process (ffmpeg, ffplay).
//! Exactly one task owns the [`Child`]; the [`MediaBridge`] handle talks to
//! it over a command channel and observes its [`BridgeState`] through a
//! `watch` channel. Because the owning task checks for exit before it
//! decides to kill, a process that already exited cleanly is never
//! reported as killed.
//!
//! ```text
//! Running ──interrupt──► Stopping ──exit──► Exited(code)
//!    │                      │
//!    └──exit──► Exited      └──grace elapsed──► Killed
//! ```

use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};

use crate::error::{Error, Result};
use crate::media::preset::ProcessSpec;

/// Lifecycle of a bridge process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Running,
    /// Interrupt delivered, waiting for exit
    Stopping,
    /// Exited on its own; `None` when terminated by a signal
    Exited(Option<i32>),
    /// Force-killed after the grace period
    Killed,
}

impl BridgeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exited(_) | Self::Killed)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(Some(0)))
    }
}

#[derive(Debug, Clone, Copy)]
enum BridgeCommand {
    Interrupt,
    Kill,
}

/// Handle to a supervised bridge process
pub struct MediaBridge {
    program: String,
    pid: Option<u32>,
    commands: mpsc::UnboundedSender<BridgeCommand>,
    state: watch::Receiver<BridgeState>,
}

impl MediaBridge {
    /// Launch `spec`; fails with [`Error::DependencyMissing`] before spawning
    /// anything when the program is not installed
    pub fn start(spec: &ProcessSpec) -> Result<Self> {
        let program = which::which(&spec.program).map_err(|_| Error::DependencyMissing {
            tool: spec.program.clone(),
        })?;

        let child = Command::new(&program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        let pid = child.id();

        tracing::info!(pid, command = %spec.command_line(), "Media bridge started");

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(BridgeState::Running);
        tokio::spawn(supervise(child, command_rx, state_tx));

        Ok(Self {
            program: spec.program.clone(),
            pid,
            commands,
            state,
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> BridgeState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<BridgeState> {
        self.state.clone()
    }

    /// Wait for the process to terminate without asking it to
    pub async fn wait(&mut self) -> BridgeState {
        wait_terminal(&mut self.state).await
    }

    /// Interrupt, wait up to `grace`, then force-kill
    pub async fn stop(&mut self, grace: Duration) -> BridgeState {
        let current = self.state();
        if current.is_terminal() {
            return current;
        }

        let _ = self.commands.send(BridgeCommand::Interrupt);

        match tokio::time::timeout(grace, wait_terminal(&mut self.state)).await {
            Ok(state) => state,
            Err(_) => {
                tracing::warn!(pid = self.pid, grace = ?grace, "Media bridge ignored interrupt, killing");
                let _ = self.commands.send(BridgeCommand::Kill);
                wait_terminal(&mut self.state).await
            }
        }
    }
}

async fn wait_terminal(state: &mut watch::Receiver<BridgeState>) -> BridgeState {
    match state.wait_for(BridgeState::is_terminal).await {
        Ok(state) => *state,
        // Supervisor gone without a verdict
        Err(_) => BridgeState::Exited(None),
    }
}

/// Sole owner of the child process
async fn supervise(
    mut child: Child,
    mut commands: mpsc::UnboundedReceiver<BridgeCommand>,
    state: watch::Sender<BridgeState>,
) {
    let pid = child.id();
    let mut killed = false;
    let mut handle_alive = true;

    loop {
        tokio::select! {
            biased;
            status = child.wait() => {
                let final_state = match status {
                    Ok(_) if killed => BridgeState::Killed,
                    Ok(status) => BridgeState::Exited(status.code()),
                    Err(e) => {
                        tracing::warn!(pid, "Failed to wait for media bridge: {}", e);
                        BridgeState::Exited(None)
                    }
                };
                tracing::info!(pid, state = ?final_state, "Media bridge terminated");
                state.send_replace(final_state);
                return;
            }
            command = commands.recv(), if handle_alive => match command {
                Some(BridgeCommand::Interrupt) => {
                    state.send_replace(BridgeState::Stopping);
                    interrupt(&mut child);
                }
                Some(BridgeCommand::Kill) | None => {
                    if command.is_none() {
                        handle_alive = false;
                    }
                    // Exit already happened but was not observed yet
                    if let Ok(Some(status)) = child.try_wait() {
                        state.send_replace(BridgeState::Exited(status.code()));
                        return;
                    }
                    if !killed {
                        killed = true;
                        if let Err(e) = child.start_kill() {
                            tracing::warn!(pid, "Failed to kill media bridge: {}", e);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(unix)]
fn interrupt(child: &mut Child) {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    match child.id() {
        Some(pid) => {
            if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
                tracing::warn!(pid, "Failed to interrupt media bridge: {}", e);
            }
        }
        None => tracing::debug!("Media bridge already reaped"),
    }
}

#[cfg(not(unix))]
fn interrupt(child: &mut Child) {
    // No interrupt signal to deliver; terminate directly
    if let Err(e) = child.start_kill() {
        tracing::warn!("Failed to stop media bridge: {}", e);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    fn shell(script: &str) -> ProcessSpec {
        ProcessSpec::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    #[test]
    fn test_missing_tool_fails_before_launch() {
        let spec = ProcessSpec::new("openndi-definitely-not-installed", vec![]);
        match MediaBridge::start(&spec) {
            Err(Error::DependencyMissing { tool }) => assert_eq!(tool, "openndi-definitely-not-installed"),
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("bridge should not start"),
        }
    }

    #[tokio::test]
    async fn test_wait_reports_exit_code() {
        let mut bridge = MediaBridge::start(&shell("exit 3")).unwrap();
        assert!(bridge.pid().is_some());
        assert_eq!(bridge.wait().await, BridgeState::Exited(Some(3)));
        assert!(!bridge.state().is_success());
    }

    #[tokio::test]
    async fn test_clean_exit_within_grace_is_not_killed() {
        let mut bridge = MediaBridge::start(&shell("trap 'exit 0' INT; while :; do sleep 0.05; done")).unwrap();
        // Let the shell install its trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        let state = bridge.stop(Duration::from_secs(2)).await;
        assert_eq!(state, BridgeState::Exited(Some(0)));
        assert!(state.is_success());
    }

    #[tokio::test]
    async fn test_hung_process_is_killed_after_grace() {
        let mut bridge = MediaBridge::start(&shell("trap '' INT; exec sleep 30")).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = Instant::now();
        let state = bridge.stop(Duration::from_millis(300)).await;
        assert_eq!(state, BridgeState::Killed);
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(started.elapsed() < Duration::from_secs(5));

        // A second stop is a no-op
        assert_eq!(bridge.stop(Duration::from_millis(300)).await, BridgeState::Killed);
    }

    #[tokio::test]
    async fn test_stop_after_exit_returns_exit_state() {
        let mut bridge = MediaBridge::start(&shell("exit 0")).unwrap();
        assert_eq!(bridge.wait().await, BridgeState::Exited(Some(0)));
        assert_eq!(bridge.stop(Duration::from_secs(1)).await, BridgeState::Exited(Some(0)));
    }

    #[tokio::test]
    async fn test_state_is_observable() {
        let bridge = MediaBridge::start(&shell("sleep 30")).unwrap();
        let mut states = bridge.subscribe();
        assert_eq!(*states.borrow(), BridgeState::Running);

        drop(bridge);
        let state = tokio::time::timeout(Duration::from_secs(5), wait_terminal(&mut states))
            .await
            .unwrap();
        assert!(state.is_terminal());
    }
}
