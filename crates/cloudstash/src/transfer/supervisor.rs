//! Lifecycle of the external transfer process.
//!
//! [`TransferSupervisor`] runs at most one process at a time. Output from
//! both streams is decoded into [`TransferLine`]s and delivered, followed by
//! exactly one [`TransferEvent::Exited`], on the [`TransferHandle`] returned
//! by [`TransferSupervisor::start`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::SupervisorError;
use crate::transfer::command::Invocation;
use crate::transfer::parse::{parse_line, LineBuffer, TransferLine};

/// Raw output lines kept for the failure message.
const DIAGNOSTIC_TAIL_LINES: usize = 5;
const READ_CHUNK_SIZE: usize = 8 * 1024;
/// How long output readers may keep going after the process exited. A
/// grandchild holding the pipes open must not stall the run forever.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// How a transfer process ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferOutcome {
    Completed,
    /// Terminated in response to [`TransferSupervisor::stop`].
    Stopped,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Line(TransferLine),
    Exited(TransferOutcome),
}

/// Receiving end of one supervised process.
#[derive(Debug)]
pub struct TransferHandle {
    run_id: String,
    events: mpsc::UnboundedReceiver<TransferEvent>,
}

impl TransferHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Next event, or `None` once the process has exited and every event
    /// has been received.
    pub async fn next_event(&mut self) -> Option<TransferEvent> {
        self.events.recv().await
    }
}

struct ActiveProcess {
    run_id: String,
    cancel: CancellationToken,
}

/// Owns the single active transfer process.
pub struct TransferSupervisor {
    active: Arc<Mutex<Option<ActiveProcess>>>,
    grace: Duration,
}

impl TransferSupervisor {
    /// `grace` is how long a stopped process may take to exit before it is
    /// killed.
    pub fn new(grace: Duration) -> Self {
        Self {
            active: Arc::new(Mutex::new(None)),
            grace,
        }
    }

    /// Spawns the process and starts streaming its output.
    ///
    /// Fails with [`SupervisorError::Busy`] while another process is active,
    /// without touching it. The check and the spawn happen under one lock.
    pub fn start(
        &self,
        invocation: &Invocation,
        run_id: &str,
    ) -> Result<TransferHandle, SupervisorError> {
        let mut slot = lock_slot(&self.active);
        if slot.is_some() {
            return Err(SupervisorError::Busy);
        }

        log::debug!("Spawning transfer: {}", invocation.describe());
        let child = invocation
            .command()
            .spawn()
            .map_err(|e| SupervisorError::Spawn {
                binary: invocation.program.clone(),
                source: e,
            })?;

        let cancel = CancellationToken::new();
        *slot = Some(ActiveProcess {
            run_id: run_id.to_string(),
            cancel: cancel.clone(),
        });
        drop(slot);

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(drive(
            child,
            cancel,
            tx,
            Arc::clone(&self.active),
            run_id.to_string(),
            self.grace,
        ));

        Ok(TransferHandle {
            run_id: run_id.to_string(),
            events: rx,
        })
    }

    /// Requests graceful termination of the active process.
    ///
    /// Returns `false` when nothing was running. Calling it repeatedly is
    /// harmless.
    pub fn stop(&self) -> bool {
        match lock_slot(&self.active).as_ref() {
            Some(active) => {
                log::info!("Stopping transfer for run {}", active.run_id);
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        lock_slot(&self.active).is_some()
    }

    pub fn active_run_id(&self) -> Option<String> {
        lock_slot(&self.active).as_ref().map(|a| a.run_id.clone())
    }
}

fn lock_slot(slot: &Mutex<Option<ActiveProcess>>) -> MutexGuard<'_, Option<ActiveProcess>> {
    slot.lock().unwrap_or_else(|poisoned| {
        log::warn!("Transfer slot lock was poisoned, recovering");
        poisoned.into_inner()
    })
}

async fn drive(
    mut child: Child,
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<TransferEvent>,
    active: Arc<Mutex<Option<ActiveProcess>>>,
    run_id: String,
    grace: Duration,
) {
    let stdout_task = child.stdout.take().map(|s| tokio::spawn(pump(s, tx.clone())));
    let stderr_task = child.stderr.take().map(|s| tokio::spawn(pump(s, tx.clone())));

    let mut stopped = false;
    let status = tokio::select! {
        status = child.wait() => status,
        _ = cancel.cancelled() => {
            stopped = true;
            terminate(&mut child, grace).await
        }
    };

    let mut summary = StreamSummary::default();
    for mut task in [stdout_task, stderr_task].into_iter().flatten() {
        match tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, &mut task).await {
            Ok(Ok(s)) => summary.merge(s),
            Ok(Err(e)) => log::warn!("Output reader for run {} panicked: {}", run_id, e),
            Err(_) => {
                log::warn!("Output of run {} still open after exit, detaching", run_id);
                task.abort();
            }
        }
    }

    let outcome = match status {
        Ok(_) if stopped => TransferOutcome::Stopped,
        Ok(status) if status.success() => TransferOutcome::Completed,
        Ok(status) => {
            let fallback = match status.code() {
                Some(code) => format!("Transfer tool exited with code {}", code),
                None => "Transfer tool was terminated by a signal".to_string(),
            };
            TransferOutcome::Failed(summary.diagnostic().unwrap_or(fallback))
        }
        Err(e) => TransferOutcome::Failed(format!("Failed to wait for transfer tool: {}", e)),
    };

    log::debug!("Transfer for run {} exited: {:?}", run_id, outcome);

    // Free the slot before reporting, so the receiver can start the next run.
    lock_slot(&active).take();
    let _ = tx.send(TransferEvent::Exited(outcome));
}

/// Sends SIGTERM, waits up to `grace`, then kills.
async fn terminate(child: &mut Child, grace: Duration) -> std::io::Result<std::process::ExitStatus> {
    send_terminate(child);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            log::warn!(
                "Transfer tool did not exit within {:?}, killing it",
                grace
            );
            child.kill().await?;
            child.wait().await
        }
    }
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) {
    // `None` means the process was already reaped.
    if let Some(pid) = child.id() {
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            log::warn!(
                "Failed to send SIGTERM to {}: {}",
                pid,
                std::io::Error::last_os_error()
            );
        }
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        log::warn!("Failed to terminate transfer tool: {}", e);
    }
}

#[derive(Debug, Default)]
struct StreamSummary {
    last_error: Option<String>,
    tail: VecDeque<String>,
}

impl StreamSummary {
    fn record(&mut self, raw: &str, parsed: &TransferLine) {
        if let TransferLine::Error(message) = parsed {
            self.last_error = Some(message.clone());
        }
        if self.tail.len() == DIAGNOSTIC_TAIL_LINES {
            self.tail.pop_front();
        }
        self.tail.push_back(raw.trim().to_string());
    }

    fn merge(&mut self, other: StreamSummary) {
        if other.last_error.is_some() {
            self.last_error = other.last_error;
        }
        for line in other.tail {
            if self.tail.len() == DIAGNOSTIC_TAIL_LINES {
                self.tail.pop_front();
            }
            self.tail.push_back(line);
        }
    }

    /// Best message explaining a failed exit.
    fn diagnostic(&self) -> Option<String> {
        if let Some(error) = &self.last_error {
            return Some(error.clone());
        }
        if self.tail.is_empty() {
            None
        } else {
            Some(self.tail.iter().cloned().collect::<Vec<_>>().join("\n"))
        }
    }
}

async fn pump<R>(mut reader: R, tx: mpsc::UnboundedSender<TransferEvent>) -> StreamSummary
where
    R: AsyncRead + Unpin,
{
    let mut summary = StreamSummary::default();
    let mut lines = LineBuffer::new();
    let mut buf = vec![0u8; READ_CHUNK_SIZE];

    let handle = |raw: String, summary: &mut StreamSummary| {
        if let Some(parsed) = parse_line(&raw) {
            summary.record(&raw, &parsed);
            let _ = tx.send(TransferEvent::Line(parsed));
        }
    };

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                for raw in lines.push(&buf[..n]) {
                    handle(raw, &mut summary);
                }
            }
            Err(e) => {
                log::warn!("Error reading transfer output: {}", e);
                break;
            }
        }
    }

    if let Some(raw) = lines.finish() {
        handle(raw, &mut summary);
    }

    summary
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn shell(script: &str) -> Invocation {
        Invocation {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
            env: Vec::new(),
        }
    }

    async fn collect(handle: &mut TransferHandle) -> (Vec<TransferLine>, TransferOutcome) {
        let mut lines = Vec::new();
        while let Some(event) = handle.next_event().await {
            match event {
                TransferEvent::Line(line) => lines.push(line),
                TransferEvent::Exited(outcome) => return (lines, outcome),
            }
        }
        panic!("channel closed without an exit event");
    }

    #[tokio::test]
    async fn test_successful_run_streams_lines() {
        let supervisor = TransferSupervisor::new(Duration::from_secs(5));
        let script = r#"echo '{"level":"info","msg":"Copied (new)","object":"a.txt"}'; echo 'Transferred: 1 KiB / 2 KiB, 50%, 1 KiB/s, ETA 1s' >&2"#;
        let mut handle = supervisor.start(&shell(script), "run-1").unwrap();
        assert_eq!(handle.run_id(), "run-1");

        let (lines, outcome) = collect(&mut handle).await;

        assert_eq!(outcome, TransferOutcome::Completed);
        assert!(lines.contains(&TransferLine::FileTransferred("a.txt".to_string())));
        assert!(lines
            .iter()
            .any(|l| matches!(l, TransferLine::Progress(p) if p.percentage == 50)));
        assert!(!supervisor.is_active());
    }

    #[tokio::test]
    async fn test_failed_run_reports_last_error() {
        let supervisor = TransferSupervisor::new(Duration::from_secs(5));
        let script = r#"echo '{"level":"error","msg":"Failed to copy: access denied","object":"b.txt"}' >&2; exit 3"#;
        let mut handle = supervisor.start(&shell(script), "run-2").unwrap();

        let (_, outcome) = collect(&mut handle).await;

        assert_eq!(
            outcome,
            TransferOutcome::Failed("b.txt: Failed to copy: access denied".to_string())
        );
    }

    #[tokio::test]
    async fn test_failed_run_without_output_reports_exit_code() {
        let supervisor = TransferSupervisor::new(Duration::from_secs(5));
        let mut handle = supervisor.start(&shell("exit 7"), "run-3").unwrap();

        let (lines, outcome) = collect(&mut handle).await;

        assert!(lines.is_empty());
        assert_eq!(
            outcome,
            TransferOutcome::Failed("Transfer tool exited with code 7".to_string())
        );
    }

    #[tokio::test]
    async fn test_busy_while_active() {
        let supervisor = TransferSupervisor::new(Duration::from_secs(5));
        let mut handle = supervisor.start(&shell("exec sleep 30"), "run-a").unwrap();

        assert!(matches!(
            supervisor.start(&shell("true"), "run-b"),
            Err(SupervisorError::Busy)
        ));
        assert_eq!(supervisor.active_run_id().as_deref(), Some("run-a"));

        assert!(supervisor.stop());
        let (_, outcome) = collect(&mut handle).await;
        assert_eq!(outcome, TransferOutcome::Stopped);
        assert!(supervisor.active_run_id().is_none());
    }

    #[tokio::test]
    async fn test_stop_kills_process_ignoring_sigterm() {
        let supervisor = TransferSupervisor::new(Duration::from_millis(200));
        let mut handle = supervisor
            .start(&shell("trap '' TERM; exec sleep 30"), "run-stubborn")
            .unwrap();

        // Let the shell install its trap.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(supervisor.stop());
        assert!(supervisor.stop());

        let (_, outcome) = collect(&mut handle).await;
        assert_eq!(outcome, TransferOutcome::Stopped);
    }

    #[tokio::test]
    async fn test_stop_without_process_is_noop() {
        let supervisor = TransferSupervisor::new(Duration::from_secs(1));
        assert!(!supervisor.stop());
        assert!(!supervisor.is_active());
    }

    #[tokio::test]
    async fn test_spawn_failure_leaves_slot_free() {
        let supervisor = TransferSupervisor::new(Duration::from_secs(1));
        let invocation = Invocation {
            program: PathBuf::from("/nonexistent/cloudstash-transfer"),
            args: Vec::new(),
            env: Vec::new(),
        };

        let result = supervisor.start(&invocation, "run-x");
        assert!(matches!(result, Err(SupervisorError::Spawn { .. })));
        assert!(!supervisor.is_active());

        let mut handle = supervisor.start(&shell("true"), "run-y").unwrap();
        let (_, outcome) = collect(&mut handle).await;
        assert_eq!(outcome, TransferOutcome::Completed);
    }
}
