//! Table of managed processes and the tasks that capture their output.
//!
//! Each process gets a supervisor task that reads stdout line by line,
//! appends every line to the process's log buffer and broadcasts it to
//! live subscribers. When the process exits (or is killed) the broadcast
//! sender is dropped, which ends every open live log stream.
use serde::Serialize;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, oneshot, Mutex, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    Done(i32),
    /// Terminated without an exit code (signal or kill request).
    Killed,
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessStatus::Running => write!(f, "running"),
            ProcessStatus::Done(code) => write!(f, "done {code}"),
            ProcessStatus::Killed => write!(f, "killed"),
        }
    }
}

/// A process as exposed over the API.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProcessView {
    pub uuid: String,
    pub cmd: String,
    pub status: String,
    pub log: String,
}

/// Errors from starting a process.
#[derive(Debug)]
pub enum SpawnError {
    EmptyCommand,
    Spawn { cmd: String, source: std::io::Error },
}

impl std::fmt::Display for SpawnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpawnError::EmptyCommand => write!(f, "command is empty"),
            SpawnError::Spawn { cmd, source } => write!(f, "failed to spawn {cmd:?}: {source}"),
        }
    }
}

impl std::error::Error for SpawnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SpawnError::EmptyCommand => None,
            SpawnError::Spawn { source, .. } => Some(source),
        }
    }
}

/// Errors from killing a process.
#[derive(Debug)]
pub enum KillError {
    NotFound,
    /// The signal could not be delivered; the process stays registered.
    Kill { uuid: String, source: std::io::Error },
}

impl std::fmt::Display for KillError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KillError::NotFound => write!(f, "no such process"),
            KillError::Kill { uuid, source } => write!(f, "failed to kill {uuid}: {source}"),
        }
    }
}

impl std::error::Error for KillError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            KillError::NotFound => None,
            KillError::Kill { source, .. } => Some(source),
        }
    }
}

/// Sent with a kill request; the supervisor answers once the kill is done.
type KillReply = oneshot::Sender<std::io::Result<()>>;

/// Everything a live log response needs: the lines produced so far and,
/// while the process runs, a receiver for the ones still to come.
#[derive(Debug)]
pub struct LogSubscription {
    pub backlog: Vec<String>,
    pub live: Option<broadcast::Receiver<String>>,
}

struct ManagedProcess {
    seq: u64,
    cmd: String,
    status: ProcessStatus,
    buffer: Vec<String>,
    tx: Option<broadcast::Sender<String>>,
    kill: Option<oneshot::Sender<KillReply>>,
}

impl ManagedProcess {
    fn publish(&mut self, line: String) {
        if let Some(tx) = &self.tx {
            // No subscribers is fine
            let _ = tx.send(line.clone());
        }
        self.buffer.push(line);
    }

    fn finish(&mut self, status: ProcessStatus) {
        self.status = status;
        self.tx = None;
        self.kill = None;
    }

    fn view(&self, uuid: &str, with_log: bool) -> ProcessView {
        let log = if with_log {
            self.buffer.iter().map(|l| format!("{l}\n")).collect()
        } else {
            String::new()
        };
        ProcessView {
            uuid: uuid.to_string(),
            cmd: self.cmd.clone(),
            status: self.status.to_string(),
            log,
        }
    }
}

type Shared = Arc<Mutex<ManagedProcess>>;

#[derive(Clone)]
pub struct Registry {
    processes: Arc<RwLock<HashMap<String, Shared>>>,
    next_seq: Arc<std::sync::atomic::AtomicU64>,
    log_channel_capacity: usize,
}

impl Registry {
    pub fn new(log_channel_capacity: usize) -> Self {
        Self {
            processes: Arc::new(RwLock::new(HashMap::new())),
            next_seq: Arc::new(std::sync::atomic::AtomicU64::new(0)),
            log_channel_capacity: log_channel_capacity.max(1),
        }
    }

    /// Start `cmd` and register it under a fresh UUID.
    ///
    /// The first whitespace-separated word is the program, the rest are its
    /// arguments. No shell is involved.
    pub async fn spawn(&self, cmd: &str) -> Result<ProcessView, SpawnError> {
        let mut parts = cmd.split_whitespace();
        let program = parts.next().ok_or(SpawnError::EmptyCommand)?;

        let mut child = Command::new(program)
            .args(parts)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SpawnError::Spawn {
                cmd: cmd.to_string(),
                source: e,
            })?;
        let stdout = child.stdout.take();

        let uuid = uuid::Uuid::new_v4().to_string();
        let (tx, _) = broadcast::channel(self.log_channel_capacity);
        let (kill_tx, kill_rx) = oneshot::channel();
        let process = Arc::new(Mutex::new(ManagedProcess {
            seq: self
                .next_seq
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            cmd: cmd.to_string(),
            status: ProcessStatus::Running,
            buffer: Vec::new(),
            tx: Some(tx),
            kill: Some(kill_tx),
        }));

        let view = process.lock().await.view(&uuid, false);
        self.processes
            .write()
            .await
            .insert(uuid.clone(), Arc::clone(&process));

        tracing::info!(uuid = %uuid, cmd, pid = ?child.id(), "process started");
        tokio::spawn(supervise(uuid, child, stdout, process, kill_rx));
        Ok(view)
    }

    /// All processes in start order, without their logs.
    pub async fn list(&self) -> Vec<ProcessView> {
        let processes = self.processes.read().await;
        let mut views = Vec::with_capacity(processes.len());
        for (uuid, process) in processes.iter() {
            let p = process.lock().await;
            views.push((p.seq, p.view(uuid, false)));
        }
        views.sort_by_key(|(seq, _)| *seq);
        views.into_iter().map(|(_, v)| v).collect()
    }

    /// One process with its full buffered log.
    pub async fn get(&self, uuid: &str) -> Option<ProcessView> {
        let process = self.lookup(uuid).await?;
        let view = process.lock().await.view(uuid, true);
        Some(view)
    }

    /// Snapshot the backlog and subscribe to new lines atomically, so no
    /// line is missed or repeated between the two.
    pub async fn subscribe(&self, uuid: &str) -> Option<LogSubscription> {
        let process = self.lookup(uuid).await?;
        let p = process.lock().await;
        Some(LogSubscription {
            backlog: p.buffer.clone(),
            live: p.tx.as_ref().map(|tx| tx.subscribe()),
        })
    }

    /// Kill a process, wait for the supervisor to confirm, then forget it.
    ///
    /// A process that already finished is just removed.
    pub async fn kill(&self, uuid: &str) -> Result<(), KillError> {
        let process = self.lookup(uuid).await.ok_or(KillError::NotFound)?;
        let request = process.lock().await.kill.take();
        if let Some(request) = request {
            let (reply_tx, reply_rx) = oneshot::channel();
            // A dropped request or reply means the supervisor already finished
            if request.send(reply_tx).is_ok() {
                if let Ok(Err(e)) = reply_rx.await {
                    return Err(KillError::Kill {
                        uuid: uuid.to_string(),
                        source: e,
                    });
                }
            }
        }
        self.processes.write().await.remove(uuid);
        tracing::info!(uuid, "process removed");
        Ok(())
    }

    async fn lookup(&self, uuid: &str) -> Option<Shared> {
        self.processes.read().await.get(uuid).cloned()
    }
}

async fn supervise(
    uuid: String,
    mut child: Child,
    stdout: Option<impl AsyncRead + Unpin>,
    process: Shared,
    mut kill_rx: oneshot::Receiver<KillReply>,
) {
    // Set once kill_rx has resolved; it must not be polled again after that
    let mut kill_request = None;

    if let Some(stdout) = stdout {
        let mut reader = BufReader::new(stdout);
        let mut buf = Vec::new();
        loop {
            tokio::select! {
                read = reader.read_until(b'\n', &mut buf) => match read {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf);
                        let line = line.trim_end_matches(|c| c == '\n' || c == '\r').to_string();
                        buf.clear();
                        process.lock().await.publish(line);
                    }
                    Err(e) => {
                        tracing::warn!(uuid = %uuid, error = %e, "failed to read process output");
                        break;
                    }
                },
                request = &mut kill_rx => {
                    kill_request = Some(request.ok());
                    break;
                }
            }
        }
    }

    let status = match kill_request {
        Some(reply) => terminate(&uuid, &mut child, reply).await,
        None => tokio::select! {
            status = child.wait() => exit_status(&uuid, status),
            request = &mut kill_rx => terminate(&uuid, &mut child, request.ok()).await,
        },
    };

    tracing::info!(uuid = %uuid, status = %status, "process finished");
    process.lock().await.finish(status);
}

/// Kill the child and report the outcome to the requester. If the kill
/// fails the child is left to exit on its own.
async fn terminate(uuid: &str, child: &mut Child, reply: Option<KillReply>) -> ProcessStatus {
    let result = child.kill().await;
    let failed = result.is_err();
    if let Err(e) = &result {
        tracing::warn!(uuid, error = %e, "failed to kill process");
    }
    if let Some(reply) = reply {
        let _ = reply.send(result);
    }
    if failed {
        exit_status(uuid, child.wait().await)
    } else {
        ProcessStatus::Killed
    }
}

fn exit_status(uuid: &str, status: std::io::Result<std::process::ExitStatus>) -> ProcessStatus {
    match status {
        Ok(status) => status.code().map_or(ProcessStatus::Killed, ProcessStatus::Done),
        Err(e) => {
            tracing::warn!(uuid, error = %e, "failed to wait for process");
            ProcessStatus::Killed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn wait_for_status(registry: &Registry, uuid: &str) -> ProcessView {
        for _ in 0..200 {
            let view = registry.get(uuid).await.unwrap();
            if view.status != "running" {
                return view;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("process {uuid} did not finish");
    }

    #[test]
    fn test_status_display() {
        assert_eq!(ProcessStatus::Running.to_string(), "running");
        assert_eq!(ProcessStatus::Done(3).to_string(), "done 3");
        assert_eq!(ProcessStatus::Killed.to_string(), "killed");
    }

    #[tokio::test]
    async fn test_spawn_captures_output_and_exit_code() {
        let registry = Registry::new(16);
        let view = registry.spawn("echo hello world").await.unwrap();
        assert_eq!(view.status, "running");
        assert_eq!(view.cmd, "echo hello world");

        let done = wait_for_status(&registry, &view.uuid).await;
        assert_eq!(done.status, "done 0");
        assert_eq!(done.log, "hello world\n");
    }

    #[tokio::test]
    async fn test_nonzero_exit_code() {
        let registry = Registry::new(16);
        let view = registry.spawn("false").await.unwrap();
        let done = wait_for_status(&registry, &view.uuid).await;
        assert_eq!(done.status, "done 1");
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let registry = Registry::new(16);
        let err = registry.spawn("nonexistent-binary-xyz").await.unwrap_err();
        assert!(matches!(err, SpawnError::Spawn { .. }));
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_empty_command() {
        let registry = Registry::new(16);
        let err = registry.spawn("   ").await.unwrap_err();
        assert!(matches!(err, SpawnError::EmptyCommand));
    }

    #[tokio::test]
    async fn test_list_in_start_order() {
        let registry = Registry::new(16);
        let a = registry.spawn("true").await.unwrap();
        let b = registry.spawn("true").await.unwrap();
        let c = registry.spawn("true").await.unwrap();

        let uuids: Vec<String> = registry.list().await.into_iter().map(|v| v.uuid).collect();
        assert_eq!(uuids, vec![a.uuid, b.uuid, c.uuid]);
    }

    #[tokio::test]
    async fn test_subscribe_after_exit_has_backlog_only() {
        let registry = Registry::new(16);
        let view = registry.spawn("printf a\\nb\\n").await.unwrap();
        wait_for_status(&registry, &view.uuid).await;

        let sub = registry.subscribe(&view.uuid).await.unwrap();
        assert_eq!(sub.backlog, vec!["a", "b"]);
        assert!(sub.live.is_none());
    }

    #[tokio::test]
    async fn test_live_subscriber_closed_on_exit() {
        let registry = Registry::new(16);
        let view = registry.spawn("sleep 0.2").await.unwrap();

        let sub = registry.subscribe(&view.uuid).await.unwrap();
        let mut rx = sub.live.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert!(matches!(result, Err(broadcast::error::RecvError::Closed)));
    }

    #[tokio::test]
    async fn test_kill_removes_and_terminates() {
        let registry = Registry::new(16);
        let view = registry.spawn("sleep 30").await.unwrap();
        let sub = registry.subscribe(&view.uuid).await.unwrap();
        let mut rx = sub.live.unwrap();

        registry.kill(&view.uuid).await.unwrap();
        assert!(registry.get(&view.uuid).await.is_none());
        assert!(matches!(
            registry.kill(&view.uuid).await,
            Err(KillError::NotFound)
        ));

        // Stream ends once the supervisor has killed the child
        let result = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert!(matches!(result, Err(broadcast::error::RecvError::Closed)));
    }

    #[tokio::test]
    async fn test_unknown_uuid() {
        let registry = Registry::new(16);
        assert!(registry.get("nope").await.is_none());
        assert!(registry.subscribe("nope").await.is_none());
    }

    #[tokio::test]
    async fn test_kill_after_exit_just_removes() {
        let registry = Registry::new(16);
        let view = registry.spawn("true").await.unwrap();
        let done = wait_for_status(&registry, &view.uuid).await;
        assert_eq!(done.status, "done 0");

        registry.kill(&view.uuid).await.unwrap();
        assert!(registry.get(&view.uuid).await.is_none());
    }

    #[tokio::test]
    async fn test_terminate_reports_kill_failure() {
        let mut child = Command::new("true").spawn().unwrap();
        child.wait().await.unwrap();

        // An already reaped child cannot be signalled
        let (reply_tx, reply_rx) = oneshot::channel();
        let status = terminate("reaped", &mut child, Some(reply_tx)).await;
        assert!(reply_rx.await.unwrap().is_err());
        assert_eq!(status, ProcessStatus::Done(0));
    }

    #[tokio::test]
    async fn test_terminate_reports_success() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let (reply_tx, reply_rx) = oneshot::channel();
        let status = terminate("sleeper", &mut child, Some(reply_tx)).await;
        assert!(reply_rx.await.unwrap().is_ok());
        assert_eq!(status, ProcessStatus::Killed);
    }

    #[tokio::test]
    async fn test_self_signalled_process_is_killed() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("suicide.sh");
        std::fs::write(&script, "echo before\nkill -9 $$\necho after\n").unwrap();

        let registry = Registry::new(16);
        let view = registry
            .spawn(&format!("sh {}", script.display()))
            .await
            .unwrap();
        let done = wait_for_status(&registry, &view.uuid).await;
        assert_eq!(done.status, "killed");
        assert_eq!(done.log, "before\n");
    }
}
