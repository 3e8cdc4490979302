//! Host process management - spawning, readiness and teardown

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{HarnessError, HarnessResult};

const STDERR_TAIL_LINES: usize = 20;

/// Everything needed to start a host process
#[derive(Debug, Clone)]
pub struct HostLaunch {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
    /// Host and port the process is expected to listen on
    pub host: String,
    pub port: u16,
    pub startup_timeout: Duration,
    pub poll_interval: Duration,
    pub shutdown_grace: Duration,
}

/// Handle to a running host process.
///
/// A watcher task owns the child. It fires `host_shutdown` if the child
/// exits on its own, and terminates it once a stop is requested.
pub struct HostProcess {
    pid: Option<u32>,
    host: String,
    port: u16,
    host_shutdown: CancellationToken,
    stop_requested: CancellationToken,
    watcher: Option<JoinHandle<Option<ExitStatus>>>,
    exit_status: Arc<Mutex<Option<ExitStatus>>>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
}

impl HostProcess {
    /// Spawn the host. Does not wait for readiness.
    pub fn spawn(launch: &HostLaunch) -> HarnessResult<Self> {
        info!(
            "Starting host: {} {} (cwd: {})",
            launch.program,
            launch.args.join(" "),
            launch.working_dir.display()
        );

        let mut cmd = Command::new(&launch.program);
        cmd.args(&launch.args)
            .current_dir(&launch.working_dir)
            .envs(launch.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            HarnessError::DeploymentStartupFailed(format!("failed to spawn {}: {}", launch.program, e))
        })?;

        let pid = child.id();
        debug!("Host started with PID {:?}", pid);

        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, "stdout", None));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, "stderr", Some(stderr_tail.clone())));
        }

        let host_shutdown = CancellationToken::new();
        let stop_requested = CancellationToken::new();
        let exit_status = Arc::new(Mutex::new(None));

        let watcher = tokio::spawn(watch(
            child,
            host_shutdown.clone(),
            stop_requested.clone(),
            exit_status.clone(),
            launch.shutdown_grace,
        ));

        Ok(Self {
            pid,
            host: launch.host.clone(),
            port: launch.port,
            host_shutdown,
            stop_requested,
            watcher: Some(watcher),
            exit_status,
            stderr_tail,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Fires once if the host exits before it is stopped
    pub fn shutdown_token(&self) -> CancellationToken {
        self.host_shutdown.clone()
    }

    /// Block until the host accepts connections, exits, or `timeout_duration` elapses
    pub async fn wait_until_ready(&self, timeout_duration: Duration, poll_interval: Duration) -> HarnessResult<()> {
        let start = Instant::now();
        let mut attempts = 0u32;

        while start.elapsed() < timeout_duration {
            if self.host_shutdown.is_cancelled() {
                return Err(self.exited_during_startup());
            }

            attempts += 1;
            match TcpStream::connect((self.host.as_str(), self.port)).await {
                Ok(_) => {
                    info!(
                        "Host is accepting connections on {}:{} after {:?}",
                        self.host,
                        self.port,
                        start.elapsed()
                    );
                    return Ok(());
                }
                Err(e) => {
                    if attempts == 1 {
                        info!("Waiting for host to start...");
                    }
                    if e.kind() != std::io::ErrorKind::ConnectionRefused {
                        debug!("Readiness check error: {}", e);
                    }
                }
            }

            tokio::select! {
                _ = self.host_shutdown.cancelled() => return Err(self.exited_during_startup()),
                _ = sleep(poll_interval) => {}
            }
        }

        Err(HarnessError::DeploymentStartupFailed(format!(
            "host did not accept connections on {}:{} within {:?} ({} checks)",
            self.host, self.port, timeout_duration, attempts
        )))
    }

    fn exited_during_startup(&self) -> HarnessError {
        let status = *self.exit_status.lock();
        let status = status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown status".to_string());
        let tail: Vec<String> = self.stderr_tail.lock().iter().cloned().collect();
        HarnessError::DeploymentStartupFailed(format!(
            "host exited during startup ({}); stderr: {}",
            status,
            if tail.is_empty() { "<empty>".to_string() } else { tail.join(" | ") }
        ))
    }

    /// Stop the host if it is still running. Safe to call more than once.
    pub async fn stop(&mut self) -> Option<ExitStatus> {
        self.stop_requested.cancel();
        match self.watcher.take() {
            Some(handle) => match handle.await {
                Ok(status) => status,
                Err(e) => {
                    warn!("Host watcher task failed: {}", e);
                    None
                }
            },
            None => *self.exit_status.lock(),
        }
    }
}

impl Drop for HostProcess {
    fn drop(&mut self) {
        // The watcher terminates the child; kill_on_drop covers an aborted runtime
        self.stop_requested.cancel();
    }
}

async fn watch(
    mut child: Child,
    host_shutdown: CancellationToken,
    stop_requested: CancellationToken,
    exit_status: Arc<Mutex<Option<ExitStatus>>>,
    grace: Duration,
) -> Option<ExitStatus> {
    let exited = tokio::select! {
        status = child.wait() => Some(status.ok()),
        _ = stop_requested.cancelled() => None,
    };

    match exited {
        Some(status) => {
            *exit_status.lock() = status;
            if !stop_requested.is_cancelled() {
                warn!("Host process exited unexpectedly: {:?}", status);
                host_shutdown.cancel();
            }
            status
        }
        None => {
            let status = terminate(&mut child, grace).await;
            *exit_status.lock() = status;
            status
        }
    }
}

async fn terminate(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    info!("Stopping host (pid: {:?})", child.id());

    // Try graceful shutdown first
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            if kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok() {
                if let Ok(status) = timeout(grace, child.wait()).await {
                    return status.ok();
                }
            }
        }
    }

    // Force kill if still running
    if let Err(e) = child.kill().await {
        debug!("Kill failed (host already gone?): {}", e);
    }
    child.wait().await.ok()
}

async fn forward_lines<R>(reader: R, stream: &'static str, tail: Option<Arc<Mutex<VecDeque<String>>>>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "storefront_e2e::host_output", "[{}] {}", stream, line);
        if let Some(tail) = &tail {
            let mut tail = tail.lock();
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str, port: u16) -> HostLaunch {
        HostLaunch {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            working_dir: std::env::temp_dir(),
            env: vec![("STOREFRONT_MARKER".to_string(), "42".to_string())],
            host: "127.0.0.1".to_string(),
            port,
            startup_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(20),
            shutdown_grace: Duration::from_millis(200),
        }
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[tokio::test]
    async fn test_spawn_failure_is_startup_failure() {
        let mut launch = sh("true", free_port());
        launch.program = "/definitely/not/a/host".to_string();
        assert!(matches!(
            HostProcess::spawn(&launch),
            Err(HarnessError::DeploymentStartupFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_early_exit_fails_readiness_and_fires_token() {
        let launch = sh("echo bind failed >&2; exit 7", free_port());
        let mut host = HostProcess::spawn(&launch).unwrap();
        let token = host.shutdown_token();

        let err = host
            .wait_until_ready(launch.startup_timeout, launch.poll_interval)
            .await
            .unwrap_err();
        assert!(token.is_cancelled());
        match err {
            HarnessError::DeploymentStartupFailed(msg) => assert!(msg.contains("exited during startup")),
            other => panic!("unexpected error: {other}"),
        }

        let status = host.stop().await.unwrap();
        assert_eq!(status.code(), Some(7));
    }

    #[tokio::test]
    async fn test_readiness_timeout() {
        let launch = sh("sleep 30", free_port());
        let mut host = HostProcess::spawn(&launch).unwrap();

        let err = host
            .wait_until_ready(Duration::from_millis(200), launch.poll_interval)
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::DeploymentStartupFailed(_)));

        host.stop().await;
        assert!(!host.shutdown_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_ready_when_port_accepts_and_stop_is_idempotent() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let launch = sh("sleep 30", port);
        let mut host = HostProcess::spawn(&launch).unwrap();

        host.wait_until_ready(launch.startup_timeout, launch.poll_interval)
            .await
            .unwrap();

        let first = host.stop().await;
        assert!(first.is_some());
        host.stop().await;
        assert!(!host.shutdown_token().is_cancelled());
    }
}
