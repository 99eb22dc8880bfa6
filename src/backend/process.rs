//! Backend subprocess lifecycle and log capture.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use anyhow::Context;
use parking_lot::Mutex;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

/// Environment variables pointed at the models directory unless already set.
const CACHE_ENV_VARS: &[&str] = &["HF_HOME", "TRANSFORMERS_CACHE", "HUGGINGFACE_HUB_CACHE"];

const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// A spawned backend executable listening on `address`.
#[derive(Debug)]
pub struct BackendProcess {
    executable: PathBuf,
    pid: Option<u32>,
    child: Mutex<Option<Child>>,
    log_tasks: Vec<JoinHandle<()>>,
}

impl BackendProcess {
    /// Launch `executable --addr <address>` with piped output re-emitted as
    /// `backend` log events.
    pub fn spawn(
        executable: &Path,
        address: &str,
        model: &str,
        backend: &str,
        models_path: &Path,
    ) -> anyhow::Result<Self> {
        let mut command = Command::new(executable);
        command
            .arg("--addr")
            .arg(address)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for var in CACHE_ENV_VARS {
            if std::env::var_os(var).is_none() {
                command.env(var, models_path);
            }
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to execute {}", executable.display()))?;
        let pid = child.id();
        info!(
            model,
            backend,
            pid = pid.unwrap_or_default(),
            %address,
            executable = %executable.display(),
            "Started backend process"
        );

        let mut log_tasks = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            log_tasks.push(forward_lines(stdout, model, backend, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            log_tasks.push(forward_lines(stderr, model, backend, "stderr"));
        }

        Ok(Self {
            executable: executable.to_path_buf(),
            pid,
            child: Mutex::new(Some(child)),
            log_tasks,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// False once the process has exited or was stopped.
    pub fn is_running(&self) -> bool {
        let mut guard = self.child.lock();
        match guard.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Kill the process and reap it.
    pub async fn stop(&self) {
        let child = self.child.lock().take();
        let Some(mut child) = child else {
            return;
        };
        if let Err(e) = child.start_kill() {
            debug!(pid = self.pid.unwrap_or_default(), error = %e, "Backend already exited");
        }
        match tokio::time::timeout(STOP_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(pid = self.pid.unwrap_or_default(), %status, "Backend process stopped")
            }
            Ok(Err(e)) => warn!(pid = self.pid.unwrap_or_default(), error = %e, "Failed to reap backend"),
            Err(_) => warn!(pid = self.pid.unwrap_or_default(), "Backend did not exit in time"),
        }
        for task in &self.log_tasks {
            task.abort();
        }
    }
}

fn forward_lines<R>(reader: R, model: &str, backend: &str, stream: &'static str) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let model = model.to_string();
    let backend = backend.to_string();
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    info!(target: "backend", model = %model, backend = %backend, stream, "{line}")
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(target: "backend", model = %model, backend = %backend, stream, error = %e, "Log stream closed");
                    break;
                }
            }
        }
    })
}
