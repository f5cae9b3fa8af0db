use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use forma_types::ExecutionResult;

use crate::artifacts::ArtifactStore;
use crate::script::finalize_script;

pub const DEFAULT_INTERPRETER: &str = "python3";
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct ExecutionOptions {
    pub interpreter: String,
    pub timeout: Duration,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            interpreter: DEFAULT_INTERPRETER.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

struct ProcessOutput {
    stdout: String,
    stderr: String,
    exit_code: Option<i32>,
    timed_out: bool,
}

/// Runs finalized scripts in an isolated interpreter process.
///
/// Script-level failures (non-zero exit, exceptions) are data and come
/// back inside `ExecutionResult`; only a spawn-level failure is an `Err`.
#[derive(Clone)]
pub struct ExecutionPipeline {
    options: ExecutionOptions,
    artifacts: ArtifactStore,
}

impl ExecutionPipeline {
    pub fn new(options: ExecutionOptions, artifacts: ArtifactStore) -> Self {
        Self { options, artifacts }
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub fn timeout(&self) -> Duration {
        self.options.timeout
    }

    /// Execute a script against a session's artifact slot. The artifact
    /// url is decided by a filesystem existence check after exit: a script
    /// that exported a valid model and then raised still yields a
    /// reference.
    pub async fn execute(
        &self,
        code: &str,
        slot: &str,
        cancel: CancellationToken,
    ) -> anyhow::Result<ExecutionResult> {
        let paths = self.artifacts.paths_for(slot);
        let program = finalize_script(code, &paths);
        let output = self.run_interpreter(&program, cancel).await?;

        let artifact_url = self.artifacts.resolve_artifact(slot).await;
        tracing::info!(
            slot,
            exit_code = ?output.exit_code,
            timed_out = output.timed_out,
            artifact = artifact_url.is_some(),
            "script execution finished"
        );

        Ok(ExecutionResult {
            artifact_url,
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.exit_code,
            timed_out: output.timed_out,
        })
    }

    async fn run_interpreter(
        &self,
        program: &str,
        cancel: CancellationToken,
    ) -> anyhow::Result<ProcessOutput> {
        let mut child = Command::new(&self.options.interpreter)
            .arg("-c")
            .arg(program)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                anyhow::anyhow!(
                    "failed to spawn interpreter `{}`: {}",
                    self.options.interpreter,
                    err
                )
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("stdout unavailable"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow::anyhow!("stderr unavailable"))?;

        let stdout_buf = Arc::new(RwLock::new(String::new()));
        let stderr_buf = Arc::new(RwLock::new(String::new()));
        let stdout_task = tokio::spawn(read_stream(stdout_buf.clone(), stdout));
        let stderr_task = tokio::spawn(read_stream(stderr_buf.clone(), stderr));

        let mut timed_out = false;
        let mut cancelled = false;
        let status = tokio::select! {
            status = tokio::time::timeout(self.options.timeout, child.wait()) => {
                match status {
                    Ok(status) => Some(status?),
                    Err(_) => {
                        timed_out = true;
                        child.start_kill()?;
                        Some(child.wait().await?)
                    }
                }
            }
            _ = cancel.cancelled() => {
                cancelled = true;
                child.start_kill()?;
                let _ = child.wait().await;
                None
            }
        };

        // Readers finish at EOF once the pipes close.
        let _ = stdout_task.await;
        let _ = stderr_task.await;

        let stdout = stdout_buf.read().await.clone();
        let mut stderr = stderr_buf.read().await.clone();
        if timed_out {
            if !stderr.is_empty() && !stderr.ends_with('\n') {
                stderr.push('\n');
            }
            stderr.push_str(&format!(
                "execution timed out after {} seconds",
                self.options.timeout.as_secs()
            ));
        }
        if cancelled {
            if !stderr.is_empty() && !stderr.ends_with('\n') {
                stderr.push('\n');
            }
            stderr.push_str("execution cancelled");
        }

        Ok(ProcessOutput {
            stdout,
            stderr,
            exit_code: status.and_then(|s| if timed_out { None } else { s.code() }),
            timed_out,
        })
    }
}

async fn read_stream(
    output: Arc<RwLock<String>>,
    mut stream: impl tokio::io::AsyncRead + Unpin + Send + 'static,
) {
    let mut buf = vec![0_u8; 4096];
    loop {
        let read = match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        let chunk = String::from_utf8_lossy(&buf[..read]).to_string();
        let mut out = output.write().await;
        out.push_str(&chunk);
        if out.len() > 200_000 {
            let cut = out.len().saturating_sub(100_000);
            let tail = out.split_off(cut);
            *out = tail;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forma_types::ArtifactFormat;

    async fn pipeline(interpreter: &str, timeout: Duration) -> (tempfile::TempDir, ExecutionPipeline) {
        let dir = tempfile::tempdir().expect("tempdir");
        let artifacts = ArtifactStore::new(dir.path().join("generated"))
            .await
            .expect("store");
        let pipeline = ExecutionPipeline::new(
            ExecutionOptions {
                interpreter: interpreter.to_string(),
                timeout,
            },
            artifacts,
        );
        (dir, pipeline)
    }

    #[tokio::test]
    async fn captures_stdout_and_stderr_separately() {
        let (_dir, pipeline) = pipeline("sh", Duration::from_secs(5)).await;
        let output = pipeline
            .run_interpreter("echo out; echo err 1>&2", CancellationToken::new())
            .await
            .expect("run");
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
        assert_eq!(output.exit_code, Some(0));
        assert!(!output.timed_out);
    }

    #[tokio::test]
    async fn reports_nonzero_exit_codes() {
        let (_dir, pipeline) = pipeline("sh", Duration::from_secs(5)).await;
        let output = pipeline
            .run_interpreter("exit 3", CancellationToken::new())
            .await
            .expect("run");
        assert_eq!(output.exit_code, Some(3));
    }

    #[tokio::test]
    async fn kills_the_child_on_timeout() {
        let (_dir, pipeline) = pipeline("sh", Duration::from_millis(200)).await;
        let start = std::time::Instant::now();
        let output = pipeline
            .run_interpreter("sleep 5", CancellationToken::new())
            .await
            .expect("run");
        assert!(output.timed_out);
        assert!(output.stderr.contains("timed out"));
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn spawn_failure_is_an_error_not_a_result() {
        let (_dir, pipeline) =
            pipeline("/nonexistent/forma-interpreter", Duration::from_secs(1)).await;
        let err = pipeline
            .execute("pass", "slot", CancellationToken::new())
            .await
            .err()
            .expect("spawn error");
        assert!(err.to_string().contains("failed to spawn interpreter"));
    }

    #[tokio::test]
    async fn script_failure_is_data_with_no_artifact() {
        // A shell cannot run the Python preamble; the run fails before
        // any export happens, which is exactly the failure-is-data path.
        let (_dir, pipeline) = pipeline("sh", Duration::from_secs(5)).await;
        let result = pipeline
            .execute("result = 1", "slot-a", CancellationToken::new())
            .await
            .expect("result");
        assert!(result.artifact_url.is_none());
        assert!(!result.stderr.is_empty());
        assert_ne!(result.exit_code, Some(0));
    }

    #[tokio::test]
    async fn artifact_presence_is_independent_of_exit_status() {
        let (_dir, pipeline) = pipeline("sh", Duration::from_secs(5)).await;
        let slot = pipeline.artifacts().new_slot();
        let model_path = pipeline.artifacts().path_for(&slot, ArtifactFormat::Model);
        tokio::fs::write(&model_path, b"solid").await.expect("write");

        let result = pipeline
            .execute("result = 1", &slot, CancellationToken::new())
            .await
            .expect("result");
        // The interpreter run failed, but the expected file exists.
        assert_ne!(result.exit_code, Some(0));
        assert_eq!(result.artifact_url, Some(format!("{slot}.3mf")));
    }
}
