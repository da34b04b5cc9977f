//! External dump and restore tools
//!
//! Runs `pg_dump` / `pg_restore` (or configured replacements) as child
//! processes with a discrete argument vector. The connection password is only
//! ever passed through the child's `PGPASSWORD` environment variable and
//! captured stderr is scrubbed before it is logged or returned.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{ConnectionConfig, ToolSettings};
use crate::crypto::redact;
use crate::error::{BackupError, BackupResult};

const PASSWORD_ENV: &str = "PGPASSWORD";
const COPY_CHUNK: usize = 64 * 1024;
const STDERR_LIMIT: usize = 16 * 1024;
const VERSION_TIMEOUT: Duration = Duration::from_secs(10);

/// Cancellation and time limit applied to one tool invocation
#[derive(Debug, Clone, Default)]
pub struct RunLimits {
    pub cancel: CancellationToken,
    pub timeout: Option<Duration>,
}

impl RunLimits {
    pub fn new(cancel: CancellationToken, timeout: Option<Duration>) -> Self {
        Self { cancel, timeout }
    }
}

/// Port over the external dump/restore tooling
#[async_trait]
pub trait DatabaseTool: Send + Sync {
    /// Dump the database into `output`, returning the number of bytes written
    async fn dump(
        &self,
        connection: &ConnectionConfig,
        output: &Path,
        limits: &RunLimits,
    ) -> BackupResult<u64>;

    /// Load the dump at `input` into the database named by `connection`
    async fn restore(
        &self,
        input: &Path,
        connection: &ConnectionConfig,
        drop_existing: bool,
        limits: &RunLimits,
    ) -> BackupResult<()>;

    /// Version string reported by the dump tool, if it can be determined
    /// within `limits`
    async fn version(&self, limits: &RunLimits) -> Option<String>;
}

/// [`DatabaseTool`] backed by real child processes
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    tools: ToolSettings,
    max_output_bytes: u64,
}

impl ProcessRunner {
    pub fn new(tools: ToolSettings, max_output_bytes: u64) -> Self {
        Self {
            tools,
            max_output_bytes,
        }
    }

    fn command(&self, program: &str, args: &[String], connection: &ConnectionConfig) -> Command {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(password) = &connection.password {
            cmd.env(PASSWORD_ENV, password.as_str());
        }
        cmd
    }
}

#[async_trait]
impl DatabaseTool for ProcessRunner {
    async fn dump(
        &self,
        connection: &ConnectionConfig,
        output: &Path,
        limits: &RunLimits,
    ) -> BackupResult<u64> {
        let program = &self.tools.dump_program;
        let args = dump_args(connection);
        debug!(program = %program, ?args, output = %output.display(), "Spawning dump tool");

        let mut cmd = self.command(program, &args, connection);
        cmd.stdout(Stdio::piped());
        let mut child = cmd.spawn().map_err(|e| BackupError::DumpFailure {
            status: None,
            stderr: format!("Failed to spawn {}: {}", program, e),
        })?;

        let stderr_task = capture_stderr(child.stderr.take());
        let mut file = tokio::fs::File::create(output).await.map_err(|e| {
            BackupError::Io(format!("Failed to create {}: {}", output.display(), e))
        })?;

        let outcome = tokio::select! {
            result = drive_dump(&mut child, &mut file, self.max_output_bytes) => result,
            _ = limits.cancel.cancelled() => Err(BackupError::Cancelled),
            _ = deadline(limits.timeout) => Err(timeout_error(limits.timeout)),
        };
        drop(file);

        let (written, status) = match outcome {
            Ok(done) => done,
            Err(e) => {
                stop_child(&mut child, stderr_task).await;
                remove_partial(output).await;
                return Err(e);
            }
        };

        let stderr = redact(
            &stderr_task.await.unwrap_or_default(),
            connection.password.as_ref(),
        );
        if !status.success() {
            remove_partial(output).await;
            return Err(BackupError::DumpFailure {
                status: status.code(),
                stderr,
            });
        }
        if !stderr.is_empty() {
            debug!(stderr = %stderr, "Dump tool diagnostics");
        }

        Ok(written)
    }

    async fn restore(
        &self,
        input: &Path,
        connection: &ConnectionConfig,
        drop_existing: bool,
        limits: &RunLimits,
    ) -> BackupResult<()> {
        let program = &self.tools.restore_program;
        let args = restore_args(connection, drop_existing, input);
        debug!(program = %program, ?args, "Spawning restore tool");

        let mut cmd = self.command(program, &args, connection);
        cmd.stdout(Stdio::null());
        let mut child = cmd.spawn().map_err(|e| BackupError::RestoreFailure {
            status: None,
            stderr: format!("Failed to spawn {}: {}", program, e),
        })?;

        let stderr_task = capture_stderr(child.stderr.take());

        let outcome = tokio::select! {
            result = child.wait() => result.map_err(BackupError::from),
            _ = limits.cancel.cancelled() => Err(BackupError::Cancelled),
            _ = deadline(limits.timeout) => Err(timeout_error(limits.timeout)),
        };

        let status = match outcome {
            Ok(status) => status,
            Err(e) => {
                stop_child(&mut child, stderr_task).await;
                return Err(e);
            }
        };

        let stderr = redact(
            &stderr_task.await.unwrap_or_default(),
            connection.password.as_ref(),
        );
        if !status.success() {
            return Err(BackupError::RestoreFailure {
                status: status.code(),
                stderr,
            });
        }

        Ok(())
    }

    async fn version(&self, limits: &RunLimits) -> Option<String> {
        let child = Command::new(&self.tools.dump_program)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .ok()?;

        let timeout = limits
            .timeout
            .map_or(VERSION_TIMEOUT, |t| t.min(VERSION_TIMEOUT));
        // dropping the wait future on cancel or timeout kills the child
        let output = tokio::select! {
            result = child.wait_with_output() => result.ok()?,
            _ = limits.cancel.cancelled() => return None,
            _ = deadline(Some(timeout)) => {
                warn!(program = %self.tools.dump_program, "Version check timed out");
                return None;
            }
        };
        if !output.status.success() {
            return None;
        }
        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!version.is_empty()).then_some(version)
    }
}

/// Arguments for the dump tool; never contains the password
pub fn dump_args(connection: &ConnectionConfig) -> Vec<String> {
    let mut args = connection_args(connection);
    args.extend(["--format".to_string(), "custom".to_string()]);
    args.push("--no-password".to_string());
    args
}

/// Arguments for the restore tool; the input file comes last
pub fn restore_args(connection: &ConnectionConfig, drop_existing: bool, input: &Path) -> Vec<String> {
    let mut args = connection_args(connection);
    args.push("--no-password".to_string());
    if drop_existing {
        args.push("--clean".to_string());
        args.push("--if-exists".to_string());
    }
    args.push(input.display().to_string());
    args
}

fn connection_args(connection: &ConnectionConfig) -> Vec<String> {
    vec![
        "--host".to_string(),
        connection.host.clone(),
        "--port".to_string(),
        connection.port.to_string(),
        "--username".to_string(),
        connection.username.clone(),
        "--dbname".to_string(),
        connection.database.clone(),
    ]
}

async fn drive_dump(
    child: &mut Child,
    file: &mut tokio::fs::File,
    limit: u64,
) -> BackupResult<(u64, ExitStatus)> {
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| BackupError::Io("Dump tool stdout was not captured".to_string()))?;

    let written = copy_limited(&mut stdout, file, limit).await?;
    file.flush().await?;
    file.sync_all().await?;

    let status = child.wait().await?;
    Ok((written, status))
}

/// Copy `reader` into `writer`, failing once more than `limit` bytes arrive
async fn copy_limited<R, W>(reader: &mut R, writer: &mut W, limit: u64) -> BackupResult<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut total: u64 = 0;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        total += n as u64;
        if total > limit {
            return Err(BackupError::ArtifactTooLarge { size: total, limit });
        }
        writer.write_all(&buf[..n]).await?;
    }
}

/// Drain stderr in the background, keeping at most `STDERR_LIMIT` bytes
fn capture_stderr(stderr: Option<ChildStderr>) -> JoinHandle<String> {
    tokio::spawn(async move {
        let mut captured = Vec::new();
        if let Some(mut stderr) = stderr {
            let mut buf = [0u8; 4096];
            loop {
                match stderr.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let room = STDERR_LIMIT.saturating_sub(captured.len());
                        captured.extend_from_slice(&buf[..n.min(room)]);
                    }
                }
            }
        }
        String::from_utf8_lossy(&captured).trim().to_string()
    })
}

async fn deadline(timeout: Option<Duration>) {
    match timeout {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending::<()>().await,
    }
}

fn timeout_error(timeout: Option<Duration>) -> BackupError {
    BackupError::Timeout {
        seconds: timeout.map(|d| d.as_secs()).unwrap_or(0),
    }
}

async fn stop_child(child: &mut Child, stderr_task: JoinHandle<String>) {
    if let Err(e) = child.kill().await {
        debug!(error = %e, "Child already exited");
    }
    stderr_task.abort();
}

async fn remove_partial(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove partial dump");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SecureString;

    fn connection() -> ConnectionConfig {
        let mut connection = ConnectionConfig::default().with_database("pos");
        connection.password = Some(SecureString::new("sup3r-s3cret-pw"));
        connection
    }

    #[test]
    fn test_dump_args_exclude_password() {
        let args = dump_args(&connection());
        assert!(args.contains(&"--dbname".to_string()));
        assert!(args.contains(&"pos".to_string()));
        assert!(args.windows(2).any(|w| w == ["--format", "custom"]));
        assert!(!args.iter().any(|a| a.contains("sup3r-s3cret-pw")));
    }

    #[test]
    fn test_restore_args() {
        let input = Path::new("/tmp/x.dump");
        let plain = restore_args(&connection(), false, input);
        assert!(!plain.contains(&"--clean".to_string()));
        assert_eq!(plain.last().map(String::as_str), Some("/tmp/x.dump"));

        let dropping = restore_args(&connection(), true, input);
        assert!(dropping.contains(&"--clean".to_string()));
        assert!(dropping.contains(&"--if-exists".to_string()));
        assert_eq!(dropping.last().map(String::as_str), Some("/tmp/x.dump"));
    }

    #[tokio::test]
    async fn test_copy_limited_enforces_limit() {
        let data = vec![1u8; 2048];
        let mut sink = Vec::new();
        let ok = copy_limited(&mut data.as_slice(), &mut sink, 4096).await.unwrap();
        assert_eq!(ok, 2048);

        let mut sink = Vec::new();
        let err = copy_limited(&mut data.as_slice(), &mut sink, 1000)
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::ArtifactTooLarge { limit: 1000, .. }));
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use std::fs;
        use std::os::unix::fs::PermissionsExt;
        use std::time::Instant;
        use tempfile::TempDir;

        fn script(dir: &TempDir, name: &str, body: &str) -> String {
            let path = dir.path().join(name);
            fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
            path.display().to_string()
        }

        fn runner(dump: String, restore: String, limit: u64) -> ProcessRunner {
            ProcessRunner::new(
                ToolSettings {
                    dump_program: dump,
                    restore_program: restore,
                },
                limit,
            )
        }

        #[tokio::test]
        async fn test_dump_streams_stdout_to_file() {
            let dir = TempDir::new().unwrap();
            let tool = script(&dir, "dump.sh", "printf 'PGDMP-bytes'");
            let runner = runner(tool, "true".into(), 1024);
            let output = dir.path().join("out.dump");

            let written = runner
                .dump(&connection(), &output, &RunLimits::default())
                .await
                .unwrap();
            assert_eq!(written, 11);
            assert_eq!(fs::read(&output).unwrap(), b"PGDMP-bytes");
        }

        #[tokio::test]
        async fn test_password_only_in_environment() {
            let dir = TempDir::new().unwrap();
            let args_file = dir.path().join("args.txt");
            let env_file = dir.path().join("env.txt");
            let body = format!(
                "echo \"$@\" > '{}'\nprintf '%s' \"$PGPASSWORD\" > '{}'",
                args_file.display(),
                env_file.display()
            );
            let tool = script(&dir, "dump.sh", &body);
            let runner = runner(tool, "true".into(), 1024);

            runner
                .dump(&connection(), &dir.path().join("out"), &RunLimits::default())
                .await
                .unwrap();

            let args = fs::read_to_string(&args_file).unwrap();
            assert!(args.contains("--dbname pos"));
            assert!(!args.contains("sup3r-s3cret-pw"));
            assert_eq!(fs::read_to_string(&env_file).unwrap(), "sup3r-s3cret-pw");
        }

        #[tokio::test]
        async fn test_failed_dump_redacts_stderr_and_removes_output() {
            let dir = TempDir::new().unwrap();
            let tool = script(
                &dir,
                "dump.sh",
                "printf 'partial'\necho \"auth failed for $PGPASSWORD\" >&2\nexit 3",
            );
            let runner = runner(tool, "true".into(), 1024);
            let output = dir.path().join("out.dump");

            let err = runner
                .dump(&connection(), &output, &RunLimits::default())
                .await
                .unwrap_err();
            match err {
                BackupError::DumpFailure { status, stderr } => {
                    assert_eq!(status, Some(3));
                    assert!(stderr.contains("[REDACTED]"));
                    assert!(!stderr.contains("sup3r-s3cret-pw"));
                }
                other => panic!("expected dump failure, got {:?}", other),
            }
            assert!(!output.exists());
        }

        #[tokio::test]
        async fn test_missing_program_is_dump_failure() {
            let dir = TempDir::new().unwrap();
            let runner = runner(
                dir.path().join("no-such-tool").display().to_string(),
                "true".into(),
                1024,
            );
            let err = runner
                .dump(&connection(), &dir.path().join("out"), &RunLimits::default())
                .await
                .unwrap_err();
            assert!(matches!(err, BackupError::DumpFailure { status: None, .. }));
        }

        #[tokio::test]
        async fn test_oversized_dump_aborted() {
            let dir = TempDir::new().unwrap();
            let tool = script(&dir, "dump.sh", "dd if=/dev/zero bs=1000 count=5 2>/dev/null");
            let runner = runner(tool, "true".into(), 1000);
            let output = dir.path().join("out.dump");

            let err = runner
                .dump(&connection(), &output, &RunLimits::default())
                .await
                .unwrap_err();
            assert!(matches!(err, BackupError::ArtifactTooLarge { .. }));
            assert!(!output.exists());
        }

        #[tokio::test]
        async fn test_cancellation_kills_child() {
            let dir = TempDir::new().unwrap();
            let tool = script(&dir, "dump.sh", "printf 'x'\nexec sleep 30");
            let runner = runner(tool, "true".into(), 1024);
            let output = dir.path().join("out.dump");

            let limits = RunLimits::default();
            let cancel = limits.cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                cancel.cancel();
            });

            let started = Instant::now();
            let err = runner.dump(&connection(), &output, &limits).await.unwrap_err();
            assert!(matches!(err, BackupError::Cancelled));
            assert!(started.elapsed() < Duration::from_secs(10));
            assert!(!output.exists());
        }

        #[tokio::test]
        async fn test_timeout_kills_child() {
            let dir = TempDir::new().unwrap();
            let tool = script(&dir, "dump.sh", "exec sleep 30");
            let runner = runner(tool, "true".into(), 1024);
            let output = dir.path().join("out.dump");

            let limits = RunLimits::new(CancellationToken::new(), Some(Duration::from_millis(100)));
            let started = Instant::now();
            let err = runner.dump(&connection(), &output, &limits).await.unwrap_err();
            assert!(matches!(err, BackupError::Timeout { .. }));
            assert!(started.elapsed() < Duration::from_secs(10));
            assert!(!output.exists());
        }

        #[tokio::test]
        async fn test_restore_passes_clean_flags() {
            let dir = TempDir::new().unwrap();
            let args_file = dir.path().join("args.txt");
            let tool = script(&dir, "restore.sh", &format!("echo \"$@\" > '{}'", args_file.display()));
            let runner = runner("true".into(), tool, 1024);
            let input = dir.path().join("in.dump");

            runner
                .restore(&input, &connection(), true, &RunLimits::default())
                .await
                .unwrap();

            let args = fs::read_to_string(&args_file).unwrap();
            assert!(args.contains("--clean --if-exists"));
            assert!(args.trim_end().ends_with(&input.display().to_string()));
        }

        #[tokio::test]
        async fn test_restore_failure_status() {
            let dir = TempDir::new().unwrap();
            let tool = script(&dir, "restore.sh", "echo 'relation exists' >&2\nexit 1");
            let runner = runner("true".into(), tool, 1024);

            let err = runner
                .restore(&dir.path().join("in"), &connection(), false, &RunLimits::default())
                .await
                .unwrap_err();
            match err {
                BackupError::RestoreFailure { status, stderr } => {
                    assert_eq!(status, Some(1));
                    assert_eq!(stderr, "relation exists");
                }
                other => panic!("expected restore failure, got {:?}", other),
            }
        }

        #[tokio::test]
        async fn test_version() {
            let dir = TempDir::new().unwrap();
            let tool = script(&dir, "dump.sh", "echo 'pg_dump (PostgreSQL) 16.2'");
            let runner = runner(tool, "true".into(), 1024);
            let limits = RunLimits::default();
            assert_eq!(
                runner.version(&limits).await.as_deref(),
                Some("pg_dump (PostgreSQL) 16.2")
            );

            let missing = runner_missing(&dir);
            assert_eq!(missing.version(&limits).await, None);
        }

        #[tokio::test]
        async fn test_hung_version_respects_timeout() {
            let dir = TempDir::new().unwrap();
            let tool = script(&dir, "dump.sh", "exec sleep 30");
            let runner = runner(tool, "true".into(), 1024);

            let limits = RunLimits::new(CancellationToken::new(), Some(Duration::from_millis(100)));
            let started = Instant::now();
            assert_eq!(runner.version(&limits).await, None);
            assert!(started.elapsed() < Duration::from_secs(5));
        }

        #[tokio::test]
        async fn test_hung_version_respects_cancel() {
            let dir = TempDir::new().unwrap();
            let tool = script(&dir, "dump.sh", "exec sleep 30");
            let runner = runner(tool, "true".into(), 1024);

            let limits = RunLimits::default();
            let cancel = limits.cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                cancel.cancel();
            });

            let started = Instant::now();
            assert_eq!(runner.version(&limits).await, None);
            assert!(started.elapsed() < Duration::from_secs(5));
        }

        fn runner_missing(dir: &TempDir) -> ProcessRunner {
            runner(
                dir.path().join("absent").display().to_string(),
                "true".into(),
                1024,
            )
        }
    }
}
