//! Process-spawning seam for the engine driver.
//!
//! The one `async_trait` dynamic-dispatch seam in this crate, mirrored
//! on [`crate::resolver`]'s `Resolver` trait object pattern: production
//! code drives a real `tokio::process::Child`, tests drive a canned
//! fake that feeds scripted stdout/stderr lines without spawning
//! anything.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, BufReader};
use tokio::process::{Child, Command};

use super::EngineError;

/// A spawned child process abstracted to the operations the engine
/// driver needs: combined-stream consumption, graceful-then-forceful
/// termination, and waiting for exit.
///
/// `take_stdout`/`take_stderr` return streams owned independently of
/// the process handle (as `tokio::process::ChildStdout` already is
/// once taken from `Child`), so the driver can hold both line readers
/// and the handle at once without a borrow conflict.
#[async_trait]
pub trait SpawnedProcess: Send {
    /// Takes ownership of the stdout stream. Panics if called twice.
    fn take_stdout(&mut self) -> Box<dyn AsyncBufRead + Unpin + Send>;

    /// Takes ownership of the stderr stream. Panics if called twice.
    fn take_stderr(&mut self) -> Box<dyn AsyncBufRead + Unpin + Send>;

    /// Sends a graceful termination request (`SIGTERM` on Unix; falls
    /// back to the forceful kill directly on platforms without one).
    async fn terminate(&mut self) -> Result<(), EngineError>;

    /// Forcefully kills the process, no grace period.
    async fn force_kill(&mut self) -> Result<(), EngineError>;

    /// Waits for the process to exit, returning whether it exited
    /// successfully.
    async fn wait(&mut self) -> Result<bool, EngineError>;
}

/// Spawns engine child processes.
#[async_trait]
pub trait ProcessSpawner: Send + Sync {
    /// Spawns `binary` with `args`, wiring stdout/stderr as pipes.
    async fn spawn(
        &self,
        binary: &Path,
        args: &[String],
    ) -> Result<Box<dyn SpawnedProcess>, EngineError>;
}

/// Production [`ProcessSpawner`] backed by `tokio::process::Command`.
#[derive(Debug, Default)]
pub struct TokioProcessSpawner;

#[async_trait]
impl ProcessSpawner for TokioProcessSpawner {
    async fn spawn(
        &self,
        binary: &Path,
        args: &[String],
    ) -> Result<Box<dyn SpawnedProcess>, EngineError> {
        let child = Command::new(binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .spawn()
            .map_err(|source| EngineError::Spawn {
                binary: binary.to_path_buf(),
                source,
            })?;
        Ok(Box::new(TokioSpawnedProcess { child }))
    }
}

struct TokioSpawnedProcess {
    child: Child,
}

#[async_trait]
impl SpawnedProcess for TokioSpawnedProcess {
    fn take_stdout(&mut self) -> Box<dyn AsyncBufRead + Unpin + Send> {
        #[allow(clippy::expect_used)]
        let stdout = self.child.stdout.take().expect("stdout taken more than once");
        Box::new(BufReader::new(stdout))
    }

    fn take_stderr(&mut self) -> Box<dyn AsyncBufRead + Unpin + Send> {
        #[allow(clippy::expect_used)]
        let stderr = self.child.stderr.take().expect("stderr taken more than once");
        Box::new(BufReader::new(stderr))
    }

    async fn terminate(&mut self) -> Result<(), EngineError> {
        #[cfg(unix)]
        {
            if let Some(pid) = self.child.id() {
                #[allow(clippy::cast_possible_wrap)]
                let result = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
                if result != 0 {
                    return self.force_kill().await;
                }
                return Ok(());
            }
            Ok(())
        }
        #[cfg(not(unix))]
        {
            self.force_kill().await
        }
    }

    async fn force_kill(&mut self) -> Result<(), EngineError> {
        self.child
            .start_kill()
            .map_err(|source| EngineError::Kill { source })
    }

    async fn wait(&mut self) -> Result<bool, EngineError> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|source| EngineError::Wait { source })?;
        Ok(status.success())
    }
}

/// Test double: feeds canned stdout/stderr lines without spawning a
/// real process. Used by `EngineDriver` unit tests.
#[cfg(test)]
pub struct FakeSpawnedProcess {
    pub stdout_lines: Vec<String>,
    pub stderr_lines: Vec<String>,
    pub terminated: std::sync::Arc<std::sync::atomic::AtomicBool>,
    pub killed: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

#[cfg(test)]
#[async_trait]
impl SpawnedProcess for FakeSpawnedProcess {
    fn take_stdout(&mut self) -> Box<dyn AsyncBufRead + Unpin + Send> {
        let joined = self.stdout_lines.join("\n");
        Box::new(std::io::Cursor::new(joined.into_bytes()))
    }

    fn take_stderr(&mut self) -> Box<dyn AsyncBufRead + Unpin + Send> {
        let joined = self.stderr_lines.join("\n");
        Box::new(std::io::Cursor::new(joined.into_bytes()))
    }

    async fn terminate(&mut self) -> Result<(), EngineError> {
        self.terminated.store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    async fn force_kill(&mut self) -> Result<(), EngineError> {
        self.killed.store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    async fn wait(&mut self) -> Result<bool, EngineError> {
        Ok(true)
    }
}
