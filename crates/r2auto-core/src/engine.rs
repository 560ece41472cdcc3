//! Persistent pipe to a radare2 process.
//!
//! The engine runs as `r2 -q0 <target>`: it writes a single NUL byte once
//! it is ready and terminates the output of every command with NUL.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use r2auto_config::EngineConfig;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to start analysis engine: {0}")]
    Spawn(String),
    #[error("analysis engine unavailable: {0}")]
    Unavailable(String),
    #[error("command rejected: {0}")]
    Rejected(String),
}

struct EngineSession {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl EngineSession {
    async fn round_trip(&mut self, command: &str) -> std::io::Result<String> {
        self.stdin.write_all(command.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        read_frame(&mut self.stdout).await
    }
}

/// Read one NUL-terminated frame, without the terminator.
async fn read_frame(stdout: &mut BufReader<ChildStdout>) -> std::io::Result<String> {
    let mut buf = Vec::new();
    stdout.read_until(0, &mut buf).await?;
    if buf.pop() != Some(0) {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "engine closed its output",
        ));
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Serialized request/response channel to one engine process.
///
/// Once a round-trip fails the channel is marked lost and every later
/// `send` returns [`EngineError::Unavailable`].
pub struct ToolChannel {
    session: Mutex<Option<EngineSession>>,
    lost: AtomicBool,
    command_timeout: Duration,
}

impl ToolChannel {
    pub async fn spawn_with_config(config: &EngineConfig, target: &Path) -> Result<Self, EngineError> {
        Self::spawn(
            &config.program,
            &config.args,
            target,
            Duration::from_secs(config.command_timeout_secs),
        )
        .await
    }

    /// Start `<program> <args...> <target>` and wait for the ready byte.
    pub async fn spawn(
        program: &str,
        args: &[String],
        target: &Path,
        command_timeout: Duration,
    ) -> Result<Self, EngineError> {
        if !target.exists() {
            return Err(EngineError::Spawn(format!(
                "target '{}' does not exist",
                target.display()
            )));
        }
        let resolved = which::which(program)
            .map_err(|e| EngineError::Spawn(format!("'{program}' not found on PATH: {e}")))?;

        let started = Instant::now();
        let mut child = Command::new(&resolved)
            .args(args)
            .arg(target)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::Spawn(format!("{}: {e}", resolved.display())))?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(EngineError::Spawn("engine pipes unavailable".into()));
        };
        let mut stdout = BufReader::new(stdout);

        match tokio::time::timeout(command_timeout, read_frame(&mut stdout)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(EngineError::Spawn(format!("handshake failed: {e}"))),
            Err(_) => {
                return Err(EngineError::Spawn(format!(
                    "no ready signal after {}s",
                    command_timeout.as_secs()
                )))
            }
        }

        info!(
            "Engine ready: {} {} ({:.2}s)",
            resolved.display(),
            target.display(),
            started.elapsed().as_secs_f64()
        );

        Ok(Self {
            session: Mutex::new(Some(EngineSession {
                child,
                stdin,
                stdout,
            })),
            lost: AtomicBool::new(false),
            command_timeout,
        })
    }

    /// Run one command and return its textual output.
    pub async fn send(&self, command: &str) -> Result<String, EngineError> {
        if command.contains('\n') || command.contains('\0') {
            return Err(EngineError::Rejected(
                "command must be a single line; chain commands with ';'".into(),
            ));
        }

        let mut guard = self.session.lock().await;
        let Some(session) = guard.as_mut() else {
            return Err(EngineError::Unavailable(if self.is_lost() {
                "engine session was lost".into()
            } else {
                "engine session closed".into()
            }));
        };

        let started = Instant::now();
        let reason = match tokio::time::timeout(self.command_timeout, session.round_trip(command))
            .await
        {
            Ok(Ok(output)) => {
                debug!(
                    "Engine '{command}': {} bytes in {:.2}s",
                    output.len(),
                    started.elapsed().as_secs_f64()
                );
                return Ok(output);
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!(
                "command timed out after {}s",
                self.command_timeout.as_secs()
            ),
        };

        warn!("Engine session lost during '{command}': {reason}");
        self.lost.store(true, Ordering::SeqCst);
        if let Some(mut dead) = guard.take() {
            let _ = dead.child.start_kill();
        }
        Err(EngineError::Unavailable(reason))
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Ask the engine to quit, then kill it. Safe to call more than once.
    pub async fn close(&self) {
        let Some(session) = self.session.lock().await.take() else {
            return;
        };
        let EngineSession {
            mut child,
            mut stdin,
            stdout,
        } = session;
        let _ = stdin.write_all(b"q\n").await;
        let _ = stdin.flush().await;
        drop(stdin);
        drop(stdout);

        if tokio::time::timeout(Duration::from_millis(500), child.wait())
            .await
            .is_err()
        {
            let _ = child.kill().await;
        }
        info!("Engine session closed");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::testing::{FakeEngine, ECHO_ENGINE, ONE_SHOT_ENGINE};

    #[tokio::test]
    async fn round_trip_returns_output() {
        let fx = FakeEngine::new(ECHO_ENGINE);
        let engine = fx.start(Duration::from_secs(5)).await;

        let out = engine.send("list exports").await.unwrap();
        assert_eq!(out.lines().collect::<Vec<_>>(), ["sym.a", "sym.b", "sym.c"]);
        assert_eq!(engine.send("pdf @ main").await.unwrap(), "pdf @ main");
        assert_eq!(engine.send("silent").await.unwrap(), "");
        assert!(!engine.is_lost());
        engine.close().await;
    }

    #[tokio::test]
    async fn multi_line_command_rejected_without_losing_session() {
        let fx = FakeEngine::new(ECHO_ENGINE);
        let engine = fx.start(Duration::from_secs(5)).await;

        let err = engine.send("afl\npdf").await.unwrap_err();
        assert!(matches!(err, EngineError::Rejected(_)));
        assert_eq!(engine.send("afl").await.unwrap(), "afl");
        engine.close().await;
    }

    #[tokio::test]
    async fn dead_engine_marks_channel_lost() {
        let fx = FakeEngine::new(ONE_SHOT_ENGINE);
        let engine = fx.start(Duration::from_secs(5)).await;

        let err = engine.send("aaa").await.unwrap_err();
        assert!(matches!(err, EngineError::Unavailable(_)));
        assert!(engine.is_lost());
        assert!(matches!(
            engine.send("afl").await,
            Err(EngineError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn timeout_marks_channel_lost() {
        let fx = FakeEngine::new(ECHO_ENGINE);
        let engine = fx.start(Duration::from_secs(1)).await;

        let err = engine.send("hang").await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert!(engine.is_lost());
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let fx = FakeEngine::new(ECHO_ENGINE);
        let result = ToolChannel::spawn(
            "definitely-not-radare2-xyz",
            &[],
            &fx.target,
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(result, Err(EngineError::Spawn(_))));
    }

    #[tokio::test]
    async fn missing_target_is_spawn_error() {
        let fx = FakeEngine::new(ECHO_ENGINE);
        let result = ToolChannel::spawn(
            "sh",
            &fx.args(),
            Path::new("/nonexistent/binary"),
            Duration::from_secs(1),
        )
        .await;
        match result {
            Err(EngineError::Spawn(msg)) => assert!(msg.contains("does not exist")),
            _ => panic!("expected spawn error"),
        }
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let fx = FakeEngine::new(ECHO_ENGINE);
        let engine = fx.start(Duration::from_secs(5)).await;
        engine.close().await;
        engine.close().await;
        assert!(matches!(
            engine.send("afl").await,
            Err(EngineError::Unavailable(_))
        ));
        assert!(!engine.is_lost());
    }
}
