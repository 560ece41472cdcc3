//! Fake analysis engine used across the crate's tests.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::engine::ToolChannel;

/// Speaks the NUL-framed protocol: echoes unknown commands, canned output for a few.
pub(crate) const ECHO_ENGINE: &str = r#"printf '\000'
while IFS= read -r line; do
  case "$line" in
    "list exports") printf 'sym.a\nsym.b\nsym.c\n\000' ;;
    "silent") printf '\000' ;;
    "hang") sleep 5 ;;
    "die") exit 3 ;;
    q) exit 0 ;;
    *) printf '%s\000' "$line" ;;
  esac
done
"#;

/// Answers the handshake, then exits after reading one command.
pub(crate) const ONE_SHOT_ENGINE: &str = r#"printf '\000'
IFS= read -r line
exit 0
"#;

pub(crate) struct FakeEngine {
    _dir: tempfile::TempDir,
    pub script: PathBuf,
    pub target: PathBuf,
}

impl FakeEngine {
    pub fn new(body: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("engine.sh");
        std::fs::write(&script, body).unwrap();
        let target = dir.path().join("a.out");
        std::fs::write(&target, b"\x7fELF").unwrap();
        Self {
            _dir: dir,
            script,
            target,
        }
    }

    pub fn args(&self) -> Vec<String> {
        vec![self.script.to_string_lossy().into_owned()]
    }

    pub async fn start(&self, timeout: Duration) -> Arc<ToolChannel> {
        Arc::new(
            ToolChannel::spawn("sh", &self.args(), &self.target, timeout)
                .await
                .unwrap(),
        )
    }
}
