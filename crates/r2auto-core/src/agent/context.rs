use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::agent::actions::{ASK_MARKER, END_MARKER};
use crate::tools::ToolKind;

/// Builds the system prompt for an analysis session.
pub struct ContextBuilder {
    target: PathBuf,
    inline_actions: bool,
    instructions_file: Option<PathBuf>,
}

impl ContextBuilder {
    pub fn new(target: &Path) -> Self {
        Self {
            target: target.to_path_buf(),
            inline_actions: true,
            instructions_file: None,
        }
    }

    /// Describe the `[[cmd]]` / `<code>` text syntax in the prompt.
    pub fn with_inline_actions(mut self, enabled: bool) -> Self {
        self.inline_actions = enabled;
        self
    }

    /// Append the contents of a user-supplied file to the prompt.
    pub fn with_instructions_file(mut self, path: Option<PathBuf>) -> Self {
        self.instructions_file = path;
        self
    }

    pub fn build_system_prompt(&self) -> Result<String> {
        let mut parts = vec![self.get_identity(), self.capabilities(), self.protocol()];

        if let Some(path) = &self.instructions_file {
            let extra = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read instructions '{}'", path.display()))?;
            if !extra.trim().is_empty() {
                parts.push(format!("# Additional Instructions\n\n{}", extra.trim()));
            }
        }

        Ok(parts.join("\n\n---\n\n"))
    }

    fn get_identity(&self) -> String {
        let now = chrono::Local::now().format("%Y-%m-%d %H:%M (%A)");
        let tz = chrono::Local::now().format("%Z");
        let target = self
            .target
            .canonicalize()
            .unwrap_or_else(|_| self.target.clone())
            .display()
            .to_string();
        let os = std::env::consts::OS;
        let arch = std::env::consts::ARCH;

        format!(
            r#"# r2auto

You are r2auto, an expert reverse engineering agent operating a live radare2 session.
Your goal is to analyze the loaded binary according to the user's request.

## Current Time
{now} ({tz})

## Runtime
{os} {arch}

## Target
The binary loaded in radare2 is: {target}"#
        )
    }

    fn capabilities(&self) -> String {
        let command = ToolKind::AnalysisCommand.name();
        let code = ToolKind::CodeSnippet.name();
        let mut text = format!(
            r#"# Capabilities

1. **radare2 commands** via the `{command}` tool, e.g. `aaa`, `afl`, `pdf @ main`, `iI`.
2. **Rhai scripts** via the `{code}` tool, for parsing output or multi-step logic.
   Variables persist between scripts. Inside a script:
   - `cmd("afl")` runs a radare2 command and returns its output as a string
   - `cmdj("aflj")` runs a command and parses its JSON output
   - `re_find_all(pattern, text)` and `re_match(pattern, text)` apply regexes
   - `print(...)` output and the final expression value are returned to you"#
        );
        if self.inline_actions {
            text.push_str(
                r#"

If you cannot call tools, write actions in your reply instead:
- `[[pdf @ main]]` runs one radare2 command
- `<code>print(cmd("iI"));</code>` runs a Rhai script
Only the first action in a reply is executed."#,
            );
        }
        text
    }

    fn protocol(&self) -> String {
        format!(
            r#"# Protocol

1. Think about the current state, then take exactly one action per reply.
2. After an action, stop. The result is returned to you in the next message.
3. If you need clarification or a decision from the user, end your reply with `{ASK_MARKER}`.
4. When the analysis is complete, give your conclusion and end with `{END_MARKER}`.

## Rules
- Use `pdf~HEAD` or `~` filters on large functions to avoid huge output.
- Use scripts only when radare2 commands alone are insufficient.
- Rely solely on tool output. Do not invent addresses or symbols.
- Use Markdown for explanations. Be concise."#
        )
    }
}
