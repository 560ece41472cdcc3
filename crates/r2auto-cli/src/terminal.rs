use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use r2auto_core::conversation::{AssistantMessage, Observation, ToolCall};
use r2auto_core::presenter::{Notice, Presenter};
use r2auto_core::{ToolKind, UserInput};
use rustyline::error::ReadlineError;
use rustyline::{DefaultEditor, ExternalPrinter};
use tokio::sync::mpsc::UnboundedSender;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Save terminal attributes for later restoration.
#[cfg(unix)]
pub fn save_terminal_state() -> Option<nix::sys::termios::Termios> {
    nix::sys::termios::tcgetattr(std::io::stdin()).ok()
}

/// Restore previously saved terminal attributes.
#[cfg(unix)]
pub fn restore_terminal_state(saved: &nix::sys::termios::Termios) {
    let _ = nix::sys::termios::tcsetattr(
        std::io::stdin(),
        nix::sys::termios::SetArg::TCSADRAIN,
        saved,
    );
}

type SharedPrinter = Arc<Mutex<Box<dyn ExternalPrinter + Send>>>;

/// Where rendered output goes: above the live prompt when the editor is
/// running, plain stdout otherwise.
#[derive(Clone)]
pub struct Output {
    printer: Option<SharedPrinter>,
}

impl Output {
    pub fn stdout() -> Self {
        Self { printer: None }
    }

    pub fn print(&self, text: String) {
        if let Some(printer) = &self.printer {
            if lock(printer).print(text.clone()).is_ok() {
                return;
            }
        }
        println!("{text}");
    }
}

/// Start the line editor on its own thread. Lines, Ctrl-C and Ctrl-D are
/// forwarded to the agent as [`UserInput`].
pub fn spawn_input_thread(tx: UnboundedSender<UserInput>, history_path: PathBuf) -> Result<Output> {
    let (ready_tx, ready_rx) = std::sync::mpsc::channel();

    std::thread::Builder::new()
        .name("r2auto-input".into())
        .spawn(move || {
            let mut rl = match DefaultEditor::new() {
                Ok(rl) => rl,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let printer = rl
                .create_external_printer()
                .ok()
                .map(|p| Arc::new(Mutex::new(Box::new(p) as Box<dyn ExternalPrinter + Send>)));
            let _ = ready_tx.send(Ok(printer));
            let _ = rl.load_history(&history_path);

            loop {
                let input = match rl.readline("r2auto> ") {
                    Ok(line) => {
                        let trimmed = line.trim();
                        if !trimmed.is_empty() {
                            let _ = rl.add_history_entry(trimmed);
                        }
                        UserInput::from_line(trimmed)
                    }
                    Err(ReadlineError::Interrupted) => UserInput::Interrupt,
                    Err(ReadlineError::Eof) => UserInput::Exit,
                    Err(e) => {
                        tracing::warn!("Line editor failed: {e}");
                        UserInput::Exit
                    }
                };
                let exit = input == UserInput::Exit;
                if tx.send(input).is_err() || exit {
                    break;
                }
            }
            let _ = rl.save_history(&history_path);
        })
        .context("failed to start input thread")?;

    let printer = ready_rx
        .recv()
        .context("input thread exited during startup")?
        .context("failed to initialise line editor")?;
    Ok(Output { printer })
}

/// Renders agent activity as markdown in the terminal.
pub struct TerminalPresenter {
    out: Output,
    skin: termimad::MadSkin,
    text: Mutex<String>,
    reasoning: Mutex<String>,
    max_observation_lines: usize,
}

impl TerminalPresenter {
    pub fn new(out: Output, max_observation_lines: usize) -> Self {
        Self {
            out,
            skin: termimad::MadSkin::default(),
            text: Mutex::new(String::new()),
            reasoning: Mutex::new(String::new()),
            max_observation_lines,
        }
    }

    fn render(&self, markdown: &str) {
        let rendered = self.skin.term_text(markdown).to_string();
        self.out.print(rendered.trim_end().to_string());
    }

    fn flush_lines(&self, buffer: &Mutex<String>, complete: bool, prefix: &str) {
        let mut pending = lock(buffer);
        while let Some(pos) = pending.find('\n') {
            let line: String = pending.drain(..=pos).collect();
            self.emit(line.trim_end_matches('\n'), prefix);
        }
        if complete && !pending.is_empty() {
            let line = std::mem::take(&mut *pending);
            self.emit(&line, prefix);
        }
    }

    fn emit(&self, line: &str, prefix: &str) {
        if prefix.is_empty() {
            self.render(line);
        } else {
            self.out.print(format!("{prefix}{line}"));
        }
    }

    fn discard_partial(&self) {
        lock(&self.text).clear();
        lock(&self.reasoning).clear();
    }

    fn preview(&self, text: &str) -> String {
        let total = text.lines().count();
        let shown: Vec<&str> = text.lines().take(self.max_observation_lines).collect();
        let mut out = shown.join("\n");
        if total > shown.len() {
            out.push_str(&format!("\n... ({} more lines)", total - shown.len()));
        }
        out
    }
}

impl Presenter for TerminalPresenter {
    fn on_text(&self, chunk: &str) {
        lock(&self.text).push_str(chunk);
        self.flush_lines(&self.text, false, "");
    }

    fn on_reasoning(&self, chunk: &str) {
        lock(&self.reasoning).push_str(chunk);
        self.flush_lines(&self.reasoning, false, "  | ");
    }

    fn on_message_complete(&self, _message: &AssistantMessage) {
        self.flush_lines(&self.reasoning, true, "  | ");
        self.flush_lines(&self.text, true, "");
    }

    fn on_tool_call(&self, call: &ToolCall) {
        match call.kind {
            ToolKind::AnalysisCommand => self.out.print(format!("> r2: {}", call.payload)),
            ToolKind::CodeSnippet => {
                self.out.print("> script:".to_string());
                self.render(&format!("```\n{}\n```", call.payload));
            }
        }
    }

    fn on_observation(&self, _call: &ToolCall, observation: &Observation) {
        let marker = if observation.is_error() { "x" } else { "=" };
        let mut text = self.preview(&observation.text);
        if observation.truncated {
            text.push_str("\n(output truncated for the model)");
        }
        self.out.print(format!("{marker} result:\n{text}"));
    }

    fn on_notice(&self, notice: Notice) {
        if matches!(notice, Notice::Retrying { .. } | Notice::ModelFailed(_)) {
            // the failed attempt's partial line must not prefix the next one
            self.discard_partial();
        }
        let line = match notice {
            Notice::SessionStarted { target, model } => {
                format!("r2auto session started: {target} (model {model}). Ctrl-C interrupts, Ctrl-D or `exit` quits.")
            }
            Notice::Retrying {
                attempt,
                max,
                delay_ms,
                error,
            } => format!("Model error: {error}. Retrying {attempt}/{max} in {delay_ms}ms"),
            Notice::ModelFailed(error) => format!("Model request failed: {error}"),
            Notice::AwaitingInput(reason) => reason,
            Notice::AutonomyLimit(steps) => format!("Paused after {steps} autonomous steps."),
            Notice::ErrorStreak(count) => format!("Paused after {count} failed actions in a row."),
            Notice::EngineLost(detail) => format!("radare2 session lost: {detail}"),
            Notice::Exiting => "Exiting.".to_string(),
        };
        self.out.print(line);
    }
}
