use std::sync::Arc;

use r2auto_config::Config;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::agent::actions::{attach_inline_action, AgentDecision};
use crate::agent::model::ModelClient;
use crate::agent::retry::RetryPolicy;
use crate::conversation::{AssistantMessage, ConversationState, Turn, WindowPolicy};
use crate::error::AgentError;
use crate::input::UserInput;
use crate::presenter::{Notice, Presenter};
use crate::tools::ToolRouter;

/// How a run ended when nothing went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The model declared the analysis finished.
    Done,
    UserExit,
}

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub retry: RetryPolicy,
    /// Tool calls allowed without human input before a checkpoint.
    pub max_autonomous_steps: usize,
    /// Consecutive failed observations before a checkpoint.
    pub max_consecutive_errors: usize,
    pub inline_actions: bool,
    pub window: WindowPolicy,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_autonomous_steps: 40,
            max_consecutive_errors: 5,
            inline_actions: true,
            window: WindowPolicy::default(),
        }
    }
}

impl LoopSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            retry: RetryPolicy::from_config(&config.model),
            max_autonomous_steps: config.agent.max_autonomous_steps,
            max_consecutive_errors: config.agent.max_consecutive_errors,
            inline_actions: config.agent.inline_actions,
            window: WindowPolicy {
                max_chars: config.agent.context_budget_chars,
                keep_recent: config.agent.keep_recent_turns,
            },
        }
    }
}

/// Result of draining queued interjections at a checkpoint.
enum Drained {
    Lines(usize),
    Interrupt,
    Exit,
}

enum Reply {
    Line(String),
    Exit,
}

/// Drives the model/tool cycle for one analysis session.
pub struct AgentLoop {
    model: Arc<dyn ModelClient>,
    router: ToolRouter,
    conversation: ConversationState,
    presenter: Arc<dyn Presenter>,
    input: mpsc::UnboundedReceiver<UserInput>,
    preamble: String,
    settings: LoopSettings,
}

impl AgentLoop {
    pub fn new(
        model: Arc<dyn ModelClient>,
        router: ToolRouter,
        presenter: Arc<dyn Presenter>,
        input: mpsc::UnboundedReceiver<UserInput>,
        preamble: String,
        settings: LoopSettings,
    ) -> Self {
        Self {
            model,
            router,
            conversation: ConversationState::new(settings.window),
            presenter,
            input,
            preamble,
            settings,
        }
    }

    pub fn conversation(&self) -> &ConversationState {
        &self.conversation
    }

    /// Run until the model finishes, the user exits, or the engine dies.
    pub async fn run(&mut self, goal: &str) -> Result<RunOutcome, AgentError> {
        info!("Agent run started: {goal}");
        self.conversation.append(Turn::goal(goal))?;

        let mut autonomous_steps = 0usize;
        let mut error_streak = 0usize;
        let mut awaiting: Option<String> = None;

        loop {
            match self.drain_interjections()? {
                Drained::Exit => return Ok(self.exit()),
                Drained::Interrupt => {
                    awaiting = Some("Interrupted. Add guidance or press Enter to continue".into());
                }
                Drained::Lines(0) => {}
                Drained::Lines(n) => {
                    debug!("Consumed {n} queued interjection(s)");
                    autonomous_steps = 0;
                    // lines typed ahead answer a pending question
                    if awaiting.is_some() {
                        awaiting = None;
                        error_streak = 0;
                    }
                }
            }

            if let Some(reason) = awaiting.take() {
                match self.await_user(&reason).await {
                    Reply::Exit => return Ok(self.exit()),
                    Reply::Line(text) => {
                        if !text.is_empty() {
                            self.conversation.append(Turn::user(text))?;
                        }
                        autonomous_steps = 0;
                        error_streak = 0;
                    }
                }
            }

            let Some(message) = self.request_with_retry().await else {
                awaiting = Some("Model request failed. Press Enter to retry".into());
                continue;
            };
            let message = if self.settings.inline_actions {
                attach_inline_action(message)
            } else {
                message
            };
            self.presenter.on_message_complete(&message);

            let decision = AgentDecision::for_message(&message);
            let call = message.call.clone();
            self.conversation.append(Turn::Assistant(message))?;

            let Some(call) = call else {
                if decision == AgentDecision::Done {
                    info!(
                        "Agent finished after {} turns",
                        self.conversation.len()
                    );
                    return Ok(RunOutcome::Done);
                }
                awaiting = Some("Your reply".into());
                continue;
            };

            self.conversation.append(Turn::ToolCall(call.clone()))?;
            self.presenter.on_tool_call(&call);
            let observation = self.router.dispatch(&call).await;
            self.presenter.on_observation(&call, &observation);
            let failed = observation.is_error();
            let detail = observation.text.clone();
            self.conversation.append(Turn::Observation(observation))?;

            if self.router.engine_lost() {
                warn!("Aborting run: engine session lost");
                self.presenter.on_notice(Notice::EngineLost(detail.clone()));
                return Err(AgentError::EngineUnavailable(detail));
            }

            autonomous_steps += 1;
            if failed {
                error_streak += 1;
            } else {
                error_streak = 0;
            }

            // Circuit breaker: hand control back instead of looping on failures.
            if error_streak >= self.settings.max_consecutive_errors {
                warn!("Circuit breaker: {error_streak} consecutive failed tool calls");
                self.presenter.on_notice(Notice::ErrorStreak(error_streak));
                awaiting = Some("Several actions failed in a row. Guidance?".into());
            } else if autonomous_steps >= self.settings.max_autonomous_steps {
                info!("Autonomy limit reached after {autonomous_steps} steps");
                self.presenter
                    .on_notice(Notice::AutonomyLimit(autonomous_steps));
                awaiting = Some("Continue? Press Enter or add guidance".into());
            }
        }
    }

    /// Close the engine and hand back the transcript.
    pub async fn shutdown(self) -> ConversationState {
        self.router.close().await;
        self.conversation
    }

    fn exit(&self) -> RunOutcome {
        info!("User ended the session");
        self.presenter.on_notice(Notice::Exiting);
        RunOutcome::UserExit
    }

    fn drain_interjections(&mut self) -> Result<Drained, AgentError> {
        let mut lines = 0;
        let mut interrupted = false;
        while let Ok(input) = self.input.try_recv() {
            match input {
                UserInput::Exit => return Ok(Drained::Exit),
                UserInput::Interrupt => interrupted = true,
                UserInput::Line(text) if text.is_empty() => {}
                UserInput::Line(text) => {
                    self.conversation.append(Turn::user(text))?;
                    lines += 1;
                }
            }
        }
        Ok(if interrupted {
            Drained::Interrupt
        } else {
            Drained::Lines(lines)
        })
    }

    async fn await_user(&mut self, reason: &str) -> Reply {
        self.presenter
            .on_notice(Notice::AwaitingInput(reason.to_string()));
        loop {
            match self.input.recv().await {
                None | Some(UserInput::Exit) => return Reply::Exit,
                Some(UserInput::Interrupt) => continue,
                Some(UserInput::Line(text)) => return Reply::Line(text),
            }
        }
    }

    /// One assistant message, or `None` once retries are exhausted.
    async fn request_with_retry(&self) -> Option<AssistantMessage> {
        let retry = self.settings.retry;
        let mut attempt = 0u32;
        loop {
            let turns = self.conversation.render_for_model();
            debug!(
                "Model request: {} turns, {} chars, attempt {}",
                turns.len(),
                turns.iter().map(Turn::char_len).sum::<usize>(),
                attempt + 1
            );
            match self
                .model
                .next_message(&self.preamble, &turns, self.presenter.as_ref())
                .await
            {
                Ok(message) => return Some(message),
                Err(e) if attempt >= retry.max_retries => {
                    warn!("Model request failed after {} attempts: {e}", attempt + 1);
                    self.presenter.on_notice(Notice::ModelFailed(e.to_string()));
                    return None;
                }
                Err(e) => {
                    attempt += 1;
                    let delay = retry.delay_for_attempt(attempt);
                    warn!(
                        "Model request failed ({e}), retry {attempt}/{} in {}ms",
                        retry.max_retries,
                        delay.as_millis()
                    );
                    self.presenter.on_notice(Notice::Retrying {
                        attempt,
                        max: retry.max_retries,
                        delay_ms: delay.as_millis() as u64,
                        error: e.to_string(),
                    });
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
