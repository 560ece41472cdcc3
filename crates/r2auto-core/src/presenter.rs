use crate::conversation::{AssistantMessage, Observation, ToolCall};

/// Status events the loop surfaces to the human.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    SessionStarted { target: String, model: String },
    Retrying { attempt: u32, max: u32, delay_ms: u64, error: String },
    ModelFailed(String),
    /// The loop is waiting for the user; the reason is shown as the prompt hint.
    AwaitingInput(String),
    AutonomyLimit(usize),
    ErrorStreak(usize),
    EngineLost(String),
    Exiting,
}

/// Notification sink for everything the user should see.
///
/// Implementations must not block for long: the loop calls these inline.
pub trait Presenter: Send + Sync {
    /// Incremental assistant text as it streams in.
    fn on_text(&self, chunk: &str);

    fn on_reasoning(&self, _chunk: &str) {}

    /// The full assistant message has arrived.
    fn on_message_complete(&self, message: &AssistantMessage);

    fn on_tool_call(&self, call: &ToolCall);

    fn on_observation(&self, call: &ToolCall, observation: &Observation);

    fn on_notice(&self, notice: Notice);
}
