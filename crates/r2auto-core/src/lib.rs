pub mod agent;
pub mod code;
pub mod conversation;
pub mod engine;
pub mod error;
pub mod input;
pub mod presenter;
pub mod tools;

#[cfg(all(test, unix))]
mod testing;

// Re-export key types
pub use code::{CodeError, CodeRunner};
pub use conversation::{ConversationState, Observation, ToolCall, Turn, WindowPolicy};
pub use engine::{EngineError, ToolChannel};
pub use error::AgentError;
pub use input::UserInput;
pub use presenter::{Notice, Presenter};
pub use tools::{ToolKind, ToolRouter};
