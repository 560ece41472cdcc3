pub mod actions;
pub mod context;
pub mod r#loop;
pub mod model;
pub mod retry;

pub use actions::AgentDecision;
pub use context::ContextBuilder;
pub use model::{ModelClient, ModelError, RigModelClient};
pub use r#loop::{AgentLoop, LoopSettings, RunOutcome};
pub use retry::RetryPolicy;
