use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
#[allow(deprecated)]
use rig::client::completion::CompletionModelHandle;
use rig::completion::{CompletionModel, CompletionRequest, Message};
use rig::message::{
    AssistantContent, Reasoning, Text, ToolResult, ToolResultContent, UserContent,
};
use rig::streaming::StreamedAssistantContent;
use rig::OneOrMany;
use r2auto_config::ModelConfig;
use tracing::{debug, info, warn};

use crate::conversation::{AssistantMessage, CallOrigin, ToolCall, Turn};
use crate::presenter::Presenter;
use crate::tools::ToolKind;

/// Stands in for an assistant reply that carried neither text nor a call.
const EMPTY_REPLY: &str = "(no response)";

#[derive(Debug, Clone, thiserror::Error)]
pub enum ModelError {
    #[error("model endpoint error: {0}")]
    Endpoint(String),
    #[error("model request timed out after {0}s")]
    Timeout(u64),
    #[error("malformed tool call: {0}")]
    MalformedToolCall(String),
}

/// Produces the next assistant message for a transcript.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Stream text to `presenter` as it arrives; return once the message is complete.
    async fn next_message(
        &self,
        preamble: &str,
        turns: &[Turn],
        presenter: &dyn Presenter,
    ) -> Result<AssistantMessage, ModelError>;

    fn model_name(&self) -> &str;
}

/// `ModelClient` backed by any rig completion model.
#[allow(deprecated)]
pub struct RigModelClient {
    model: CompletionModelHandle<'static>,
    model_name: String,
    temperature: f64,
    max_tokens: u64,
    stream: bool,
    request_timeout: Duration,
    thinking_budget: Option<u32>,
    thinking_enabled: AtomicBool,
}

#[allow(deprecated)]
impl RigModelClient {
    pub fn new(model: CompletionModelHandle<'static>, config: &ModelConfig) -> Self {
        Self {
            model,
            model_name: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            stream: config.stream,
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            thinking_budget: config.thinking_budget,
            thinking_enabled: AtomicBool::new(config.thinking_budget.is_some()),
        }
    }

    fn build_request(&self, preamble: &str, turns: &[Turn]) -> Result<CompletionRequest, ModelError> {
        let history = to_chat_history(turns);
        let chat_history = OneOrMany::many(history)
            .map_err(|_| ModelError::Endpoint("conversation is empty".into()))?;

        let additional_params = match self.thinking_budget {
            Some(budget) if self.thinking_enabled.load(Ordering::Relaxed) => Some(serde_json::json!({
                "thinking": { "type": "enabled", "budget_tokens": budget }
            })),
            _ => None,
        };

        Ok(CompletionRequest {
            preamble: Some(preamble.to_string()),
            chat_history,
            documents: Vec::new(),
            tools: ToolKind::ALL.iter().map(ToolKind::definition).collect(),
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            tool_choice: None,
            additional_params,
        })
    }

    async fn request_once(
        &self,
        request: CompletionRequest,
        presenter: &dyn Presenter,
    ) -> Result<AssistantMessage, ModelError> {
        let mut text = String::new();
        let mut reasoning = String::new();

        let choice = if self.stream {
            let mut stream = within(self.request_timeout, self.model.stream(request))
                .await?
                .map_err(|e| ModelError::Endpoint(e.to_string()))?;
            while let Some(item) = next_within(&mut stream, self.request_timeout).await? {
                match item.map_err(|e| ModelError::Endpoint(e.to_string()))? {
                    StreamedAssistantContent::Text(t) => {
                        presenter.on_text(&t.text);
                        text.push_str(&t.text);
                    }
                    StreamedAssistantContent::Reasoning(r) => {
                        let chunk = r.reasoning.join("");
                        presenter.on_reasoning(&chunk);
                        reasoning.push_str(&chunk);
                    }
                    _ => {}
                }
            }
            stream.choice.clone()
        } else {
            let response = within(self.request_timeout, self.model.completion(request))
                .await?
                .map_err(|e| ModelError::Endpoint(e.to_string()))?;
            for content in response.choice.iter() {
                match content {
                    AssistantContent::Text(t) => text.push_str(&t.text),
                    AssistantContent::Reasoning(r) => reasoning.push_str(&r.reasoning.join(" ")),
                    _ => {}
                }
            }
            if !reasoning.is_empty() {
                presenter.on_reasoning(&reasoning);
            }
            if !text.is_empty() {
                presenter.on_text(&text);
            }
            response.choice
        };

        if text.is_empty() {
            // some providers only report text in the aggregated choice
            for content in choice.iter() {
                if let AssistantContent::Text(t) = content {
                    text.push_str(&t.text);
                }
            }
            if !text.is_empty() {
                presenter.on_text(&text);
            }
        }

        let call = first_tool_call(choice.iter())?;
        Ok(AssistantMessage {
            text,
            reasoning: (!reasoning.is_empty()).then_some(reasoning),
            call,
        })
    }
}

#[allow(deprecated)]
#[async_trait]
impl ModelClient for RigModelClient {
    async fn next_message(
        &self,
        preamble: &str,
        turns: &[Turn],
        presenter: &dyn Presenter,
    ) -> Result<AssistantMessage, ModelError> {
        loop {
            let request = self.build_request(preamble, turns)?;
            let thinking = request.additional_params.is_some();
            debug!(
                "LLM request: {} turns, model={}, stream={}, thinking={thinking}",
                turns.len(),
                self.model_name,
                self.stream
            );

            let started = Instant::now();
            match self.request_once(request, presenter).await {
                Err(ModelError::Endpoint(msg)) if thinking && is_thinking_rejection(&msg) => {
                    warn!("Endpoint rejected reasoning parameters, disabling: {msg}");
                    self.thinking_enabled.store(false, Ordering::Relaxed);
                }
                Ok(message) => {
                    debug!(
                        "LLM response: {} chars, tool call: {} in {:.1}s",
                        message.text.len(),
                        message.call.as_ref().map_or("none", |c| c.kind.name()),
                        started.elapsed().as_secs_f64()
                    );
                    return Ok(message);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

/// Bound one await on the endpoint. Streams are limited per chunk, not in total.
async fn within<F: std::future::Future>(limit: Duration, fut: F) -> Result<F::Output, ModelError> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| ModelError::Timeout(limit.as_secs()))
}

async fn next_within<S: Stream + Unpin>(
    stream: &mut S,
    idle: Duration,
) -> Result<Option<S::Item>, ModelError> {
    within(idle, stream.next()).await
}

fn is_thinking_rejection(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("thinking") || lower.contains("parameter") || lower.contains("400")
}

/// Keep the first structured call; extra calls are dropped.
fn first_tool_call<'a>(
    contents: impl IntoIterator<Item = &'a AssistantContent>,
) -> Result<Option<ToolCall>, ModelError> {
    let calls: Vec<_> = contents
        .into_iter()
        .filter_map(|c| match c {
            AssistantContent::ToolCall(tc) => Some(tc),
            _ => None,
        })
        .collect();

    let Some(first) = calls.first() else {
        return Ok(None);
    };
    if calls.len() > 1 {
        warn!(
            "Model issued {} tool calls in one message; only '{}' will run",
            calls.len(),
            first.function.name
        );
    }

    let name = &first.function.name;
    let kind = ToolKind::from_name(name)
        .ok_or_else(|| ModelError::MalformedToolCall(format!("unknown tool '{name}'")))?;
    let payload = kind
        .parse_arguments(&first.function.arguments)
        .map_err(ModelError::MalformedToolCall)?;
    info!("Model requested {name}");
    Ok(Some(ToolCall::native(first.id.clone(), kind, payload)))
}

fn user_text(text: String) -> Message {
    Message::User {
        content: OneOrMany::one(UserContent::Text(Text { text })),
    }
}

/// Map transcript turns onto chat messages.
///
/// Native calls travel as assistant tool calls answered by tool results;
/// inline calls are already in the assistant text and their results come
/// back as plain user text.
pub fn to_chat_history(turns: &[Turn]) -> Vec<Message> {
    let mut messages = Vec::with_capacity(turns.len());
    let mut last_call: Option<&ToolCall> = None;

    for turn in turns {
        match turn {
            Turn::Goal { text } => messages.push(user_text(format!("Request: {text}"))),
            Turn::User { text } => messages.push(user_text(text.clone())),
            Turn::Assistant(message) => {
                let native = message
                    .call
                    .as_ref()
                    .filter(|c| c.origin == CallOrigin::Native);
                let mut parts = Vec::new();
                if let Some(reasoning) = message.reasoning.as_deref().filter(|r| !r.is_empty()) {
                    parts.push(AssistantContent::Reasoning(Reasoning::new(reasoning)));
                }
                if !message.text.is_empty() {
                    parts.push(AssistantContent::Text(Text {
                        text: message.text.clone(),
                    }));
                } else if native.is_none() {
                    parts.push(AssistantContent::Text(Text {
                        text: EMPTY_REPLY.to_string(),
                    }));
                }
                if let Some(call) = native {
                    parts.push(AssistantContent::tool_call(
                        call.id.clone(),
                        call.kind.name(),
                        call.kind.arguments(&call.payload),
                    ));
                }
                if let Ok(content) = OneOrMany::many(parts) {
                    messages.push(Message::Assistant { id: None, content });
                }
            }
            Turn::ToolCall(call) => last_call = Some(call),
            Turn::Observation(obs) => match last_call.take() {
                Some(call) if call.origin == CallOrigin::Native => {
                    messages.push(Message::User {
                        content: OneOrMany::one(UserContent::ToolResult(ToolResult {
                            id: call.id.clone(),
                            call_id: None,
                            content: OneOrMany::one(ToolResultContent::Text(Text {
                                text: obs.text.clone(),
                            })),
                        })),
                    });
                }
                Some(call) => messages.push(user_text(format!(
                    "Execution Results:\n[{}] {}\n{}",
                    call.kind.name(),
                    call.payload,
                    obs.text
                ))),
                None => messages.push(user_text(format!("Execution Results:\n{}", obs.text))),
            },
        }
    }
    messages
}
