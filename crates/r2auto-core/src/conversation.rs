//! Conversation transcript: the append-only sequence of turns sent to the model.
//!
//! Every `ToolCall` turn is immediately followed by exactly one `Observation`
//! turn carrying the same call id. `append` refuses anything that would break
//! that pairing, and the windowed view produced by `render_for_model` only
//! rewrites text, never removes or reorders turns.

use std::io::{BufRead, Write};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::tools::ToolKind;

/// Where a tool call came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallOrigin {
    /// Structured function call from the model endpoint.
    Native,
    /// `[[cmd]]` / `<code>` block parsed out of the message text.
    Inline,
}

/// A single model-issued action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub kind: ToolKind,
    pub payload: String,
    pub origin: CallOrigin,
}

impl ToolCall {
    pub fn native(id: impl Into<String>, kind: ToolKind, payload: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            payload: payload.into(),
            origin: CallOrigin::Native,
        }
    }

    pub fn inline(kind: ToolKind, payload: impl Into<String>) -> Self {
        Self {
            id: format!("inline-{}", uuid::Uuid::new_v4()),
            kind,
            payload: payload.into(),
            origin: CallOrigin::Inline,
        }
    }
}

/// One complete assistant reply: free text plus at most one action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AssistantMessage {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call: Option<ToolCall>,
}

impl AssistantMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_call(text: impl Into<String>, call: ToolCall) -> Self {
        Self {
            text: text.into(),
            reasoning: None,
            call: Some(call),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObservationStatus {
    Ok,
    Error,
}

/// Normalized result of executing a tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub call_id: String,
    pub status: ObservationStatus,
    pub text: String,
    pub truncated: bool,
}

impl Observation {
    pub fn ok(call_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            status: ObservationStatus::Ok,
            text: text.into(),
            truncated: false,
        }
    }

    pub fn error(call_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            status: ObservationStatus::Error,
            text: text.into(),
            truncated: false,
        }
    }

    pub fn is_error(&self) -> bool {
        self.status == ObservationStatus::Error
    }
}

/// One immutable unit of conversational history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Turn {
    Goal { text: String },
    Assistant(AssistantMessage),
    ToolCall(ToolCall),
    Observation(Observation),
    User { text: String },
}

impl Turn {
    pub fn goal(text: impl Into<String>) -> Self {
        Turn::Goal { text: text.into() }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Turn::User { text: text.into() }
    }

    /// Approximate prompt footprint of this turn in bytes.
    pub fn char_len(&self) -> usize {
        match self {
            Turn::Goal { text } | Turn::User { text } => text.len(),
            Turn::Assistant(m) => {
                m.text.len()
                    + m.reasoning.as_ref().map_or(0, |r| r.len())
                    + m.call.as_ref().map_or(0, |c| c.payload.len())
            }
            Turn::ToolCall(c) => c.payload.len(),
            Turn::Observation(o) => o.text.len(),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConversationError {
    #[error("turn pairing violated: {0}")]
    PairingViolation(String),
}

/// Size budget applied when rendering the transcript for the model.
#[derive(Debug, Clone, Copy)]
pub struct WindowPolicy {
    pub max_chars: usize,
    /// Most recent turns that are always sent verbatim.
    pub keep_recent: usize,
}

impl Default for WindowPolicy {
    fn default() -> Self {
        Self {
            max_chars: 200_000,
            keep_recent: 8,
        }
    }
}

/// Ordered transcript of turns for one session.
#[derive(Debug, Clone, Default)]
pub struct ConversationState {
    turns: Vec<Turn>,
    window: WindowPolicy,
}

impl ConversationState {
    pub fn new(window: WindowPolicy) -> Self {
        Self {
            turns: Vec::new(),
            window,
        }
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    /// The tool call still waiting for its observation, if any.
    pub fn pending_call(&self) -> Option<&ToolCall> {
        match self.turns.last() {
            Some(Turn::ToolCall(call)) => Some(call),
            _ => None,
        }
    }

    pub fn char_len(&self) -> usize {
        self.turns.iter().map(Turn::char_len).sum()
    }

    /// Append a turn, rejecting anything that would break call/observation pairing.
    pub fn append(&mut self, turn: Turn) -> Result<(), ConversationError> {
        self.check_append(&turn)?;
        self.turns.push(turn);
        Ok(())
    }

    fn check_append(&self, turn: &Turn) -> Result<(), ConversationError> {
        let violation = |msg: String| Err(ConversationError::PairingViolation(msg));

        if let Some(pending) = self.pending_call() {
            return match turn {
                Turn::Observation(obs) if obs.call_id == pending.id => Ok(()),
                Turn::Observation(obs) => violation(format!(
                    "observation for '{}' while '{}' is pending",
                    obs.call_id, pending.id
                )),
                _ => violation(format!(
                    "tool call '{}' must be followed by its observation",
                    pending.id
                )),
            };
        }

        match turn {
            Turn::Goal { .. } if !self.turns.is_empty() => {
                violation("goal must be the first turn".into())
            }
            Turn::Observation(obs) => violation(format!(
                "observation for '{}' without a pending tool call",
                obs.call_id
            )),
            Turn::ToolCall(call) => match self.turns.last() {
                Some(Turn::Assistant(AssistantMessage {
                    call: Some(announced),
                    ..
                })) if announced.id == call.id => Ok(()),
                _ => violation(format!(
                    "tool call '{}' does not follow the assistant message that issued it",
                    call.id
                )),
            },
            _ => Ok(()),
        }
    }

    /// Transcript view sized for the model endpoint.
    ///
    /// Over budget, the oldest observation texts are elided first, then the
    /// oldest assistant texts. The goal, tool calls and the most recent
    /// `keep_recent` turns are never altered.
    pub fn render_for_model(&self) -> Vec<Turn> {
        let mut rendered = self.turns.clone();
        let mut total = self.char_len();
        if total <= self.window.max_chars {
            return rendered;
        }

        let protected_from = rendered.len().saturating_sub(self.window.keep_recent);
        let mut elided = 0usize;

        for i in 0..protected_from {
            if total <= self.window.max_chars {
                break;
            }
            if let Turn::Observation(obs) = &mut rendered[i] {
                let marker = format!("[output elided to save context: {} chars]", obs.text.len());
                if obs.text.len() > marker.len() {
                    total -= obs.text.len() - marker.len();
                    obs.text = marker;
                    obs.truncated = true;
                    elided += 1;
                }
            }
        }

        for i in 0..protected_from {
            if total <= self.window.max_chars {
                break;
            }
            if let Turn::Assistant(msg) = &mut rendered[i] {
                let reasoning_len = msg.reasoning.take().map_or(0, |r| r.len());
                total -= reasoning_len;
                let marker = format!("[earlier analysis elided: {} chars]", msg.text.len());
                if msg.text.len() > marker.len() {
                    total -= msg.text.len() - marker.len();
                    msg.text = marker;
                    elided += 1;
                }
            }
        }

        debug!(
            "Context window: {} -> {total} chars ({elided} turns elided, budget {})",
            self.char_len(),
            self.window.max_chars
        );
        rendered
    }

    /// Write the transcript as JSON lines, one turn per line.
    pub fn save_jsonl(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create transcript dir '{}'", parent.display())
            })?;
        }
        let file = std::fs::File::create(path)
            .with_context(|| format!("failed to create transcript '{}'", path.display()))?;
        let mut writer = std::io::BufWriter::new(file);
        for turn in &self.turns {
            serde_json::to_writer(&mut writer, turn)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Replay a saved transcript, re-checking pairing on every turn.
    pub fn load_jsonl(path: &Path, window: WindowPolicy) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("failed to open transcript '{}'", path.display()))?;
        let mut state = Self::new(window);
        for (n, line) in std::io::BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let turn: Turn = serde_json::from_str(&line)
                .with_context(|| format!("bad turn on line {} of '{}'", n + 1, path.display()))?;
            state
                .append(turn)
                .with_context(|| format!("line {} of '{}'", n + 1, path.display()))?;
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;

    fn call(id: &str) -> ToolCall {
        ToolCall::native(id, ToolKind::AnalysisCommand, "afl")
    }

    fn started() -> ConversationState {
        let mut state = ConversationState::new(WindowPolicy::default());
        state.append(Turn::goal("list exported functions")).unwrap();
        state
    }

    /// Every ToolCall is followed by its Observation, or is the last turn.
    fn pairing_holds(turns: &[Turn]) -> bool {
        for (i, turn) in turns.iter().enumerate() {
            match turn {
                Turn::ToolCall(c) => match turns.get(i + 1) {
                    None => {}
                    Some(Turn::Observation(o)) if o.call_id == c.id => {}
                    Some(_) => return false,
                },
                Turn::Observation(o) => match i.checked_sub(1).map(|p| &turns[p]) {
                    Some(Turn::ToolCall(c)) if c.id == o.call_id => {}
                    _ => return false,
                },
                _ => {}
            }
        }
        true
    }

    #[test]
    fn call_then_observation_accepted() {
        let mut state = started();
        state
            .append(Turn::Assistant(AssistantMessage::with_call("look", call("c1"))))
            .unwrap();
        state.append(Turn::ToolCall(call("c1"))).unwrap();
        assert_eq!(state.pending_call().map(|c| c.id.as_str()), Some("c1"));
        state
            .append(Turn::Observation(Observation::ok("c1", "sym.main")))
            .unwrap();
        assert!(state.pending_call().is_none());
        assert_eq!(state.len(), 4);
    }

    #[test]
    fn assistant_blocked_while_call_pending() {
        let mut state = started();
        state
            .append(Turn::Assistant(AssistantMessage::with_call("", call("c1"))))
            .unwrap();
        state.append(Turn::ToolCall(call("c1"))).unwrap();
        let err = state
            .append(Turn::Assistant(AssistantMessage::text("done")))
            .unwrap_err();
        assert!(matches!(err, ConversationError::PairingViolation(_)));
        assert_eq!(state.len(), 3);
    }

    #[test]
    fn mismatched_observation_rejected() {
        let mut state = started();
        state
            .append(Turn::Assistant(AssistantMessage::with_call("", call("c1"))))
            .unwrap();
        state.append(Turn::ToolCall(call("c1"))).unwrap();
        assert!(state
            .append(Turn::Observation(Observation::ok("c2", "x")))
            .is_err());
    }

    #[test]
    fn orphan_observation_rejected() {
        let mut state = started();
        assert!(state
            .append(Turn::Observation(Observation::ok("c1", "x")))
            .is_err());
    }

    #[test]
    fn tool_call_must_be_announced() {
        let mut state = started();
        state
            .append(Turn::Assistant(AssistantMessage::text("thinking")))
            .unwrap();
        assert!(state.append(Turn::ToolCall(call("c9"))).is_err());
    }

    #[test]
    fn second_goal_rejected() {
        let mut state = started();
        assert!(state.append(Turn::goal("again")).is_err());
    }

    #[test]
    fn random_sequences_never_break_pairing() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..200 {
            let mut state = started();
            let mut last_id = String::new();
            for step in 0..60 {
                let id = format!("c{step}");
                let turn = match rng.gen_range(0..6) {
                    0 => {
                        last_id = id.clone();
                        Turn::Assistant(AssistantMessage::with_call("act", call(&id)))
                    }
                    1 => Turn::Assistant(AssistantMessage::text("say")),
                    2 => Turn::ToolCall(call(if rng.gen_bool(0.7) { &last_id } else { &id })),
                    3 => Turn::Observation(Observation::ok(
                        if rng.gen_bool(0.7) { last_id.clone() } else { id },
                        "out",
                    )),
                    4 => Turn::user("hint"),
                    _ => Turn::goal("again"),
                };
                let _ = state.append(turn);
                assert!(pairing_holds(state.turns()), "{:#?}", state.turns());
            }
        }
    }

    fn big_session(obs_len: usize, pairs: usize) -> ConversationState {
        let mut state = ConversationState::new(WindowPolicy {
            max_chars: 1_000,
            keep_recent: 4,
        });
        state.append(Turn::goal("analyze")).unwrap();
        for i in 0..pairs {
            let id = format!("c{i}");
            state
                .append(Turn::Assistant(AssistantMessage::with_call("next", call(&id))))
                .unwrap();
            state.append(Turn::ToolCall(call(&id))).unwrap();
            state
                .append(Turn::Observation(Observation::ok(&id, "x".repeat(obs_len))))
                .unwrap();
        }
        state
    }

    #[test]
    fn render_under_budget_is_verbatim() {
        let state = big_session(10, 3);
        assert_eq!(state.render_for_model(), state.turns().to_vec());
    }

    #[test]
    fn render_elides_oldest_observations_first() {
        let state = big_session(500, 6);
        let rendered = state.render_for_model();

        assert_eq!(rendered.len(), state.len());
        assert_eq!(rendered[0], state.turns()[0]);
        assert!(pairing_holds(&rendered));

        // oldest observation compacted
        match &rendered[3] {
            Turn::Observation(o) => {
                assert!(o.text.starts_with("[output elided"));
                assert!(o.truncated);
            }
            other => panic!("expected observation, got {other:?}"),
        }
        // recent turns untouched
        let n = rendered.len();
        assert_eq!(rendered[n - 4..], state.turns()[n - 4..]);
        // underlying transcript is never mutated
        assert!(matches!(&state.turns()[3], Turn::Observation(o) if o.text.len() == 500));
    }

    #[test]
    fn jsonl_round_trip_preserves_turns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions").join("t.jsonl");
        let state = big_session(20, 2);
        state.save_jsonl(&path).unwrap();

        let loaded = ConversationState::load_jsonl(&path, WindowPolicy::default()).unwrap();
        assert_eq!(loaded.turns(), state.turns());
    }

    #[test]
    fn jsonl_replay_rejects_broken_pairing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.jsonl");
        let lines = [
            serde_json::to_string(&Turn::goal("g")).unwrap(),
            serde_json::to_string(&Turn::Observation(Observation::ok("c1", "x"))).unwrap(),
        ];
        std::fs::write(&path, lines.join("\n")).unwrap();
        assert!(ConversationState::load_jsonl(&path, WindowPolicy::default()).is_err());
    }
}
