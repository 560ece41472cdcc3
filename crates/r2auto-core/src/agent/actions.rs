//! Inline actions and termination markers in assistant text.
//!
//! Models without function calling write `[[pdf @ main]]` for an engine
//! command or `<code>...</code>` for a snippet. `[end]` marks the analysis as
//! finished and `[[ask]]` hands control back to the user.

use crate::conversation::{AssistantMessage, ToolCall};
use crate::tools::ToolKind;

pub const END_MARKER: &str = "[end]";
pub const ASK_MARKER: &str = "[[ask]]";

const CODE_OPEN: &str = "<code>";
const CODE_CLOSE: &str = "</code>";

/// What the loop does after an assistant message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentDecision {
    Continue,
    Done,
    AwaitUser,
}

impl AgentDecision {
    pub fn for_message(message: &AssistantMessage) -> Self {
        if message.call.is_some() {
            AgentDecision::Continue
        } else if message.text.contains(END_MARKER) {
            AgentDecision::Done
        } else {
            AgentDecision::AwaitUser
        }
    }
}

/// First inline action in `text`, if any.
pub fn parse_inline_action(text: &str) -> Option<(ToolKind, String)> {
    let mut pos = 0;
    while pos < text.len() {
        let rest = &text[pos..];
        let bracket = rest.find("[[");
        let code = rest.find(CODE_OPEN);

        let (start, kind, open, close) = match (bracket, code) {
            (Some(b), Some(c)) if c < b => (c, ToolKind::CodeSnippet, CODE_OPEN, CODE_CLOSE),
            (Some(b), _) => (b, ToolKind::AnalysisCommand, "[[", "]]"),
            (None, Some(c)) => (c, ToolKind::CodeSnippet, CODE_OPEN, CODE_CLOSE),
            (None, None) => return None,
        };

        let body_start = start + open.len();
        let Some(len) = rest[body_start..].find(close) else {
            pos += body_start;
            continue;
        };
        let body = rest[body_start..body_start + len].trim();
        pos += body_start + len + close.len();

        let is_marker = kind == ToolKind::AnalysisCommand && body.eq_ignore_ascii_case("ask");
        if !body.is_empty() && !is_marker {
            return Some((kind, body.to_string()));
        }
    }
    None
}

/// Attach the first inline action as the message's call when it has none.
pub fn attach_inline_action(mut message: AssistantMessage) -> AssistantMessage {
    if message.call.is_none() {
        if let Some((kind, payload)) = parse_inline_action(&message.text) {
            message.call = Some(ToolCall::inline(kind, payload));
        }
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::CallOrigin;

    #[test]
    fn command_block() {
        assert_eq!(
            parse_inline_action("Let me look.\n[[ pdf @ main ]]\n"),
            Some((ToolKind::AnalysisCommand, "pdf @ main".into()))
        );
    }

    #[test]
    fn code_block() {
        let text = "Counting:\n<code>\nlet n = cmd(\"afl\").split(\"\\n\").len();\nprint(n);\n</code>";
        let (kind, body) = parse_inline_action(text).unwrap();
        assert_eq!(kind, ToolKind::CodeSnippet);
        assert!(body.starts_with("let n"));
        assert!(body.ends_with("print(n);"));
    }

    #[test]
    fn first_action_wins() {
        assert_eq!(
            parse_inline_action("<code>1</code> then [[afl]]"),
            Some((ToolKind::CodeSnippet, "1".into()))
        );
        assert_eq!(
            parse_inline_action("[[aaa]] then [[afl]]"),
            Some((ToolKind::AnalysisCommand, "aaa".into()))
        );
    }

    #[test]
    fn ask_is_not_an_action() {
        assert_eq!(parse_inline_action("Which function? [[ask]]"), None);
        assert_eq!(
            parse_inline_action("[[ask]] or maybe [[iI]]"),
            Some((ToolKind::AnalysisCommand, "iI".into()))
        );
    }

    #[test]
    fn unterminated_blocks_ignored() {
        assert_eq!(parse_inline_action("[[pdf @ main"), None);
        assert_eq!(parse_inline_action("<code>print(1)"), None);
        assert_eq!(
            parse_inline_action("[[oops <code>x</code>"),
            Some((ToolKind::CodeSnippet, "x".into()))
        );
    }

    #[test]
    fn decision_rules() {
        let call = ToolCall::inline(ToolKind::AnalysisCommand, "afl");
        assert_eq!(
            AgentDecision::for_message(&AssistantMessage::with_call("[end]", call)),
            AgentDecision::Continue
        );
        assert_eq!(
            AgentDecision::for_message(&AssistantMessage::text("All done. [end]")),
            AgentDecision::Done
        );
        assert_eq!(
            AgentDecision::for_message(&AssistantMessage::text("Which one? [[ask]]")),
            AgentDecision::AwaitUser
        );
        assert_eq!(
            AgentDecision::for_message(&AssistantMessage::text("Hmm.")),
            AgentDecision::AwaitUser
        );
    }

    #[test]
    fn attach_keeps_native_call() {
        let native = ToolCall::native("call_1", ToolKind::CodeSnippet, "1");
        let msg = attach_inline_action(AssistantMessage::with_call("[[afl]]", native.clone()));
        assert_eq!(msg.call, Some(native));

        let msg = attach_inline_action(AssistantMessage::text("[[afl]]"));
        let call = msg.call.unwrap();
        assert_eq!(call.origin, CallOrigin::Inline);
        assert_eq!(call.payload, "afl");
    }
}
