use std::sync::Arc;
use std::time::Instant;

use rig::completion::ToolDefinition;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::code::CodeRunner;
use crate::conversation::{Observation, ObservationStatus, ToolCall};
use crate::engine::{EngineError, ToolChannel};

/// The capabilities the model can invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    AnalysisCommand,
    CodeSnippet,
}

impl ToolKind {
    pub const ALL: [ToolKind; 2] = [ToolKind::AnalysisCommand, ToolKind::CodeSnippet];

    /// Function name advertised to the model.
    pub fn name(&self) -> &'static str {
        match self {
            ToolKind::AnalysisCommand => "r2_command",
            ToolKind::CodeSnippet => "run_code",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }

    /// Argument key holding the payload.
    pub fn payload_key(&self) -> &'static str {
        match self {
            ToolKind::AnalysisCommand => "command",
            ToolKind::CodeSnippet => "code",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ToolKind::AnalysisCommand => {
                "Run one radare2 command against the loaded binary and return its output \
                 (e.g. `aaa`, `afl`, `pdf @ main`, `iI`, `iE`). One command per call; \
                 chain with `;` if needed. Prefer `~` filters and `~HEAD` on large output."
            }
            ToolKind::CodeSnippet => {
                "Run a Rhai script to post-process data. Variables persist between calls. \
                 `cmd(\"...\")` runs a radare2 command and returns its text, `cmdj(\"...\")` \
                 parses JSON output, `re_find_all(pattern, text)` and `re_match(pattern, text)` \
                 apply regexes. Printed output and the final expression value are returned."
            }
        }
    }

    pub fn parameters_schema(&self) -> serde_json::Value {
        let key = self.payload_key();
        let what = match self {
            ToolKind::AnalysisCommand => "The radare2 command to execute",
            ToolKind::CodeSnippet => "The Rhai source code to evaluate",
        };
        serde_json::json!({
            "type": "object",
            "properties": {
                key: {
                    "type": "string",
                    "description": what,
                    "minLength": 1
                }
            },
            "required": [key]
        })
    }

    /// Schema advertised to the model endpoint.
    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }

    /// Arguments object for a payload, as the model would have sent it.
    pub fn arguments(&self, payload: &str) -> serde_json::Value {
        serde_json::json!({ self.payload_key(): payload })
    }

    /// Validate model-issued arguments and extract the payload.
    pub fn parse_arguments(&self, params: &serde_json::Value) -> Result<String, String> {
        // Some providers deliver arguments as a JSON-encoded string.
        let decoded;
        let params = match params.as_str() {
            Some(raw) => {
                decoded = serde_json::from_str::<serde_json::Value>(raw)
                    .map_err(|e| format!("arguments are not valid JSON: {e}"))?;
                &decoded
            }
            None => params,
        };

        let errors = validate_params(params, &self.parameters_schema());
        if !errors.is_empty() {
            return Err(format!(
                "Invalid parameters for tool '{}': {}",
                self.name(),
                errors.join("; ")
            ));
        }
        params
            .get(self.payload_key())
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| format!("missing required parameter: {}", self.payload_key()))
    }
}

/// Find the largest byte index <= `max` that is a UTF-8 char boundary.
pub(crate) fn floor_char_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut i = max;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Cap `text` at `cap` bytes, marker included. Returns the text and whether it was cut.
pub fn truncate_output(text: &str, cap: usize) -> (String, bool) {
    if text.len() <= cap {
        return (text.to_string(), false);
    }
    let marker = format!(
        "\n... [output truncated, {} more chars]",
        text.len().saturating_sub(cap)
    );
    if marker.len() >= cap {
        let end = floor_char_boundary(text, cap);
        return (text[..end].to_string(), true);
    }
    let end = floor_char_boundary(text, cap - marker.len());
    (format!("{}{marker}", &text[..end]), true)
}

/// Shorten text for log lines.
pub(crate) fn preview(text: &str, max: usize) -> String {
    if text.len() > max {
        let end = floor_char_boundary(text, max);
        format!("{}... ({} chars)", &text[..end], text.len())
    } else {
        text.to_string()
    }
}

/// Dispatches tool calls to the analysis engine or the code runner and
/// normalizes every outcome into an [`Observation`].
pub struct ToolRouter {
    engine: Arc<ToolChannel>,
    code: CodeRunner,
    max_output: usize,
}

impl ToolRouter {
    pub fn new(engine: Arc<ToolChannel>, code: CodeRunner, max_output: usize) -> Self {
        Self {
            engine,
            code,
            max_output,
        }
    }

    /// Execute one call. Never fails: errors become `status = Error` observations.
    pub async fn dispatch(&self, call: &ToolCall) -> Observation {
        info!(
            "Tool call: {}({})",
            call.kind.name(),
            preview(&call.payload, 200)
        );
        let started = Instant::now();

        let (status, raw) = match call.kind {
            ToolKind::AnalysisCommand => match self.engine.send(&call.payload).await {
                Ok(out) if out.trim().is_empty() => (ObservationStatus::Ok, "(No Output)".into()),
                Ok(out) => (ObservationStatus::Ok, out),
                Err(e @ EngineError::Unavailable(_)) => {
                    warn!("Engine lost while running '{}': {e}", call.payload);
                    (ObservationStatus::Error, format!("R2 Error: {e}"))
                }
                Err(e) => (
                    ObservationStatus::Error,
                    format!("R2 Error executing '{}': {e}", call.payload.trim()),
                ),
            },
            ToolKind::CodeSnippet => match self.code.execute(&call.payload).await {
                Ok(out) => (ObservationStatus::Ok, out),
                Err(e) => (ObservationStatus::Error, format!("Code Execution Error:\n{e}")),
            },
        };

        let (text, truncated) = truncate_output(&raw, self.max_output);
        debug!(
            "Tool result [{}]: {:?} in {:.2}s, {} chars{}",
            call.kind.name(),
            status,
            started.elapsed().as_secs_f64(),
            raw.len(),
            if truncated { " (truncated)" } else { "" }
        );

        Observation {
            call_id: call.id.clone(),
            status,
            text,
            truncated,
        }
    }

    /// True once the engine session has died; the session cannot be recovered.
    pub fn engine_lost(&self) -> bool {
        self.engine.is_lost()
    }

    /// Tear down the engine session.
    pub async fn close(&self) {
        self.engine.close().await;
    }
}

/// Validate tool parameters against a JSON schema.
/// Returns a list of validation error strings (empty if valid).
fn validate_params(params: &serde_json::Value, schema: &serde_json::Value) -> Vec<String> {
    let mut errors = Vec::new();
    validate_value(params, schema, "", &mut errors);
    errors
}

fn validate_value(
    val: &serde_json::Value,
    schema: &serde_json::Value,
    path: &str,
    errors: &mut Vec<String>,
) {
    let display_path = if path.is_empty() { "root" } else { path };

    if let Some(expected_type) = schema.get("type").and_then(|t| t.as_str()) {
        let type_ok = match expected_type {
            "object" => val.is_object(),
            "array" => val.is_array(),
            "string" => val.is_string(),
            "integer" => val.is_i64() || val.is_u64(),
            "number" => val.is_number(),
            "boolean" => val.is_boolean(),
            "null" => val.is_null(),
            _ => true,
        };
        if !type_ok {
            errors.push(format!("{display_path}: expected type '{expected_type}'"));
            return;
        }
    }

    if let Some(allowed) = schema.get("enum").and_then(|e| e.as_array()) {
        if !allowed.contains(val) {
            errors.push(format!("{display_path}: value not in allowed enum"));
        }
    }

    if let Some(s) = val.as_str() {
        if let Some(min_len) = schema.get("minLength").and_then(|m| m.as_u64()) {
            if (s.trim().len() as u64) < min_len {
                errors.push(format!(
                    "{display_path}: string length {} < minLength {min_len}",
                    s.trim().len()
                ));
            }
        }
    }

    if let Some(obj) = val.as_object() {
        if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
            for field in required.iter().filter_map(|r| r.as_str()) {
                if !obj.contains_key(field) {
                    let field_path = if path.is_empty() {
                        field.to_string()
                    } else {
                        format!("{path}.{field}")
                    };
                    errors.push(format!("{field_path}: required field missing"));
                }
            }
        }
        if let Some(props) = schema.get("properties").and_then(|p| p.as_object()) {
            for (key, prop_schema) in props {
                if let Some(prop_val) = obj.get(key) {
                    let prop_path = if path.is_empty() {
                        key.clone()
                    } else {
                        format!("{path}.{key}")
                    };
                    validate_value(prop_val, prop_schema, &prop_path, errors);
                }
            }
        }
    }
}
