//! Embedded Rhai interpreter for model-written snippets.
//!
//! A single [`Scope`] lives for the whole session, so `let` bindings made by
//! one snippet are visible to the next. Script functions live in the AST, not
//! the scope, so they are collected into a separate library AST.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use r2auto_config::CodeConfig;
use rhai::{Array, Dynamic, Engine, EvalAltResult, Scope, AST};
use tracing::debug;

use crate::engine::ToolChannel;

const NO_OUTPUT: &str = "(executed successfully, no output)";

#[derive(Debug, thiserror::Error)]
pub enum CodeError {
    #[error("Syntax error: {message}{}", partial(.output))]
    Parse { message: String, output: String },
    #[error("{message}{}", partial(.output))]
    Runtime { message: String, output: String },
    #[error("code runner failed: {0}")]
    Internal(String),
}

fn partial(output: &str) -> String {
    if output.trim().is_empty() {
        String::new()
    } else {
        format!("\nOutput before the error:\n{}", output.trim_end())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Runs snippets against a persistent evaluation context.
#[derive(Clone)]
pub struct CodeRunner {
    engine: Arc<Engine>,
    scope: Arc<Mutex<Scope<'static>>>,
    /// `fn` definitions from earlier snippets.
    functions: Arc<Mutex<AST>>,
    printed: Arc<Mutex<String>>,
}

impl CodeRunner {
    /// Build a runner. With an engine channel, snippets can call `cmd` and `cmdj`.
    pub fn new(config: &CodeConfig, channel: Option<Arc<ToolChannel>>) -> Self {
        let printed = Arc::new(Mutex::new(String::new()));
        let mut engine = Engine::new();
        engine.set_max_operations(config.max_operations);
        engine.set_max_call_levels(config.max_call_depth);

        let sink = printed.clone();
        engine.on_print(move |text| {
            let mut out = lock(&sink);
            out.push_str(text);
            out.push('\n');
        });
        let sink = printed.clone();
        engine.on_debug(move |text, _source, _pos| {
            let mut out = lock(&sink);
            out.push_str(text);
            out.push('\n');
        });

        register_text_helpers(&mut engine);
        if let Some(channel) = channel {
            register_engine_helpers(&mut engine, channel);
        }

        Self {
            engine: Arc::new(engine),
            scope: Arc::new(Mutex::new(Scope::new())),
            functions: Arc::new(Mutex::new(AST::empty())),
            printed,
        }
    }

    /// Evaluate a snippet on the blocking pool and return what it printed.
    pub async fn execute(&self, code: &str) -> Result<String, CodeError> {
        let runner = self.clone();
        let code = code.to_string();
        tokio::task::spawn_blocking(move || runner.run(&code))
            .await
            .map_err(|e| CodeError::Internal(e.to_string()))?
    }

    /// Names currently bound in the evaluation context.
    pub fn bindings(&self) -> Vec<String> {
        lock(&self.scope)
            .iter()
            .map(|(name, _, _)| name.to_string())
            .collect()
    }

    fn run(&self, code: &str) -> Result<String, CodeError> {
        let mut scope = lock(&self.scope);
        lock(&self.printed).clear();
        let started = Instant::now();

        let ast = match self.engine.compile_with_scope(&scope, code) {
            Ok(ast) => ast,
            Err(e) => {
                return Err(CodeError::Parse {
                    message: e.to_string(),
                    output: String::new(),
                })
            }
        };

        let mut functions = lock(&self.functions);
        let program = functions.merge(&ast);
        let result = self.engine.eval_ast_with_scope::<Dynamic>(&mut scope, &program);
        if result.is_ok() {
            functions.combine(ast.clone_functions_only());
        }
        let printed = std::mem::take(&mut *lock(&self.printed));
        debug!(
            "Snippet finished in {:.2}s ({} bindings, {} chars printed)",
            started.elapsed().as_secs_f64(),
            scope.len(),
            printed.len()
        );

        let value = result.map_err(|e| CodeError::Runtime {
            message: e.to_string(),
            output: printed.clone(),
        })?;

        let mut out = printed;
        if !value.is_unit() {
            out.push_str(&format!("=> {value}"));
        }
        if out.trim().is_empty() {
            return Ok(NO_OUTPUT.to_string());
        }
        Ok(out.trim_end().to_string())
    }
}

fn compile_regex(pattern: &str) -> Result<regex::Regex, Box<EvalAltResult>> {
    regex::Regex::new(pattern).map_err(|e| format!("invalid regex '{pattern}': {e}").into())
}

fn json_to_dynamic(text: &str) -> Result<Dynamic, Box<EvalAltResult>> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| format!("invalid JSON: {e}"))?;
    rhai::serde::to_dynamic(value)
}

fn register_text_helpers(engine: &mut Engine) {
    engine.register_fn("re_match", |pattern: &str, text: &str| {
        compile_regex(pattern).map(|re| re.is_match(text))
    });
    engine.register_fn("re_find_all", |pattern: &str, text: &str| {
        compile_regex(pattern).map(|re| {
            re.find_iter(text)
                .map(|m| Dynamic::from(m.as_str().to_string()))
                .collect::<Array>()
        })
    });
    engine.register_fn("parse_json", json_to_dynamic);
}

fn register_engine_helpers(engine: &mut Engine, channel: Arc<ToolChannel>) {
    let send = move |command: &str| -> Result<String, Box<EvalAltResult>> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|_| "cmd() is unavailable outside the agent runtime".to_string())?;
        handle
            .block_on(channel.send(command))
            .map_err(|e| e.to_string().into())
    };
    let send = Arc::new(send);

    let text = send.clone();
    engine.register_fn("cmd", move |command: &str| text(command));
    let json = send;
    engine.register_fn("cmdj", move |command: &str| {
        json(command).and_then(|out| json_to_dynamic(&out))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> CodeRunner {
        CodeRunner::new(&CodeConfig::default(), None)
    }

    #[tokio::test]
    async fn prints_and_final_value() {
        let out = runner().execute(r#"print("hi"); 40 + 2"#).await.unwrap();
        assert_eq!(out, "hi\n=> 42");
    }

    #[tokio::test]
    async fn bindings_persist_between_snippets() {
        let code = runner();
        assert_eq!(code.execute("let x = 5;").await.unwrap(), NO_OUTPUT);
        assert_eq!(code.execute("x * 2").await.unwrap(), "=> 10");
        assert!(code.bindings().contains(&"x".to_string()));
    }

    #[tokio::test]
    async fn functions_persist_between_snippets() {
        let code = runner();
        assert_eq!(code.execute("fn double(x) { x * 2 }").await.unwrap(), NO_OUTPUT);
        assert_eq!(code.execute("double(21)").await.unwrap(), "=> 42");
        // a later definition replaces the earlier one
        code.execute("fn double(x) { x * 3 }").await.unwrap();
        assert_eq!(code.execute("double(2)").await.unwrap(), "=> 6");
    }

    #[tokio::test]
    async fn division_by_zero_is_an_error() {
        let code = runner();
        let err = code.execute("let x = 1/0;").await.unwrap_err();
        assert!(matches!(err, CodeError::Runtime { .. }));
        assert!(err.to_string().to_lowercase().contains("division by zero"));
        // the context is still usable afterwards
        assert_eq!(code.execute("1 + 1").await.unwrap(), "=> 2");
    }

    #[tokio::test]
    async fn partial_output_kept_on_error() {
        let err = runner()
            .execute(r#"print("step 1"); throw "boom";"#)
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("boom"));
        assert!(msg.contains("step 1"));
    }

    #[tokio::test]
    async fn syntax_error_reported() {
        let err = runner().execute("let = ;").await.unwrap_err();
        assert!(matches!(err, CodeError::Parse { .. }));
    }

    #[tokio::test]
    async fn runaway_loop_is_stopped() {
        let config = CodeConfig {
            max_operations: 10_000,
            ..CodeConfig::default()
        };
        let code = CodeRunner::new(&config, None);
        assert!(code.execute("loop { }").await.is_err());
    }

    #[tokio::test]
    async fn regex_and_json_helpers() {
        let code = runner();
        assert_eq!(
            code.execute(r#"re_find_all("sym\\.\\w+", "sym.a call sym.b").len()"#)
                .await
                .unwrap(),
            "=> 2"
        );
        assert_eq!(
            code.execute(r#"re_match("^ELF", "ELF64")"#).await.unwrap(),
            "=> true"
        );
        assert_eq!(
            code.execute(r#"let m = parse_json("{\"size\": 3}"); m.size"#)
                .await
                .unwrap(),
            "=> 3"
        );
        assert!(code.execute(r#"re_match("(", "x")"#).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn snippets_can_drive_the_engine() {
        use std::time::Duration;

        use crate::testing::{FakeEngine, ECHO_ENGINE, ONE_SHOT_ENGINE};

        let fx = FakeEngine::new(ECHO_ENGINE);
        let channel = fx.start(Duration::from_secs(5)).await;
        let code = CodeRunner::new(&CodeConfig::default(), Some(channel.clone()));

        let out = code
            .execute(r#"let names = cmd("list exports").split("\n"); names.len()"#)
            .await
            .unwrap();
        assert_eq!(out, "=> 4");
        let out = code.execute(r#"cmdj("{\"bits\": 64}").bits"#).await.unwrap();
        assert_eq!(out, "=> 64");
        channel.close().await;

        let fx = FakeEngine::new(ONE_SHOT_ENGINE);
        let channel = fx.start(Duration::from_secs(5)).await;
        let code = CodeRunner::new(&CodeConfig::default(), Some(channel.clone()));
        assert!(code.execute(r#"cmd("aaa")"#).await.is_err());
        assert!(channel.is_lost());
    }
}
