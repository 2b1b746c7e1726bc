//! Shared helpers for the CLI binary.

use anyhow::{Context, Result};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

/// Initialise the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `default_level`.
pub fn init_tracing(default_level: &str, json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

// ---------------------------------------------------------------------------
// Arguments
// ---------------------------------------------------------------------------

/// Parse command-line call arguments.
///
/// Each argument is read as JSON; text that is not valid JSON is passed
/// through as a string.
pub fn parse_call_args(raw: &[String]) -> Vec<Value> {
    raw.iter()
        .map(|arg| serde_json::from_str(arg).unwrap_or_else(|_| Value::String(arg.clone())))
        .collect()
}

/// Render a call result for the terminal.
pub fn render(value: &Value) -> Result<String> {
    serde_json::to_string_pretty(value).context("failed to render result")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn arguments_are_json_when_possible() {
        let raw = vec![
            "1".to_owned(),
            "[1, 2]".to_owned(),
            "\"quoted\"".to_owned(),
            "Alice".to_owned(),
            "null".to_owned(),
        ];
        assert_eq!(
            parse_call_args(&raw),
            vec![json!(1), json!([1, 2]), json!("quoted"), json!("Alice"), Value::Null]
        );
    }

    #[test]
    fn render_is_pretty() {
        assert_eq!(render(&json!({ "a": 1 })).unwrap(), "{\n  \"a\": 1\n}");
    }
}
