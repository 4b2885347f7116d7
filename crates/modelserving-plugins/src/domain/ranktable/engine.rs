//! Template evaluation
//!
//! Parser and rank table templates are user supplied text evaluated with a
//! small, fixed set of helpers, each registered both as a filter and as a
//! function:
//!
//! - `quote`: render a value as a double quoted JSON string
//! - `toJson`: serialize a value as JSON
//! - `fromJson`: decode a JSON string into a value

use error_stack::Report;
use minijinja::Environment;
use minijinja::Error;
use minijinja::ErrorKind;
use minijinja::UndefinedBehavior;
use minijinja::Value;

use super::RanktableError;

/// Evaluates a named template text against a JSON context.
pub trait TemplateEngine: Send + Sync {
    fn evaluate(
        &self,
        name: &str,
        text: &str,
        context: &serde_json::Value,
    ) -> Result<String, Report<RanktableError>>;
}

/// [`TemplateEngine`] backed by minijinja (Jinja2 syntax).
pub struct JinjaEngine {
    env: Environment<'static>,
}

impl Default for JinjaEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl JinjaEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);

        env.add_filter("quote", quote);
        env.add_function("quote", quote);
        env.add_filter("toJson", to_json);
        env.add_function("toJson", to_json);
        env.add_filter("fromJson", from_json);
        env.add_function("fromJson", from_json);

        Self { env }
    }
}

impl TemplateEngine for JinjaEngine {
    fn evaluate(
        &self,
        name: &str,
        text: &str,
        context: &serde_json::Value,
    ) -> Result<String, Report<RanktableError>> {
        self.env
            .render_named_str(name, text, context)
            .map_err(|e| {
                let detail = format!("{e:#}");
                Report::new(e)
                    .change_context(RanktableError::Template {
                        name: name.to_string(),
                    })
                    .attach_printable(detail)
            })
    }
}

fn quote(value: Value) -> Result<String, Error> {
    let text = match value.as_str() {
        Some(s) => s.to_string(),
        None => value.to_string(),
    };
    serde_json::to_string(&text).map_err(|e| {
        Error::new(ErrorKind::InvalidOperation, "cannot quote value").with_source(e)
    })
}

fn to_json(value: Value) -> Result<String, Error> {
    serde_json::to_string(&value).map_err(|e| {
        Error::new(ErrorKind::InvalidOperation, "cannot serialize value to JSON").with_source(e)
    })
}

fn from_json(text: String) -> Result<Value, Error> {
    serde_json::from_str::<serde_json::Value>(&text)
        .map(|v| Value::from_serialize(&v))
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, "invalid JSON input").with_source(e))
}
