use std::sync::Arc;

use error_stack::Report;
use error_stack::ResultExt;

use super::RanktableError;
use super::RanktableTemplateData;
use super::TemplateEngine;

/// Renders the final rank table document.
#[derive(Clone)]
pub struct Renderer {
    engine: Arc<dyn TemplateEngine>,
}

impl Renderer {
    pub fn new(engine: Arc<dyn TemplateEngine>) -> Self {
        Self { engine }
    }

    /// Evaluate `template` against `data`; the output must be valid JSON.
    pub fn render(
        &self,
        template: &str,
        data: &RanktableTemplateData,
    ) -> Result<String, Report<RanktableError>> {
        let context = serde_json::to_value(data).change_context(RanktableError::Render)?;
        let content = self
            .engine
            .evaluate("ranktable", template, &context)
            .change_context(RanktableError::Render)?;

        if let Err(e) = serde_json::from_str::<serde_json::Value>(&content) {
            tracing::error!("Generated rank table is not valid JSON: {content}");
            return Err(Report::new(e).change_context(RanktableError::InvalidOutput { content }));
        }

        Ok(content)
    }
}
