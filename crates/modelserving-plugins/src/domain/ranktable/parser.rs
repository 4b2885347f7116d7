use std::sync::Arc;

use error_stack::Report;
use error_stack::ResultExt;
use serde_json::json;

use super::PodRanktableData;
use super::RanktableError;
use super::TemplateEngine;

/// Extracts a pod's rank table contribution from its annotation.
///
/// The parser template sees the raw annotation string as `annotation` and
/// must emit YAML with `podName`, `serverId` and `devices`.
#[derive(Clone)]
pub struct PodParser {
    engine: Arc<dyn TemplateEngine>,
}

impl PodParser {
    pub fn new(engine: Arc<dyn TemplateEngine>) -> Self {
        Self { engine }
    }

    pub fn parse(
        &self,
        pod_name: &str,
        parser_template: &str,
        annotation: &str,
    ) -> Result<PodRanktableData, Report<RanktableError>> {
        let parse_error = || RanktableError::Parse {
            pod: pod_name.to_string(),
        };

        let rendered = self
            .engine
            .evaluate("pod-parser", parser_template, &json!({ "annotation": annotation }))
            .change_context_lazy(parse_error)?;

        let data: PodRanktableData = serde_yaml::from_str(&rendered)
            .change_context_lazy(parse_error)
            .attach_printable_lazy(|| format!("parser output: {rendered}"))?;

        if data.server_id.is_empty() {
            return Err(Report::new(parse_error()).attach_printable("empty serverId"));
        }

        Ok(data)
    }
}
