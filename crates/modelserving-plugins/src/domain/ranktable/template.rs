use std::collections::BTreeMap;

use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::ConfigMap;

use super::*;
use crate::infrastructure::store::ConfigMapLister;

/// Loads rank table templates from ConfigMaps of one namespace.
#[derive(Debug, Clone)]
pub struct TemplateResolver {
    namespace: String,
}

impl Default for TemplateResolver {
    fn default() -> Self {
        Self::new(DEFAULT_TEMPLATE_NAMESPACE)
    }
}

fn data_value<'a>(data: Option<&'a BTreeMap<String, String>>, key: &str) -> &'a str {
    data.and_then(|data| data.get(key))
        .map(String::as_str)
        .unwrap_or_default()
}

impl TemplateResolver {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn fetch(
        &self,
        lister: &dyn ConfigMapLister,
        name: &str,
    ) -> Result<ConfigMap, Report<RanktableError>> {
        let not_found = || RanktableError::TemplateNotFound {
            namespace: self.namespace.clone(),
            name: name.to_string(),
        };
        lister
            .get_config_map(&self.namespace, name)
            .change_context_lazy(not_found)?
            .ok_or_else(|| Report::new(not_found()))
    }

    /// Resolve the named rank table template and the parser template it
    /// points at.
    pub fn resolve(
        &self,
        lister: &dyn ConfigMapLister,
        template_name: &str,
    ) -> Result<RanktableTemplate, Report<RanktableError>> {
        let template_cm = self.fetch(lister, template_name)?;
        let data = template_cm.data.as_ref();

        let parser_name = data_value(data, POD_PARSER_TEMPLATE_KEY);
        if parser_name.is_empty() {
            return Err(Report::new(RanktableError::Configuration {
                message: format!(
                    "{POD_PARSER_TEMPLATE_KEY} not specified in ranktable template {template_name}"
                ),
            }));
        }

        let parser_cm = self.fetch(lister, parser_name)?;
        let parser_data = parser_cm.data.as_ref();

        let level = data_value(data, LEVEL_KEY)
            .parse::<RanktableLevel>()
            .map_err(|message| Report::new(RanktableError::Configuration { message }))
            .attach_printable_lazy(|| format!("template: {template_name}"))?;

        let server_id_source = data_value(data, SERVER_ID_SOURCE_KEY)
            .parse::<ServerIdSource>()
            .map_err(|message| Report::new(RanktableError::Configuration { message }))
            .attach_printable_lazy(|| format!("template: {template_name}"))?;

        let pod_annotation_name = match data_value(parser_data, ANNOTATION_NAME_KEY) {
            "" => POD_RANKTABLE_ANNOTATION,
            name => name,
        };

        Ok(RanktableTemplate {
            inference_engine: data_value(data, INFERENCE_ENGINE_KEY).to_string(),
            level,
            pod_parser_template: data_value(parser_data, PARSER_TEMPLATE_KEY).to_string(),
            ranktable_template: data_value(data, RANKTABLE_TEMPLATE_KEY).to_string(),
            mount_path: data_value(data, MOUNT_PATH_KEY).to_string(),
            filename: data_value(data, FILENAME_KEY).to_string(),
            pod_annotation_name: pod_annotation_name.to_string(),
            server_id_source,
        })
    }
}

/// Level requested by a workload annotation, if it names a valid level.
pub fn level_override(annotation: Option<&str>) -> Option<RanktableLevel> {
    annotation.and_then(|value| value.parse().ok())
}
