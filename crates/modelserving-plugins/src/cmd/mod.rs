pub mod reconcile;
pub mod render;
pub mod validate;

use std::fs;
use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use k8s_openapi::api::core::v1::ConfigMap;
use modelserving_plugins::infrastructure::store::memory::InMemoryStore;
use serde::Deserialize;
use tracing::debug;

/// Load every ConfigMap found in the YAML files of `dir` into `store`.
///
/// Files may hold several documents; documents of other kinds are skipped.
/// ConfigMaps without a namespace are placed in `namespace`.
pub fn load_template_dir(store: &InMemoryStore, dir: &Path, namespace: &str) -> Result<usize> {
    let mut paths = fs::read_dir(dir)
        .with_context(|| format!("read template directory {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            matches!(
                path.extension().and_then(|ext| ext.to_str()),
                Some("yaml" | "yml")
            )
        })
        .collect::<Vec<_>>();
    paths.sort();

    let mut loaded = 0;
    for path in paths {
        let text = fs::read_to_string(&path)
            .with_context(|| format!("read template file {}", path.display()))?;

        for document in serde_yaml::Deserializer::from_str(&text) {
            let value = serde_yaml::Value::deserialize(document)
                .with_context(|| format!("parse YAML in {}", path.display()))?;
            if value.get("kind").and_then(|kind| kind.as_str()) != Some("ConfigMap") {
                continue;
            }

            let mut config_map: ConfigMap = serde_yaml::from_value(value)
                .with_context(|| format!("decode ConfigMap in {}", path.display()))?;
            if config_map.metadata.namespace.is_none() {
                config_map.metadata.namespace = Some(namespace.to_string());
            }
            debug!(
                name = ?config_map.metadata.name,
                file = %path.display(),
                "Loaded template document"
            );
            store.insert_config_map(config_map);
            loaded += 1;
        }
    }
    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn loads_config_maps_from_multi_document_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("templates.yaml"),
            r#"apiVersion: v1
kind: ConfigMap
metadata:
  name: mindie-role
data:
  ranktable-level: role
---
apiVersion: v1
kind: Secret
metadata:
  name: ignored
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: parser
  namespace: other
data:
  parser-template: ""
"#,
        )
        .unwrap();
        fs::write(dir.path().join("README.md"), "not yaml").unwrap();

        let store = InMemoryStore::new();
        let loaded = load_template_dir(&store, dir.path(), "kthena-system").unwrap();

        assert_eq!(loaded, 2);
        assert!(store.config_map("kthena-system", "mindie-role").is_some());
        assert!(store.config_map("other", "parser").is_some());
    }
}
