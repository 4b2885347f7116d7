//! Rank table data types and well-known keys

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

/// Workload annotation overriding the level declared by the template.
pub const RANKTABLE_LEVEL_ANNOTATION: &str = "kthena.io/ranktable-level";
/// Pod annotation read when the parser template does not name one.
pub const POD_RANKTABLE_ANNOTATION: &str = "ascend.com/ranktable";
pub const DEFAULT_TEMPLATE_NAMESPACE: &str = "default";

pub const RANKTABLE_SUFFIX: &str = "ranktable";
pub const RANKTABLE_VOLUME_NAME: &str = "ranktable";
pub const COMPONENT_LABEL_KEY: &str = "app.kubernetes.io/component";
pub const RANKTABLE_COMPONENT: &str = "ranktable";
pub const RANKTABLE_LEVEL_LABEL_KEY: &str = "ranktable-level";

// Keys of the rank table template document
pub const LEVEL_KEY: &str = "ranktable-level";
pub const POD_PARSER_TEMPLATE_KEY: &str = "pod-parser-template";
pub const RANKTABLE_TEMPLATE_KEY: &str = "ranktable-template";
pub const MOUNT_PATH_KEY: &str = "mount-path";
pub const FILENAME_KEY: &str = "filename";
pub const INFERENCE_ENGINE_KEY: &str = "inference-engine";
pub const SERVER_ID_SOURCE_KEY: &str = "server-id-source";
// Keys of the pod parser document
pub const ANNOTATION_NAME_KEY: &str = "annotation-name";
pub const PARSER_TEMPLATE_KEY: &str = "parser-template";

/// Scope a rank table is generated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RanktableLevel {
    /// One table per role instance
    Role,
    /// One table per serving group
    Group,
}

impl RanktableLevel {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Role => "role",
            Self::Group => "group",
        }
    }
}

impl fmt::Display for RanktableLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RanktableLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "role" => Ok(Self::Role),
            "group" => Ok(Self::Group),
            other => Err(format!("invalid ranktable level: {other:?}")),
        }
    }
}

/// Where a pod's server id comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerIdSource {
    /// The value emitted by the parser template
    #[default]
    Annotation,
    /// The pod IP observed in the pod status
    PodIp,
}

impl FromStr for ServerIdSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "annotation" => Ok(Self::Annotation),
            "pod-ip" => Ok(Self::PodIp),
            other => Err(format!("invalid server id source: {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, derive_more::Display)]
pub enum RanktableStatus {
    Initializing,
    Completed,
}

impl FromStr for RanktableStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Initializing" => Ok(Self::Initializing),
            "Completed" => Ok(Self::Completed),
            other => Err(format!("invalid ranktable status: {other:?}")),
        }
    }
}

/// A resolved rank table template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RanktableTemplate {
    /// Informational only (mindie, vllm-ascend, ...)
    pub inference_engine: String,
    pub level: RanktableLevel,
    pub pod_parser_template: String,
    pub ranktable_template: String,
    pub mount_path: String,
    pub filename: String,
    pub pod_annotation_name: String,
    pub server_id_source: ServerIdSource,
}

/// Rank table contribution of a single pod, as emitted by a parser template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodRanktableData {
    pub pod_name: String,
    pub server_id: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub devices: Vec<DeviceInfo>,
}

// `devices:` with no entries renders as YAML null
fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<DeviceInfo>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<Vec<DeviceInfo>>::deserialize(deserializer).map(Option::unwrap_or_default)
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub device_id: String,
    pub device_ip: String,
}

/// Context handed to the rank table template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RanktableTemplateData {
    pub status: RanktableStatus,
    pub server_count: usize,
    pub total_devices: usize,
    /// RFC 3339
    pub timestamp: String,
    pub servers: Vec<ServerInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServerInfo {
    pub server_id: String,
    pub devices: Vec<DeviceWithRank>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceWithRank {
    pub device_id: String,
    pub device_ip: String,
    /// Global rank as a decimal string
    pub rank_id: String,
}

/// Name of the rank table ConfigMap for a scope.
///
/// `<ms>-<group>-ranktable` for group level, `<ms>-<group>-<roleId>-ranktable`
/// for role level.
pub fn ranktable_config_map_name(
    model_serving: &str,
    serving_group: &str,
    role_id: Option<&str>,
) -> String {
    match role_id {
        Some(role_id) => format!("{model_serving}-{serving_group}-{role_id}-{RANKTABLE_SUFFIX}"),
        None => format!("{model_serving}-{serving_group}-{RANKTABLE_SUFFIX}"),
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn level_parses_exact_values_only() {
        assert_eq!("role".parse::<RanktableLevel>(), Ok(RanktableLevel::Role));
        assert_eq!("group".parse::<RanktableLevel>(), Ok(RanktableLevel::Group));
        assert!("Role".parse::<RanktableLevel>().is_err());
        assert!("".parse::<RanktableLevel>().is_err());
    }

    #[test]
    fn config_map_names() {
        assert_eq!(
            ranktable_config_map_name("llama", "llama-0", None),
            "llama-llama-0-ranktable"
        );
        assert_eq!(
            ranktable_config_map_name("llama", "llama-0", Some("prefill-1")),
            "llama-llama-0-prefill-1-ranktable"
        );
    }

    #[test]
    fn pod_data_requires_server_id() {
        let err = serde_yaml::from_str::<PodRanktableData>("podName: a\ndevices: []\n");
        assert!(err.is_err());

        let data: PodRanktableData = serde_yaml::from_str("podName: a\nserverId: s\n").unwrap();
        assert!(data.devices.is_empty());

        let data: PodRanktableData =
            serde_yaml::from_str("podName: a\nserverId: s\ndevices:\n").unwrap();
        assert!(data.devices.is_empty());
    }

    #[test]
    fn template_data_uses_pascal_case() {
        let data = RanktableTemplateData {
            status: RanktableStatus::Completed,
            server_count: 1,
            total_devices: 1,
            timestamp: "2024-01-01T00:00:00Z".to_string(),
            servers: vec![ServerInfo {
                server_id: "s".to_string(),
                devices: vec![DeviceWithRank {
                    device_id: "0".to_string(),
                    device_ip: "1.1.1.1".to_string(),
                    rank_id: "0".to_string(),
                }],
            }],
        };

        assert_eq!(
            serde_json::to_value(&data).unwrap(),
            serde_json::json!({
                "Status": "Completed",
                "ServerCount": 1,
                "TotalDevices": 1,
                "Timestamp": "2024-01-01T00:00:00Z",
                "Servers": [{
                    "ServerId": "s",
                    "Devices": [{"DeviceId": "0", "DeviceIp": "1.1.1.1", "RankId": "0"}]
                }]
            })
        );
    }
}
