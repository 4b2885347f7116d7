use k8s_openapi::api::core::v1::Pod;
use tracing::debug;
use tracing::error;

use super::PodParser;
use super::PodRanktableData;
use super::RanktableStatus;
use super::RanktableTemplate;
use super::ServerIdSource;

/// Outcome of one readiness pass over a scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Readiness {
    pub status: RanktableStatus,
    /// Empty unless `status` is `Completed`
    pub contributions: Vec<PodRanktableData>,
    /// Pods without a deletion timestamp
    pub active_pods: usize,
}

/// Decides whether every pod of a scope has published its rank table data.
pub struct ReadinessEvaluator<'a> {
    parser: &'a PodParser,
    template: &'a RanktableTemplate,
}

fn is_running(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        == Some("Running")
}

fn pod_ip(pod: &Pod) -> Option<&str> {
    pod.status
        .as_ref()
        .and_then(|status| status.pod_ip.as_deref())
        .filter(|ip| !ip.is_empty())
}

impl<'a> ReadinessEvaluator<'a> {
    pub fn new(parser: &'a PodParser, template: &'a RanktableTemplate) -> Self {
        Self { parser, template }
    }

    /// Evaluate the pods of a scope.
    ///
    /// Deleting pods are ignored. Every other pod must be running, annotated
    /// and parseable, and when `expected_pods` is set there must be at least
    /// that many active pods; otherwise the pass is `Initializing` and no
    /// contribution is kept.
    pub fn evaluate(&self, pods: &[Pod], expected_pods: Option<usize>) -> Readiness {
        let mut all_ready = true;
        let mut active_pods = 0;
        let mut contributions = Vec::with_capacity(pods.len());

        for pod in pods {
            let name = pod.metadata.name.as_deref().unwrap_or_default();
            if pod.metadata.deletion_timestamp.is_some() {
                debug!(pod = %name, "Skipping deleting pod");
                continue;
            }
            active_pods += 1;

            if !is_running(pod) {
                debug!(pod = %name, "Pod is not running, waiting for rank table");
                all_ready = false;
                continue;
            }

            let Some(annotation) = pod
                .metadata
                .annotations
                .as_ref()
                .and_then(|annotations| annotations.get(&self.template.pod_annotation_name))
            else {
                debug!(
                    pod = %name,
                    annotation = %self.template.pod_annotation_name,
                    "Pod is missing rank table annotation"
                );
                all_ready = false;
                continue;
            };

            let mut data =
                match self
                    .parser
                    .parse(name, &self.template.pod_parser_template, annotation)
                {
                    Ok(data) => data,
                    Err(e) => {
                        error!(pod = %name, "Failed to parse rank table annotation: {e:?}");
                        all_ready = false;
                        continue;
                    }
                };

            if self.template.server_id_source == ServerIdSource::PodIp {
                match pod_ip(pod) {
                    Some(ip) => data.server_id = ip.to_string(),
                    None => {
                        debug!(pod = %name, "Pod has no IP yet");
                        all_ready = false;
                        continue;
                    }
                }
            }

            contributions.push(data);
        }

        let quorum = expected_pods.map_or(true, |expected| active_pods >= expected);
        if !quorum {
            debug!(
                active_pods,
                expected_pods = ?expected_pods,
                "Scope has fewer active pods than expected"
            );
        }

        if all_ready && quorum && !contributions.is_empty() {
            Readiness {
                status: RanktableStatus::Completed,
                contributions,
                active_pods,
            }
        } else {
            Readiness {
                status: RanktableStatus::Initializing,
                contributions: Vec::new(),
                active_pods,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use k8s_openapi::api::core::v1::PodStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::domain::ranktable::JinjaEngine;
    use crate::domain::ranktable::RanktableLevel;
    use crate::domain::ranktable::POD_RANKTABLE_ANNOTATION;

    const PARSER: &str = r#"{% set d = annotation | fromJson %}
podName: {{ d.pod_name | quote }}
serverId: {{ d.server_id | quote }}
devices:
{% for x in d.devices %}
  - deviceId: {{ x.device_id | quote }}
    deviceIp: {{ x.device_ip | quote }}
{% endfor %}
"#;

    fn template(source: ServerIdSource) -> RanktableTemplate {
        RanktableTemplate {
            inference_engine: "mindie".to_string(),
            level: RanktableLevel::Role,
            pod_parser_template: PARSER.to_string(),
            ranktable_template: String::new(),
            mount_path: "/user/serverid/devindex/config".to_string(),
            filename: "hccl.json".to_string(),
            pod_annotation_name: POD_RANKTABLE_ANNOTATION.to_string(),
            server_id_source: source,
        }
    }

    fn pod(name: &str, phase: &str, annotation: Option<&str>) -> Pod {
        let annotations = annotation.map(|a| {
            BTreeMap::from([(POD_RANKTABLE_ANNOTATION.to_string(), a.to_string())])
        });
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                annotations,
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                pod_ip: Some(format!("10.0.0.{}", name.len())),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn annotated(name: &str, server: &str) -> Pod {
        let annotation = format!(
            r#"{{"pod_name":"{name}","server_id":"{server}","devices":[{{"device_id":"0","device_ip":"1.1.1.1"}}]}}"#
        );
        pod(name, "Running", Some(&annotation))
    }

    fn deleting(mut pod: Pod) -> Pod {
        pod.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        pod
    }

    fn evaluate(source: ServerIdSource, pods: &[Pod], expected: Option<usize>) -> Readiness {
        let parser = PodParser::new(Arc::new(JinjaEngine::new()));
        let template = template(source);
        ReadinessEvaluator::new(&parser, &template).evaluate(pods, expected)
    }

    #[test]
    fn all_running_and_parsed_is_completed() {
        let pods = [annotated("a", "s1"), annotated("b", "s2")];
        let readiness = evaluate(ServerIdSource::Annotation, &pods, Some(2));

        assert_eq!(readiness.status, RanktableStatus::Completed);
        assert_eq!(readiness.contributions.len(), 2);
        assert_eq!(readiness.active_pods, 2);
    }

    #[test]
    fn quorum_not_met_with_two_of_three() {
        let pods = [
            annotated("a", "s1"),
            annotated("b", "s2"),
            pod("c", "Pending", None),
        ];
        let readiness = evaluate(ServerIdSource::Annotation, &pods, Some(3));

        assert_eq!(readiness.status, RanktableStatus::Initializing);
        assert!(readiness.contributions.is_empty());
    }

    #[test]
    fn deleting_pod_is_excluded_from_both_checks() {
        let pods = [
            annotated("a", "s1"),
            annotated("b", "s2"),
            deleting(pod("c", "Failed", None)),
        ];

        let relaxed = evaluate(ServerIdSource::Annotation, &pods, Some(2));
        assert_eq!(relaxed.status, RanktableStatus::Completed);
        assert_eq!(relaxed.active_pods, 2);

        let strict = evaluate(ServerIdSource::Annotation, &pods, Some(3));
        assert_eq!(strict.status, RanktableStatus::Initializing);
    }

    #[test]
    fn unparseable_annotation_forces_initializing() {
        let pods = [annotated("a", "s1"), pod("b", "Running", Some("invalid json"))];
        let readiness = evaluate(ServerIdSource::Annotation, &pods, None);

        assert_eq!(readiness.status, RanktableStatus::Initializing);
        assert!(readiness.contributions.is_empty());
    }

    #[test]
    fn missing_annotation_forces_initializing() {
        let pods = [annotated("a", "s1"), pod("b", "Running", None)];
        let readiness = evaluate(ServerIdSource::Annotation, &pods, None);
        assert_eq!(readiness.status, RanktableStatus::Initializing);
    }

    #[test]
    fn no_pods_is_initializing() {
        let readiness = evaluate(ServerIdSource::Annotation, &[], None);
        assert_eq!(readiness.status, RanktableStatus::Initializing);
        assert_eq!(readiness.active_pods, 0);
    }

    #[test]
    fn pod_ip_replaces_server_id() {
        let pods = [annotated("abc", "ignored")];
        let readiness = evaluate(ServerIdSource::PodIp, &pods, None);

        assert_eq!(readiness.status, RanktableStatus::Completed);
        assert_eq!(readiness.contributions[0].server_id, "10.0.0.3");
    }

    #[test]
    fn pod_ip_source_waits_for_ip() {
        let mut no_ip = annotated("a", "s1");
        if let Some(status) = no_ip.status.as_mut() {
            status.pod_ip = None;
        }
        let readiness = evaluate(ServerIdSource::PodIp, &[no_ip], None);
        assert_eq!(readiness.status, RanktableStatus::Initializing);
    }
}
