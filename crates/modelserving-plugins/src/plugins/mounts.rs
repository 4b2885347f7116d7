//! Pod volume injection

use k8s_openapi::api::core::v1::ConfigMapVolumeSource;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::Volume;
use k8s_openapi::api::core::v1::VolumeMount;

/// A ConfigMap mounted read-only into every container of a pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigMapMount<'a> {
    pub volume_name: &'a str,
    pub config_map_name: &'a str,
    pub mount_path: &'a str,
    /// Let the pod start before the ConfigMap exists
    pub optional: bool,
}

impl ConfigMapMount<'_> {
    fn volume(&self) -> Volume {
        Volume {
            name: self.volume_name.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: Some(self.config_map_name.to_string()),
                optional: self.optional.then_some(true),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn volume_mount(&self) -> VolumeMount {
        VolumeMount {
            name: self.volume_name.to_string(),
            mount_path: self.mount_path.to_string(),
            read_only: Some(true),
            ..Default::default()
        }
    }

    /// Add the volume and mount it into all containers and init containers.
    /// Names already present are left untouched, so repeated calls are no-ops.
    pub fn inject(&self, pod: &mut Pod) {
        let spec = pod.spec.get_or_insert_with(Default::default);

        let volumes = spec.volumes.get_or_insert_with(Vec::new);
        if !volumes.iter().any(|v| v.name == self.volume_name) {
            volumes.push(self.volume());
        }

        let init_containers = spec.init_containers.iter_mut().flatten();
        for container in spec.containers.iter_mut().chain(init_containers) {
            let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
            if !mounts.iter().any(|m| m.name == self.volume_name) {
                mounts.push(self.volume_mount());
            }
        }
    }
}
