//! Scheduling onto a remote/virtual node.
//!
//! The remote runtime cannot mount the bin claim, so an init container
//! copies the supervisor into a shared emptyDir and the main container
//! pipes the decoded event into it.

use std::collections::BTreeMap;

use faasgrid_core::GlobalConfig;
use faasgrid_core::constants::{container, offload};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, PodSpec, Toleration, Volume, VolumeMount,
};

/// Supervisor location once staged by the init container.
pub fn supervisor_path() -> String {
    format!("{}/{}", offload::SHARE_PATH, container::SUPERVISOR)
}

pub(crate) fn apply(spec: &mut PodSpec, main: &mut Container, node: &str, config: &GlobalConfig) {
    spec.node_selector = Some(BTreeMap::from([(
        offload::NODE_SELECTOR_KEY.to_string(),
        node.to_string(),
    )]));
    spec.dns_policy = Some(offload::DNS_POLICY.to_string());
    spec.restart_policy = Some(offload::RESTART_POLICY.to_string());
    spec.tolerations = Some(vec![Toleration {
        key: Some(offload::TOLERATION_KEY.to_string()),
        operator: Some(offload::TOLERATION_OPERATOR.to_string()),
        ..Default::default()
    }]);

    let share_mount = VolumeMount {
        name: offload::SHARE_VOLUME.to_string(),
        mount_path: offload::SHARE_PATH.to_string(),
        ..Default::default()
    };
    spec.init_containers = Some(vec![Container {
        name: offload::INIT_CONTAINER.to_string(),
        image: Some(config.supervisor_kit_image.clone()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(vec!["/bin/sh".to_string(), "-c".to_string()]),
        args: Some(vec![format!("cp -r /supervisor/* {}", offload::SHARE_PATH)]),
        volume_mounts: Some(vec![share_mount.clone()]),
        ..Default::default()
    }]);
    spec.volumes.get_or_insert_with(Vec::new).push(Volume {
        name: offload::SHARE_VOLUME.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    });

    main.image_pull_policy = Some("Always".to_string());
    main.volume_mounts.get_or_insert_with(Vec::new).push(share_mount);
    main.command = Some(vec!["/bin/sh".to_string(), "-c".to_string()]);
    main.args = Some(vec![format!(
        "echo ${} | base64 -d | {}",
        container::EVENT_VARIABLE,
        supervisor_path()
    )]);
}

#[cfg(test)]
mod tests {
    use crate::compile;
    use faasgrid_core::{GlobalConfig, ServiceDescriptor};

    fn offloaded() -> ServiceDescriptor {
        ServiceDescriptor {
            name: "s1".to_string(),
            image: "alpine".to_string(),
            offload_node: Some("vk-node".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn pins_pod_to_the_virtual_node() {
        let spec = compile(&offloaded(), &GlobalConfig::default()).unwrap();
        assert_eq!(
            spec.node_selector.as_ref().unwrap()["kubernetes.io/hostname"],
            "vk-node"
        );
        assert_eq!(spec.dns_policy.as_deref(), Some("ClusterFirst"));
        assert_eq!(spec.restart_policy.as_deref(), Some("OnFailure"));
        let toleration = &spec.tolerations.as_ref().unwrap()[0];
        assert_eq!(
            toleration.key.as_deref(),
            Some("virtual-node.interlink/no-schedule")
        );
        assert_eq!(toleration.operator.as_deref(), Some("Exists"));
    }

    #[test]
    fn stages_supervisor_instead_of_mounting_the_claim() {
        let cfg = GlobalConfig::default();
        let spec = compile(&offloaded(), &cfg).unwrap();

        let init = &spec.init_containers.as_ref().unwrap()[0];
        assert_eq!(init.image.as_deref(), Some(cfg.supervisor_kit_image.as_str()));
        assert_eq!(init.args.as_ref().unwrap()[0], "cp -r /supervisor/* /data");

        let volumes = spec.volumes.as_ref().unwrap();
        assert!(volumes.iter().all(|v| v.persistent_volume_claim.is_none()));
        assert!(volumes.iter().any(|v| v.name == "supervisor-share-data"));

        let main = &spec.containers[0];
        assert_eq!(
            main.args.as_ref().unwrap()[0],
            "echo $EVENT | base64 -d | /data/supervisor"
        );
        let fprocess = main
            .env
            .as_ref()
            .unwrap()
            .iter()
            .find(|e| e.name == "fprocess")
            .and_then(|e| e.value.clone());
        assert_eq!(fprocess.as_deref(), Some("/data/supervisor"));
    }
}
