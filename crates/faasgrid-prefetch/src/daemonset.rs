//! The throwaway image-puller DaemonSet.

use std::collections::BTreeMap;

use faasgrid_core::constants::{CONTROL_PLANE_LABELS, RESOURCE_LABEL};
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::{
    Affinity, Container, LocalObjectReference, NodeAffinity, NodeSelector,
    NodeSelectorRequirement, NodeSelectorTerm, PodSpec, PodTemplateSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use rand::Rng;

use crate::session::PrefetchRequest;

/// Label scoping a session's pods.
pub const POD_GROUP_LABEL: &str = "pod-group";

/// Value of [`RESOURCE_LABEL`] on puller pods.
pub const RESOURCE_VALUE: &str = "image-puller";

const TOKEN_LEN: usize = 5;

/// Selector matching every eligible (non control-plane) node.
pub fn worker_selector() -> String {
    CONTROL_PLANE_LABELS
        .iter()
        .map(|label| format!("!{label}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Random lowercase suffix, `pod-group-xxxxx` style.
pub fn random_suffix() -> String {
    let mut rng = rand::thread_rng();
    (0..TOKEN_LEN)
        .map(|_| char::from(rng.gen_range(b'a'..=b'z')))
        .collect()
}

pub fn pod_group_selector(pod_group: &str) -> String {
    format!("{POD_GROUP_LABEL}={pod_group}")
}

/// DaemonSet whose pods do nothing but run `request.image`; scheduling one
/// per node is what forces the pull.
pub fn image_puller(name: &str, pod_group: &str, request: &PrefetchRequest) -> DaemonSet {
    let labels = BTreeMap::from([
        (RESOURCE_LABEL.to_string(), RESOURCE_VALUE.to_string()),
        (POD_GROUP_LABEL.to_string(), pod_group.to_string()),
    ]);

    let avoid_control_plane = NodeSelectorTerm {
        match_expressions: Some(
            CONTROL_PLANE_LABELS
                .iter()
                .map(|label| NodeSelectorRequirement {
                    key: label.to_string(),
                    operator: "DoesNotExist".to_string(),
                    values: None,
                })
                .collect(),
        ),
        ..Default::default()
    };

    let pull_secrets = (!request.image_pull_secrets.is_empty()).then(|| {
        request
            .image_pull_secrets
            .iter()
            .map(|name| LocalObjectReference { name: name.clone() })
            .collect()
    });

    DaemonSet {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    affinity: Some(Affinity {
                        node_affinity: Some(NodeAffinity {
                            required_during_scheduling_ignored_during_execution: Some(
                                NodeSelector {
                                    node_selector_terms: vec![avoid_control_plane],
                                },
                            ),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    image_pull_secrets: pull_secrets,
                    containers: vec![Container {
                        name: RESOURCE_VALUE.to_string(),
                        image: Some(request.image.clone()),
                        command: Some(vec![
                            "/bin/sh".to_string(),
                            "-c".to_string(),
                            "sleep 1h".to_string(),
                        ]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffixes_are_lowercase_and_vary() {
        let a = random_suffix();
        assert_eq!(a.len(), TOKEN_LEN);
        assert!(a.chars().all(|c| c.is_ascii_lowercase()));
        let distinct: std::collections::HashSet<_> = (0..20).map(|_| random_suffix()).collect();
        assert!(distinct.len() > 1);
    }

    #[test]
    fn worker_selector_excludes_control_plane() {
        assert_eq!(
            worker_selector(),
            "!node-role.kubernetes.io/control-plane,!node-role.kubernetes.io/master"
        );
    }

    #[test]
    fn puller_pods_carry_the_pod_group() {
        let request = PrefetchRequest {
            service: "s1".to_string(),
            image: "ghcr.io/grycap/cowsay".to_string(),
            image_pull_secrets: vec!["regcred".to_string()],
        };
        let ds = image_puller("image-puller-s1-abcde", "pod-group-abcde", &request);
        let spec = ds.spec.unwrap();
        let template_labels = spec.template.metadata.unwrap().labels.unwrap();
        assert_eq!(template_labels[POD_GROUP_LABEL], "pod-group-abcde");
        assert_eq!(spec.selector.match_labels.unwrap(), template_labels);

        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.containers[0].image.as_deref(), Some("ghcr.io/grycap/cowsay"));
        assert_eq!(pod.image_pull_secrets.unwrap()[0].name, "regcred");
        let terms = pod
            .affinity
            .unwrap()
            .node_affinity
            .unwrap()
            .required_during_scheduling_ignored_during_execution
            .unwrap()
            .node_selector_terms;
        assert_eq!(terms[0].match_expressions.as_ref().unwrap().len(), 2);
    }
}
