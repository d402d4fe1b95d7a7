//! Long-running HTTP exposure for the native Kubernetes backend.
//!
//! An exposed service gets a Deployment running the script behind an HTTP
//! server, a ClusterIP Service in front of it, and a CPU-driven
//! HorizontalPodAutoscaler.

use std::collections::BTreeMap;
use std::future::Future;

use faasgrid_cluster::{ClusterApi, ClusterObject, object_name};
use faasgrid_core::ServiceDescriptor;
use faasgrid_core::constants::{SCRIPT_KEY, container, expose};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::autoscaling::v1::{
    CrossVersionObjectReference, HorizontalPodAutoscaler, HorizontalPodAutoscalerSpec,
};
use k8s_openapi::api::core::v1::{
    ContainerPort, HTTPGetAction, PodSpec, PodTemplateSpec, Probe, Service, ServicePort,
    ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use tracing::{debug, info};

use crate::backend::service_labels;
use crate::error::BackendResult;
use crate::saga::Saga;

pub fn deployment_name(service: &str) -> String {
    format!("{service}-dlp")
}

pub fn service_name(service: &str) -> String {
    format!("{service}-svc")
}

pub fn autoscaler_name(service: &str) -> String {
    format!("{service}-hpa")
}

fn app_selector(service: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(
        expose::APP_LABEL.to_string(),
        format!("{}{service}", expose::APP_PREFIX),
    )])
}

fn probe(path: &str, initial_delay: i32, period: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::String(expose::POD_PORT_NAME.to_string()),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(period),
        timeout_seconds: Some(2),
        ..Default::default()
    }
}

/// Turn a compiled pod spec into one that serves the script over HTTP.
fn serving_template(service: &ServiceDescriptor, mut spec: PodSpec) -> PodTemplateSpec {
    // Deployments only accept the default restart policy.
    spec.restart_policy = None;
    if let Some(main) = spec.containers.first_mut() {
        main.ports = Some(vec![ContainerPort {
            name: Some(expose::POD_PORT_NAME.to_string()),
            container_port: i32::from(service.expose.api_port),
            ..Default::default()
        }]);
        main.command = Some(vec!["/bin/sh".to_string()]);
        main.args = Some(vec![
            "-c".to_string(),
            format!("{}/{SCRIPT_KEY}", container::CONFIG_PATH),
        ]);
        main.liveness_probe = Some(probe(&service.expose.health_path, 30, 10));
        main.readiness_probe = Some(probe(&service.expose.health_path, 10, 5));
    }
    for volume in spec.volumes.iter_mut().flatten() {
        if let Some(config_map) = volume.config_map.as_mut() {
            config_map.default_mode = Some(expose::SCRIPT_MODE);
        }
    }

    let mut labels = service_labels(service);
    labels.extend(app_selector(&service.name));
    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(labels),
            ..Default::default()
        }),
        spec: Some(spec),
    }
}

pub fn deployment(service: &ServiceDescriptor, spec: PodSpec) -> Deployment {
    Deployment {
        metadata: ObjectMeta {
            name: Some(deployment_name(&service.name)),
            labels: Some(service_labels(service)),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(to_i32(service.expose.min_scale)),
            selector: LabelSelector {
                match_labels: Some(app_selector(&service.name)),
                ..Default::default()
            },
            template: serving_template(service, spec),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn cluster_service(service: &ServiceDescriptor) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(service_name(&service.name)),
            labels: Some(service_labels(service)),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(app_selector(&service.name)),
            ports: Some(vec![ServicePort {
                name: Some(expose::SERVICE_PORT_NAME.to_string()),
                port: expose::SERVICE_PORT,
                target_port: Some(IntOrString::Int(i32::from(service.expose.api_port))),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn autoscaler(service: &ServiceDescriptor) -> HorizontalPodAutoscaler {
    HorizontalPodAutoscaler {
        metadata: ObjectMeta {
            name: Some(autoscaler_name(&service.name)),
            labels: Some(service_labels(service)),
            ..Default::default()
        },
        spec: Some(HorizontalPodAutoscalerSpec {
            scale_target_ref: CrossVersionObjectReference {
                api_version: Some("apps/v1".to_string()),
                kind: "Deployment".to_string(),
                name: deployment_name(&service.name),
            },
            min_replicas: Some(to_i32(service.expose.min_scale)),
            max_replicas: to_i32(service.expose.max_scale),
            target_cpu_utilization_percentage: Some(to_i32(service.expose.cpu_threshold)),
        }),
        ..Default::default()
    }
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

/// Create the three exposure resources, registering a compensation for
/// each one on `saga`.
pub async fn create<C: ClusterApi>(
    cluster: &C,
    namespace: &str,
    service: &ServiceDescriptor,
    spec: &PodSpec,
    saga: &mut Saga,
) -> BackendResult<()> {
    saga.step(cluster.create(namespace, &deployment(service, spec.clone())))
        .await?;
    saga.compensate(
        "delete exposed deployment",
        delete_one::<C, Deployment>(cluster.clone(), namespace.to_string(), deployment_name(&service.name)),
    );

    saga.step(cluster.create(namespace, &cluster_service(service)))
        .await?;
    saga.compensate(
        "delete exposed service",
        delete_one::<C, Service>(cluster.clone(), namespace.to_string(), service_name(&service.name)),
    );

    saga.step(cluster.create(namespace, &autoscaler(service)))
        .await?;
    saga.compensate(
        "delete autoscaler",
        delete_one::<C, HorizontalPodAutoscaler>(
            cluster.clone(),
            namespace.to_string(),
            autoscaler_name(&service.name),
        ),
    );

    info!(service = %service.name, port = service.expose.api_port, "service exposed");
    Ok(())
}

fn delete_one<C: ClusterApi, K: ClusterObject>(
    cluster: C,
    namespace: String,
    name: String,
) -> impl Future<Output = BackendResult<()>> + Send + 'static {
    async move {
        cluster.delete::<K>(&namespace, &name).await?;
        Ok(())
    }
}

/// Bring the exposure in line with `service`: create or replace each
/// resource when exposed, remove them otherwise.
pub async fn update<C: ClusterApi>(
    cluster: &C,
    namespace: &str,
    service: &ServiceDescriptor,
    spec: &PodSpec,
) -> BackendResult<()> {
    if !service.is_exposed() {
        return delete(cluster, namespace, &service.name).await;
    }
    upsert(cluster, namespace, deployment(service, spec.clone())).await?;
    upsert(cluster, namespace, cluster_service(service)).await?;
    upsert(cluster, namespace, autoscaler(service)).await?;
    debug!(service = %service.name, "exposure updated");
    Ok(())
}

async fn upsert<C: ClusterApi, K: ClusterObject>(
    cluster: &C,
    namespace: &str,
    mut object: K,
) -> BackendResult<()> {
    let name = object_name(&object).to_string();
    match cluster.get::<K>(namespace, &name).await {
        Ok(current) => {
            object.meta_mut().resource_version = current.meta().resource_version.clone();
            cluster.replace(namespace, &object).await?;
        }
        Err(e) if e.is_not_found() => {
            cluster.create(namespace, &object).await?;
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// Remove whatever exposure resources exist. Missing ones are fine.
pub async fn delete<C: ClusterApi>(cluster: &C, namespace: &str, name: &str) -> BackendResult<()> {
    let mut first_error = None;
    let results = [
        cluster.delete::<HorizontalPodAutoscaler>(namespace, &autoscaler_name(name)).await,
        cluster.delete::<Service>(namespace, &service_name(name)).await,
        cluster.delete::<Deployment>(namespace, &deployment_name(name)).await,
    ];
    for result in results {
        match result {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }
    match first_error {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faasgrid_core::{ExposeSettings, GlobalConfig};

    fn exposed() -> ServiceDescriptor {
        ServiceDescriptor {
            name: "s1".to_string(),
            image: "nginx".to_string(),
            expose: ExposeSettings {
                api_port: 8080,
                health_path: "/healthz".to_string(),
                min_scale: 2,
                max_scale: 5,
                cpu_threshold: 70,
            },
            ..Default::default()
        }
    }

    fn compiled(service: &ServiceDescriptor) -> PodSpec {
        faasgrid_compiler::compile(service, &GlobalConfig::default()).unwrap()
    }

    #[test]
    fn deployment_serves_the_script() {
        let svc = exposed();
        let deployment = deployment(&svc, compiled(&svc));
        assert_eq!(deployment.metadata.name.as_deref(), Some("s1-dlp"));

        let spec = deployment.spec.unwrap();
        assert_eq!(spec.replicas, Some(2));
        let template_labels = spec.template.metadata.unwrap().labels.unwrap();
        assert_eq!(template_labels["app"], "faasgrid-svc-exp-s1");
        assert_eq!(template_labels["faasgrid_service"], "s1");

        let pod = spec.template.spec.unwrap();
        assert!(pod.restart_policy.is_none());
        let main = &pod.containers[0];
        assert_eq!(main.ports.as_ref().unwrap()[0].container_port, 8080);
        assert_eq!(
            main.args.as_deref(),
            Some(&["-c".to_string(), "/faasgrid/config/script.sh".to_string()][..])
        );
        let readiness = main.readiness_probe.as_ref().unwrap();
        let http_get = readiness.http_get.as_ref().unwrap();
        assert_eq!(http_get.path.as_deref(), Some("/healthz"));
        assert_eq!(http_get.port, IntOrString::String("podport".to_string()));

        let config_volume = pod
            .volumes
            .unwrap()
            .into_iter()
            .find_map(|v| v.config_map)
            .unwrap();
        assert_eq!(config_volume.default_mode, Some(0o777));
    }

    #[test]
    fn service_and_autoscaler_target_the_deployment() {
        let svc = exposed();
        let service = cluster_service(&svc);
        let port = &service.spec.as_ref().unwrap().ports.as_ref().unwrap()[0];
        assert_eq!(port.port, 80);
        assert_eq!(port.target_port, Some(IntOrString::Int(8080)));
        assert_eq!(
            service.spec.unwrap().selector.unwrap()["app"],
            "faasgrid-svc-exp-s1"
        );

        let hpa = autoscaler(&svc).spec.unwrap();
        assert_eq!(hpa.scale_target_ref.name, "s1-dlp");
        assert_eq!(hpa.min_replicas, Some(2));
        assert_eq!(hpa.max_replicas, 5);
        assert_eq!(hpa.target_cpu_utilization_percentage, Some(70));
    }
}
