//! Main container and pod assembly.

use std::collections::BTreeMap;

use faasgrid_core::constants::container;
use faasgrid_core::{GlobalConfig, SchedulingMode, ServiceDescriptor};
use k8s_openapi::api::core::v1::{
    Capabilities, ConfigMapVolumeSource, Container, EnvVar, EnvVarSource, LocalObjectReference,
    PersistentVolumeClaimVolumeSource, PodSpec, ResourceRequirements, SecretKeySelector,
    SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use tracing::trace;

use crate::error::{CompileError, CompileResult};
use crate::{mount, offload};

/// Compile `service` into a pod spec.
///
/// Fails without producing anything if a quantity or a mount binding is
/// invalid. The normal and offload scheduling branches are exclusive.
pub fn compile(service: &ServiceDescriptor, config: &GlobalConfig) -> CompileResult<PodSpec> {
    let resources = resources(service)?;
    let mount_plan = service
        .mount
        .as_ref()
        .map(|binding| mount::resolve(binding, service, config))
        .transpose()?;

    let mode = service.scheduling_mode();
    let fprocess = match mode {
        SchedulingMode::Normal => service.supervisor_path(),
        SchedulingMode::Offload { .. } => offload::supervisor_path(),
    };

    let mut env = user_env(service);
    if let Some(plan) = &mount_plan {
        env.extend(plan.credentials.iter().cloned());
    }
    env.extend(watchdog_env(&fprocess, config));

    let mut main = Container {
        name: container::NAME.to_string(),
        image: Some(service.image.clone()),
        env: Some(env),
        resources: Some(resources),
        security_context: Some(security_context()),
        volume_mounts: Some(vec![VolumeMount {
            name: container::CONFIG_VOLUME.to_string(),
            mount_path: container::CONFIG_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        }]),
        ..Default::default()
    };

    let mut spec = PodSpec {
        image_pull_secrets: pull_secrets(service),
        volumes: Some(vec![Volume {
            name: container::CONFIG_VOLUME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: service.name.clone(),
                ..Default::default()
            }),
            ..Default::default()
        }]),
        ..Default::default()
    };

    match mode {
        SchedulingMode::Normal => normal_branch(&mut spec, &mut main, config),
        SchedulingMode::Offload { node } => offload::apply(&mut spec, &mut main, node, config),
    }
    spec.containers.push(main);

    if let Some(plan) = mount_plan {
        mount::attach(&mut spec, plan);
    }

    trace!(service = %service.name, containers = spec.containers.len(), "compiled pod spec");
    Ok(spec)
}

/// Bin volume from the shared claim, watchdog as entrypoint.
fn normal_branch(spec: &mut PodSpec, main: &mut Container, config: &GlobalConfig) {
    spec.volumes.get_or_insert_with(Vec::new).push(Volume {
        name: container::BIN_VOLUME.to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: config.supervisor_pvc.clone(),
            ..Default::default()
        }),
        ..Default::default()
    });
    main.volume_mounts.get_or_insert_with(Vec::new).push(VolumeMount {
        name: container::BIN_VOLUME.to_string(),
        mount_path: container::BIN_PATH.to_string(),
        read_only: Some(true),
        ..Default::default()
    });
    main.command = Some(vec![format!("{}/{}", container::BIN_PATH, container::WATCHDOG)]);
}

fn resources(service: &ServiceDescriptor) -> CompileResult<ResourceRequirements> {
    let cpu = service
        .cpu_quantity()
        .map_err(|e| CompileError::invalid("cpu", e))?;
    let memory = service
        .memory_quantity()
        .map_err(|e| CompileError::invalid("memory", e))?;

    let mut limits = BTreeMap::from([
        ("cpu".to_string(), Quantity(cpu.as_str().to_string())),
        ("memory".to_string(), Quantity(memory.as_str().to_string())),
    ]);
    if service.enable_gpu {
        limits.insert(container::GPU_RESOURCE.to_string(), Quantity("1".to_string()));
    }
    if service.enable_sgx {
        limits.insert(container::SGX_RESOURCE.to_string(), Quantity("1".to_string()));
    }

    Ok(ResourceRequirements {
        limits: Some(limits),
        ..Default::default()
    })
}

/// Plain variables followed by secret references.
fn user_env(service: &ServiceDescriptor) -> Vec<EnvVar> {
    let plain = service.environment.variables.iter().map(|(name, value)| EnvVar {
        name: name.clone(),
        value: Some(value.clone()),
        ..Default::default()
    });
    let secrets = service
        .environment
        .secrets
        .iter()
        .map(|(name, reference)| EnvVar {
            name: name.clone(),
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: reference.secret.clone(),
                    key: reference.key.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        });
    plain.chain(secrets).collect()
}

fn watchdog_env(fprocess: &str, config: &GlobalConfig) -> Vec<EnvVar> {
    let watchdog = &config.watchdog;
    [
        (container::WATCHDOG_PROCESS, fprocess.to_string()),
        ("max_inflight", watchdog.max_inflight.to_string()),
        ("write_debug", watchdog.write_debug.to_string()),
        ("exec_timeout", watchdog.exec_timeout.to_string()),
        ("read_timeout", watchdog.read_timeout.to_string()),
        ("write_timeout", watchdog.write_timeout.to_string()),
        ("healthcheck_interval", watchdog.healthcheck_interval.to_string()),
    ]
    .into_iter()
    .map(|(name, value)| EnvVar {
        name: name.to_string(),
        value: Some(value),
        ..Default::default()
    })
    .collect()
}

/// Only raw I/O is added; nothing else is granted.
fn security_context() -> SecurityContext {
    SecurityContext {
        capabilities: Some(Capabilities {
            add: Some(vec![container::RAW_IO_CAPABILITY.to_string()]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn pull_secrets(service: &ServiceDescriptor) -> Option<Vec<LocalObjectReference>> {
    if service.image_pull_secrets.is_empty() {
        return None;
    }
    Some(
        service
            .image_pull_secrets
            .iter()
            .map(|name| LocalObjectReference { name: name.clone() })
            .collect(),
    )
}
