use std::fmt;
use std::path::Path;

use anyhow::Context;
use faasgrid_backends::{ErrorKind, ServerlessBackend};
use faasgrid_cluster::ClusterApi;
use faasgrid_core::{GlobalConfig, ServiceDescriptor};
use faasgrid_prefetch::{ImagePrefetcher, PrefetchRequest};
use tracing::info;

/// What `apply` ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Created,
    Updated,
}

impl fmt::Display for Applied {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Applied::Created => f.write_str("created"),
            Applied::Updated => f.write_str("updated"),
        }
    }
}

pub async fn info<B: ServerlessBackend>(backend: &B) -> anyhow::Result<String> {
    let info = backend.get_info().await?;
    Ok(format!("{} {}", info.name, info.version))
}

/// One line per service: name, image, exposed API port (0 when none).
pub async fn list<B: ServerlessBackend>(backend: &B) -> anyhow::Result<String> {
    let services = backend.list_services().await?;
    let lines: Vec<String> = services
        .iter()
        .map(|s| format!("{}\t{}\t{}", s.name, s.image, s.expose.api_port))
        .collect();
    Ok(lines.join("\n"))
}

pub async fn get<B: ServerlessBackend>(backend: &B, name: &str) -> anyhow::Result<String> {
    let service = backend.read_service(name).await?;
    Ok(serde_json::to_string_pretty(&service)?)
}

pub fn parse_descriptor(yaml: &str, script: Option<String>) -> anyhow::Result<ServiceDescriptor> {
    let mut service = ServiceDescriptor::from_yaml(yaml).context("invalid service descriptor")?;
    if let Some(script) = script {
        service.script = script;
    }
    Ok(service)
}

pub fn load_descriptor(path: &Path, script: Option<&Path>) -> anyhow::Result<ServiceDescriptor> {
    let yaml = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let script = script
        .map(|p| {
            std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))
        })
        .transpose()?;
    parse_descriptor(&yaml, script)
}

/// Update `service` if the backend already knows it, create it otherwise.
pub async fn apply<B: ServerlessBackend>(
    backend: &B,
    service: &ServiceDescriptor,
) -> anyhow::Result<Applied> {
    match backend.read_service(&service.name).await {
        Ok(_) => {
            backend.update_service(service).await?;
            info!(service = %service.name, "service updated");
            Ok(Applied::Updated)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            backend.create_service(service).await?;
            info!(service = %service.name, "service created");
            Ok(Applied::Created)
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn delete<B: ServerlessBackend>(backend: &B, name: &str) -> anyhow::Result<String> {
    backend.delete_service(name).await?;
    Ok(format!("deleted {name}"))
}

pub async fn prefetch<C: ClusterApi>(
    cluster: C,
    config: &GlobalConfig,
    image: String,
    image_pull_secrets: Vec<String>,
) -> anyhow::Result<String> {
    let prefetcher = ImagePrefetcher::new(
        cluster,
        config.services_namespace.clone(),
        config.prefetch_timeout(),
    );
    let report = prefetcher
        .prefetch(PrefetchRequest {
            service: "cli".to_string(),
            image,
            image_pull_secrets,
        })
        .await?;
    Ok(format!(
        "{} present on {} node(s) after {:?}",
        report.image, report.nodes, report.elapsed
    ))
}
