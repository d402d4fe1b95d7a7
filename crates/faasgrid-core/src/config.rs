//! faasgrid.toml configuration parser.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working configuration for the native Kubernetes backend.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreResult;
use crate::types::MinioProvider;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Cluster name, also the owner id of default credentials.
    pub name: String,
    /// Namespace of the control plane itself.
    pub namespace: String,
    /// Namespace where services, records and prefetch sessions live.
    pub services_namespace: String,
    /// `kubernetes`, `knative`, `openfaas` or `fake`.
    pub serverless_backend: String,
    /// Image shipping the supervisor for offloaded pods.
    pub supervisor_kit_image: String,
    /// Claim holding the watchdog and supervisor binaries.
    pub supervisor_pvc: String,
    pub watchdog: WatchdogConfig,
    pub openfaas: OpenFaasConfig,
    /// Provider used for `minio.default` bindings.
    pub minio: MinioProvider,
    /// Empty means every image is allowed.
    pub allowed_image_prefixes: Vec<String>,
    pub prefetch_timeout_secs: u64,
    pub api_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub max_inflight: u32,
    pub write_debug: bool,
    pub exec_timeout: u32,
    pub read_timeout: u32,
    pub write_timeout: u32,
    pub healthcheck_interval: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenFaasConfig {
    pub namespace: String,
    pub port: u16,
    /// How long to wait for the operator to materialize a Deployment.
    pub deployment_timeout_secs: u64,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            name: "faasgrid".to_string(),
            namespace: "faasgrid".to_string(),
            services_namespace: "faasgrid-svc".to_string(),
            serverless_backend: String::new(),
            supervisor_kit_image: "ghcr.io/grycap/supervisor-kit:latest".to_string(),
            supervisor_pvc: "faasgrid-pvc".to_string(),
            watchdog: WatchdogConfig::default(),
            openfaas: OpenFaasConfig::default(),
            minio: MinioProvider::default(),
            allowed_image_prefixes: Vec::new(),
            prefetch_timeout_secs: 600,
            api_timeout_secs: 30,
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            max_inflight: 1,
            write_debug: true,
            exec_timeout: 0,
            read_timeout: 300,
            write_timeout: 300,
            healthcheck_interval: 5,
        }
    }
}

impl Default for OpenFaasConfig {
    fn default() -> Self {
        Self {
            namespace: "openfaas".to_string(),
            port: 8080,
            deployment_timeout_secs: 30,
        }
    }
}

impl GlobalConfig {
    pub fn from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> CoreResult<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn prefetch_timeout(&self) -> Duration {
        Duration::from_secs(self.prefetch_timeout_secs)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    pub fn openfaas_deployment_timeout(&self) -> Duration {
        Duration::from_secs(self.openfaas.deployment_timeout_secs)
    }

    /// Gateway address used for OpenFaaS function invocations.
    pub fn openfaas_gateway(&self) -> String {
        format!("gateway.{}:{}", self.openfaas.namespace, self.openfaas.port)
    }

    /// Whether `image` passes the allowed-prefix filter.
    ///
    /// Entries must match at the start of the image reference; an entry
    /// appearing elsewhere in the reference does not admit it.
    pub fn is_image_allowed(&self, image: &str) -> bool {
        self.allowed_image_prefixes.is_empty()
            || self
                .allowed_image_prefixes
                .iter()
                .any(|prefix| image.starts_with(prefix.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_is_default() {
        let cfg = GlobalConfig::from_toml("").unwrap();
        assert_eq!(cfg, GlobalConfig::default());
        assert_eq!(cfg.services_namespace, "faasgrid-svc");
        assert_eq!(cfg.watchdog.read_timeout, 300);
    }

    #[test]
    fn partial_sections_merge_with_defaults() {
        let cfg = GlobalConfig::from_toml(
            r#"
serverless_backend = "knative"
allowed_image_prefixes = ["ghcr.io/grycap/"]

[openfaas]
port = 31112

[minio]
access_key = "minio"
secret_key = "minio123"
"#,
        )
        .unwrap();
        assert_eq!(cfg.serverless_backend, "knative");
        assert_eq!(cfg.openfaas.port, 31112);
        assert_eq!(cfg.openfaas.namespace, "openfaas");
        assert_eq!(cfg.minio.access_key, "minio");
        assert_eq!(cfg.minio.region, "us-east-1");
        assert_eq!(cfg.openfaas_gateway(), "gateway.openfaas:31112");
    }

    #[test]
    fn image_prefix_filter() {
        let mut cfg = GlobalConfig::default();
        assert!(cfg.is_image_allowed("anything:latest"));
        cfg.allowed_image_prefixes = vec!["ghcr.io/grycap/".to_string()];
        assert!(cfg.is_image_allowed("ghcr.io/grycap/cowsay"));
        assert!(!cfg.is_image_allowed("docker.io/library/alpine"));
        assert!(!cfg.is_image_allowed("evil.example/ghcr.io/grycap/cowsay"));
    }

    #[test]
    fn rejects_wrong_types() {
        assert!(GlobalConfig::from_toml("prefetch_timeout_secs = \"soon\"").is_err());
    }
}
