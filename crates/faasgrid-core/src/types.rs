//! Service Descriptor: the backend-agnostic definition of a function.
//!
//! Descriptors are (de)serialized as YAML for the Metadata Record and for
//! descriptor files fed to the CLI. Every optional field has a serde default
//! so that minimal descriptors stay minimal.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::constants::container;
use crate::error::{CoreError, CoreResult};
use crate::quantity::ResourceQuantity;

/// Default CPU limit applied when a descriptor leaves it empty.
pub const DEFAULT_CPU: &str = "0.2";

/// Default memory limit applied when a descriptor leaves it empty.
pub const DEFAULT_MEMORY: &str = "256Mi";

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]{0,37}[a-z0-9])?$").expect("valid regex"));

/// Declarative definition of a deployable function.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceDescriptor {
    /// Unique within the services namespace; immutable after creation.
    pub name: String,
    pub owner: Option<String>,
    pub cluster_id: String,

    pub image: String,
    /// Entrypoint script. Stored beside the descriptor, never inside it.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub script: String,
    pub cpu: String,
    pub memory: String,
    pub alpine: bool,
    pub enable_gpu: bool,
    pub enable_sgx: bool,
    pub image_prefetch: bool,
    pub log_level: String,

    pub synchronous: SynchronousSettings,
    pub expose: ExposeSettings,
    pub async_only: bool,

    pub environment: Environment,

    pub input: Vec<StorageIoConfig>,
    pub output: Vec<StorageIoConfig>,
    pub mount: Option<MountConfig>,
    pub storage_providers: StorageProviders,

    pub image_pull_secrets: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    /// Remote/virtual node that runs this service instead of a cluster worker.
    pub offload_node: Option<String>,

    /// Delegation targets, carried but not acted upon here.
    pub replicas: Vec<Replica>,
}

/// Replica bounds for synchronous invocations on scale-to-zero backends.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SynchronousSettings {
    pub min_scale: u32,
    /// 0 means unbounded.
    pub max_scale: u32,
}

/// Long-running HTTP exposure of a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExposeSettings {
    pub min_scale: u32,
    pub max_scale: u32,
    /// Target average CPU utilisation (percent) for the autoscaler.
    pub cpu_threshold: u32,
    /// 0 disables exposure.
    pub api_port: u16,
    pub health_path: String,
}

impl Default for ExposeSettings {
    fn default() -> Self {
        Self {
            min_scale: 1,
            max_scale: 10,
            cpu_threshold: 80,
            api_port: 0,
            health_path: "/".to_string(),
        }
    }
}

/// User-defined environment.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Environment {
    pub variables: BTreeMap<String, String>,
    /// Variable name → key of an existing Kubernetes Secret.
    pub secrets: BTreeMap<String, SecretKeyRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretKeyRef {
    pub secret: String,
    pub key: String,
}

/// An input or output storage binding.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageIoConfig {
    /// `<kind>.<id>`, e.g. `minio.default`.
    pub storage_provider: String,
    pub path: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub suffix: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub prefix: Vec<String>,
}

/// Whole-bucket filesystem mount.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    pub storage_provider: String,
    pub path: String,
}

/// Named credential sets per provider kind.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageProviders {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub s3: BTreeMap<String, S3Provider>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub minio: BTreeMap<String, MinioProvider>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub webdav: BTreeMap<String, WebDavProvider>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub onedata: BTreeMap<String, OnedataProvider>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Provider {
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MinioProvider {
    pub endpoint: String,
    pub verify: bool,
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
}

impl Default for MinioProvider {
    fn default() -> Self {
        Self {
            endpoint: "https://minio-service.minio:9000".to_string(),
            verify: true,
            access_key: String::new(),
            secret_key: String::new(),
            region: "us-east-1".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WebDavProvider {
    pub hostname: String,
    pub login: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OnedataProvider {
    pub oneprovider_host: String,
    pub token: String,
    pub space: String,
}

/// Storage provider kinds addressable from a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    S3,
    Minio,
    WebDav,
    Onedata,
}

/// A parsed `<kind>.<id>` provider reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderRef {
    pub kind: ProviderKind,
    pub id: String,
}

impl ProviderRef {
    pub fn parse(reference: &str) -> CoreResult<Self> {
        let (kind, id) = reference
            .split_once('.')
            .ok_or_else(|| CoreError::InvalidProviderRef(reference.to_string()))?;
        let kind = match kind {
            "s3" => ProviderKind::S3,
            "minio" => ProviderKind::Minio,
            "webdav" => ProviderKind::WebDav,
            "onedata" => ProviderKind::Onedata,
            _ => return Err(CoreError::InvalidProviderRef(reference.to_string())),
        };
        if id.is_empty() {
            return Err(CoreError::InvalidProviderRef(reference.to_string()));
        }
        Ok(Self {
            kind,
            id: id.to_string(),
        })
    }
}

/// A delegation target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Replica {
    Cluster {
        cluster_id: String,
        service_name: String,
        priority: u32,
    },
    Endpoint {
        url: String,
        priority: u32,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
}

impl Replica {
    pub fn priority(&self) -> u32 {
        match self {
            Replica::Cluster { priority, .. } | Replica::Endpoint { priority, .. } => *priority,
        }
    }
}

/// The two mutually exclusive pod scheduling branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingMode<'a> {
    Normal,
    Offload { node: &'a str },
}

impl ServiceDescriptor {
    /// Validate the name as a DNS label usable for every derived resource.
    pub fn validate_name(&self) -> CoreResult<()> {
        if NAME_RE.is_match(&self.name) {
            Ok(())
        } else {
            Err(CoreError::InvalidName(self.name.clone()))
        }
    }

    /// CPU limit, falling back to [`DEFAULT_CPU`].
    pub fn cpu_quantity(&self) -> CoreResult<ResourceQuantity> {
        ResourceQuantity::parse(non_empty_or(&self.cpu, DEFAULT_CPU))
    }

    /// Memory limit, falling back to [`DEFAULT_MEMORY`].
    pub fn memory_quantity(&self) -> CoreResult<ResourceQuantity> {
        ResourceQuantity::parse(non_empty_or(&self.memory, DEFAULT_MEMORY))
    }

    pub fn scheduling_mode(&self) -> SchedulingMode<'_> {
        match self.offload_node.as_deref() {
            Some(node) if !node.is_empty() => SchedulingMode::Offload { node },
            _ => SchedulingMode::Normal,
        }
    }

    /// Path of the supervisor binary inside the bin volume.
    pub fn supervisor_path(&self) -> String {
        if self.alpine {
            format!(
                "{}/{}/{}",
                container::BIN_PATH,
                container::ALPINE_DIR,
                container::SUPERVISOR
            )
        } else {
            format!("{}/{}", container::BIN_PATH, container::SUPERVISOR)
        }
    }

    /// Whether a long-running HTTP exposure should exist for this service.
    pub fn is_exposed(&self) -> bool {
        self.expose.api_port != 0 && !self.async_only
    }

    /// Replicas ordered by ascending priority (0 first).
    pub fn replicas_by_priority(&self) -> Vec<&Replica> {
        let mut sorted: Vec<&Replica> = self.replicas.iter().collect();
        sorted.sort_by_key(|r| r.priority());
        sorted
    }

    /// Serialize to YAML, leaving the script out.
    pub fn to_yaml(&self) -> CoreResult<String> {
        let mut stripped = self.clone();
        stripped.script.clear();
        serde_yaml::to_string(&stripped).map_err(|e| CoreError::Encode(e.to_string()))
    }

    pub fn from_yaml(yaml: &str) -> CoreResult<Self> {
        serde_yaml::from_str(yaml).map_err(|e| CoreError::Decode(e.to_string()))
    }
}

fn non_empty_or<'a>(value: &'a str, default: &'a str) -> &'a str {
    if value.trim().is_empty() { default } else { value }
}
