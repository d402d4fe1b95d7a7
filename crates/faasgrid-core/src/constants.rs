//! Names shared between the compiler, the drivers, and the prefetch engine.

/// Label carried by every resource that belongs to a service. Its value is
/// the service name.
pub const SERVICE_LABEL: &str = "faasgrid_service";

/// Label marking resources created by faasgrid itself (not user workloads).
pub const RESOURCE_LABEL: &str = "faasgrid-resource";

/// Metadata Record key holding the serialized descriptor.
pub const DESCRIPTOR_KEY: &str = "function_config.yaml";

/// Metadata Record key holding the entrypoint script.
pub const SCRIPT_KEY: &str = "script.sh";

pub mod container {
    //! Main container layout.

    /// Name of the main container in every compiled pod spec.
    pub const NAME: &str = "faasgrid-container";

    /// Volume holding the supervisor binaries (normal scheduling).
    pub const BIN_VOLUME: &str = "faasgrid-bin";

    /// Mount path of [`BIN_VOLUME`].
    pub const BIN_PATH: &str = "/faasgrid/bin";

    /// Subdirectory of [`BIN_PATH`] with musl builds of the supervisor.
    pub const ALPINE_DIR: &str = "alpine";

    /// Volume projecting the Metadata Record (script + descriptor).
    pub const CONFIG_VOLUME: &str = "faasgrid-config";

    /// Mount path of [`CONFIG_VOLUME`].
    pub const CONFIG_PATH: &str = "/faasgrid/config";

    /// Watchdog binary fronting the supervisor.
    pub const WATCHDOG: &str = "fwatchdog";

    /// Environment variable telling the watchdog which process to fork.
    pub const WATCHDOG_PROCESS: &str = "fprocess";

    /// Supervisor binary name.
    pub const SUPERVISOR: &str = "supervisor";

    /// Environment variable carrying the (base64) invocation event.
    pub const EVENT_VARIABLE: &str = "EVENT";

    /// The only capability granted to the main container.
    pub const RAW_IO_CAPABILITY: &str = "SYS_RAWIO";

    pub const GPU_RESOURCE: &str = "nvidia.com/gpu";

    pub const SGX_RESOURCE: &str = "sgx.k8s.io/sgx";
}

pub mod offload {
    //! Remote/virtual node execution.

    /// Init container staging the supervisor into [`SHARE_VOLUME`].
    pub const INIT_CONTAINER: &str = "supervisor-container";

    pub const SHARE_VOLUME: &str = "supervisor-share-data";

    pub const SHARE_PATH: &str = "/data";

    pub const NODE_SELECTOR_KEY: &str = "kubernetes.io/hostname";

    pub const DNS_POLICY: &str = "ClusterFirst";

    pub const RESTART_POLICY: &str = "OnFailure";

    pub const TOLERATION_KEY: &str = "virtual-node.interlink/no-schedule";

    pub const TOLERATION_OPERATOR: &str = "Exists";
}

pub mod mount {
    //! Bucket mount sidecar.

    pub const SIDECAR_NAME: &str = "rclone-container";

    pub const SIDECAR_IMAGE: &str = "rclone/rclone";

    pub const SHARED_VOLUME: &str = "shared-data";

    pub const SHARED_PATH: &str = "/mnt";

    pub const EPHEMERAL_VOLUME: &str = "ephemeral-data";

    pub const EPHEMERAL_PATH: &str = "/tmpfolder";
}

pub mod knative {
    pub const VISIBILITY_LABEL: &str = "networking.knative.dev/visibility";

    pub const CLUSTER_LOCAL: &str = "cluster-local";

    pub const MIN_SCALE_ANNOTATION: &str = "autoscaling.knative.dev/min-scale";

    pub const MAX_SCALE_ANNOTATION: &str = "autoscaling.knative.dev/max-scale";
}

pub mod openfaas {
    pub const ZERO_SCALE_LABEL: &str = "com.openfaas.scale.zero";
}

pub mod expose {
    //! Long-running HTTP exposure on the native Kubernetes backend.

    /// Selector label shared by the exposed Deployment and its Service.
    pub const APP_LABEL: &str = "app";

    pub const APP_PREFIX: &str = "faasgrid-svc-exp-";

    pub const POD_PORT_NAME: &str = "podport";

    pub const SERVICE_PORT_NAME: &str = "serviceport";

    pub const SERVICE_PORT: i32 = 80;

    /// Mode of the projected config volume, so the script is executable.
    pub const SCRIPT_MODE: i32 = 0o777;
}

/// Node labels identifying control-plane nodes.
pub const CONTROL_PLANE_LABELS: [&str; 2] = [
    "node-role.kubernetes.io/control-plane",
    "node-role.kubernetes.io/master",
];
