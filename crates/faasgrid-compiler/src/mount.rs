//! Whole-bucket mounts through an rclone sidecar.
//!
//! The sidecar mounts the bucket under a bidirectionally propagated
//! emptyDir; the main container sees it through host-to-container
//! propagation. The sidecar exits when the main container drops a
//! `finish-file` into the ephemeral volume.

use faasgrid_core::constants::mount;
use faasgrid_core::{GlobalConfig, MountConfig, ProviderKind, ProviderRef, ServiceDescriptor};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, PodSpec, SecurityContext, Volume, VolumeMount,
};

use crate::error::{CompileError, CompileResult};

const FIELD: &str = "mount.storage_provider";

const MINIO_SCRIPT: &str = "mkdir -p $MNT_POINT/$MINIO_BUCKET\n\
rclone config create minio s3 provider=Minio access_key_id=$AWS_ACCESS_KEY_ID \
secret_access_key=$AWS_SECRET_ACCESS_KEY endpoint=$MINIO_ENDPOINT acl=public-read-write\n\
rclone mount minio:/$MINIO_BUCKET $MNT_POINT/$MINIO_BUCKET ";

const S3_SCRIPT: &str = "mkdir -p $MNT_POINT/$S3_BUCKET\n\
rclone config create s3 s3 provider=AWS access_key_id=$AWS_ACCESS_KEY_ID \
secret_access_key=$AWS_SECRET_ACCESS_KEY region=$AWS_REGION\n\
rclone mount s3:/$S3_BUCKET $MNT_POINT/$S3_BUCKET ";

const WEBDAV_SCRIPT: &str = "mkdir -p $MNT_POINT/$WEBDAV_FOLDER\n\
rclone config create dav webdav url=$WEBDAV_HOSTNAME vendor=other user=$WEBDAV_LOGIN pass=$WEBDAV_PASSWORD\n\
rclone mount dav:$WEBDAV_FOLDER $MNT_POINT/$WEBDAV_FOLDER --vfs-cache-mode full ";

const WAIT_SCRIPT: &str = "--dir-cache-time 10s --allow-other --allow-non-empty --umask 0007 --no-checksum &\n\
pid=$!\n\
until [ -f /tmpfolder/finish-file ]; do sleep 5; done\n\
kill $pid";

/// A resolved mount binding.
#[derive(Debug, Clone)]
pub struct MountPlan {
    /// Provider credentials, also injected into the main container.
    pub credentials: Vec<EnvVar>,
    script: &'static str,
}

fn var(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

/// Resolve the provider named by `binding` into credentials and a mount
/// script. `minio.default` falls back to the globally configured MinIO.
pub fn resolve(
    binding: &MountConfig,
    service: &ServiceDescriptor,
    config: &GlobalConfig,
) -> CompileResult<MountPlan> {
    let reference =
        ProviderRef::parse(&binding.storage_provider).map_err(|e| CompileError::invalid(FIELD, e))?;
    let unknown = || {
        CompileError::invalid(
            FIELD,
            format!("no provider named {:?}", binding.storage_provider),
        )
    };
    let providers = &service.storage_providers;

    let (credentials, script) = match reference.kind {
        ProviderKind::Minio => {
            let provider = providers
                .minio
                .get(&reference.id)
                .or((reference.id == "default").then_some(&config.minio))
                .ok_or_else(unknown)?;
            (
                vec![
                    var("MINIO_BUCKET", &binding.path),
                    var("MINIO_ENDPOINT", &provider.endpoint),
                    var("AWS_ACCESS_KEY_ID", &provider.access_key),
                    var("AWS_SECRET_ACCESS_KEY", &provider.secret_key),
                ],
                MINIO_SCRIPT,
            )
        }
        ProviderKind::S3 => {
            let provider = providers.s3.get(&reference.id).ok_or_else(unknown)?;
            (
                vec![
                    var("S3_BUCKET", &binding.path),
                    var("AWS_ACCESS_KEY_ID", &provider.access_key),
                    var("AWS_SECRET_ACCESS_KEY", &provider.secret_key),
                    var("AWS_REGION", &provider.region),
                ],
                S3_SCRIPT,
            )
        }
        ProviderKind::WebDav => {
            let provider = providers.webdav.get(&reference.id).ok_or_else(unknown)?;
            (
                vec![
                    var("WEBDAV_FOLDER", &binding.path),
                    var("WEBDAV_LOGIN", &provider.login),
                    var("WEBDAV_PASSWORD", &provider.password),
                    var("WEBDAV_HOSTNAME", format!("https://{}", provider.hostname)),
                ],
                WEBDAV_SCRIPT,
            )
        }
        ProviderKind::Onedata => {
            return Err(CompileError::invalid(FIELD, "onedata buckets cannot be mounted"));
        }
    };

    Ok(MountPlan {
        credentials,
        script,
    })
}

fn shared_mounts(propagation: &str) -> Vec<VolumeMount> {
    [
        (mount::SHARED_VOLUME, mount::SHARED_PATH),
        (mount::EPHEMERAL_VOLUME, mount::EPHEMERAL_PATH),
    ]
    .into_iter()
    .map(|(name, path)| VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        mount_propagation: Some(propagation.to_string()),
        ..Default::default()
    })
    .collect()
}

/// Add the sidecar and its volumes. Expects the main container at index 0.
pub(crate) fn attach(spec: &mut PodSpec, plan: MountPlan) {
    if let Some(main) = spec.containers.first_mut() {
        main.volume_mounts
            .get_or_insert_with(Vec::new)
            .extend(shared_mounts("HostToContainer"));
    }

    let mut env = vec![var("MNT_POINT", mount::SHARED_PATH)];
    env.extend(plan.credentials);
    spec.containers.push(Container {
        name: mount::SIDECAR_NAME.to_string(),
        image: Some(mount::SIDECAR_IMAGE.to_string()),
        command: Some(vec!["/bin/sh".to_string()]),
        args: Some(vec!["-c".to_string(), format!("{}{}", plan.script, WAIT_SCRIPT)]),
        env: Some(env),
        security_context: Some(SecurityContext {
            privileged: Some(true),
            ..Default::default()
        }),
        volume_mounts: Some(shared_mounts("Bidirectional")),
        ..Default::default()
    });

    let volumes = spec.volumes.get_or_insert_with(Vec::new);
    for name in [mount::SHARED_VOLUME, mount::EPHEMERAL_VOLUME] {
        volumes.push(Volume {
            name: name.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        });
    }
}
