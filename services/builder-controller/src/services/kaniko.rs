use std::collections::BTreeMap;

use async_trait::async_trait;
use builder_core::{
    crds::BuildRequest,
    formatters::{
        BUILD_REQUEST_LABEL, MANAGER, build_labels, format_build_job_name,
        format_context_config_map_name, format_image_destination, format_pull_path,
    },
};
use k8s_openapi::{
    api::{
        batch::v1::{Job, JobSpec, JobStatus},
        core::v1::{
            ConfigMap, ConfigMapVolumeSource, Container, KeyToPath, Pod, PodSpec,
            PodTemplateSpec, SecretVolumeSource, Volume, VolumeMount,
        },
    },
    apimachinery::pkg::apis::meta::v1::OwnerReference,
};
use kube::{
    Api, Client, Resource, ResourceExt,
    api::{DeleteParams, ListParams, ObjectMeta, Patch, PatchParams},
};
use tracing::{error, info, warn};

use crate::{config::BuildConfig, error::AppError, implementations::is_not_found};

const CONTEXT_VOLUME: &str = "build-context";
const CONTEXT_MOUNT: &str = "/workspace";
const CONTEXT_KEY: &str = "Dockerfile";
const DOCKER_CONFIG_VOLUME: &str = "docker-config";
const DOCKER_CONFIG_MOUNT: &str = "/kaniko/.docker";
const TERMINATION_LOG: &str = "/dev/termination-log";

/// Where a finished build pushed its image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushedImage {
    pub destination: String,
    pub digest: Option<String>,
}

impl PushedImage {
    pub fn pull_path(&self) -> String {
        format_pull_path(&self.destination, self.digest.as_deref())
    }
}

/// Result of handing a build to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Submitted,
    /// A Job left by an earlier request of the same name is being removed;
    /// its deletion event brings the request back.
    ReplacingStale,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildProgress {
    Running,
    Succeeded(PushedImage),
    Failed(String),
}

/// Runs the actual image build for a request.
#[async_trait]
pub trait BuildEngine: Send + Sync {
    /// Starts (or re-applies) the build. Repeating it is harmless.
    async fn submit(&self, request: &BuildRequest, dockerfile: &str)
    -> Result<Submission, AppError>;

    async fn observe(&self, request: &BuildRequest) -> Result<BuildProgress, AppError>;

    /// Removes every build resource for `name`. Missing resources are fine.
    async fn cleanup(&self, name: &str) -> Result<(), AppError>;
}

/// Builds with the kaniko executor inside a Kubernetes Job.
pub struct KanikoEngine {
    client: Client,
    config: BuildConfig,
}

impl KanikoEngine {
    pub fn new(client: Client, config: BuildConfig) -> Self {
        Self { client, config }
    }

    pub fn destination(&self, request: &BuildRequest) -> String {
        format_image_destination(&self.config.registry, &request.spec.build_name)
    }

    fn context_config_map(&self, request: &BuildRequest, dockerfile: &str) -> Result<ConfigMap, AppError> {
        let name = request.name_any();

        Ok(ConfigMap {
            metadata: self.metadata(request, format_context_config_map_name(&name))?,
            data: Some(BTreeMap::from([(
                CONTEXT_KEY.to_string(),
                dockerfile.to_string(),
            )])),
            ..Default::default()
        })
    }

    fn job(&self, request: &BuildRequest) -> Result<Job, AppError> {
        let name = request.name_any();
        let timeout_minutes = i64::from(request.spec.build_timeout.clamp(1, 10));

        let mut volumes = vec![Volume {
            name: CONTEXT_VOLUME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: format_context_config_map_name(&name),
                ..Default::default()
            }),
            ..Default::default()
        }];
        let mut volume_mounts = vec![VolumeMount {
            name: CONTEXT_VOLUME.to_string(),
            mount_path: CONTEXT_MOUNT.to_string(),
            read_only: Some(true),
            ..Default::default()
        }];

        if let Some(secret) = &self.config.registry_secret {
            volumes.push(Volume {
                name: DOCKER_CONFIG_VOLUME.to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(secret.clone()),
                    items: Some(vec![KeyToPath {
                        key: ".dockerconfigjson".to_string(),
                        path: "config.json".to_string(),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
                ..Default::default()
            });
            volume_mounts.push(VolumeMount {
                name: DOCKER_CONFIG_VOLUME.to_string(),
                mount_path: DOCKER_CONFIG_MOUNT.to_string(),
                read_only: Some(true),
                ..Default::default()
            });
        }

        let container = Container {
            name: "kaniko".to_string(),
            image: Some(self.config.executor_image.clone()),
            args: Some(vec![
                format!("--dockerfile={CONTEXT_MOUNT}/{CONTEXT_KEY}"),
                format!("--context=dir://{CONTEXT_MOUNT}"),
                format!("--destination={}", self.destination(request)),
                // Digest ends up in the container's termination message
                format!("--digest-file={TERMINATION_LOG}"),
            ]),
            termination_message_path: Some(TERMINATION_LOG.to_string()),
            volume_mounts: Some(volume_mounts),
            ..Default::default()
        };

        let template = PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(build_labels(&name)),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                restart_policy: Some("Never".to_string()),
                containers: vec![container],
                volumes: Some(volumes),
                ..Default::default()
            }),
        };

        Ok(Job {
            metadata: self.metadata(request, format_build_job_name(&name))?,
            spec: Some(JobSpec {
                backoff_limit: Some(0),
                active_deadline_seconds: Some(timeout_minutes * 60),
                template,
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    fn metadata(&self, request: &BuildRequest, name: String) -> Result<ObjectMeta, AppError> {
        let owner = request.controller_owner_ref(&()).ok_or_else(|| {
            AppError::InvalidSpec(format!("BuildRequest {} has no uid yet", request.name_any()))
        })?;

        Ok(ObjectMeta {
            name: Some(name),
            namespace: Some(self.config.namespace.clone()),
            labels: Some(build_labels(&request.name_any())),
            owner_references: Some(vec![owner]),
            ..Default::default()
        })
    }

    /// Digest reported by a finished pod of the Job with `job_uid`, if any.
    async fn reported_digest(&self, name: &str, job_uid: &str) -> Result<Option<String>, AppError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let params = ListParams::default().labels(&format!("{BUILD_REQUEST_LABEL}={name}"));

        let digest = pods
            .list(&params)
            .await?
            .items
            .into_iter()
            .filter(|pod| {
                pod.metadata
                    .owner_references
                    .as_deref()
                    .is_some_and(|owners| controlled_by(owners, job_uid))
            })
            .filter_map(|pod| pod.status)
            .flat_map(|status| status.container_statuses.unwrap_or_default())
            .filter_map(|status| status.state?.terminated)
            .filter(|terminated| terminated.exit_code == 0)
            .filter_map(|terminated| terminated.message)
            .map(|message| message.trim().to_string())
            .find(|message| message.starts_with("sha256:"));

        Ok(digest)
    }

    /// Deletes a Job that belongs to another incarnation of the request.
    async fn remove_stale_job(&self, job_name: &str) -> Result<(), AppError> {
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), &self.config.namespace);
        match jobs.delete(job_name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Whether `owners` names `uid` as the controlling owner.
pub fn controlled_by(owners: &[OwnerReference], uid: &str) -> bool {
    owners
        .iter()
        .any(|owner| owner.controller == Some(true) && owner.uid == uid)
}

/// Whether `object` is controlled by this incarnation of `request`.
fn belongs_to<K: Resource>(object: &K, request: &BuildRequest) -> bool {
    let Some(uid) = request.uid() else {
        return false;
    };

    object
        .meta()
        .owner_references
        .as_deref()
        .is_some_and(|owners| controlled_by(owners, &uid))
}

/// Reads a Job status into build progress, without the pushed image.
pub fn job_outcome(status: Option<&JobStatus>) -> Option<Result<(), String>> {
    let status = status?;

    let condition = |kind: &str| {
        status
            .conditions
            .iter()
            .flatten()
            .find(|condition| condition.type_ == kind && condition.status == "True")
    };

    if status.succeeded.unwrap_or(0) > 0 || condition("Complete").is_some() {
        return Some(Ok(()));
    }
    if let Some(failed) = condition("Failed") {
        let reason = failed
            .message
            .clone()
            .or_else(|| failed.reason.clone())
            .unwrap_or_else(|| "build job failed".to_string());
        return Some(Err(reason));
    }
    if status.failed.unwrap_or(0) > 0 {
        return Some(Err("build pod failed".to_string()));
    }

    None
}

#[async_trait]
impl BuildEngine for KanikoEngine {
    #[tracing::instrument(name = "kaniko_engine.submit", skip_all, fields(name = %request.name_any()), err)]
    async fn submit(
        &self,
        request: &BuildRequest,
        dockerfile: &str,
    ) -> Result<Submission, AppError> {
        let name = request.name_any();
        let ns = &self.config.namespace;
        let params = PatchParams::apply(MANAGER).force();

        let job = self.job(request)?;
        let job_name = format_build_job_name(&name);
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), ns);
        if let Some(existing) = jobs.get_opt(&job_name).await?
            && !belongs_to(&existing, request)
        {
            warn!(job = %job_name, "⚠️ Build job belongs to an earlier request, replacing");
            self.remove_stale_job(&job_name).await?;
            return Ok(Submission::ReplacingStale);
        }

        let config_map = self.context_config_map(request, dockerfile)?;
        let config_map_name = format_context_config_map_name(&name);
        let config_maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), ns);
        // A foreign ConfigMap is recreated, never adopted.
        if let Some(existing) = config_maps.get_opt(&config_map_name).await?
            && !belongs_to(&existing, request)
        {
            warn!(name = %config_map_name, "⚠️ Context ConfigMap belongs to an earlier request, replacing");
            match config_maps
                .delete(&config_map_name, &DeleteParams::default())
                .await
            {
                Ok(_) => {}
                Err(e) if is_not_found(&e) => {}
                Err(e) => return Err(e.into()),
            }
        }
        config_maps
            .patch(&config_map_name, &params, &Patch::Apply(&config_map))
            .await
            .map_err(|e| {
                error!(ns = %ns, name = %config_map_name, error = %e, "🚨 ConfigMap SSA failed");
                e
            })?;

        jobs.patch(&job_name, &params, &Patch::Apply(&job))
            .await
            .map_err(|e| {
                error!(ns = %ns, name = %job_name, error = %e, "🚨 Job SSA failed");
                e
            })?;

        info!(job = %job_name, destination = %self.destination(request), "🏗️ Build job submitted");
        Ok(Submission::Submitted)
    }

    async fn observe(&self, request: &BuildRequest) -> Result<BuildProgress, AppError> {
        let name = request.name_any();
        let job_name = format_build_job_name(&name);
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), &self.config.namespace);

        let job = jobs
            .get_opt(&job_name)
            .await?
            .ok_or_else(|| AppError::BuildJobMissing(job_name.clone()))?;

        if !belongs_to(&job, request) {
            warn!(job = %job_name, "⚠️ Build job belongs to an earlier request");
            self.remove_stale_job(&job_name).await?;
            return Err(AppError::BuildJobMissing(job_name));
        }

        match job_outcome(job.status.as_ref()) {
            None => Ok(BuildProgress::Running),
            Some(Err(reason)) => Ok(BuildProgress::Failed(reason)),
            Some(Ok(())) => {
                let digest = match job.uid() {
                    Some(job_uid) => self.reported_digest(&name, &job_uid).await?,
                    None => None,
                };
                if digest.is_none() {
                    warn!(job = %job_name, "⚠️ Build finished without a reported digest");
                }
                Ok(BuildProgress::Succeeded(PushedImage {
                    destination: self.destination(request),
                    digest,
                }))
            }
        }
    }

    #[tracing::instrument(name = "kaniko_engine.cleanup", skip_all, fields(name = %name), err)]
    async fn cleanup(&self, name: &str) -> Result<(), AppError> {
        let ns = &self.config.namespace;

        let jobs: Api<Job> = Api::namespaced(self.client.clone(), ns);
        match jobs
            .delete(&format_build_job_name(name), &DeleteParams::background())
            .await
        {
            Ok(_) => {}
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(e.into()),
        }

        let config_maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), ns);
        match config_maps
            .delete(&format_context_config_map_name(name), &DeleteParams::default())
            .await
        {
            Ok(_) => {}
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(e.into()),
        }

        info!("🧹 Build resources removed");
        Ok(())
    }
}
