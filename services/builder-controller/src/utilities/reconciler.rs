use std::{collections::BTreeMap, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use builder_core::{
    crds::{BuildRequest, DockerfileSource, Image, ImageSpec, ImageStatus},
    formatters::{MAX_BUILD_REQUEST_NAME_LEN, fits_derived_names, format_image_tag},
    models::BuildStage,
};
use downloader::{DownloaderRegistry, FetchSource};
use kube::{ResourceExt, runtime::reflector::ObjectRef};
use tracing::{debug, info, warn};

use crate::{
    config::BuildConfig,
    error::AppError,
    services::{
        kaniko::{BuildEngine, BuildProgress, PushedImage, Submission},
        staging::StagingArea,
        store::ClusterStore,
    },
};

/// Attempts at a status write that keeps losing to concurrent writers.
const STATUS_WRITE_ATTEMPTS: u32 = 3;

/// What the dispatch loop drives for every dequeued identity.
#[async_trait]
pub trait Reconcile: Send + Sync {
    async fn sync(&self, key: &ObjectRef<BuildRequest>) -> Result<(), AppError>;

    /// Records the terminal `Failed` state for a request that ran out of retries.
    async fn mark_failed(&self, key: &ObjectRef<BuildRequest>) -> Result<(), AppError>;
}

/// Outcome of a stage that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Stage work is done; record the next stage.
    Advance,
    /// Work is still running elsewhere; a later event re-enqueues the request.
    Hold,
}

pub struct Reconciler {
    store: Arc<dyn ClusterStore>,
    engine: Arc<dyn BuildEngine>,
    downloaders: Arc<DownloaderRegistry>,
    staging: StagingArea,
    build: BuildConfig,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ClusterStore>,
        engine: Arc<dyn BuildEngine>,
        downloaders: Arc<DownloaderRegistry>,
        staging: StagingArea,
        build: BuildConfig,
    ) -> Self {
        Self {
            store,
            engine,
            downloaders,
            staging,
            build,
        }
    }

    /// Idempotent teardown for a deleted request.
    #[tracing::instrument(name = "reconciler.cleanup", skip_all, fields(name = %name), err)]
    pub async fn cleanup(&self, name: &str) -> Result<(), AppError> {
        self.staging.remove(name).await?;
        self.engine.cleanup(name).await?;

        info!("🗑️ BuildRequest deleted, resources cleaned up");
        Ok(())
    }

    /// Writes `to`, provided the request is still in `from`.
    ///
    /// On a conflict the request is re-read: the write is retried while the
    /// fresh copy is still in `from`, and abandoned once it has moved on or
    /// disappeared.
    async fn record_stage(
        &self,
        request: BuildRequest,
        from: Option<BuildStage>,
        to: BuildStage,
    ) -> Result<(), AppError> {
        let name = request.name_any();
        let mut current = request;

        for attempt in 1..=STATUS_WRITE_ATTEMPTS {
            match self.store.update_build_request_state(&current, to).await {
                Ok(()) => {
                    info!(name = %name, from = ?from, to = %to, "➡️ Stage recorded");
                    return Ok(());
                }
                Err(e) if e.is_conflict() => {
                    warn!(name = %name, attempt, error = %e, "⚠️ Status write conflicted, re-reading");

                    match self.store.get_build_request(&name).await? {
                        Some(fresh) if fresh.stage() == from => current = fresh,
                        Some(fresh) => {
                            info!(name = %name, state = %fresh.raw_state(), "Status moved on, dropping write");
                            return Ok(());
                        }
                        None => {
                            info!(name = %name, "BuildRequest gone, dropping write");
                            return Ok(());
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(AppError::Conflict(format!(
            "status of {name} still conflicting after {STATUS_WRITE_ATTEMPTS} attempts"
        )))
    }

    /// Puts the request's Dockerfile into the staging area unless this
    /// incarnation of the request already has it there.
    async fn stage_context(&self, request: &BuildRequest) -> Result<PathBuf, AppError> {
        let name = request.name_any();
        if !fits_derived_names(&name) {
            return Err(AppError::InvalidSpec(format!(
                "BuildRequest name {name:?} is longer than {MAX_BUILD_REQUEST_NAME_LEN} characters"
            )));
        }
        let uid = request
            .uid()
            .ok_or_else(|| AppError::InvalidSpec(format!("BuildRequest {name} has no uid yet")))?;

        self.staging.prune_stale(&name, &uid).await?;
        let destination =
            self.staging
                .dockerfile_path(&name, &uid, request.spec.dockerfile_name())?;

        if self.staging.is_staged(&destination).await {
            debug!(path = %destination.display(), "Context already staged");
            return Ok(destination);
        }

        match request.spec.dockerfile_source() {
            DockerfileSource::InlineBase64(encoded) => {
                let content = STANDARD.decode(encoded)?;
                self.staging.write(&destination, &content).await?;
            }
            DockerfileSource::InlineText(text) => {
                self.staging.write(&destination, text.as_bytes()).await?;
            }
            DockerfileSource::Remote(remote) => {
                let downloader = match remote.r#type.trim() {
                    "" => self.downloaders.resolve(&remote.content_url)?,
                    tag => self.downloaders.resolve_by_tag(tag)?,
                };

                let auth = match remote.auth_config_map.trim() {
                    "" => BTreeMap::new(),
                    config_map => self.store.get_auth_material(config_map).await?,
                };

                let source = FetchSource::new(remote.content_url.as_str()).with_auth(auth);
                let bytes = downloader.fetch_to(&source, &destination).await?;
                info!(url = %remote.content_url, bytes, "⬇️ Remote context fetched");
            }
            DockerfileSource::Missing => {
                return Err(AppError::InvalidSpec(format!(
                    "BuildRequest {name} has neither an inline Dockerfile nor a remote context"
                )));
            }
        }

        Ok(destination)
    }

    #[tracing::instrument(name = "reconciler.get_context", skip_all, err)]
    async fn get_context(&self, request: &BuildRequest) -> Result<Transition, AppError> {
        self.stage_context(request).await?;
        Ok(Transition::Advance)
    }

    /// Staging is local to this process, so a restart since `Getting` means
    /// the context is acquired again here.
    #[tracing::instrument(name = "reconciler.build_image", skip_all, err)]
    async fn build_image(&self, request: &BuildRequest) -> Result<Transition, AppError> {
        let path = self.stage_context(request).await?;
        let dockerfile = self.staging.read(&path).await?;

        match self.engine.submit(request, &dockerfile).await? {
            Submission::Submitted => Ok(Transition::Advance),
            Submission::ReplacingStale => {
                debug!("⏳ Waiting for a stale build job to go away");
                Ok(Transition::Hold)
            }
        }
    }

    #[tracing::instrument(name = "reconciler.push_image", skip_all, err)]
    async fn push_image(&self, request: &BuildRequest) -> Result<Transition, AppError> {
        match self.engine.observe(request).await? {
            BuildProgress::Running => {
                debug!("⏳ Build still running");
                Ok(Transition::Hold)
            }
            BuildProgress::Succeeded(pushed) => {
                info!(pull_path = %pushed.pull_path(), "📤 Image pushed");
                Ok(Transition::Advance)
            }
            BuildProgress::Failed(reason) => Err(AppError::BuildFailed(reason)),
        }
    }

    #[tracing::instrument(name = "reconciler.create_image_source", skip_all, err)]
    async fn create_image_source(&self, request: &BuildRequest) -> Result<Transition, AppError> {
        let pushed = match self.engine.observe(request).await? {
            BuildProgress::Succeeded(pushed) => pushed,
            BuildProgress::Running => return Ok(Transition::Hold),
            BuildProgress::Failed(reason) => return Err(AppError::BuildFailed(reason)),
        };

        let name = request.name_any();
        let image = self.image_for(request, &pushed);

        let cached = self.store.get_image(&name).await?;
        let up_to_date = cached
            .and_then(|existing| existing.status)
            .and_then(|status| status.image_pull_path)
            == Some(pushed.pull_path());

        if up_to_date {
            debug!("Image already records this pull path");
        } else {
            self.store.apply_image(&image).await?;
        }

        Ok(Transition::Advance)
    }

    fn image_for(&self, request: &BuildRequest, pushed: &PushedImage) -> Image {
        let mut image = Image::new(
            &request.name_any(),
            ImageSpec {
                image_type: self.build.image_type.clone(),
                image_url: self.build.registry.clone(),
                register_secret: self.build.registry_secret.clone().unwrap_or_default(),
                image_tag: format_image_tag(&request.spec.build_name).to_string(),
            },
        );
        image.status = Some(ImageStatus {
            image_size: None,
            image_pull_path: Some(pushed.pull_path()),
            state: Some(BuildStage::Finished),
        });
        image
    }
}

#[async_trait]
impl Reconcile for Reconciler {
    #[tracing::instrument(name = "reconciler.sync", skip_all, fields(name = %key.name), err)]
    async fn sync(&self, key: &ObjectRef<BuildRequest>) -> Result<(), AppError> {
        let Some(request) = self.store.get_build_request(&key.name).await? else {
            return self.cleanup(&key.name).await;
        };

        let Some(stage) = request.stage() else {
            info!(state = %request.raw_state(), "🆕 Accepting BuildRequest");
            return self.record_stage(request, None, BuildStage::INITIAL).await;
        };

        let transition = match stage {
            BuildStage::ContextGetting => self.get_context(&request).await?,
            BuildStage::ImageBuilding => self.build_image(&request).await?,
            BuildStage::ImagePushing => self.push_image(&request).await?,
            BuildStage::ImageSourceCreating => self.create_image_source(&request).await?,
            BuildStage::Finished | BuildStage::Failed => {
                debug!(stage = %stage, "BuildRequest already settled");
                return Ok(());
            }
        };

        match (transition, stage.next()) {
            (Transition::Advance, Some(next)) => {
                self.record_stage(request, Some(stage), next).await
            }
            _ => Ok(()),
        }
    }

    async fn mark_failed(&self, key: &ObjectRef<BuildRequest>) -> Result<(), AppError> {
        // Re-read so a deleted request is not resurrected by the write.
        if self.store.get_build_request(&key.name).await?.is_none() {
            return Ok(());
        }

        self.store
            .force_build_request_state(&key.name, BuildStage::Failed)
            .await
    }
}
