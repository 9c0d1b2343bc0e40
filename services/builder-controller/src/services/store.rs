use std::collections::BTreeMap;

use async_trait::async_trait;
use builder_core::{
    crds::{BuildRequest, Image},
    formatters::MANAGER,
    models::BuildStage,
};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{
    Api, Client, Resource, ResourceExt,
    api::{Patch, PatchParams},
    runtime::reflector::{ObjectRef, Store},
};
use serde_json::json;
use tracing::{debug, info};

use crate::error::AppError;

/// Declared state the reconciler reads and writes.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Authoritative read; `None` once the request is deleted.
    async fn get_build_request(&self, name: &str) -> Result<Option<BuildRequest>, AppError>;

    /// Compare-and-update of `status.state` against the request's
    /// resourceVersion. Fails with [`AppError::Conflict`] when stale.
    async fn update_build_request_state(
        &self,
        request: &BuildRequest,
        stage: BuildStage,
    ) -> Result<(), AppError>;

    /// Unconditional write of `status.state`.
    async fn force_build_request_state(&self, name: &str, stage: BuildStage)
    -> Result<(), AppError>;

    /// Data of the named auth ConfigMap.
    async fn get_auth_material(&self, name: &str) -> Result<BTreeMap<String, String>, AppError>;

    /// Cached Image, if the watch cache has seen one.
    async fn get_image(&self, name: &str) -> Result<Option<Image>, AppError>;

    async fn apply_image(&self, image: &Image) -> Result<(), AppError>;
}

pub struct KubeStore {
    client: Client,
    namespace: String,
    images: Store<Image>,
}

impl KubeStore {
    pub fn new(client: Client, namespace: impl Into<String>, images: Store<Image>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            images,
        }
    }

    fn build_requests(&self) -> Api<BuildRequest> {
        Api::all(self.client.clone())
    }
}

#[async_trait]
impl ClusterStore for KubeStore {
    async fn get_build_request(&self, name: &str) -> Result<Option<BuildRequest>, AppError> {
        Ok(self.build_requests().get_opt(name).await?)
    }

    #[tracing::instrument(
        name = "kube_store.update_build_request_state",
        skip_all,
        fields(name = %request.name_any(), stage = %stage),
        err
    )]
    async fn update_build_request_state(
        &self,
        request: &BuildRequest,
        stage: BuildStage,
    ) -> Result<(), AppError> {
        let name = request.name_any();
        let patch = json!({
            "metadata": { "resourceVersion": request.resource_version() },
            "status": { "state": stage.as_str() }
        });

        self.build_requests()
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(AppError::from_write)?;

        Ok(())
    }

    #[tracing::instrument(
        name = "kube_store.force_build_request_state",
        skip_all,
        fields(name = %name, stage = %stage),
        err
    )]
    async fn force_build_request_state(
        &self,
        name: &str,
        stage: BuildStage,
    ) -> Result<(), AppError> {
        let patch = json!({ "status": { "state": stage.as_str() } });

        self.build_requests()
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;

        Ok(())
    }

    async fn get_auth_material(&self, name: &str) -> Result<BTreeMap<String, String>, AppError> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);

        let config_map = api
            .get_opt(name)
            .await?
            .ok_or_else(|| AppError::MissingAuthConfigMap(format!("{}/{}", self.namespace, name)))?;

        debug!(name = %name, "🔑 Loaded auth material");
        Ok(config_map.data.unwrap_or_default())
    }

    async fn get_image(&self, name: &str) -> Result<Option<Image>, AppError> {
        Ok(self
            .images
            .get(&ObjectRef::new(name))
            .map(|image| image.as_ref().clone()))
    }

    #[tracing::instrument(name = "kube_store.apply_image", skip_all, fields(name = %image.name_any()), err)]
    async fn apply_image(&self, image: &Image) -> Result<(), AppError> {
        let name = image.name_any();
        let api: Api<Image> = Api::all(self.client.clone());
        let params = PatchParams::apply(MANAGER).force();

        api.patch(&name, &params, &Patch::Apply(image)).await?;

        let status = json!({
            "apiVersion": Image::api_version(&()),
            "kind": Image::kind(&()),
            "status": image.status,
        });
        api.patch_status(&name, &params, &Patch::Apply(&status))
            .await?;

        info!(name = %name, "🖼️ Image applied");
        Ok(())
    }
}
