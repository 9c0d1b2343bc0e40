use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::models::BuildStage;

pub const GROUP: &str = "builder.io";
pub const VERSION: &str = "v1";

// -----------------------------------------------------------------------------
// BuildRequest Resource (user intent)
// -----------------------------------------------------------------------------
#[derive(CustomResource, Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[kube(
    group = "builder.io",
    version = "v1",
    kind = "BuildRequest",
    plural = "buildrequests",
    shortname = "br",
    status = "BuildRequestStatus",
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BuildRequestSpec {
    #[serde(default)]
    pub docker_file_base64: String,
    #[serde(default)]
    pub docker_file_string: String,
    #[serde(default)]
    pub remote_context: RemoteContext,

    /// Minutes the build job may run.
    #[schemars(range(min = 1, max = 10))]
    pub build_timeout: i32,

    pub build_name: String,
}

/// Observed state of a BuildRequest.
/// It should always be reconstructable from the state of the cluster and/or outside world.
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BuildRequestStatus {
    #[serde(default)]
    pub state: String,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RemoteContext {
    #[serde(default)]
    #[schemars(length(max = 200))]
    pub content_url: String,
    #[serde(default)]
    pub r#type: String,
    #[serde(default)]
    #[schemars(length(max = 20))]
    pub docker_file_name: String,
    #[serde(default)]
    #[schemars(length(max = 20))]
    pub auth_config_map: String,
}

/// Where the Dockerfile of a request comes from, in precedence order.
#[derive(Debug, Clone, PartialEq)]
pub enum DockerfileSource<'a> {
    InlineBase64(&'a str),
    InlineText(&'a str),
    Remote(&'a RemoteContext),
    Missing,
}

impl BuildRequestSpec {
    pub fn dockerfile_source(&self) -> DockerfileSource<'_> {
        if !self.docker_file_base64.trim().is_empty() {
            DockerfileSource::InlineBase64(self.docker_file_base64.trim())
        } else if !self.docker_file_string.is_empty() {
            DockerfileSource::InlineText(&self.docker_file_string)
        } else if !self.remote_context.content_url.is_empty() {
            DockerfileSource::Remote(&self.remote_context)
        } else {
            DockerfileSource::Missing
        }
    }

    /// File name of the Dockerfile inside the build context.
    pub fn dockerfile_name(&self) -> &str {
        match self.remote_context.docker_file_name.trim() {
            "" => "Dockerfile",
            name => name,
        }
    }
}

impl BuildRequest {
    /// Raw `status.state`, empty when no status has been recorded.
    pub fn raw_state(&self) -> &str {
        self.status
            .as_ref()
            .map(|status| status.state.as_str())
            .unwrap_or_default()
    }

    /// Recorded stage, `None` when the request has not been accepted yet.
    pub fn stage(&self) -> Option<BuildStage> {
        BuildStage::parse(self.raw_state())
    }
}

// -----------------------------------------------------------------------------
// Image Resource (observed build output)
// -----------------------------------------------------------------------------
#[derive(CustomResource, Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "builder.io",
    version = "v1",
    kind = "Image",
    plural = "images",
    status = "ImageStatus",
    printcolumn = r#"{"name":"PullPath", "type":"string", "jsonPath":".status.imagePullPath"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ImageSpec {
    pub image_type: String,
    pub image_url: String,
    pub register_secret: String,
    pub image_tag: String,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageStatus {
    pub image_size: Option<String>,
    pub image_pull_path: Option<String>,
    pub state: Option<BuildStage>,
}

#[cfg(test)]
mod tests {
    use kube::{CustomResourceExt, Resource};

    use super::*;

    fn spec() -> BuildRequestSpec {
        BuildRequestSpec {
            build_timeout: 5,
            build_name: "nginx:1.27".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn crds_are_cluster_scoped_with_status() {
        let crd = BuildRequest::crd();
        assert_eq!(crd.metadata.name.as_deref(), Some("buildrequests.builder.io"));
        assert_eq!(crd.spec.scope, "Cluster");
        assert!(
            crd.spec.versions[0]
                .subresources
                .as_ref()
                .and_then(|s| s.status.as_ref())
                .is_some()
        );

        let crd = Image::crd();
        assert_eq!(crd.metadata.name.as_deref(), Some("images.builder.io"));
        assert_eq!(crd.spec.scope, "Cluster");
        assert_eq!(Image::group(&()), GROUP);
        assert_eq!(Image::version(&()), VERSION);
    }

    #[test]
    fn base64_wins_over_text_and_remote() {
        let mut spec = spec();
        spec.docker_file_string = "FROM alpine".to_string();
        spec.docker_file_base64 = "RlJPTSBhbHBpbmU=".to_string();
        spec.remote_context.content_url = "http://host/Dockerfile".to_string();

        assert_eq!(
            spec.dockerfile_source(),
            DockerfileSource::InlineBase64("RlJPTSBhbHBpbmU=")
        );

        spec.docker_file_base64.clear();
        assert_eq!(
            spec.dockerfile_source(),
            DockerfileSource::InlineText("FROM alpine")
        );

        spec.docker_file_string.clear();
        assert!(matches!(spec.dockerfile_source(), DockerfileSource::Remote(_)));

        spec.remote_context.content_url.clear();
        assert_eq!(spec.dockerfile_source(), DockerfileSource::Missing);
    }

    #[test]
    fn dockerfile_name_defaults() {
        let mut spec = spec();
        assert_eq!(spec.dockerfile_name(), "Dockerfile");

        spec.remote_context.docker_file_name = "build/Containerfile".to_string();
        assert_eq!(spec.dockerfile_name(), "build/Containerfile");
    }

    #[test]
    fn status_round_trips_through_the_wire_format() {
        let json = serde_json::json!({
            "apiVersion": "builder.io/v1",
            "kind": "BuildRequest",
            "metadata": { "name": "b1" },
            "spec": {
                "remoteContext": {
                    "contentUrl": "http://host/Dockerfile",
                    "type": "http",
                    "dockerFileName": "Dockerfile",
                    "authConfigMap": "creds"
                },
                "buildTimeout": 3,
                "buildName": "web"
            },
            "status": { "state": "Building" }
        });

        let request: BuildRequest = serde_json::from_value(json).unwrap();

        assert_eq!(request.spec.remote_context.r#type, "http");
        assert_eq!(request.raw_state(), "Building");
        assert_eq!(request.stage(), Some(BuildStage::ImageBuilding));
    }

    #[test]
    fn unknown_or_missing_status_has_no_stage() {
        let mut request = BuildRequest::new("b1", spec());
        assert_eq!(request.raw_state(), "");
        assert_eq!(request.stage(), None);

        request.status = Some(BuildRequestStatus {
            state: "Baking".to_string(),
        });
        assert_eq!(request.stage(), None);
    }
}
