use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Kube error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Kubernetes client error: {0}")]
    KubernetesError(#[from] factory::factories::kubernetes::error::KubernetesError),

    #[error("Observability error: {0}")]
    ObservabilityError(#[from] factory::factories::observability::error::ObservabilityError),

    #[error("Config error: {0}")]
    ConfigError(#[from] config::ConfigError),

    #[error("Downloader error: {0}")]
    DownloaderError(#[from] downloader::DownloaderError),

    #[error("IO error, {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serde json error")]
    SerdejsonError(#[from] serde_json::Error),

    #[error("Invalid base64 Dockerfile: {0}")]
    Base64Error(#[from] base64::DecodeError),

    #[error("HTTP request error: {0}")]
    Request(#[from] reqwest::Error),

    // Optimistic concurrency failure on a status write (409)
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid build request: {0}")]
    InvalidSpec(String),

    #[error("Build context missing: {0}")]
    MissingContext(String),

    #[error("Auth config map {0} not found")]
    MissingAuthConfigMap(String),

    #[error("Build job {0} not found")]
    BuildJobMissing(String),

    #[error("Build failed: {0}")]
    BuildFailed(String),

    #[error("Internal server error: {0}")]
    InternalServerError(String),
}
