use tokio::task::JoinError;

use crate::error::AppError;

impl AppError {
    /// Maps a failed write, turning a 409 into [`AppError::Conflict`].
    pub fn from_write(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 409 => AppError::Conflict(ae.message.to_string()),
            other => AppError::KubeError(other),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, AppError::Conflict(_))
    }
}

pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

impl From<JoinError> for AppError {
    fn from(value: JoinError) -> Self {
        AppError::InternalServerError(format!("task failed: {value}"))
    }
}
