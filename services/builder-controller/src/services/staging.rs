use std::path::{Component, Path, PathBuf};

use tokio::fs;
use tracing::debug;

use crate::error::AppError;

/// Local directory holding each request's Dockerfile until it is handed to
/// the build engine.
#[derive(Clone, Debug)]
pub struct StagingArea {
    root: PathBuf,
}

impl StagingArea {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn request_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// `<root>/<name>/<uid>/<file_name>`; `file_name` must stay inside the
    /// request dir. The uid keeps a re-created request away from files staged
    /// for its predecessor.
    pub fn dockerfile_path(
        &self,
        name: &str,
        uid: &str,
        file_name: &str,
    ) -> Result<PathBuf, AppError> {
        if !is_single_component(name) || !is_single_component(uid) {
            return Err(AppError::InvalidSpec(format!(
                "cannot stage context for {name:?} with uid {uid:?}"
            )));
        }

        let relative = Path::new(file_name);
        let escapes = relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_)));
        if file_name.is_empty() || escapes {
            return Err(AppError::InvalidSpec(format!(
                "dockerfile name {file_name:?} must be a relative path"
            )));
        }

        Ok(self.request_dir(name).join(uid).join(relative))
    }

    /// Drops whatever was staged for earlier requests with the same name.
    pub async fn prune_stale(&self, name: &str, uid: &str) -> Result<(), AppError> {
        let mut entries = match fs::read_dir(self.request_dir(name)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_name() == uid {
                continue;
            }

            let path = entry.path();
            debug!(path = %path.display(), "🧹 Removing stale staging entry");
            if entry.file_type().await?.is_dir() {
                fs::remove_dir_all(&path).await?;
            } else {
                fs::remove_file(&path).await?;
            }
        }

        Ok(())
    }

    /// Whether a non-empty file is already staged at `path`.
    pub async fn is_staged(&self, path: &Path) -> bool {
        fs::metadata(path)
            .await
            .is_ok_and(|meta| meta.is_file() && meta.len() > 0)
    }

    /// Writes `content` next to `path` and renames it into place.
    pub async fn write(&self, path: &Path, content: &[u8]) -> Result<(), AppError> {
        if content.is_empty() {
            return Err(AppError::MissingContext(format!(
                "inline Dockerfile for {} is empty",
                path.display()
            )));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let part = path.with_extension("part");
        fs::write(&part, content).await?;
        fs::rename(&part, path).await?;

        debug!(path = %path.display(), bytes = content.len(), "📝 Staged Dockerfile");
        Ok(())
    }

    pub async fn read(&self, path: &Path) -> Result<String, AppError> {
        match fs::read_to_string(path).await {
            Ok(content) if !content.trim().is_empty() => Ok(content),
            Ok(_) => Err(AppError::MissingContext(format!(
                "{} is empty",
                path.display()
            ))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(AppError::MissingContext(
                format!("{} is not staged", path.display()),
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes everything staged under `name`, whatever the uid. Missing directories are fine.
    pub async fn remove(&self, name: &str) -> Result<(), AppError> {
        match fs::remove_dir_all(self.request_dir(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn is_single_component(value: &str) -> bool {
    let mut components = Path::new(value).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dockerfile_path_stays_inside_the_request_dir() {
        let staging = StagingArea::new("/staging");

        assert_eq!(
            staging.dockerfile_path("b1", "uid-1", "Dockerfile").unwrap(),
            PathBuf::from("/staging/b1/uid-1/Dockerfile")
        );
        assert_eq!(
            staging
                .dockerfile_path("b1", "uid-1", "build/Containerfile")
                .unwrap(),
            PathBuf::from("/staging/b1/uid-1/build/Containerfile")
        );

        for bad in ["../Dockerfile", "/etc/passwd", "a/../../b", ""] {
            assert!(
                matches!(
                    staging.dockerfile_path("b1", "uid-1", bad),
                    Err(AppError::InvalidSpec(_))
                ),
                "{bad} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let staging = StagingArea::new(dir.path());
        let path = staging.dockerfile_path("b1", "uid-1", "Dockerfile").unwrap();

        assert!(!staging.is_staged(&path).await);
        staging.write(&path, b"FROM alpine\n").await.unwrap();

        assert!(staging.is_staged(&path).await);
        assert_eq!(staging.read(&path).await.unwrap(), "FROM alpine\n");
        assert!(!path.with_extension("part").exists());
    }

    #[tokio::test]
    async fn missing_or_empty_content_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let staging = StagingArea::new(dir.path());
        let path = staging.dockerfile_path("b1", "uid-1", "Dockerfile").unwrap();

        assert!(matches!(
            staging.read(&path).await,
            Err(AppError::MissingContext(_))
        ));
        assert!(matches!(
            staging.write(&path, b"").await,
            Err(AppError::MissingContext(_))
        ));
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let staging = StagingArea::new(dir.path());
        let path = staging.dockerfile_path("b1", "uid-1", "Dockerfile").unwrap();
        staging.write(&path, b"FROM alpine").await.unwrap();

        staging.remove("b1").await.unwrap();
        staging.remove("b1").await.unwrap();

        assert!(!staging.request_dir("b1").exists());
    }

    #[test]
    fn names_and_uids_must_be_plain_components() {
        let staging = StagingArea::new("/staging");

        for (name, uid) in [("", "uid-1"), ("b1", ""), ("..", "uid-1"), ("b1", "a/b")] {
            assert!(
                matches!(
                    staging.dockerfile_path(name, uid, "Dockerfile"),
                    Err(AppError::InvalidSpec(_))
                ),
                "{name:?}/{uid:?} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn prune_keeps_only_the_current_uid() {
        let dir = tempfile::tempdir().unwrap();
        let staging = StagingArea::new(dir.path());
        let old = staging.dockerfile_path("b1", "uid-1", "Dockerfile").unwrap();
        let current = staging.dockerfile_path("b1", "uid-2", "Dockerfile").unwrap();
        staging.write(&old, b"FROM old").await.unwrap();
        staging.write(&current, b"FROM new").await.unwrap();

        staging.prune_stale("b1", "uid-2").await.unwrap();
        staging.prune_stale("never-staged", "uid-9").await.unwrap();

        assert!(!staging.is_staged(&old).await);
        assert_eq!(staging.read(&current).await.unwrap(), "FROM new");
    }
}
