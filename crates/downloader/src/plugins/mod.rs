use std::path::{Path, PathBuf};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::{fs, io::AsyncWriteExt};
use tracing::warn;

use crate::error::DownloaderError;

pub mod http;
pub mod s3;

fn part_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    destination.with_file_name(name)
}

/// Streams `chunks` into `<destination>.part` and renames it into place once
/// the byte count matches `expected` (when known) and is non-zero.
pub(crate) async fn write_verified<S, E>(
    url: &str,
    destination: &Path,
    expected: Option<u64>,
    chunks: S,
) -> Result<u64, DownloaderError>
where
    S: Stream<Item = Result<Bytes, E>>,
    DownloaderError: From<E>,
{
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).await?;
    }

    let part = part_path(destination);
    let written = write_part(&part, chunks).await;

    let outcome = match written {
        Ok(0) => Err(DownloaderError::Empty(url.to_string())),
        Ok(received) => match expected {
            Some(expected) if expected != received => Err(DownloaderError::Incomplete {
                url: url.to_string(),
                expected,
                received,
            }),
            _ => Ok(received),
        },
        Err(err) => Err(err),
    };

    match outcome {
        Ok(received) => {
            fs::rename(&part, destination).await?;
            Ok(received)
        }
        Err(err) => {
            if let Err(remove_err) = fs::remove_file(&part).await
                && remove_err.kind() != std::io::ErrorKind::NotFound
            {
                warn!(path = %part.display(), error = %remove_err, "Failed to discard partial download");
            }
            Err(err)
        }
    }
}

async fn write_part<S, E>(part: &Path, chunks: S) -> Result<u64, DownloaderError>
where
    S: Stream<Item = Result<Bytes, E>>,
    DownloaderError: From<E>,
{
    let mut file = fs::File::create(part).await?;
    let mut received = 0u64;

    let mut chunks = std::pin::pin!(chunks);
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        received += chunk.len() as u64;
    }

    file.flush().await?;
    file.sync_all().await?;

    Ok(received)
}

#[cfg(test)]
mod tests {
    use futures::stream;

    use super::*;

    fn chunks(parts: &[&'static str]) -> impl Stream<Item = Result<Bytes, std::io::Error>> {
        stream::iter(
            parts
                .iter()
                .map(|part| Ok(Bytes::from_static(part.as_bytes())))
                .collect::<Vec<_>>(),
        )
    }

    #[test]
    fn part_file_sits_next_to_destination() {
        assert_eq!(
            part_path(Path::new("/staging/b1/Dockerfile")),
            PathBuf::from("/staging/b1/Dockerfile.part")
        );
    }

    #[tokio::test]
    async fn complete_content_is_renamed_into_place() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("b1").join("Dockerfile");

        let written = write_verified("mem://x", &destination, Some(11), chunks(&["FROM ", "alpine"]))
            .await
            .unwrap();

        assert_eq!(written, 11);
        assert_eq!(std::fs::read_to_string(&destination).unwrap(), "FROM alpine");
        assert!(!part_path(&destination).exists());
    }

    #[tokio::test]
    async fn short_content_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("Dockerfile");

        let err = write_verified("mem://x", &destination, Some(100), chunks(&["FROM alpine"]))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DownloaderError::Incomplete {
                expected: 100,
                received: 11,
                ..
            }
        ));
        assert!(!destination.exists());
        assert!(!part_path(&destination).exists());
    }

    #[tokio::test]
    async fn empty_content_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("Dockerfile");

        let err = write_verified("mem://x", &destination, None, chunks(&[]))
            .await
            .unwrap_err();

        assert!(matches!(err, DownloaderError::Empty(_)));
        assert!(!destination.exists());
    }

    #[tokio::test]
    async fn stream_errors_discard_the_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("Dockerfile");
        let failing = stream::iter(vec![
            Ok(Bytes::from_static(b"FROM")),
            Err(std::io::Error::other("connection reset")),
        ]);

        let err = write_verified("mem://x", &destination, None, failing)
            .await
            .unwrap_err();

        assert!(matches!(err, DownloaderError::IoError(_)));
        assert!(!destination.exists());
        assert!(!part_path(&destination).exists());
    }
}
