use std::path::Path;

use async_trait::async_trait;
use object_store::{ObjectStore, aws::AmazonS3Builder, path::Path as ObjectPath};
use tracing::{debug, instrument};
use url::Url;

use crate::{
    error::DownloaderError,
    plugins::write_verified,
    registry::{Downloader, FetchSource},
};

pub const S3_TAG: &str = "s3";
const DEFAULT_REGION: &str = "us-east-1";

/// Object storage downloader for `s3://bucket/key` urls (AWS or MinIO).
///
/// Auth keys: `accessKeyId`, `secretAccessKey`, `endpoint` (MinIO or other
/// S3-compatible server) and `region`.
#[derive(Clone, Default)]
pub struct S3Downloader;

impl S3Downloader {
    pub fn new() -> Self {
        Self
    }
}

/// Splits `s3://bucket/key/parts` into bucket and object key.
fn parse_location(url: &str) -> Result<(String, String), DownloaderError> {
    let invalid = |reason: &str| DownloaderError::InvalidUrl {
        url: url.to_string(),
        reason: reason.to_string(),
    };

    let parsed = Url::parse(url).map_err(|err| invalid(&err.to_string()))?;
    if parsed.scheme() != S3_TAG {
        return Err(invalid("scheme must be s3"));
    }

    let bucket = parsed
        .host_str()
        .filter(|bucket| !bucket.is_empty())
        .ok_or_else(|| invalid("missing bucket"))?;
    let key = parsed.path().trim_start_matches('/');
    if key.is_empty() {
        return Err(invalid("missing object key"));
    }

    Ok((bucket.to_string(), key.to_string()))
}

#[async_trait]
impl Downloader for S3Downloader {
    fn tag(&self) -> &str {
        S3_TAG
    }

    #[instrument(skip_all, fields(url = %source.url), err)]
    async fn fetch_to(
        &self,
        source: &FetchSource,
        destination: &Path,
    ) -> Result<u64, DownloaderError> {
        let (bucket, key) = parse_location(&source.url)?;

        let region = source
            .auth
            .get("region")
            .map(String::as_str)
            .unwrap_or(DEFAULT_REGION);
        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(bucket)
            .with_region(region);

        if let Some(access_key_id) = source.auth.get("accessKeyId") {
            builder = builder.with_access_key_id(access_key_id);
        }
        if let Some(secret_access_key) = source.auth.get("secretAccessKey") {
            builder = builder.with_secret_access_key(secret_access_key);
        }
        if let Some(endpoint) = source.auth.get("endpoint") {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"));
        }

        let store = builder.build()?;
        let result = store.get(&ObjectPath::from(key)).await?;
        let expected = result.meta.size;
        debug!(expected, "⬇️ Fetching object");

        write_verified(&source.url, destination, Some(expected), result.into_stream()).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    use super::*;

    #[test]
    fn parses_bucket_and_key() {
        assert_eq!(
            parse_location("s3://contexts/team/b1/Dockerfile").unwrap(),
            ("contexts".to_string(), "team/b1/Dockerfile".to_string())
        );
    }

    #[test]
    fn rejects_locations_without_bucket_or_key() {
        for url in ["s3://contexts", "s3://contexts/", "http://contexts/key", "not a url"] {
            assert!(
                matches!(parse_location(url), Err(DownloaderError::InvalidUrl { .. })),
                "{url} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn fetches_from_an_s3_compatible_endpoint() -> Result<(), Box<dyn std::error::Error>> {
        let body = "FROM alpine\n";
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/contexts/b1/Dockerfile"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("ETag", "\"abc123\"")
                    .insert_header("Last-Modified", "Wed, 21 Oct 2015 07:28:00 GMT")
                    .set_body_string(body),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let dir = tempfile::tempdir()?;
        let destination = dir.path().join("Dockerfile");
        let source = FetchSource::new("s3://contexts/b1/Dockerfile").with_auth(BTreeMap::from([
            ("accessKeyId".to_string(), "minio".to_string()),
            ("secretAccessKey".to_string(), "minio123".to_string()),
            ("endpoint".to_string(), mock_server.uri()),
        ]));

        let written = S3Downloader::new().fetch_to(&source, &destination).await?;

        assert_eq!(written, body.len() as u64);
        assert_eq!(std::fs::read_to_string(&destination)?, body);
        Ok(())
    }

    #[tokio::test]
    async fn missing_objects_write_nothing() -> Result<(), Box<dyn std::error::Error>> {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        let dir = tempfile::tempdir()?;
        let destination = dir.path().join("Dockerfile");
        let source = FetchSource::new("s3://contexts/missing").with_auth(BTreeMap::from([
            ("accessKeyId".to_string(), "minio".to_string()),
            ("secretAccessKey".to_string(), "minio123".to_string()),
            ("endpoint".to_string(), mock_server.uri()),
        ]));

        let err = S3Downloader::new()
            .fetch_to(&source, &destination)
            .await
            .unwrap_err();

        assert!(matches!(err, DownloaderError::ObjectStoreError(_)));
        assert!(!destination.exists());
        Ok(())
    }
}
