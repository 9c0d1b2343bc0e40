use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
    sync::Arc,
};

use async_trait::async_trait;
use tracing::info;

use crate::{
    error::DownloaderError,
    plugins::{http::HttpDownloader, s3::S3Downloader},
};

/// What to fetch and the credentials to fetch it with.
#[derive(Debug, Clone, Default)]
pub struct FetchSource {
    pub url: String,
    pub auth: BTreeMap<String, String>,
}

impl FetchSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auth: BTreeMap::new(),
        }
    }

    pub fn with_auth(mut self, auth: BTreeMap<String, String>) -> Self {
        self.auth = auth;
        self
    }
}

/// Content-fetching capability for one protocol.
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Protocol tag this downloader answers to, e.g. `http`.
    fn tag(&self) -> &str;

    /// Writes the content at `source` to `destination`.
    ///
    /// `destination` only ever holds complete content: partial writes are
    /// discarded. Returns the number of bytes written.
    async fn fetch_to(
        &self,
        source: &FetchSource,
        destination: &Path,
    ) -> Result<u64, DownloaderError>;
}

/// Protocol tag to downloader mapping.
///
/// Built once at startup and shared read-only afterwards.
#[derive(Default, Clone)]
pub struct DownloaderRegistry {
    downloaders: HashMap<String, Arc<dyn Downloader>>,
}

impl DownloaderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `http`, `https` and `s3` downloaders.
    pub fn with_defaults(client: reqwest::Client) -> Result<Self, DownloaderError> {
        let mut registry = Self::new();
        registry.register_plugin(Arc::new(HttpDownloader::http(client.clone())))?;
        registry.register_plugin(Arc::new(HttpDownloader::https(client)))?;
        registry.register_plugin(Arc::new(S3Downloader::new()))?;

        info!(tags = ?registry.tags(), "📦 Downloader registry ready");

        Ok(registry)
    }

    pub fn register(
        &mut self,
        tag: impl Into<String>,
        downloader: Arc<dyn Downloader>,
    ) -> Result<(), DownloaderError> {
        let tag = tag.into();
        if self.downloaders.contains_key(&tag) {
            return Err(DownloaderError::AlreadyRegistered(tag));
        }

        self.downloaders.insert(tag, downloader);
        Ok(())
    }

    /// Registers a downloader under its own tag.
    pub fn register_plugin(&mut self, downloader: Arc<dyn Downloader>) -> Result<(), DownloaderError> {
        let tag = downloader.tag().to_string();
        self.register(tag, downloader)
    }

    /// Downloader whose `<tag>://` prefix starts `url`.
    pub fn resolve(&self, url: &str) -> Result<Arc<dyn Downloader>, DownloaderError> {
        self.downloaders
            .iter()
            .find(|(tag, _)| {
                url.strip_prefix(tag.as_str())
                    .is_some_and(|rest| rest.starts_with("://"))
            })
            .map(|(_, downloader)| Arc::clone(downloader))
            .ok_or_else(|| DownloaderError::UnsupportedProtocol(url.to_string()))
    }

    pub fn resolve_by_tag(&self, tag: &str) -> Result<Arc<dyn Downloader>, DownloaderError> {
        self.downloaders
            .get(tag)
            .cloned()
            .ok_or_else(|| DownloaderError::UnsupportedProtocol(tag.to_string()))
    }

    pub fn tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.downloaders.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop(&'static str);

    #[async_trait]
    impl Downloader for Noop {
        fn tag(&self) -> &str {
            self.0
        }

        async fn fetch_to(&self, _: &FetchSource, _: &Path) -> Result<u64, DownloaderError> {
            Ok(0)
        }
    }

    fn registry() -> DownloaderRegistry {
        DownloaderRegistry::with_defaults(reqwest::Client::new()).unwrap()
    }

    #[test]
    fn resolves_by_url_prefix() {
        let registry = registry();

        assert_eq!(registry.resolve("http://example.com/x").unwrap().tag(), "http");
        assert_eq!(registry.resolve("https://example.com/x").unwrap().tag(), "https");
        assert_eq!(registry.resolve("s3://bucket/key").unwrap().tag(), "s3");
    }

    #[test]
    fn unknown_or_malformed_urls_are_unsupported() {
        let registry = registry();

        for url in ["ftp://example.com/x", "http", "http:/example.com", "", "httpx://host"] {
            assert!(
                matches!(
                    registry.resolve(url),
                    Err(DownloaderError::UnsupportedProtocol(_))
                ),
                "{url} should not resolve"
            );
        }
    }

    #[test]
    fn resolves_by_exact_tag() {
        let registry = registry();

        assert_eq!(registry.resolve_by_tag("s3").unwrap().tag(), "s3");
        assert!(matches!(
            registry.resolve_by_tag("HTTP"),
            Err(DownloaderError::UnsupportedProtocol(_))
        ));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = registry();

        let err = registry.register("http", Arc::new(Noop("http"))).unwrap_err();
        assert!(matches!(err, DownloaderError::AlreadyRegistered(tag) if tag == "http"));

        // The original registration is untouched.
        assert_eq!(registry.tags(), vec!["http", "https", "s3"]);
    }

    #[test]
    fn custom_plugins_register_under_their_tag() {
        let mut registry = DownloaderRegistry::new();
        registry.register_plugin(Arc::new(Noop("git"))).unwrap();

        assert_eq!(registry.resolve("git://host/repo").unwrap().tag(), "git");
        assert!(registry.register_plugin(Arc::new(Noop("git"))).is_err());
    }
}
