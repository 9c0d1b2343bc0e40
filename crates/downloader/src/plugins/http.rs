use std::path::Path;

use async_trait::async_trait;
use futures::stream;
use tracing::{debug, instrument};

use crate::{
    error::DownloaderError,
    plugins::write_verified,
    registry::{Downloader, FetchSource},
};

pub const HTTP_TAG: &str = "http";
pub const HTTPS_TAG: &str = "https";

/// Plain GET downloader.
///
/// Auth keys: `token` for a bearer token, or `username` with an optional
/// `password` for basic auth. A token wins when both are present.
#[derive(Clone)]
pub struct HttpDownloader {
    client: reqwest::Client,
    tag: &'static str,
}

impl HttpDownloader {
    pub fn http(client: reqwest::Client) -> Self {
        Self {
            client,
            tag: HTTP_TAG,
        }
    }

    pub fn https(client: reqwest::Client) -> Self {
        Self {
            client,
            tag: HTTPS_TAG,
        }
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    fn tag(&self) -> &str {
        self.tag
    }

    #[instrument(skip_all, fields(url = %source.url), err)]
    async fn fetch_to(
        &self,
        source: &FetchSource,
        destination: &Path,
    ) -> Result<u64, DownloaderError> {
        let mut request = self.client.get(&source.url);
        if let Some(token) = source.auth.get("token") {
            request = request.bearer_auth(token);
        } else if let Some(username) = source.auth.get("username") {
            request = request.basic_auth(username, source.auth.get("password"));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloaderError::UnexpectedStatus {
                status: status.as_u16(),
                url: source.url.clone(),
            });
        }

        let expected = response.content_length();
        debug!(?expected, "⬇️ Fetching remote context");

        let chunks = stream::unfold(Some(response), |response| async move {
            let mut response = response?;
            match response.chunk().await {
                Ok(Some(chunk)) => Some((Ok(chunk), Some(response))),
                Ok(None) => None,
                Err(err) => Some((Err(err), None)),
            }
        });

        write_verified(&source.url, destination, expected, chunks).await
    }
}
