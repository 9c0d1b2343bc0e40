use thiserror::Error;

#[derive(Error, Debug)]
pub enum DownloaderError {
    #[error("Downloader for protocol {0} already exists")]
    AlreadyRegistered(String),

    #[error("Unsupported protocol for {0}")]
    UnsupportedProtocol(String),

    #[error("Invalid source url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Unexpected status {status} while fetching {url}")]
    UnexpectedStatus { status: u16, url: String },

    #[error("Incomplete download of {url}: expected {expected} bytes, received {received}")]
    Incomplete {
        url: String,
        expected: u64,
        received: u64,
    },

    #[error("Fetched content of {0} is empty")]
    Empty(String),

    #[error("ReqwestError: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("ObjectStoreError: {0}")]
    ObjectStoreError(#[from] object_store::Error),

    #[error("IoError: {0}")]
    IoError(#[from] std::io::Error),
}
