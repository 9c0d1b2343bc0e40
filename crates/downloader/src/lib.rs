pub mod error;
pub mod plugins;
pub mod registry;

pub use error::DownloaderError;
pub use registry::{Downloader, DownloaderRegistry, FetchSource};
