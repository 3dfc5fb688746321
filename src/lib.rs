pub mod common;
pub mod config;
pub mod downloader;

pub use config::{ManagerConfig, Settings};
pub use downloader::{DownloadManager, OriginContext, TaskId, TaskStatus};
