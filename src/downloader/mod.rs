//! 下载调度子系统
//!
//! - 持久化任务队列，每次变更都重写快照
//! - 有界并发的调度循环 + 每任务一个 worker
//! - 直链过期时通过外部解析器刷新并重新排队

pub mod engine;
pub mod error;
pub mod events;
pub mod http;
pub mod manager;
pub mod progress;
pub mod refresh;
mod scheduler;
pub mod store;
pub mod task;
mod worker;

pub use engine::{TransferEngine, TransferFailure, TransferHandle, TransferRequest, TransferState};
pub use error::{DownloadError, Result};
pub use events::{ChannelObserver, DownloadEvent, DownloadObserver, RefreshRequest};
pub use http::HttpTransferEngine;
pub use manager::DownloadManager;
pub use refresh::{ContentResolver, ResolveError};
pub use task::{DownloadTask, OriginContext, TaskId, TaskStatus};
