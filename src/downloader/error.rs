use thiserror::Error;

use super::task::{TaskId, TaskStatus};

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("IO错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("状态文件序列化失败: {0}")]
    SnapshotError(#[from] serde_json::Error),

    #[error("无效的URL: {0}")]
    InvalidUrl(String),

    #[error("任务未找到: {0}")]
    TaskNotFound(TaskId),

    #[error("任务 {0} 处于 {1} 状态，无法执行该操作")]
    InvalidState(TaskId, TaskStatus),
}

pub type Result<T> = std::result::Result<T, DownloadError>;
