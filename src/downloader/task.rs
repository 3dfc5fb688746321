use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 任务唯一标识，创建时分配，永不复用
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// --------------------------------------------------------------------
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Queued,
    Downloading,
    Paused,
    Completed,
    Error,
    Cancelled,
    Expired, // 直链失效，等待刷新
}

impl TaskStatus {
    pub fn can_cancel(self) -> bool {
        !matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }

    pub fn can_resume(self) -> bool {
        matches!(self, TaskStatus::Paused | TaskStatus::Error)
    }

    pub fn accepts_new_url(self) -> bool {
        matches!(
            self,
            TaskStatus::Expired | TaskStatus::Error | TaskStatus::Paused
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Queued => "Queued",
            TaskStatus::Downloading => "Downloading",
            TaskStatus::Paused => "Paused",
            TaskStatus::Completed => "Completed",
            TaskStatus::Error => "Error",
            TaskStatus::Cancelled => "Cancelled",
            TaskStatus::Expired => "Expired",
        };
        f.write_str(s)
    }
}

/// 重新解析直链所需的上下文（剧集页面 + 会话令牌）
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OriginContext {
    pub episode_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl OriginContext {
    pub fn new(episode_url: impl Into<String>) -> Self {
        Self {
            episode_url: Some(episode_url.into()),
            ..Default::default()
        }
    }

    pub fn with_gate_token(mut self, token: impl Into<String>) -> Self {
        self.gate_token = Some(token.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

// --------------------------------------------------------------------
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadTask {
    pub id: TaskId,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<OriginContext>,
    pub dest_folder: PathBuf,
    pub filename: Option<String>,
    pub status: TaskStatus,
    #[serde(rename = "downloaded", default)]
    pub downloaded_bytes: u64,
    #[serde(rename = "total", default)]
    pub total_bytes: u64,
    #[serde(default)]
    pub speed: f64, // bytes/s
    #[serde(default)]
    pub progress: f64, // 0-100
    #[serde(rename = "error", default)]
    pub last_error: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl DownloadTask {
    pub fn new(
        url: String,
        dest_folder: PathBuf,
        filename: Option<String>,
        origin: Option<OriginContext>,
    ) -> Self {
        Self {
            id: TaskId::new(),
            url,
            origin,
            dest_folder,
            filename,
            status: TaskStatus::Queued,
            downloaded_bytes: 0,
            total_bytes: 0,
            speed: 0.0,
            progress: 0.0,
            last_error: None,
            created_at: Utc::now(),
        }
    }

    /// 预期的输出路径；文件名未确定时返回 None
    pub fn output_path(&self) -> Option<PathBuf> {
        self.filename.as_ref().map(|name| self.dest_folder.join(name))
    }

    /// 记下引擎确定的文件名；已有文件名时保持不变
    pub(crate) fn adopt_destination(&mut self, path: &Path) {
        if self.filename.is_some() {
            return;
        }
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            self.filename = Some(name.to_string());
        }
    }

    /// 写入计数器，百分比只增不减
    pub(crate) fn record_counters(&mut self, downloaded: u64, total: u64, speed: f64) {
        self.downloaded_bytes = downloaded;
        if total > 0 {
            self.total_bytes = total;
        }
        self.speed = speed;
        if self.total_bytes > 0 {
            let percent = (downloaded as f64 / self.total_bytes as f64 * 100.0).min(100.0);
            self.progress = self.progress.max(percent);
        }
    }

    /// 重新排队时清理上一轮的运行数据
    pub(crate) fn requeue(&mut self) {
        self.status = TaskStatus::Queued;
        self.speed = 0.0;
        self.last_error = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> DownloadTask {
        DownloadTask::new(
            "https://cdn.example.com/ep1.mp4".into(),
            PathBuf::from("/tmp/aura"),
            Some("ep1.mp4".into()),
            None,
        )
    }

    #[test]
    fn progress_never_goes_backwards() {
        let mut task = task();
        task.record_counters(50, 100, 10.0);
        assert_eq!(task.progress, 50.0);

        // 服务器重新报告了更大的总大小
        task.record_counters(60, 200, 10.0);
        assert_eq!(task.progress, 50.0);
        assert_eq!(task.total_bytes, 200);

        task.record_counters(500, 200, 10.0);
        assert_eq!(task.progress, 100.0);
    }

    #[test]
    fn requeue_clears_run_data() {
        let mut task = task();
        task.status = TaskStatus::Error;
        task.speed = 42.0;
        task.last_error = Some("HTTP 500".into());
        task.downloaded_bytes = 10;

        task.requeue();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.speed, 0.0);
        assert!(task.last_error.is_none());
        assert_eq!(task.downloaded_bytes, 10);
    }

    #[test]
    fn engine_filename_only_fills_missing_name() {
        let mut named = task();
        named.adopt_destination(Path::new("/tmp/aura/other.bin"));
        assert_eq!(named.filename.as_deref(), Some("ep1.mp4"));

        let mut unnamed = task();
        unnamed.filename = None;
        assert!(unnamed.output_path().is_none());
        unnamed.adopt_destination(Path::new("/tmp/aura/download.bin"));
        assert_eq!(unnamed.output_path(), Some(PathBuf::from("/tmp/aura/download.bin")));
    }

    #[test]
    fn transition_rules() {
        assert!(TaskStatus::Paused.can_resume());
        assert!(TaskStatus::Error.can_resume());
        assert!(!TaskStatus::Expired.can_resume());

        assert!(TaskStatus::Expired.accepts_new_url());
        assert!(!TaskStatus::Queued.accepts_new_url());
        assert!(!TaskStatus::Downloading.accepts_new_url());

        assert!(TaskStatus::Expired.can_cancel());
        assert!(!TaskStatus::Completed.can_cancel());
        assert!(!TaskStatus::Cancelled.can_cancel());
    }

    #[test]
    fn snapshot_uses_short_field_names() {
        let value = serde_json::to_value(task()).unwrap();
        assert_eq!(value["status"], "Queued");
        assert_eq!(value["downloaded"], 0);
        assert!(value.get("origin").is_none());
        assert_eq!(task().output_path(), Some(PathBuf::from("/tmp/aura/ep1.mp4")));
    }
}
