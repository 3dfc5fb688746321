use std::collections::HashMap;
use std::sync::Mutex;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use super::events::{DownloadObserver, RefreshRequest};
use super::task::{DownloadTask, TaskId, TaskStatus};

const BAR_TEMPLATE: &str =
    "{spinner:.green} {msg:30!} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})";

/// 终端多进度条，每个任务一条
pub struct DownloadProgress {
    multi_pb: MultiProgress,
    style: ProgressStyle,
    bars: Mutex<HashMap<TaskId, ProgressBar>>,
}

impl DownloadProgress {
    pub fn new() -> Self {
        let style = ProgressStyle::with_template(BAR_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");
        Self {
            multi_pb: MultiProgress::new(),
            style,
            bars: Mutex::new(HashMap::new()),
        }
    }

    fn with_bar(&self, task: &DownloadTask, f: impl FnOnce(&ProgressBar)) {
        let mut bars = self.bars.lock().unwrap_or_else(|e| e.into_inner());
        let bar = bars.entry(task.id.clone()).or_insert_with(|| {
            let pb = self.multi_pb.add(ProgressBar::new(task.total_bytes));
            pb.set_style(self.style.clone());
            pb.set_message(label(task));
            pb
        });
        f(bar);
    }
}

impl Default for DownloadProgress {
    fn default() -> Self {
        Self::new()
    }
}

fn label(task: &DownloadTask) -> String {
    task.filename
        .clone()
        .unwrap_or_else(|| task.id.as_str().chars().take(8).collect())
}

impl DownloadObserver for DownloadProgress {
    fn on_progress(&self, task: &DownloadTask) {
        self.with_bar(task, |pb| {
            if task.total_bytes > 0 {
                pb.set_length(task.total_bytes);
            }
            pb.set_position(task.downloaded_bytes);
            match task.status {
                TaskStatus::Queued => pb.set_message(format!("{} (排队中)", label(task))),
                TaskStatus::Paused => pb.set_message(format!("{} (已暂停)", label(task))),
                TaskStatus::Cancelled => pb.abandon_with_message(format!("{} 已取消", label(task))),
                _ => pb.set_message(label(task)),
            }
        });
    }

    fn on_completion(&self, task: &DownloadTask, success: bool, message: &str) {
        self.with_bar(task, |pb| {
            if success {
                pb.set_position(task.total_bytes);
                pb.finish_with_message(format!("{} 下载完成", label(task)));
            } else {
                pb.abandon_with_message(format!("{} 失败: {}", label(task), message));
            }
        });
    }

    fn on_refresh_needed(&self, request: &RefreshRequest) {
        let bars = self.bars.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pb) = bars.get(&request.task_id) {
            pb.set_message("链接已失效，等待刷新");
        }
    }
}
