//! 进度 / 完成 / 刷新请求事件的订阅接口
//!
//! 投递规则：
//! - 按注册顺序同步调用各订阅者，调用时不持有任何状态锁
//! - 某个订阅者 panic 只会被记录，不影响其余订阅者
//! - 订阅者不应阻塞；需要异步处理的请使用 [`ChannelObserver`]

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tracing::warn;

use super::task::{DownloadTask, OriginContext, TaskId};

/// 需要重新解析直链的任务
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshRequest {
    pub task_id: TaskId,
    pub origin: Option<OriginContext>,
}

#[derive(Debug, Clone)]
pub enum DownloadEvent {
    Progress(DownloadTask),
    Completed {
        task: DownloadTask,
        success: bool,
        message: String,
    },
    RefreshNeeded(RefreshRequest),
}

pub trait DownloadObserver: Send + Sync {
    /// 每个轮询周期、每个活动任务触发一次，状态变化时也会触发
    fn on_progress(&self, _task: &DownloadTask) {}

    /// 每次进入 Completed / Error 时触发一次
    fn on_completion(&self, _task: &DownloadTask, _success: bool, _message: &str) {}

    /// 每次进入 Expired 时触发一次
    fn on_refresh_needed(&self, _request: &RefreshRequest) {}
}

/// 把事件转发到无界通道
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<DownloadEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DownloadEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: DownloadEvent) {
        // 接收端关闭后静默丢弃
        let _ = self.tx.send(event);
    }
}

impl DownloadObserver for ChannelObserver {
    fn on_progress(&self, task: &DownloadTask) {
        self.forward(DownloadEvent::Progress(task.clone()));
    }

    fn on_completion(&self, task: &DownloadTask, success: bool, message: &str) {
        self.forward(DownloadEvent::Completed {
            task: task.clone(),
            success,
            message: message.to_string(),
        });
    }

    fn on_refresh_needed(&self, request: &RefreshRequest) {
        self.forward(DownloadEvent::RefreshNeeded(request.clone()));
    }
}

#[derive(Default)]
pub(crate) struct Observers {
    list: RwLock<Vec<Arc<dyn DownloadObserver>>>,
}

impl Observers {
    pub(crate) fn add(&self, observer: Arc<dyn DownloadObserver>) {
        self.list
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    pub(crate) fn progress(&self, task: &DownloadTask) {
        self.each("progress", |o| o.on_progress(task));
    }

    pub(crate) fn completion(&self, task: &DownloadTask, success: bool, message: &str) {
        self.each("completion", |o| o.on_completion(task, success, message));
    }

    pub(crate) fn refresh_needed(&self, request: &RefreshRequest) {
        self.each("refresh", |o| o.on_refresh_needed(request));
    }

    fn each(&self, kind: &str, f: impl Fn(&dyn DownloadObserver)) {
        // 先复制列表，回调里注册新订阅者不会死锁
        let observers: Vec<Arc<dyn DownloadObserver>> = self
            .list
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        for observer in observers {
            if catch_unwind(AssertUnwindSafe(|| f(observer.as_ref()))).is_err() {
                warn!("{} 事件订阅者发生 panic，已忽略", kind);
            }
        }
    }
}
