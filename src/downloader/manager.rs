use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::engine::TransferEngine;
use super::error::{DownloadError, Result};
use super::events::{ChannelObserver, DownloadEvent, DownloadObserver, Observers};
use super::refresh::{self, ContentResolver};
use super::scheduler::Scheduler;
use super::store::{PendingWrite, Snapshot, StateStore};
use super::task::{DownloadTask, OriginContext, TaskId, TaskStatus};
use crate::config::ManagerConfig;

/// 受同一把锁保护的全部可变状态
#[derive(Default)]
pub(crate) struct ManagerState {
    pub(crate) tasks: HashMap<TaskId, DownloadTask>,
    pub(crate) queue: VecDeque<TaskId>,
    // 有 worker 在运行的任务 -> 该 worker 的停止信号
    pub(crate) signals: HashMap<TaskId, CancellationToken>,
}

impl ManagerState {
    fn snapshot(&self) -> Snapshot {
        Snapshot::capture(self.queue.iter(), self.tasks.values())
    }

    fn enqueue(&mut self, task_id: &TaskId) {
        if !self.queue.contains(task_id) {
            self.queue.push_back(task_id.clone());
        }
    }
}

pub(crate) struct Shared {
    pub(crate) config: ManagerConfig,
    pub(crate) state: Mutex<ManagerState>,
    pub(crate) store: StateStore,
    pub(crate) observers: Observers,
    pub(crate) engine: Arc<dyn TransferEngine>,
    pub(crate) shutdown: CancellationToken,
    background: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    /// 在持有状态锁时编码快照，编码失败只记录日志
    pub(crate) fn encode(&self, state: &ManagerState) -> Option<PendingWrite> {
        match self.store.encode(&state.snapshot()) {
            Ok(pending) => Some(pending),
            Err(e) => {
                error!("状态快照编码失败: {}", e);
                None
            }
        }
    }

    /// 释放锁之后落盘，失败只记录日志
    pub(crate) async fn flush(&self, pending: Option<PendingWrite>) {
        if let Some(pending) = pending {
            if let Err(e) = self.store.write(pending).await {
                error!("保存下载状态失败: {}", e);
            }
        }
    }

    pub(crate) async fn persist(&self) {
        let pending = {
            let state = self.state.lock().await;
            self.encode(&state)
        };
        self.flush(pending).await;
    }

    fn push_background(&self, handle: JoinHandle<()>) {
        self.background
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }
}

/// 下载管理器：持久化队列 + 有界并发调度 + 直链刷新回路
///
/// 通过 [`DownloadManager::open`] 显式创建，克隆只是增加引用。
/// 后台循环会持有管理器的引用，退出前请调用 [`DownloadManager::shutdown`]。
#[derive(Clone)]
pub struct DownloadManager {
    shared: Arc<Shared>,
}

impl DownloadManager {
    /// 创建管理器并从状态文件恢复队列，不会启动调度器
    pub async fn open(config: ManagerConfig, engine: Arc<dyn TransferEngine>) -> Result<Self> {
        let store = StateStore::new(&config.state_file);
        let restored = match store.load().await {
            Ok(restored) => restored,
            Err(e) => {
                error!("读取状态文件失败，从空队列开始: {}", e);
                Default::default()
            }
        };

        let state = ManagerState {
            tasks: restored.tasks,
            queue: restored.queue,
            signals: HashMap::new(),
        };

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(state),
                store,
                observers: Observers::default(),
                engine,
                shutdown: CancellationToken::new(),
                background: std::sync::Mutex::new(Vec::new()),
            }),
        })
    }

    /// 启动调度循环
    pub fn start(&self) {
        let scheduler = Scheduler::new(Arc::clone(&self.shared));
        let handle = tokio::spawn(scheduler.run());
        self.shared.push_background(handle);
        info!(
            "下载调度器已启动，最大并发: {}",
            self.shared.config.max_concurrent
        );
    }

    /// 接入直链解析器，Expired 任务会自动刷新并重新排队
    pub fn attach_resolver(&self, resolver: Arc<dyn ContentResolver>) {
        let handle = refresh::spawn(self.clone(), resolver);
        self.shared.push_background(handle);
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.shared.config
    }

    // 添加新的下载任务
    pub async fn submit(
        &self,
        url: &str,
        dest_folder: impl AsRef<Path>,
        filename: Option<&str>,
        origin: Option<OriginContext>,
    ) -> Result<TaskId> {
        let url = url.trim();
        if url.is_empty() {
            return Err(DownloadError::InvalidUrl("URL 不能为空".to_string()));
        }

        let task = DownloadTask::new(
            url.to_string(),
            dest_folder.as_ref().to_path_buf(),
            filename.map(str::to_string),
            origin,
        );
        let task_id = task.id.clone();

        let pending = {
            let mut state = self.shared.state.lock().await;
            state.tasks.insert(task_id.clone(), task.clone());
            state.enqueue(&task_id);
            self.shared.encode(&state)
        };
        self.shared.flush(pending).await;

        info!("已添加下载任务: {} - {}", task_id, url);
        self.shared.observers.progress(&task);
        Ok(task_id)
    }

    /// 暂停请求：worker 在下一个轮询周期内真正停止
    pub async fn pause(&self, task_id: &TaskId) -> Result<bool> {
        self.transition(task_id, |state, task_id| {
            let task = state.tasks.get_mut(task_id)?;
            if task.status != TaskStatus::Downloading {
                return None;
            }
            task.status = TaskStatus::Paused;
            task.speed = 0.0;
            let snapshot = task.clone();
            if let Some(signal) = state.signals.get(task_id) {
                signal.cancel();
            }
            Some(snapshot)
        })
        .await
        .map(|changed| {
            if changed {
                info!("已暂停任务: {}", task_id);
            }
            changed
        })
    }

    /// 从 Paused / Error 恢复，排到队尾
    pub async fn resume(&self, task_id: &TaskId) -> Result<bool> {
        self.transition(task_id, |state, task_id| {
            let task = state.tasks.get_mut(task_id)?;
            if !task.status.can_resume() {
                return None;
            }
            task.requeue();
            let snapshot = task.clone();
            state.enqueue(task_id);
            Some(snapshot)
        })
        .await
        .map(|changed| {
            if changed {
                info!("已恢复任务: {}", task_id);
            }
            changed
        })
    }

    /// 替换直链并重新排队；只对 Expired / Error / Paused 生效，其余状态静默忽略
    pub async fn update_source_url(&self, task_id: &TaskId, new_url: impl Into<String>) -> Result<bool> {
        let new_url = new_url.into();
        if new_url.trim().is_empty() {
            return Err(DownloadError::InvalidUrl("URL 不能为空".to_string()));
        }

        self.transition(task_id, |state, task_id| {
            let task = state.tasks.get_mut(task_id)?;
            if !task.status.accepts_new_url() {
                return None;
            }
            task.url = new_url.trim().to_string();
            task.requeue();
            let snapshot = task.clone();
            state.enqueue(task_id);
            Some(snapshot)
        })
        .await
        .map(|changed| {
            if changed {
                info!("任务 {} 的直链已更新，重新排队", task_id);
            } else {
                debug!("任务 {} 当前状态无需更新直链", task_id);
            }
            changed
        })
    }

    /// 取消任务；有 worker 时由 worker 在停止后删除半成品文件
    pub async fn cancel(&self, task_id: &TaskId) -> Result<bool> {
        let mut leftover: Option<PathBuf> = None;
        let changed = self
            .transition(task_id, |state, task_id| {
                let task = state.tasks.get_mut(task_id)?;
                if !task.status.can_cancel() {
                    return None;
                }
                task.status = TaskStatus::Cancelled;
                task.speed = 0.0;
                let snapshot = task.clone();
                state.queue.retain(|id| id != task_id);
                match state.signals.get(task_id) {
                    Some(signal) => signal.cancel(),
                    None => leftover = snapshot.output_path(),
                }
                Some(snapshot)
            })
            .await?;

        if changed {
            info!("已取消任务: {}", task_id);
            if let Some(path) = leftover {
                remove_partial_file(&path).await;
            }
        }
        Ok(changed)
    }

    pub async fn get_task(&self, task_id: &TaskId) -> Option<DownloadTask> {
        self.shared.state.lock().await.tasks.get(task_id).cloned()
    }

    /// 所有任务，按创建时间排序
    pub async fn list_tasks(&self) -> Vec<DownloadTask> {
        let mut tasks: Vec<DownloadTask> = {
            let state = self.shared.state.lock().await;
            state.tasks.values().cloned().collect()
        };
        tasks.sort_by_key(|task| task.created_at);
        tasks
    }

    /// 当前等待调度的任务 ID，队首在前
    pub async fn queued_ids(&self) -> Vec<TaskId> {
        self.shared.state.lock().await.queue.iter().cloned().collect()
    }

    /// 从任务表中删除一个没有 worker 的任务
    pub async fn remove_task(&self, task_id: &TaskId) -> Result<DownloadTask> {
        let (removed, pending) = {
            let mut state = self.shared.state.lock().await;
            let status = state
                .tasks
                .get(task_id)
                .map(|task| task.status)
                .ok_or_else(|| DownloadError::TaskNotFound(task_id.clone()))?;
            if status == TaskStatus::Downloading || state.signals.contains_key(task_id) {
                return Err(DownloadError::InvalidState(task_id.clone(), status));
            }
            state.queue.retain(|id| id != task_id);
            let removed = state.tasks.remove(task_id);
            (removed, self.shared.encode(&state))
        };
        self.shared.flush(pending).await;

        removed.ok_or_else(|| DownloadError::TaskNotFound(task_id.clone()))
    }

    /// 清理已完成和已取消的历史任务，返回清理数量
    pub async fn clear_finished(&self) -> usize {
        let (count, pending) = {
            let mut state = self.shared.state.lock().await;
            let before = state.tasks.len();
            state.tasks.retain(|_, task| {
                !matches!(task.status, TaskStatus::Completed | TaskStatus::Cancelled)
            });
            let count = before - state.tasks.len();
            (count, (count > 0).then(|| self.shared.encode(&state)).flatten())
        };
        self.shared.flush(pending).await;
        count
    }

    /// 注册事件订阅者，按注册顺序投递
    pub fn add_observer(&self, observer: Arc<dyn DownloadObserver>) {
        self.shared.observers.add(observer);
    }

    /// 以通道形式订阅全部事件
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<DownloadEvent> {
        let (observer, rx) = ChannelObserver::new();
        self.add_observer(Arc::new(observer));
        rx
    }

    /// 立即写一次快照
    pub async fn save(&self) {
        self.shared.persist().await;
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shared.shutdown.clone()
    }

    /// 停止调度器与刷新循环，运行中的传输会被停止但保持 Downloading，
    /// 下次启动时会重新排队
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = self
            .shared
            .background
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for result in join_all(handles).await {
            if let Err(e) = result {
                warn!("后台任务异常退出: {}", e);
            }
        }
        self.shared.persist().await;
        info!("下载管理器已关闭");
    }

    /// 在锁内执行状态变更；变更发生时持久化并发出进度事件
    async fn transition<F>(&self, task_id: &TaskId, apply: F) -> Result<bool>
    where
        F: FnOnce(&mut ManagerState, &TaskId) -> Option<DownloadTask>,
    {
        let (changed, pending) = {
            let mut state = self.shared.state.lock().await;
            if !state.tasks.contains_key(task_id) {
                return Err(DownloadError::TaskNotFound(task_id.clone()));
            }
            match apply(&mut *state, task_id) {
                Some(task) => {
                    let pending = self.shared.encode(&state);
                    (Some(task), pending)
                }
                None => (None, None),
            }
        };

        let Some(task) = changed else {
            return Ok(false);
        };
        self.shared.flush(pending).await;
        self.shared.observers.progress(&task);
        Ok(true)
    }
}

/// 删除半成品文件，失败只记录日志
pub(crate) async fn remove_partial_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("已删除未完成的文件: {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("删除未完成的文件失败 {}: {}", path.display(), e),
    }
}
