//! 队列处理器
//!
//! 单个常驻循环，按固定间隔：回收已结束的 worker → 计算空闲槽位 →
//! 从队首取出仍为 Queued 的任务启动 worker。
//! 出队与标记 Downloading 在同一把锁内完成，因此一个任务同一时刻最多只有一个 worker。

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::manager::Shared;
use super::task::{TaskId, TaskStatus};
use super::worker;

pub(crate) struct Scheduler {
    shared: Arc<Shared>,
    running: HashMap<TaskId, JoinHandle<()>>,
}

impl Scheduler {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            running: HashMap::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        let shutdown = self.shared.shutdown.clone();
        loop {
            self.tick().await;

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.shared.config.scheduler_interval) => {}
            }
        }

        // worker 的停止信号是 shutdown 的子令牌，这里等待它们退出
        let handles: Vec<JoinHandle<()>> = self.running.drain().map(|(_, h)| h).collect();
        let count = handles.len();
        join_all(handles).await;
        info!("调度器已停止，等待了 {} 个运行中的任务", count);
    }

    pub(crate) async fn tick(&mut self) {
        self.reap().await;

        let free = self
            .shared
            .config
            .max_concurrent
            .saturating_sub(self.running.len());
        if free == 0 {
            return;
        }

        for (task_id, signal) in self.claim(free).await {
            debug!("启动下载任务: {}", task_id);
            let handle = tokio::spawn(worker::run(
                Arc::clone(&self.shared),
                task_id.clone(),
                signal,
            ));
            self.running.insert(task_id, handle);
        }
    }

    /// 回收已经返回的 worker，释放槽位
    async fn reap(&mut self) {
        let finished: Vec<TaskId> = self
            .running
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();

        for task_id in finished {
            let Some(handle) = self.running.remove(&task_id) else {
                continue;
            };
            if let Err(e) = handle.await {
                error!("下载任务 {} 的 worker 异常退出: {}", task_id, e);
                worker::fail_orphaned(&self.shared, &task_id, "worker panicked").await;
            }
        }
    }

    /// 出队并标记为 Downloading，返回需要启动的任务
    async fn claim(&self, free: usize) -> Vec<(TaskId, CancellationToken)> {
        let mut guard = self.shared.state.lock().await;
        let state = &mut *guard;

        let mut claimed = Vec::new();
        let mut deferred = Vec::new();
        while claimed.len() < free {
            let Some(task_id) = state.queue.pop_front() else {
                break;
            };

            // 旧 worker 还未回收（例如暂停后立即恢复），留到下个周期
            if self.running.contains_key(&task_id) {
                deferred.push(task_id);
                continue;
            }

            match state.tasks.get_mut(&task_id) {
                Some(task) if task.status == TaskStatus::Queued => {
                    task.status = TaskStatus::Downloading;
                    task.speed = 0.0;
                }
                Some(task) => {
                    debug!("丢弃状态为 {} 的队列项: {}", task.status, task_id);
                    continue;
                }
                None => {
                    debug!("丢弃不存在的队列项: {}", task_id);
                    continue;
                }
            }

            let signal = self.shared.shutdown.child_token();
            state.signals.insert(task_id.clone(), signal.clone());
            claimed.push((task_id, signal));
        }

        for task_id in deferred.into_iter().rev() {
            state.queue.push_front(task_id);
        }
        claimed
    }
}
