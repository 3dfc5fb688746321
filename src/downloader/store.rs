//! 队列与任务表的快照持久化
//!
//! 快照格式：`{ "queue": [id...], "tasks": { id: {...} } }`，无版本号。
//! 加载时逐条容错，单个坏条目只会被跳过。

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::error::Result;
use super::task::{DownloadTask, TaskId, TaskStatus};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub queue: Vec<TaskId>,
    pub tasks: BTreeMap<TaskId, DownloadTask>,
}

impl Snapshot {
    pub fn capture<'a>(
        queue: impl IntoIterator<Item = &'a TaskId>,
        tasks: impl IntoIterator<Item = &'a DownloadTask>,
    ) -> Self {
        Self {
            queue: queue.into_iter().cloned().collect(),
            tasks: tasks
                .into_iter()
                .map(|task| (task.id.clone(), task.clone()))
                .collect(),
        }
    }
}

/// 恢复后的队列与任务表，已满足「在队列中 ⇔ 状态为 Queued」
#[derive(Debug, Default)]
pub struct RestoredState {
    pub queue: VecDeque<TaskId>,
    pub tasks: HashMap<TaskId, DownloadTask>,
    pub skipped: usize,
}

/// 已编码、等待落盘的快照
#[derive(Debug)]
pub struct PendingWrite {
    generation: u64,
    data: Vec<u8>,
}

pub struct StateStore {
    path: PathBuf,
    next_generation: std::sync::atomic::AtomicU64,
    // 最近一次落盘的版本号，同时串行化写文件
    written: Mutex<u64>,
}

impl StateStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            next_generation: std::sync::atomic::AtomicU64::new(1),
            written: Mutex::new(0),
        }
    }

    /// 在持有状态锁时调用，版本号保证落盘顺序与加锁顺序一致
    pub fn encode(&self, snapshot: &Snapshot) -> Result<PendingWrite> {
        let data = serde_json::to_vec_pretty(snapshot)?;
        let generation = self
            .next_generation
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(PendingWrite { generation, data })
    }

    /// 整文件重写：先写临时文件再 rename
    pub async fn write(&self, pending: PendingWrite) -> Result<()> {
        let mut written = self.written.lock().await;
        if pending.generation <= *written {
            debug!("跳过过期的快照版本: {}", pending.generation);
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &pending.data).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        *written = pending.generation;
        Ok(())
    }

    /// 读取快照；文件不存在时返回空状态
    pub async fn load(&self) -> Result<RestoredState> {
        if !tokio::fs::try_exists(&self.path).await? {
            info!("状态文件不存在，从空队列开始: {}", self.path.display());
            return Ok(RestoredState::default());
        }
        let data = tokio::fs::read(&self.path).await?;
        let root: Value = serde_json::from_slice(&data)?;
        let restored = restore(root);
        info!(
            "已从状态文件恢复 {} 个任务（跳过 {} 条损坏记录）",
            restored.tasks.len(),
            restored.skipped
        );
        Ok(restored)
    }
}

fn restore(root: Value) -> RestoredState {
    let mut restored = RestoredState::default();

    if let Some(entries) = root.get("tasks").and_then(Value::as_object) {
        for (key, entry) in entries {
            match serde_json::from_value::<DownloadTask>(entry.clone()) {
                Ok(mut task) => {
                    task.id = TaskId::from(key.as_str());
                    // 下载状态无法跨进程恢复，重新排队
                    if task.status == TaskStatus::Downloading {
                        task.requeue();
                    }
                    restored.tasks.insert(task.id.clone(), task);
                }
                Err(e) => {
                    warn!("跳过损坏的任务记录 {}: {}", key, e);
                    restored.skipped += 1;
                }
            }
        }
    }

    let mut seen = HashSet::new();
    if let Some(queue) = root.get("queue").and_then(Value::as_array) {
        for id in queue.iter().filter_map(Value::as_str) {
            let id = TaskId::from(id);
            let queued = restored
                .tasks
                .get(&id)
                .is_some_and(|task| task.status == TaskStatus::Queued);
            if queued && seen.insert(id.clone()) {
                restored.queue.push_back(id);
            } else {
                debug!("丢弃无效的队列项: {}", id);
            }
        }
    }

    // 不在队列中的 Queued 任务按创建时间补到队尾
    let mut missing: Vec<&DownloadTask> = restored
        .tasks
        .values()
        .filter(|task| task.status == TaskStatus::Queued && !seen.contains(&task.id))
        .collect();
    missing.sort_by_key(|task| task.created_at);
    let missing: Vec<TaskId> = missing.into_iter().map(|task| task.id.clone()).collect();
    restored.queue.extend(missing);

    restored
}
