//! 直链刷新回路
//!
//! worker 把过期任务标记为 Expired 并发出刷新请求；这里消费请求，
//! 调用外部解析器重新获取直链，成功后通过 `update_source_url` 重新排队。
//! 重试次数由解析器自己决定，这里不设上限。

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::events::{DownloadObserver, RefreshRequest};
use super::manager::DownloadManager;
use super::task::{OriginContext, TaskStatus};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("缺少剧集页面地址，无法重新解析")]
    MissingOrigin,

    #[error("解析直链失败: {0}")]
    Failed(String),
}

/// 外部的内容解析器：由剧集页面重新得到直链
#[async_trait]
pub trait ContentResolver: Send + Sync {
    async fn resolve_direct_url(&self, origin: &OriginContext) -> Result<String, ResolveError>;
}

/// 只转发刷新请求的订阅者
struct RefreshObserver {
    tx: mpsc::UnboundedSender<RefreshRequest>,
}

impl DownloadObserver for RefreshObserver {
    fn on_refresh_needed(&self, request: &RefreshRequest) {
        let _ = self.tx.send(request.clone());
    }
}

pub(crate) fn spawn(manager: DownloadManager, resolver: Arc<dyn ContentResolver>) -> JoinHandle<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    manager.add_observer(Arc::new(RefreshObserver { tx }));
    let shutdown = manager.shutdown_token();

    tokio::spawn(async move {
        loop {
            let request = tokio::select! {
                _ = shutdown.cancelled() => break,
                request = rx.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            // 每个请求独立解析，慢的解析不会阻塞其他任务
            let manager = manager.clone();
            let resolver = Arc::clone(&resolver);
            tokio::spawn(async move {
                refresh_one(&manager, resolver.as_ref(), request).await;
            });
        }
        debug!("刷新循环已退出");
    })
}

async fn refresh_one(manager: &DownloadManager, resolver: &dyn ContentResolver, request: RefreshRequest) {
    let task_id = request.task_id;

    // 任务可能已被取消、删除或者已经刷新过
    match manager.get_task(&task_id).await {
        Some(task) if task.status == TaskStatus::Expired => {}
        _ => {
            debug!("任务 {} 已无需刷新", task_id);
            return;
        }
    }

    let Some(origin) = request.origin else {
        error!("无法刷新任务 {}: {}", task_id, ResolveError::MissingOrigin);
        return;
    };

    info!("正在为任务 {} 重新解析下载链接...", task_id);
    match resolver.resolve_direct_url(&origin).await {
        Ok(url) => match manager.update_source_url(&task_id, url).await {
            Ok(true) => info!("任务 {} 链接已刷新，重新排队", task_id),
            Ok(false) => debug!("任务 {} 状态已变化，忽略刷新结果", task_id),
            Err(e) => warn!("更新任务 {} 的链接失败: {}", task_id, e),
        },
        Err(e) => warn!("任务 {} 刷新失败，保持 Expired: {}", task_id, e),
    }
}
