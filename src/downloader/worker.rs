//! 单个任务的传输 worker
//!
//! 负责创建目录、启动引擎、轮询计数器，并在结束时归类结果。
//! 所有出口都恰好落盘一次，worker 本身从不向外传播错误。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::engine::{TransferFailure, TransferHandle, TransferRequest};
use super::events::RefreshRequest;
use super::manager::{Shared, remove_partial_file};
use super::task::{DownloadTask, TaskId, TaskStatus};

/// worker 的退出原因
enum Outcome {
    /// 状态被外部改变（暂停/取消）或收到停止信号，引擎已停止
    Stopped(Option<PathBuf>),
    /// 引擎自然结束
    Finished(Arc<dyn TransferHandle>),
    /// 宽限期内引擎没有停下，文件可能仍被占用
    Abandoned(PathBuf),
    /// 引擎启动前就失败
    Failed(TransferFailure),
}

/// 结束时需要在锁外发出的事件
enum Notice {
    Completed(DownloadTask, bool, String),
    Refresh(DownloadTask, RefreshRequest),
    Cleanup(PathBuf),
    Nothing,
}

pub(crate) async fn run(shared: Arc<Shared>, task_id: TaskId, signal: CancellationToken) {
    let outcome = drive(&shared, &task_id, &signal).await;
    finish(&shared, &task_id, outcome).await;
}

async fn drive(shared: &Shared, task_id: &TaskId, signal: &CancellationToken) -> Outcome {
    let request = {
        let state = shared.state.lock().await;
        match state.tasks.get(task_id) {
            Some(task) if task.status == TaskStatus::Downloading => TransferRequest {
                url: task.url.clone(),
                destination_dir: task.dest_folder.clone(),
                filename: task.filename.clone(),
            },
            _ => return Outcome::Stopped(None),
        }
    };

    if let Err(e) = tokio::fs::create_dir_all(&request.destination_dir).await {
        error!(
            "创建下载目录失败 {}: {}",
            request.destination_dir.display(),
            e
        );
        return Outcome::Failed(e.into());
    }

    info!("开始下载任务: {}", task_id);
    let handle = match shared.engine.start(request) {
        Ok(handle) => handle,
        Err(failure) => return Outcome::Failed(failure),
    };

    let poll = shared.config.poll_interval;
    loop {
        if handle.is_finished() {
            return Outcome::Finished(handle);
        }

        // 只有仍在 Downloading 时才写入计数器
        let snapshot = {
            let mut state = shared.state.lock().await;
            match state.tasks.get_mut(task_id) {
                Some(task) if task.status == TaskStatus::Downloading => {
                    task.adopt_destination(&handle.destination());
                    task.record_counters(
                        handle.downloaded_bytes(),
                        handle.total_bytes(),
                        handle.speed(),
                    );
                    Some(task.clone())
                }
                _ => None,
            }
        };
        match snapshot {
            Some(task) => shared.observers.progress(&task),
            None => return stop(shared, handle.as_ref()).await,
        }

        tokio::select! {
            _ = signal.cancelled() => {}
            _ = tokio::time::sleep(poll) => {}
        }
        if signal.is_cancelled() && !handle.is_finished() {
            return stop(shared, handle.as_ref()).await;
        }
    }
}

/// 请求引擎停止，并在宽限期内等待它释放文件
async fn stop(shared: &Shared, handle: &dyn TransferHandle) -> Outcome {
    handle.stop();
    let step = shared.config.poll_interval.min(Duration::from_millis(50));
    let released = tokio::time::timeout(shared.config.stop_grace, async {
        while !handle.is_finished() {
            tokio::time::sleep(step).await;
        }
    })
    .await;
    if released.is_err() {
        warn!("传输引擎未在宽限期内停止: {}", handle.destination().display());
        return Outcome::Abandoned(handle.destination());
    }
    Outcome::Stopped(Some(handle.destination()))
}

async fn finish(shared: &Shared, task_id: &TaskId, outcome: Outcome) {
    let (notice, pending) = {
        let mut guard = shared.state.lock().await;
        let state = &mut *guard;
        state.signals.remove(task_id);

        let notice = match state.tasks.get_mut(task_id) {
            Some(task) => settle(task, outcome),
            None => Notice::Nothing,
        };
        (notice, shared.encode(state))
    };

    match notice {
        Notice::Completed(task, success, message) => {
            shared.observers.completion(&task, success, &message);
        }
        Notice::Refresh(task, request) => {
            shared.observers.progress(&task);
            shared.observers.refresh_needed(&request);
        }
        Notice::Cleanup(path) => remove_partial_file(&path).await,
        Notice::Nothing => {}
    }

    shared.flush(pending).await;
}

/// 根据退出原因与当前状态决定最终状态
fn settle(task: &mut DownloadTask, outcome: Outcome) -> Notice {
    // 引擎生成的文件名也要落盘，之后取消时才能找到半成品
    let resolved = match &outcome {
        Outcome::Stopped(path) => path.clone(),
        Outcome::Abandoned(path) => Some(path.clone()),
        Outcome::Finished(handle) => Some(handle.destination()),
        Outcome::Failed(_) => None,
    };
    if let Some(path) = &resolved {
        task.adopt_destination(path);
    }

    if task.status == TaskStatus::Cancelled {
        if let Outcome::Abandoned(path) = &outcome {
            warn!("引擎仍占用文件，保留未完成的文件: {}", path.display());
            return Notice::Nothing;
        }
        return resolved
            .or_else(|| task.output_path())
            .map(Notice::Cleanup)
            .unwrap_or(Notice::Nothing);
    }
    if task.status != TaskStatus::Downloading {
        // 暂停等外部请求已经设置了状态
        return Notice::Nothing;
    }

    let failure = match outcome {
        // 关闭时保持 Downloading，下次启动重新排队
        Outcome::Stopped(_) | Outcome::Abandoned(_) => return Notice::Nothing,
        Outcome::Finished(handle) if handle.is_successful() => {
            complete(task, handle.as_ref());
            info!("✅ 下载任务完成: {}", task.id);
            return Notice::Completed(task.clone(), true, "下载完成".to_string());
        }
        Outcome::Finished(handle) => handle
            .error_cause()
            .unwrap_or_else(|| TransferFailure::Other("未知错误".to_string())),
        Outcome::Failed(failure) => failure,
    };

    let message = failure.to_string();
    task.speed = 0.0;
    task.last_error = Some(message.clone());

    if failure.is_expiry() {
        task.status = TaskStatus::Expired;
        warn!("⏳ 下载链接已失效: {}, 原因: {}", task.id, message);
        let request = RefreshRequest {
            task_id: task.id.clone(),
            origin: task.origin.clone(),
        };
        Notice::Refresh(task.clone(), request)
    } else {
        task.status = TaskStatus::Error;
        error!("❌ 下载任务失败: {}, 错误: {}", task.id, message);
        Notice::Completed(task.clone(), false, message)
    }
}

fn complete(task: &mut DownloadTask, handle: &dyn TransferHandle) {
    let total = handle.total_bytes().max(handle.downloaded_bytes());
    if total > 0 {
        task.total_bytes = total;
    }
    task.downloaded_bytes = task.total_bytes;
    task.progress = 100.0;
    task.speed = 0.0;
    task.last_error = None;
    task.status = TaskStatus::Completed;

    let resolved = handle.destination();
    if let Some(name) = resolved.file_name().and_then(|n| n.to_str()) {
        task.filename = Some(name.to_string());
    }
    debug!("任务 {} 输出文件: {}", task.id, resolved.display());
}

/// worker panic 后由调度器调用，把仍在 Downloading 的任务标记为 Error
pub(crate) async fn fail_orphaned(shared: &Shared, task_id: &TaskId, reason: &str) {
    let (notice, pending) = {
        let mut guard = shared.state.lock().await;
        let state = &mut *guard;
        state.signals.remove(task_id);

        match state.tasks.get_mut(task_id) {
            Some(task) if task.status == TaskStatus::Downloading => {
                task.status = TaskStatus::Error;
                task.speed = 0.0;
                task.last_error = Some(reason.to_string());
                let task = task.clone();
                let pending = shared.encode(state);
                (Some(task), pending)
            }
            _ => (None, None),
        }
    };

    if let Some(task) = notice {
        shared.observers.completion(&task, false, reason);
        shared.flush(pending).await;
    }
}
