#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use aura_downloader::config::ManagerConfig;
use aura_downloader::downloader::{
    DownloadManager, TaskId, TaskStatus, TransferEngine, TransferFailure, TransferHandle,
    TransferRequest, TransferState,
};
use tokio::io::AsyncWriteExt;

pub const WAIT: Duration = Duration::from_secs(5);

/// 模拟传输的行为
#[derive(Debug, Clone)]
pub enum Script {
    /// 按步写入直到写满 total
    Complete { total: u64, chunk: u64 },
    /// 一直写入直到被停止
    Endless { chunk: u64 },
    /// 写入 after 字节后失败
    Fail { after: u64, failure: TransferFailure },
    /// 写入一块后挂起，无视停止请求
    Hang { chunk: u64 },
}

/// 按 URL 决定行为的测试引擎
pub struct ScriptedEngine {
    scripts: Mutex<HashMap<String, Script>>,
    started: Mutex<Vec<String>>,
    step: Duration,
}

impl ScriptedEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(HashMap::new()),
            started: Mutex::new(Vec::new()),
            step: Duration::from_millis(10),
        })
    }

    pub fn script(&self, url: &str, script: Script) {
        self.scripts.lock().unwrap().insert(url.to_string(), script);
    }

    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }
}

impl TransferEngine for ScriptedEngine {
    fn start(&self, request: TransferRequest) -> Result<Arc<dyn TransferHandle>, TransferFailure> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(&request.url)
            .cloned()
            .unwrap_or(Script::Complete { total: 64, chunk: 16 });
        self.started.lock().unwrap().push(request.url.clone());

        let filename = request.filename.unwrap_or_else(|| "scripted.bin".to_string());
        let destination = request.destination_dir.join(filename);
        let state = TransferState::new(&destination);
        let worker = Arc::clone(&state);
        let step = self.step;

        tokio::spawn(async move {
            let mut file = match tokio::fs::File::create(&destination).await {
                Ok(file) => file,
                Err(e) => {
                    worker.finish_err(e.into());
                    return;
                }
            };

            if let Script::Hang { chunk } = script {
                let _ = file.write_all(&vec![0u8; chunk as usize]).await;
                let _ = file.flush().await;
                worker.add_downloaded(chunk);
                std::future::pending::<()>().await;
                return;
            }

            let (total, chunk, failure) = match script {
                Script::Complete { total, chunk } => {
                    worker.set_total(total);
                    (Some(total), chunk, None)
                }
                Script::Endless { chunk } => (None, chunk, None),
                Script::Fail { after, failure } => (Some(after), after.max(1), Some(failure)),
                Script::Hang { .. } => return,
            };

            loop {
                if worker.stop_requested() {
                    drop(file);
                    worker.finish_stopped();
                    return;
                }
                if let Some(total) = total {
                    if worker.downloaded_bytes() >= total {
                        break;
                    }
                }
                let _ = file.write_all(&vec![0u8; chunk as usize]).await;
                worker.add_downloaded(chunk);
                worker.set_speed(chunk as f64 / step.as_secs_f64());
                tokio::time::sleep(step).await;
            }

            let _ = file.flush().await;
            drop(file);
            match failure {
                Some(failure) => worker.finish_err(failure),
                None => worker.finish_ok(),
            }
        });

        Ok(state)
    }
}

pub fn fast_config(dir: &Path, max_concurrent: usize) -> ManagerConfig {
    let mut config = ManagerConfig::new(max_concurrent, dir.join("downloads.json"))
        .with_intervals(Duration::from_millis(20), Duration::from_millis(10));
    config.stop_grace = Duration::from_secs(1);
    config
}

pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn status_of(manager: &DownloadManager, id: &TaskId) -> Option<TaskStatus> {
    manager.get_task(id).await.map(|task| task.status)
}

pub async fn wait_for_status(manager: &DownloadManager, id: &TaskId, status: TaskStatus) -> bool {
    wait_until(WAIT, || async move { status_of(manager, id).await == Some(status) }).await
}
