//! 传输引擎接口
//!
//! 调度核心只通过 [`TransferEngine`] / [`TransferHandle`] 与实际的字节传输交互，
//! 引擎负责分块、重试、Range 请求等细节；核心只轮询句柄上的计数器。

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex};

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// 一次传输的输入
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub url: String,
    pub destination_dir: PathBuf,
    pub filename: Option<String>,
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransferFailure {
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("链接已过期: {0}")]
    Expired(String),

    #[error("网络错误: {0}")]
    Network(String),

    #[error("IO错误: {0}")]
    Io(String),

    #[error("{0}")]
    Other(String),
}

// 只有自由文本时的兜底匹配
static EXPIRY_MARKERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bforbidden\b|\b403\b|\bexpired\b").expect("expiry marker regex")
});

impl TransferFailure {
    /// 授权失败或直链过期，应走刷新流程而不是直接报错
    pub fn is_expiry(&self) -> bool {
        match self {
            TransferFailure::Http { status, .. } if matches!(status, 401 | 403 | 410) => true,
            TransferFailure::Expired(_) => true,
            // 网络错误的文本里带着完整 URL，不能参与匹配
            TransferFailure::Other(message) => EXPIRY_MARKERS.is_match(message),
            _ => false,
        }
    }
}

impl From<std::io::Error> for TransferFailure {
    fn from(e: std::io::Error) -> Self {
        TransferFailure::Io(e.to_string())
    }
}

/// 运行中传输的句柄，所有方法都不能阻塞
pub trait TransferHandle: Send + Sync {
    /// 请求停止，实际停止发生在引擎的下一个检查点
    fn stop(&self);
    fn is_finished(&self) -> bool;
    fn is_successful(&self) -> bool;
    fn downloaded_bytes(&self) -> u64;
    /// 未知时为 0
    fn total_bytes(&self) -> u64;
    fn speed(&self) -> f64;
    fn error_cause(&self) -> Option<TransferFailure>;
    /// 引擎最终确定的输出文件路径
    fn destination(&self) -> PathBuf;
}

pub trait TransferEngine: Send + Sync {
    /// 以非阻塞方式开始传输，传输本身在后台任务中进行
    fn start(&self, request: TransferRequest) -> Result<Arc<dyn TransferHandle>, TransferFailure>;
}

/// 引擎实现可以直接复用的共享传输状态
#[derive(Debug)]
pub struct TransferState {
    destination: PathBuf,
    downloaded: AtomicU64,
    total: AtomicU64,
    speed_bits: AtomicU64,
    finished: AtomicBool,
    successful: AtomicBool,
    failure: Mutex<Option<TransferFailure>>,
    stop: CancellationToken,
}

impl TransferState {
    pub fn new(destination: impl AsRef<Path>) -> Arc<Self> {
        Arc::new(Self {
            destination: destination.as_ref().to_path_buf(),
            downloaded: AtomicU64::new(0),
            total: AtomicU64::new(0),
            speed_bits: AtomicU64::new(0f64.to_bits()),
            finished: AtomicBool::new(false),
            successful: AtomicBool::new(false),
            failure: Mutex::new(None),
            stop: CancellationToken::new(),
        })
    }

    /// 引擎侧监听停止请求
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::SeqCst);
    }

    pub fn add_downloaded(&self, bytes: u64) -> u64 {
        self.downloaded.fetch_add(bytes, Ordering::SeqCst) + bytes
    }

    pub fn set_speed(&self, bytes_per_sec: f64) {
        self.speed_bits.store(bytes_per_sec.to_bits(), Ordering::SeqCst);
    }

    pub fn finish_ok(&self) {
        self.set_speed(0.0);
        self.successful.store(true, Ordering::SeqCst);
        self.finished.store(true, Ordering::SeqCst);
    }

    pub fn finish_err(&self, failure: TransferFailure) {
        {
            let mut guard = self.failure.lock().unwrap_or_else(|e| e.into_inner());
            *guard = Some(failure);
        }
        self.set_speed(0.0);
        self.finished.store(true, Ordering::SeqCst);
    }

    /// 因停止请求结束，既不成功也没有错误
    pub fn finish_stopped(&self) {
        self.set_speed(0.0);
        self.finished.store(true, Ordering::SeqCst);
    }
}

impl TransferHandle for TransferState {
    fn stop(&self) {
        self.stop.cancel();
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    fn is_successful(&self) -> bool {
        self.successful.load(Ordering::SeqCst)
    }

    fn downloaded_bytes(&self) -> u64 {
        self.downloaded.load(Ordering::SeqCst)
    }

    fn total_bytes(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }

    fn speed(&self) -> f64 {
        f64::from_bits(self.speed_bits.load(Ordering::SeqCst))
    }

    fn error_cause(&self) -> Option<TransferFailure> {
        self.failure
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn destination(&self) -> PathBuf {
        self.destination.clone()
    }
}
