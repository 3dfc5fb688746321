use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::engine::{TransferEngine, TransferFailure, TransferHandle, TransferRequest, TransferState};
use crate::common::utils::sanitize_filename;

const FALLBACK_FILENAME: &str = "download.bin";
const SPEED_WINDOW: Duration = Duration::from_millis(500);

/// 单连接 HTTP 流式下载引擎
#[derive(Clone)]
pub struct HttpTransferEngine {
    client: reqwest::Client,
}

impl HttpTransferEngine {
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for HttpTransferEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferEngine for HttpTransferEngine {
    fn start(&self, request: TransferRequest) -> Result<Arc<dyn TransferHandle>, TransferFailure> {
        let filename = request
            .filename
            .clone()
            .unwrap_or_else(|| filename_from_url(&request.url));
        let destination = request.destination_dir.join(filename);
        let state = TransferState::new(&destination);

        let client = self.client.clone();
        let worker_state = Arc::clone(&state);
        tokio::spawn(async move {
            match stream_to_file(&client, &request.url, &destination, &worker_state).await {
                Ok(true) => worker_state.finish_ok(),
                Ok(false) => worker_state.finish_stopped(),
                Err(failure) => {
                    debug!("传输失败: {}, 原因: {}", request.url, failure);
                    worker_state.finish_err(failure);
                }
            }
        });

        Ok(state)
    }
}

/// 返回 Ok(false) 表示被停止
async fn stream_to_file(
    client: &reqwest::Client,
    url: &str,
    output_path: &Path,
    state: &TransferState,
) -> Result<bool, TransferFailure> {
    let stop = state.stop_token();

    let response = tokio::select! {
        _ = stop.cancelled() => return Ok(false),
        resp = client.get(url).send() => resp.map_err(network_failure)?,
    };
    check_response_status(&response)?;

    if let Some(total) = response.content_length() {
        state.set_total(total);
    }

    let mut file = tokio::fs::File::create(output_path).await?;
    let mut stream = response.bytes_stream();

    let mut window_start = Instant::now();
    let mut window_bytes = 0u64;
    loop {
        let next = tokio::select! {
            _ = stop.cancelled() => {
                // 先关闭文件再报告结束
                drop(file);
                return Ok(false);
            }
            next = stream.next() => next,
        };
        let Some(chunk) = next else { break };
        let chunk = chunk.map_err(network_failure)?;

        file.write_all(&chunk).await?;
        state.add_downloaded(chunk.len() as u64);

        window_bytes += chunk.len() as u64;
        let elapsed = window_start.elapsed();
        if elapsed >= SPEED_WINDOW {
            state.set_speed(window_bytes as f64 / elapsed.as_secs_f64());
            window_start = Instant::now();
            window_bytes = 0;
        }
    }

    file.flush().await?;
    if state.total_bytes() == 0 {
        state.set_total(state.downloaded_bytes());
    }
    Ok(true)
}

fn check_response_status(response: &reqwest::Response) -> Result<(), TransferFailure> {
    let status = response.status();
    debug!("Response Status: {}", status);

    if status.is_success() {
        return Ok(());
    }
    let reason = status.canonical_reason().unwrap_or("Unknown").to_string();
    match status {
        reqwest::StatusCode::FORBIDDEN
        | reqwest::StatusCode::UNAUTHORIZED
        | reqwest::StatusCode::GONE => {
            warn!("🚫 直链被拒绝 ({})，可能已经过期", status);
        }
        _ => {
            warn!("❌ 非成功状态码: {}", status);
        }
    }
    Err(TransferFailure::Http {
        status: status.as_u16(),
        message: reason,
    })
}

fn network_failure(error: reqwest::Error) -> TransferFailure {
    match error.status() {
        Some(status) => TransferFailure::Http {
            status: status.as_u16(),
            message: error.to_string(),
        },
        None => TransferFailure::Network(error.to_string()),
    }
}

/// 取 URL 最后一段路径作为文件名
pub fn filename_from_url(raw: &str) -> String {
    url::Url::parse(raw)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .map(|segment| sanitize_filename(&segment))
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| FALLBACK_FILENAME.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_is_taken_from_last_segment() {
        assert_eq!(
            filename_from_url("https://cdn.example.com/v/ep01.mp4?token=abc"),
            "ep01.mp4"
        );
    }

    #[test]
    fn filename_falls_back_when_missing() {
        assert_eq!(filename_from_url("https://cdn.example.com/"), FALLBACK_FILENAME);
        assert_eq!(filename_from_url("not a url"), FALLBACK_FILENAME);
    }
}
