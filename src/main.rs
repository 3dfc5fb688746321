use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use aura_downloader::common::logger::{PrettyLogger, init_tracing};
use aura_downloader::common::utils::sanitize_component;
use aura_downloader::config::Settings;
use aura_downloader::downloader::progress::DownloadProgress;
use aura_downloader::downloader::{
    DownloadManager, HttpTransferEngine, OriginContext, TaskId, TaskStatus,
};
use aura_downloader::{log_error, log_info, log_success, log_warning};

mod cli;

#[tokio::main]
async fn main() -> Result<()> {
    // 解析命令行参数
    let args = cli::Cli::parse();

    // 初始化日志
    let level = Settings::load(&args.settings)
        .map(|s| s.log_level)
        .unwrap_or_else(|_| "info".to_string());
    init_tracing(args.verbose, &level);

    let mut settings = Settings::load_or_default(&args.settings);
    if let Some(concurrency) = args.concurrency {
        settings.max_concurrent = concurrency;
    }

    let engine = Arc::new(HttpTransferEngine::new());
    let manager = DownloadManager::open(settings.manager_config(), engine).await?;

    match args.command {
        cli::Command::Add {
            url,
            output_dir,
            filename,
            episode_url,
            title,
        } => {
            let mut dest = output_dir.unwrap_or_else(|| settings.download_path.clone());
            if let Some(title) = &title {
                let folder = sanitize_component(title);
                if !folder.is_empty() {
                    dest = dest.join(folder);
                }
            }
            let origin = episode_url.map(|ep| {
                let origin = OriginContext::new(ep);
                match &title {
                    Some(title) => origin.with_title(title.clone()),
                    None => origin,
                }
            });

            let task_id = manager
                .submit(&url, &dest, filename.as_deref(), origin)
                .await?;
            log_info!("已加入队列: {}", task_id);
            process_until_idle(&manager).await;
        }
        cli::Command::Run => {
            let pending = manager.queued_ids().await.len();
            if pending == 0 {
                log_info!("队列为空，没有需要处理的任务");
                return Ok(());
            }
            log_info!("继续处理 {} 个排队中的任务", pending);
            process_until_idle(&manager).await;
        }
        cli::Command::List => {
            let tasks = manager.list_tasks().await;
            if tasks.is_empty() {
                log_info!("没有任务");
            } else {
                PrettyLogger::task_table(&tasks);
            }
        }
        cli::Command::Remove { id } => match manager.remove_task(&TaskId::from(id)).await {
            Ok(task) => log_success!("已删除任务: {}", task.id),
            Err(e) => log_error!("{}", e),
        },
        cli::Command::Clear => {
            let count = manager.clear_finished().await;
            log_success!("已清理 {} 个历史任务", count);
        }
    }

    Ok(())
}

/// 启动调度器，直到没有排队或下载中的任务，Ctrl-C 时保存状态退出
async fn process_until_idle(manager: &DownloadManager) {
    manager.add_observer(Arc::new(DownloadProgress::new()));
    manager.start();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("收到中断信号，正在保存下载状态...");
                break;
            }
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }

        let tasks = manager.list_tasks().await;
        let busy = tasks
            .iter()
            .any(|t| matches!(t.status, TaskStatus::Queued | TaskStatus::Downloading));
        if !busy {
            break;
        }
    }

    manager.shutdown().await;
    info!("下载状态已保存到 {}", manager.config().state_file.display());

    let tasks = manager.list_tasks().await;
    let expired = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Expired)
        .count();
    if expired > 0 {
        log_warning!("{} 个任务的链接已失效，需要重新解析后再下载", expired);
    }
    PrettyLogger::queue_summary(&tasks);
}
