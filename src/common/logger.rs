use colored::*;
use tracing::Level;

use crate::downloader::task::{DownloadTask, TaskStatus};

/// 初始化 tracing 日志输出，`verbose` 优先于配置中的级别
pub fn init_tracing(verbose: bool, level: &str) {
    let level = if verbose {
        Level::DEBUG
    } else {
        level.parse().unwrap_or(Level::INFO)
    };

    // 测试里可能重复初始化
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init();
}

/// 终端消息前的标记
#[derive(Debug, Clone, Copy)]
pub enum Mark {
    Success,
    Info,
    Warning,
    Error,
}

impl Mark {
    fn symbol(self) -> ColoredString {
        match self {
            Mark::Success => "✓".green().bold(),
            Mark::Info => "ℹ".blue().bold(),
            Mark::Warning => "⚠".yellow().bold(),
            Mark::Error => "✗".red().bold(),
        }
    }
}

/// 面向用户的终端输出，与 tracing 日志分开
pub struct PrettyLogger;

impl PrettyLogger {
    pub fn line(mark: Mark, message: impl AsRef<str>) {
        println!("{} {}", mark.symbol(), message.as_ref());
    }

    pub fn separator() {
        println!("{}", "─".repeat(72).bright_black());
    }

    /// 任务列表：每行 ID、状态、进度、文件名，失败原因另起一行
    pub fn task_table(tasks: &[DownloadTask]) {
        Self::separator();
        for task in tasks {
            let name = task.filename.as_deref().unwrap_or("-");
            println!(
                "{} {:<12} {:>6.1}%  {}",
                task.id.as_str().bright_black(),
                status_label(task.status),
                task.progress,
                name.bold()
            );
            if let Some(err) = &task.last_error {
                println!("    {} {}", "↳".red(), err);
            }
        }
        Self::separator();
    }

    /// 队列处理完毕后的统计
    pub fn queue_summary(tasks: &[DownloadTask]) {
        let count = |status: TaskStatus| tasks.iter().filter(|t| t.status == status).count();
        let unfinished = count(TaskStatus::Queued) + count(TaskStatus::Downloading) + count(TaskStatus::Paused);

        println!("\n{}", "🎉 队列处理完毕！".green().bold());
        println!("  完成: {}", count(TaskStatus::Completed));
        println!("  失败: {}", count(TaskStatus::Error));
        println!("  过期: {}", count(TaskStatus::Expired));
        println!("  未完成: {}", unfinished);
    }
}

fn status_label(status: TaskStatus) -> ColoredString {
    let text = status.to_string();
    match status {
        TaskStatus::Completed => text.green(),
        TaskStatus::Downloading | TaskStatus::Queued => text.cyan(),
        TaskStatus::Paused => text.yellow(),
        TaskStatus::Expired => text.magenta(),
        TaskStatus::Error | TaskStatus::Cancelled => text.red(),
    }
}

#[macro_export]
macro_rules! log_success {
    ($($arg:tt)*) => {
        $crate::common::logger::PrettyLogger::line($crate::common::logger::Mark::Success, format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::common::logger::PrettyLogger::line($crate::common::logger::Mark::Info, format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warning {
    ($($arg:tt)*) => {
        $crate::common::logger::PrettyLogger::line($crate::common::logger::Mark::Warning, format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::common::logger::PrettyLogger::line($crate::common::logger::Mark::Error, format!($($arg)*))
    };
}
