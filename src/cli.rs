use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// 剧集下载器
#[derive(Parser, Debug)]
#[command(name = "auradl")]
#[command(version = "1.0")]
#[command(author = "rpeng252@gmail.com")]
#[command(about = "带持久化队列与直链自动刷新的剧集下载工具", long_about = None)]
pub struct Cli {
    /// 配置文件路径
    #[arg(long, value_name = "FILE", global = true)]
    #[arg(default_value = "settings.json")]
    #[arg(value_hint = clap::ValueHint::FilePath)]
    pub settings: PathBuf,

    /// 最大并发下载数 (覆盖配置文件)
    #[arg(long, value_name = "N", global = true)]
    pub concurrency: Option<usize>,

    /// 输出调试日志
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// 添加一个直链下载并处理队列直到空闲
    Add {
        /// 已解析的直链
        #[arg(value_name = "URL")]
        #[arg(value_hint = clap::ValueHint::Url)]
        url: String,

        /// 保存目录 (默认使用配置中的 download_path)
        #[arg(long, value_name = "DIR")]
        #[arg(value_hint = clap::ValueHint::DirPath)]
        output_dir: Option<PathBuf>,

        /// 输出文件名
        #[arg(long, value_name = "NAME")]
        filename: Option<String>,

        /// 剧集页面地址 (用于链接过期后重新解析)
        #[arg(long, value_name = "URL")]
        episode_url: Option<String>,

        /// 番剧标题，用作子目录名
        #[arg(long, value_name = "TITLE")]
        title: Option<String>,
    },

    /// 处理状态文件中未完成的队列
    Run,

    /// 列出所有任务
    List,

    /// 从历史中删除一个任务
    Remove {
        #[arg(value_name = "ID")]
        id: String,
    },

    /// 清理已完成和已取消的任务
    Clear,
}
