use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};

pub const SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("配置文件读写失败: {0}")]
    Io(#[from] std::io::Error),

    #[error("配置文件格式错误: {0}")]
    Parse(#[from] serde_json::Error),
}

/// 持久化的用户设置，所有字段都有默认值
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub download_path: PathBuf,
    pub max_concurrent: usize,
    pub state_file: PathBuf,
    pub scheduler_interval_ms: u64,
    pub poll_interval_ms: u64,
    pub stop_grace_ms: u64,
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            download_path: PathBuf::from("./downloads"),
            max_concurrent: 3,
            state_file: PathBuf::from("downloads.json"),
            scheduler_interval_ms: 1000,
            poll_interval_ms: 200,
            stop_grace_ms: 5000,
            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    /// 读取设置；文件不存在时写入默认值，格式错误时退回默认值
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            info!("未找到配置文件，使用默认设置: {}", path.display());
            let settings = Self::default();
            if let Err(e) = settings.save(path) {
                error!("写入默认配置失败: {}", e);
            }
            return settings;
        }

        match Self::load(path) {
            Ok(settings) => {
                info!("已加载配置: {}", path.display());
                settings
            }
            Err(e) => {
                error!("加载配置失败，使用默认设置: {}", e);
                Self::default()
            }
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            max_concurrent: self.max_concurrent.max(1),
            state_file: self.state_file.clone(),
            scheduler_interval: Duration::from_millis(self.scheduler_interval_ms.max(1)),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            stop_grace: Duration::from_millis(self.stop_grace_ms),
        }
    }
}

/// 下载管理器运行参数
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub max_concurrent: usize,
    pub state_file: PathBuf,
    pub scheduler_interval: Duration,
    pub poll_interval: Duration,
    /// 停止传输后等待引擎释放文件的最长时间
    pub stop_grace: Duration,
}

impl ManagerConfig {
    pub fn new(max_concurrent: usize, state_file: impl AsRef<Path>) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            state_file: state_file.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    pub fn with_intervals(mut self, scheduler: Duration, poll: Duration) -> Self {
        self.scheduler_interval = scheduler;
        self.poll_interval = poll;
        self
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Settings::default().manager_config()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE);

        let settings = Settings::load_or_default(&path);
        assert_eq!(settings, Settings::default());
        assert!(path.exists());
    }

    #[test]
    fn partial_file_fills_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE);
        std::fs::write(&path, r#"{ "max_concurrent": 5 }"#).unwrap();

        let settings = Settings::load_or_default(&path);
        assert_eq!(settings.max_concurrent, 5);
        assert_eq!(settings.poll_interval_ms, 200);
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE);
        std::fs::write(&path, "{ not json").unwrap();

        assert_eq!(Settings::load_or_default(&path), Settings::default());
    }

    #[test]
    fn manager_config_clamps_concurrency() {
        let settings = Settings {
            max_concurrent: 0,
            ..Settings::default()
        };
        let config = settings.manager_config();
        assert_eq!(config.max_concurrent, 1);
        assert_eq!(config.scheduler_interval, Duration::from_secs(1));
    }
}
