//! 服务端配置
//!
//! 从 `CODEX_CONFIG` 指定的 JSON 文件读取，缺省字段取默认值；
//! `CODEX_RESUME=1` 强制从快照恢复。

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use protocol::{HEARTBEAT_INTERVAL_MS, HEARTBEAT_TIMEOUT_MS, POLL_INTERVAL_MS};

/// 配置文件路径环境变量
pub const CONFIG_ENV: &str = "CODEX_CONFIG";

/// 恢复模式环境变量
pub const RESUME_ENV: &str = "CODEX_RESUME";

/// 服务端配置
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    /// 流式传输端口
    pub stream_port: u16,
    /// 调用式传输端口
    pub call_port: u16,
    /// 会话标识（决定快照文件名）
    pub session_id: String,
    /// 快照目录；None 时使用平台数据目录
    pub saves_dir: Option<PathBuf>,
    /// 启动时从快照恢复
    pub resume: bool,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub poll_interval_ms: u64,
    /// 发牌随机种子（测试用）
    pub seed: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            stream_port: 9527,
            call_port: 9528,
            session_id: "default".to_string(),
            saves_dir: None,
            resume: false,
            heartbeat_interval_ms: HEARTBEAT_INTERVAL_MS,
            heartbeat_timeout_ms: HEARTBEAT_TIMEOUT_MS,
            poll_interval_ms: POLL_INTERVAL_MS,
            seed: None,
        }
    }
}

impl ServerConfig {
    /// 从 JSON 文件加载
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("读取配置文件失败: {:?}", path))?;
        serde_json::from_str(&content).with_context(|| format!("解析配置文件失败: {:?}", path))
    }

    /// 按环境变量加载
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        if std::env::var(RESUME_ENV).is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true")) {
            config.resume = true;
        }
        Ok(config)
    }

    pub fn stream_addr(&self) -> String {
        format!("{}:{}", self.host, self.stream_port)
    }

    pub fn call_addr(&self) -> String {
        format!("{}:{}", self.host, self.call_port)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
