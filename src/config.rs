//! `config.toml` 配置加载

use std::fs;
use std::path::Path;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::core::{ApiError, BatchSettings, PrivacyStatus, Result, MAX_BATCH_DELAY};
use crate::utils::{BackoffStrategy, RetryConfig, RetryPolicy};

pub const ENV_API_URL: &str = "TUBEPILOT_API_URL";
pub const ENV_WS_URL: &str = "TUBEPILOT_WS_URL";
pub const ENV_API_TOKEN: &str = "TUBEPILOT_API_TOKEN";

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub websocket: WebSocketConfig,
    pub batch: BatchDefaults,
    pub retry: RetryDefaults,
}

/// REST API 设置
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    /// Bearer token
    pub token: Option<String>,
    /// JSON 请求的超时（秒），不用于视频上传
    pub timeout_secs: u64,
    /// 建立连接的超时（秒），对所有请求生效
    pub connect_timeout_secs: u64,
    /// 视频上传的整体超时（秒），不设置时不限制
    pub upload_timeout_secs: Option<u64>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            token: None,
            timeout_secs: 300,
            connect_timeout_secs: 10,
            upload_timeout_secs: None,
        }
    }
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn upload_timeout(&self) -> Option<Duration> {
        self.upload_timeout_secs.map(Duration::from_secs)
    }
}

/// WebSocket 设置
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct WebSocketConfig {
    pub url: String,
    pub reconnect_interval_ms: u64,
    pub max_reconnect_attempts: u32,
    /// 心跳间隔（秒），必须大于 0
    pub heartbeat_interval_secs: u64,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8000/ws/".to_string(),
            reconnect_interval_ms: 5_000,
            max_reconnect_attempts: 10,
            heartbeat_interval_secs: 30,
        }
    }
}

impl WebSocketConfig {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

/// 批量上传默认值，可被命令行参数覆盖
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct BatchDefaults {
    pub delay_seconds: u64,
    pub privacy: PrivacyStatus,
    pub category_id: String,
    pub retry_on_error: bool,
    pub max_retries: u32,
}

impl Default for BatchDefaults {
    fn default() -> Self {
        Self {
            delay_seconds: 30,
            privacy: PrivacyStatus::Private,
            category_id: "24".to_string(),
            retry_on_error: true,
            max_retries: 3,
        }
    }
}

impl BatchDefaults {
    pub fn to_settings(&self) -> BatchSettings {
        BatchSettings::new(Duration::from_secs(self.delay_seconds))
            .with_privacy(self.privacy)
            .with_category(self.category_id.clone())
            .with_retry(self.retry_on_error, self.max_retries)
    }
}

/// 单个请求的重试设置
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RetryDefaults {
    /// 单次发布（`publish` 命令）的最大尝试次数
    ///
    /// 批量运行不使用该值，尝试次数由 `batch.max_retries + 1` 决定
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub strategy: BackoffStrategy,
}

impl Default for RetryDefaults {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryDefaults {
    pub fn to_retry_config(&self, policy: RetryPolicy) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            strategy: self.strategy,
            ..RetryConfig::default()
        }
        .with_policy(policy)
    }
}

impl Config {
    /// 读取配置文件，文件不存在时使用默认值
    pub fn load(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("config file {} not found, using defaults", path.display());
            return Ok(Config::default());
        }

        let config_str = fs::read_to_string(path)
            .map_err(|err| ApiError::Config(format!("failed to read {}: {}", path.display(), err)))?;
        Config::from_toml(&config_str)
    }

    pub fn from_toml(config_str: &str) -> Result<Config> {
        toml::from_str(config_str).map_err(|err| ApiError::Config(err.to_string()))
    }

    /// 读取并应用环境变量覆盖
    pub fn load_with_env(path: impl AsRef<Path>) -> Result<Config> {
        let mut config = Config::load(path)?;
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_API_URL) {
            self.api.base_url = url;
        }
        if let Some(url) = lookup(ENV_WS_URL) {
            self.websocket.url = url;
        }
        if let Some(token) = lookup(ENV_API_TOKEN) {
            self.api.token = Some(token);
        }
    }

    pub fn validate(&self) -> Result<()> {
        let api = url::Url::parse(&self.api.base_url)
            .map_err(|err| ApiError::Config(format!("invalid api.base_url: {}", err)))?;
        if !matches!(api.scheme(), "http" | "https") {
            return Err(ApiError::Config(format!("api.base_url must be http(s), got {}", api.scheme())));
        }

        let ws = url::Url::parse(&self.websocket.url)
            .map_err(|err| ApiError::Config(format!("invalid websocket.url: {}", err)))?;
        if !matches!(ws.scheme(), "ws" | "wss") {
            return Err(ApiError::Config(format!("websocket.url must be ws(s), got {}", ws.scheme())));
        }
        if self.websocket.heartbeat_interval_secs == 0 {
            return Err(ApiError::Config("websocket.heartbeat_interval_secs must be greater than 0".into()));
        }

        if self.batch.delay_seconds > MAX_BATCH_DELAY.as_secs() {
            return Err(ApiError::Config(format!(
                "batch.delay_seconds must be at most {}",
                MAX_BATCH_DELAY.as_secs()
            )));
        }
        Ok(())
    }
}
