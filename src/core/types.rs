use std::path::PathBuf;
use std::time::Duration;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// 用于序列化 Duration（按秒）
fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_u64(duration.as_secs())
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let secs = u64::deserialize(deserializer)?;
    Ok(Duration::from_secs(secs))
}

/// 批量上传两次提交之间的最小间隔
pub const MIN_BATCH_DELAY: Duration = Duration::from_secs(30);

/// 批量任务之间的最大间隔
pub const MAX_BATCH_DELAY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// 内容项标识（脚本 ID）
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct JobId(pub String);

// 服务端有时以数字下发 ID
impl<'de> Deserialize<'de> for JobId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawId {
            Text(String),
            Number(i64),
        }

        Ok(match RawId::deserialize(deserializer)? {
            RawId::Text(id) => JobId(id),
            RawId::Number(id) => JobId(id.to_string()),
        })
    }
}

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// YouTube 公开范围
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PrivacyStatus {
    #[default]
    Private,
    Unlisted,
    Public,
}

impl PrivacyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrivacyStatus::Private => "private",
            PrivacyStatus::Unlisted => "unlisted",
            PrivacyStatus::Public => "public",
        }
    }
}

impl std::str::FromStr for PrivacyStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "private" => Ok(PrivacyStatus::Private),
            "unlisted" => Ok(PrivacyStatus::Unlisted),
            "public" => Ok(PrivacyStatus::Public),
            other => Err(format!("unknown privacy status '{}'", other)),
        }
    }
}

/// 发布选项
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PublishOptions {
    pub privacy: PrivacyStatus,
    pub category_id: String,
    pub scheduled_time: Option<DateTime<Utc>>,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            privacy: PrivacyStatus::Private,
            // 24 = Entertainment
            category_id: "24".to_string(),
            scheduled_time: None,
        }
    }
}

/// 上传任务
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct UploadJob {
    /// 内容项 ID
    pub id: JobId,
    /// 本地视频文件（可选，已上传到服务端时为空）
    pub file: Option<PathBuf>,
    /// 发布选项
    pub options: PublishOptions,
}

impl UploadJob {
    pub fn new(id: impl Into<JobId>) -> Self {
        Self {
            id: id.into(),
            file: None,
            options: PublishOptions::default(),
        }
    }

    pub fn with_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn with_options(mut self, options: PublishOptions) -> Self {
        self.options = options;
        self
    }
}

/// 上传阶段
///
/// 除 `Error` 外只能向前推进，`Error` 为终态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadPhase {
    Preparing,
    Uploading,
    Processing,
    #[serde(alias = "complete", alias = "done")]
    Completed,
    #[serde(alias = "failed")]
    Error,
}

impl UploadPhase {
    fn rank(&self) -> u8 {
        match self {
            UploadPhase::Preparing => 0,
            UploadPhase::Uploading => 1,
            UploadPhase::Processing => 2,
            UploadPhase::Completed => 3,
            UploadPhase::Error => 4,
        }
    }

    /// 是否允许从 `self` 迁移到 `next`
    pub fn can_advance_to(&self, next: UploadPhase) -> bool {
        match self {
            UploadPhase::Error => false,
            _ => next == UploadPhase::Error || next.rank() >= self.rank(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadPhase::Completed | UploadPhase::Error)
    }
}

/// 上传进度
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadProgress {
    pub job_id: JobId,
    pub phase: UploadPhase,
    /// 完成百分比 [0, 100]
    pub percentage: f64,
    pub message: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UploadProgress {
    pub fn is_active(&self) -> bool {
        self.percentage < 100.0 && self.phase != UploadPhase::Error
    }
}

/// 一次进度更新（推送消息或本地上传回调）
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub phase: UploadPhase,
    pub percentage: f64,
    pub message: String,
}

impl ProgressUpdate {
    pub fn new(phase: UploadPhase, percentage: f64, message: impl Into<String>) -> Self {
        Self {
            phase,
            percentage,
            message: message.into(),
        }
    }
}

/// 批量上传配置，单次批量运行期间不可变
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BatchSettings {
    #[serde(
        rename = "delay_seconds",
        serialize_with = "serialize_duration",
        deserialize_with = "deserialize_duration"
    )]
    delay: Duration,
    pub privacy: PrivacyStatus,
    pub category_id: String,
    pub publish_at: Option<DateTime<Utc>>,
    pub retry_on_error: bool,
    pub max_retries: u32,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            delay: MIN_BATCH_DELAY,
            privacy: PrivacyStatus::Private,
            category_id: "24".to_string(),
            publish_at: None,
            retry_on_error: true,
            max_retries: 3,
        }
    }
}

impl BatchSettings {
    pub fn new(delay: Duration) -> Self {
        Self::default().with_delay(delay)
    }

    /// 设置间隔，限制在 30 秒到 7 天之间
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay.clamp(MIN_BATCH_DELAY, MAX_BATCH_DELAY);
        self
    }

    pub fn with_privacy(mut self, privacy: PrivacyStatus) -> Self {
        self.privacy = privacy;
        self
    }

    pub fn with_category(mut self, category_id: impl Into<String>) -> Self {
        self.category_id = category_id.into();
        self
    }

    pub fn with_publish_at(mut self, publish_at: Option<DateTime<Utc>>) -> Self {
        self.publish_at = publish_at;
        self
    }

    pub fn with_retry(mut self, retry_on_error: bool, max_retries: u32) -> Self {
        self.retry_on_error = retry_on_error;
        self.max_retries = max_retries;
        self
    }

    /// 实际生效的间隔（反序列化的值同样受上下限约束）
    pub fn delay(&self) -> Duration {
        self.delay.clamp(MIN_BATCH_DELAY, MAX_BATCH_DELAY)
    }

    /// 第 `index` 个任务的定时发布时间：`publish_at + index * delay`
    ///
    /// 结果超出可表示的时间范围时返回 `None`
    pub fn scheduled_time_for(&self, index: usize) -> Option<DateTime<Utc>> {
        let at = self.publish_at?;
        let index = u32::try_from(index).ok()?;
        let offset = self.delay().checked_mul(index)?;
        let offset = chrono::Duration::from_std(offset).ok()?;
        at.checked_add_signed(offset)
    }

    /// 第 `index` 个任务的发布选项
    pub fn options_for(&self, index: usize) -> PublishOptions {
        PublishOptions {
            privacy: self.privacy,
            category_id: self.category_id.clone(),
            scheduled_time: self.scheduled_time_for(index),
        }
    }
}

/// WebSocket 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub reconnect_attempts: u32,
    pub last_error: Option<String>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            reconnect_attempts: 0,
            last_error: None,
        }
    }
}

/// 连接状态变更事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionChange {
    pub is_connected: bool,
    pub status: ConnectionStatus,
    pub state: ConnectionState,
}

/// `POST /api/upload/video/{id}` 响应
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct VideoUploadResponse {
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub file_path: Option<String>,
}

/// `POST /api/upload/youtube/{id}` 请求
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct YouTubeUploadRequest {
    pub privacy_status: PrivacyStatus,
    pub category_id: String,
    pub scheduled_time: Option<DateTime<Utc>>,
}

impl From<&PublishOptions> for YouTubeUploadRequest {
    fn from(options: &PublishOptions) -> Self {
        Self {
            privacy_status: options.privacy,
            category_id: options.category_id.clone(),
            scheduled_time: options.scheduled_time,
        }
    }
}

/// `POST /api/upload/youtube/{id}` 响应
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct YouTubeUploadResponse {
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub video_id: Option<String>,
    #[serde(default)]
    pub video_url: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// `POST /api/upload/youtube/batch` 请求
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BatchUploadRequest {
    pub script_ids: Vec<JobId>,
    pub privacy_status: PrivacyStatus,
    pub category_id: String,
    pub delay_seconds: u64,
}

impl BatchUploadRequest {
    pub fn new(script_ids: Vec<JobId>, settings: &BatchSettings) -> Self {
        Self {
            script_ids,
            privacy_status: settings.privacy,
            category_id: settings.category_id.clone(),
            delay_seconds: settings.delay().as_secs(),
        }
    }
}

/// `POST /api/upload/youtube/batch` 响应
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BatchUploadResponse {
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub total: Option<u32>,
    #[serde(default)]
    pub queued: Option<Vec<JobId>>,
}

fn default_true() -> bool {
    true
}

// 静态断言确保类型是 Send的
const _: () = {
    fn assert_send<T: Send + Sync>() {}
    fn assert_types() {
        assert_send::<UploadJob>();
        assert_send::<UploadProgress>();
        assert_send::<ConnectionState>();
        assert_send::<BatchSettings>();
    }
};
