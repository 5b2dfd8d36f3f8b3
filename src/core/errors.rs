use thiserror::Error;

/// 错误类别，供重试策略和上层展示按类别匹配
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Network,
    Http,
    Validation,
    Application,
    Transport,
    Cancelled,
    Internal,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("HTTP error: status code {status}, message: {message}")]
    Http {
        status: u16,
        /// 服务端给出的错误原因，例如 YouTube 的 `quotaExceeded`
        reason: Option<String>,
        message: String,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    /// 2xx 响应但 body 为 `{success: false, message}`
    #[error("Application error: {0}")]
    Application(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("WebSocket is not connected")]
    NotConnected,

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Config error: {0}")]
    Config(String),
}

impl ApiError {
    pub fn http(status: u16, reason: Option<String>, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            reason,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Network(_) | ApiError::Timeout => ErrorKind::Network,
            ApiError::Http { .. } => ErrorKind::Http,
            ApiError::Validation(_) => ErrorKind::Validation,
            ApiError::Application(_) => ErrorKind::Application,
            ApiError::WebSocket(_) | ApiError::NotConnected => ErrorKind::Transport,
            ApiError::Cancelled => ErrorKind::Cancelled,
            ApiError::Decode(_) | ApiError::Io(_) | ApiError::Config(_) => ErrorKind::Internal,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            ApiError::Http { reason, .. } => reason.as_deref(),
            _ => None,
        }
    }

    pub fn is_client_error(&self) -> bool {
        matches!(self.status(), Some(400..=499))
    }

    pub fn is_server_error(&self) -> bool {
        matches!(self.status(), Some(500..=599))
    }

    /// YouTube 配额耗尽，当天内重试没有意义
    pub fn is_quota_exceeded(&self) -> bool {
        self.status() == Some(403) && self.reason() == Some("quotaExceeded")
    }

    /// 限流类错误（403 rateLimitExceeded / userRateLimitExceeded 或 429）
    pub fn is_rate_limited(&self) -> bool {
        match self.status() {
            Some(429) => true,
            Some(403) => matches!(
                self.reason(),
                Some("rateLimitExceeded") | Some("userRateLimitExceeded")
            ),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::Timeout
        } else if err.is_decode() {
            ApiError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            ApiError::http(status.as_u16(), None, err.to_string())
        } else {
            ApiError::Network(err.to_string())
        }
    }
}

impl From<std::io::Error> for ApiError {
    fn from(err: std::io::Error) -> Self {
        ApiError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Decode(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ApiError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ApiError::WebSocket(err.to_string())
    }
}

pub type Result<T, E = ApiError> = std::result::Result<T, E>;
