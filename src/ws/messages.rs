use chrono::Utc;
use serde::{Deserialize, Serialize};
use crate::core::{JobId, NotificationKind, Result, UploadPhase};

/// 消息类型，用于按类型订阅
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    UploadProgress,
    UploadComplete,
    UploadError,
    BatchProgress,
    Notification,
    Pong,
    ConnectionEstablished,
    Unknown,
}

/// 服务端推送的消息，按 `type` 字段区分
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    UploadProgress {
        #[serde(alias = "scriptId")]
        script_id: JobId,
        #[serde(default, alias = "status")]
        phase: Option<UploadPhase>,
        #[serde(alias = "percentage")]
        progress: f64,
        #[serde(default)]
        message: String,
    },
    UploadComplete {
        #[serde(alias = "scriptId")]
        script_id: JobId,
        #[serde(default)]
        video_id: Option<String>,
        #[serde(default)]
        video_url: Option<String>,
        #[serde(default)]
        message: String,
    },
    UploadError {
        #[serde(alias = "scriptId")]
        script_id: JobId,
        #[serde(alias = "message")]
        error: String,
    },
    BatchProgress {
        completed: u32,
        total: u32,
        #[serde(default)]
        current: Option<JobId>,
    },
    Notification {
        #[serde(default = "default_level")]
        level: NotificationKind,
        #[serde(default)]
        title: String,
        #[serde(default)]
        message: String,
    },
    Pong {
        #[serde(default)]
        timestamp: Option<i64>,
    },
    ConnectionEstablished {
        #[serde(default)]
        client_id: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

fn default_level() -> NotificationKind {
    NotificationKind::Info
}

impl ServerMessage {
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            ServerMessage::UploadProgress { .. } => MessageKind::UploadProgress,
            ServerMessage::UploadComplete { .. } => MessageKind::UploadComplete,
            ServerMessage::UploadError { .. } => MessageKind::UploadError,
            ServerMessage::BatchProgress { .. } => MessageKind::BatchProgress,
            ServerMessage::Notification { .. } => MessageKind::Notification,
            ServerMessage::Pong { .. } => MessageKind::Pong,
            ServerMessage::ConnectionEstablished { .. } => MessageKind::ConnectionEstablished,
            ServerMessage::Unknown => MessageKind::Unknown,
        }
    }

    /// 与某个内容项相关的消息返回其 ID
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            ServerMessage::UploadProgress { script_id, .. }
            | ServerMessage::UploadComplete { script_id, .. }
            | ServerMessage::UploadError { script_id, .. } => Some(script_id),
            _ => None,
        }
    }
}

/// 客户端发送的消息
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// 心跳
    Ping { timestamp: i64 },
    Subscribe { channel: String },
}

impl ClientMessage {
    pub fn ping() -> Self {
        ClientMessage::Ping {
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_progress_variants() {
        let msg = ServerMessage::parse(
            r#"{"type":"upload_progress","script_id":"s-1","progress":42.5,"status":"uploading","message":"chunk"}"#,
        )
        .unwrap();
        assert_eq!(msg.kind(), MessageKind::UploadProgress);
        assert_eq!(
            msg,
            ServerMessage::UploadProgress {
                script_id: "s-1".into(),
                phase: Some(UploadPhase::Uploading),
                progress: 42.5,
                message: "chunk".into(),
            }
        );

        let msg = ServerMessage::parse(r#"{"type":"upload_progress","scriptId":"s-2","percentage":10}"#).unwrap();
        assert_eq!(msg.job_id(), Some(&JobId::from("s-2")));
    }

    #[test]
    fn test_unknown_type_is_tolerated() {
        let msg = ServerMessage::parse(r#"{"type":"script_parsed","id":3}"#).unwrap();
        assert_eq!(msg, ServerMessage::Unknown);
        assert_eq!(msg.kind(), MessageKind::Unknown);

        assert!(ServerMessage::parse("not json").is_err());
    }

    #[test]
    fn test_client_ping_format() {
        let text = serde_json::to_string(&ClientMessage::Ping { timestamp: 5 }).unwrap();
        assert_eq!(text, r#"{"type":"ping","timestamp":5}"#);
    }
}
