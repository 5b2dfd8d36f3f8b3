use std::sync::Arc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use crate::api::ApiClient;
use crate::batch::BatchOrchestrator;
use crate::config::Config;
use crate::core::{
    Notification,
    Notifier,
    ProgressUpdate,
    Result,
    UploadPhase,
    UploadProgressStore,
};
use crate::utils::RetryPolicy;
use crate::ws::{MessageKind, ServerMessage, Subscription, WsClient, WsClientConfig};

struct Bridge {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// 一次应用会话：API 客户端、WebSocket 连接、进度存储和通知
///
/// 每个会话都是独立的，测试中可以同时创建多个
pub struct Session {
    config: Config,
    api: Arc<ApiClient>,
    ws: WsClient,
    store: UploadProgressStore,
    notifier: Notifier,
    bridge: Mutex<Option<Bridge>>,
}

impl Session {
    pub fn new(config: &Config) -> Result<Self> {
        config.validate()?;
        let api = ApiClient::new(&config.api)?;
        let ws = WsClient::new(WsClientConfig::from(&config.websocket));

        Ok(Self {
            config: config.clone(),
            api: Arc::new(api),
            ws,
            store: UploadProgressStore::new(),
            notifier: Notifier::new(),
            bridge: Mutex::new(None),
        })
    }

    /// 连接 WebSocket 并开始把推送消息写入进度存储
    pub fn start(&self) {
        let mut bridge = self.bridge.lock();
        if bridge.as_ref().map(|b| !b.handle.is_finished()).unwrap_or(false) {
            self.ws.connect();
            return;
        }

        // 先订阅再连接，避免漏掉连接后立即推送的消息
        let messages = self.ws.on_any_message();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_bridge(
            messages,
            self.store.clone(),
            self.notifier.clone(),
            cancel.clone(),
        ));
        *bridge = Some(Bridge { cancel, handle });
        drop(bridge);

        self.ws.connect();
    }

    /// 断开连接并停止消息桥接
    pub async fn shutdown(&self) {
        let bridge = self.bridge.lock().take();
        if let Some(bridge) = bridge {
            bridge.cancel.cancel();
            let _ = bridge.handle.await;
        }
        self.ws.shutdown().await;
        tracing::info!("session stopped");
    }

    /// 使用会话配置创建批量编排器
    pub fn orchestrator(&self) -> BatchOrchestrator<ApiClient> {
        BatchOrchestrator::new(self.api.clone(), self.store.clone(), self.notifier.clone())
            .with_retry_config(self.config.retry.to_retry_config(RetryPolicy::YouTube))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn ws(&self) -> &WsClient {
        &self.ws
    }

    pub fn store(&self) -> &UploadProgressStore {
        &self.store
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }
}

async fn run_bridge(
    mut messages: Subscription<MessageKind, ServerMessage>,
    store: UploadProgressStore,
    notifier: Notifier,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = messages.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        apply_message(&store, &notifier, message);
    }
    tracing::debug!("progress bridge stopped");
}

/// 把服务端推送的消息映射到进度存储和通知
pub(crate) fn apply_message(store: &UploadProgressStore, notifier: &Notifier, message: ServerMessage) {
    match message {
        ServerMessage::UploadProgress { script_id, phase, progress, message } => {
            let phase = phase.unwrap_or(UploadPhase::Uploading);
            store.set_progress(&script_id, ProgressUpdate::new(phase, progress, message));
        }
        ServerMessage::UploadComplete { script_id, video_url, message, .. } => {
            let message = match (message.is_empty(), video_url) {
                (false, _) => message,
                (true, Some(url)) => url,
                (true, None) => "Upload complete".to_string(),
            };
            store.complete(&script_id, message);
            notifier.notify(Notification::success("Upload complete", script_id.to_string()));
        }
        ServerMessage::UploadError { script_id, error } => {
            store.fail(&script_id, error.clone());
            notifier.notify(Notification::error(format!("Upload failed: {}", script_id), error));
        }
        ServerMessage::Notification { level, title, message } => {
            notifier.notify(Notification::new(level, title, message));
        }
        ServerMessage::BatchProgress { completed, total, current } => {
            tracing::info!(completed, total, current = ?current, "server batch progress");
        }
        ServerMessage::ConnectionEstablished { client_id } => {
            tracing::debug!(client_id = ?client_id, "server acknowledged connection");
        }
        ServerMessage::Pong { .. } | ServerMessage::Unknown => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{JobId, NotificationKind};

    #[test]
    fn test_apply_progress_messages() {
        let store = UploadProgressStore::new();
        let notifier = Notifier::new();
        let mut notifications = notifier.subscribe();
        let id = JobId::from("s-1");

        apply_message(&store, &notifier, ServerMessage::UploadProgress {
            script_id: id.clone(),
            phase: None,
            progress: 40.0,
            message: "sending".into(),
        });
        let record = store.get_upload(&id).unwrap();
        assert_eq!(record.phase, UploadPhase::Uploading);
        assert_eq!(record.percentage, 40.0);
        assert!(store.is_uploading(&id));

        apply_message(&store, &notifier, ServerMessage::UploadComplete {
            script_id: id.clone(),
            video_id: Some("yt".into()),
            video_url: Some("https://youtu.be/yt".into()),
            message: String::new(),
        });
        let record = store.get_upload(&id).unwrap();
        assert_eq!(record.phase, UploadPhase::Completed);
        assert_eq!(record.percentage, 100.0);
        assert_eq!(record.message, "https://youtu.be/yt");
        assert!(store.get_active_uploads().is_empty());
        assert_eq!(notifications.try_recv().unwrap().kind, NotificationKind::Success);
    }

    #[test]
    fn test_apply_error_message_is_persistent() {
        let store = UploadProgressStore::new();
        let notifier = Notifier::new();
        let mut notifications = notifier.subscribe();
        let id = JobId::from("s-2");

        apply_message(&store, &notifier, ServerMessage::UploadError {
            script_id: id.clone(),
            error: "quota".into(),
        });
        assert_eq!(store.get_upload(&id).unwrap().phase, UploadPhase::Error);
        let notification = notifications.try_recv().unwrap();
        assert!(notification.persistent);
        assert_eq!(notification.message, "quota");
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let mut config = Config::default();
        config.websocket.url = "http://localhost/ws".into();
        assert!(Session::new(&config).is_err());
        assert!(Session::new(&Config::default()).is_ok());
    }
}
