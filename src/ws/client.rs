use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use crate::config::WebSocketConfig;
use crate::core::{ConnectionChange, ConnectionState, ConnectionStatus};
use super::bus::{EventBus, Subscription};
use super::messages::{ClientMessage, MessageKind, ServerMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// 心跳间隔下限，`interval_at` 不接受零周期
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(100);

/// WebSocket 客户端配置
#[derive(Debug, Clone)]
pub struct WsClientConfig {
    pub url: String,
    /// 重连间隔
    pub reconnect_interval: Duration,
    /// 最大重连次数，用尽后停在 `Error`
    pub max_reconnect_attempts: u32,
    /// 心跳间隔
    pub heartbeat_interval: Duration,
}

impl Default for WsClientConfig {
    fn default() -> Self {
        WsClientConfig::from(&WebSocketConfig::default())
    }
}

impl From<&WebSocketConfig> for WsClientConfig {
    fn from(config: &WebSocketConfig) -> Self {
        Self {
            url: config.url.clone(),
            reconnect_interval: config.reconnect_interval(),
            max_reconnect_attempts: config.max_reconnect_attempts,
            heartbeat_interval: config.heartbeat_interval().max(MIN_HEARTBEAT_INTERVAL),
        }
    }
}

/// 连接状态和代数（generation）放在同一把锁里，
/// 旧的连接任务在 generation 变化后不能再改写状态
struct StateCell {
    generation: u64,
    connection: ConnectionState,
}

struct Supervisor {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    config: WsClientConfig,
    state: RwLock<StateCell>,
    change_tx: broadcast::Sender<ConnectionChange>,
    bus: EventBus<MessageKind, ServerMessage>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    supervisor: Mutex<Option<Supervisor>>,
    last_pong: Mutex<Option<DateTime<Utc>>>,
}

/// 连接结束原因
enum ConnectionEnd {
    Cancelled,
    Closed(String),
    Failed(String),
}

/// 自动重连的 WebSocket 客户端
///
/// 克隆得到同一个连接的句柄。`connect` 需要在 tokio 运行时中调用
#[derive(Clone)]
pub struct WsClient {
    inner: Arc<Inner>,
}

impl WsClient {
    pub fn new(config: WsClientConfig) -> Self {
        // 最大缓存 64 个状态变更
        let (change_tx, _) = broadcast::channel(64);

        Self {
            inner: Arc::new(Inner {
                config,
                state: RwLock::new(StateCell {
                    generation: 0,
                    connection: ConnectionState::default(),
                }),
                change_tx,
                bus: EventBus::new(),
                outbound: Mutex::new(None),
                supervisor: Mutex::new(None),
                last_pong: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &WsClientConfig {
        &self.inner.config
    }

    /// 建立连接；已连接或正在连接时不做任何事
    pub fn connect(&self) {
        let mut supervisor = self.inner.supervisor.lock();

        let generation = {
            let mut cell = self.inner.state.write();
            let running = supervisor
                .as_ref()
                .map(|s| !s.handle.is_finished())
                .unwrap_or(false);
            if running
                && matches!(
                    cell.connection.status,
                    ConnectionStatus::Connecting | ConnectionStatus::Connected
                )
            {
                return;
            }

            cell.generation += 1;
            cell.connection.reconnect_attempts = 0;
            cell.generation
        };

        if let Some(previous) = supervisor.take() {
            previous.cancel.cancel();
        }

        self.inner.transition(generation, ConnectionStatus::Connecting, None);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_supervisor(self.inner.clone(), generation, cancel.clone()));
        *supervisor = Some(Supervisor { cancel, handle });
    }

    /// 关闭连接并停止自动重连，直到再次调用 `connect`
    pub fn disconnect(&self) {
        let previous = self.inner.supervisor.lock().take();
        let generation = {
            let mut cell = self.inner.state.write();
            cell.generation += 1;
            cell.generation
        };
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
        *self.inner.outbound.lock() = None;
        self.inner.transition(generation, ConnectionStatus::Disconnected, None);
        tracing::info!(url = %self.inner.config.url, "websocket disconnected by client");
    }

    /// 断开并等待后台任务退出
    pub async fn shutdown(&self) {
        let previous = self.inner.supervisor.lock().take();
        if let Some(previous) = previous {
            previous.cancel.cancel();
            let _ = previous.handle.await;
        }
        self.disconnect();
    }

    /// 发送消息；未连接时返回 `false`
    pub fn send_message(&self, message: &ClientMessage) -> bool {
        if !self.is_connected() {
            return false;
        }
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!("failed to serialize websocket message: {}", err);
                return false;
            }
        };
        match self.inner.outbound.lock().as_ref() {
            Some(tx) => tx.send(Message::Text(text)).is_ok(),
            None => false,
        }
    }

    /// 订阅某一类消息，句柄 drop 后退订
    pub fn on_message(&self, kind: MessageKind) -> Subscription<MessageKind, ServerMessage> {
        self.inner.bus.subscribe(kind)
    }

    /// 订阅所有消息
    pub fn on_any_message(&self) -> Subscription<MessageKind, ServerMessage> {
        self.inner.bus.subscribe_all()
    }

    /// 订阅连接状态变更
    ///
    /// 接收速度跟不上时可能丢失事件（lagged），可再用 `state()` 读取当前状态
    pub fn on_connection_change(&self) -> broadcast::Receiver<ConnectionChange> {
        self.inner.change_tx.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.read().connection.clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.state.read().connection.status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.state.read().connection.reconnect_attempts
    }

    /// 最近一次收到 pong 的时间（传输层 pong 或应用层 `pong` 消息）
    pub fn last_pong(&self) -> Option<DateTime<Utc>> {
        *self.inner.last_pong.lock()
    }
}

impl Inner {
    /// 状态迁移；generation 已过期时忽略
    fn transition(&self, generation: u64, status: ConnectionStatus, error: Option<String>) {
        let change = {
            let mut cell = self.state.write();
            if cell.generation != generation {
                return;
            }
            let state = &mut cell.connection;
            if state.status == status && (error.is_none() || state.last_error == error) {
                return;
            }
            state.status = status;
            match status {
                ConnectionStatus::Connected => state.last_error = None,
                _ if error.is_some() => state.last_error = error,
                _ => {}
            }
            ConnectionChange {
                is_connected: status == ConnectionStatus::Connected,
                status,
                state: state.clone(),
            }
        };

        tracing::info!(
            status = ?change.status,
            attempts = change.state.reconnect_attempts,
            "websocket state changed"
        );
        let _ = self.change_tx.send(change);
    }

    fn mark_connected(&self, generation: u64) {
        {
            let mut cell = self.state.write();
            if cell.generation != generation {
                return;
            }
            cell.connection.reconnect_attempts = 0;
        }
        self.transition(generation, ConnectionStatus::Connected, None);
    }

    /// 安排下一次重连；次数用尽或已过期时返回 `false`
    fn schedule_reconnect(&self, generation: u64) -> bool {
        let exhausted = {
            let mut cell = self.state.write();
            if cell.generation != generation {
                return false;
            }
            let max = self.config.max_reconnect_attempts;
            if cell.connection.reconnect_attempts >= max {
                true
            } else {
                cell.connection.reconnect_attempts += 1;
                tracing::warn!(
                    attempt = cell.connection.reconnect_attempts,
                    max,
                    delay_ms = self.config.reconnect_interval.as_millis() as u64,
                    "websocket reconnect scheduled"
                );
                false
            }
        };

        if exhausted {
            let message = format!(
                "maximum reconnect attempts ({}) reached",
                self.config.max_reconnect_attempts
            );
            tracing::error!(url = %self.config.url, "{}", message);
            self.transition(generation, ConnectionStatus::Error, Some(message));
            return false;
        }
        true
    }

    fn set_outbound(&self, generation: u64, tx: Option<mpsc::UnboundedSender<Message>>) {
        if self.state.read().generation == generation {
            *self.outbound.lock() = tx;
        }
    }

    fn dispatch_text(&self, text: &str) {
        let message = match ServerMessage::parse(text) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!("dropping malformed websocket message: {}", err);
                return;
            }
        };
        if let ServerMessage::Pong { .. } = message {
            *self.last_pong.lock() = Some(Utc::now());
        }
        let kind = message.kind();
        let delivered = self.bus.publish(&kind, message);
        tracing::trace!(?kind, delivered, "websocket message dispatched");
    }
}

async fn run_supervisor(inner: Arc<Inner>, generation: u64, cancel: CancellationToken) {
    loop {
        if cancel.is_cancelled() {
            break;
        }
        inner.transition(generation, ConnectionStatus::Connecting, None);

        let connected = tokio::select! {
            _ = cancel.cancelled() => break,
            result = connect_async(inner.config.url.as_str()) => result,
        };

        match connected {
            Ok((stream, _response)) => {
                tracing::info!(url = %inner.config.url, "websocket connected");
                inner.mark_connected(generation);
                let end = drive_connection(&inner, generation, stream, &cancel).await;
                inner.set_outbound(generation, None);

                match end {
                    ConnectionEnd::Cancelled => break,
                    ConnectionEnd::Closed(reason) => {
                        tracing::warn!(%reason, "websocket closed");
                        inner.transition(generation, ConnectionStatus::Disconnected, None);
                    }
                    ConnectionEnd::Failed(err) => {
                        tracing::warn!(error = %err, "websocket connection failed");
                        inner.transition(generation, ConnectionStatus::Error, Some(err));
                    }
                }
            }
            Err(err) => {
                tracing::warn!(url = %inner.config.url, error = %err, "websocket connect failed");
                inner.transition(generation, ConnectionStatus::Error, Some(err.to_string()));
            }
        }

        if !inner.schedule_reconnect(generation) {
            break;
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(inner.config.reconnect_interval) => {}
        }
    }
}

async fn drive_connection(
    inner: &Inner,
    generation: u64,
    stream: WsStream,
    cancel: &CancellationToken,
) -> ConnectionEnd {
    let (mut sink, mut source) = stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    inner.set_outbound(generation, Some(tx));

    let period = inner.config.heartbeat_interval.max(MIN_HEARTBEAT_INTERVAL);
    let mut heartbeat = interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                let _ = sink.close().await;
                return ConnectionEnd::Cancelled;
            }
            _ = heartbeat.tick() => {
                let ping = match serde_json::to_string(&ClientMessage::ping()) {
                    Ok(ping) => ping,
                    Err(err) => return ConnectionEnd::Failed(err.to_string()),
                };
                tracing::trace!("sending heartbeat");
                if let Err(err) = sink.send(Message::Text(ping)).await {
                    return ConnectionEnd::Failed(err.to_string());
                }
            }
            Some(outgoing) = rx.recv() => {
                if let Err(err) = sink.send(outgoing).await {
                    return ConnectionEnd::Failed(err.to_string());
                }
            }
            incoming = source.next() => match incoming {
                Some(Ok(Message::Text(text))) => inner.dispatch_text(&text),
                Some(Ok(Message::Pong(_))) => {
                    *inner.last_pong.lock() = Some(Utc::now());
                }
                // 传输层 ping 由 tungstenite 自动回复
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Binary(data))) => {
                    tracing::debug!(len = data.len(), "ignoring binary websocket frame");
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| format!("{} {}", u16::from(f.code), f.reason))
                        .unwrap_or_else(|| "closed by server".to_string());
                    return ConnectionEnd::Closed(reason);
                }
                Some(Err(err)) => return ConnectionEnd::Failed(err.to_string()),
                None => return ConnectionEnd::Closed("stream ended".to_string()),
            }
        }
    }
}
