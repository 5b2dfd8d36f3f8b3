pub mod api;
pub mod batch;
pub mod config;
pub mod core;
pub mod session;
pub mod utils;
pub mod ws;

// 重新导出常用类型
pub use core::{
    ApiError,
    BatchSettings,
    JobId,
    Notification,
    Notifier,
    PrivacyStatus,
    Result,
    UploadJob,
    UploadPhase,
    UploadProgress,
    UploadProgressStore,
    YouTubePublisher,
};

pub use api::ApiClient;
pub use batch::{BatchEvent, BatchOrchestrator, BatchSummary, JobOutcome};
pub use config::Config;
pub use session::Session;
pub use ws::{WsClient, WsClientConfig};
