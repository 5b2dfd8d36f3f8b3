mod errors;
mod notify;
mod store;
mod traits;
mod types;

pub use traits::YouTubePublisher;

pub use errors::{ApiError, ErrorKind, Result};
pub use notify::{Notification, NotificationKind, Notifier};
pub use store::{ProgressChange, UploadProgressStore};
pub use types::{
    BatchSettings,
    BatchUploadRequest,
    BatchUploadResponse,
    ConnectionChange,
    ConnectionState,
    ConnectionStatus,
    JobId,
    PrivacyStatus,
    ProgressUpdate,
    PublishOptions,
    UploadJob,
    UploadPhase,
    UploadProgress,
    VideoUploadResponse,
    YouTubeUploadRequest,
    YouTubeUploadResponse,
    MAX_BATCH_DELAY,
    MIN_BATCH_DELAY,
};
