pub mod progress;
pub mod retry;

pub use progress::{ProgressStream, StoreProgressReporter, format_bytes, format_duration, format_speed};
pub use retry::{
    retry,
    retry_with_config,
    with_jitter,
    BackoffStrategy,
    Retrier,
    RetryBuilder,
    RetryConfig,
    RetryPolicy,
    RetryState,
};
