use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use bytes::Bytes;
use futures::Stream;
use pin_project_lite::pin_project;
use crate::core::{JobId, ProgressUpdate, UploadPhase, UploadProgressStore};

/// 本地文件传输阶段写入进度存储的比例上限，剩余部分留给服务端处理阶段
const LOCAL_TRANSFER_SHARE: f64 = 90.0;

/// 把已发送字节数写入进度存储
pub struct StoreProgressReporter {
    store: UploadProgressStore,
    job_id: JobId,
    total_bytes: u64,
    transferred: u64,
    start_time: Instant,
    last_update: Option<Instant>,
    update_interval: Duration,
}

impl StoreProgressReporter {
    pub fn new(store: UploadProgressStore, job_id: JobId, total_bytes: u64) -> Self {
        Self {
            store,
            job_id,
            total_bytes,
            transferred: 0,
            start_time: Instant::now(),
            last_update: None,
            update_interval: Duration::from_millis(250),
        }
    }

    pub fn with_update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = interval;
        self
    }

    /// 累加字节，按间隔节流写入
    fn record_bytes(&mut self, bytes: u64) {
        self.transferred += bytes;
        let now = Instant::now();
        let due = self
            .last_update
            .map(|last| now.duration_since(last) >= self.update_interval)
            .unwrap_or(true);
        if due || self.transferred >= self.total_bytes {
            self.flush(now);
        }
    }

    fn flush(&mut self, now: Instant) {
        self.last_update = Some(now);
        let percentage = if self.total_bytes > 0 {
            (self.transferred as f64 / self.total_bytes as f64) * LOCAL_TRANSFER_SHARE
        } else {
            0.0
        };
        let elapsed = self.start_time.elapsed().as_secs_f64();
        let speed = if elapsed > 0.0 {
            self.transferred as f64 / elapsed
        } else {
            0.0
        };
        let message = format!(
            "{} / {} ({})",
            format_bytes(self.transferred),
            format_bytes(self.total_bytes),
            format_speed(speed)
        );
        self.store.set_progress(
            &self.job_id,
            ProgressUpdate::new(UploadPhase::Uploading, percentage, message),
        );
    }

    pub fn transferred(&self) -> u64 {
        self.transferred
    }
}

pin_project! {
    /// 统计经过的字节数并上报进度的流包装
    pub struct ProgressStream<S> {
        #[pin]
        inner: S,
        reporter: StoreProgressReporter,
    }
}

impl<S> ProgressStream<S> {
    pub fn new(inner: S, reporter: StoreProgressReporter) -> Self {
        Self { inner, reporter }
    }
}

impl<S> Stream for ProgressStream<S>
where
    S: Stream<Item = std::io::Result<Bytes>>,
{
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();

        match this.inner.poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                let bytes_len = chunk.len();
                if bytes_len > 0 {
                    this.reporter.record_bytes(bytes_len as u64);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            other => other,
        }
    }
}

/// 格式化字节数
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    const UNIT_SIZE: f64 = 1024.0;

    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= UNIT_SIZE && unit_index < UNITS.len() - 1 {
        size /= UNIT_SIZE;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// 格式化速度
pub fn format_speed(bytes_per_second: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_second as u64))
}

/// 格式化持续时间
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}
