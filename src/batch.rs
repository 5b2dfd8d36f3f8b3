use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use crate::core::{
    ApiError,
    BatchSettings,
    BatchUploadRequest,
    BatchUploadResponse,
    JobId,
    Notification,
    Notifier,
    Result,
    UploadJob,
    UploadProgressStore,
    YouTubePublisher,
    YouTubeUploadRequest,
    YouTubeUploadResponse,
};
use crate::utils::{Retrier, RetryConfig, RetryPolicy};

/// 单个任务的结果
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub job_id: JobId,
    pub result: std::result::Result<YouTubeUploadResponse, ApiError>,
}

impl JobOutcome {
    pub fn success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn error(&self) -> Option<&ApiError> {
        self.result.as_ref().err()
    }
}

/// 一次批量运行的汇总
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchSummary {
    pub outcomes: Vec<JobOutcome>,
    /// 请求的任务总数
    pub total: usize,
    pub cancelled: bool,
}

impl BatchSummary {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.success()).count()
    }

    /// 因 fail-fast 或取消而没有提交的任务数
    pub fn skipped(&self) -> usize {
        self.total.saturating_sub(self.outcomes.len())
    }

    pub fn all_succeeded(&self) -> bool {
        self.total > 0 && self.succeeded() == self.total
    }
}

/// 批量运行过程中的事件
#[derive(Debug, Clone, PartialEq)]
pub enum BatchEvent {
    JobStarted { index: usize, job_id: JobId },
    JobFinished { index: usize, job_id: JobId, success: bool },
    Waiting { next_index: usize, delay: Duration },
    Finished(BatchSummary),
    /// 任务状态已变化，观察者应刷新任务列表
    JobsInvalidated,
}

/// 批量发布编排器
///
/// 任务严格串行：前一个任务的调用返回后才会开始等待下一个
pub struct BatchOrchestrator<P> {
    publisher: Arc<P>,
    store: UploadProgressStore,
    notifier: Notifier,
    retry: RetryConfig,
    events: broadcast::Sender<BatchEvent>,
}

impl<P: YouTubePublisher> BatchOrchestrator<P> {
    pub fn new(publisher: Arc<P>, store: UploadProgressStore, notifier: Notifier) -> Self {
        let (events, _) = broadcast::channel(64);

        Self {
            publisher,
            store,
            notifier,
            retry: RetryConfig::youtube(),
            events,
        }
    }

    /// 替换重试的延迟参数；重试条件总是使用 YouTube 策略
    ///
    /// `max_attempts` 不生效，每个任务的尝试次数由 `BatchSettings::max_retries + 1` 决定
    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry.with_policy(RetryPolicy::YouTube);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BatchEvent> {
        self.events.subscribe()
    }

    pub fn store(&self) -> &UploadProgressStore {
        &self.store
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// 逐个提交任务，任务之间等待 `settings.delay()`
    ///
    /// `cancel` 在每个任务提交前和每次等待期间检查，已经发出的请求不会被中断
    pub async fn run(
        &self,
        jobs: &[UploadJob],
        settings: &BatchSettings,
        cancel: CancellationToken,
    ) -> BatchSummary {
        let mut summary = BatchSummary {
            outcomes: Vec::with_capacity(jobs.len()),
            total: jobs.len(),
            cancelled: false,
        };
        let delay = settings.delay();
        tracing::info!(
            jobs = jobs.len(),
            delay_secs = delay.as_secs(),
            retry_on_error = settings.retry_on_error,
            "starting batch upload"
        );

        for (index, job) in jobs.iter().enumerate() {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }

            let outcome = self.run_job(index, job, settings).await;
            let failed = !outcome.success();
            summary.outcomes.push(outcome);

            if failed && !settings.retry_on_error {
                tracing::warn!(job_id = %job.id, "stopping batch after failure");
                break;
            }

            if index + 1 < jobs.len() {
                self.emit(BatchEvent::Waiting { next_index: index + 1, delay });
                tokio::select! {
                    _ = cancel.cancelled() => {
                        summary.cancelled = true;
                        break;
                    }
                    _ = sleep(delay) => {}
                }
            }
        }

        if summary.cancelled {
            tracing::warn!(skipped = summary.skipped(), "batch upload cancelled");
        }
        self.report(&summary);
        summary
    }

    async fn run_job(&self, index: usize, job: &UploadJob, settings: &BatchSettings) -> JobOutcome {
        let mut options = settings.options_for(index);
        // 任务自带的定时发布时间优先
        if job.options.scheduled_time.is_some() && settings.publish_at.is_none() {
            options.scheduled_time = job.options.scheduled_time;
        }
        let request = YouTubeUploadRequest::from(&options);

        self.store.start(&job.id, "Publishing to YouTube");
        self.emit(BatchEvent::JobStarted { index, job_id: job.id.clone() });
        tracing::info!(
            index,
            job_id = %job.id,
            scheduled = ?request.scheduled_time,
            "submitting job"
        );

        let result = if settings.retry_on_error {
            // 批量设置中的重试次数优先于全局配置
            let retrier = Retrier::new(RetryConfig {
                max_attempts: settings.max_retries.saturating_add(1),
                ..self.retry.clone()
            });
            let publisher = &*self.publisher;
            let job_id = &job.id;
            let request = &request;
            retrier
                .execute(move || publisher.upload_to_youtube(job_id, request))
                .await
        } else {
            self.publisher.upload_to_youtube(&job.id, &request).await
        };

        match &result {
            Ok(response) => {
                tracing::info!(job_id = %job.id, video_id = ?response.video_id, "job published");
                let message = if response.message.is_empty() {
                    "Published to YouTube".to_string()
                } else {
                    response.message.clone()
                };
                self.store.complete(&job.id, message);
            }
            Err(err) => {
                tracing::warn!(job_id = %job.id, error = %err, "job failed");
                self.store.fail(&job.id, err.to_string());
            }
        }

        let outcome = JobOutcome { job_id: job.id.clone(), result };
        self.emit(BatchEvent::JobFinished {
            index,
            job_id: job.id.clone(),
            success: outcome.success(),
        });
        outcome
    }

    /// 汇总通知：全部成功、部分成功、全部失败
    fn report(&self, summary: &BatchSummary) {
        if !summary.outcomes.is_empty() {
            let message = format!(
                "{}/{} uploaded successfully",
                summary.succeeded(),
                summary.total
            );
            let notification = if summary.all_succeeded() {
                Notification::success("Batch upload finished", message)
            } else if summary.succeeded() > 0 {
                Notification::warning("Batch upload partially succeeded", message)
            } else {
                Notification::error("Batch upload failed", message)
            };
            self.notifier.notify(notification);
        }

        self.emit(BatchEvent::Finished(summary.clone()));
        self.emit(BatchEvent::JobsInvalidated);
    }

    /// 整批交给服务端排队
    pub async fn submit_server_batch(
        &self,
        jobs: &[UploadJob],
        settings: &BatchSettings,
    ) -> Result<BatchUploadResponse> {
        if jobs.is_empty() {
            return Err(ApiError::Validation("batch contains no jobs".into()));
        }
        let ids = jobs.iter().map(|job| job.id.clone()).collect();
        let request = BatchUploadRequest::new(ids, settings);

        match self.publisher.batch_upload_to_youtube(&request).await {
            Ok(response) => {
                let queued = response.queued.as_ref().map(|q| q.len()).unwrap_or(jobs.len());
                self.notifier.notify(Notification::info(
                    "Batch queued",
                    format!("{} jobs queued on the server", queued),
                ));
                self.emit(BatchEvent::JobsInvalidated);
                Ok(response)
            }
            Err(err) => {
                self.notifier.notify(Notification::error("Batch upload failed", err.to_string()));
                Err(err)
            }
        }
    }

    fn emit(&self, event: BatchEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use parking_lot::Mutex;
    use tokio::time::Instant;
    use crate::core::{NotificationKind, UploadPhase};

    /// 按预设结果依次返回，记录每次调用
    #[derive(Default)]
    struct MockPublisher {
        failures: Mutex<Vec<(JobId, ApiError, usize)>>,
        calls: Mutex<Vec<(JobId, YouTubeUploadRequest, Instant)>>,
        latency: Duration,
    }

    impl MockPublisher {
        fn failing(self, job_id: &str, error: ApiError, times: usize) -> Self {
            self.failures.lock().push((job_id.into(), error, times));
            self
        }

        fn call_ids(&self) -> Vec<String> {
            self.calls.lock().iter().map(|(id, _, _)| id.to_string()).collect()
        }
    }

    #[async_trait]
    impl YouTubePublisher for MockPublisher {
        async fn upload_to_youtube(
            &self,
            job_id: &JobId,
            request: &YouTubeUploadRequest,
        ) -> Result<YouTubeUploadResponse> {
            self.calls.lock().push((job_id.clone(), request.clone(), Instant::now()));
            if !self.latency.is_zero() {
                sleep(self.latency).await;
            }

            let failure = {
                let mut failures = self.failures.lock();
                failures.iter_mut().find(|(id, _, times)| id == job_id && *times > 0).map(
                    |(_, error, times)| {
                        *times -= 1;
                        error.clone()
                    },
                )
            };
            match failure {
                Some(error) => Err(error),
                None => Ok(YouTubeUploadResponse {
                    success: true,
                    message: String::new(),
                    video_id: Some(format!("yt-{}", job_id)),
                    video_url: None,
                    status: Some("uploaded".into()),
                }),
            }
        }

        async fn batch_upload_to_youtube(
            &self,
            request: &BatchUploadRequest,
        ) -> Result<BatchUploadResponse> {
            Ok(BatchUploadResponse {
                success: true,
                message: "queued".into(),
                total: Some(request.script_ids.len() as u32),
                queued: Some(request.script_ids.clone()),
            })
        }
    }

    fn jobs(ids: &[&str]) -> Vec<UploadJob> {
        ids.iter().map(|id| UploadJob::new(*id)).collect()
    }

    fn orchestrator(publisher: MockPublisher) -> (BatchOrchestrator<MockPublisher>, Arc<MockPublisher>) {
        let publisher = Arc::new(publisher);
        let orchestrator = BatchOrchestrator::new(
            publisher.clone(),
            UploadProgressStore::new(),
            Notifier::new(),
        );
        (orchestrator, publisher)
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_sequentially_with_delay() {
        let publisher = MockPublisher {
            latency: Duration::from_secs(2),
            ..Default::default()
        };
        let (orchestrator, publisher) = orchestrator(publisher);
        let settings = BatchSettings::new(Duration::from_secs(30));

        let started = Instant::now();
        let summary = orchestrator
            .run(&jobs(&["a", "b", "c"]), &settings, CancellationToken::new())
            .await;

        assert_eq!(summary.succeeded(), 3);
        assert!(summary.all_succeeded());
        assert!(started.elapsed() >= Duration::from_secs(60));

        let calls = publisher.calls.lock();
        // 第二个任务在第一个返回（2 秒）后再等待 30 秒
        assert!(calls[1].2 - calls[0].2 >= Duration::from_secs(32));
        assert!(calls[2].2 - calls[1].2 >= Duration::from_secs(32));
        assert!(calls.iter().all(|(_, request, _)| request.scheduled_time.is_none()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_fast_without_retry() {
        let publisher = MockPublisher::default().failing("b", ApiError::http(500, None, "boom"), 1);
        let (orchestrator, publisher) = orchestrator(publisher);
        let settings = BatchSettings::default().with_retry(false, 3);

        let summary = orchestrator
            .run(&jobs(&["a", "b", "c"]), &settings, CancellationToken::new())
            .await;

        assert_eq!(publisher.call_ids(), vec!["a", "b"]);
        assert_eq!(summary.succeeded(), 1);
        assert_eq!(summary.failed(), 1);
        assert_eq!(summary.skipped(), 1);
        assert!(!summary.cancelled);
        assert_eq!(
            orchestrator.store().get_upload(&"b".into()).unwrap().phase,
            UploadPhase::Error
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_errors_and_continues() {
        let publisher = MockPublisher::default()
            .failing("a", ApiError::http(503, None, "unavailable"), 2)
            .failing("b", ApiError::http(400, None, "bad request"), 1);
        let (orchestrator, publisher) = orchestrator(publisher);
        let settings = BatchSettings::default().with_retry(true, 3);

        let summary = orchestrator
            .run(&jobs(&["a", "b", "c"]), &settings, CancellationToken::new())
            .await;

        // a: 两次 503 后成功；b: 400 不重试；c 继续执行
        assert_eq!(publisher.call_ids(), vec!["a", "a", "a", "b", "c"]);
        assert_eq!(summary.succeeded(), 2);
        assert_eq!(summary.failed(), 1);
        assert_eq!(summary.outcomes[1].error().and_then(|e| e.status()), Some(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_retries_override_config_attempts() {
        let publisher = MockPublisher::default().failing("a", ApiError::http(503, None, "unavailable"), 2);
        let (orchestrator, publisher) = orchestrator(publisher);
        let orchestrator = orchestrator.with_retry_config(RetryConfig {
            max_attempts: 1,
            ..RetryConfig::youtube()
        });
        let settings = BatchSettings::default().with_retry(true, 2);

        let summary = orchestrator
            .run(&jobs(&["a"]), &settings, CancellationToken::new())
            .await;

        // max_retries = 2，共三次尝试
        assert_eq!(publisher.call_ids(), vec!["a", "a", "a"]);
        assert!(summary.all_succeeded());
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_exceeded_is_not_retried() {
        let quota = ApiError::http(403, Some("quotaExceeded".into()), "quota");
        let publisher = MockPublisher::default().failing("a", quota, 5);
        let (orchestrator, publisher) = orchestrator(publisher);
        let settings = BatchSettings::default().with_retry(true, 3);

        let summary = orchestrator
            .run(&jobs(&["a"]), &settings, CancellationToken::new())
            .await;

        assert_eq!(publisher.call_ids(), vec!["a"]);
        assert!(summary.outcomes[0].error().unwrap().is_quota_exceeded());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_times_offset_by_delay() {
        let (orchestrator, publisher) = orchestrator(MockPublisher::default());
        let publish_at = Utc.with_ymd_and_hms(2025, 1, 1, 9, 0, 0).unwrap();
        let settings = BatchSettings::new(Duration::from_secs(60)).with_publish_at(Some(publish_at));

        orchestrator
            .run(&jobs(&["a", "b", "c"]), &settings, CancellationToken::new())
            .await;

        let times: Vec<_> = publisher
            .calls
            .lock()
            .iter()
            .map(|(_, request, _)| request.scheduled_time.unwrap())
            .collect();
        assert_eq!(times[0], publish_at);
        assert_eq!(times[1], publish_at + chrono::Duration::seconds(60));
        assert_eq!(times[2], publish_at + chrono::Duration::seconds(120));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_wait_skips_remaining() {
        let (orchestrator, publisher) = orchestrator(MockPublisher::default());
        let orchestrator = Arc::new(orchestrator);
        let settings = BatchSettings::default();
        let cancel = CancellationToken::new();
        let mut events = orchestrator.subscribe();

        let handle = {
            let orchestrator = orchestrator.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                orchestrator.run(&jobs(&["a", "b", "c"]), &settings, cancel).await
            })
        };

        loop {
            if let BatchEvent::Waiting { next_index, .. } = events.recv().await.unwrap() {
                assert_eq!(next_index, 1);
                break;
            }
        }
        cancel.cancel();

        let summary = handle.await.unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.outcomes.len(), 1);
        assert_eq!(summary.skipped(), 2);
        assert_eq!(publisher.call_ids(), vec!["a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_start() {
        let (orchestrator, publisher) = orchestrator(MockPublisher::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = orchestrator
            .run(&jobs(&["a", "b"]), &BatchSettings::default(), cancel)
            .await;

        assert!(summary.cancelled);
        assert!(publisher.call_ids().is_empty());
        assert_eq!(summary.skipped(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_summary_notification() {
        let publisher = MockPublisher::default().failing("b", ApiError::http(404, None, "missing"), 1);
        let (orchestrator, _) = orchestrator(publisher);
        let mut notifications = orchestrator.notifier().subscribe();
        let mut events = orchestrator.subscribe();

        orchestrator
            .run(&jobs(&["a", "b"]), &BatchSettings::default(), CancellationToken::new())
            .await;

        let notification = notifications.recv().await.unwrap();
        assert_eq!(notification.kind, NotificationKind::Warning);
        assert_eq!(notification.message, "1/2 uploaded successfully");

        let mut saw_finished = false;
        let mut saw_invalidated = false;
        while let Ok(event) = events.try_recv() {
            match event {
                BatchEvent::Finished(summary) => {
                    assert_eq!(summary.total, 2);
                    saw_finished = true;
                }
                BatchEvent::JobsInvalidated => saw_invalidated = true,
                _ => {}
            }
        }
        assert!(saw_finished && saw_invalidated);
    }

    #[tokio::test]
    async fn test_submit_server_batch() {
        let (orchestrator, _) = orchestrator(MockPublisher::default());
        let response = orchestrator
            .submit_server_batch(&jobs(&["a", "b"]), &BatchSettings::default())
            .await
            .unwrap();
        assert_eq!(response.total, Some(2));

        let err = orchestrator
            .submit_server_batch(&[], &BatchSettings::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }
}
