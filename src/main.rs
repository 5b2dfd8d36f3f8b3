use std::path::PathBuf;
use std::time::Duration;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tubepilot::core::{
    BatchSettings,
    JobId,
    PrivacyStatus,
    ProgressChange,
    PublishOptions,
    UploadJob,
    YouTubeUploadRequest,
};
use tubepilot::utils::{format_duration, Retrier, RetryPolicy};
use tubepilot::{BatchEvent, Config, Session};

#[derive(Parser, Debug)]
#[command(name = "tubepilot")]
#[command(about = "Upload videos and publish them to YouTube through the upload service")]
#[command(version)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "config.toml", env = "TUBEPILOT_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 上传本地视频文件
    UploadVideo {
        id: String,
        file: PathBuf,
    },
    /// 发布单个内容项到 YouTube
    Publish {
        id: String,
        #[command(flatten)]
        publish: PublishArgs,
        /// 定时发布时间（RFC 3339）
        #[arg(long)]
        scheduled_time: Option<DateTime<Utc>>,
    },
    /// 客户端按间隔逐个发布
    Batch {
        #[arg(required = true)]
        ids: Vec<String>,
        #[command(flatten)]
        publish: PublishArgs,
        /// 任务间隔（秒），最少 30 秒
        #[arg(long)]
        delay: Option<u64>,
        /// 第一个任务的定时发布时间（RFC 3339），后续任务依次顺延
        #[arg(long)]
        publish_at: Option<DateTime<Utc>>,
        /// 失败时立即停止，不重试
        #[arg(long)]
        no_retry: bool,
        #[arg(long)]
        max_retries: Option<u32>,
    },
    /// 整批交给服务端排队
    ServerBatch {
        #[arg(required = true)]
        ids: Vec<String>,
        #[command(flatten)]
        publish: PublishArgs,
        #[arg(long)]
        delay: Option<u64>,
    },
    /// 持续输出服务端推送的进度
    Watch,
}

#[derive(clap::Args, Debug)]
struct PublishArgs {
    #[arg(long)]
    privacy: Option<PrivacyStatus>,
    #[arg(long)]
    category: Option<String>,
}

impl PublishArgs {
    fn apply(&self, mut settings: BatchSettings) -> BatchSettings {
        if let Some(privacy) = self.privacy {
            settings = settings.with_privacy(privacy);
        }
        if let Some(category) = &self.category {
            settings = settings.with_category(category.clone());
        }
        settings
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = Config::load_with_env(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    let session = Session::new(&config).context("failed to create session")?;

    match args.command {
        Command::UploadVideo { id, file } => upload_video(&session, id.into(), file).await,
        Command::Publish { id, publish, scheduled_time } => {
            let mut options = PublishOptions {
                scheduled_time,
                ..PublishOptions::default()
            };
            let settings = publish.apply(config.batch.to_settings());
            options.privacy = settings.privacy;
            options.category_id = settings.category_id;
            publish_one(&session, id.into(), options).await
        }
        Command::Batch { ids, publish, delay, publish_at, no_retry, max_retries } => {
            let mut settings = publish.apply(config.batch.to_settings()).with_publish_at(publish_at);
            if let Some(delay) = delay {
                settings = settings.with_delay(Duration::from_secs(delay));
            }
            let max_retries = max_retries.unwrap_or(settings.max_retries);
            let retry_on_error = !no_retry && settings.retry_on_error;
            settings = settings.with_retry(retry_on_error, max_retries);
            run_batch(&session, ids, settings).await
        }
        Command::ServerBatch { ids, publish, delay } => {
            let mut settings = publish.apply(config.batch.to_settings());
            if let Some(delay) = delay {
                settings = settings.with_delay(Duration::from_secs(delay));
            }
            let jobs: Vec<UploadJob> = ids.into_iter().map(UploadJob::new).collect();
            let response = session
                .orchestrator()
                .submit_server_batch(&jobs, &settings)
                .await
                .context("server batch failed")?;
            println!("{}", response.message);
            Ok(())
        }
        Command::Watch => watch(&session).await,
    }
}

async fn upload_video(session: &Session, id: JobId, file: PathBuf) -> Result<()> {
    if !file.is_file() {
        bail!("{} is not a file", file.display());
    }

    let mut changes = session.store().subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(change) = changes.recv().await {
            if let ProgressChange::Updated(progress) = change {
                println!("[{:>5.1}%] {:?} {}", progress.percentage, progress.phase, progress.message);
            }
        }
    });

    let result = session.api().upload_video(&id, &file, Some(session.store())).await;
    printer.abort();

    let response = result.with_context(|| format!("failed to upload {}", file.display()))?;
    println!("{}", response.message);
    Ok(())
}

async fn publish_one(session: &Session, id: JobId, options: PublishOptions) -> Result<()> {
    let request = YouTubeUploadRequest::from(&options);
    let retrier = Retrier::new(session.config().retry.to_retry_config(RetryPolicy::YouTube));
    let api = session.api();

    let response = retrier
        .execute(|| api.upload_to_youtube(&id, &request))
        .await
        .with_context(|| format!("failed to publish {}", id))?;

    match response.video_url {
        Some(url) => println!("{} published: {}", id, url),
        None => println!("{} submitted: {}", id, response.message),
    }
    Ok(())
}

async fn run_batch(session: &Session, ids: Vec<String>, settings: BatchSettings) -> Result<()> {
    let jobs: Vec<UploadJob> = ids.into_iter().map(UploadJob::new).collect();
    let orchestrator = session.orchestrator();
    let cancel = CancellationToken::new();

    // Ctrl-C 在任务之间取消批量运行
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, cancelling batch");
                cancel.cancel();
            }
        });
    }

    let mut events = orchestrator.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                BatchEvent::JobStarted { index, job_id } => println!("[{}] publishing {}", index + 1, job_id),
                BatchEvent::JobFinished { job_id, success, .. } => {
                    println!("    {} {}", job_id, if success { "ok" } else { "failed" })
                }
                BatchEvent::Waiting { delay, .. } => println!("    waiting {}", format_duration(delay)),
                BatchEvent::Finished(_) => break,
                BatchEvent::JobsInvalidated => {}
            }
        }
    });

    let summary = orchestrator.run(&jobs, &settings, cancel).await;
    let _ = printer.await;

    println!(
        "{}/{} uploaded successfully, {} failed, {} skipped{}",
        summary.succeeded(),
        summary.total,
        summary.failed(),
        summary.skipped(),
        if summary.cancelled { " (cancelled)" } else { "" }
    );
    for outcome in summary.outcomes.iter().filter(|o| !o.success()) {
        if let Some(err) = outcome.error() {
            println!("  {}: {}", outcome.job_id, err);
        }
    }

    if summary.failed() > 0 {
        bail!("{} job(s) failed", summary.failed());
    }
    Ok(())
}

async fn watch(session: &Session) -> Result<()> {
    let mut changes = session.store().subscribe();
    let mut notifications = session.notifier().subscribe();
    let mut connection = session.ws().on_connection_change();
    session.start();

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => break,
            Ok(change) = changes.recv() => match change {
                ProgressChange::Updated(progress) => println!(
                    "{} [{:>5.1}%] {:?} {}",
                    progress.job_id, progress.percentage, progress.phase, progress.message
                ),
                ProgressChange::Removed(id) => println!("{} removed", id),
            },
            Ok(notification) = notifications.recv() => {
                println!("{:?}: {} {}", notification.kind, notification.title, notification.message);
            }
            Ok(change) = connection.recv() => {
                println!("connection: {:?}", change.status);
                if let Some(err) = change.state.last_error {
                    println!("  {}", err);
                }
            }
        }
    }

    session.shutdown().await;
    Ok(())
}
