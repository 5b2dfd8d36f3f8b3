use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use crate::core::{ApiError, Result};

/// 退避策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// 固定延迟
    Fixed,
    /// 线性退避：base * attempt
    Linear,
    /// 指数退避：base * 2^(attempt - 1)
    Exponential,
}

impl BackoffStrategy {
    /// 计算第 `attempt` 次失败后的延迟（不含抖动），从 1 开始计数
    pub fn get_delay(&self, attempt: u32, base_delay: Duration, max_delay: Duration) -> Duration {
        let attempt = attempt.max(1);
        let delay = match self {
            BackoffStrategy::Fixed => base_delay,
            BackoffStrategy::Linear => base_delay.saturating_mul(attempt),
            BackoffStrategy::Exponential => {
                let factor = 2f64.powi(attempt as i32 - 1);
                Duration::try_from_secs_f64(base_delay.as_secs_f64() * factor)
                    .unwrap_or(max_delay)
            }
        };
        std::cmp::min(delay, max_delay)
    }
}

/// 加上最多 10% 的随机抖动，避免多个客户端同时重试
pub fn with_jitter(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.0..=0.1);
    delay + delay.mul_f64(factor)
}

/// 重试判定策略
///
/// 所有调用点共用这里的分类规则
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// 网络错误、超时、5xx 重试；4xx 不重试
    Default,
    /// 在 Default 基础上：配额耗尽不重试，限流（403 rateLimitExceeded / 429）重试
    YouTube,
    /// 从不重试
    Never,
}

impl RetryPolicy {
    pub fn should_retry(&self, error: &ApiError) -> bool {
        match self {
            RetryPolicy::Never => false,
            RetryPolicy::Default => is_transient(error),
            RetryPolicy::YouTube => {
                if error.is_quota_exceeded() {
                    false
                } else if error.is_rate_limited() {
                    true
                } else {
                    is_transient(error)
                }
            }
        }
    }
}

fn is_transient(error: &ApiError) -> bool {
    match error {
        ApiError::Network(_) | ApiError::Timeout => true,
        ApiError::Http { .. } => error.is_server_error(),
        _ => false,
    }
}

pub type RetryCondition = Arc<dyn Fn(&ApiError, u32) -> bool + Send + Sync>;
pub type MaxAttemptsCallback = Arc<dyn Fn(&ApiError) + Send + Sync>;

/// 重试配置
#[derive(Clone)]
pub struct RetryConfig {
    /// 最大尝试次数（包含第一次）
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// 是否重试的判断函数，参数为错误和当前尝试次数
    pub retry_condition: RetryCondition,
    /// 次数用尽时回调
    pub on_max_attempts_reached: Option<MaxAttemptsCallback>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            strategy: BackoffStrategy::Exponential,
            retry_condition: policy_condition(RetryPolicy::Default),
            on_max_attempts_reached: None,
        }
    }
}

impl std::fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("strategy", &self.strategy)
            .finish()
    }
}

impl RetryConfig {
    /// YouTube 上传专用配置
    pub fn youtube() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
            retry_condition: policy_condition(RetryPolicy::YouTube),
            on_max_attempts_reached: None,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_condition = policy_condition(policy);
        self
    }
}

fn policy_condition(policy: RetryPolicy) -> RetryCondition {
    Arc::new(move |error, _attempt| policy.should_retry(error))
}

/// 重试状态快照
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryState {
    pub is_retrying: bool,
    pub current_attempt: u32,
    pub last_error: Option<ApiError>,
    pub has_reached_max_attempts: bool,
}

/// 带状态的重试执行器
///
/// 状态在每次 `execute` 开始时重置，可在另一个任务中读取
#[derive(Clone, Debug)]
pub struct Retrier {
    config: RetryConfig,
    state: Arc<Mutex<RetryState>>,
}

impl Retrier {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(RetryState::default())),
        }
    }

    pub fn youtube() -> Self {
        Self::new(RetryConfig::youtube())
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// 执行操作，失败时按配置重试
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.reset();
        let max_attempts = self.config.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            self.state.lock().current_attempt = attempt;

            let error = match operation().await {
                Ok(result) => {
                    self.state.lock().is_retrying = false;
                    return Ok(result);
                }
                Err(error) => error,
            };

            let exhausted = attempt >= max_attempts;
            let retryable = !exhausted && (self.config.retry_condition)(&error, attempt);

            {
                let mut state = self.state.lock();
                state.last_error = Some(error.clone());
                state.is_retrying = retryable;
                state.has_reached_max_attempts = exhausted;
            }

            if !retryable {
                if exhausted {
                    tracing::warn!(attempts = attempt, "giving up after max attempts: {}", error);
                    if let Some(callback) = &self.config.on_max_attempts_reached {
                        callback(&error);
                    }
                }
                return Err(error);
            }

            let delay = with_jitter(self.config.strategy.get_delay(
                attempt,
                self.config.base_delay,
                self.config.max_delay,
            ));
            tracing::warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                "retrying after error: {}",
                error
            );
            sleep(delay).await;
        }

        // 循环内必然返回
        Err(self
            .last_error()
            .unwrap_or_else(|| ApiError::Validation("retry loop exited without result".into())))
    }

    /// 清空重试状态，不会取消正在进行的尝试
    pub fn reset(&self) {
        *self.state.lock() = RetryState::default();
    }

    pub fn state(&self) -> RetryState {
        self.state.lock().clone()
    }

    pub fn is_retrying(&self) -> bool {
        self.state.lock().is_retrying
    }

    pub fn current_attempt(&self) -> u32 {
        self.state.lock().current_attempt
    }

    pub fn last_error(&self) -> Option<ApiError> {
        self.state.lock().last_error.clone()
    }

    pub fn has_reached_max_attempts(&self) -> bool {
        self.state.lock().has_reached_max_attempts
    }
}

/// 执行带重试的操作
pub async fn retry_with_config<F, Fut, T>(config: RetryConfig, operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    Retrier::new(config).execute(operation).await
}

/// 使用默认配置执行重试
pub async fn retry<F, Fut, T>(operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_with_config(RetryConfig::default(), operation).await
}

/// 重试构建器
pub struct RetryBuilder {
    config: RetryConfig,
}

impl Default for RetryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryBuilder {
    pub fn new() -> Self {
        Self {
            config: RetryConfig::default(),
        }
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    pub fn strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.config.strategy = strategy;
        self
    }

    pub fn delays(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.config.base_delay = base_delay;
        self.config.max_delay = max_delay;
        self
    }

    pub fn policy(mut self, policy: RetryPolicy) -> Self {
        self.config = self.config.with_policy(policy);
        self
    }

    pub fn retry_condition<F>(mut self, f: F) -> Self
    where
        F: Fn(&ApiError, u32) -> bool + Send + Sync + 'static,
    {
        self.config.retry_condition = Arc::new(f);
        self
    }

    pub fn on_max_attempts_reached<F>(mut self, f: F) -> Self
    where
        F: Fn(&ApiError) + Send + Sync + 'static,
    {
        self.config.on_max_attempts_reached = Some(Arc::new(f));
        self
    }

    pub fn build(self) -> Retrier {
        Retrier::new(self.config)
    }

    pub async fn run<F, Fut, T>(self, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        retry_with_config(self.config, operation).await
    }
}
