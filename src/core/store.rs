use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use super::types::{JobId, ProgressUpdate, UploadPhase, UploadProgress};

/// 进度变更事件
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressChange {
    Updated(UploadProgress),
    Removed(JobId),
}

/// 上传进度存储
///
/// 克隆得到的是同一份存储的句柄，由 [`crate::Session`] 创建并持有
#[derive(Clone)]
pub struct UploadProgressStore {
    records: Arc<RwLock<HashMap<JobId, UploadProgress>>>,
    change_tx: broadcast::Sender<ProgressChange>,
}

impl Default for UploadProgressStore {
    fn default() -> Self {
        Self::new()
    }
}

impl UploadProgressStore {
    pub fn new() -> Self {
        // 最大缓存 256 个事件
        let (change_tx, _) = broadcast::channel(256);

        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            change_tx,
        }
    }

    /// 写入进度（不存在则创建）
    ///
    /// - 百分比限制在 [0, 100]
    /// - 非错误状态下百分比不回退，阶段不后退
    /// - 已处于 `Error` 的记录忽略后续更新
    /// - `Completed` 强制为 100%
    pub fn set_progress(&self, job_id: &JobId, update: ProgressUpdate) -> UploadProgress {
        let now = Utc::now();
        let mut percentage = clamp_percentage(update.percentage);
        if update.phase == UploadPhase::Completed {
            percentage = 100.0;
        }

        let mut records = self.records.write();
        let record = match records.get_mut(job_id) {
            Some(existing) => {
                if !existing.phase.can_advance_to(update.phase) {
                    tracing::debug!(
                        job_id = %job_id,
                        from = ?existing.phase,
                        to = ?update.phase,
                        "ignoring out-of-order progress update"
                    );
                    return existing.clone();
                }

                if update.phase != UploadPhase::Error {
                    existing.percentage = existing.percentage.max(percentage);
                }
                existing.phase = update.phase;
                existing.message = update.message;
                existing.updated_at = now;
                existing.clone()
            }
            None => {
                let record = UploadProgress {
                    job_id: job_id.clone(),
                    phase: update.phase,
                    percentage,
                    message: update.message,
                    started_at: now,
                    updated_at: now,
                };
                records.insert(job_id.clone(), record.clone());
                record
            }
        };
        drop(records);

        let _ = self.change_tx.send(ProgressChange::Updated(record.clone()));
        record
    }

    /// 开始一次新的尝试，覆盖已有记录
    ///
    /// 替换在同一次写锁内完成，订阅者只会收到一条携带新记录的 `Updated`
    pub fn start(&self, job_id: &JobId, message: impl Into<String>) -> UploadProgress {
        let now = Utc::now();
        let record = UploadProgress {
            job_id: job_id.clone(),
            phase: UploadPhase::Preparing,
            percentage: 0.0,
            message: message.into(),
            started_at: now,
            updated_at: now,
        };
        self.records.write().insert(job_id.clone(), record.clone());

        let _ = self.change_tx.send(ProgressChange::Updated(record.clone()));
        record
    }

    /// 标记失败
    pub fn fail(&self, job_id: &JobId, message: impl Into<String>) -> UploadProgress {
        self.set_progress(job_id, ProgressUpdate::new(UploadPhase::Error, 0.0, message))
    }

    /// 标记完成
    pub fn complete(&self, job_id: &JobId, message: impl Into<String>) -> UploadProgress {
        self.set_progress(job_id, ProgressUpdate::new(UploadPhase::Completed, 100.0, message))
    }

    pub fn remove_progress(&self, job_id: &JobId) -> Option<UploadProgress> {
        let removed = self.records.write().remove(job_id);
        if removed.is_some() {
            let _ = self.change_tx.send(ProgressChange::Removed(job_id.clone()));
        }
        removed
    }

    /// 仍在进行中的上传（百分比 < 100 且非错误）
    pub fn get_active_uploads(&self) -> Vec<UploadProgress> {
        let mut active: Vec<UploadProgress> = self
            .records
            .read()
            .values()
            .filter(|p| p.is_active())
            .cloned()
            .collect();
        active.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        active
    }

    pub fn get_upload(&self, job_id: &JobId) -> Option<UploadProgress> {
        self.records.read().get(job_id).cloned()
    }

    pub fn is_uploading(&self, job_id: &JobId) -> bool {
        self.records
            .read()
            .get(job_id)
            .map(|p| p.is_active())
            .unwrap_or(false)
    }

    pub fn all(&self) -> Vec<UploadProgress> {
        self.records.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// 清理已结束且超过 `linger` 未更新的记录
    pub fn prune_finished(&self, linger: Duration) -> Vec<JobId> {
        let linger = chrono::Duration::from_std(linger).unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();

        let mut records = self.records.write();
        let expired: Vec<JobId> = records
            .values()
            .filter(|p| p.phase.is_terminal() || p.percentage >= 100.0)
            .filter(|p| now.signed_duration_since(p.updated_at) >= linger)
            .map(|p| p.job_id.clone())
            .collect();
        for id in &expired {
            records.remove(id);
        }
        drop(records);

        for id in &expired {
            let _ = self.change_tx.send(ProgressChange::Removed(id.clone()));
        }
        expired
    }

    /// 订阅变更
    ///
    /// 接收速度跟不上时会丢失事件（lagged），此时应重新读取快照
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressChange> {
        self.change_tx.subscribe()
    }
}

fn clamp_percentage(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}
