use async_trait::async_trait;
use super::errors::Result;
use super::types::{
    BatchUploadRequest,
    BatchUploadResponse,
    JobId,
    YouTubeUploadRequest,
    YouTubeUploadResponse,
};

/// YouTube 发布接口 - 批量编排器通过它提交任务
#[async_trait]
pub trait YouTubePublisher: Send + Sync {
    /// 发布单个内容项
    async fn upload_to_youtube(
        &self,
        job_id: &JobId,
        request: &YouTubeUploadRequest,
    ) -> Result<YouTubeUploadResponse>;

    /// 交给服务端排队的批量发布
    async fn batch_upload_to_youtube(
        &self,
        request: &BatchUploadRequest,
    ) -> Result<BatchUploadResponse>;
}
