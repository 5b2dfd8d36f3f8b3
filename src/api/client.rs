use std::path::Path;
use std::time::Duration;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use url::Url;
use crate::config::ApiConfig;
use crate::core::{
    ApiError,
    BatchUploadRequest,
    BatchUploadResponse,
    JobId,
    Result,
    UploadProgressStore,
    VideoUploadResponse,
    YouTubePublisher,
    YouTubeUploadRequest,
    YouTubeUploadResponse,
};
use crate::utils::{ProgressStream, StoreProgressReporter};

/// 上传服务的 HTTP 客户端
///
/// 所有错误在这里转换为 [`ApiError`]，上层只按错误类别匹配
///
/// 连接超时对所有请求生效；JSON 请求使用 `request_timeout`，
/// 视频上传只受 `upload_timeout` 限制
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: Url,
    token: Option<String>,
    request_timeout: Duration,
    upload_timeout: Option<Duration>,
}

impl ApiClient {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|err| ApiError::Config(format!("invalid base url {}: {}", config.base_url, err)))?;
        if base_url.cannot_be_a_base() {
            return Err(ApiError::Config(format!("{} cannot be used as a base url", config.base_url)));
        }

        let client = Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|err| ApiError::Config(format!("failed to create HTTP client: {}", err)))?;

        Ok(Self {
            client,
            base_url,
            token: config.token.clone(),
            request_timeout: config.timeout(),
            upload_timeout: config.upload_timeout(),
        })
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_upload_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.upload_timeout = timeout;
        self
    }

    pub fn with_base_url(base_url: &str) -> Result<Self> {
        Self::new(&ApiConfig {
            base_url: base_url.to_string(),
            ..ApiConfig::default()
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// 拼接路径，每一段都会做百分号编码
    pub fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// 上传视频文件：`POST /api/upload/video/{id}`
    ///
    /// 提供 `progress` 时，发送过程中的字节进度会写入存储
    pub async fn upload_video(
        &self,
        job_id: &JobId,
        file_path: &Path,
        progress: Option<&UploadProgressStore>,
    ) -> Result<VideoUploadResponse> {
        let file_name = file_path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| ApiError::Validation(format!("invalid file name: {}", file_path.display())))?
            .to_string();

        let file = File::open(file_path).await?;
        let file_size = file.metadata().await?.len();
        let stream = ReaderStream::new(file);

        let body = match progress {
            Some(store) => {
                store.start(job_id, format!("Uploading {}", file_name));
                let reporter = StoreProgressReporter::new(store.clone(), job_id.clone(), file_size);
                Body::wrap_stream(ProgressStream::new(stream, reporter))
            }
            None => Body::wrap_stream(stream),
        };

        let part = Part::stream_with_length(body, file_size)
            .file_name(file_name.clone())
            .mime_str(guess_video_mime(&file_name))?;
        let form = Form::new().part("file", part);

        let url = self.endpoint(&["api", "upload", "video", job_id.as_str()]);
        tracing::info!(job_id = %job_id, size = file_size, "uploading video file");
        let mut request = self.authorize(self.client.post(url).multipart(form));
        if let Some(timeout) = self.upload_timeout {
            request = request.timeout(timeout);
        }

        let result = self.send_json::<VideoUploadResponse>(request).await;
        if let Some(store) = progress {
            match &result {
                Ok(response) => {
                    store.set_progress(
                        job_id,
                        crate::core::ProgressUpdate::new(
                            crate::core::UploadPhase::Processing,
                            response.progress.unwrap_or(90.0),
                            response.message.clone(),
                        ),
                    );
                }
                Err(err) => {
                    store.fail(job_id, err.to_string());
                }
            }
        }
        result
    }

    /// 发布到 YouTube：`POST /api/upload/youtube/{id}`
    pub async fn upload_to_youtube(
        &self,
        job_id: &JobId,
        request: &YouTubeUploadRequest,
    ) -> Result<YouTubeUploadResponse> {
        let url = self.endpoint(&["api", "upload", "youtube", job_id.as_str()]);
        tracing::info!(job_id = %job_id, privacy = request.privacy_status.as_str(), "publishing to youtube");
        let builder = self.authorize(self.client.post(url).json(request));
        self.send_json(builder.timeout(self.request_timeout)).await
    }

    /// 服务端批量发布：`POST /api/upload/youtube/batch`
    pub async fn batch_upload_to_youtube(
        &self,
        request: &BatchUploadRequest,
    ) -> Result<BatchUploadResponse> {
        let url = self.endpoint(&["api", "upload", "youtube", "batch"]);
        tracing::info!(count = request.script_ids.len(), delay = request.delay_seconds, "submitting server batch");
        let builder = self.authorize(self.client.post(url).json(request));
        self.send_json(builder.timeout(self.request_timeout)).await
    }

    /// 发送请求并解析 JSON 响应
    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = request.send().await?;
        let value = read_json_body(response).await?;

        // 2xx 也可能是 `{success: false, message}`
        if value.get("success").and_then(Value::as_bool) == Some(false) {
            let message = value
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("request reported failure")
                .to_string();
            return Err(ApiError::Application(message));
        }

        Ok(serde_json::from_value(value)?)
    }
}

async fn read_json_body(response: Response) -> Result<Value> {
    let status = response.status();
    let text = response.text().await?;

    if !status.is_success() {
        let (reason, message) = parse_error_body(&text);
        let message = message.unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        });
        return Err(ApiError::http(status.as_u16(), reason, message));
    }

    if text.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    Ok(serde_json::from_str(&text)?)
}

/// 从错误响应中提取 (reason, message)
///
/// 兼容 Google API 的 `{"error": {"errors": [{"reason": ..}], "message": ..}}`
/// 以及 `{"detail": ..}` / `{"message": ..}`
pub(crate) fn parse_error_body(text: &str) -> (Option<String>, Option<String>) {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        let trimmed = text.trim();
        return (None, (!trimmed.is_empty()).then(|| trimmed.to_string()));
    };

    let as_string = |v: &Value| v.as_str().map(str::to_string);

    if let Some(error) = value.get("error").filter(|e| e.is_object()) {
        let reason = error
            .get("errors")
            .and_then(Value::as_array)
            .and_then(|errors| errors.first())
            .and_then(|first| first.get("reason"))
            .and_then(as_string)
            .or_else(|| error.get("reason").and_then(as_string));
        let message = error.get("message").and_then(as_string);
        return (reason, message);
    }

    if let Some(detail) = value.get("detail") {
        return match detail {
            Value::String(message) => (None, Some(message.clone())),
            Value::Object(obj) => (
                obj.get("reason").and_then(as_string),
                obj.get("message").and_then(as_string),
            ),
            other => (None, Some(other.to_string())),
        };
    }

    (
        value.get("reason").and_then(as_string),
        value
            .get("message")
            .and_then(as_string)
            .or_else(|| value.get("error").and_then(as_string)),
    )
}

fn guess_video_mime(file_name: &str) -> &'static str {
    let ext = file_name.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    match ext.as_str() {
        "mp4" | "m4v" => "video/mp4",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "avi" => "video/x-msvideo",
        _ => "application/octet-stream",
    }
}

#[async_trait]
impl YouTubePublisher for ApiClient {
    async fn upload_to_youtube(
        &self,
        job_id: &JobId,
        request: &YouTubeUploadRequest,
    ) -> Result<YouTubeUploadResponse> {
        ApiClient::upload_to_youtube(self, job_id, request).await
    }

    async fn batch_upload_to_youtube(
        &self,
        request: &BatchUploadRequest,
    ) -> Result<BatchUploadResponse> {
        ApiClient::batch_upload_to_youtube(self, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{PrivacyStatus, UploadPhase};
    use mockito::Matcher;
    use std::io::Write;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// 读完请求后等待 `delay` 再返回 JSON；`delay` 为 `None` 时不响应
    async fn slow_server(delay: Option<Duration>, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (mut tcp, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 8192];
            // multipart 请求体以 `--\r\n` 结束
            loop {
                let n = tcp.read(&mut buf).await.unwrap();
                if n == 0 {
                    return;
                }
                request.extend_from_slice(&buf[..n]);
                if request.ends_with(b"--\r\n") || request.ends_with(b"}") {
                    break;
                }
            }

            let Some(delay) = delay else {
                tokio::time::sleep(Duration::from_secs(30)).await;
                return;
            };
            tokio::time::sleep(delay).await;
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = tcp.write_all(response.as_bytes()).await;
            let _ = tcp.shutdown().await;
        });
        url
    }

    #[test]
    fn test_endpoint_encodes_segments() {
        let client = ApiClient::with_base_url("http://localhost:8000/backend/").unwrap();
        let url = client.endpoint(&["api", "upload", "video", "script 1/2"]);
        assert_eq!(url.as_str(), "http://localhost:8000/backend/api/upload/video/script%201%2F2");

        let client = ApiClient::with_base_url("http://localhost:8000").unwrap();
        let url = client.endpoint(&["api", "upload", "youtube", "batch"]);
        assert_eq!(url.as_str(), "http://localhost:8000/api/upload/youtube/batch");
    }

    #[test]
    fn test_parse_error_body() {
        let google = r#"{"error":{"code":403,"message":"quota","errors":[{"reason":"quotaExceeded"}]}}"#;
        assert_eq!(
            parse_error_body(google),
            (Some("quotaExceeded".into()), Some("quota".into()))
        );

        let fastapi = r#"{"detail":"Script not found"}"#;
        assert_eq!(parse_error_body(fastapi), (None, Some("Script not found".into())));

        assert_eq!(parse_error_body("plain failure"), (None, Some("plain failure".into())));
        assert_eq!(parse_error_body(""), (None, None));
    }

    #[tokio::test]
    async fn test_upload_to_youtube_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/upload/youtube/script-1")
            .match_header("authorization", "Bearer token-1")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "privacy_status": "public",
                "category_id": "22"
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"success":true,"message":"ok","video_id":"abc123","video_url":"https://youtu.be/abc123"}"#)
            .create_async()
            .await;

        let client = ApiClient::new(&ApiConfig {
            base_url: server.url(),
            token: Some("token-1".into()),
            timeout_secs: 5,
            ..ApiConfig::default()
        })
        .unwrap();
        let request = YouTubeUploadRequest {
            privacy_status: PrivacyStatus::Public,
            category_id: "22".into(),
            scheduled_time: None,
        };

        let response = client.upload_to_youtube(&"script-1".into(), &request).await.unwrap();
        assert_eq!(response.video_id.as_deref(), Some("abc123"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_quota_error_is_tagged() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/upload/youtube/s")
            .with_status(403)
            .with_body(r#"{"error":{"message":"Quota exceeded","errors":[{"reason":"quotaExceeded"}]}}"#)
            .create_async()
            .await;

        let client = ApiClient::with_base_url(&server.url()).unwrap();
        let request = YouTubeUploadRequest::from(&crate::core::PublishOptions::default());
        let err = client.upload_to_youtube(&"s".into(), &request).await.unwrap_err();

        assert_eq!(err.status(), Some(403));
        assert!(err.is_quota_exceeded());
    }

    #[tokio::test]
    async fn test_application_failure_payload() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/upload/youtube/batch")
            .with_status(200)
            .with_body(r#"{"success":false,"message":"no video file for script-3"}"#)
            .create_async()
            .await;

        let client = ApiClient::with_base_url(&server.url()).unwrap();
        let request = BatchUploadRequest {
            script_ids: vec!["script-3".into()],
            privacy_status: PrivacyStatus::Private,
            category_id: "24".into(),
            delay_seconds: 30,
        };
        let err = client.batch_upload_to_youtube(&request).await.unwrap_err();
        assert_eq!(err, ApiError::Application("no video file for script-3".into()));
    }

    #[tokio::test]
    async fn test_upload_video_reports_progress() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/upload/video/script-7")
            .match_header("content-type", Matcher::Regex("multipart/form-data".into()))
            .with_status(200)
            .with_body(r#"{"success":true,"message":"stored","file_path":"/videos/script-7.mp4"}"#)
            .create_async()
            .await;

        let mut file = tempfile::Builder::new().suffix(".mp4").tempfile().unwrap();
        file.write_all(&vec![7u8; 64 * 1024]).unwrap();

        let client = ApiClient::with_base_url(&server.url()).unwrap();
        let store = UploadProgressStore::new();
        let job_id = JobId::from("script-7");
        let response = client
            .upload_video(&job_id, file.path(), Some(&store))
            .await
            .unwrap();

        assert_eq!(response.file_path.as_deref(), Some("/videos/script-7.mp4"));
        let record = store.get_upload(&job_id).unwrap();
        assert_eq!(record.phase, UploadPhase::Processing);
        assert_eq!(record.percentage, 90.0);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_network_error_is_retryable_kind() {
        // 端口 9 上没有服务
        let client = ApiClient::with_base_url("http://127.0.0.1:9").unwrap();
        let request = YouTubeUploadRequest::from(&crate::core::PublishOptions::default());
        let err = client.upload_to_youtube(&"s".into(), &request).await.unwrap_err();
        assert!(matches!(err, ApiError::Network(_) | ApiError::Timeout));
    }

    #[tokio::test]
    async fn test_json_request_times_out() {
        let url = slow_server(None, "").await;
        let client = ApiClient::with_base_url(&url)
            .unwrap()
            .with_request_timeout(Duration::from_millis(200));
        let request = YouTubeUploadRequest::from(&crate::core::PublishOptions::default());

        let err = client.upload_to_youtube(&"s".into(), &request).await.unwrap_err();
        assert_eq!(err, ApiError::Timeout);
    }

    #[tokio::test]
    async fn test_upload_outlives_request_timeout() {
        let url = slow_server(
            Some(Duration::from_millis(600)),
            r#"{"success":true,"message":"stored","file_path":"/videos/long.mp4"}"#,
        )
        .await;

        let mut file = tempfile::Builder::new().suffix(".mp4").tempfile().unwrap();
        file.write_all(&vec![1u8; 256 * 1024]).unwrap();

        // 上传比 JSON 请求的超时更久，不应被打断
        let client = ApiClient::with_base_url(&url)
            .unwrap()
            .with_request_timeout(Duration::from_millis(100));
        let response = client
            .upload_video(&"long".into(), file.path(), None)
            .await
            .unwrap();
        assert_eq!(response.file_path.as_deref(), Some("/videos/long.mp4"));
    }

    #[tokio::test]
    async fn test_upload_timeout_applies_when_set() {
        let url = slow_server(None, "").await;

        let mut file = tempfile::Builder::new().suffix(".mp4").tempfile().unwrap();
        file.write_all(&vec![1u8; 1024]).unwrap();

        let client = ApiClient::with_base_url(&url)
            .unwrap()
            .with_upload_timeout(Some(Duration::from_millis(200)));
        let store = UploadProgressStore::new();
        let err = client
            .upload_video(&"slow".into(), file.path(), Some(&store))
            .await
            .unwrap_err();
        assert_eq!(err, ApiError::Timeout);
        assert_eq!(store.get_upload(&"slow".into()).unwrap().phase, UploadPhase::Error);
    }
}
