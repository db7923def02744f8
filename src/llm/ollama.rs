//! Ollama 추론 백엔드
//!
//! 로컬 Ollama 서버의 `/api/chat` NDJSON 스트림을 텍스트 델타 스트림으로 변환합니다.
//! 백엔드 생성 시 모델 존재 확인 → (없으면) 다운로드 → 메모리 로드 순으로 진행하며
//! 각 단계를 진행률 콜백으로 보고합니다.
//!
//! source: https://github.com/ollama/ollama/blob/main/docs/api.md

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::{AbortHandle, Abortable};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};

use super::{
    BackendError, BackendFactory, ChatBackend, ChatMessage, DeltaStream, InitProgress,
    ProgressCallback,
};

/// 연결 타임아웃 (스트리밍 응답 자체에는 타임아웃 없음)
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// 로드된 모델 유지 시간
const KEEP_ALIVE: &str = "30m";

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Serialize)]
struct ModelRequest<'a> {
    model: &'a str,
}

#[derive(Debug, Serialize)]
struct PullRequest<'a> {
    model: &'a str,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct LoadRequest<'a> {
    model: &'a str,
    keep_alive: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    keep_alive: &'a str,
    options: SamplingOptions,
}

#[derive(Debug, Serialize)]
struct SamplingOptions {
    temperature: f32,
}

/// `/api/pull` 진행 라인
#[derive(Debug, Deserialize)]
struct PullStatus {
    #[serde(default)]
    status: String,
    #[serde(default)]
    total: Option<u64>,
    #[serde(default)]
    completed: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

/// `/api/chat` 스트림 라인
#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    message: Option<ChunkMessage>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

// ============================================================================
// Backend Factory
// ============================================================================

/// Ollama 백엔드 생성기
#[derive(Debug, Clone)]
pub struct OllamaBackendFactory {
    host: String,
    client: reqwest::Client,
}

impl OllamaBackendFactory {
    pub fn new(host: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            host: host.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    /// `OLLAMA_HOST` 환경변수의 서버를 사용
    pub fn from_env() -> Result<Self> {
        Self::new(crate::embedding::get_ollama_host()?)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// 서버 버전 확인 (헬스 체크)
    pub async fn server_version(&self) -> Result<String> {
        #[derive(Deserialize)]
        struct Version {
            version: String,
        }

        let version: Version = self
            .client
            .get(format!("{}/api/version", self.host))
            .send()
            .await
            .with_context(|| format!("Ollama server unreachable at {}", self.host))?
            .error_for_status()?
            .json()
            .await
            .context("Failed to parse version response")?;

        Ok(version.version)
    }

    /// 로컬에 모델이 있는지 확인
    pub async fn has_model(&self, model_id: &str) -> Result<bool> {
        let response = self
            .client
            .post(format!("{}/api/show", self.host))
            .json(&ModelRequest { model: model_id })
            .send()
            .await
            .with_context(|| format!("Ollama server unreachable at {}", self.host))?;

        match response.status() {
            s if s.is_success() => Ok(true),
            reqwest::StatusCode::NOT_FOUND => Ok(false),
            s => anyhow::bail!("Ollama API error ({}): {}", s, error_text(response).await),
        }
    }

    async fn pull(&self, model_id: &str, on_progress: &ProgressCallback) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/api/pull", self.host))
            .json(&PullRequest {
                model: model_id,
                stream: true,
            })
            .send()
            .await
            .context("Failed to start model download")?;

        if !response.status().is_success() {
            let status = response.status();
            anyhow::bail!("Ollama API error ({}): {}", status, error_text(response).await);
        }

        let mut lines = ndjson_lines(response);
        while let Some(line) = lines.next().await {
            let line = line.context("Model download interrupted")?;
            let status: PullStatus =
                serde_json::from_str(&line).context("Failed to parse pull progress")?;

            if let Some(error) = status.error {
                anyhow::bail!("Failed to download {}: {}", model_id, error);
            }

            let progress = match (status.completed, status.total) {
                (Some(done), Some(total)) if total > 0 => InitProgress::with_fraction(
                    format!("Downloading {}: {} ({}%)", model_id, status.status, done * 100 / total),
                    done as f32 / total as f32,
                ),
                _ => InitProgress::new(format!("Downloading {}: {}", model_id, status.status)),
            };
            on_progress(&progress);
        }

        Ok(())
    }

    async fn load(&self, model_id: &str) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/api/generate", self.host))
            .json(&LoadRequest {
                model: model_id,
                keep_alive: KEEP_ALIVE,
            })
            .send()
            .await
            .context("Failed to load model")?;

        if !response.status().is_success() {
            let status = response.status();
            anyhow::bail!("Ollama API error ({}): {}", status, error_text(response).await);
        }
        Ok(())
    }
}

#[async_trait]
impl BackendFactory for OllamaBackendFactory {
    async fn construct(
        &self,
        model_id: &str,
        on_progress: ProgressCallback,
    ) -> Result<Arc<dyn ChatBackend>> {
        on_progress(&InitProgress::with_fraction(
            format!("Checking model {}...", model_id),
            0.0,
        ));

        if !self.has_model(model_id).await? {
            tracing::info!("Model {} not found locally, pulling", model_id);
            self.pull(model_id, &on_progress).await?;
        }

        on_progress(&InitProgress::new(format!(
            "Loading {} into memory...",
            model_id
        )));
        self.load(model_id).await?;

        on_progress(&InitProgress::with_fraction(
            format!("Model {} ready", model_id),
            1.0,
        ));

        Ok(Arc::new(OllamaChatBackend {
            host: self.host.clone(),
            model: model_id.to_string(),
            client: self.client.clone(),
            active: Mutex::new(None),
        }))
    }
}

// ============================================================================
// Chat Backend
// ============================================================================

/// Ollama 채팅 백엔드
#[derive(Debug)]
pub struct OllamaChatBackend {
    host: String,
    model: String,
    client: reqwest::Client,
    /// 진행 중인 스트림의 중단 핸들
    active: Mutex<Option<AbortHandle>>,
}

#[async_trait]
impl ChatBackend for OllamaChatBackend {
    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
    ) -> Result<DeltaStream, BackendError> {
        let request = ChatRequest {
            model: &self.model,
            messages,
            stream: true,
            keep_alive: KEEP_ALIVE,
            options: SamplingOptions { temperature },
        };

        tracing::debug!(
            "Chat request to {} ({} messages, temperature {})",
            self.model,
            messages.len(),
            temperature
        );

        let response = self
            .client
            .post(format!("{}/api/chat", self.host))
            .json(&request)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let message = error_text(response).await;
            return Err(classify_status(status, message));
        }

        let deltas = ndjson_lines(response).filter_map(|line| async move {
            match line {
                Ok(line) => parse_chat_line(&line).transpose(),
                Err(e) => Some(Err(classify_transport(e))),
            }
        });

        let (handle, registration) = AbortHandle::new_pair();
        if let Ok(mut active) = self.active.lock() {
            *active = Some(handle);
        }

        Ok(interruptible(Abortable::new(deltas, registration)))
    }

    async fn interrupt(&self) {
        let handle = self.active.lock().ok().and_then(|mut active| active.take());
        if let Some(handle) = handle {
            tracing::info!("Interrupting generation on {}", self.model);
            handle.abort();
        }
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

// 중단되면 스트림 끝에 Interrupted 를 한 번 내보냄
fn interruptible<S>(inner: Abortable<S>) -> DeltaStream
where
    S: futures::Stream<Item = Result<String, BackendError>> + Send + 'static,
{
    stream::unfold((Box::pin(inner), false), |(mut inner, finished)| async move {
        if finished {
            return None;
        }
        match inner.next().await {
            Some(item) => Some((item, (inner, false))),
            None if inner.is_aborted() => Some((Err(BackendError::Interrupted), (inner, true))),
            None => None,
        }
    })
    .boxed()
}

/// 채팅 스트림 한 줄 해석 (내용 없는 줄은 None)
fn parse_chat_line(line: &str) -> Result<Option<String>, BackendError> {
    let chunk: ChatChunk = serde_json::from_str(line)
        .map_err(|e| BackendError::Other(format!("Failed to parse chat chunk: {}", e)))?;

    if let Some(error) = chunk.error {
        return Err(classify_message(error));
    }

    Ok(chunk
        .message
        .map(|m| m.content)
        .filter(|content| !content.is_empty()))
}

// ============================================================================
// Error Classification
// ============================================================================

/// 런너 프로세스가 사라졌음을 뜻하는 서버 메시지
const DISPOSED_MARKERS: &[&str] = &[
    "runner process has terminated",
    "runner process no longer running",
    "model runner has unexpectedly stopped",
    "out of memory",
];

fn classify_message(message: String) -> BackendError {
    let lower = message.to_lowercase();
    if DISPOSED_MARKERS.iter().any(|m| lower.contains(m)) {
        BackendError::Disposed(message)
    } else {
        BackendError::Other(message)
    }
}

fn classify_status(status: reqwest::StatusCode, message: String) -> BackendError {
    if status == reqwest::StatusCode::NOT_FOUND {
        // 모델이 언로드/삭제됨 → 재생성 시 다시 받아옴
        return BackendError::Disposed(format!("model not found: {}", message));
    }
    classify_message(format!("Ollama API error ({}): {}", status, message))
}

fn classify_transport(err: reqwest::Error) -> BackendError {
    // 서버가 내려갔거나 연결이 끊긴 경우 백엔드 핸들은 더 이상 유효하지 않음
    if err.is_connect() || err.is_body() || err.is_request() {
        BackendError::Disposed(err.to_string())
    } else {
        BackendError::Other(err.to_string())
    }
}

async fn error_text(response: reqwest::Response) -> String {
    let body = response.text().await.unwrap_or_default();
    serde_json::from_str::<ErrorBody>(&body)
        .map(|e| e.error)
        .unwrap_or(body)
}

// ============================================================================
// NDJSON
// ============================================================================

/// 응답 본문을 줄 단위로 나눈 스트림 (빈 줄 제외)
fn ndjson_lines(response: reqwest::Response) -> BoxStream<'static, Result<String, reqwest::Error>> {
    let bytes = response.bytes_stream().boxed();
    stream::unfold(
        (bytes, Vec::<u8>::new(), false),
        |(mut bytes, mut buffer, mut done)| async move {
            loop {
                if let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line).trim().to_string();
                    if line.is_empty() {
                        continue;
                    }
                    return Some((Ok(line), (bytes, buffer, done)));
                }

                if done {
                    let rest = String::from_utf8_lossy(&buffer).trim().to_string();
                    buffer.clear();
                    return if rest.is_empty() {
                        None
                    } else {
                        Some((Ok(rest), (bytes, buffer, done)))
                    };
                }

                match bytes.next().await {
                    Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                    Some(Err(e)) => {
                        buffer.clear();
                        done = true;
                        return Some((Err(e), (bytes, buffer, done)));
                    }
                    None => done = true,
                }
            }
        },
    )
    .boxed()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chat_line() {
        let line = r#"{"model":"llama3.2:1b","message":{"role":"assistant","content":"Hel"},"done":false}"#;
        assert_eq!(parse_chat_line(line).unwrap(), Some("Hel".to_string()));

        let done = r#"{"model":"llama3.2:1b","message":{"role":"assistant","content":""},"done":true}"#;
        assert_eq!(parse_chat_line(done).unwrap(), None);
    }

    #[test]
    fn test_parse_chat_line_errors() {
        let disposed = r#"{"error":"llama runner process has terminated: exit status 2"}"#;
        assert!(matches!(
            parse_chat_line(disposed),
            Err(BackendError::Disposed(_))
        ));

        let other = r#"{"error":"invalid options"}"#;
        assert!(matches!(parse_chat_line(other), Err(BackendError::Other(_))));

        assert!(matches!(parse_chat_line("not json"), Err(BackendError::Other(_))));
    }

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            classify_status(reqwest::StatusCode::NOT_FOUND, "model 'x' not found".into()),
            BackendError::Disposed(_)
        ));
        assert!(matches!(
            classify_status(reqwest::StatusCode::BAD_REQUEST, "bad".into()),
            BackendError::Other(_)
        ));
    }

    #[test]
    fn test_chat_request_shape() {
        let messages = vec![ChatMessage::system("sys"), ChatMessage::user("hi")];
        let request = ChatRequest {
            model: "llama3.2:1b",
            messages: &messages,
            stream: true,
            keep_alive: KEEP_ALIVE,
            options: SamplingOptions { temperature: 0.5 },
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["options"]["temperature"], 0.5);
        assert_eq!(json["stream"], true);
    }

    #[tokio::test]
    async fn test_interruptible_emits_interrupted() {
        let (handle, registration) = AbortHandle::new_pair();
        let inner = stream::iter(vec![Ok("a".to_string()), Ok("b".to_string())]);
        handle.abort();

        let items: Vec<_> = interruptible(Abortable::new(inner, registration)).collect().await;
        assert_eq!(items, vec![Err(BackendError::Interrupted)]);
    }

    #[tokio::test]
    async fn test_interruptible_passes_through() {
        let (_handle, registration) = AbortHandle::new_pair();
        let inner = stream::iter(vec![Ok("a".to_string()), Ok("b".to_string())]);

        let items: Vec<_> = interruptible(Abortable::new(inner, registration)).collect().await;
        assert_eq!(items, vec![Ok("a".to_string()), Ok("b".to_string())]);
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        let factory = OllamaBackendFactory::new("http://127.0.0.1:0").unwrap();
        assert!(factory.server_version().await.is_err());
    }
}
