//! 임베딩 모듈 - 로컬 Ollama 서버를 통한 텍스트 벡터화
//!
//! 텍스트를 벡터로 변환하는 임베딩 프로바이더와,
//! 무거운 모델 로드를 지연시키기 위한 로더 트레이트를 정의합니다.
//!
//! ## 사용법
//! ```rust,ignore
//! let loader = OllamaEmbeddingLoader::from_env(DEFAULT_EMBED_MODEL)?;
//! let embedder = loader.load().await?;
//! let embedding = embedder.embed("Hello, world!").await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// ============================================================================
// EmbeddingProvider Trait
// ============================================================================

/// 임베딩 프로바이더 트레이트
///
/// 텍스트를 벡터로 변환하는 인터페이스입니다.
/// 한 인스턴스가 반환하는 벡터의 차원은 항상 같아야 합니다.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// 단일 텍스트 임베딩
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// 배치 임베딩 (기본 구현: 순차 호출)
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }

    /// 임베딩 차원 수
    fn dimension(&self) -> usize;

    /// 프로바이더 이름
    fn name(&self) -> &str;
}

/// 임베딩 프로바이더 로더
///
/// 모델 로드는 느리고 실패할 수 있으므로 첫 사용 시점까지 미룹니다.
/// 실패해도 다음 호출에서 다시 시도할 수 있어야 합니다.
#[async_trait]
pub trait EmbedderLoader: Send + Sync {
    async fn load(&self) -> Result<Arc<dyn EmbeddingProvider>>;
}

// ============================================================================
// Ollama Embedding
// ============================================================================

/// 기본 Ollama 주소
pub const DEFAULT_OLLAMA_HOST: &str = "http://localhost:11434";

/// 기본 임베딩 모델 (384차원 sentence-transformer)
pub const DEFAULT_EMBED_MODEL: &str = "all-minilm";

/// `/api/embed` 요청 한 번에 보내는 최대 텍스트 수
const MAX_BATCH_SIZE: usize = 64;

/// 요청 타임아웃
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Ollama 임베딩 구현체
///
/// source: https://github.com/ollama/ollama/blob/main/docs/api.md#generate-embeddings
#[derive(Debug)]
pub struct OllamaEmbedding {
    host: String,
    model: String,
    client: reqwest::Client,
    dimension: usize,
}

/// Ollama `/api/embed` 요청 본문
#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
}

/// Ollama `/api/embed` 응답
#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Ollama 에러 응답
#[derive(Debug, Deserialize)]
struct OllamaError {
    error: String,
}

impl OllamaEmbedding {
    /// 서버에 접속해 모델을 확인하고 차원을 측정하여 생성
    pub async fn connect(host: &str, model: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        let mut embedder = Self {
            host: host.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client,
            dimension: 0,
        };

        // 샘플 임베딩으로 모델 로드 + 차원 확인
        let sample = embedder
            .request(&["dimension check"])
            .await
            .with_context(|| format!("Embedding model '{}' is not available", model))?;

        embedder.dimension = sample
            .first()
            .map(Vec::len)
            .filter(|d| *d > 0)
            .ok_or_else(|| anyhow::anyhow!("Embedding model '{}' returned an empty vector", model))?;

        tracing::info!(
            "Using Ollama embedding {} (dimension: {})",
            embedder.model,
            embedder.dimension
        );
        Ok(embedder)
    }

    async fn request(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/api/embed", self.host);
        let request = EmbedRequest {
            model: &self.model,
            input: texts.to_vec(),
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .context("Failed to send embedding request")?;

        let status = response.status();
        let body = response
            .text()
            .await
            .context("Failed to read response body")?;

        if !status.is_success() {
            if let Ok(error) = serde_json::from_str::<OllamaError>(&body) {
                anyhow::bail!("Ollama API error ({}): {}", status, error.error);
            }
            anyhow::bail!("Ollama API error ({}): {}", status, body);
        }

        let parsed: EmbedResponse =
            serde_json::from_str(&body).context("Failed to parse embedding response")?;

        if parsed.embeddings.len() != texts.len() {
            anyhow::bail!(
                "Ollama returned {} embeddings for {} inputs",
                parsed.embeddings.len(),
                texts.len()
            );
        }

        Ok(parsed.embeddings)
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        // 빈 텍스트 처리
        if text.trim().is_empty() {
            return Ok(vec![0.0; self.dimension]);
        }

        self.request(&[text])
            .await?
            .pop()
            .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        tracing::debug!("Embedding batch of {} texts", texts.len());

        let mut embeddings = Vec::with_capacity(texts.len());
        for batch in texts.chunks(MAX_BATCH_SIZE) {
            let refs: Vec<&str> = batch.iter().map(String::as_str).collect();
            embeddings.extend(self.request(&refs).await?);
        }
        Ok(embeddings)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        &self.model
    }
}

/// Ollama 임베딩 로더
#[derive(Debug, Clone)]
pub struct OllamaEmbeddingLoader {
    host: String,
    model: String,
}

impl OllamaEmbeddingLoader {
    pub fn new(host: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            model: model.into(),
        }
    }

    /// `OLLAMA_HOST` 환경변수의 서버를 사용
    pub fn from_env(model: impl Into<String>) -> Result<Self> {
        Ok(Self::new(get_ollama_host()?, model))
    }
}

#[async_trait]
impl EmbedderLoader for OllamaEmbeddingLoader {
    async fn load(&self) -> Result<Arc<dyn EmbeddingProvider>> {
        tracing::info!("Loading embedding model {}...", self.model);
        let embedder = OllamaEmbedding::connect(&self.host, &self.model).await?;
        Ok(Arc::new(embedder))
    }
}

// ============================================================================
// Host Configuration
// ============================================================================

/// Ollama 서버 주소 로드 (환경변수에서)
///
/// 우선순위:
/// 1. `OLLAMA_HOST` 환경변수 (스킴이 없으면 `http://` 추가)
/// 2. `http://localhost:11434`
pub fn get_ollama_host() -> Result<String> {
    match std::env::var("OLLAMA_HOST") {
        Ok(host) if !host.trim().is_empty() => {
            tracing::debug!("Using Ollama host from OLLAMA_HOST");
            normalize_host(&host)
        }
        _ => Ok(DEFAULT_OLLAMA_HOST.to_string()),
    }
}

/// 호스트 문자열 검증 및 정규화
pub fn normalize_host(host: &str) -> Result<String> {
    let host = host.trim();
    let with_scheme = if host.contains("://") {
        host.to_string()
    } else {
        format!("http://{}", host)
    };

    let parsed = url::Url::parse(&with_scheme)
        .with_context(|| format!("Invalid Ollama host: {}", host))?;

    if !matches!(parsed.scheme(), "http" | "https") {
        anyhow::bail!("Unsupported Ollama host scheme: {}", parsed.scheme());
    }

    Ok(with_scheme.trim_end_matches('/').to_string())
}

// ============================================================================
// Tests
// ============================================================================
