//! LLM 모듈 - 추론 백엔드 추상화와 생성 세션
//!
//! - `ChatBackend`: 스트리밍 채팅 + 중단을 제공하는 추론 엔진 핸들
//! - `BackendFactory`: 모델 로드 (진행률 콜백 포함)
//! - `GenerationSession`: 대화 이력, 프롬프트 구성, 백엔드 소실 복구

pub mod ollama;
pub(crate) mod session;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{RagError, RagResult};

pub use ollama::{OllamaBackendFactory, OllamaChatBackend};
pub use session::{compose_user_content, BackendStatus, GenerationSession};

// ============================================================================
// Constants
// ============================================================================

/// 기본 시스템 프롬프트
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful academic research assistant. \
Use the provided context to answer questions accurately. Cite your sources if possible.";

/// 기본 샘플링 온도
pub const DEFAULT_TEMPERATURE: f32 = 0.7;

/// 허용 온도 범위
pub const TEMPERATURE_RANGE: std::ops::RangeInclusive<f32> = 0.0..=2.0;

/// 기본 채팅 모델 (경량 로컬 모델)
pub const DEFAULT_CHAT_MODEL: &str = "llama3.2:1b";

// ============================================================================
// Messages
// ============================================================================

/// 메시지 역할
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// 채팅 메시지
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

// ============================================================================
// Generation Options
// ============================================================================

/// 생성 옵션
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOptions {
    /// 시스템 프롬프트 (이력에 저장되지 않고 매 요청마다 앞에 붙음)
    pub system_prompt: String,
    /// 샘플링 온도 (0.0 ~ 2.0)
    pub temperature: f32,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            temperature: DEFAULT_TEMPERATURE,
        }
    }
}

impl GenerationOptions {
    /// 옵션 검증
    pub fn validate(&self) -> RagResult<()> {
        if !TEMPERATURE_RANGE.contains(&self.temperature) {
            return Err(RagError::InvalidArgument(format!(
                "temperature must be within [0, 2], got {}",
                self.temperature
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Backend Capability
// ============================================================================

/// 모델 로드 진행 상황
#[derive(Debug, Clone, PartialEq)]
pub struct InitProgress {
    /// 사람이 읽는 단계 설명
    pub text: String,
    /// 진행률 (0.0 ~ 1.0, 알 수 없으면 None)
    pub fraction: Option<f32>,
}

impl InitProgress {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            fraction: None,
        }
    }

    pub fn with_fraction(text: impl Into<String>, fraction: f32) -> Self {
        Self {
            text: text.into(),
            fraction: Some(fraction.clamp(0.0, 1.0)),
        }
    }
}

/// 진행률 콜백
pub type ProgressCallback = Arc<dyn Fn(&InitProgress) + Send + Sync>;

/// 진행 상황을 로그로만 남기는 콜백
pub fn log_progress() -> ProgressCallback {
    Arc::new(|p: &InitProgress| tracing::info!("{}", p.text))
}

/// 백엔드 경계 에러
///
/// 세션 상태 머신은 메시지 내용이 아니라 이 종류로 분기합니다.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// 연산 컨텍스트가 무효화됨 (프로세스 종료, GPU 컨텍스트 소실 등)
    #[error("backend disposed: {0}")]
    Disposed(String),

    /// 중단 요청으로 생성이 끝남
    #[error("generation interrupted")]
    Interrupted,

    /// 기타 실패
    #[error("{0}")]
    Other(String),
}

impl From<BackendError> for RagError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Disposed(reason) => RagError::BackendLost(reason),
            BackendError::Interrupted => RagError::Interrupted,
            BackendError::Other(reason) => RagError::GenerationFailed(reason),
        }
    }
}

/// 텍스트 델타 스트림 (유한, 재시작 불가)
pub type DeltaStream = BoxStream<'static, Result<String, BackendError>>;

/// 추론 백엔드 핸들
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// 스트리밍 채팅 요청
    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
    ) -> Result<DeltaStream, BackendError>;

    /// 진행 중인 생성 중단 (없으면 no-op)
    async fn interrupt(&self);

    /// 로드된 모델 ID
    fn model_id(&self) -> &str;
}

/// 추론 백엔드 생성기
#[async_trait]
pub trait BackendFactory: Send + Sync {
    /// 모델을 로드하여 백엔드 생성 (진행률은 `on_progress`로 보고)
    async fn construct(
        &self,
        model_id: &str,
        on_progress: ProgressCallback,
    ) -> anyhow::Result<Arc<dyn ChatBackend>>;
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_serialization() {
        let json = serde_json::to_string(&ChatMessage::assistant("hi")).unwrap();
        assert_eq!(json, r#"{"role":"assistant","content":"hi"}"#);
    }

    #[test]
    fn test_options_default_and_validate() {
        let options = GenerationOptions::default();
        assert_eq!(options.temperature, 0.7);
        assert!(options.system_prompt.starts_with("You are a helpful academic research assistant"));
        assert!(options.validate().is_ok());

        for temperature in [-0.1, 2.5, f32::NAN] {
            let bad = GenerationOptions {
                temperature,
                ..Default::default()
            };
            assert!(matches!(bad.validate(), Err(RagError::InvalidArgument(_))));
        }
    }

    #[test]
    fn test_backend_error_mapping() {
        assert!(matches!(
            RagError::from(BackendError::Disposed("gpu".into())),
            RagError::BackendLost(_)
        ));
        assert!(RagError::from(BackendError::Interrupted).is_interrupted());
        assert!(matches!(
            RagError::from(BackendError::Other("x".into())),
            RagError::GenerationFailed(_)
        ));
    }

    #[test]
    fn test_progress_fraction_clamped() {
        assert_eq!(InitProgress::with_fraction("x", 1.7).fraction, Some(1.0));
    }
}
