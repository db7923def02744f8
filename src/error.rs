//! 에러 타입
//!
//! 검색(RetrievalEngine)과 생성(GenerationSession) 코어가 공유하는 에러 분류입니다.
//! HTTP/PDF 어댑터는 `anyhow`를 사용하고, 코어 경계에서 이 타입으로 변환됩니다.

use thiserror::Error;

/// 코어 결과 타입
pub type RagResult<T> = std::result::Result<T, RagError>;

/// RAG 채팅 코어 에러
#[derive(Debug, Error)]
pub enum RagError {
    /// 잘못된 인자 (청킹 파라미터, temperature 범위 등)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// 임베딩 차원이 저장소에 확립된 차원과 다름
    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// 문서 텍스트 추출 실패 (파일 단위로 격리됨)
    #[error("Failed to extract text from {name}: {reason}")]
    ExtractionFailed { name: String, reason: String },

    /// 청크/쿼리 임베딩 실패
    #[error("Failed to embed {target}: {reason}")]
    EmbeddingFailed { target: String, reason: String },

    /// 임베딩 모델 로드 실패 (다음 호출에서 재시도됨)
    #[error("Embedding model unavailable: {0}")]
    EmbedderUnavailable(String),

    /// 추론 백엔드 생성 실패 (같은 작업을 다시 호출하면 재시도)
    #[error("Failed to initialize inference backend: {0}")]
    BackendInit(String),

    /// 백엔드 컨텍스트 소실 (세션 내부에서 1회 자동 복구)
    #[error("Inference backend lost: {0}")]
    BackendLost(String),

    /// 사용자가 생성을 중단함
    #[error("Generation interrupted by user")]
    Interrupted,

    /// 기타 생성 실패
    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    /// 이미 생성 요청이 진행 중
    #[error("A generation request is already in progress")]
    SessionBusy,
}

impl RagError {
    /// 사용자 중단 여부 (오류와 구분해서 표시하기 위함)
    pub fn is_interrupted(&self) -> bool {
        matches!(self, RagError::Interrupted)
    }
}
