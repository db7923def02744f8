//! Text Chunking Module
//!
//! 공백을 정규화한 텍스트 위로 고정 크기 윈도우를 밀어가며
//! 서로 겹치는 청크를 만듭니다.

use crate::error::{RagError, RagResult};

// ============================================================================
// Chunk Configuration
// ============================================================================

/// 기본 청크 크기 (문자 수)
pub const DEFAULT_CHUNK_SIZE: usize = 500;

/// 기본 오버랩 크기 (문자 수)
pub const DEFAULT_CHUNK_OVERLAP: usize = 100;

/// 청킹 설정
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkConfig {
    /// 청크 크기 (문자 수)
    pub chunk_size: usize,
    /// 인접 청크 간 오버랩 (문자 수)
    pub overlap: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            overlap: DEFAULT_CHUNK_OVERLAP,
        }
    }
}

impl ChunkConfig {
    /// 오버랩 없는 설정
    pub fn without_overlap(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            overlap: 0,
        }
    }

    /// 파라미터 검증
    pub fn validate(&self) -> RagResult<()> {
        if self.chunk_size == 0 {
            return Err(RagError::InvalidArgument(
                "chunk size must be greater than zero".to_string(),
            ));
        }
        if self.overlap >= self.chunk_size {
            return Err(RagError::InvalidArgument(format!(
                "overlap ({}) must be smaller than chunk size ({})",
                self.overlap, self.chunk_size
            )));
        }
        Ok(())
    }

    /// 윈도우 이동 폭
    pub fn step(&self) -> usize {
        self.chunk_size - self.overlap
    }
}

// ============================================================================
// Chunker Trait
// ============================================================================

/// 텍스트 청킹 전략 트레이트
pub trait Chunker: Send + Sync {
    /// 텍스트를 청크로 분할
    fn chunk(&self, text: &str) -> Vec<String>;

    /// 청커 이름
    fn name(&self) -> &'static str;
}

// ============================================================================
// SlidingWindowChunker
// ============================================================================

/// 슬라이딩 윈도우 청커
///
/// 설정은 생성 시점에 검증되므로 `chunk` 호출은 실패하지 않습니다.
#[derive(Debug, Clone)]
pub struct SlidingWindowChunker {
    config: ChunkConfig,
}

impl SlidingWindowChunker {
    /// 설정으로 생성
    pub fn new(config: ChunkConfig) -> RagResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// 기본 설정 (500 / 100)
    pub fn with_defaults() -> Self {
        Self {
            config: ChunkConfig::default(),
        }
    }
}

impl Chunker for SlidingWindowChunker {
    fn chunk(&self, text: &str) -> Vec<String> {
        windows(&normalize_whitespace(text), self.config)
    }

    fn name(&self) -> &'static str {
        "SlidingWindowChunker"
    }
}

// ============================================================================
// Functions
// ============================================================================

/// 텍스트를 겹치는 고정 크기 청크로 분할
///
/// 연속 공백은 한 칸으로 줄이고 양 끝을 잘라낸 뒤, 길이 `chunk_size`의
/// 윈도우를 `chunk_size - overlap`씩 이동합니다. 마지막 청크는 더 짧을 수 있습니다.
///
/// # Errors
/// `chunk_size == 0` 이거나 `overlap >= chunk_size` 이면 `InvalidArgument`
pub fn chunk_text(text: &str, chunk_size: usize, overlap: usize) -> RagResult<Vec<String>> {
    let config = ChunkConfig {
        chunk_size,
        overlap,
    };
    config.validate()?;
    Ok(windows(&normalize_whitespace(text), config))
}

/// 연속 공백을 단일 공백으로 축약
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

// 길이는 문자(char) 단위로 계산하므로 UTF-8 경계에서 잘리지 않음
fn windows(normalized: &str, config: ChunkConfig) -> Vec<String> {
    let chars: Vec<char> = normalized.chars().collect();
    if chars.is_empty() {
        return vec![];
    }

    let step = config.step();
    let mut chunks = Vec::with_capacity(chars.len() / step + 1);
    let mut start = 0;

    while start < chars.len() {
        let end = start.saturating_add(config.chunk_size).min(chars.len());
        chunks.push(chars[start..end].iter().collect());
        start += step;
    }

    chunks
}

// ============================================================================
// Tests
// ============================================================================
