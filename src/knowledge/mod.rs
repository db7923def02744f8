//! Knowledge 모듈 - 인메모리 RAG 지식 저장소
//!
//! - Chunker: 슬라이딩 윈도우 텍스트 분할
//! - VectorStore: 임베딩 레코드 저장 + 코사인 유사도 순위
//! - RetrievalEngine: 수집 파이프라인과 시맨틱 검색

pub mod chunker;
pub mod engine;
pub mod vector;

// Re-exports
pub use chunker::{
    chunk_text, normalize_whitespace, ChunkConfig, Chunker, SlidingWindowChunker,
    DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE,
};
pub use engine::{IngestResult, RetrievalConfig, RetrievalEngine, RetrievedChunk};
pub use vector::{cosine_similarity, ChunkRecord, ScoredRecord, VectorStore};
