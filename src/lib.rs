//! palank-chat - 로컬 문서 채팅
//!
//! PDF 문서를 인메모리 벡터 저장소에 수집하고, 질문과 관련된 청크를
//! 컨텍스트로 붙여 로컬 LLM 의 스트리밍 응답을 받는 RAG 시스템입니다.

pub mod cli;
pub mod collector;
pub mod controller;
pub mod embedding;
pub mod error;
pub mod extractor;
pub mod knowledge;
pub mod llm;

// Re-exports
pub use controller::{Presenter, ReplyOutcome, SessionController, StatusStyle};
pub use embedding::{EmbedderLoader, EmbeddingProvider, OllamaEmbedding, OllamaEmbeddingLoader};
pub use error::{RagError, RagResult};
pub use extractor::{Document, FileDocument, MemoryDocument};
pub use knowledge::{
    chunk_text, cosine_similarity, ChunkConfig, ChunkRecord, Chunker, IngestResult,
    RetrievalConfig, RetrievalEngine, RetrievedChunk, SlidingWindowChunker, VectorStore,
};
pub use llm::{
    BackendFactory, BackendStatus, ChatBackend, ChatMessage, GenerationOptions, GenerationSession,
    OllamaBackendFactory,
};
