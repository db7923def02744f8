//! Retrieval Engine - 문서 수집 및 시맨틱 검색
//!
//! 추출 → 청킹 → 임베딩 → 저장 파이프라인과 쿼리 시점 검색을 담당합니다.
//! 벡터 저장소와 임베딩 프로바이더를 단독으로 소유합니다.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::OnceCell;

use crate::embedding::{EmbedderLoader, EmbeddingProvider};
use crate::error::{RagError, RagResult};
use crate::extractor::{Document, PDF_MIME};

use super::chunker::{ChunkConfig, Chunker, SlidingWindowChunker};
use super::vector::{ChunkRecord, VectorStore};

// ============================================================================
// Types
// ============================================================================

/// 검색 엔진 설정
#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    /// 청킹 설정
    pub chunk: ChunkConfig,
    /// 수집 가능한 MIME 타입 (그 외는 조용히 건너뜀)
    pub accepted_types: Vec<String>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            chunk: ChunkConfig::default(),
            accepted_types: vec![PDF_MIME.to_string()],
        }
    }
}

impl RetrievalConfig {
    /// MIME 타입 추가
    pub fn accept(mut self, mime_type: &str) -> Self {
        if !self.accepts(mime_type) {
            self.accepted_types.push(mime_type.to_string());
        }
        self
    }

    pub fn accepts(&self, mime_type: &str) -> bool {
        self.accepted_types.iter().any(|t| t == mime_type)
    }
}

/// 파일별 수집 결과
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestResult {
    /// 문서 이름
    pub name: String,
    /// 추출된 텍스트 길이 (문자 수)
    pub text_length: usize,
    /// 생성된 청크 수
    pub chunk_count: usize,
    /// 수집 후 저장소 전체 레코드 수
    pub vector_count: usize,
}

/// 검색 결과
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedChunk {
    pub text: String,
    pub source: String,
    /// 코사인 유사도
    pub score: f32,
}

// ============================================================================
// RetrievalEngine
// ============================================================================

/// 검색 엔진
///
/// 임베딩 모델은 첫 사용 시점에 로드됩니다. 로드 실패는 캐시되지 않으므로
/// 다음 호출에서 다시 시도합니다.
pub struct RetrievalEngine {
    store: VectorStore,
    chunker: SlidingWindowChunker,
    config: RetrievalConfig,
    loader: Arc<dyn EmbedderLoader>,
    embedder: OnceCell<Arc<dyn EmbeddingProvider>>,
}

impl RetrievalEngine {
    /// 기본 설정으로 생성
    pub fn new(loader: Arc<dyn EmbedderLoader>) -> Self {
        Self {
            store: VectorStore::new(),
            chunker: SlidingWindowChunker::with_defaults(),
            config: RetrievalConfig::default(),
            loader,
            embedder: OnceCell::new(),
        }
    }

    /// 설정 지정하여 생성
    pub fn with_config(loader: Arc<dyn EmbedderLoader>, config: RetrievalConfig) -> RagResult<Self> {
        let chunker = SlidingWindowChunker::new(config.chunk)?;
        Ok(Self {
            store: VectorStore::new(),
            chunker,
            config,
            loader,
            embedder: OnceCell::new(),
        })
    }

    /// 임베딩 모델 미리 로드
    pub async fn warm_up(&self) -> RagResult<()> {
        self.embedder().await.map(|_| ())
    }

    /// 임베딩 모델이 로드되었는지 여부
    pub fn is_embedder_ready(&self) -> bool {
        self.embedder.initialized()
    }

    // 동시 호출자는 진행 중인 같은 로드를 기다림
    async fn embedder(&self) -> RagResult<Arc<dyn EmbeddingProvider>> {
        self.embedder
            .get_or_try_init(|| async {
                let embedder = self.loader.load().await?;
                tracing::info!(
                    "Embedding model {} loaded (dimension {})",
                    embedder.name(),
                    embedder.dimension()
                );
                Ok::<_, anyhow::Error>(embedder)
            })
            .await
            .cloned()
            .map_err(|e| {
                tracing::error!("Failed to load embedding model: {:#}", e);
                RagError::EmbedderUnavailable(format!("{:#}", e))
            })
    }

    /// 문서 수집
    ///
    /// 지원하지 않는 타입은 건너뛰고, 파일 하나의 실패는 로그로 남긴 뒤
    /// 결과에서 제외합니다. 나머지 파일은 계속 처리합니다.
    /// 파일은 순서대로 처리되므로 저장 순서는 입력 순서를 따릅니다.
    pub async fn ingest<F>(
        &mut self,
        files: &[Arc<dyn Document>],
        mut on_progress: F,
    ) -> Vec<IngestResult>
    where
        F: FnMut(&str) + Send,
    {
        let mut results = Vec::new();

        for file in files {
            if !self.config.accepts(file.mime_type()) {
                tracing::debug!("Skipping {} ({})", file.name(), file.mime_type());
                continue;
            }

            match self.ingest_one(file.as_ref(), &mut on_progress).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    tracing::error!("Error reading {}: {}", file.name(), e);
                    on_progress(&format!("Failed to read {}: {}", file.name(), e));
                }
            }
        }

        results
    }

    async fn ingest_one<F>(&mut self, doc: &dyn Document, on_progress: &mut F) -> RagResult<IngestResult>
    where
        F: FnMut(&str) + Send,
    {
        let name = doc.name().to_string();

        on_progress(&format!("Reading {}...", name));
        let text = doc
            .extract_text()
            .await
            .map_err(|e| RagError::ExtractionFailed {
                name: name.clone(),
                reason: format!("{:#}", e),
            })?;

        on_progress(&format!("Chunking {}...", name));
        let chunks = self.chunker.chunk(&text);

        on_progress(&format!("Embedding {} segments...", chunks.len()));
        let chunk_count = chunks.len();

        if chunk_count > 0 {
            let embedder = self.embedder().await?;
            let embeddings = embedder
                .embed_batch(&chunks)
                .await
                .map_err(|e| RagError::EmbeddingFailed {
                    target: format!("{} ({} segments)", name, chunk_count),
                    reason: format!("{:#}", e),
                })?;

            if embeddings.len() != chunk_count {
                return Err(RagError::EmbeddingFailed {
                    target: name,
                    reason: format!(
                        "{} embeddings returned for {} segments",
                        embeddings.len(),
                        chunk_count
                    ),
                });
            }

            let records: Vec<ChunkRecord> = chunks
                .into_iter()
                .zip(embeddings)
                .map(|(chunk, embedding)| ChunkRecord::new(chunk, embedding, name.as_str()))
                .collect();

            // 파일 단위로 전부 저장하거나 전혀 저장하지 않음
            self.store.append_batch(records)?;
        } else {
            tracing::warn!("No text extracted from {}", name);
        }

        tracing::info!(
            "Ingested {} (chunks={}, total vectors={})",
            name,
            chunk_count,
            self.store.len()
        );

        Ok(IngestResult {
            name,
            text_length: text.chars().count(),
            chunk_count,
            vector_count: self.store.len(),
        })
    }

    /// 시맨틱 검색
    ///
    /// 쿼리를 임베딩한 뒤 저장소에서 상위 `k`개를 점수 내림차순으로 반환합니다.
    pub async fn search(&self, query: &str, k: usize) -> RagResult<Vec<RetrievedChunk>> {
        let embedder = self.embedder().await?;
        tracing::info!("Searching for: \"{}\"", query);

        let query_vector = embedder
            .embed(query)
            .await
            .map_err(|e| RagError::EmbeddingFailed {
                target: "query".to_string(),
                reason: format!("{:#}", e),
            })?;

        if let Some(expected) = self.store.dimension() {
            if expected != query_vector.len() {
                return Err(RagError::DimensionMismatch {
                    expected,
                    actual: query_vector.len(),
                });
            }
        }

        Ok(self
            .store
            .rank(&query_vector, k)
            .into_iter()
            .map(|scored| RetrievedChunk {
                text: scored.record.text.clone(),
                source: scored.record.source.clone(),
                score: scored.score,
            })
            .collect())
    }

    /// 수집된 문서 이름 목록
    pub fn list_sources(&self) -> Vec<String> {
        self.store.unique_sources()
    }

    /// 저장된 청크 수
    pub fn record_count(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn store(&self) -> &VectorStore {
        &self.store
    }

    /// 지식베이스 초기화
    pub fn clear(&mut self) {
        tracing::info!("Clearing {} stored vectors", self.store.len());
        self.store.clear();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::extractor::{MemoryDocument, TEXT_MIME};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// 알파벳 빈도 임베딩 (26차원)
    pub(crate) struct LetterEmbedding;

    #[async_trait]
    impl EmbeddingProvider for LetterEmbedding {
        async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
            let mut v = vec![0.0; 26];
            for c in text.chars().filter(|c| c.is_ascii_alphabetic()) {
                v[(c.to_ascii_lowercase() as u8 - b'a') as usize] += 1.0;
            }
            Ok(v)
        }

        fn dimension(&self) -> usize {
            26
        }

        fn name(&self) -> &str {
            "letters"
        }
    }

    /// 처음 `failures`번은 실패하는 로더
    pub(crate) struct FakeLoader {
        pub loads: AtomicUsize,
        failures: usize,
    }

    impl FakeLoader {
        pub(crate) fn new() -> Arc<Self> {
            Self::failing(0)
        }

        pub(crate) fn failing(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                loads: AtomicUsize::new(0),
                failures,
            })
        }
    }

    #[async_trait]
    impl EmbedderLoader for FakeLoader {
        async fn load(&self) -> anyhow::Result<Arc<dyn EmbeddingProvider>> {
            let attempt = self.loads.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            if attempt < self.failures {
                anyhow::bail!("model download failed");
            }
            Ok(Arc::new(LetterEmbedding))
        }
    }

    /// `fail_on`번째 `embed` 호출에서 실패하는 임베딩 (1부터 셈)
    pub(crate) struct FlakyEmbedding {
        pub calls: AtomicUsize,
        pub batches: AtomicUsize,
        fail_on: usize,
    }

    impl FlakyEmbedding {
        pub(crate) fn failing_on(fail_on: usize) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                batches: AtomicUsize::new(0),
                fail_on,
            })
        }
    }

    #[async_trait]
    impl EmbeddingProvider for FlakyEmbedding {
        async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call == self.fail_on {
                anyhow::bail!("embedding request timed out");
            }
            LetterEmbedding.embed(text).await
        }

        async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            self.batches.fetch_add(1, Ordering::SeqCst);
            let mut results = Vec::with_capacity(texts.len());
            for text in texts {
                results.push(self.embed(text).await?);
            }
            Ok(results)
        }

        fn dimension(&self) -> usize {
            26
        }

        fn name(&self) -> &str {
            "flaky-letters"
        }
    }

    /// 미리 만든 임베딩을 돌려주는 로더
    pub(crate) struct FixedLoader(pub Arc<dyn EmbeddingProvider>);

    #[async_trait]
    impl EmbedderLoader for FixedLoader {
        async fn load(&self) -> anyhow::Result<Arc<dyn EmbeddingProvider>> {
            Ok(self.0.clone())
        }
    }

    struct BrokenDocument;

    #[async_trait]
    impl Document for BrokenDocument {
        fn mime_type(&self) -> &str {
            PDF_MIME
        }

        fn name(&self) -> &str {
            "broken.pdf"
        }

        async fn extract_text(&self) -> anyhow::Result<String> {
            anyhow::bail!("corrupt xref table")
        }
    }

    pub(crate) fn pdf(name: &str, text: &str) -> Arc<dyn Document> {
        Arc::new(MemoryDocument::new(name, PDF_MIME, text))
    }

    fn sample(len: usize) -> String {
        "the quick brown fox jumps over the lazy dog "
            .chars()
            .cycle()
            .filter(|c| !c.is_whitespace())
            .take(len)
            .collect()
    }

    #[tokio::test]
    async fn test_ingest_and_search_end_to_end() {
        let mut engine = RetrievalEngine::new(FakeLoader::new());
        let text = sample(1200);

        let results = engine.ingest(&[pdf("paper.pdf", &text)], |_| {}).await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk_count, 3);
        assert_eq!(results[0].text_length, 1200);
        assert_eq!(results[0].vector_count, 3);

        let records = engine.store().records();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].text, text[0..500]);
        assert_eq!(records[1].text, text[400..900]);
        assert_eq!(records[2].text, text[800..1200]);
        assert!(records.iter().all(|r| r.source == "paper.pdf"));

        let hits = engine.search("lazy fox", 2).await.unwrap();
        assert!(hits.len() <= 2);
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
        assert!(hits.iter().all(|h| h.source == "paper.pdf"));
    }

    #[tokio::test]
    async fn test_ingest_reports_progress() {
        let mut engine = RetrievalEngine::new(FakeLoader::new());
        let mut phases = Vec::new();

        engine
            .ingest(&[pdf("a.pdf", &sample(600))], |p| phases.push(p.to_string()))
            .await;

        assert_eq!(
            phases,
            vec!["Reading a.pdf...", "Chunking a.pdf...", "Embedding 2 segments..."]
        );
    }

    #[tokio::test]
    async fn test_ingest_skips_unsupported_type() {
        let mut engine = RetrievalEngine::new(FakeLoader::new());
        let doc: Arc<dyn Document> = Arc::new(MemoryDocument::text("notes.txt", "hello"));

        let results = engine.ingest(&[doc.clone()], |_| {}).await;
        assert!(results.is_empty());
        assert!(engine.is_empty());

        let config = RetrievalConfig::default().accept(TEXT_MIME);
        let mut engine = RetrievalEngine::with_config(FakeLoader::new(), config).unwrap();
        assert_eq!(engine.ingest(&[doc], |_| {}).await.len(), 1);
    }

    #[tokio::test]
    async fn test_ingest_isolates_failed_file() {
        let mut engine = RetrievalEngine::new(FakeLoader::new());
        let messages = Mutex::new(Vec::new());

        let files: Vec<Arc<dyn Document>> = vec![
            Arc::new(BrokenDocument),
            pdf("good.pdf", &sample(300)),
        ];
        let results = engine
            .ingest(&files, |p| messages.lock().unwrap().push(p.to_string()))
            .await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name, "good.pdf");
        assert_eq!(engine.list_sources(), vec!["good.pdf".to_string()]);
        assert!(messages
            .lock()
            .unwrap()
            .iter()
            .any(|m| m.starts_with("Failed to read broken.pdf")));
    }

    #[tokio::test]
    async fn test_embedding_failure_mid_file_is_isolated() {
        let embedder = FlakyEmbedding::failing_on(3);
        let mut engine = RetrievalEngine::new(Arc::new(FixedLoader(embedder.clone())));
        let messages = Mutex::new(Vec::new());

        // b.pdf 는 3개 청크 중 두 번째에서 실패
        let files = vec![
            pdf("a.pdf", &sample(300)),
            pdf("b.pdf", &sample(1000)),
            pdf("c.pdf", &sample(300)),
        ];
        let results = engine
            .ingest(&files, |p| messages.lock().unwrap().push(p.to_string()))
            .await;

        let names: Vec<&str> = results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["a.pdf", "c.pdf"]);
        assert_eq!(engine.record_count(), 2);
        assert_eq!(engine.list_sources(), vec!["a.pdf".to_string(), "c.pdf".to_string()]);
        assert_eq!(results[1].vector_count, 2);
        assert!(messages
            .lock()
            .unwrap()
            .iter()
            .any(|m| m.starts_with("Failed to read b.pdf")));

        // 파일당 한 번의 배치 요청
        assert_eq!(embedder.batches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unique_sources_after_two_files() {
        let mut engine = RetrievalEngine::new(FakeLoader::new());
        engine
            .ingest(&[pdf("B.pdf", &sample(1000)), pdf("A.pdf", &sample(700))], |_| {})
            .await;

        assert_eq!(engine.record_count(), 5);
        let mut sources = engine.list_sources();
        sources.sort();
        assert_eq!(sources, vec!["A.pdf".to_string(), "B.pdf".to_string()]);
    }

    #[tokio::test]
    async fn test_embedder_failure_is_retried() {
        let loader = FakeLoader::failing(1);
        let mut engine = RetrievalEngine::new(loader.clone());

        // 첫 로드 실패 → 파일 제외, 엔진은 계속 사용 가능
        let first = engine.ingest(&[pdf("a.pdf", &sample(100))], |_| {}).await;
        assert!(first.is_empty());
        assert!(!engine.is_embedder_ready());

        let second = engine.ingest(&[pdf("a.pdf", &sample(100))], |_| {}).await;
        assert_eq!(second.len(), 1);
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_searches_load_once() {
        let loader = FakeLoader::new();
        let engine = RetrievalEngine::new(loader.clone());

        let (a, b) = tokio::join!(engine.search("alpha", 3), engine.search("beta", 3));
        assert!(a.unwrap().is_empty());
        assert!(b.unwrap().is_empty());
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reingest_appends() {
        let mut engine = RetrievalEngine::new(FakeLoader::new());
        let doc = pdf("a.pdf", &sample(300));

        engine.ingest(&[doc.clone()], |_| {}).await;
        engine.ingest(&[doc], |_| {}).await;

        assert_eq!(engine.record_count(), 2);
        assert_eq!(engine.list_sources().len(), 1);

        engine.clear();
        assert!(engine.is_empty());
    }

    #[test]
    fn test_invalid_chunk_config_rejected() {
        let config = RetrievalConfig {
            chunk: ChunkConfig {
                chunk_size: 100,
                overlap: 100,
            },
            ..Default::default()
        };
        assert!(matches!(
            RetrievalEngine::with_config(FakeLoader::new(), config),
            Err(RagError::InvalidArgument(_))
        ));
    }
}
