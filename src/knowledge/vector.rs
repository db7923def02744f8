//! Vector Store - 인메모리 벡터 저장소
//!
//! 청크 레코드를 삽입 순서대로 보관하고 코사인 유사도로 순위를 매깁니다.
//! 레코드는 추가만 가능하며, 한 번 저장되면 수정되지 않습니다.

use std::cmp::Ordering;
use std::collections::HashSet;

use crate::error::{RagError, RagResult};

// ============================================================================
// Types
// ============================================================================

/// 청크 레코드
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRecord {
    /// 고유 ID (UUID v4)
    pub id: String,
    /// 청크 텍스트
    pub text: String,
    /// 임베딩 벡터
    pub embedding: Vec<f32>,
    /// 원본 문서 이름
    pub source: String,
}

impl ChunkRecord {
    /// 새 ID를 발급하여 레코드 생성
    pub fn new(text: impl Into<String>, embedding: Vec<f32>, source: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            text: text.into(),
            embedding,
            source: source.into(),
        }
    }
}

/// 순위 결과
#[derive(Debug, Clone, Copy)]
pub struct ScoredRecord<'a> {
    pub record: &'a ChunkRecord,
    /// 코사인 유사도 (-1.0 ~ 1.0)
    pub score: f32,
}

// ============================================================================
// VectorStore
// ============================================================================

/// 인메모리 벡터 저장소
///
/// 첫 레코드의 임베딩 길이가 저장소의 차원이 됩니다.
/// 쓰기는 `&mut self`를 요구하므로 단일 writer가 컴파일 타임에 보장됩니다.
#[derive(Debug, Default)]
pub struct VectorStore {
    records: Vec<ChunkRecord>,
    dimension: Option<usize>,
}

impl VectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 레코드 추가
    pub fn append(&mut self, record: ChunkRecord) -> RagResult<()> {
        self.check_dimension(record.embedding.len())?;
        self.dimension.get_or_insert(record.embedding.len());
        self.records.push(record);
        Ok(())
    }

    /// 레코드 배치 추가
    ///
    /// 모든 레코드의 차원을 먼저 검증하므로, 실패 시 아무 것도 추가되지 않습니다.
    pub fn append_batch(&mut self, records: Vec<ChunkRecord>) -> RagResult<usize> {
        let expected = self
            .dimension
            .or_else(|| records.first().map(|r| r.embedding.len()));

        if let Some(expected) = expected {
            if let Some(bad) = records.iter().find(|r| r.embedding.len() != expected) {
                return Err(RagError::DimensionMismatch {
                    expected,
                    actual: bad.embedding.len(),
                });
            }
        }

        let count = records.len();
        for record in records {
            self.append(record)?;
        }
        Ok(count)
    }

    fn check_dimension(&self, actual: usize) -> RagResult<()> {
        match self.dimension {
            Some(expected) if expected != actual => {
                Err(RagError::DimensionMismatch { expected, actual })
            }
            _ => Ok(()),
        }
    }

    /// 유사도 순위
    ///
    /// 점수 내림차순, 동점이면 먼저 삽입된 레코드가 앞에 옵니다.
    /// 결과 길이는 `min(k, len)` 입니다.
    pub fn rank(&self, query: &[f32], k: usize) -> Vec<ScoredRecord<'_>> {
        let mut scored: Vec<ScoredRecord<'_>> = self
            .records
            .iter()
            .map(|record| ScoredRecord {
                record,
                score: cosine_similarity(query, &record.embedding),
            })
            .collect();

        // sort_by는 안정 정렬이므로 동점 시 삽입 순서 유지 (0.0 과 -0.0 도 동점)
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        scored.truncate(k);
        scored
    }

    /// 고유 소스 목록 (처음 등장한 순서)
    pub fn unique_sources(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.records
            .iter()
            .filter(|r| seen.insert(r.source.as_str()))
            .map(|r| r.source.clone())
            .collect()
    }

    pub fn records(&self) -> &[ChunkRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// 확립된 임베딩 차원 (비어 있으면 None)
    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    /// 전체 삭제 (차원도 초기화)
    pub fn clear(&mut self) {
        self.records.clear();
        self.dimension = None;
    }
}

// ============================================================================
// Utility Functions
// ============================================================================

/// 코사인 유사도 계산
///
/// 길이가 다르거나, 비어 있거나, 한쪽 크기가 0이면 0.0을 반환합니다
/// (NaN 없이 순위가 항상 전순서가 되도록).
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn record(text: &str, embedding: Vec<f32>, source: &str) -> ChunkRecord {
        ChunkRecord::new(text, embedding, source)
    }

    #[test]
    fn test_cosine_similarity_same() {
        let a = vec![0.3, -1.2, 4.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 0.0001);
    }

    #[test]
    fn test_cosine_similarity_orthogonal_and_opposite() {
        let a = vec![1.0, 0.0, 0.0];
        assert!(cosine_similarity(&a, &[0.0, 1.0, 0.0]).abs() < 0.0001);
        assert!((cosine_similarity(&a, &[-1.0, 0.0, 0.0]) + 1.0).abs() < 0.0001);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        let zero = vec![0.0, 0.0, 0.0];
        assert_eq!(cosine_similarity(&zero, &[1.0, 2.0, 3.0]), 0.0);
        assert_eq!(cosine_similarity(&zero, &zero), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn test_append_dimension_mismatch() {
        let mut store = VectorStore::new();
        store.append(record("a", vec![1.0, 0.0], "A")).unwrap();

        let err = store.append(record("b", vec![1.0, 0.0, 0.0], "A")).unwrap_err();
        assert!(matches!(
            err,
            RagError::DimensionMismatch {
                expected: 2,
                actual: 3
            }
        ));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_append_batch_is_all_or_nothing() {
        let mut store = VectorStore::new();
        let batch = vec![
            record("a", vec![1.0, 0.0], "A"),
            record("b", vec![0.0, 1.0], "A"),
            record("c", vec![0.0], "A"),
        ];

        assert!(store.append_batch(batch).is_err());
        assert!(store.is_empty());
        assert_eq!(store.dimension(), None);
    }

    #[test]
    fn test_append_is_monotone() {
        let mut store = VectorStore::new();
        store.append(record("a", vec![1.0, 0.0], "A")).unwrap();
        let first = store.records()[0].clone();

        store
            .append_batch(vec![
                record("b", vec![0.0, 1.0], "B"),
                record("c", vec![1.0, 1.0], "B"),
            ])
            .unwrap();

        assert_eq!(store.len(), 3);
        assert_eq!(store.records()[0], first);
    }

    #[test]
    fn test_rank_sorted_and_bounded() {
        let mut store = VectorStore::new();
        store.append(record("x", vec![1.0, 0.0], "A")).unwrap();
        store.append(record("y", vec![0.0, 1.0], "A")).unwrap();
        store.append(record("xy", vec![1.0, 1.0], "B")).unwrap();

        let ranked = store.rank(&[1.0, 0.1], 2);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].record.text, "x");
        assert_eq!(ranked[1].record.text, "xy");

        let all = store.rank(&[0.2, 1.0], 10);
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].score >= w[1].score));

        let mut ids: Vec<&str> = all.iter().map(|s| s.record.id.as_str()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn test_rank_ties_keep_insertion_order() {
        let mut store = VectorStore::new();
        for text in ["first", "second", "third"] {
            store.append(record(text, vec![2.0, 2.0], "A")).unwrap();
        }

        let ranked = store.rank(&[1.0, 1.0], 3);
        let texts: Vec<&str> = ranked.iter().map(|s| s.record.text.as_str()).collect();
        assert_eq!(texts, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_rank_signed_zero_scores_tie() {
        let mut store = VectorStore::new();
        store.append(record("first", vec![0.0, -1.0], "A")).unwrap();
        store.append(record("second", vec![0.0, 1.0], "A")).unwrap();

        let ranked = store.rank(&[-1.0, 0.0], 2);
        assert_eq!(ranked[0].score, 0.0);
        assert_eq!(ranked[1].score, 0.0);

        let texts: Vec<&str> = ranked.iter().map(|s| s.record.text.as_str()).collect();
        assert_eq!(texts, vec!["first", "second"]);
    }

    #[test]
    fn test_rank_empty_store() {
        let store = VectorStore::new();
        assert!(store.rank(&[1.0], 3).is_empty());
    }

    #[test]
    fn test_unique_sources() {
        let mut store = VectorStore::new();
        for _ in 0..2 {
            store.append(record("a", vec![1.0], "A.pdf")).unwrap();
        }
        for _ in 0..3 {
            store.append(record("b", vec![1.0], "B.pdf")).unwrap();
        }

        let mut sources = store.unique_sources();
        sources.sort();
        assert_eq!(sources, vec!["A.pdf".to_string(), "B.pdf".to_string()]);
    }

    #[test]
    fn test_clear_resets_dimension() {
        let mut store = VectorStore::new();
        store.append(record("a", vec![1.0, 2.0], "A")).unwrap();
        store.clear();

        assert!(store.is_empty());
        store.append(record("b", vec![1.0, 2.0, 3.0], "A")).unwrap();
        assert_eq!(store.dimension(), Some(3));
    }
}
