//! Similarity Retriever - 코사인 유사도 기반 최근접 검색
//!
//! 쿼리 임베딩과 코퍼스 청크 임베딩의 코사인 유사도를 전수 계산하여
//! 상위 K개를 반환합니다. 코퍼스가 수백 청크 규모라 선형 스캔으로 충분하며
//! ANN 인덱스는 사용하지 않습니다.
//!
//! 다양성 필터: 이미 선택된 청크와 너무 유사한 청크(near-duplicate)를
//! 건너뛰어 주제 다양성을 확보합니다.

use std::cmp::Ordering;

use super::corpus::{Corpus, RegulationChunk};

// ============================================================================
// Types
// ============================================================================

/// 검색 결과 (청크 참조 + 유사도 스코어)
#[derive(Debug, Clone)]
pub struct ScoredChunk<'c> {
    pub chunk: &'c RegulationChunk,
    /// 코사인 유사도 (-1.0 ~ 1.0)
    pub score: f32,
}

/// 검색 에러
///
/// 차원 불일치는 코퍼스가 현재 설정과 다른 임베딩 모델로 만들어졌다는
/// 신호이므로 구분해서 표면화합니다.
#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error(
        "embedding dimensionality mismatch for chunk {chunk_id}: query is {expected}-dim, chunk is {found}-dim (corpus built with a different embedding model?)"
    )]
    DimensionalityMismatch {
        chunk_id: String,
        expected: usize,
        found: usize,
    },
}

/// 검색 품질 통계
#[derive(Debug, Clone, Default)]
pub struct RetrievalStats {
    pub total: usize,
    pub avg_similarity: f32,
    pub max_similarity: f32,
    pub min_similarity: f32,
    /// similarity >= 0.7
    pub excellent: usize,
    /// 0.5 <= similarity < 0.7
    pub good: usize,
    /// 0.3 <= similarity < 0.5
    pub fair: usize,
    /// similarity < 0.3
    pub poor: usize,
}

// ============================================================================
// Retrieval
// ============================================================================

/// 상위 K개 청크 검색
///
/// - 임베딩이 없는 청크는 스코어링에서 제외
/// - `similarity_threshold` 미만 스코어는 제외 (threshold와 같으면 통과)
/// - 스코어 내림차순 정렬, 동점은 코퍼스 순서 유지 (stable sort)
///
/// 빈 코퍼스나 전부 threshold 미만이면 빈 목록을 반환합니다 (에러 아님).
pub fn retrieve<'c>(
    query: &[f32],
    corpus: &'c Corpus,
    top_k: usize,
    similarity_threshold: f32,
) -> Result<Vec<ScoredChunk<'c>>, RetrievalError> {
    let mut results = score_all(query, corpus, similarity_threshold)?;
    results.truncate(top_k);
    Ok(results)
}

/// 다양성 필터를 적용한 상위 K개 청크 검색
///
/// 스코어 순으로 후보를 훑으며, 이미 선택된 모든 청크와의 유사도가
/// `1.0 - diversity_threshold` 이하인 후보만 채택합니다.
/// K개를 채우거나 후보가 소진되면 중단합니다 (최악 O(K * 코퍼스 크기)).
pub fn retrieve_diverse<'c>(
    query: &[f32],
    corpus: &'c Corpus,
    top_k: usize,
    similarity_threshold: f32,
    diversity_threshold: f32,
) -> Result<Vec<ScoredChunk<'c>>, RetrievalError> {
    let candidates = score_all(query, corpus, similarity_threshold)?;
    let max_pairwise = 1.0 - diversity_threshold;

    let mut selected: Vec<ScoredChunk<'c>> = Vec::with_capacity(top_k.min(candidates.len()));

    for candidate in candidates {
        if selected.len() >= top_k {
            break;
        }

        let embedding = match candidate.chunk.embedding.as_deref() {
            Some(e) => e,
            None => continue,
        };

        let is_diverse = selected.iter().all(|picked| {
            // score_all을 통과한 청크는 전부 쿼리와 같은 차원
            let picked_embedding = picked.chunk.embedding.as_deref().unwrap_or(&[]);
            cosine_similarity(embedding, picked_embedding) <= max_pairwise
        });

        if is_diverse {
            selected.push(candidate);
        }
    }

    Ok(selected)
}

/// 전체 코퍼스 스코어링 + threshold 필터 + 내림차순 정렬
fn score_all<'c>(
    query: &[f32],
    corpus: &'c Corpus,
    similarity_threshold: f32,
) -> Result<Vec<ScoredChunk<'c>>, RetrievalError> {
    let mut results: Vec<ScoredChunk<'c>> = Vec::new();

    for chunk in corpus.chunks() {
        let embedding = match chunk.embedding.as_deref() {
            Some(e) => e,
            None => continue,
        };

        if embedding.len() != query.len() {
            return Err(RetrievalError::DimensionalityMismatch {
                chunk_id: chunk.chunk_id.clone(),
                expected: query.len(),
                found: embedding.len(),
            });
        }

        let score = cosine_similarity(query, embedding);
        if score >= similarity_threshold {
            results.push(ScoredChunk { chunk, score });
        }
    }

    // stable sort라 동점은 코퍼스 순서 유지
    results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));

    Ok(results)
}

/// 검색 결과의 품질 통계
///
/// 빈 결과는 0으로 채운 통계를 반환합니다.
pub fn retrieval_stats(results: &[ScoredChunk<'_>]) -> RetrievalStats {
    if results.is_empty() {
        return RetrievalStats::default();
    }

    let scores: Vec<f32> = results.iter().map(|r| r.score).collect();
    let sum: f32 = scores.iter().sum();

    let mut stats = RetrievalStats {
        total: results.len(),
        avg_similarity: sum / scores.len() as f32,
        max_similarity: scores.iter().cloned().fold(f32::MIN, f32::max),
        min_similarity: scores.iter().cloned().fold(f32::MAX, f32::min),
        ..Default::default()
    };

    for &score in &scores {
        if score >= 0.7 {
            stats.excellent += 1;
        } else if score >= 0.5 {
            stats.good += 1;
        } else if score >= 0.3 {
            stats.fair += 1;
        } else {
            stats.poor += 1;
        }
    }

    stats
}

// ============================================================================
// Cosine Similarity
// ============================================================================

/// 코사인 유사도 계산 (-1.0 ~ 1.0)
///
/// 두 벡터의 길이는 같아야 합니다. retriever는 스코어링 전에 차원을
/// 검증하고 불일치 시 DimensionalityMismatch로 실패합니다.
/// 영벡터가 포함되면 0.0을 반환합니다.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());

    if a.is_empty() {
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
