//! RAG Engine - 검색 증강 질의응답 오케스트레이션
//!
//! 질문 하나를 처리하는 전체 흐름을 담당합니다:
//! 질문 임베딩 -> 유사도 검색 -> 프롬프트 조립 -> 생성(failover) -> 인용 검증.
//!
//! 인용 검증은 진단용이며 답변을 막거나 고쳐 쓰지 않습니다.
//! 누락된 인용 번호는 usage 메타데이터로만 보고됩니다.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::embedding::{EmbeddingProvider, ProviderError};
use crate::generation::{GenerationError, GenerationService};

use super::corpus::Corpus;
use super::retriever::{self, RetrievalError, ScoredChunk};

// ============================================================================
// Configuration
// ============================================================================

/// 엔진 설정
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// 검색할 청크 수
    pub top_k: usize,
    /// 최소 유사도 (이상이면 통과)
    pub similarity_threshold: f32,
    /// 다양성 필터 threshold (None이면 비활성)
    pub diversity_threshold: Option<f32>,
    /// 생성 temperature
    pub temperature: f32,
    /// 생성 최대 토큰 수
    pub max_tokens: u32,
    /// 프롬프트에 넣을 청크당 최대 문자 수
    pub max_content_chars: usize,
    /// 프롬프트에 포함할 최근 대화 턴 수
    pub history_turns: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            top_k: 12,
            similarity_threshold: 0.0,
            diversity_threshold: None,
            temperature: 0.5,
            max_tokens: 3000,
            max_content_chars: 2000,
            history_turns: 5,
        }
    }
}

impl EngineConfig {
    /// 다양성 필터를 켠 설정 (near-duplicate 섹션 억제)
    pub fn diverse() -> Self {
        Self {
            diversity_threshold: Some(0.05),
            ..Default::default()
        }
    }
}

// ============================================================================
// Types
// ============================================================================

/// 대화 메시지 (role: "user" 또는 "assistant")
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

/// 답변에 첨부되는 인용 정보 (검색 순서대로)
#[derive(Debug, Clone, Serialize)]
pub struct CitationRef {
    pub citation: String,
    pub section_title: String,
    pub chunk_id: String,
}

/// 검색된 청크 요약 (유사도 포함, 진단용)
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedChunkInfo {
    pub citation: String,
    pub section_title: String,
    pub chunk_id: String,
    pub similarity: f32,
    /// 미리보기용으로 잘린 본문
    pub content: String,
}

/// 사용량/품질 메타데이터
#[derive(Debug, Clone, Serialize)]
pub struct AnswerUsage {
    /// 실제 응답한 생성 프로바이더
    pub provider: String,
    pub chunks_retrieved: usize,
    /// 답변에 실제 사용된 인용 번호 수 (1..=N 범위 내, 중복 제외)
    pub citations_used: usize,
    pub citations_expected: usize,
    /// 답변에 나타나지 않은 인용 번호 (오름차순)
    pub missing_citations: Vec<usize>,
    pub avg_similarity: f32,
}

/// 질의응답 결과
#[derive(Debug, Clone, Serialize)]
pub struct AnswerResult {
    pub answer: String,
    pub citations: Vec<CitationRef>,
    pub retrieved: Vec<RetrievedChunkInfo>,
    pub usage: AnswerUsage,
}

/// 엔진 에러
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("embedding failed: {0}")]
    Embedding(#[from] ProviderError),

    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    #[error(transparent)]
    Generation(#[from] GenerationError),
}

// ============================================================================
// RagEngine
// ============================================================================

/// RAG 엔진
///
/// 코퍼스는 로드 후 읽기 전용이므로 `&self` 메서드만으로 동시 질의를
/// 처리할 수 있습니다. 취소/타임아웃은 호출 측에서
/// `tokio::time::timeout`으로 감싸면 진행 중인 프로바이더 호출까지
/// 함께 중단됩니다.
pub struct RagEngine {
    corpus: Corpus,
    embedder: Box<dyn EmbeddingProvider>,
    generation: GenerationService,
    config: EngineConfig,
}

impl RagEngine {
    pub fn new(
        corpus: Corpus,
        embedder: Box<dyn EmbeddingProvider>,
        generation: GenerationService,
        config: EngineConfig,
    ) -> Self {
        tracing::info!(
            "RAG engine ready: {} chunks ({} embedded), {} generation providers",
            corpus.len(),
            corpus.embedded_count(),
            generation.provider_count()
        );

        Self {
            corpus,
            embedder,
            generation,
            config,
        }
    }

    pub fn corpus(&self) -> &Corpus {
        &self.corpus
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn generation(&self) -> &GenerationService {
        &self.generation
    }

    /// 질문과 관련된 청크 검색 (진단용 단독 노출)
    ///
    /// 설정에 diversity_threshold가 있으면 다양성 필터를 적용합니다.
    pub async fn retrieve_chunks(
        &self,
        question: &str,
        top_k: usize,
        similarity_threshold: f32,
    ) -> Result<Vec<ScoredChunk<'_>>, EngineError> {
        let query = self.embedder.embed(question).await?;

        let results = match self.config.diversity_threshold {
            Some(d) => retriever::retrieve_diverse(
                &query,
                &self.corpus,
                top_k,
                similarity_threshold,
                d,
            )?,
            None => retriever::retrieve(&query, &self.corpus, top_k, similarity_threshold)?,
        };

        Ok(results)
    }

    /// 질문에 답변
    ///
    /// 실패 시 부분 답변 없이 단일 에러를 반환합니다.
    /// 성공 시 인용 커버리지가 불완전해도 답변과 전체 메타데이터를 반환합니다.
    pub async fn answer_question(
        &self,
        question: &str,
        history: &[Message],
    ) -> Result<AnswerResult, EngineError> {
        // 1. 검색
        let results = self
            .retrieve_chunks(question, self.config.top_k, self.config.similarity_threshold)
            .await?;

        tracing::debug!("Retrieved {} chunks for question", results.len());

        // 2. 프롬프트 조립
        let prompt = self.build_prompt(question, &results, history);

        // 3. 생성 (failover 포함)
        let generation = self
            .generation
            .generate(&prompt, self.config.max_tokens, self.config.temperature, None)
            .await?;

        // 4. 인용 커버리지 검증 (진단만, 답변은 그대로)
        let expected = results.len();
        let (used, missing) = citation_coverage(&generation.text, expected);

        if !missing.is_empty() {
            tracing::debug!("Answer is missing citations: {:?}", missing);
        }

        let avg_similarity = if results.is_empty() {
            0.0
        } else {
            results.iter().map(|r| r.score).sum::<f32>() / results.len() as f32
        };

        Ok(AnswerResult {
            answer: generation.text,
            citations: results
                .iter()
                .map(|r| CitationRef {
                    citation: r.chunk.citation.clone(),
                    section_title: r.chunk.section_title.clone(),
                    chunk_id: r.chunk.chunk_id.clone(),
                })
                .collect(),
            retrieved: results
                .iter()
                .map(|r| RetrievedChunkInfo {
                    citation: r.chunk.citation.clone(),
                    section_title: r.chunk.section_title.clone(),
                    chunk_id: r.chunk.chunk_id.clone(),
                    similarity: r.score,
                    content: truncate_chars(&r.chunk.content, 500),
                })
                .collect(),
            usage: AnswerUsage {
                provider: generation.provider.to_string(),
                chunks_retrieved: expected,
                citations_used: used.len(),
                citations_expected: expected,
                missing_citations: missing,
                avg_similarity,
            },
        })
    }

    /// 프롬프트 조립
    ///
    /// 역할 지시문 + 번호 매긴 규정 컨텍스트 + (있으면) 최근 대화 +
    /// 질문 + 인용 번호 리마인더 순서로 구성합니다.
    fn build_prompt(
        &self,
        question: &str,
        chunks: &[ScoredChunk<'_>],
        history: &[Message],
    ) -> String {
        let mut prompt = String::from(
            "You are a regulatory compliance expert for Idaho assisted living facilities. Your role:\n\
             - Answer questions about IDAPA regulations accurately and comprehensively\n\
             - Provide clear, practical explanations in plain English\n\
             - Always cite the provided regulations with inline citations like [1], [2], etc.\n\
             - Reference EVERY numbered regulation below at least once, even if only tangentially relevant\n\
             - Never make up regulatory content that is not in the provided context\n\
             - If the answer is not in the provided context, say so clearly\n\
             \n\
             Response format:\n\
             1. Direct answer with inline citations [1], [2], etc. throughout the text\n\
             2. Specific requirements with explanations\n\
             3. Practical implications for facility operations\n\
             4. Related regulations if relevant\n\
             \n\
             Context from regulations:\n",
        );

        for (i, result) in chunks.iter().enumerate() {
            let content = truncate_chars(&result.chunk.content, self.config.max_content_chars);
            prompt.push_str(&format!(
                "\n[{}] {} - {}\n{}\n",
                i + 1,
                result.chunk.citation,
                result.chunk.section_title,
                content
            ));
        }

        if !history.is_empty() {
            prompt.push_str("\nPrevious conversation:\n");
            let start = history.len().saturating_sub(self.config.history_turns);
            for msg in &history[start..] {
                prompt.push_str(&format!("{}: {}\n", msg.role, msg.content));
            }
        }

        prompt.push_str(&format!(
            "\nQuestion: {}\n\nThere are {} numbered regulations above. Use every citation [1] through [{}] inline at least once.\n\nAnswer:",
            question,
            chunks.len(),
            chunks.len()
        ));

        prompt
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 답변에서 인용 번호 스캔
///
/// (사용된 번호 집합, 누락된 번호 오름차순 목록)을 반환합니다.
/// 기대 범위(1..=expected) 밖의 번호는 무시합니다.
fn citation_coverage(answer: &str, expected: usize) -> (BTreeSet<usize>, Vec<usize>) {
    let ordinal_re = Regex::new(r"\[(\d+)\]").unwrap();

    let used: BTreeSet<usize> = ordinal_re
        .captures_iter(answer)
        .filter_map(|caps| caps[1].parse::<usize>().ok())
        .filter(|&n| n >= 1 && n <= expected)
        .collect();

    let missing: Vec<usize> = (1..=expected).filter(|n| !used.contains(n)).collect();

    (used, missing)
}

/// 문자 단위로 자르기 (UTF-8 안전, 잘렸으면 "..." 추가)
fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let truncated: String = text.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

// ============================================================================
// Tests
// ============================================================================
