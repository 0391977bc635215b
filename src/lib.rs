//! regnav-rag - 아이다호 생활보조시설(ALF) 규정 RAG 파이프라인
//!
//! IDAPA 규정 텍스트를 섹션 청크로 분할하고, 임베딩 벡터로 변환한 뒤,
//! 질문과 유사한 섹션을 검색해 인용이 포함된 답변을 생성합니다.
//! 생성 프로바이더(OpenAI/Anthropic)는 우선순위 failover로 전환됩니다.

pub mod cli;
pub mod embedding;
pub mod generation;
pub mod knowledge;

// Re-exports
pub use embedding::{
    create_embedder, has_api_key, EmbeddingProvider, OpenAiEmbedding, ProviderError,
    VoyageEmbedding,
};
pub use generation::{
    AnthropicGeneration, FailoverSnapshot, Generation, GenerationError, GenerationProvider,
    GenerationService, OpenAiGeneration,
};
pub use knowledge::{
    cosine_similarity, get_data_dir, retrieval_stats, retrieve, retrieve_diverse, AnswerResult,
    AnswerUsage, Category, CitationRef, Corpus, CorpusError, CorpusStats, EngineConfig,
    EngineError, Message, RagEngine, RegulationChunk, RetrievalError, RetrievalStats,
    RetrievedChunkInfo, ScoredChunk, SectionChunker,
};
