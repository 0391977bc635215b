//! 임베딩 모듈 - 텍스트 벡터화 프로바이더
//!
//! 규정 청크와 사용자 질문을 고정 차원 벡터로 변환합니다.
//! OpenAI와 Voyage AI 두 가지 백엔드를 지원하며,
//! 시맨틱 검색(코사인 유사도)의 입력이 됩니다.
//!
//! ## 사용법
//! ```rust,ignore
//! let embedder = OpenAiEmbedding::from_env()?;
//! let vector = embedder.embed("staffing requirements").await?;
//! ```

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// ============================================================================
// ProviderError
// ============================================================================

/// 외부 프로바이더(임베딩/생성) 호출 에러
///
/// generation 모듈의 failover 루프도 이 타입을 공유합니다.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("{provider}: API key not set ({env_var})")]
    MissingApiKey {
        provider: &'static str,
        env_var: &'static str,
    },

    #[error("{provider}: request failed: {source}")]
    Http {
        provider: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{provider}: API error ({status}): {message}")]
    Api {
        provider: &'static str,
        status: u16,
        message: String,
    },

    #[error("{provider}: malformed response: {message}")]
    MalformedResponse {
        provider: &'static str,
        message: String,
    },

    #[error("unknown provider: {0}")]
    UnknownProvider(String),
}

// ============================================================================
// EmbeddingProvider Trait
// ============================================================================

/// 임베딩 프로바이더 트레이트
///
/// 텍스트를 고정 차원 벡터로 변환하는 인터페이스입니다.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// 단일 텍스트 임베딩
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError>;

    /// 배치 임베딩 (기본 구현: 순차 호출)
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }

    /// 임베딩 차원 수
    fn dimension(&self) -> usize;

    /// 프로바이더 이름
    fn name(&self) -> &str;
}

// ============================================================================
// API Key Management
// ============================================================================

pub const OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";
pub const VOYAGE_API_KEY_ENV: &str = "VOYAGE_API_KEY";

/// 환경변수에서 비어있지 않은 키 읽기
fn env_key(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|k| !k.is_empty())
}

/// 환경변수에 API 키가 설정되어 있는지 확인
pub fn has_api_key(env_var: &str) -> bool {
    env_key(env_var).is_some()
}

// ============================================================================
// OpenAI Embedding
// ============================================================================

/// OpenAI 임베딩 API 엔드포인트
/// source: https://platform.openai.com/docs/api-reference/embeddings
const OPENAI_EMBED_URL: &str = "https://api.openai.com/v1/embeddings";

/// 기본 OpenAI 임베딩 모델 (3072차원)
pub const OPENAI_EMBED_MODEL: &str = "text-embedding-3-large";
const OPENAI_EMBED_DIMENSION: usize = 3072;

/// HTTP 타임아웃
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// OpenAI 임베딩 구현체
#[derive(Debug)]
pub struct OpenAiEmbedding {
    api_key: String,
    model: String,
    client: reqwest::Client,
    base_url: String,
}

impl OpenAiEmbedding {
    pub fn new(api_key: String) -> Result<Self, ProviderError> {
        Self::with_model(api_key, OPENAI_EMBED_MODEL.to_string())
    }

    pub fn with_model(api_key: String, model: String) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|source| ProviderError::Http {
                provider: "openai",
                source,
            })?;

        Ok(Self {
            api_key,
            model,
            client,
            base_url: OPENAI_EMBED_URL.to_string(),
        })
    }

    /// 환경변수(OPENAI_API_KEY)에서 키를 읽어 생성
    pub fn from_env() -> Result<Self, ProviderError> {
        let api_key = env_key(OPENAI_API_KEY_ENV).ok_or(ProviderError::MissingApiKey {
            provider: "openai",
            env_var: OPENAI_API_KEY_ENV,
        })?;
        Self::new(api_key)
    }

    /// 엔드포인트 URL 교체 (테스트용 mock 서버)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

/// 임베딩 API 요청 본문 (OpenAI/Voyage 공통 형식)
#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    input: &'a [String],
    model: &'a str,
}

/// 임베딩 API 응답 (OpenAI/Voyage 공통 형식)
#[derive(Debug, Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedItem>,
}

#[derive(Debug, Deserialize)]
struct EmbedItem {
    embedding: Vec<f32>,
}

/// API 에러 응답에서 메시지 추출 (실패하면 본문 그대로)
fn parse_api_error_message(body: &str) -> String {
    #[derive(Deserialize)]
    struct ErrorEnvelope {
        error: ErrorDetail,
    }
    #[derive(Deserialize)]
    struct ErrorDetail {
        message: String,
    }

    serde_json::from_str::<ErrorEnvelope>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| body.to_string())
}

/// Bearer 인증 임베딩 요청 공통 구현
async fn post_embed_request(
    provider: &'static str,
    client: &reqwest::Client,
    url: &str,
    api_key: &str,
    model: &str,
    texts: &[String],
) -> Result<Vec<Vec<f32>>, ProviderError> {
    let request = EmbedRequest {
        input: texts,
        model,
    };

    let response = client
        .post(url)
        .bearer_auth(api_key)
        .json(&request)
        .send()
        .await
        .map_err(|source| ProviderError::Http { provider, source })?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|source| ProviderError::Http { provider, source })?;

    if !status.is_success() {
        return Err(ProviderError::Api {
            provider,
            status: status.as_u16(),
            message: parse_api_error_message(&body),
        });
    }

    let parsed: EmbedResponse =
        serde_json::from_str(&body).map_err(|e| ProviderError::MalformedResponse {
            provider,
            message: e.to_string(),
        })?;

    if parsed.data.len() != texts.len() {
        return Err(ProviderError::MalformedResponse {
            provider,
            message: format!(
                "embedding count mismatch: requested {}, got {}",
                texts.len(),
                parsed.data.len()
            ),
        });
    }

    Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        // 빈 텍스트는 API 호출 없이 영벡터 반환
        if text.trim().is_empty() {
            return Ok(vec![0.0; self.dimension()]);
        }

        let mut batch = self.embed_batch(&[text.to_string()]).await?;
        batch.pop().ok_or(ProviderError::MalformedResponse {
            provider: "openai",
            message: "empty embedding response".to_string(),
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        post_embed_request(
            "openai",
            &self.client,
            &self.base_url,
            &self.api_key,
            &self.model,
            texts,
        )
        .await
    }

    fn dimension(&self) -> usize {
        OPENAI_EMBED_DIMENSION
    }

    fn name(&self) -> &str {
        &self.model
    }
}

// ============================================================================
// Voyage AI Embedding
// ============================================================================

/// Voyage AI 임베딩 API 엔드포인트
/// source: https://docs.voyageai.com/reference/embeddings-api
const VOYAGE_EMBED_URL: &str = "https://api.voyageai.com/v1/embeddings";

/// 기본 Voyage 임베딩 모델 (1024차원)
pub const VOYAGE_EMBED_MODEL: &str = "voyage-large-2-instruct";
const VOYAGE_EMBED_DIMENSION: usize = 1024;

/// Voyage AI 임베딩 구현체
#[derive(Debug)]
pub struct VoyageEmbedding {
    api_key: String,
    model: String,
    client: reqwest::Client,
    base_url: String,
}

impl VoyageEmbedding {
    pub fn new(api_key: String) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|source| ProviderError::Http {
                provider: "voyage",
                source,
            })?;

        Ok(Self {
            api_key,
            model: VOYAGE_EMBED_MODEL.to_string(),
            client,
            base_url: VOYAGE_EMBED_URL.to_string(),
        })
    }

    /// 환경변수(VOYAGE_API_KEY)에서 키를 읽어 생성
    pub fn from_env() -> Result<Self, ProviderError> {
        let api_key = env_key(VOYAGE_API_KEY_ENV).ok_or(ProviderError::MissingApiKey {
            provider: "voyage",
            env_var: VOYAGE_API_KEY_ENV,
        })?;
        Self::new(api_key)
    }

    /// 엔드포인트 URL 교체 (테스트용 mock 서버)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl EmbeddingProvider for VoyageEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        if text.trim().is_empty() {
            return Ok(vec![0.0; self.dimension()]);
        }

        let mut batch = self.embed_batch(&[text.to_string()]).await?;
        batch.pop().ok_or(ProviderError::MalformedResponse {
            provider: "voyage",
            message: "empty embedding response".to_string(),
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        post_embed_request(
            "voyage",
            &self.client,
            &self.base_url,
            &self.api_key,
            &self.model,
            texts,
        )
        .await
    }

    fn dimension(&self) -> usize {
        VOYAGE_EMBED_DIMENSION
    }

    fn name(&self) -> &str {
        &self.model
    }
}

// ============================================================================
// Factory Function
// ============================================================================

/// 임베딩 프로바이더 생성 ("openai" 또는 "voyage")
///
/// 환경변수에서 해당 프로바이더의 API 키를 읽습니다.
pub fn create_embedder(provider: &str) -> Result<Box<dyn EmbeddingProvider>, ProviderError> {
    match provider.to_lowercase().as_str() {
        "openai" => {
            let embedder = OpenAiEmbedding::from_env()?;
            tracing::info!("Using OpenAI embedding ({})", embedder.name());
            Ok(Box::new(embedder))
        }
        "voyage" => {
            let embedder = VoyageEmbedding::from_env()?;
            tracing::info!("Using Voyage embedding ({})", embedder.name());
            Ok(Box::new(embedder))
        }
        other => Err(ProviderError::UnknownProvider(other.to_string())),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[test]
    fn test_unknown_provider() {
        let result = create_embedder("cohere");
        assert!(matches!(result, Err(ProviderError::UnknownProvider(_))));
    }

    #[test]
    fn test_dimensions() {
        let openai = OpenAiEmbedding::new("fake-key".to_string()).expect("client");
        assert_eq!(openai.dimension(), 3072);

        let voyage = VoyageEmbedding::new("fake-key".to_string()).expect("client");
        assert_eq!(voyage.dimension(), 1024);
    }

    #[tokio::test]
    async fn test_empty_text_returns_zero_vector() {
        let embedder = OpenAiEmbedding::new("fake-key".to_string()).expect("client");
        let vector = embedder.embed("   ").await.expect("embed");
        assert_eq!(vector.len(), 3072);
        assert!(vector.iter().all(|&v| v == 0.0));
    }

    #[tokio::test]
    async fn test_embed_batch_against_mock() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/v1/embeddings");
            then.status(200).json_body(serde_json::json!({
                "data": [
                    {"embedding": [0.1, 0.2]},
                    {"embedding": [0.3, 0.4]}
                ]
            }));
        });

        let embedder = OpenAiEmbedding::new("fake-key".to_string())
            .expect("client")
            .with_base_url(server.url("/v1/embeddings"));

        let texts = vec!["first".to_string(), "second".to_string()];
        let vectors = embedder.embed_batch(&texts).await.expect("embed_batch");

        mock.assert();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[0], vec![0.1, 0.2]);
    }

    #[tokio::test]
    async fn test_api_error_surfaces_status_and_message() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/v1/embeddings");
            then.status(401).json_body(serde_json::json!({
                "error": {"message": "Incorrect API key provided"}
            }));
        });

        let embedder = OpenAiEmbedding::new("bad-key".to_string())
            .expect("client")
            .with_base_url(server.url("/v1/embeddings"));

        let result = embedder.embed("text").await;
        match result {
            Err(ProviderError::Api {
                provider,
                status,
                message,
            }) => {
                assert_eq!(provider, "openai");
                assert_eq!(status, 401);
                assert!(message.contains("Incorrect API key"));
            }
            other => panic!("expected Api error, got {:?}", other.is_ok()),
        }
    }

    #[tokio::test]
    async fn test_batch_count_mismatch_is_malformed() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/v1/embeddings");
            then.status(200).json_body(serde_json::json!({
                "data": [{"embedding": [0.1]}]
            }));
        });

        let embedder = OpenAiEmbedding::new("fake-key".to_string())
            .expect("client")
            .with_base_url(server.url("/v1/embeddings"));

        let texts = vec!["a".to_string(), "b".to_string()];
        let result = embedder.embed_batch(&texts).await;
        assert!(matches!(result, Err(ProviderError::MalformedResponse { .. })));
    }
}
