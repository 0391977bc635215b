//! 생성 모듈 - LLM 프로바이더 및 failover
//!
//! 프롬프트를 받아 답변 텍스트를 생성합니다. 우선순위 순서의 프로바이더
//! 목록(OpenAI 우선, Anthropic 차순위)을 유지하며, 실패한 프로바이더는
//! failed 표시 후 다음 프로바이더로 자동 전환합니다.
//!
//! failed 표시는 프로세스 수명 동안 유지되며(시간 기반 자동 복구 없음),
//! fallback 순회에서 해당 프로바이더가 다시 성공할 때만 해제됩니다.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::embedding::ProviderError;

// ============================================================================
// GenerationProvider Trait
// ============================================================================

/// 생성 프로바이더 트레이트
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// 프롬프트로 텍스트 생성
    ///
    /// `model`이 None이면 프로바이더의 기본 모델을 사용합니다.
    async fn generate(
        &self,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
        model: Option<&str>,
    ) -> Result<String, ProviderError>;

    /// 프로바이더 이름
    fn name(&self) -> &'static str;
}

/// 생성 결과 (답변 텍스트 + 실제 응답한 프로바이더)
#[derive(Debug, Clone)]
pub struct Generation {
    pub text: String,
    pub provider: &'static str,
}

/// 생성 서비스 에러
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("no generation providers configured")]
    NoProvidersConfigured,

    #[error("all generation providers failed: {last}")]
    AllProvidersFailed {
        #[source]
        last: ProviderError,
    },
}

// ============================================================================
// OpenAI Generation
// ============================================================================

/// OpenAI Chat Completions 엔드포인트
/// source: https://platform.openai.com/docs/api-reference/chat
const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";

/// 기본 OpenAI 생성 모델
pub const OPENAI_CHAT_MODEL: &str = "gpt-4o";

/// HTTP 타임아웃 (생성은 임베딩보다 오래 걸림)
const GENERATION_TIMEOUT: Duration = Duration::from_secs(120);

/// OpenAI 생성 구현체
#[derive(Debug)]
pub struct OpenAiGeneration {
    api_key: String,
    model: String,
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

impl OpenAiGeneration {
    pub fn new(api_key: String) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(GENERATION_TIMEOUT)
            .build()
            .map_err(|source| ProviderError::Http {
                provider: "openai",
                source,
            })?;

        Ok(Self {
            api_key,
            model: OPENAI_CHAT_MODEL.to_string(),
            client,
            base_url: OPENAI_CHAT_URL.to_string(),
        })
    }

    /// 환경변수(OPENAI_API_KEY)에서 키를 읽어 생성
    pub fn from_env() -> Result<Self, ProviderError> {
        let api_key = std::env::var(crate::embedding::OPENAI_API_KEY_ENV)
            .ok()
            .filter(|k| !k.is_empty())
            .ok_or(ProviderError::MissingApiKey {
                provider: "openai",
                env_var: crate::embedding::OPENAI_API_KEY_ENV,
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
impl GenerationProvider for OpenAiGeneration {
    async fn generate(
        &self,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
        model: Option<&str>,
    ) -> Result<String, ProviderError> {
        let request = ChatRequest {
            model: model.unwrap_or(&self.model),
            max_tokens,
            temperature,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
        };

        let response = self
            .client
            .post(&self.base_url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|source| ProviderError::Http {
                provider: "openai",
                source,
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|source| ProviderError::Http {
                provider: "openai",
                source,
            })?;

        if !status.is_success() {
            return Err(ProviderError::Api {
                provider: "openai",
                status: status.as_u16(),
                message: parse_error_message(&body),
            });
        }

        let parsed: ChatResponse =
            serde_json::from_str(&body).map_err(|e| ProviderError::MalformedResponse {
                provider: "openai",
                message: e.to_string(),
            })?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or(ProviderError::MalformedResponse {
                provider: "openai",
                message: "empty choices in chat response".to_string(),
            })
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

// ============================================================================
// Anthropic Generation
// ============================================================================

/// Anthropic Messages 엔드포인트
/// source: https://docs.anthropic.com/en/api/messages
const ANTHROPIC_MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// 기본 Anthropic 생성 모델
pub const ANTHROPIC_MODEL: &str = "claude-sonnet-4-20250514";

pub const ANTHROPIC_API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

/// Anthropic 생성 구현체
#[derive(Debug)]
pub struct AnthropicGeneration {
    api_key: String,
    model: String,
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    text: String,
}

impl AnthropicGeneration {
    pub fn new(api_key: String) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(GENERATION_TIMEOUT)
            .build()
            .map_err(|source| ProviderError::Http {
                provider: "anthropic",
                source,
            })?;

        Ok(Self {
            api_key,
            model: ANTHROPIC_MODEL.to_string(),
            client,
            base_url: ANTHROPIC_MESSAGES_URL.to_string(),
        })
    }

    /// 환경변수(ANTHROPIC_API_KEY)에서 키를 읽어 생성
    pub fn from_env() -> Result<Self, ProviderError> {
        let api_key = std::env::var(ANTHROPIC_API_KEY_ENV)
            .ok()
            .filter(|k| !k.is_empty())
            .ok_or(ProviderError::MissingApiKey {
                provider: "anthropic",
                env_var: ANTHROPIC_API_KEY_ENV,
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
impl GenerationProvider for AnthropicGeneration {
    async fn generate(
        &self,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
        model: Option<&str>,
    ) -> Result<String, ProviderError> {
        let request = ChatRequest {
            model: model.unwrap_or(&self.model),
            max_tokens,
            temperature,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
        };

        let response = self
            .client
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request)
            .send()
            .await
            .map_err(|source| ProviderError::Http {
                provider: "anthropic",
                source,
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|source| ProviderError::Http {
                provider: "anthropic",
                source,
            })?;

        if !status.is_success() {
            return Err(ProviderError::Api {
                provider: "anthropic",
                status: status.as_u16(),
                message: parse_error_message(&body),
            });
        }

        let parsed: MessagesResponse =
            serde_json::from_str(&body).map_err(|e| ProviderError::MalformedResponse {
                provider: "anthropic",
                message: e.to_string(),
            })?;

        parsed
            .content
            .into_iter()
            .next()
            .map(|c| c.text)
            .ok_or(ProviderError::MalformedResponse {
                provider: "anthropic",
                message: "empty content in messages response".to_string(),
            })
    }

    fn name(&self) -> &'static str {
        "anthropic"
    }
}

/// API 에러 응답에서 메시지 추출 (실패하면 본문 그대로)
fn parse_error_message(body: &str) -> String {
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

// ============================================================================
// FailoverState & GenerationService
// ============================================================================

/// failover 상태
///
/// current: 다음 요청에서 먼저 시도할 프로바이더 인덱스.
/// failed: failed 표시된 프로바이더 인덱스 (성공 시까지 유지).
#[derive(Debug, Default)]
struct FailoverState {
    current: usize,
    failed: HashSet<usize>,
}

/// failover 상태 스냅샷 (진단용)
#[derive(Debug, Clone)]
pub struct FailoverSnapshot {
    pub current: Option<&'static str>,
    pub failed: Vec<&'static str>,
    pub available: Vec<&'static str>,
}

/// 생성 서비스 - 우선순위 failover
///
/// 요청 처리 순서:
/// 1. current 프로바이더 (failed 표시가 없을 때만)
/// 2. 전체 프로바이더를 우선순위 순서로 순회.
///    failed 표시된 프로바이더도 이 순회에서 재시도 대상이며,
///    성공하면 표시가 해제됩니다. 최우선 프로바이더가 성공하면
///    current로 복귀합니다.
/// 3. 전부 실패하면 마지막 에러를 담아 AllProvidersFailed.
pub struct GenerationService {
    /// 우선순위 순서 (index 0이 최우선)
    providers: Vec<Arc<dyn GenerationProvider>>,
    state: Mutex<FailoverState>,
}

impl GenerationService {
    pub fn new(providers: Vec<Arc<dyn GenerationProvider>>) -> Self {
        Self {
            providers,
            state: Mutex::new(FailoverState::default()),
        }
    }

    /// 환경변수에 키가 설정된 프로바이더들로 구성 (OpenAI 우선)
    pub fn from_env() -> Self {
        let mut providers: Vec<Arc<dyn GenerationProvider>> = Vec::new();

        match OpenAiGeneration::from_env() {
            Ok(p) => providers.push(Arc::new(p)),
            Err(e) => tracing::debug!("OpenAI generation unavailable: {}", e),
        }
        match AnthropicGeneration::from_env() {
            Ok(p) => providers.push(Arc::new(p)),
            Err(e) => tracing::debug!("Anthropic generation unavailable: {}", e),
        }

        if providers.is_empty() {
            tracing::warn!("No generation providers configured (set OPENAI_API_KEY or ANTHROPIC_API_KEY)");
        }

        Self::new(providers)
    }

    /// 구성된 프로바이더 수
    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    /// failover를 적용한 텍스트 생성
    pub async fn generate(
        &self,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
        model: Option<&str>,
    ) -> Result<Generation, GenerationError> {
        if self.providers.is_empty() {
            return Err(GenerationError::NoProvidersConfigured);
        }

        let mut state = self.state.lock().await;
        let current = state.current;
        let mut last_error: Option<ProviderError> = None;

        // 1. current 프로바이더 먼저
        if !state.failed.contains(&current) {
            let provider = &self.providers[current];
            match provider.generate(prompt, max_tokens, temperature, model).await {
                Ok(text) => {
                    return Ok(Generation {
                        text,
                        provider: provider.name(),
                    });
                }
                Err(e) => {
                    tracing::warn!("Generation provider {} failed: {}", provider.name(), e);
                    state.failed.insert(current);
                    last_error = Some(e);
                }
            }
        }

        // 2. fallback 순회 (failed 표시된 프로바이더도 재시도)
        let tried_current = last_error.is_some();
        for (idx, provider) in self.providers.iter().enumerate() {
            if tried_current && idx == current {
                continue;
            }

            match provider.generate(prompt, max_tokens, temperature, model).await {
                Ok(text) => {
                    state.failed.remove(&idx);
                    // 최우선 프로바이더가 살아나면 current로 복귀
                    if idx == 0 {
                        state.current = 0;
                    }
                    tracing::info!("Generation provider {} recovered via failover", provider.name());
                    return Ok(Generation {
                        text,
                        provider: provider.name(),
                    });
                }
                Err(e) => {
                    tracing::warn!("Generation provider {} failed: {}", provider.name(), e);
                    state.failed.insert(idx);
                    last_error = Some(e);
                }
            }
        }

        // 3. 전부 실패
        match last_error {
            Some(last) => Err(GenerationError::AllProvidersFailed { last }),
            // 도달 불가: 프로바이더가 있으면 최소 한 번은 시도함
            None => Err(GenerationError::NoProvidersConfigured),
        }
    }

    /// 현재 failover 상태 (진단용)
    pub async fn snapshot(&self) -> FailoverSnapshot {
        let state = self.state.lock().await;

        FailoverSnapshot {
            current: self.providers.get(state.current).map(|p| p.name()),
            failed: self
                .providers
                .iter()
                .enumerate()
                .filter(|(i, _)| state.failed.contains(i))
                .map(|(_, p)| p.name())
                .collect(),
            available: self
                .providers
                .iter()
                .enumerate()
                .filter(|(i, _)| !state.failed.contains(i))
                .map(|(_, p)| p.name())
                .collect(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
