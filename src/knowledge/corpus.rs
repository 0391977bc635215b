//! Corpus - 규정 청크 코퍼스 및 JSON 스냅샷
//!
//! 청킹/임베딩 파이프라인의 결과물을 JSON 스냅샷으로 저장하고,
//! 쿼리 서빙 시 전체를 메모리에 읽기 전용으로 로드합니다.
//! 스냅샷은 schema_version 태그가 붙은 envelope 형식이며,
//! 구버전의 bare JSON 배열도 로드할 수 있습니다.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Data Directory
// ============================================================================

/// 데이터 디렉토리 경로 (~/.regnav-rag/)
pub fn get_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".regnav-rag")
}

// ============================================================================
// Category
// ============================================================================

/// 규정 카테고리
///
/// 섹션 번호 범위 또는 제목 키워드로 결정됩니다 (chunker 참고).
/// 스냅샷에는 snake_case 문자열로 직렬화됩니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Administrative,
    Variances,
    Licensing,
    Policies,
    AdmissionDischarge,
    PhysicalPlant,
    NursingAssessment,
    ServiceAgreements,
    Records,
    Staffing,
    ResidentCare,
    Medications,
    Dietary,
    InfectionControl,
    Enforcement,
    General,
}

impl Category {
    /// snake_case 문자열 표현 (스냅샷 직렬화와 동일)
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Administrative => "administrative",
            Category::Variances => "variances",
            Category::Licensing => "licensing",
            Category::Policies => "policies",
            Category::AdmissionDischarge => "admission_discharge",
            Category::PhysicalPlant => "physical_plant",
            Category::NursingAssessment => "nursing_assessment",
            Category::ServiceAgreements => "service_agreements",
            Category::Records => "records",
            Category::Staffing => "staffing",
            Category::ResidentCare => "resident_care",
            Category::Medications => "medications",
            Category::Dietary => "dietary",
            Category::InfectionControl => "infection_control",
            Category::Enforcement => "enforcement",
            Category::General => "general",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// RegulationChunk
// ============================================================================

/// 규정 청크 - 검색/인용 단위
///
/// 하나의 규정 섹션(예: "600. MEDICATION SERVICES.")이 하나의 청크가 됩니다.
/// `embedding`은 오프라인 임베딩 패스 이후에만 존재하며,
/// 없는 청크는 유사도 검색에서 제외됩니다.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegulationChunk {
    /// 고유 ID (문서 접두사 + 섹션 번호, 예: "idapa_16.03.22_600")
    pub chunk_id: String,
    /// 섹션 본문 (트림됨, 100자 이상)
    pub content: String,
    /// 인용 문자열 (예: "IDAPA 16.03.22.600")
    pub citation: String,
    /// 섹션 제목 (원문 그대로 대문자)
    pub section_title: String,
    /// 카테고리
    pub category: Category,
    /// 주 (항상 "Idaho")
    #[serde(default = "default_state")]
    pub state: String,
    /// 시행 연도
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_date: Option<String>,
    /// 원본 파일명
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    /// 임베딩 벡터 (임베딩 패스 이후에만 존재)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

fn default_state() -> String {
    "Idaho".to_string()
}

impl RegulationChunk {
    /// 임베딩 존재 여부
    pub fn has_embedding(&self) -> bool {
        self.embedding.is_some()
    }

    /// 임베딩 차원 (없으면 None)
    pub fn embedding_dimension(&self) -> Option<usize> {
        self.embedding.as_ref().map(|e| e.len())
    }
}

// ============================================================================
// CorpusError
// ============================================================================

/// 코퍼스 로드/저장/병합 에러
///
/// 스냅샷 로드 실패는 서빙 프로세스 시작을 중단시키는 치명적 에러입니다.
#[derive(Debug, thiserror::Error)]
pub enum CorpusError {
    #[error("failed to read corpus snapshot {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed corpus snapshot {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("duplicate chunk_id in corpus: {chunk_id}")]
    DuplicateChunkId { chunk_id: String },
}

// ============================================================================
// Snapshot Format
// ============================================================================

/// 스냅샷 스키마 버전
///
/// 임베딩 모델 교체 등 호환성이 깨지는 변경 시 올립니다.
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

/// 버전 태그가 붙은 스냅샷 envelope
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotEnvelope {
    schema_version: u32,
    /// 청크 임베딩에 사용된 모델명 (차원 불일치 진단용)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    embedding_model: Option<String>,
    generated_at: DateTime<Utc>,
    chunks: Vec<RegulationChunk>,
}

/// 로드 가능한 스냅샷 형식
///
/// 구버전 스냅샷은 envelope 없이 청크 배열만 저장했습니다.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SnapshotFormat {
    Envelope(SnapshotEnvelope),
    Bare(Vec<RegulationChunk>),
}

// ============================================================================
// Corpus
// ============================================================================

/// 규정 청크 코퍼스
///
/// 로드 후 읽기 전용으로 사용합니다. 갱신은 병합 후 스냅샷 전체를
/// 다시 쓰는 방식이며, 청크를 개별 수정하지 않습니다.
#[derive(Debug, Clone, Default)]
pub struct Corpus {
    chunks: Vec<RegulationChunk>,
    embedding_model: Option<String>,
}

impl Corpus {
    /// 청크 목록으로 생성
    pub fn new(chunks: Vec<RegulationChunk>) -> Self {
        Self {
            chunks,
            embedding_model: None,
        }
    }

    /// 스냅샷 파일 로드
    ///
    /// envelope 형식과 bare 배열 형식을 모두 지원합니다.
    pub fn load(path: &Path) -> Result<Self, CorpusError> {
        let raw = std::fs::read_to_string(path).map_err(|source| CorpusError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let parsed: SnapshotFormat =
            serde_json::from_str(&raw).map_err(|source| CorpusError::Malformed {
                path: path.to_path_buf(),
                source,
            })?;

        let corpus = match parsed {
            SnapshotFormat::Envelope(env) => {
                if env.schema_version != SNAPSHOT_SCHEMA_VERSION {
                    tracing::warn!(
                        "Snapshot schema version {} (current: {})",
                        env.schema_version,
                        SNAPSHOT_SCHEMA_VERSION
                    );
                }
                Self {
                    chunks: env.chunks,
                    embedding_model: env.embedding_model,
                }
            }
            SnapshotFormat::Bare(chunks) => {
                tracing::debug!("Loaded legacy snapshot without schema version");
                Self {
                    chunks,
                    embedding_model: None,
                }
            }
        };

        tracing::info!(
            "Loaded corpus: {} chunks ({} embedded) from {}",
            corpus.len(),
            corpus.embedded_count(),
            path.display()
        );

        Ok(corpus)
    }

    /// 스냅샷 파일 저장 (envelope 형식)
    pub fn save(&self, path: &Path) -> Result<(), CorpusError> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| CorpusError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
            }
        }

        let envelope = SnapshotEnvelope {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            embedding_model: self.embedding_model.clone(),
            generated_at: Utc::now(),
            chunks: self.chunks.clone(),
        };

        let json = serde_json::to_string_pretty(&envelope).map_err(|source| {
            CorpusError::Malformed {
                path: path.to_path_buf(),
                source,
            }
        })?;

        std::fs::write(path, json).map_err(|source| CorpusError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        tracing::info!("Saved corpus: {} chunks to {}", self.len(), path.display());
        Ok(())
    }

    /// 다른 코퍼스와 병합
    ///
    /// chunk_id 유일성을 검증하며, 충돌 시 DuplicateChunkId 에러를 반환합니다.
    /// 기존 청크가 앞, 새 청크가 뒤에 이어집니다.
    pub fn merge(mut self, other: Corpus) -> Result<Self, CorpusError> {
        let mut seen: HashSet<&str> = HashSet::with_capacity(self.chunks.len());
        for chunk in self.chunks.iter().chain(other.chunks.iter()) {
            if !seen.insert(chunk.chunk_id.as_str()) {
                return Err(CorpusError::DuplicateChunkId {
                    chunk_id: chunk.chunk_id.clone(),
                });
            }
        }
        drop(seen);

        // 임베딩 모델명이 서로 다르면 병합 결과를 신뢰할 수 없음
        if let (Some(a), Some(b)) = (&self.embedding_model, &other.embedding_model) {
            if a != b {
                tracing::warn!("Merging corpora with different embedding models: {} vs {}", a, b);
            }
        }
        if self.embedding_model.is_none() {
            self.embedding_model = other.embedding_model.clone();
        }

        self.chunks.extend(other.chunks);
        Ok(self)
    }

    /// 청크 슬라이스
    pub fn chunks(&self) -> &[RegulationChunk] {
        &self.chunks
    }

    /// 청크 목록 소유권 반환
    pub fn into_chunks(self) -> Vec<RegulationChunk> {
        self.chunks
    }

    /// 청크 개수
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// 코퍼스가 비었는지
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// 임베딩이 있는 청크 개수
    pub fn embedded_count(&self) -> usize {
        self.chunks.iter().filter(|c| c.has_embedding()).count()
    }

    /// 임베딩 모델명 기록
    pub fn set_embedding_model(&mut self, model: impl Into<String>) {
        self.embedding_model = Some(model.into());
    }

    /// 임베딩 모델명
    pub fn embedding_model(&self) -> Option<&str> {
        self.embedding_model.as_deref()
    }

    /// 코퍼스 통계
    pub fn stats(&self) -> CorpusStats {
        let mut category_counts: Vec<(Category, usize)> = Vec::new();

        for chunk in &self.chunks {
            match category_counts.iter_mut().find(|(c, _)| *c == chunk.category) {
                Some((_, n)) => *n += 1,
                None => category_counts.push((chunk.category, 1)),
            }
        }

        category_counts.sort_by_key(|(c, _)| c.as_str());

        CorpusStats {
            chunk_count: self.len(),
            embedded_count: self.embedded_count(),
            category_counts,
        }
    }
}

/// 코퍼스 통계
#[derive(Debug, Clone)]
pub struct CorpusStats {
    pub chunk_count: usize,
    pub embedded_count: usize,
    /// 카테고리별 청크 수 (카테고리명 순 정렬)
    pub category_counts: Vec<(Category, usize)>,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_chunk(id: &str) -> RegulationChunk {
        RegulationChunk {
            chunk_id: id.to_string(),
            content: "x".repeat(120),
            citation: "IDAPA 16.03.22.600".to_string(),
            section_title: "MEDICATION SERVICES".to_string(),
            category: Category::Medications,
            state: "Idaho".to_string(),
            effective_date: Some("2025".to_string()),
            source_file: Some("IDAPA 16.txt".to_string()),
            embedding: None,
        }
    }

    #[test]
    fn test_category_serialization() {
        let json = serde_json::to_string(&Category::AdmissionDischarge);
        assert_eq!(json.ok().as_deref(), Some("\"admission_discharge\""));

        let parsed: Category = serde_json::from_str("\"physical_plant\"").expect("parse");
        assert_eq!(parsed, Category::PhysicalPlant);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("corpus.json");

        let mut corpus = Corpus::new(vec![sample_chunk("a_100"), sample_chunk("a_200")]);
        corpus.set_embedding_model("text-embedding-3-large");
        corpus.save(&path).expect("save");

        let loaded = Corpus::load(&path).expect("load");
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.embedding_model(), Some("text-embedding-3-large"));
        assert_eq!(loaded.chunks()[0].chunk_id, "a_100");
    }

    #[test]
    fn test_load_bare_array() {
        // 구버전 스냅샷 (envelope 없는 청크 배열)
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("legacy.json");

        let chunks = vec![sample_chunk("a_100")];
        let json = serde_json::to_string(&chunks).expect("serialize");
        std::fs::write(&path, json).expect("write");

        let loaded = Corpus::load(&path).expect("load");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.embedding_model(), None);
    }

    #[test]
    fn test_load_missing_file() {
        let result = Corpus::load(Path::new("/nonexistent/corpus.json"));
        assert!(matches!(result, Err(CorpusError::Io { .. })));
    }

    #[test]
    fn test_load_malformed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{not json").expect("write");

        let result = Corpus::load(&path);
        assert!(matches!(result, Err(CorpusError::Malformed { .. })));
    }

    #[test]
    fn test_merge_preserves_order() {
        let a = Corpus::new(vec![sample_chunk("a_100"), sample_chunk("a_200")]);
        let b = Corpus::new(vec![sample_chunk("b_100")]);

        let merged = a.merge(b).expect("merge");
        let ids: Vec<&str> = merged.chunks().iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["a_100", "a_200", "b_100"]);
    }

    #[test]
    fn test_merge_rejects_duplicate_ids() {
        let a = Corpus::new(vec![sample_chunk("a_100")]);
        let b = Corpus::new(vec![sample_chunk("a_100")]);

        let result = a.merge(b);
        match result {
            Err(CorpusError::DuplicateChunkId { chunk_id }) => assert_eq!(chunk_id, "a_100"),
            other => panic!("expected DuplicateChunkId, got {:?}", other.map(|c| c.len())),
        }
    }

    #[test]
    fn test_embedded_count() {
        let mut with_embedding = sample_chunk("a_100");
        with_embedding.embedding = Some(vec![0.1, 0.2]);

        let corpus = Corpus::new(vec![with_embedding, sample_chunk("a_200")]);
        assert_eq!(corpus.embedded_count(), 1);
        assert_eq!(corpus.len(), 2);
    }

    #[test]
    fn test_stats_category_counts() {
        let mut staffing = sample_chunk("a_400");
        staffing.category = Category::Staffing;

        let corpus = Corpus::new(vec![sample_chunk("a_600"), sample_chunk("a_601"), staffing]);
        let stats = corpus.stats();

        assert_eq!(stats.chunk_count, 3);
        assert_eq!(
            stats.category_counts,
            vec![(Category::Medications, 2), (Category::Staffing, 1)]
        );
    }
}
