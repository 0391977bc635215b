//! Section Chunker - IDAPA 규정 텍스트 섹션 분할
//!
//! 규정 텍스트 파일을 섹션 단위(예: "600. MEDICATION SERVICES.")로
//! 분할하여 인용 가능한 청크로 만듭니다.
//!
//! - 첫 번째 섹션 헤더가 나오기 전까지는 목차(TOC)로 간주하고 버립니다
//! - "NNN -- MMM. (RESERVED)" 범위 마커는 현재 섹션만 닫습니다
//! - 100자 미만 섹션과 RESERVED 제목 섹션은 조용히 버립니다

use std::path::Path;

use regex::Regex;

use super::corpus::{Category, RegulationChunk};

// ============================================================================
// Constants
// ============================================================================

/// 청크 최소 길이 (문자 수) - 이보다 짧은 섹션은 헤더만 있는 것으로 간주
const MIN_SECTION_CHARS: usize = 100;

/// 시행 연도
// TODO: 문서 본문에서 실제 시행일을 추출
const EFFECTIVE_DATE: &str = "2025";

/// 섹션 번호 범위 -> 카테고리 매핑
const CATEGORY_RANGES: &[(u32, u32, Category)] = &[
    (0, 49, Category::Administrative),
    (50, 99, Category::Variances),
    (100, 149, Category::Licensing),
    (150, 215, Category::Policies),
    (216, 249, Category::AdmissionDischarge),
    (250, 304, Category::PhysicalPlant),
    (305, 318, Category::NursingAssessment),
    (319, 329, Category::ServiceAgreements),
    (330, 399, Category::Records),
    (400, 499, Category::Staffing),
    (500, 599, Category::ResidentCare),
    (600, 699, Category::Medications),
    (700, 799, Category::Dietary),
    (800, 899, Category::InfectionControl),
    (900, 999, Category::Enforcement),
];

/// 제목 키워드 -> 카테고리 매핑 (범위 매칭 실패 시 순서대로 검사, 첫 매칭 승)
const KEYWORD_RULES: &[(&[&str], Category)] = &[
    (&["staff", "personnel", "employee"], Category::Staffing),
    (&["medication", "drug", "pharmaceutical"], Category::Medications),
    (&["food", "meal", "diet", "nutrition"], Category::Dietary),
    (&["building", "physical", "construction", "fire"], Category::PhysicalPlant),
    (&["license", "licensing", "permit"], Category::Licensing),
    (&["resident", "care", "service"], Category::ResidentCare),
    (&["admission", "discharge", "agreement"], Category::AdmissionDischarge),
    (&["nursing", "assessment", "health"], Category::NursingAssessment),
    (&["infection", "sanitation", "hygiene"], Category::InfectionControl),
    (&["enforcement", "violation", "penalty"], Category::Enforcement),
];

/// 파일명 -> 문서 접두사 매핑
///
/// 구체적인 패턴을 먼저 검사해야 합니다
/// ("IDAPA 16.02.1"이 "IDAPA 16.02.19" 파일에 먼저 매칭되면 안 됨).
const DOC_PREFIXES: &[(&[&str], &str, &str)] = &[
    (&["IDAPA 16.02.19"], "idapa_16.02.19", "IDAPA 16.02.19"),
    (&["IDAPA 16.02.1"], "idapa_16.02.01", "IDAPA 16.02.01"),
    (&["IDAPA 16.05.01"], "idapa_16.05.01", "IDAPA 16.05.01"),
    (&["IDAPA 16.05.06"], "idapa_16.05.06", "IDAPA 16.05.06"),
    (&["IDAPA 16.txt", "IDAPA 16 "], "idapa_16.03.22", "IDAPA 16.03.22"),
    (&["IDAPA 24.34.01"], "idapa_24.34.01", "IDAPA 24.34.01"),
    (&["IDAPA 24.39.30"], "idapa_24.39.30", "IDAPA 24.39.30"),
    (&["IDAPA 24"], "idapa_24", "IDAPA 24"),
    (&["TITLE 39"], "title_39", "TITLE 39"),
];

/// 매칭되는 문서 접두사가 없을 때의 기본값
const FALLBACK_PREFIX: (&str, &str) = ("idaho_reg", "IDAPA");

// ============================================================================
// SectionChunker
// ============================================================================

/// IDAPA 섹션 청커
///
/// 같은 텍스트와 파일명에 대해 항상 같은 chunk_id/citation을 생성합니다
/// (섹션 번호 + 파일명의 순수 함수).
pub struct SectionChunker {
    /// 섹션 헤더: 3~4자리 번호, 마침표, 대문자 제목, 마침표
    header_re: Regex,
    /// RESERVED 범위 마커: "250 -- 259. (RESERVED)"
    reserved_re: Regex,
}

/// 누적 중인 섹션
struct OpenSection {
    number: u32,
    title: String,
    content: String,
}

impl SectionChunker {
    pub fn new() -> Self {
        Self {
            header_re: Regex::new(r"^(\d{3,4})\.\s+([A-Z][A-Z\s\-,&()]+)\.").unwrap(),
            reserved_re: Regex::new(r"^\d{3,4}\s*--\s*\d{3,4}\.\s*\(RESERVED\)").unwrap(),
        }
    }

    /// 규정 텍스트를 섹션 청크로 분할
    ///
    /// # Arguments
    /// * `text` - 규정 전문
    /// * `source_file` - 원본 파일명 (문서 접두사 결정에 사용)
    ///
    /// # Returns
    /// 섹션 순서대로 정렬된 청크 목록.
    /// 인식 가능한 헤더가 하나도 없으면 빈 목록을 반환합니다 (에러 아님).
    pub fn chunk_text(&self, text: &str, source_file: &str) -> Vec<RegulationChunk> {
        let (doc_prefix, citation_prefix) = resolve_doc_prefix(source_file);

        let mut chunks = Vec::new();
        let mut current: Option<OpenSection> = None;
        let mut in_toc = true;

        for line in text.lines() {
            let line = line.trim();

            // 첫 섹션 헤더가 나오기 전까지는 목차
            if in_toc {
                if self.header_re.is_match(line) {
                    in_toc = false;
                } else {
                    continue;
                }
            }

            // RESERVED 범위 마커: 현재 섹션을 닫고 새 섹션은 열지 않음
            if self.reserved_re.is_match(line) {
                if let Some(section) = current.take() {
                    emit(&mut chunks, section, source_file, doc_prefix, citation_prefix);
                }
                continue;
            }

            // 새 섹션 헤더
            if let Some(caps) = self.header_re.captures(line) {
                if let Ok(number) = caps[1].parse::<u32>() {
                    if let Some(section) = current.take() {
                        emit(&mut chunks, section, source_file, doc_prefix, citation_prefix);
                    }

                    current = Some(OpenSection {
                        number,
                        title: caps[2].trim().to_string(),
                        // 헤더 라인도 섹션 본문에 포함
                        content: line.to_string(),
                    });
                    continue;
                }
                // 번호 파싱 실패 시 헤더로 취급하지 않고 본문으로 누적
            }

            // 현재 섹션 본문에 누적
            if let Some(section) = current.as_mut() {
                section.content.push('\n');
                section.content.push_str(line);
            }
        }

        // 마지막 섹션 마무리
        if let Some(section) = current.take() {
            emit(&mut chunks, section, source_file, doc_prefix, citation_prefix);
        }

        chunks
    }

    /// 규정 텍스트 파일을 섹션 청크로 분할
    ///
    /// 경로의 마지막 요소(파일명)로 문서 접두사를 결정합니다.
    pub fn chunk_file(&self, path: &Path) -> std::io::Result<Vec<RegulationChunk>> {
        let text = std::fs::read_to_string(path)?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown");
        Ok(self.chunk_text(&text, file_name))
    }
}

impl Default for SectionChunker {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 누적된 섹션을 청크로 발행
///
/// 100자 미만 섹션과 RESERVED 제목은 조용히 버립니다.
fn emit(
    chunks: &mut Vec<RegulationChunk>,
    section: OpenSection,
    source_file: &str,
    doc_prefix: &str,
    citation_prefix: &str,
) {
    let content = section.content.trim();

    if content.len() < MIN_SECTION_CHARS {
        tracing::debug!(
            "Skipping short section {} ({} chars)",
            section.number,
            content.len()
        );
        return;
    }

    if section.title.to_uppercase().contains("RESERVED") {
        return;
    }

    let category = determine_category(section.number, &section.title);

    chunks.push(RegulationChunk {
        chunk_id: format!("{}_{}", doc_prefix, section.number),
        content: content.to_string(),
        citation: format!("{}.{:03}", citation_prefix, section.number),
        section_title: section.title,
        category,
        state: "Idaho".to_string(),
        effective_date: Some(EFFECTIVE_DATE.to_string()),
        source_file: Some(source_file.to_string()),
        embedding: None,
    });
}

/// 섹션 번호와 제목으로 카테고리 결정
///
/// 섹션 번호 범위를 먼저 검사하고, 실패하면 제목 키워드를 순서대로 검사합니다.
fn determine_category(section_number: u32, title: &str) -> Category {
    for &(start, end, category) in CATEGORY_RANGES {
        if (start..=end).contains(&section_number) {
            return category;
        }
    }

    let title_lower = title.to_lowercase();
    for &(keywords, category) in KEYWORD_RULES {
        if keywords.iter().any(|kw| title_lower.contains(kw)) {
            return category;
        }
    }

    Category::General
}

/// 파일명으로 문서 접두사 결정
///
/// (chunk_id 접두사, 인용 접두사)를 반환합니다.
fn resolve_doc_prefix(source_file: &str) -> (&'static str, &'static str) {
    for &(needles, doc_prefix, citation_prefix) in DOC_PREFIXES {
        if needles.iter().any(|n| source_file.contains(n)) {
            return (doc_prefix, citation_prefix);
        }
    }
    FALLBACK_PREFIX
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// 목차 + 실제 섹션 2개 + RESERVED 범위가 있는 샘플 규정 텍스트
    fn sample_regulation() -> String {
        let body_a = "Each facility must maintain written records of all medications \
                      administered to residents, including dosage, time, and the name of \
                      the person administering the medication.";
        let body_b = "All staff members who assist residents with medications must \
                      complete a board-approved training course and demonstrate competency \
                      before assuming medication assistance duties.";

        format!(
            "Table of Contents\n\
             600. Medication Services. ........ 12\n\
             601. Medication Assistance. ...... 13\n\
             \n\
             600.\tMEDICATION SERVICES.\n\
             {}\n\
             \n\
             601.\tMEDICATION ASSISTANCE.\n\
             {}\n\
             \n\
             602 -- 609. (RESERVED)\n",
            body_a, body_b
        )
    }

    #[test]
    fn test_chunk_basic_sections() {
        let chunker = SectionChunker::new();
        let chunks = chunker.chunk_text(&sample_regulation(), "IDAPA 16.txt");

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chunk_id, "idapa_16.03.22_600");
        assert_eq!(chunks[0].citation, "IDAPA 16.03.22.600");
        assert_eq!(chunks[0].section_title, "MEDICATION SERVICES");
        assert_eq!(chunks[0].category, Category::Medications);
        assert_eq!(chunks[1].citation, "IDAPA 16.03.22.601");
    }

    #[test]
    fn test_toc_lines_are_skipped() {
        // 목차의 "600. Medication Services. ..." 라인은 소문자가 섞여
        // 헤더 패턴에 매칭되지 않으므로 버려져야 함
        let chunker = SectionChunker::new();
        let chunks = chunker.chunk_text(&sample_regulation(), "IDAPA 16.txt");

        assert!(!chunks[0].content.contains("........"));
        assert!(chunks[0].content.starts_with("600."));
    }

    #[test]
    fn test_toc_only_file_yields_no_chunks() {
        let text = "Table of Contents\n100. Licensing. ... 1\n200. Admission. ... 5\n";
        let chunker = SectionChunker::new();
        let chunks = chunker.chunk_text(text, "IDAPA 16.txt");
        assert!(chunks.is_empty());
    }

    #[test]
    fn test_short_sections_are_dropped() {
        let text = "100.\tLICENSING REQUIRED.\nShort.\n";
        let chunker = SectionChunker::new();
        let chunks = chunker.chunk_text(text, "IDAPA 16.txt");
        assert!(chunks.is_empty());
    }

    #[test]
    fn test_reserved_title_is_dropped() {
        let filler = "x ".repeat(80);
        let text = format!("105.\tRESERVED FOR FUTURE USE.\n{}\n", filler);
        let chunker = SectionChunker::new();
        let chunks = chunker.chunk_text(&text, "IDAPA 16.txt");
        assert!(chunks.is_empty());
    }

    #[test]
    fn test_reserved_range_closes_section() {
        let body = "Facilities must develop and follow written policies covering \
                    admission criteria, resident rights, and discharge planning for \
                    every resident admitted to the facility.";
        let text = format!(
            "150.\tPOLICIES AND PROCEDURES.\n{}\n151 -- 159. (RESERVED)\ntrailing text outside any section\n",
            body
        );

        let chunker = SectionChunker::new();
        let chunks = chunker.chunk_text(&text, "IDAPA 16.txt");

        assert_eq!(chunks.len(), 1);
        // RESERVED 마커 이후의 텍스트는 어떤 섹션에도 속하지 않음
        assert!(!chunks[0].content.contains("trailing text"));
    }

    #[test]
    fn test_chunking_is_deterministic() {
        let chunker = SectionChunker::new();
        let a = chunker.chunk_text(&sample_regulation(), "IDAPA 16.txt");
        let b = chunker.chunk_text(&sample_regulation(), "IDAPA 16.txt");

        let ids_a: Vec<&str> = a.iter().map(|c| c.chunk_id.as_str()).collect();
        let ids_b: Vec<&str> = b.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(ids_a, ids_b);

        let cites_a: Vec<&str> = a.iter().map(|c| c.citation.as_str()).collect();
        let cites_b: Vec<&str> = b.iter().map(|c| c.citation.as_str()).collect();
        assert_eq!(cites_a, cites_b);
    }

    #[test]
    fn test_chunk_file_uses_file_name_for_prefix() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("IDAPA 16.txt");
        std::fs::write(&path, sample_regulation()).expect("write");

        let chunker = SectionChunker::new();
        let chunks = chunker.chunk_file(&path).expect("chunk_file");

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].citation, "IDAPA 16.03.22.600");
        assert_eq!(chunks[0].source_file.as_deref(), Some("IDAPA 16.txt"));
    }

    #[test]
    fn test_chunk_file_missing_path() {
        let chunker = SectionChunker::new();
        assert!(chunker.chunk_file(Path::new("/nonexistent/reg.txt")).is_err());
    }

    #[test]
    fn test_four_digit_section_number() {
        let body = "The department may impose civil monetary penalties for repeated \
                    or uncorrected deficiencies identified during any survey or \
                    complaint investigation conducted at the facility.";
        let text = format!("1000.\tPENALTY PROVISIONS.\n{}\n", body);

        let chunker = SectionChunker::new();
        let chunks = chunker.chunk_text(&text, "IDAPA 16.txt");

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].citation, "IDAPA 16.03.22.1000");
        // 범위 테이블(000~999) 밖이므로 제목 키워드로 결정: penalty -> enforcement
        assert_eq!(chunks[0].category, Category::Enforcement);
    }

    #[test]
    fn test_determine_category_ranges() {
        assert_eq!(determine_category(25, "DEFINITIONS"), Category::Administrative);
        assert_eq!(determine_category(75, "VARIANCE PROCEDURES"), Category::Variances);
        assert_eq!(determine_category(120, "APPLICATION"), Category::Licensing);
        assert_eq!(determine_category(320, "SERVICE AGREEMENTS"), Category::ServiceAgreements);
        assert_eq!(determine_category(450, "ADMINISTRATOR"), Category::Staffing);
        assert_eq!(determine_category(650, "STORAGE"), Category::Medications);
        assert_eq!(determine_category(950, "REVOCATION"), Category::Enforcement);
    }

    #[test]
    fn test_determine_category_keyword_fallback() {
        // 범위 밖 섹션 번호는 키워드 순서대로 검사 (첫 매칭 승)
        assert_eq!(determine_category(9999, "STAFF TRAINING"), Category::Staffing);
        assert_eq!(determine_category(9999, "FOOD SAFETY"), Category::Dietary);
        // "RESIDENT CARE STAFFING"은 staff 규칙이 먼저 매칭
        assert_eq!(determine_category(9999, "RESIDENT CARE STAFFING"), Category::Staffing);
        assert_eq!(determine_category(9999, "MISCELLANEOUS"), Category::General);
    }

    #[test]
    fn test_doc_prefix_longest_match_first() {
        // "IDAPA 16.02.19" 파일이 "IDAPA 16.02.1"로 잘못 매칭되면 안 됨
        assert_eq!(
            resolve_doc_prefix("IDAPA 16.02.19 - Food Code.txt"),
            ("idapa_16.02.19", "IDAPA 16.02.19")
        );
        assert_eq!(
            resolve_doc_prefix("IDAPA 16.02.1 - General.txt"),
            ("idapa_16.02.01", "IDAPA 16.02.01")
        );
        assert_eq!(
            resolve_doc_prefix("IDAPA 16.txt"),
            ("idapa_16.03.22", "IDAPA 16.03.22")
        );
        assert_eq!(
            resolve_doc_prefix("IDAPA 24.39.30 - Building Safety.txt"),
            ("idapa_24.39.30", "IDAPA 24.39.30")
        );
        assert_eq!(resolve_doc_prefix("TITLE 39 Chapter 33.txt"), ("title_39", "TITLE 39"));
        assert_eq!(resolve_doc_prefix("unknown.txt"), ("idaho_reg", "IDAPA"));
    }
}
