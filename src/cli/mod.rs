//! CLI 모듈
//!
//! regnav-rag CLI 명령어 정의 및 구현
//!
//! 파이프라인 순서: process(청킹) -> embed(임베딩) -> ask/query(질의)

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use crate::embedding::{
    create_embedder, has_api_key, OPENAI_API_KEY_ENV, VOYAGE_API_KEY_ENV,
};
use crate::generation::{GenerationService, ANTHROPIC_API_KEY_ENV};
use crate::knowledge::{
    get_data_dir, retrieval_stats, retrieve, Corpus, EngineConfig, Message, RagEngine,
    SectionChunker,
};

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Parser)]
#[command(name = "regnav-rag")]
#[command(version, about = "아이다호 ALF 규정 RAG 파이프라인", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// 규정 텍스트 파일을 섹션 청크로 분할
    Process {
        /// 규정 .txt 파일 경로
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// .txt 파일이 있는 폴더 (전체 처리)
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// 출력 스냅샷 경로 (기본: ~/.regnav-rag/chunks.json)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// 청크 스냅샷에 임베딩 생성
    Embed {
        /// 입력 스냅샷 (기본: ~/.regnav-rag/chunks.json)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// 출력 스냅샷 (기본: ~/.regnav-rag/corpus.json)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// 임베딩 프로바이더 (openai 또는 voyage)
        #[arg(short, long, default_value = "openai")]
        provider: String,

        /// 배치당 청크 수
        #[arg(long, default_value = "100")]
        batch_size: usize,
    },

    /// 두 스냅샷 병합 (chunk_id 중복 검증)
    Merge {
        /// 기존 스냅샷
        base: PathBuf,

        /// 새로 추가할 스냅샷
        incoming: PathBuf,

        /// 출력 경로
        #[arg(short, long)]
        output: PathBuf,
    },

    /// 검색 진단 (유사도 상위 청크와 품질 분포)
    Query {
        /// 검색 질의
        query: String,

        /// 결과 개수 제한
        #[arg(short, long, default_value = "12")]
        limit: usize,

        /// 최소 유사도
        #[arg(short, long, default_value = "0.0")]
        threshold: f32,

        /// 코퍼스 스냅샷 경로 (기본: ~/.regnav-rag/corpus.json)
        #[arg(long)]
        corpus: Option<PathBuf>,

        /// 임베딩 프로바이더
        #[arg(long, default_value = "openai")]
        provider: String,
    },

    /// 질문에 답변 (인용 포함)
    Ask {
        /// 질문
        question: String,

        /// 검색할 청크 수
        #[arg(short = 'k', long, default_value = "12")]
        top_k: usize,

        /// 생성 temperature
        #[arg(short, long, default_value = "0.5")]
        temperature: f32,

        /// 다양성 필터 활성화 (near-duplicate 섹션 억제)
        #[arg(long)]
        diverse: bool,

        /// 코퍼스 스냅샷 경로 (기본: ~/.regnav-rag/corpus.json)
        #[arg(long)]
        corpus: Option<PathBuf>,

        /// 임베딩 프로바이더
        #[arg(long, default_value = "openai")]
        provider: String,
    },

    /// 상태 확인
    Status {
        /// 코퍼스 스냅샷 경로 (기본: ~/.regnav-rag/corpus.json)
        #[arg(long)]
        corpus: Option<PathBuf>,
    },
}

// ============================================================================
// CLI Runner
// ============================================================================

/// CLI 명령어 실행
pub async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Process { file, dir, output } => cmd_process(file, dir, output),
        Commands::Embed {
            input,
            output,
            provider,
            batch_size,
        } => cmd_embed(input, output, &provider, batch_size).await,
        Commands::Merge {
            base,
            incoming,
            output,
        } => cmd_merge(&base, &incoming, &output),
        Commands::Query {
            query,
            limit,
            threshold,
            corpus,
            provider,
        } => cmd_query(&query, limit, threshold, corpus, &provider).await,
        Commands::Ask {
            question,
            top_k,
            temperature,
            diverse,
            corpus,
            provider,
        } => cmd_ask(&question, top_k, temperature, diverse, corpus, &provider).await,
        Commands::Status { corpus } => cmd_status(corpus),
    }
}

// ============================================================================
// Default Paths
// ============================================================================

/// 청킹 결과 기본 경로 (임베딩 전)
fn default_chunks_path() -> PathBuf {
    get_data_dir().join("chunks.json")
}

/// 임베딩 포함 코퍼스 기본 경로
fn default_corpus_path() -> PathBuf {
    get_data_dir().join("corpus.json")
}

// ============================================================================
// Command Implementations
// ============================================================================

/// 청킹 명령어 (process)
///
/// 규정 텍스트 파일을 섹션 청크로 분할하여 스냅샷으로 저장합니다.
fn cmd_process(
    file: Option<PathBuf>,
    dir: Option<PathBuf>,
    output: Option<PathBuf>,
) -> Result<()> {
    // 입력 파일 수집
    let files: Vec<PathBuf> = if let Some(file_path) = file {
        vec![file_path]
    } else if let Some(dir_path) = dir {
        let mut txt_files: Vec<PathBuf> = std::fs::read_dir(&dir_path)
            .with_context(|| format!("폴더 읽기 실패: {}", dir_path.display()))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("txt"))
            .collect();
        txt_files.sort();
        txt_files
    } else {
        bail!("--file 또는 --dir 중 하나를 지정해야 합니다");
    };

    if files.is_empty() {
        println!("[!] 처리할 .txt 파일이 없습니다.");
        return Ok(());
    }

    let chunker = SectionChunker::new();
    let mut all_chunks = Vec::new();

    for path in &files {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown");

        let chunks = chunker
            .chunk_file(path)
            .with_context(|| format!("파일 읽기 실패: {}", path.display()))?;

        if chunks.is_empty() {
            // 섹션 헤더를 하나도 인식하지 못한 파일 (목차만 있거나 형식이 다름)
            println!("[!] {}: 0 청크 (섹션 헤더 미인식)", file_name);
            tracing::warn!("No sections recognized in {}", file_name);
        } else {
            println!("[*] {}: {} 청크", file_name, chunks.len());
        }

        all_chunks.extend(chunks);
    }

    let corpus = Corpus::new(all_chunks);

    // 카테고리별 요약
    let stats = corpus.stats();
    println!("\n[OK] 총 {} 청크", stats.chunk_count);
    for (category, count) in &stats.category_counts {
        println!("     {}: {}", category, count);
    }

    let output_path = output.unwrap_or_else(default_chunks_path);
    corpus
        .save(&output_path)
        .context("스냅샷 저장 실패")?;
    println!("\n[OK] 저장됨: {}", output_path.display());

    Ok(())
}

/// 임베딩 명령어 (embed)
///
/// 임베딩이 없는 청크에 배치로 임베딩을 생성하여 새 스냅샷으로 저장합니다.
async fn cmd_embed(
    input: Option<PathBuf>,
    output: Option<PathBuf>,
    provider: &str,
    batch_size: usize,
) -> Result<()> {
    let input_path = input.unwrap_or_else(default_chunks_path);
    let output_path = output.unwrap_or_else(default_corpus_path);

    let corpus = Corpus::load(&input_path)
        .with_context(|| format!("스냅샷 로드 실패: {}", input_path.display()))?;

    let embedder = create_embedder(provider).context("임베딩 프로바이더 생성 실패")?;

    let mut chunks = corpus.into_chunks();
    let pending: Vec<usize> = chunks
        .iter()
        .enumerate()
        .filter(|(_, c)| !c.has_embedding())
        .map(|(i, _)| i)
        .collect();

    if pending.is_empty() {
        println!("[OK] 모든 청크에 이미 임베딩이 있습니다 ({} 청크)", chunks.len());
        return Ok(());
    }

    println!(
        "[*] 임베딩 생성: {} / {} 청크 ({}, 배치 {})",
        pending.len(),
        chunks.len(),
        embedder.name(),
        batch_size
    );

    let total_batches = pending.len().div_ceil(batch_size);

    for (batch_no, batch) in pending.chunks(batch_size).enumerate() {
        println!("[*] 배치 {}/{}", batch_no + 1, total_batches);

        let texts: Vec<String> = batch.iter().map(|&i| chunks[i].content.clone()).collect();
        let embeddings = embedder
            .embed_batch(&texts)
            .await
            .with_context(|| format!("배치 {} 임베딩 실패", batch_no + 1))?;

        for (&chunk_idx, embedding) in batch.iter().zip(embeddings) {
            chunks[chunk_idx].embedding = Some(embedding);
        }
    }

    let mut corpus = Corpus::new(chunks);
    corpus.set_embedding_model(embedder.name());
    corpus
        .save(&output_path)
        .context("스냅샷 저장 실패")?;

    println!(
        "\n[OK] 완료: {} 청크 임베딩, 저장됨: {}",
        pending.len(),
        output_path.display()
    );

    Ok(())
}

/// 병합 명령어 (merge)
///
/// 두 스냅샷을 하나로 합칩니다. chunk_id가 충돌하면 실패합니다.
fn cmd_merge(base: &PathBuf, incoming: &PathBuf, output: &PathBuf) -> Result<()> {
    let base_corpus = Corpus::load(base)
        .with_context(|| format!("기존 스냅샷 로드 실패: {}", base.display()))?;
    let incoming_corpus = Corpus::load(incoming)
        .with_context(|| format!("새 스냅샷 로드 실패: {}", incoming.display()))?;

    println!(
        "[*] 병합: {} 청크 + {} 청크",
        base_corpus.len(),
        incoming_corpus.len()
    );

    let merged = base_corpus
        .merge(incoming_corpus)
        .context("병합 실패 (chunk_id 충돌)")?;

    merged.save(output).context("스냅샷 저장 실패")?;

    println!("[OK] 총 {} 청크, 저장됨: {}", merged.len(), output.display());

    Ok(())
}

/// 검색 진단 명령어 (query)
///
/// 질의와 유사한 청크를 스코어와 함께 출력합니다. 생성은 하지 않습니다.
async fn cmd_query(
    query: &str,
    limit: usize,
    threshold: f32,
    corpus: Option<PathBuf>,
    provider: &str,
) -> Result<()> {
    let corpus_path = corpus.unwrap_or_else(default_corpus_path);
    let corpus = Corpus::load(&corpus_path)
        .with_context(|| format!("코퍼스 로드 실패: {}", corpus_path.display()))?;

    let embedder = create_embedder(provider).context("임베딩 프로바이더 생성 실패")?;

    println!("[*] 검색 중: \"{}\"", query);

    let query_embedding = embedder.embed(query).await.context("질의 임베딩 실패")?;
    let results = retrieve(&query_embedding, &corpus, limit, threshold)?;

    if results.is_empty() {
        println!("\n[!] 검색 결과가 없습니다.");
        return Ok(());
    }

    println!("\n[OK] 검색 결과 ({} 건):\n", results.len());

    for (i, result) in results.iter().enumerate() {
        println!(
            "{}. [{}] [유사도: {:.4}] {}",
            i + 1,
            quality_label(result.score),
            result.score,
            result.chunk.citation
        );
        println!("   제목: {}", result.chunk.section_title);
        println!("   내용: {}", truncate_text(&result.chunk.content, 200));
        println!();
    }

    // 품질 분포
    let stats = retrieval_stats(&results);
    println!("[*] 품질 분포:");
    println!("    평균 유사도: {:.4}", stats.avg_similarity);
    println!("    최고/최저: {:.4} / {:.4}", stats.max_similarity, stats.min_similarity);
    println!(
        "    excellent(>=0.7): {}, good(0.5~0.7): {}, fair(0.3~0.5): {}, poor(<0.3): {}",
        stats.excellent, stats.good, stats.fair, stats.poor
    );

    Ok(())
}

/// 질의응답 명령어 (ask)
///
/// 검색 -> 생성 -> 인용 검증 전체 파이프라인을 실행합니다.
async fn cmd_ask(
    question: &str,
    top_k: usize,
    temperature: f32,
    diverse: bool,
    corpus: Option<PathBuf>,
    provider: &str,
) -> Result<()> {
    let corpus_path = corpus.unwrap_or_else(default_corpus_path);
    let corpus = Corpus::load(&corpus_path)
        .with_context(|| format!("코퍼스 로드 실패: {}", corpus_path.display()))?;

    let embedder = create_embedder(provider).context("임베딩 프로바이더 생성 실패")?;

    let generation = GenerationService::from_env();
    if generation.provider_count() == 0 {
        bail!(
            "생성 프로바이더가 없습니다.\n\
             설정: export OPENAI_API_KEY=... 또는 export ANTHROPIC_API_KEY=..."
        );
    }

    let base_config = if diverse {
        EngineConfig::diverse()
    } else {
        EngineConfig::default()
    };
    let config = EngineConfig {
        top_k,
        temperature,
        ..base_config
    };

    let engine = RagEngine::new(corpus, embedder, generation, config);

    println!("[*] 질문: {}\n", question);

    let history: Vec<Message> = Vec::new();
    let result = engine
        .answer_question(question, &history)
        .await
        .context("답변 생성 실패")?;

    println!("{}\n", result.answer);

    println!("[*] 인용:");
    for (i, citation) in result.citations.iter().enumerate() {
        println!("  [{}] {} - {}", i + 1, citation.citation, citation.section_title);
    }

    println!("\n[*] 메타데이터:");
    println!("    프로바이더: {}", result.usage.provider);
    println!("    검색된 청크: {}", result.usage.chunks_retrieved);
    println!(
        "    인용 사용: {}/{}",
        result.usage.citations_used, result.usage.citations_expected
    );
    if !result.usage.missing_citations.is_empty() {
        println!("    누락된 인용: {:?}", result.usage.missing_citations);
    }
    println!("    평균 유사도: {:.4}", result.usage.avg_similarity);

    Ok(())
}

/// 상태 명령어 (status)
fn cmd_status(corpus: Option<PathBuf>) -> Result<()> {
    println!("regnav-rag v{}", env!("CARGO_PKG_VERSION"));
    println!();

    let data_dir = get_data_dir();
    println!("[*] 데이터 디렉토리: {}", data_dir.display());

    // API 키 상태
    for (label, env_var) in [
        ("OpenAI", OPENAI_API_KEY_ENV),
        ("Voyage", VOYAGE_API_KEY_ENV),
        ("Anthropic", ANTHROPIC_API_KEY_ENV),
    ] {
        if has_api_key(env_var) {
            println!("[OK] {} API 키: 설정됨", label);
        } else {
            println!("[!] {} API 키: 미설정 ({})", label, env_var);
        }
    }

    // 코퍼스 상태
    let corpus_path = corpus.unwrap_or_else(default_corpus_path);
    match Corpus::load(&corpus_path) {
        Ok(corpus) => {
            let stats = corpus.stats();
            println!(
                "[OK] 코퍼스: {} 청크 ({} 임베딩됨)",
                stats.chunk_count, stats.embedded_count
            );
            if let Some(model) = corpus.embedding_model() {
                println!("     임베딩 모델: {}", model);
            }
            for (category, count) in &stats.category_counts {
                println!("     {}: {}", category, count);
            }
        }
        Err(e) => {
            println!("[!] 코퍼스 로드 실패: {}", e);
            println!("    경로: {}", corpus_path.display());
            println!("    먼저 process / embed 명령을 실행하세요");
        }
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 유사도 품질 라벨
fn quality_label(score: f32) -> &'static str {
    if score >= 0.7 {
        "EXCELLENT"
    } else if score >= 0.5 {
        "GOOD"
    } else if score >= 0.3 {
        "FAIR"
    } else {
        "POOR"
    }
}

/// 텍스트 자르기 (UTF-8 안전)
fn truncate_text(text: &str, max_chars: usize) -> String {
    let cleaned = text.replace('\n', " ").replace('\r', "");
    let cleaned = cleaned.trim();

    if cleaned.chars().count() <= max_chars {
        cleaned.to_string()
    } else {
        let truncated: String = cleaned.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_label() {
        assert_eq!(quality_label(0.9), "EXCELLENT");
        assert_eq!(quality_label(0.7), "EXCELLENT");
        assert_eq!(quality_label(0.6), "GOOD");
        assert_eq!(quality_label(0.4), "FAIR");
        assert_eq!(quality_label(0.1), "POOR");
        assert_eq!(quality_label(-0.5), "POOR");
    }

    #[test]
    fn test_truncate_text() {
        assert_eq!(truncate_text("hello", 10), "hello");
        assert_eq!(truncate_text("hello world", 5), "hello...");
        assert_eq!(truncate_text("hello\nworld", 20), "hello world");
    }

    #[test]
    fn test_default_paths_are_under_data_dir() {
        assert!(default_chunks_path().starts_with(get_data_dir()));
        assert!(default_corpus_path().starts_with(get_data_dir()));
    }
}
