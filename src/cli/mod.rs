//! CLI 모듈
//!
//! palank-chat CLI 명령어 정의 및 구현

use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::collector::{CollectorConfig, FileCollector};
use crate::controller::{Presenter, ReplyOutcome, SessionController, StatusStyle};
use crate::embedding::{get_ollama_host, OllamaEmbeddingLoader, DEFAULT_EMBED_MODEL};
use crate::extractor::{Document, FileDocument, TEXT_MIME};
use crate::knowledge::{
    ChunkConfig, RetrievalConfig, RetrievalEngine, DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE,
};
use crate::llm::{
    GenerationOptions, GenerationSession, InitProgress, OllamaBackendFactory, ProgressCallback,
    DEFAULT_CHAT_MODEL, DEFAULT_SYSTEM_PROMPT, DEFAULT_TEMPERATURE,
};

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Parser)]
#[command(name = "palank-chat")]
#[command(version, about = "로컬 문서 채팅 - PDF RAG + 로컬 LLM", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// 대화형 채팅 (REPL)
    Chat {
        #[command(flatten)]
        docs: DocumentArgs,

        #[command(flatten)]
        model: ModelArgs,
    },

    /// 단일 질문
    Ask {
        /// 질문
        question: String,

        #[command(flatten)]
        docs: DocumentArgs,

        #[command(flatten)]
        model: ModelArgs,
    },

    /// 문서 검색 (생성 없이)
    Search {
        /// 검색 쿼리
        query: String,

        #[command(flatten)]
        docs: DocumentArgs,

        /// 결과 개수 제한
        #[arg(short, long, default_value = "3")]
        k: usize,
    },

    /// 상태 확인
    Status {
        /// 채팅 모델
        #[arg(short, long, default_value = DEFAULT_CHAT_MODEL)]
        model: String,

        /// 임베딩 모델
        #[arg(long, default_value = DEFAULT_EMBED_MODEL)]
        embed_model: String,
    },
}

/// 지식베이스에 넣을 문서
#[derive(Args, Debug, Clone)]
pub struct DocumentArgs {
    /// 수집할 파일 경로 (반복 가능)
    #[arg(short, long = "file")]
    pub files: Vec<PathBuf>,

    /// 수집할 폴더 경로 (재귀, 반복 가능)
    #[arg(short, long = "dir")]
    pub dirs: Vec<PathBuf>,

    /// 텍스트 파일(.txt, .md)도 수집
    #[arg(long)]
    pub allow_text: bool,

    /// 청크 크기 (문자 수)
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,

    /// 청크 오버랩 (문자 수)
    #[arg(long, default_value_t = DEFAULT_CHUNK_OVERLAP)]
    pub overlap: usize,

    /// 임베딩 모델
    #[arg(long, default_value = DEFAULT_EMBED_MODEL)]
    pub embed_model: String,
}

/// 생성 모델 설정
#[derive(Args, Debug, Clone)]
pub struct ModelArgs {
    /// 채팅 모델
    #[arg(short, long, default_value = DEFAULT_CHAT_MODEL)]
    pub model: String,

    /// 시스템 프롬프트
    #[arg(long, default_value = DEFAULT_SYSTEM_PROMPT, hide_default_value = true)]
    pub system_prompt: String,

    /// 샘플링 온도 (0.0 ~ 2.0)
    #[arg(short, long, default_value_t = DEFAULT_TEMPERATURE)]
    pub temperature: f32,
}

impl ModelArgs {
    fn options(&self) -> Result<GenerationOptions> {
        let options = GenerationOptions {
            system_prompt: self.system_prompt.clone(),
            temperature: self.temperature,
        };
        options.validate()?;
        Ok(options)
    }
}

// ============================================================================
// CLI Runner
// ============================================================================

/// CLI 명령어 실행
pub async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Chat { docs, model } => cmd_chat(docs, model).await,
        Commands::Ask {
            question,
            docs,
            model,
        } => cmd_ask(&question, docs, model).await,
        Commands::Search { query, docs, k } => cmd_search(&query, docs, k).await,
        Commands::Status { model, embed_model } => cmd_status(&model, &embed_model).await,
    }
}

// ============================================================================
// Terminal Presenter
// ============================================================================

/// 터미널 출력
///
/// 부분 응답은 누적 텍스트로 들어오므로 이미 출력한 부분 이후만 씁니다.
#[derive(Default)]
struct TerminalPresenter {
    printed: Mutex<String>,
}

impl TerminalPresenter {
    fn reset(&self) -> String {
        std::mem::take(&mut *self.printed.lock().unwrap_or_else(|p| p.into_inner()))
    }
}

impl Presenter for TerminalPresenter {
    fn on_status(&self, label: &str, style: StatusStyle) {
        match style {
            StatusStyle::Loading | StatusStyle::Busy => eprintln!("[*] {}", label),
            StatusStyle::Error => eprintln!("[!] {}", label),
            StatusStyle::Generating | StatusStyle::Ready | StatusStyle::Stopped => {
                tracing::debug!("status: {}", label)
            }
        }
    }

    fn on_system_message(&self, text: &str) {
        println!("[OK] {}", text);
    }

    fn on_partial(&self, text: &str) {
        let mut printed = self.printed.lock().unwrap_or_else(|p| p.into_inner());
        if let Err(e) = write_partial(&mut std::io::stdout(), &mut printed, text) {
            tracing::debug!("Failed to write partial reply: {}", e);
        }
    }

    fn on_reply(&self, outcome: &ReplyOutcome) {
        let printed = self.reset();
        match outcome {
            ReplyOutcome::Completed(text) if printed.is_empty() => println!("{}", text),
            ReplyOutcome::Completed(_) => println!(),
            other => println!("\n{}", other),
        }
    }

    fn set_loading(&self, loading: bool) {
        tracing::debug!("loading: {}", loading);
    }
}

/// 누적 텍스트 중 아직 출력하지 않은 부분만 씀
///
/// 쓰기에 실패해도 `printed`는 갱신하므로 다음 델타는 이어서 출력됩니다.
fn write_partial<W: Write>(out: &mut W, printed: &mut String, text: &str) -> std::io::Result<()> {
    let written = match text.strip_prefix(printed.as_str()) {
        Some(rest) => write!(out, "{}", rest),
        // 복구 후 응답이 처음부터 다시 옴
        None => write!(out, "\n{}", text),
    }
    .and_then(|_| out.flush());

    printed.clear();
    printed.push_str(text);
    written
}

fn terminal_progress() -> ProgressCallback {
    Arc::new(|p: &InitProgress| eprintln!("[*] {}", p.text))
}

// ============================================================================
// Setup Helpers
// ============================================================================

/// 검색 엔진 생성
fn build_engine(docs: &DocumentArgs) -> Result<RetrievalEngine> {
    let loader = OllamaEmbeddingLoader::from_env(docs.embed_model.as_str())?;

    let mut config = RetrievalConfig {
        chunk: ChunkConfig {
            chunk_size: docs.chunk_size,
            overlap: docs.overlap,
        },
        ..Default::default()
    };
    if docs.allow_text {
        config = config.accept(TEXT_MIME);
    }

    Ok(RetrievalEngine::with_config(Arc::new(loader), config)?)
}

/// 경로에서 문서 수집
fn open_documents(
    files: &[PathBuf],
    dirs: &[PathBuf],
    allow_text: bool,
) -> Result<Vec<Arc<dyn Document>>> {
    let collector = FileCollector::new(CollectorConfig {
        skip_text: !allow_text,
        ..Default::default()
    });

    let collected = collector.collect(files, dirs)?;
    if !collected.is_empty() {
        let total: u64 = collected.iter().map(|f| f.size).sum();
        println!(
            "[*] 수집 대상: {} 파일 ({})",
            collected.len(),
            format_bytes(total as usize)
        );
    }

    Ok(collected
        .into_iter()
        .map(|f| Arc::new(FileDocument::from(f)) as Arc<dyn Document>)
        .collect())
}

fn build_controller(docs: &DocumentArgs, model: &ModelArgs) -> Result<SessionController> {
    let engine = build_engine(docs)?;
    let factory = OllamaBackendFactory::from_env().context("Ollama 백엔드 생성 실패")?;
    let session = GenerationSession::new(Arc::new(factory), model.model.as_str())
        .with_progress(terminal_progress());

    Ok(SessionController::new(
        engine,
        Arc::new(session),
        Arc::new(TerminalPresenter::default()),
    ))
}

/// Ctrl-C 가 들어오면 생성을 중단하면서 메시지 전송
async fn send_interruptible(
    controller: &SessionController,
    text: &str,
    options: &GenerationOptions,
) -> Option<ReplyOutcome> {
    let send = controller.send_message(text, options);
    tokio::pin!(send);

    loop {
        tokio::select! {
            outcome = &mut send => return outcome,
            _ = tokio::signal::ctrl_c() => controller.stop().await,
        }
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

/// 대화형 채팅 명령어 (chat)
async fn cmd_chat(docs: DocumentArgs, model: ModelArgs) -> Result<()> {
    let options = model.options()?;
    let controller = build_controller(&docs, &model)?;

    println!(
        "palank-chat v{} ({})",
        env!("CARGO_PKG_VERSION"),
        controller.session().model_id()
    );

    // 모델 미리 로드 (실패해도 첫 메시지에서 다시 시도)
    if controller.preload().await.is_err() {
        println!("[!] 모델 로드 실패. 메시지를 보내면 다시 시도합니다.");
    }

    let initial = open_documents(&docs.files, &docs.dirs, docs.allow_text)?;
    if !initial.is_empty() {
        controller.ingest_files(&initial).await;
    }

    print_help();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("\n> ");
        if let Err(e) = std::io::stdout().flush() {
            tracing::debug!("Failed to flush prompt: {}", e);
        }

        let line = tokio::select! {
            line = lines.next_line() => line.context("입력 읽기 실패")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };
        let line = line.trim();

        match ReplCommand::parse(line) {
            ReplCommand::Quit => break,
            ReplCommand::Help => print_help(),
            ReplCommand::Sources => {
                let sources = controller.sources().await;
                if sources.is_empty() {
                    println!("[!] 수집된 문서가 없습니다.");
                }
                for source in sources {
                    println!("  - {}", source);
                }
            }
            ReplCommand::Clear => controller.reset().await,
            ReplCommand::Add(paths) => {
                let (dirs, files): (Vec<_>, Vec<_>) = paths.into_iter().partition(|p| p.is_dir());
                match open_documents(&files, &dirs, docs.allow_text) {
                    Ok(found) if found.is_empty() => println!("[!] 수집할 파일이 없습니다."),
                    Ok(found) => {
                        controller.ingest_files(&found).await;
                    }
                    Err(e) => println!("[!] 파일 수집 실패: {:#}", e),
                }
            }
            ReplCommand::Unknown(command) => {
                println!("[!] 알 수 없는 명령어: {} (/help 참고)", command)
            }
            ReplCommand::Message(text) => {
                send_interruptible(&controller, text, &options).await;
            }
        }
    }

    println!("[OK] 종료");
    Ok(())
}

/// 단일 질문 명령어 (ask)
async fn cmd_ask(question: &str, docs: DocumentArgs, model: ModelArgs) -> Result<()> {
    let options = model.options()?;
    let controller = build_controller(&docs, &model)?;

    let documents = open_documents(&docs.files, &docs.dirs, docs.allow_text)?;
    if !documents.is_empty() {
        controller.ingest_files(&documents).await;
    }

    match send_interruptible(&controller, question, &options).await {
        Some(ReplyOutcome::Failed(message)) => bail!("응답 생성 실패: {}", message),
        Some(_) => Ok(()),
        None => bail!("질문이 비어 있습니다"),
    }
}

/// 검색 명령어 (search)
///
/// 문서를 수집한 뒤 생성 없이 검색 결과만 출력합니다.
async fn cmd_search(query: &str, docs: DocumentArgs, k: usize) -> Result<()> {
    let documents = open_documents(&docs.files, &docs.dirs, docs.allow_text)?;
    if documents.is_empty() {
        bail!("--file 또는 --dir 로 검색할 문서를 지정해야 합니다");
    }

    let mut engine = build_engine(&docs)?;
    let results = engine
        .ingest(&documents, |message| println!("[*] {}", message))
        .await;

    for result in &results {
        println!(
            "[OK] {}: {} 글자, {} 청크",
            result.name, result.text_length, result.chunk_count
        );
    }

    if engine.is_empty() {
        println!("[!] 저장된 청크가 없습니다.");
        return Ok(());
    }

    println!("\n[*] 검색 중: \"{}\"", query);
    let chunks = engine.search(query, k).await.context("검색 실패")?;

    if chunks.is_empty() {
        println!("\n[!] 검색 결과가 없습니다.");
        return Ok(());
    }

    println!("\n[OK] 검색 결과 ({} 건):\n", chunks.len());
    for (i, chunk) in chunks.iter().enumerate() {
        println!("{}. [점수: {:.4}] {}", i + 1, chunk.score, chunk.source);
        println!("   내용: {}", truncate_text(&chunk.text, 200));
        println!();
    }

    Ok(())
}

/// 상태 명령어 (status)
///
/// Ollama 서버와 모델 준비 상태를 확인합니다.
async fn cmd_status(model: &str, embed_model: &str) -> Result<()> {
    println!("palank-chat v{}", env!("CARGO_PKG_VERSION"));
    println!();

    let host = get_ollama_host()?;
    println!("[*] Ollama 서버: {}", host);

    let factory = OllamaBackendFactory::new(host)?;
    match factory.server_version().await {
        Ok(version) => println!("[OK] 서버 버전: {}", version),
        Err(e) => {
            println!("[!] 서버 연결 실패: {:#}", e);
            println!("    설정: export OLLAMA_HOST=http://host:11434");
            return Ok(());
        }
    }

    for (label, name) in [("채팅 모델", model), ("임베딩 모델", embed_model)] {
        match factory.has_model(name).await {
            Ok(true) => println!("[OK] {}: {} (설치됨)", label, name),
            Ok(false) => println!("[!] {}: {} (미설치, 첫 사용 시 다운로드)", label, name),
            Err(e) => println!("[!] {} 확인 실패: {:#}", label, e),
        }
    }

    Ok(())
}

// ============================================================================
// REPL Commands
// ============================================================================

#[derive(Debug, PartialEq)]
enum ReplCommand<'a> {
    Quit,
    Help,
    Sources,
    Clear,
    Add(Vec<PathBuf>),
    Unknown(&'a str),
    Message(&'a str),
}

impl<'a> ReplCommand<'a> {
    fn parse(line: &'a str) -> Self {
        if !line.starts_with('/') {
            return ReplCommand::Message(line);
        }

        let mut parts = line.split_whitespace();
        match parts.next().unwrap_or_default() {
            "/quit" | "/exit" => ReplCommand::Quit,
            "/help" => ReplCommand::Help,
            "/sources" => ReplCommand::Sources,
            "/clear" => ReplCommand::Clear,
            "/add" => ReplCommand::Add(parts.map(PathBuf::from).collect()),
            other => ReplCommand::Unknown(other),
        }
    }
}

fn print_help() {
    println!("명령어:");
    println!("  /add <경로>...  파일 또는 폴더 추가");
    println!("  /sources        수집된 문서 목록");
    println!("  /clear          지식베이스와 대화 이력 초기화");
    println!("  /quit           종료");
    println!("  (생성 중 Ctrl-C 로 중단)");
}

// ============================================================================
// Helper Functions
// ============================================================================

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

/// 바이트 크기 포맷팅
fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;

    if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_text() {
        assert_eq!(truncate_text("hello", 10), "hello");
        assert_eq!(truncate_text("hello world", 5), "hello...");
        assert_eq!(truncate_text("hello\nworld", 20), "hello world");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500), "500 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
    }

    #[test]
    fn test_write_partial_prints_only_new_text() {
        let mut out = Vec::new();
        let mut printed = String::new();

        for partial in ["Hel", "Hello", "Hello!", "\n\n**[notice]**", "Hi"] {
            write_partial(&mut out, &mut printed, partial).unwrap();
        }

        assert_eq!(
            String::from_utf8(out).unwrap(),
            "Hello!\n\n\n**[notice]**\nHi"
        );
        assert_eq!(printed, "Hi");
    }

    struct ClosedPipe;

    impl Write for ClosedPipe {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::ErrorKind::BrokenPipe.into())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_partial_reports_write_error() {
        let mut printed = String::new();
        let err = write_partial(&mut ClosedPipe, &mut printed, "Hello").unwrap_err();

        assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);
        assert_eq!(printed, "Hello");
    }

    #[test]
    fn test_repl_command_parse() {
        assert_eq!(ReplCommand::parse("/quit"), ReplCommand::Quit);
        assert_eq!(ReplCommand::parse("/sources"), ReplCommand::Sources);
        assert_eq!(
            ReplCommand::parse("/add a.pdf papers"),
            ReplCommand::Add(vec![PathBuf::from("a.pdf"), PathBuf::from("papers")])
        );
        assert_eq!(ReplCommand::parse("/nope x"), ReplCommand::Unknown("/nope"));
        assert_eq!(
            ReplCommand::parse("what is rust?"),
            ReplCommand::Message("what is rust?")
        );
    }

    #[test]
    fn test_cli_parses_chat_defaults() {
        let cli = Cli::try_parse_from(["palank-chat", "chat", "-f", "a.pdf", "--dir", "papers"])
            .unwrap();

        match cli.command {
            Commands::Chat { docs, model } => {
                assert_eq!(docs.files, vec![PathBuf::from("a.pdf")]);
                assert_eq!(docs.dirs, vec![PathBuf::from("papers")]);
                assert_eq!(docs.chunk_size, 500);
                assert_eq!(docs.overlap, 100);
                assert!(!docs.allow_text);
                assert_eq!(model.model, DEFAULT_CHAT_MODEL);
                assert_eq!(model.options().unwrap(), GenerationOptions::default());
            }
            _ => panic!("expected chat command"),
        }
    }

    #[test]
    fn test_invalid_temperature_rejected() {
        let cli = Cli::try_parse_from(["palank-chat", "ask", "hi", "-t", "5"]).unwrap();
        match cli.command {
            Commands::Ask { model, .. } => assert!(model.options().is_err()),
            _ => panic!("expected ask command"),
        }
    }
}
