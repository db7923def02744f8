//! Session Controller - 사용자 동작과 두 엔진 연결
//!
//! 검색 결과로 컨텍스트를 만들어 생성 세션에 넘기고,
//! 진행 상황과 부분 응답을 `Presenter`로 전달합니다.
//! 두 엔진 사이에는 파생된 문자열만 오갑니다.

use std::fmt;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::{RagError, RagResult};
use crate::extractor::Document;
use crate::knowledge::{IngestResult, RetrievalEngine};
use crate::llm::{BackendStatus, GenerationOptions, GenerationSession, InitProgress, ProgressCallback};

/// 컨텍스트에 넣을 검색 결과 수
pub const CONTEXT_TOP_K: usize = 3;

// ============================================================================
// Presenter
// ============================================================================

/// 상태 표시 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusStyle {
    Loading,
    Busy,
    Generating,
    Ready,
    Stopped,
    Error,
}

/// 한 턴의 최종 결과
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyOutcome {
    Completed(String),
    /// 사용자가 중단함 (에러와 구분해서 표시)
    Stopped,
    Failed(String),
}

impl fmt::Display for ReplyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplyOutcome::Completed(text) => write!(f, "{}", text),
            ReplyOutcome::Stopped => write!(f, "**[Generation Stopped by User]**"),
            ReplyOutcome::Failed(message) => write!(f, "**Error**: {}", message),
        }
    }
}

/// 표시 계층 훅
pub trait Presenter: Send + Sync {
    /// 상태 라벨 변경
    fn on_status(&self, label: &str, style: StatusStyle);

    /// 시스템 메시지 (수집 완료, 모델 로드 실패 등)
    fn on_system_message(&self, text: &str);

    /// 누적된 부분 응답
    fn on_partial(&self, text: &str);

    /// 턴 종료
    fn on_reply(&self, outcome: &ReplyOutcome);

    /// 입력 잠금 여부
    fn set_loading(&self, loading: bool);
}

// ============================================================================
// SessionController
// ============================================================================

pub struct SessionController {
    engine: RwLock<RetrievalEngine>,
    session: Arc<GenerationSession>,
    presenter: Arc<dyn Presenter>,
}

impl SessionController {
    pub fn new(
        engine: RetrievalEngine,
        session: Arc<GenerationSession>,
        presenter: Arc<dyn Presenter>,
    ) -> Self {
        Self {
            engine: RwLock::new(engine),
            session,
            presenter,
        }
    }

    pub fn session(&self) -> &Arc<GenerationSession> {
        &self.session
    }

    pub fn engine(&self) -> &RwLock<RetrievalEngine> {
        &self.engine
    }

    fn progress_to_status(&self) -> ProgressCallback {
        let presenter = self.presenter.clone();
        Arc::new(move |progress: &InitProgress| {
            let label = match progress.fraction {
                Some(fraction) => format!("{} ({:.0}%)", progress.text, fraction * 100.0),
                None => progress.text.clone(),
            };
            presenter.on_status(&label, StatusStyle::Loading);
        })
    }

    /// 시작 시 모델 미리 로드
    pub async fn preload(&self) -> RagResult<()> {
        self.presenter.set_loading(true);
        self.presenter.on_status("Loading Model...", StatusStyle::Loading);

        let result = self.session.warm_up(self.progress_to_status()).await;
        match &result {
            Ok(()) => self.presenter.on_status("Ready", StatusStyle::Ready),
            Err(e) => self.report_load_failure(e),
        }

        self.presenter.set_loading(false);
        result
    }

    fn report_load_failure(&self, err: &RagError) {
        tracing::error!("Model load failed: {}", err);
        self.presenter
            .on_system_message(&format!("Failed to load model - {}", err));
        self.presenter.on_status("Error", StatusStyle::Error);
    }

    /// 파일 수집
    pub async fn ingest_files(&self, files: &[Arc<dyn Document>]) -> Vec<IngestResult> {
        self.presenter.set_loading(true);
        self.presenter.on_status("Processing Files...", StatusStyle::Busy);

        let presenter = &self.presenter;
        let results = self
            .engine
            .write()
            .await
            .ingest(files, |message| presenter.on_status(message, StatusStyle::Busy))
            .await;

        if !results.is_empty() {
            self.presenter.on_system_message(&format!(
                "Successfully read {} documents.",
                results.len()
            ));
        }

        self.presenter.on_status("Ready", StatusStyle::Ready);
        self.presenter.set_loading(false);
        results
    }

    /// 메시지 전송
    ///
    /// 공백뿐인 메시지는 무시하고 `None`을 반환합니다.
    pub async fn send_message(
        &self,
        text: &str,
        options: &GenerationOptions,
    ) -> Option<ReplyOutcome> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }

        self.presenter.set_loading(true);

        if self.session.status() != BackendStatus::Ready {
            self.presenter.on_status("Loading Model...", StatusStyle::Loading);
            if let Err(e) = self.session.warm_up(self.progress_to_status()).await {
                self.report_load_failure(&e);
                self.presenter.set_loading(false);
                return Some(ReplyOutcome::Failed(e.to_string()));
            }
        }

        self.presenter
            .on_status("Searching Knowledge Base...", StatusStyle::Busy);
        let context = self.build_context(text).await;

        self.presenter
            .on_status("Generating Answer...", StatusStyle::Generating);
        let presenter = &self.presenter;
        let outcome = match self
            .session
            .send(text, &context, options, |partial| presenter.on_partial(partial))
            .await
        {
            Ok(reply) => {
                self.presenter.on_status("Ready", StatusStyle::Ready);
                ReplyOutcome::Completed(reply)
            }
            Err(RagError::Interrupted) => {
                self.presenter.on_status("Stopped", StatusStyle::Stopped);
                ReplyOutcome::Stopped
            }
            Err(e) => {
                tracing::error!("Generation failed: {}", e);
                self.presenter.on_status("Error", StatusStyle::Error);
                ReplyOutcome::Failed(e.to_string())
            }
        };

        self.presenter.on_reply(&outcome);
        self.presenter.set_loading(false);
        Some(outcome)
    }

    /// 검색 결과로 컨텍스트 구성
    ///
    /// 문서 목록은 항상 넣고, 검색 결과는 성공했고 비어 있지 않을 때만 붙입니다.
    /// 저장소가 비었으면 빈 문자열입니다.
    async fn build_context(&self, query: &str) -> String {
        let engine = self.engine.read().await;
        if engine.is_empty() {
            return String::new();
        }

        let mut context = String::from("Available Documents in Knowledge Base:\n");
        for source in engine.list_sources() {
            context.push_str(&format!("- {}\n", source));
        }
        context.push('\n');

        match engine.search(query, CONTEXT_TOP_K).await {
            Ok(results) if !results.is_empty() => {
                let relevant = results
                    .iter()
                    .map(|r| format!("[Source: {}]\n{}", r.source, r.text))
                    .collect::<Vec<_>>()
                    .join("\n\n");
                context.push_str("Relevant Content:\n");
                context.push_str(&relevant);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Knowledge base search failed, answering with source list only: {}", e);
            }
        }

        context
    }

    /// 생성 중단
    pub async fn stop(&self) {
        self.session.interrupt().await;
        self.presenter.set_loading(false);
        self.presenter.on_status("Stopped", StatusStyle::Stopped);
    }

    /// 수집된 문서 이름 목록
    pub async fn sources(&self) -> Vec<String> {
        self.engine.read().await.list_sources()
    }

    /// 지식베이스와 대화 이력 초기화
    pub async fn reset(&self) {
        self.engine.write().await.clear();
        self.session.clear_history();
        self.presenter.on_system_message("Knowledge base and conversation cleared.");
    }
}

// ============================================================================
// Tests
// ============================================================================
