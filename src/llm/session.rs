//! Generation Session - 대화 이력과 스트리밍 생성
//!
//! 백엔드 가용성 상태 머신:
//!
//! ```text
//! Uninitialized ──send/warm_up──▶ Initializing ──ok──▶ Ready
//!       ▲                              │                  │ disposed
//!       └──────────── 실패 ────────────┘                  ▼
//!                                   Initializing ◀────── Lost
//! ```
//!
//! 백엔드 소실 시 오래된 핸들을 버리고 한 번만 재생성한 뒤 같은 요청을 다시 보냅니다.
//! 재시도도 실패하면 호출자에게 그대로 전달합니다.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::{BoxFuture, FutureExt, Shared};
use futures::StreamExt;

use crate::error::{RagError, RagResult};

use super::{
    log_progress, BackendFactory, ChatBackend, ChatMessage, GenerationOptions, ProgressCallback,
};

/// 복구 중임을 알리는 부분 출력
const RECOVERY_NOTICE: &str =
    "\n\n**[System: Inference backend lost. Rebooting model, please wait...]**";

// ============================================================================
// Backend State
// ============================================================================

/// 외부에 노출되는 백엔드 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendStatus {
    Uninitialized,
    Initializing,
    Ready,
    Lost,
}

type PendingBackend = Shared<BoxFuture<'static, Result<Arc<dyn ChatBackend>, String>>>;

enum BackendSlot {
    Uninitialized,
    /// 진행 중인 초기화 (동시 호출자는 같은 핸들을 기다림)
    Initializing { attempt: u64, pending: PendingBackend },
    Ready(Arc<dyn ChatBackend>),
    Lost,
}

// ============================================================================
// GenerationSession
// ============================================================================

/// 생성 세션
///
/// 대화 이력과 추론 백엔드 핸들을 단독으로 소유합니다.
/// 시스템 프롬프트는 이력에 저장하지 않고 매 요청마다 앞에 붙입니다.
pub struct GenerationSession {
    factory: Arc<dyn BackendFactory>,
    model_id: String,
    on_progress: ProgressCallback,
    slot: Mutex<BackendSlot>,
    attempts: AtomicU64,
    history: Mutex<Vec<ChatMessage>>,
    generating: AtomicBool,
    interrupted: AtomicBool,
}

impl GenerationSession {
    /// 새 세션 (백엔드는 첫 사용 시 생성)
    pub fn new(factory: Arc<dyn BackendFactory>, model_id: impl Into<String>) -> Self {
        Self {
            factory,
            model_id: model_id.into(),
            on_progress: log_progress(),
            slot: Mutex::new(BackendSlot::Uninitialized),
            attempts: AtomicU64::new(0),
            history: Mutex::new(Vec::new()),
            generating: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
        }
    }

    /// `send` 도중의 (재)초기화 진행률을 받을 콜백 지정
    pub fn with_progress(mut self, on_progress: ProgressCallback) -> Self {
        self.on_progress = on_progress;
        self
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// 현재 백엔드 상태
    pub fn status(&self) -> BackendStatus {
        match &*lock(&self.slot) {
            BackendSlot::Uninitialized => BackendStatus::Uninitialized,
            BackendSlot::Initializing { .. } => BackendStatus::Initializing,
            BackendSlot::Ready(_) => BackendStatus::Ready,
            BackendSlot::Lost => BackendStatus::Lost,
        }
    }

    pub fn is_generating(&self) -> bool {
        self.generating.load(Ordering::SeqCst)
    }

    /// 대화 이력 스냅샷
    pub fn history(&self) -> Vec<ChatMessage> {
        lock(&self.history).clone()
    }

    /// 대화 이력 초기화
    pub fn clear_history(&self) {
        lock(&self.history).clear();
    }

    /// 백엔드 미리 로드
    ///
    /// 이미 초기화 중이면 같은 초기화를 기다립니다.
    pub async fn warm_up(&self, on_progress: ProgressCallback) -> RagResult<()> {
        self.ensure_ready(on_progress).await.map(|_| ())
    }

    async fn ensure_ready(&self, on_progress: ProgressCallback) -> RagResult<Arc<dyn ChatBackend>> {
        let (attempt, pending) = {
            let mut slot = lock(&self.slot);
            match &*slot {
                BackendSlot::Ready(backend) => return Ok(backend.clone()),
                BackendSlot::Initializing { attempt, pending } => (*attempt, pending.clone()),
                BackendSlot::Uninitialized | BackendSlot::Lost => {
                    let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
                    let pending = self.start_backend(on_progress);
                    *slot = BackendSlot::Initializing {
                        attempt,
                        pending: pending.clone(),
                    };
                    (attempt, pending)
                }
            }
        };

        let outcome = pending.await;

        let mut slot = lock(&self.slot);
        let current = matches!(&*slot, BackendSlot::Initializing { attempt: a, .. } if *a == attempt);

        match outcome {
            Ok(backend) => {
                if current {
                    *slot = BackendSlot::Ready(backend.clone());
                }
                Ok(backend)
            }
            Err(reason) => {
                // 실패는 캐시하지 않음: 다음 호출이 다시 시도
                if current {
                    *slot = BackendSlot::Uninitialized;
                }
                Err(RagError::BackendInit(reason))
            }
        }
    }

    fn start_backend(&self, on_progress: ProgressCallback) -> PendingBackend {
        let factory = self.factory.clone();
        let model_id = self.model_id.clone();

        async move {
            tracing::info!("Initializing inference backend {}...", model_id);
            match factory.construct(&model_id, on_progress).await {
                Ok(backend) => {
                    tracing::info!("Inference backend {} initialized", model_id);
                    Ok(backend)
                }
                Err(e) => {
                    tracing::error!("Failed to initialize inference backend: {:#}", e);
                    Err(format!("{:#}", e))
                }
            }
        }
        .boxed()
        .shared()
    }

    // 소실된 핸들을 버림 (이미 다른 핸들로 교체되었으면 그대로 둠)
    fn discard_backend(&self, stale: &Arc<dyn ChatBackend>) {
        let mut slot = lock(&self.slot);
        if let BackendSlot::Ready(current) = &*slot {
            if Arc::ptr_eq(current, stale) {
                *slot = BackendSlot::Lost;
            }
        }
    }

    /// 메시지 전송 및 스트리밍 응답
    ///
    /// `on_partial`은 델타가 도착할 때마다 누적된 전체 텍스트로 호출됩니다.
    /// 중단되면 `RagError::Interrupted`를 반환하며 그 뒤로는 호출되지 않습니다.
    /// 실패하거나 중단된 턴은 이력에 사용자 턴만 남깁니다.
    pub async fn send<F>(
        &self,
        user_message: &str,
        context: &str,
        options: &GenerationOptions,
        on_partial: F,
    ) -> RagResult<String>
    where
        F: Fn(&str) + Send + Sync,
    {
        options.validate()?;

        if self.generating.swap(true, Ordering::SeqCst) {
            return Err(RagError::SessionBusy);
        }
        let _busy = BusyGuard(&self.generating);
        self.interrupted.store(false, Ordering::SeqCst);

        let backend = self.ensure_ready(self.on_progress.clone()).await?;

        let messages = {
            let mut history = lock(&self.history);
            history.push(ChatMessage::user(compose_user_content(user_message, context)));
            request_messages(&history, options)
        };
        tracing::debug!("Using system prompt: {}", options.system_prompt);

        let reply = match self
            .stream_reply(&backend, &messages, options.temperature, &on_partial)
            .await
        {
            Err(RagError::BackendLost(reason)) => {
                tracing::warn!("Inference backend lost ({}). Attempting recovery...", reason);
                on_partial(RECOVERY_NOTICE);

                self.discard_backend(&backend);
                drop(backend);

                // 재시도는 한 번만
                let backend = self.ensure_ready(self.on_progress.clone()).await?;
                match self
                    .stream_reply(&backend, &messages, options.temperature, &on_partial)
                    .await
                {
                    Err(RagError::BackendLost(reason)) => {
                        self.discard_backend(&backend);
                        Err(RagError::GenerationFailed(format!(
                            "backend lost again after recovery: {}",
                            reason
                        )))
                    }
                    other => other,
                }
            }
            other => other,
        }?;

        lock(&self.history).push(ChatMessage::assistant(reply.clone()));
        Ok(reply)
    }

    async fn stream_reply<F>(
        &self,
        backend: &Arc<dyn ChatBackend>,
        messages: &[ChatMessage],
        temperature: f32,
        on_partial: &F,
    ) -> RagResult<String>
    where
        F: Fn(&str) + Send + Sync,
    {
        if self.was_interrupted() {
            return Err(RagError::Interrupted);
        }

        tracing::debug!(
            "Streaming reply from {} ({} messages)",
            backend.model_id(),
            messages.len()
        );
        let mut deltas = backend.stream_chat(messages, temperature).await?;
        let mut full = String::new();

        while let Some(delta) = deltas.next().await {
            if self.was_interrupted() {
                return Err(RagError::Interrupted);
            }
            full.push_str(&delta?);
            on_partial(&full);
        }

        if self.was_interrupted() {
            return Err(RagError::Interrupted);
        }
        Ok(full)
    }

    fn was_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// 진행 중인 생성 중단
    ///
    /// 백엔드가 없거나 생성 중이 아니면 아무 일도 하지 않으며, 여러 번 호출해도 안전합니다.
    pub async fn interrupt(&self) {
        if !self.is_generating() {
            return;
        }
        self.interrupted.store(true, Ordering::SeqCst);

        let backend = match &*lock(&self.slot) {
            BackendSlot::Ready(backend) => Some(backend.clone()),
            _ => None,
        };

        if let Some(backend) = backend {
            backend.interrupt().await;
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 컨텍스트가 있으면 질문을 RAG 템플릿으로 감쌈
pub fn compose_user_content(user_message: &str, context: &str) -> String {
    if context.is_empty() {
        return user_message.to_string();
    }

    format!(
        "Here is some relevant context from the provided documents:\n{}\n\n\
         Based on this context, please answer the following question:\n{}",
        context, user_message
    )
    .trim()
    .to_string()
}

fn request_messages(history: &[ChatMessage], options: &GenerationOptions) -> Vec<ChatMessage> {
    std::iter::once(ChatMessage::system(options.system_prompt.as_str()))
        .chain(history.iter().cloned())
        .collect()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// ============================================================================
// Tests
// ============================================================================
