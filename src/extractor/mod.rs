//! 콘텐츠 추출 모듈
//!
//! 업로드된 문서를 `Document` 트레이트로 추상화합니다.
//! 문서는 선언된 MIME 타입, 이름, 그리고 비동기 텍스트 추출을 제공합니다.
//! - PDF 파일: pdf-extract로 텍스트 추출 (페이지 연결)
//! - 텍스트 파일: 직접 읽기

pub mod pdf;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::collector::{CollectedFile, FileType};

/// PDF MIME 타입
pub const PDF_MIME: &str = "application/pdf";

/// 일반 텍스트 MIME 타입
pub const TEXT_MIME: &str = "text/plain";

// ============================================================================
// Document Trait
// ============================================================================

/// 수집 대상 문서
#[async_trait]
pub trait Document: Send + Sync {
    /// 선언된 MIME 타입
    fn mime_type(&self) -> &str;

    /// 문서 이름 (검색 결과의 source 로 사용)
    fn name(&self) -> &str;

    /// 페이지가 연결된 평문 텍스트 추출
    async fn extract_text(&self) -> Result<String>;
}

// ============================================================================
// FileDocument
// ============================================================================

/// 디스크 파일 문서
#[derive(Debug, Clone)]
pub struct FileDocument {
    path: PathBuf,
    name: String,
    file_type: FileType,
}

impl FileDocument {
    /// 경로로 생성 (확장자로 타입 결정)
    pub fn open(path: &Path) -> Result<Self> {
        let file_type = FileType::from_path(path)
            .ok_or_else(|| anyhow::anyhow!("Unsupported file type: {:?}", path))?;
        Ok(Self::with_type(path.to_path_buf(), file_type))
    }

    fn with_type(path: PathBuf, file_type: FileType) -> Self {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();
        Self {
            path,
            name,
            file_type,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl From<CollectedFile> for FileDocument {
    fn from(file: CollectedFile) -> Self {
        Self::with_type(file.path, file.file_type)
    }
}

#[async_trait]
impl Document for FileDocument {
    fn mime_type(&self) -> &str {
        self.file_type.mime_type()
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn extract_text(&self) -> Result<String> {
        match self.file_type {
            FileType::Text => tokio::fs::read_to_string(&self.path)
                .await
                .with_context(|| format!("Failed to read text file: {:?}", self.path)),
            FileType::Pdf => {
                // PDF 추출은 CPU 바운드이므로 spawn_blocking 사용
                let path = self.path.clone();
                tokio::task::spawn_blocking(move || pdf::extract_text_from_pdf(&path))
                    .await
                    .context("PDF extraction task failed")?
            }
        }
    }
}

// ============================================================================
// MemoryDocument
// ============================================================================

/// 메모리 상의 문서 (직접 입력 텍스트)
#[derive(Debug, Clone)]
pub struct MemoryDocument {
    name: String,
    mime_type: String,
    text: String,
}

impl MemoryDocument {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            text: text.into(),
        }
    }

    /// 평문 텍스트 문서
    pub fn text(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(name, TEXT_MIME, text)
    }
}

#[async_trait]
impl Document for MemoryDocument {
    fn mime_type(&self) -> &str {
        &self.mime_type
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn extract_text(&self) -> Result<String> {
        Ok(self.text.clone())
    }
}

// ============================================================================
// Tests
// ============================================================================
