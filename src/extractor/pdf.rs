//! PDF 텍스트 추출 모듈
//!
//! pdf-extract 크레이트를 사용하여 PDF에서 텍스트를 추출합니다.

use std::path::Path;

use anyhow::{Context, Result};

/// PDF 파일에서 전체 텍스트 추출
///
/// 페이지별 텍스트를 줄바꿈으로 이어 붙여 반환합니다.
pub fn extract_text_from_pdf(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read PDF: {:?}", path))?;
    extract_text_from_bytes(&bytes).with_context(|| format!("Failed to extract text from PDF: {:?}", path))
}

/// 메모리의 PDF 바이트에서 텍스트 추출
pub fn extract_text_from_bytes(bytes: &[u8]) -> Result<String> {
    let text = pdf_extract::extract_text_from_mem(bytes).context("pdf-extract failed")?;

    if text.trim().is_empty() {
        tracing::warn!("No text extracted from PDF. It might be a scanned document.");
        return Ok(String::new());
    }

    Ok(join_pages(&split_pdf_pages(&text)))
}

/// 페이지 텍스트를 줄바꿈으로 연결 (각 페이지 뒤에 `\n`)
fn join_pages(pages: &[String]) -> String {
    let mut full = String::new();
    for page in pages {
        full.push_str(page);
        full.push('\n');
    }
    full
}

/// PDF 텍스트를 페이지별로 분리
fn split_pdf_pages(text: &str) -> Vec<String> {
    // 폼피드 문자 (\x0c)로 페이지 분리 시도
    let pages: Vec<String> = text
        .split('\x0c')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    if pages.len() > 1 {
        return pages;
    }

    // 페이지 구분자 패턴 (예: "--- Page 1 ---")
    if let Ok(page_pattern) =
        regex::Regex::new(r"(?m)^[\s]*[-=]+[\s]*(?:Page[\s]*)?(\d+)[\s]*[-=]+[\s]*$")
    {
        let pages: Vec<String> = page_pattern
            .split(text)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        if pages.len() > 1 {
            return pages;
        }
    }

    vec![text.trim().to_string()]
}

// ============================================================================
// Tests
// ============================================================================
