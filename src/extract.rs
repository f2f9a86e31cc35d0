//! PDF text extraction backends.
//!
//! Native text comes from `pdftotext`, which separates pages with form feeds.
//! Scanned documents are rasterized with PDFium and recognized with
//! `tesseract`, one page image at a time.

use std::{
    io::ErrorKind,
    panic,
    path::{Path, PathBuf},
    process::Command,
};

use image::ImageFormat;
use pdfium_render::prelude::*;
use thiserror::Error;

pub const PAGE_BREAK: char = '\u{c}';

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("{0} is not installed")]
    ToolMissing(&'static str),
    #[error("{tool} failed with {status}: {stderr}")]
    ToolFailed {
        tool: &'static str,
        status: String,
        stderr: String,
    },
    #[error("pdf error: {0}")]
    Pdf(String),
    #[error("image error: {0}")]
    Image(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Blocking extraction primitives. Callers run these on the blocking pool.
pub trait PdfEngine: Send + Sync + 'static {
    /// Text of pages `1..=pages`.
    fn sample_text(&self, pdf: &Path, pages: u32) -> Result<String, ExtractError>;

    /// Text of the whole document, pages separated by [`PAGE_BREAK`].
    fn extract_text(&self, pdf: &Path) -> Result<String, ExtractError>;

    fn page_count(&self, pdf: &Path) -> Result<u32, ExtractError>;

    /// Renders every page to a PNG inside `out_dir`, in page order.
    fn render_pages(&self, pdf: &Path, out_dir: &Path, dpi: u32)
        -> Result<Vec<PathBuf>, ExtractError>;

    fn recognize(&self, image: &Path, language: &str) -> Result<String, ExtractError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CliPdfEngine;

impl CliPdfEngine {
    pub fn new() -> Self {
        Self
    }
}

impl PdfEngine for CliPdfEngine {
    fn sample_text(&self, pdf: &Path, pages: u32) -> Result<String, ExtractError> {
        let last = pages.max(1).to_string();
        run_tool(
            "pdftotext",
            Command::new("pdftotext")
                .args(["-enc", "UTF-8", "-f", "1", "-l", last.as_str()])
                .arg(pdf)
                .arg("-"),
        )
    }

    fn extract_text(&self, pdf: &Path) -> Result<String, ExtractError> {
        run_tool(
            "pdftotext",
            Command::new("pdftotext")
                .args(["-enc", "UTF-8"])
                .arg(pdf)
                .arg("-"),
        )
    }

    fn page_count(&self, pdf: &Path) -> Result<u32, ExtractError> {
        let pdfium = load_pdfium()?;
        let document = pdfium
            .load_pdf_from_file(pdf, None)
            .map_err(|err| ExtractError::Pdf(format!("load pdf: {err}")))?;
        Ok(u32::from(document.pages().len()))
    }

    fn render_pages(
        &self,
        pdf: &Path,
        out_dir: &Path,
        dpi: u32,
    ) -> Result<Vec<PathBuf>, ExtractError> {
        let pdfium = load_pdfium()?;
        let document = pdfium
            .load_pdf_from_file(pdf, None)
            .map_err(|err| ExtractError::Pdf(format!("load pdf: {err}")))?;

        let render_config = PdfRenderConfig::new()
            .scale_page_by_factor(dpi.max(1) as f32 / 72.0)
            .render_form_data(true);

        let mut images = Vec::new();
        for (index, page) in document.pages().iter().enumerate() {
            let bitmap = page
                .render_with_config(&render_config)
                .map_err(|err| ExtractError::Pdf(format!("render page {}: {err}", index + 1)))?;
            let path = out_dir.join(format!("page-{:04}.png", index + 1));
            image::DynamicImage::ImageRgb8(bitmap.as_image().to_rgb8())
                .save_with_format(&path, ImageFormat::Png)
                .map_err(|err| ExtractError::Image(err.to_string()))?;
            images.push(path);
        }

        Ok(images)
    }

    fn recognize(&self, image: &Path, language: &str) -> Result<String, ExtractError> {
        run_tool(
            "tesseract",
            Command::new("tesseract")
                .arg(image)
                .arg("stdout")
                .args(["-l", language]),
        )
    }
}

fn load_pdfium() -> Result<Pdfium, ExtractError> {
    panic::catch_unwind(Pdfium::default)
        .map_err(|_| ExtractError::Pdf("failed to initialize PDFium".to_string()))
}

fn run_tool(tool: &'static str, command: &mut Command) -> Result<String, ExtractError> {
    let output = command.output().map_err(|err| {
        if err.kind() == ErrorKind::NotFound {
            ExtractError::ToolMissing(tool)
        } else {
            ExtractError::Io(err)
        }
    })?;

    if !output.status.success() {
        return Err(ExtractError::ToolFailed {
            tool,
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Non-whitespace character count, the measure used to tell text PDFs from scans.
pub fn meaningful_chars(text: &str) -> usize {
    text.chars().filter(|ch| !ch.is_whitespace()).count()
}

/// Splits `pdftotext` output into `(page_number, text)` pairs, dropping pages
/// with no text. Page numbers keep their position in the document.
pub fn split_text_pages(text: &str) -> Vec<(i32, String)> {
    text.split(PAGE_BREAK)
        .enumerate()
        .filter_map(|(index, page)| {
            let trimmed = page.trim();
            (!trimmed.is_empty()).then(|| (index as i32 + 1, trimmed.to_string()))
        })
        .collect()
}
