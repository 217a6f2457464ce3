//! Out-of-process text extraction.
//!
//! PDFs are rasterized with `pdftoppm` and every page image is run through
//! `tesseract`. Other inputs go to `tesseract` directly. All scratch files
//! live in a per-call temp directory that is removed however the call ends.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::config::OcrConfig;
use crate::error::OcrError;

const PDF_MAGIC: &[u8] = b"%PDF-";
const PAGE_PREFIX: &str = "page";

#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// Extract plain text from a document's bytes. Empty text is a valid
    /// result.
    async fn extract(&self, data: &[u8]) -> Result<String, OcrError>;
}

/// Tesseract, with pdftoppm for PDF rasterization
pub struct TesseractEngine {
    tesseract: String,
    rasterizer: String,
    language: String,
    dpi: u32,
    timeout: Duration,
    scratch_dir: PathBuf,
}

impl TesseractEngine {
    pub fn new(config: &OcrConfig) -> Self {
        Self {
            tesseract: config.tesseract.clone(),
            rasterizer: config.rasterizer.clone(),
            language: config.language.clone(),
            dpi: config.dpi,
            timeout: config.timeout(),
            scratch_dir: config
                .scratch_dir
                .clone()
                .unwrap_or_else(std::env::temp_dir),
        }
    }

    async fn extract_in(&self, data: &[u8], workspace: &Path) -> Result<String, OcrError> {
        if !data.starts_with(PDF_MAGIC) {
            let input = workspace.join("input");
            tokio::fs::write(&input, data)
                .await
                .map_err(OcrError::Workspace)?;
            return self.recognize(&input).await;
        }

        let input = workspace.join("input.pdf");
        tokio::fs::write(&input, data)
            .await
            .map_err(OcrError::Workspace)?;

        let pages_dir = workspace.join("pages");
        tokio::fs::create_dir(&pages_dir)
            .await
            .map_err(OcrError::Workspace)?;

        let mut rasterize = Command::new(&self.rasterizer);
        rasterize
            .arg("-r")
            .arg(self.dpi.to_string())
            .arg("-png")
            .arg(&input)
            .arg(pages_dir.join(PAGE_PREFIX));
        run(&self.rasterizer, rasterize).await?;

        let pages = page_images(&pages_dir).await?;
        if pages.is_empty() {
            return Err(OcrError::NoPages);
        }
        debug!(pages = pages.len(), "Rasterized PDF");

        let mut texts = Vec::with_capacity(pages.len());
        for page in &pages {
            texts.push(self.recognize(page).await?);
        }
        Ok(texts.join("\n").trim().to_string())
    }

    async fn recognize(&self, image: &Path) -> Result<String, OcrError> {
        let mut tesseract = Command::new(&self.tesseract);
        tesseract
            .arg(image)
            .arg("stdout")
            .arg("-l")
            .arg(&self.language);
        let stdout = run(&self.tesseract, tesseract).await?;
        Ok(String::from_utf8_lossy(&stdout).trim().to_string())
    }
}

#[async_trait]
impl OcrEngine for TesseractEngine {
    #[instrument(skip_all, fields(bytes = data.len()))]
    async fn extract(&self, data: &[u8]) -> Result<String, OcrError> {
        let started = Instant::now();
        let workspace = tempfile::Builder::new()
            .prefix("scribe-ocr-")
            .tempdir_in(&self.scratch_dir)
            .map_err(OcrError::Workspace)?;

        // Children are spawned with kill_on_drop, so hitting the deadline
        // drops and kills whichever one is running.
        let result = tokio::time::timeout(self.timeout, self.extract_in(data, workspace.path()))
            .await
            .unwrap_or(Err(OcrError::Timeout {
                secs: self.timeout.as_secs(),
            }));

        close_workspace(workspace);
        metrics::histogram!("scribe_ocr_duration_seconds").record(started.elapsed().as_secs_f64());
        result
    }
}

fn close_workspace(workspace: TempDir) {
    let path = workspace.path().to_path_buf();
    if let Err(e) = workspace.close() {
        tracing::warn!(path = %path.display(), error = %e, "Failed to remove OCR workspace");
    }
}

/// Run a command to completion and return its stdout.
async fn run(program: &str, mut command: Command) -> Result<Vec<u8>, OcrError> {
    let output = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| OcrError::Spawn {
            program: program.to_string(),
            source,
        })?;

    if !output.status.success() {
        return Err(OcrError::EngineFailed {
            program: program.to_string(),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output.stdout)
}

/// Page images written by the rasterizer, in page order.
async fn page_images(dir: &Path) -> Result<Vec<PathBuf>, OcrError> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(OcrError::Workspace)?;

    let mut pages = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(OcrError::Workspace)? {
        let path = entry.path();
        if let Some(number) = page_number(&path) {
            pages.push((number, path));
        }
    }
    pages.sort_by_key(|(number, _)| *number);
    Ok(pages.into_iter().map(|(_, path)| path).collect())
}

/// `page-07.png` → 7
fn page_number(path: &Path) -> Option<u32> {
    if path.extension()? != "png" {
        return None;
    }
    path.file_stem()?
        .to_str()?
        .strip_prefix(PAGE_PREFIX)?
        .trim_start_matches('-')
        .parse()
        .ok()
}
