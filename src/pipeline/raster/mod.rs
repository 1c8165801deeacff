//! Rasterisation strategies: PDF in, a lazy stream of page images out.
//!
//! Every strategy writes pages into `request.output_dir` under the same
//! naming scheme, `"{stem}-{page}.png"` with the page number zero-padded to
//! the width of the page count (the convention `pdftoppm` uses). Output ids
//! are derived from those names, so a fallback run produces the same ids a
//! primary run would have.
//!
//! A strategy never registers anything itself. It reports what it sees as
//! [`RasterEvent`]s and the File Processor decides what to do with them.
//! Dropping the stream cancels the work and releases every resource the
//! strategy holds (child process, watcher, render thread).

pub mod pdfium;
pub mod poppler;

pub use pdfium::PdfiumRasterizer;
pub use poppler::PopplerRasterizer;

use crate::error::PageQueueError;
use futures::Stream;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tokio::time::Instant;

/// A boxed stream of rasterisation events.
pub type RasterStream = Pin<Box<dyn Stream<Item = Result<RasterEvent, PageQueueError>> + Send>>;

/// Input for one strategy run.
#[derive(Debug, Clone)]
pub struct RasterRequest {
    pub pdf_path: PathBuf,
    /// Directory the page images are written to; created if missing.
    pub output_dir: PathBuf,
    /// Output file name prefix.
    pub stem: String,
    pub dpi: u32,
    /// The File Processor stops waiting at this instant. Strategies may use
    /// it to bound their own internal waits.
    pub deadline: Instant,
}

/// What a strategy reports while it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RasterEvent {
    /// The document's page count, as soon as it is known. At most once.
    PageCount(usize),
    /// A finished page whose file is complete on disk.
    Page(RenderedPage),
}

/// One complete output page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPage {
    /// 1-based.
    pub page_number: usize,
    pub path: PathBuf,
}

impl RenderedPage {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// A way of turning a PDF into page images.
///
/// `rasterize` returns immediately; the work starts when the stream is
/// first polled or shortly after, on a task the strategy owns. Startup
/// failures (missing tool, unloadable library) arrive as the first item.
pub trait Rasterizer: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &str;

    fn rasterize(&self, request: RasterRequest) -> RasterStream;
}

// ── Page file naming ────────────────────────────────────────────────────

/// Output name for `page` of a document with `page_count` pages.
pub fn page_file_name(stem: &str, page: usize, page_count: usize) -> String {
    let width = digits(page_count.max(page));
    format!("{stem}-{page:0width$}.png")
}

fn digits(mut n: usize) -> usize {
    let mut d = 1;
    while n >= 10 {
        n /= 10;
        d += 1;
    }
    d
}

/// Parse the page number out of an output name written for `stem`.
///
/// Accepts any zero padding, so names can be matched before the page count
/// is known.
pub fn parse_page_number(stem: &str, file_name: &str) -> Option<usize> {
    let digits = file_name
        .strip_prefix(stem)?
        .strip_prefix('-')?
        .strip_suffix(".png")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().filter(|&n| n > 0)
}

/// Every page for `stem` currently in `dir`, sorted by page number.
pub async fn list_pages(dir: &Path, stem: &str) -> Result<Vec<RenderedPage>, PageQueueError> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| PageQueueError::io(dir, e))?;
    let mut pages = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| PageQueueError::io(dir, e))?
    {
        let name = entry.file_name();
        if let Some(page_number) = parse_page_number(stem, &name.to_string_lossy()) {
            pages.push(RenderedPage {
                page_number,
                path: entry.path(),
            });
        }
    }
    pages.sort_by_key(|p| p.page_number);
    Ok(pages)
}
