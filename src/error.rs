//! Error type for the edgequake-pagequeue library.
//!
//! One enum covers the whole pipeline, but its variants fall into the
//! failure classes the queue treats differently:
//!
//! * **Startup** ([`PageQueueError::is_startup`]): a rasterisation backend
//!   is not present in this deployment (`pdftoppm` not installed, PDFium not
//!   bindable). The File Processor moves on to the next strategy.
//!
//! * **Rendering**: a backend started but failed or timed out. Also moves
//!   on to the next strategy; if none is left the job fails with the
//!   error's `Display` text stored in `Job::error`.
//!
//! * **API**: misuse of the queue itself (duplicate job id, invalid
//!   configuration, queue shut down). Returned directly to the caller.
//!
//! Stability timeouts and watcher/exit races are never errors; they are
//! recovered inside the primary strategy.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// All errors returned by the edgequake-pagequeue library.
#[derive(Debug, Error)]
pub enum PageQueueError {
    // ── API errors ───────────────────────────────────────────────────────
    /// A job with this id is already registered.
    #[error("Job '{job_id}' is already registered")]
    DuplicateJob { job_id: String },

    /// Job ids must be non-empty.
    #[error("Job id must not be empty")]
    EmptyJobId,

    /// Job ids name a directory under the output root, so they may not
    /// contain path separators or be `.`/`..`.
    #[error("Job id '{job_id}' is not usable as a directory name")]
    InvalidJobId { job_id: String },

    /// The scheduler task has stopped; no further jobs can be accepted.
    #[error("Job queue is shut down")]
    QueueClosed,

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Input errors ─────────────────────────────────────────────────────
    /// The upload is neither a raster image nor a PDF.
    #[error("Unsupported file '{name}' (type '{mime}')")]
    UnsupportedFile { name: String, mime: String },

    /// The uploaded file is not where the caller said it would be.
    #[error("Source file not found: '{path}'")]
    SourceMissing { path: PathBuf },

    // ── Startup errors (trigger fallback) ────────────────────────────────
    /// An external rasterisation command could not be spawned.
    #[error("'{tool}' is not available: {source}\nInstall poppler-utils or set --pdftoppm.")]
    ToolUnavailable {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    /// The embedded PDFium renderer could not be bound.
    #[error("PDFium renderer unavailable: {0}\nSet PAGEQUEUE_PDFIUM_DIR to a directory containing libpdfium.")]
    RendererUnavailable(String),

    // ── Rendering errors ─────────────────────────────────────────────────
    /// An external command ran but exited unsuccessfully.
    #[error("'{tool}' exited with {status}: {stderr}")]
    ToolFailed {
        tool: String,
        status: String,
        stderr: String,
    },

    /// The PDF could not be opened by the renderer.
    #[error("PDF '{path}' could not be opened: {detail}")]
    CorruptPdf { path: PathBuf, detail: String },

    /// A specific page failed to render or encode.
    #[error("Rasterisation failed for page {page}: {detail}")]
    RasterisationFailed { page: usize, detail: String },

    /// A strategy produced no pages for a PDF.
    #[error("'{strategy}' produced no pages for '{path}'")]
    NoPages { strategy: String, path: PathBuf },

    /// The per-file render deadline elapsed.
    #[error("'{strategy}' timed out after {}s", .after.as_secs())]
    RenderTimeout { strategy: String, after: Duration },

    /// Every configured strategy failed for a PDF; holds the last cause.
    #[error("All rasterisation strategies failed for '{name}': {last}")]
    AllStrategiesFailed {
        name: String,
        #[source]
        last: Box<PageQueueError>,
    },

    // ── I/O errors ───────────────────────────────────────────────────────
    /// Filesystem operation failed.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The output directory watcher could not be installed.
    #[error("Failed to watch '{path}': {detail}")]
    Watch { path: PathBuf, detail: String },

    // ── Catch-all ────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PageQueueError {
    /// Build an [`PageQueueError::Io`] for `path`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PageQueueError::Io {
            path: path.into(),
            source,
        }
    }

    /// True when the backend never started, as opposed to failing mid-render.
    pub fn is_startup(&self) -> bool {
        matches!(
            self,
            PageQueueError::ToolUnavailable { .. } | PageQueueError::RendererUnavailable(_)
        )
    }
}
