//! # edgequake-pagequeue
//!
//! An in-process job queue that turns uploaded documents into page images.
//!
//! ## Why this crate?
//!
//! Drawing sets arrive as multi-page PDFs mixed with photos and scans, and
//! a user waiting on a 40-page plan set wants to see page 1 long before
//! page 40 is done. This crate accepts a batch of uploads as one job,
//! rasterises PDFs page by page with `pdftoppm` (falling back to an embedded
//! PDFium when poppler is missing or fails), and pushes every page to
//! subscribers the moment its file is complete on disk.
//!
//! ## Pipeline Overview
//!
//! ```text
//! submit(job_id, files)
//!  │
//!  ├─ 1. Queue     FIFO, one job at a time, files in order
//!  ├─ 2. Classify  image → register as-is, PDF → rasterise, else fail
//!  ├─ 3. Render    pdftoppm + dir watcher + stability check
//!  │               └─ on failure: PDFium on a worker thread
//!  ├─ 4. Register  each page attached to the job as soon as it lands
//!  └─ 5. Notify    status / progress / image / error events per job
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_pagequeue::{PageQueue, QueueConfig, SourceFile};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let queue = PageQueue::new(QueueConfig::builder().dpi(150).build()?);
//!     queue.submit("job-1", vec![SourceFile::from_path("plans.pdf")?])?;
//!
//!     let done = queue.wait("job-1").await.expect("job exists");
//!     for image in &done.processed_images {
//!         println!("{} → {}", image.name, image.path);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pagequeue` binary (clap + indicatif + tracing-subscriber) |
//!
//! ## Runtime Requirements
//!
//! | Backend | Needs | Role |
//! |---------|-------|------|
//! | `pdftoppm` | poppler-utils on `PATH` | Primary; `pdfinfo` optional for early page counts |
//! | PDFium | `libpdfium` in `PAGEQUEUE_PDFIUM_DIR` or system paths | Fallback |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod events;
pub mod job;
pub mod pipeline;
pub mod queue;
pub mod registry;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{QueueConfig, QueueConfigBuilder};
pub use error::PageQueueError;
pub use events::{EventHandler, JobEvent, JobEventHandler, JobSubscription, SubscriptionId};
pub use job::{JobProgress, JobSnapshot, JobStatus, ProcessedImage, SourceFile};
pub use pipeline::raster::{
    PdfiumRasterizer, PopplerRasterizer, RasterEvent, RasterRequest, RasterStream, Rasterizer,
    RenderedPage,
};
pub use queue::{new_job_id, PageQueue, PageQueueBuilder};
pub use registry::JobStats;
