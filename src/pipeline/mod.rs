//! Pipeline stages that turn one uploaded file into page images.
//!
//! Each submodule implements one step, so a rendering backend can be swapped
//! without touching classification, registration or the queue.
//!
//! ## Data Flow
//!
//! ```text
//!              ┌─ image ──────────────────────────────▶ register as-is
//! classify ────┤
//!              └─ pdf ──▶ raster::poppler ──(fails)──▶ raster::pdfium
//!                          │  pdftoppm + watcher           │  embedded PDFium
//!                          │  + stability                  │  worker thread
//!                          └──────────────┬────────────────┘
//!                                         ▼
//!                          processor: register each page as it lands
//! ```
//!
//! 1. [`classify`]: decide image / PDF / unsupported from MIME type,
//!    extension and magic bytes
//! 2. [`raster`]: the [`raster::Rasterizer`] strategy trait and its two
//!    implementations, each a lazy stream of page events
//! 3. [`stability`]: wait until a file written by another process stops
//!    growing; used only by the `pdftoppm` watcher
//! 4. [`processor`]: runs the strategy chain and records every page on the
//!    job the moment it is available

pub mod classify;
pub mod processor;
pub mod raster;
pub mod stability;
