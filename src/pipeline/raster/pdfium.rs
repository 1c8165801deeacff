//! Fallback strategy: in-process rendering through the PDFium library.
//!
//! PDFium is synchronous and keeps thread-local state, so rendering runs on
//! a dedicated worker thread named `pdfium-render` (or a blocking-pool
//! thread if the OS refuses a new one). The worker renders one page at a
//! time at `dpi / 72` scale, encodes it to PNG and hands the bytes back over
//! a bounded channel. The async side writes each file atomically and reports
//! it, so a page is never visible half-written.
//!
//! The worker stops at the next page boundary once the stream is dropped.

use super::{page_file_name, RasterEvent, RasterRequest, RasterStream, Rasterizer, RenderedPage};
use crate::config::QueueConfig;
use crate::error::PageQueueError;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

type Item = Result<RasterEvent, PageQueueError>;

/// Messages from the render thread.
enum Rendered {
    PageCount(usize),
    Page { index: usize, png: Vec<u8> },
}

/// Renders with PDFium, bound at run time.
#[derive(Debug, Clone)]
pub struct PdfiumRasterizer {
    library_dir: Option<PathBuf>,
}

impl PdfiumRasterizer {
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            library_dir: config.pdfium_library_dir.clone(),
        }
    }

    async fn run(&self, request: &RasterRequest, tx: &mpsc::Sender<Item>) -> Result<(), PageQueueError> {
        let bytes = tokio::fs::read(&request.pdf_path)
            .await
            .map_err(|e| PageQueueError::io(&request.pdf_path, e))?;
        tokio::fs::create_dir_all(&request.output_dir)
            .await
            .map_err(|e| PageQueueError::io(&request.output_dir, e))?;

        let (page_tx, mut page_rx) = mpsc::channel::<Result<Rendered, PageQueueError>>(2);
        let library_dir = self.library_dir.clone();
        let pdf_path = request.pdf_path.clone();
        let scale = request.dpi as f32 / 72.0;
        spawn_render_worker(move || {
            if let Err(e) = render_document(library_dir.as_deref(), bytes, &pdf_path, scale, &page_tx) {
                let _ = page_tx.blocking_send(Err(e));
            }
        });

        let mut page_count = 0;
        let mut rendered = 0;
        while let Some(message) = page_rx.recv().await {
            match message? {
                Rendered::PageCount(count) => {
                    page_count = count;
                    if tx.send(Ok(RasterEvent::PageCount(count))).await.is_err() {
                        return Ok(());
                    }
                }
                Rendered::Page { index, png } => {
                    let page_number = index + 1;
                    let path = request
                        .output_dir
                        .join(page_file_name(&request.stem, page_number, page_count));
                    write_atomically(&path, &png).await?;
                    rendered += 1;
                    let page = RenderedPage { page_number, path };
                    if tx.send(Ok(RasterEvent::Page(page))).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }

        if rendered == 0 {
            return Err(PageQueueError::NoPages {
                strategy: self.name().to_string(),
                path: request.pdf_path.clone(),
            });
        }
        info!("PDFium rendered {} pages of {}", rendered, request.pdf_path.display());
        Ok(())
    }
}

impl Rasterizer for PdfiumRasterizer {
    fn name(&self) -> &str {
        "pdfium"
    }

    fn rasterize(&self, request: RasterRequest) -> RasterStream {
        let (tx, rx) = mpsc::channel(4);
        let this = self.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                outcome = this.run(&request, &tx) => outcome,
                _ = tx.closed() => return,
            };
            if let Err(e) = outcome {
                let _ = tx.send(Err(e)).await;
            }
        });
        Box::pin(ReceiverStream::new(rx))
    }
}

// ── Render thread ───────────────────────────────────────────────────────

/// Run `work` on a fresh named thread, or on the blocking pool if the
/// thread cannot be created.
fn spawn_render_worker<F>(work: F)
where
    F: FnOnce() + Send + 'static,
{
    let slot = Arc::new(Mutex::new(Some(work)));
    let thread_slot = Arc::clone(&slot);
    let spawned = std::thread::Builder::new()
        .name("pdfium-render".into())
        .spawn(move || {
            if let Some(work) = take(&thread_slot) {
                work();
            }
        });
    if let Err(e) = spawned {
        warn!("Could not start render thread ({}); using the blocking pool", e);
        if let Some(work) = take(&slot) {
            tokio::task::spawn_blocking(work);
        }
    }
}

fn take<F>(slot: &Mutex<Option<F>>) -> Option<F> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take()
}

fn bind_pdfium(library_dir: Option<&Path>) -> Result<Pdfium, PageQueueError> {
    let bindings = match library_dir {
        Some(dir) => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(dir))
            .or_else(|_| Pdfium::bind_to_system_library()),
        None => Pdfium::bind_to_system_library(),
    }
    .map_err(|e| PageQueueError::RendererUnavailable(format!("{:?}", e)))?;
    Ok(Pdfium::new(bindings))
}

/// Blocking: load the document and send each page as PNG bytes.
fn render_document(
    library_dir: Option<&Path>,
    bytes: Vec<u8>,
    pdf_path: &Path,
    scale: f32,
    tx: &mpsc::Sender<Result<Rendered, PageQueueError>>,
) -> Result<(), PageQueueError> {
    let pdfium = bind_pdfium(library_dir)?;
    let document = pdfium
        .load_pdf_from_byte_vec(bytes, None)
        .map_err(|e| PageQueueError::CorruptPdf {
            path: pdf_path.to_path_buf(),
            detail: format!("{:?}", e),
        })?;

    let pages = document.pages();
    let total = pages.len() as usize;
    debug!("PDFium loaded {}: {} pages", pdf_path.display(), total);
    if tx.blocking_send(Ok(Rendered::PageCount(total))).is_err() {
        return Ok(());
    }

    let render_config = PdfRenderConfig::new().scale_page_by_factor(scale);
    for index in 0..total {
        let failed = |e: PdfiumError| PageQueueError::RasterisationFailed {
            page: index + 1,
            detail: format!("{:?}", e),
        };
        let page = pages.get(page_index(index)?).map_err(failed)?;
        let bitmap = page.render_with_config(&render_config).map_err(failed)?;
        let image = bitmap.as_image();
        let png = encode_png(&image).map_err(|e| PageQueueError::RasterisationFailed {
            page: index + 1,
            detail: e.to_string(),
        })?;
        debug!(
            "Rendered page {} → {}x{} px, {} bytes",
            index + 1,
            image.width(),
            image.height(),
            png.len()
        );
        if tx.blocking_send(Ok(Rendered::Page { index, png })).is_err() {
            debug!("Render consumer gone; stopping at page {}", index + 1);
            return Ok(());
        }
    }
    Ok(())
}

/// PDFium addresses pages with a `u16`.
fn page_index(index: usize) -> Result<u16, PageQueueError> {
    u16::try_from(index).map_err(|_| PageQueueError::RasterisationFailed {
        page: index + 1,
        detail: "page index out of range for PDFium".into(),
    })
}

fn encode_png(image: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    image.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    Ok(buf)
}

/// Temp file + rename, so readers never see a partial PNG.
async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), PageQueueError> {
    let tmp_path = path.with_extension("png.tmp");
    tokio::fs::write(&tmp_path, bytes)
        .await
        .map_err(|e| PageQueueError::io(&tmp_path, e))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| PageQueueError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use image::{Rgba, RgbaImage};
    use std::time::Duration;
    use tokio::time::Instant;

    #[test]
    fn png_magic() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(4, 3, Rgba([255, 0, 0, 255])));
        let png = encode_png(&img).unwrap();
        assert!(png.starts_with(b"\x89PNG\r\n\x1a\n"));
    }

    #[test]
    fn page_index_does_not_truncate() {
        assert_eq!(page_index(0).unwrap(), 0);
        assert_eq!(page_index(65_535).unwrap(), u16::MAX);
        assert!(matches!(
            page_index(65_536),
            Err(PageQueueError::RasterisationFailed { page: 65_537, .. })
        ));
    }

    #[test]
    fn worker_runs_on_named_thread() {
        let (tx, rx) = std::sync::mpsc::channel();
        spawn_render_worker(move || {
            let name = std::thread::current().name().map(str::to_string);
            tx.send(name).unwrap();
        });
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("pdfium-render"));
    }

    #[tokio::test]
    async fn atomic_write_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan-1.png");
        write_atomically(&path, b"png").await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"png");
        assert!(!dir.path().join("plan-1.png.tmp").exists());
    }

    #[tokio::test]
    async fn unreadable_input_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let r = PdfiumRasterizer { library_dir: None };
        let request = RasterRequest {
            pdf_path: dir.path().join("missing.pdf"),
            output_dir: dir.path().join("out"),
            stem: "missing".into(),
            dpi: 72,
            deadline: Instant::now() + Duration::from_secs(5),
        };
        let items: Vec<Item> = r.rasterize(request).collect().await;
        assert!(matches!(items.as_slice(), [Err(PageQueueError::Io { .. })]));
    }
}
