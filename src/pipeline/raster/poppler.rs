//! Primary strategy: the external `pdftoppm` tool from poppler-utils.
//!
//! `pdftoppm` writes `{prefix}-{n}.png` files one after another. A
//! filesystem watcher on the output directory sees each file appear; the
//! page is reported once the stability detector says the file stopped
//! growing, or once the stability wait gives up. When the child exits the
//! directory is listed once more and any page the watcher missed is
//! reported then, in page order.
//!
//! `pdfinfo` is asked for the page count before rendering starts. If it is
//! missing or fails, rendering proceeds without an announced count.

use super::{list_pages, parse_page_number, RasterEvent, RasterRequest, RasterStream, Rasterizer, RenderedPage};
use crate::config::QueueConfig;
use crate::error::PageQueueError;
use crate::pipeline::stability::wait_until_stable;
use futures::stream::{FuturesUnordered, StreamExt};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

type Item = Result<RasterEvent, PageQueueError>;

static RE_PAGES: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^Pages:\s+(\d+)\s*$").unwrap());

/// Renders with `pdftoppm -png -r <dpi>`.
#[derive(Debug, Clone)]
pub struct PopplerRasterizer {
    pdftoppm: PathBuf,
    pdfinfo: PathBuf,
    poll_interval: Duration,
    stability_timeout: Duration,
}

impl PopplerRasterizer {
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            pdftoppm: config.pdftoppm_path.clone(),
            pdfinfo: config.pdfinfo_path.clone(),
            poll_interval: config.stability_poll_interval,
            stability_timeout: config.stability_timeout,
        }
    }

    /// Page count reported by `pdfinfo`, or `None` if it cannot tell.
    pub async fn probe_page_count(&self, pdf: &Path) -> Option<usize> {
        let output = match Command::new(&self.pdfinfo)
            .arg(pdf)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
        {
            Ok(output) => output,
            Err(e) => {
                debug!("{} unavailable: {}", self.pdfinfo.display(), e);
                return None;
            }
        };
        if !output.status.success() {
            debug!(
                "{} failed on {}: {}",
                self.pdfinfo.display(),
                pdf.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return None;
        }
        parse_pdfinfo_pages(&String::from_utf8_lossy(&output.stdout))
    }

    async fn run(&self, request: &RasterRequest, tx: &mpsc::Sender<Item>) -> Result<(), PageQueueError> {
        let RasterRequest {
            pdf_path,
            output_dir,
            stem,
            dpi,
            ..
        } = request;

        if let Some(count) = self.probe_page_count(pdf_path).await {
            debug!("pdfinfo: {} has {} pages", pdf_path.display(), count);
            if tx.send(Ok(RasterEvent::PageCount(count))).await.is_err() {
                return Ok(());
            }
        }

        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(|e| PageQueueError::io(output_dir, e))?;

        // ── Watch before spawning so no page is written unobserved ──────
        let (fs_tx, mut fs_rx) = mpsc::unbounded_channel::<PathBuf>();
        let watcher = match watch_dir(output_dir, fs_tx) {
            Ok(w) => Some(w),
            Err(e) => {
                warn!("{}; collecting pages after pdftoppm exits", e);
                None
            }
        };

        // ── Spawn pdftoppm ──────────────────────────────────────────────
        let mut child = Command::new(&self.pdftoppm)
            .arg("-png")
            .arg("-r")
            .arg(dpi.to_string())
            .arg(pdf_path)
            .arg(output_dir.join(stem))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| PageQueueError::ToolUnavailable {
                tool: self.pdftoppm.display().to_string(),
                source,
            })?;

        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(mut pipe) = stderr {
                let _ = pipe.read_to_string(&mut buf).await;
            }
            buf
        });

        // ── Report pages as they settle ─────────────────────────────────
        let mut emitted = HashSet::new();
        let mut checking = HashSet::new();
        let mut checks = FuturesUnordered::new();

        let status = loop {
            tokio::select! {
                status = child.wait() => {
                    break status.map_err(|e| PageQueueError::io(pdf_path, e))?;
                }
                Some(path) = fs_rx.recv() => {
                    let Some(page_number) = page_number_of(&path, stem) else {
                        continue;
                    };
                    if !emitted.contains(&page_number) && checking.insert(page_number) {
                        checks.push(settle(page_number, path, self.poll_interval, self.stability_timeout));
                    }
                }
                Some((page_number, path)) = checks.next(), if !checks.is_empty() => {
                    checking.remove(&page_number);
                    if !emit(tx, &mut emitted, page_number, path).await {
                        return Ok(());
                    }
                }
            }
        };
        drop(watcher);

        if !status.success() {
            let stderr = stderr_task.await.unwrap_or_default();
            return Err(PageQueueError::ToolFailed {
                tool: "pdftoppm".into(),
                status: status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }

        // The writer is gone; in-flight checks settle on their next poll.
        while let Some((page_number, path)) = checks.next().await {
            if !emit(tx, &mut emitted, page_number, path).await {
                return Ok(());
            }
        }

        if !reconcile(output_dir, stem, tx, &mut emitted).await? {
            return Ok(());
        }

        if emitted.is_empty() {
            return Err(PageQueueError::NoPages {
                strategy: self.name().to_string(),
                path: pdf_path.clone(),
            });
        }
        info!("pdftoppm rendered {} pages of {}", emitted.len(), pdf_path.display());
        Ok(())
    }
}

impl Rasterizer for PopplerRasterizer {
    fn name(&self) -> &str {
        "pdftoppm"
    }

    fn rasterize(&self, request: RasterRequest) -> RasterStream {
        let (tx, rx) = mpsc::channel(16);
        let this = self.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                outcome = this.run(&request, &tx) => outcome,
                // Stream dropped: abandoning `run` kills the child.
                _ = tx.closed() => return,
            };
            if let Err(e) = outcome {
                let _ = tx.send(Err(e)).await;
            }
        });
        Box::pin(ReceiverStream::new(rx))
    }
}

fn parse_pdfinfo_pages(stdout: &str) -> Option<usize> {
    RE_PAGES
        .captures(stdout)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn watch_dir(dir: &Path, events: mpsc::UnboundedSender<PathBuf>) -> Result<RecommendedWatcher, PageQueueError> {
    let watch_err = |e: notify::Error| PageQueueError::Watch {
        path: dir.to_path_buf(),
        detail: e.to_string(),
    };
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
        Ok(event) if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) => {
            for path in event.paths {
                let _ = events.send(path);
            }
        }
        Ok(_) => {}
        Err(e) => debug!("watch error: {}", e),
    })
    .map_err(watch_err)?;
    watcher
        .watch(dir, RecursiveMode::NonRecursive)
        .map_err(watch_err)?;
    Ok(watcher)
}

fn page_number_of(path: &Path, stem: &str) -> Option<usize> {
    parse_page_number(stem, &path.file_name()?.to_string_lossy())
}

/// Wait for a page to stop growing. A page that never settles is still
/// reported once the wait gives up.
async fn settle(page_number: usize, path: PathBuf, interval: Duration, timeout: Duration) -> (usize, PathBuf) {
    if !wait_until_stable(&path, interval, timeout).await {
        debug!("Page {} reported without a stable size", page_number);
    }
    (page_number, path)
}

/// Report every page on disk the watcher missed, in page order.
/// Returns `false` when the consumer has gone away.
async fn reconcile(
    dir: &Path,
    stem: &str,
    tx: &mpsc::Sender<Item>,
    emitted: &mut HashSet<usize>,
) -> Result<bool, PageQueueError> {
    for page in list_pages(dir, stem).await? {
        if emitted.contains(&page.page_number) {
            continue;
        }
        debug!("Page {} found after exit", page.page_number);
        if !emit(tx, emitted, page.page_number, page.path).await {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Report a page once. Returns `false` when the consumer has gone away.
async fn emit(tx: &mpsc::Sender<Item>, emitted: &mut HashSet<usize>, page_number: usize, path: PathBuf) -> bool {
    if !emitted.insert(page_number) {
        return true;
    }
    debug!("Page {} ready: {}", page_number, path.display());
    tx.send(Ok(RasterEvent::Page(RenderedPage { page_number, path })))
        .await
        .is_ok()
}
