//! File Processor: one uploaded file in, registered images out.
//!
//! Images are registered as-is. PDFs go through the rasterizer chain in
//! order; the first strategy that finishes without error wins. Every page is
//! registered with the job the moment its strategy reports it, so a
//! subscriber sees page 1 while page 2 is still rendering.
//!
//! A strategy that fails part-way hands over to the next one. Pages the
//! failed strategy already produced stay registered; the next strategy
//! writes the same file names, so they are replaced in place rather than
//! duplicated.

use super::classify::{classify, FileKind};
use super::raster::{parse_page_number, RasterEvent, RasterRequest, Rasterizer, RenderedPage};
use crate::config::QueueConfig;
use crate::error::PageQueueError;
use crate::job::{ImageInsert, ProcessedImage, SourceFile};
use crate::registry::JobRegistry;
use futures::StreamExt;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Drives one file at a time through classification and rasterisation.
pub struct FileProcessor {
    config: Arc<QueueConfig>,
    registry: Arc<JobRegistry>,
    strategies: Vec<Arc<dyn Rasterizer>>,
}

impl FileProcessor {
    pub fn new(
        config: Arc<QueueConfig>,
        registry: Arc<JobRegistry>,
        strategies: Vec<Arc<dyn Rasterizer>>,
    ) -> Self {
        Self {
            config,
            registry,
            strategies,
        }
    }

    /// Names of the configured strategies, in the order they are tried.
    pub fn strategy_names(&self) -> Vec<String> {
        self.strategies.iter().map(|s| s.name().to_string()).collect()
    }

    /// Process one file of `job_id`. Returns the number of new images.
    ///
    /// `names` tracks output names already used by earlier files of the same
    /// job, so two uploads called `plan.pdf` do not overwrite each other.
    pub async fn process_file(
        &self,
        job_id: &str,
        file: &SourceFile,
        names: &mut OutputNames,
    ) -> Result<usize, PageQueueError> {
        let started = Instant::now();
        self.registry.begin_file(job_id, &file.original_name);

        if tokio::fs::metadata(&file.path).await.is_err() {
            return Err(PageQueueError::SourceMissing {
                path: file.path.clone(),
            });
        }

        let produced = match classify(file).await {
            FileKind::Image => {
                let name = names.claim_file_name(&file.original_name);
                self.register_upload(job_id, file, &name, started)?;
                1
            }
            FileKind::Pdf => {
                let stem = names.claim_stem(&file.stem());
                self.rasterize(job_id, file, &stem, started).await?
            }
            FileKind::Unsupported => {
                return Err(PageQueueError::UnsupportedFile {
                    name: file.original_name.clone(),
                    mime: file.mime_type.clone(),
                })
            }
        };

        self.registry.finish_file(job_id);
        info!(
            "Job {}: '{}' produced {} image(s) in {}ms",
            job_id,
            file.original_name,
            produced,
            started.elapsed().as_millis()
        );
        Ok(produced)
    }

    fn register_upload(
        &self,
        job_id: &str,
        file: &SourceFile,
        name: &str,
        started: Instant,
    ) -> Result<(), PageQueueError> {
        let image = ProcessedImage {
            id: ProcessedImage::id_for(job_id, name),
            name: file.original_name.clone(),
            path: self.config.image_ref(job_id, name),
            page_number: None,
            processing_time: Some(elapsed_ms(started)),
            file: file.path.clone(),
        };
        self.register(job_id, image)
    }

    // ── Strategy chain ──────────────────────────────────────────────────

    async fn rasterize(
        &self,
        job_id: &str,
        file: &SourceFile,
        stem: &str,
        started: Instant,
    ) -> Result<usize, PageQueueError> {
        let mut last_error = None;
        for strategy in &self.strategies {
            if !self.registry.contains(job_id) {
                return Err(evicted(job_id));
            }
            let request = RasterRequest {
                pdf_path: file.path.clone(),
                output_dir: self.config.job_dir(job_id),
                stem: stem.to_string(),
                dpi: self.config.dpi,
                deadline: tokio::time::Instant::now() + self.config.render_timeout,
            };
            match self.drain(job_id, file, strategy.as_ref(), request, started).await {
                Ok(pages) => return Ok(pages),
                Err(e) => {
                    warn!(
                        "Job {}: '{}' failed with {}: {}",
                        job_id,
                        file.original_name,
                        strategy.name(),
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        let last = last_error
            .unwrap_or_else(|| PageQueueError::Internal("no rasterisation strategy configured".into()));
        Err(PageQueueError::AllStrategiesFailed {
            name: file.original_name.clone(),
            last: Box::new(last),
        })
    }

    /// Consume one strategy's stream until it ends, fails or runs out of time.
    async fn drain(
        &self,
        job_id: &str,
        file: &SourceFile,
        strategy: &dyn Rasterizer,
        request: RasterRequest,
        started: Instant,
    ) -> Result<usize, PageQueueError> {
        debug!("Job {}: rasterising '{}' with {}", job_id, file.original_name, strategy.name());
        let deadline = request.deadline;
        let pdf_path = request.pdf_path.clone();
        let mut stream = strategy.rasterize(request);
        let mut pages = 0;

        loop {
            let next = tokio::time::timeout_at(deadline, stream.next())
                .await
                .map_err(|_| PageQueueError::RenderTimeout {
                    strategy: strategy.name().to_string(),
                    after: self.config.render_timeout,
                })?;
            match next {
                None => break,
                Some(Err(e)) => return Err(e),
                Some(Ok(RasterEvent::PageCount(count))) => {
                    self.registry.announce_pages(job_id, count);
                }
                Some(Ok(RasterEvent::Page(page))) => {
                    let image = self.page_image(job_id, file, &page, started);
                    self.register(job_id, image)?;
                    pages += 1;
                }
            }
        }

        if pages == 0 {
            return Err(PageQueueError::NoPages {
                strategy: strategy.name().to_string(),
                path: pdf_path,
            });
        }
        Ok(pages)
    }

    fn page_image(&self, job_id: &str, file: &SourceFile, page: &RenderedPage, started: Instant) -> ProcessedImage {
        let file_name = page.file_name();
        ProcessedImage {
            id: ProcessedImage::id_for(job_id, &file_name),
            name: format!("{} - Page {}", file.original_name, page.page_number),
            path: self.config.image_ref(job_id, &file_name),
            page_number: Some(page.page_number),
            processing_time: Some(elapsed_ms(started)),
            file: page.path.clone(),
        }
    }

    fn register(&self, job_id: &str, image: ProcessedImage) -> Result<(), PageQueueError> {
        match self.registry.register_image(job_id, image) {
            ImageInsert::Added => Ok(()),
            ImageInsert::Replaced => {
                debug!("Job {}: replaced an image rendered earlier", job_id);
                Ok(())
            }
            ImageInsert::Rejected => Err(evicted(job_id)),
        }
    }
}

fn evicted(job_id: &str) -> PageQueueError {
    PageQueueError::Internal(format!("job {job_id} is no longer processing"))
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Output names handed out within one job.
///
/// Uploaded images and rendered pages share one namespace: a page of stem
/// `plan` is `plan-{n}.png`, so an upload called `plan-1.png` and the stem
/// `plan` cannot both be handed out.
#[derive(Debug, Default)]
pub struct OutputNames {
    used: HashSet<String>,
    stems: Vec<String>,
}

impl OutputNames {
    /// A page-file prefix not used by an earlier file, `plan`, `plan_2`, ...
    pub fn claim_stem(&mut self, stem: &str) -> String {
        let claimed = self.first_free(
            stem.to_string(),
            |n| format!("{stem}_{n}"),
            |candidate| self.used.iter().any(|u| parse_page_number(candidate, u).is_some()),
        );
        self.used.insert(claimed.clone());
        self.stems.push(claimed.clone());
        claimed
    }

    /// A file name not used by an earlier file, `a.png`, `a_2.png`, ...
    pub fn claim_file_name(&mut self, name: &str) -> String {
        let path = Path::new(name);
        let base = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.to_string());
        let ext = path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let claimed = self.first_free(
            name.to_string(),
            |n| format!("{base}_{n}{ext}"),
            |candidate| self.stems.iter().any(|s| parse_page_number(s, candidate).is_some()),
        );
        self.used.insert(claimed.clone());
        claimed
    }

    fn first_free(
        &self,
        first: String,
        nth: impl Fn(usize) -> String,
        clashes: impl Fn(&str) -> bool,
    ) -> String {
        let mut candidate = first;
        let mut n = 1;
        while self.used.contains(&candidate) || clashes(&candidate) {
            n += 1;
            candidate = nth(n);
        }
        candidate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stems_are_unique_within_a_job() {
        let mut names = OutputNames::default();
        assert_eq!(names.claim_stem("plan"), "plan");
        assert_eq!(names.claim_stem("plan"), "plan_2");
        assert_eq!(names.claim_stem("plan"), "plan_3");
        assert_eq!(names.claim_stem("elev"), "elev");
    }

    #[test]
    fn file_names_keep_extension() {
        let mut names = OutputNames::default();
        assert_eq!(names.claim_file_name("a.png"), "a.png");
        assert_eq!(names.claim_file_name("a.png"), "a_2.png");
        assert_eq!(names.claim_file_name("README"), "README");
        assert_eq!(names.claim_file_name("README"), "README_2");
    }

    #[test]
    fn uploads_and_page_names_do_not_overlap() {
        let mut names = OutputNames::default();
        assert_eq!(names.claim_file_name("plans-1.png"), "plans-1.png");
        assert_eq!(names.claim_stem("plans"), "plans_2");

        let mut names = OutputNames::default();
        assert_eq!(names.claim_stem("plans"), "plans");
        assert_eq!(names.claim_file_name("plans-1.png"), "plans-1_2.png");
        assert_eq!(names.claim_file_name("plans-cover.png"), "plans-cover.png");
    }
}
