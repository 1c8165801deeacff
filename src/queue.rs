//! The queue service: submission, scheduling, queries and maintenance.
//!
//! [`PageQueue`] is an explicitly constructed value, not a process-wide
//! singleton. Construction spawns one scheduler task on the current Tokio
//! runtime; jobs are taken from an unbounded channel and processed one at a
//! time, files within a job in submission order.
//!
//! ```text
//! submit ─▶ registry (pending) ─▶ channel ─▶ scheduler ─▶ FileProcessor
//!                 ▲                                            │
//!                 └────────── images, progress, status ────────┘
//! ```

use crate::config::QueueConfig;
use crate::error::PageQueueError;
use crate::events::{EventHandler, JobSubscription, SubscriptionId};
use crate::job::{Job, JobSnapshot, SourceFile};
use crate::pipeline::processor::{FileProcessor, OutputNames};
use crate::pipeline::raster::{PdfiumRasterizer, PopplerRasterizer, Rasterizer};
use crate::registry::{JobRegistry, JobStats};
use chrono::Utc;
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A fresh random job id.
pub fn new_job_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Builder for [`PageQueue`]; see [`PageQueue::builder`].
pub struct PageQueueBuilder {
    config: QueueConfig,
    strategies: Vec<Arc<dyn Rasterizer>>,
}

impl PageQueueBuilder {
    /// Append a rasterisation strategy. Strategies are tried in the order
    /// they are added. With none added, the default chain is `pdftoppm`
    /// followed by PDFium.
    pub fn strategy(mut self, strategy: Arc<dyn Rasterizer>) -> Self {
        self.strategies.push(strategy);
        self
    }

    /// Start the scheduler. Must be called from within a Tokio runtime.
    pub fn build(self) -> PageQueue {
        let config = Arc::new(self.config);
        let strategies = if self.strategies.is_empty() {
            default_strategies(&config)
        } else {
            self.strategies
        };
        let registry = Arc::new(JobRegistry::new(config.event_capacity));
        let processor = Arc::new(FileProcessor::new(
            Arc::clone(&config),
            Arc::clone(&registry),
            strategies,
        ));
        info!(
            "Page queue started (output: {}, strategies: {})",
            config.output_dir.display(),
            processor.strategy_names().join(" → ")
        );

        let (sender, receiver) = mpsc::unbounded_channel();
        let scheduler = tokio::spawn(run_scheduler(receiver, Arc::clone(&registry), processor));

        PageQueue {
            config,
            registry,
            sender,
            scheduler,
        }
    }
}

fn default_strategies(config: &QueueConfig) -> Vec<Arc<dyn Rasterizer>> {
    vec![
        Arc::new(PopplerRasterizer::new(config)),
        Arc::new(PdfiumRasterizer::new(config)),
    ]
}

/// In-process document-to-image job queue.
pub struct PageQueue {
    config: Arc<QueueConfig>,
    registry: Arc<JobRegistry>,
    sender: mpsc::UnboundedSender<String>,
    scheduler: JoinHandle<()>,
}

impl PageQueue {
    /// Queue with the default strategy chain.
    pub fn new(config: QueueConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: QueueConfig) -> PageQueueBuilder {
        PageQueueBuilder {
            config,
            strategies: Vec::new(),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    // ── Submission ──────────────────────────────────────────────────────

    /// Register a `pending` job and enqueue it behind any earlier jobs.
    pub fn submit(&self, job_id: impl Into<String>, files: Vec<SourceFile>) -> Result<(), PageQueueError> {
        let job_id = job_id.into();
        validate_job_id(&job_id)?;
        if self.sender.is_closed() {
            return Err(PageQueueError::QueueClosed);
        }

        let file_count = files.len();
        self.registry.insert(Job::new(job_id.clone(), files))?;
        if self.sender.send(job_id.clone()).is_err() {
            self.registry.remove(&job_id);
            return Err(PageQueueError::QueueClosed);
        }
        info!("Job {} queued with {} file(s)", job_id, file_count);
        Ok(())
    }

    // ── Queries ─────────────────────────────────────────────────────────

    pub fn status(&self, job_id: &str) -> Option<JobSnapshot> {
        self.registry.snapshot(job_id)
    }

    /// All jobs, newest first.
    pub fn list(&self) -> Vec<JobSnapshot> {
        self.registry.list()
    }

    pub fn stats(&self) -> JobStats {
        self.registry.stats()
    }

    /// Live event feed for a job, or `None` if the id is unknown.
    pub fn subscribe(&self, job_id: &str) -> Option<JobSubscription> {
        self.registry.subscribe(job_id)
    }

    /// Deliver a job's future events to `handler`.
    pub fn subscribe_with(&self, job_id: &str, handler: EventHandler) -> Option<SubscriptionId> {
        self.registry.subscribe_with(job_id, handler)
    }

    /// Stop delivering to a handler. `false` if it was already removed.
    pub fn unsubscribe(&self, job_id: &str, id: SubscriptionId) -> bool {
        self.registry.unsubscribe(job_id, id)
    }

    /// Resolve when the job reaches `completed` or `failed`.
    ///
    /// Returns `None` if the job is unknown or is evicted while waiting.
    pub async fn wait(&self, job_id: &str) -> Option<JobSnapshot> {
        let mut subscription = self.registry.subscribe(job_id)?;
        if subscription.snapshot().status.is_terminal() {
            return Some(subscription.snapshot().clone());
        }
        while subscription.next().await.is_some() {}
        self.registry.snapshot(job_id)
    }

    /// On-disk file behind an image id or retrieval path.
    pub fn resolve_image(&self, job_id: &str, image_ref: &str) -> Option<PathBuf> {
        self.registry.find_image(job_id, image_ref).map(|i| i.file)
    }

    // ── Mutation ────────────────────────────────────────────────────────

    /// Remove one image from a job's results.
    ///
    /// The backing file is deleted only when it was rendered into the job's
    /// output directory; uploaded originals are left alone. Returns `false`
    /// if nothing matched.
    pub async fn delete_image(&self, job_id: &str, image_ref: &str) -> bool {
        let Some(image) = self.registry.remove_image(job_id, image_ref) else {
            return false;
        };
        if image.file.starts_with(self.config.job_dir(job_id)) {
            if let Err(e) = tokio::fs::remove_file(&image.file).await {
                debug!("Could not delete {}: {}", image.file.display(), e);
            }
        }
        info!("Job {}: deleted image {}", job_id, image.id);
        true
    }

    // ── Maintenance ─────────────────────────────────────────────────────

    /// Drop every job created at or before `now - max_age`, whatever its
    /// status, and remove its output directory. Returns the number dropped.
    pub async fn cleanup(&self, max_age: Duration) -> usize {
        evict(&self.registry, &self.config, max_age).await
    }

    /// Run [`PageQueue::cleanup`] with `config.max_job_age` every
    /// `config.cleanup_interval` until the returned handle is aborted.
    pub fn spawn_janitor(&self) -> JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        let config = Arc::clone(&self.config);
        tokio::spawn(async move {
            let period = config.cleanup_interval;
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                evict(&registry, &config, config.max_job_age).await;
            }
        })
    }
}

impl Drop for PageQueue {
    fn drop(&mut self) {
        // Pending jobs would never run.
        self.scheduler.abort();
    }
}

fn validate_job_id(job_id: &str) -> Result<(), PageQueueError> {
    if job_id.is_empty() {
        return Err(PageQueueError::EmptyJobId);
    }
    if job_id == "." || job_id == ".." || job_id.contains(['/', '\\', '\0']) {
        return Err(PageQueueError::InvalidJobId {
            job_id: job_id.to_string(),
        });
    }
    Ok(())
}

async fn evict(registry: &JobRegistry, config: &QueueConfig, max_age: Duration) -> usize {
    let Some(cutoff) = chrono::Duration::from_std(max_age)
        .ok()
        .and_then(|age| Utc::now().checked_sub_signed(age))
    else {
        return 0;
    };

    let removed = registry.remove_created_before(cutoff);
    for job_id in &removed {
        let dir = config.job_dir(job_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove {}: {}", dir.display(), e),
        }
    }
    if !removed.is_empty() {
        info!("Cleanup removed {} job(s)", removed.len());
    }
    removed.len()
}

// ── Scheduler ───────────────────────────────────────────────────────────

async fn run_scheduler(
    mut receiver: mpsc::UnboundedReceiver<String>,
    registry: Arc<JobRegistry>,
    processor: Arc<FileProcessor>,
) {
    while let Some(job_id) = receiver.recv().await {
        let task = {
            let registry = Arc::clone(&registry);
            let processor = Arc::clone(&processor);
            let job_id = job_id.clone();
            tokio::spawn(async move { run_job(&registry, &processor, &job_id).await })
        };
        if let Err(e) = task.await {
            error!("Job {} aborted: {}", job_id, e);
            registry.fail(&job_id, &format!("Processing task panicked: {e}"));
        }
    }
    debug!("Scheduler stopped");
}

async fn run_job(registry: &JobRegistry, processor: &FileProcessor, job_id: &str) {
    let Some(snapshot) = registry.snapshot(job_id) else {
        debug!("Job {} was removed before it started", job_id);
        return;
    };
    if !registry.start(job_id) {
        return;
    }

    let started = Instant::now();
    info!("Job {}: processing {} file(s)", job_id, snapshot.files.len());
    let mut names = OutputNames::default();
    for file in &snapshot.files {
        if !registry.contains(job_id) {
            warn!("Job {} was removed while processing", job_id);
            return;
        }
        if let Err(e) = processor.process_file(job_id, file, &mut names).await {
            error!("Job {} failed on '{}': {}", job_id, file.original_name, e);
            registry.fail(job_id, &e.to_string());
            return;
        }
    }

    registry.complete(job_id);
    info!("Job {} completed in {}ms", job_id, started.elapsed().as_millis());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_ids_must_be_directory_names() {
        assert!(matches!(validate_job_id(""), Err(PageQueueError::EmptyJobId)));
        assert!(validate_job_id("..").is_err());
        assert!(validate_job_id("a/b").is_err());
        assert!(validate_job_id("a\\b").is_err());
        assert!(validate_job_id("job-42").is_ok());
        assert!(validate_job_id(&new_job_id()).is_ok());
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(new_job_id(), new_job_id());
    }
}
