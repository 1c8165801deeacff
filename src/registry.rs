//! Job registry: the in-memory map of job id → job record and event bus.
//!
//! Only the scheduler and the File Processor mutate jobs, and they do so
//! through the methods here, which pair each state change with the event
//! describing it under one lock acquisition. Readers always get cloned
//! [`JobSnapshot`]s, never a reference into the map.

use crate::error::PageQueueError;
use crate::events::{EventBus, EventHandler, JobEvent, JobSubscription, SubscriptionId};
use crate::job::{ImageInsert, Job, JobSnapshot, JobStatus, ProcessedImage};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

/// Job counts per status, computed from the live map.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JobStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
}

struct Entry {
    job: Job,
    bus: EventBus,
}

impl Entry {
    fn publish_status(&mut self) {
        let event = JobEvent::Status {
            job_id: self.job.id.clone(),
            status: self.job.status,
            error: self.job.error.clone(),
        };
        self.bus.publish(event);
    }

    fn publish_progress(&mut self) {
        let event = JobEvent::Progress {
            job_id: self.job.id.clone(),
            progress: self.job.progress.clone(),
        };
        self.bus.publish(event);
    }
}

/// Explicitly constructed job store; one per [`crate::PageQueue`].
pub struct JobRegistry {
    jobs: RwLock<HashMap<String, Entry>>,
    event_capacity: usize,
}

impl JobRegistry {
    pub fn new(event_capacity: usize) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            event_capacity,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Entry>> {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Entry>> {
        self.jobs.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `f` to a live entry; `None` if the job is gone.
    fn with_entry<R>(&self, job_id: &str, f: impl FnOnce(&mut Entry) -> R) -> Option<R> {
        let mut jobs = self.write();
        jobs.get_mut(job_id).map(f)
    }

    /// Register a new `pending` job.
    pub fn insert(&self, job: Job) -> Result<(), PageQueueError> {
        let mut jobs = self.write();
        if jobs.contains_key(&job.id) {
            return Err(PageQueueError::DuplicateJob { job_id: job.id });
        }
        let mut entry = Entry {
            job,
            bus: EventBus::new(self.event_capacity),
        };
        entry.publish_status();
        jobs.insert(entry.job.id.clone(), entry);
        Ok(())
    }

    /// Forget a job outright. Open subscriptions end without a terminal event.
    pub fn remove(&self, job_id: &str) -> bool {
        self.write().remove(job_id).is_some()
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.read().contains_key(job_id)
    }

    pub fn snapshot(&self, job_id: &str) -> Option<JobSnapshot> {
        self.read().get(job_id).map(|e| e.job.snapshot())
    }

    /// All jobs, newest first.
    pub fn list(&self) -> Vec<JobSnapshot> {
        let mut all: Vec<JobSnapshot> = self.read().values().map(|e| e.job.snapshot()).collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all
    }

    /// Snapshot plus a receiver taken under the same lock.
    pub fn subscribe(&self, job_id: &str) -> Option<JobSubscription> {
        let jobs = self.read();
        let entry = jobs.get(job_id)?;
        Some(JobSubscription::new(entry.job.snapshot(), entry.bus.receiver()))
    }

    /// Forward this job's future events to `handler` on a background task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn subscribe_with(&self, job_id: &str, handler: EventHandler) -> Option<SubscriptionId> {
        let mut jobs = self.write();
        let entry = jobs.get_mut(job_id)?;
        let mut subscription = JobSubscription::new(entry.job.snapshot(), entry.bus.receiver());
        let task = tokio::spawn(async move {
            while let Some(event) = subscription.next().await {
                handler.on_event(&event);
            }
        });
        Some(entry.bus.add_handler(task.abort_handle()))
    }

    pub fn unsubscribe(&self, job_id: &str, id: SubscriptionId) -> bool {
        self.with_entry(job_id, |e| e.bus.remove_handler(id))
            .unwrap_or(false)
    }

    /// `pending → processing`.
    pub fn start(&self, job_id: &str) -> bool {
        self.with_entry(job_id, |e| {
            if !e.job.start() {
                return false;
            }
            e.publish_status();
            e.publish_progress();
            true
        })
        .unwrap_or(false)
    }

    pub fn begin_file(&self, job_id: &str, name: &str) -> bool {
        self.with_entry(job_id, |e| {
            if !e.job.begin_file(name) {
                return false;
            }
            e.publish_progress();
            true
        })
        .unwrap_or(false)
    }

    pub fn announce_pages(&self, job_id: &str, pages: usize) -> bool {
        self.with_entry(job_id, |e| {
            let before = e.job.progress.total;
            if !e.job.announce_pages(pages) {
                return false;
            }
            if e.job.progress.total != before {
                e.publish_progress();
            }
            true
        })
        .unwrap_or(false)
    }

    /// Attach an image to the job and publish it immediately.
    pub fn register_image(&self, job_id: &str, image: ProcessedImage) -> ImageInsert {
        self.with_entry(job_id, |e| {
            let outcome = e.job.add_image(image.clone());
            if outcome != ImageInsert::Rejected {
                e.bus.publish(JobEvent::Image {
                    job_id: e.job.id.clone(),
                    image,
                });
                e.publish_progress();
            }
            outcome
        })
        .unwrap_or(ImageInsert::Rejected)
    }

    pub fn finish_file(&self, job_id: &str) -> bool {
        self.with_entry(job_id, |e| {
            if !e.job.finish_file() {
                return false;
            }
            e.publish_progress();
            true
        })
        .unwrap_or(false)
    }

    /// `processing → completed`; closes the job's event channel.
    pub fn complete(&self, job_id: &str) -> bool {
        self.with_entry(job_id, |e| {
            if !e.job.complete() {
                return false;
            }
            e.publish_progress();
            e.publish_status();
            true
        })
        .unwrap_or(false)
    }

    /// `processing → failed`; publishes the cause, then closes the channel.
    pub fn fail(&self, job_id: &str, error: &str) -> bool {
        self.with_entry(job_id, |e| {
            if !e.job.fail(error) {
                return false;
            }
            e.bus.publish(JobEvent::Error {
                job_id: e.job.id.clone(),
                message: error.to_string(),
            });
            e.publish_status();
            true
        })
        .unwrap_or(false)
    }

    pub fn find_image(&self, job_id: &str, image_ref: &str) -> Option<ProcessedImage> {
        self.read()
            .get(job_id)
            .and_then(|e| e.job.find_image(image_ref).cloned())
    }

    /// Detach an image from the job's result list.
    pub fn remove_image(&self, job_id: &str, image_ref: &str) -> Option<ProcessedImage> {
        self.with_entry(job_id, |e| e.job.remove_image(image_ref))
            .flatten()
    }

    /// Drop every job created at or before `cutoff`, whatever its status.
    /// Returns the removed ids.
    pub fn remove_created_before(&self, cutoff: DateTime<Utc>) -> Vec<String> {
        let mut jobs = self.write();
        let expired: Vec<String> = jobs
            .iter()
            .filter(|(_, e)| e.job.created_at <= cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            if let Some(entry) = jobs.remove(id) {
                debug!("Evicted job {} ({})", id, entry.job.status);
            }
        }
        expired
    }

    pub fn stats(&self) -> JobStats {
        let jobs = self.read();
        let mut stats = JobStats {
            total: jobs.len(),
            ..JobStats::default()
        };
        for entry in jobs.values() {
            match entry.job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::SourceFile;
    use std::path::PathBuf;

    fn job(id: &str) -> Job {
        Job::new(
            id,
            vec![SourceFile::new("a.png", "/up/a.png", "image/png", 3)],
        )
    }

    fn image(job_id: &str, name: &str) -> ProcessedImage {
        ProcessedImage {
            id: ProcessedImage::id_for(job_id, name),
            name: name.into(),
            path: format!("/api/images/{job_id}/{name}"),
            page_number: None,
            processing_time: None,
            file: PathBuf::from(name),
        }
    }

    #[test]
    fn duplicate_ids_rejected() {
        let reg = JobRegistry::new(16);
        reg.insert(job("a")).unwrap();
        let err = reg.insert(job("a")).unwrap_err();
        assert!(matches!(err, PageQueueError::DuplicateJob { .. }));
    }

    #[test]
    fn stats_follow_status() {
        let reg = JobRegistry::new(16);
        reg.insert(job("a")).unwrap();
        reg.insert(job("b")).unwrap();
        reg.insert(job("c")).unwrap();
        reg.start("b");
        reg.start("c");
        reg.fail("c", "boom");

        let stats = reg.stats();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.processing, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.completed, 0);
        assert_eq!(stats.total, 3);
    }

    #[test]
    fn snapshot_is_a_copy() {
        let reg = JobRegistry::new(16);
        reg.insert(job("a")).unwrap();
        let before = reg.snapshot("a").unwrap();
        reg.start("a");
        reg.begin_file("a", "a.png");
        reg.register_image("a", image("a", "a.png"));
        assert_eq!(before.status, JobStatus::Pending);
        assert!(before.processed_images.is_empty());
        assert_eq!(reg.snapshot("a").unwrap().processed_images.len(), 1);
    }

    #[test]
    fn cutoff_removes_regardless_of_status() {
        let reg = JobRegistry::new(16);
        reg.insert(job("a")).unwrap();
        reg.insert(job("b")).unwrap();
        reg.start("b");
        let removed = reg.remove_created_before(Utc::now());
        assert_eq!(removed.len(), 2);
        assert_eq!(reg.stats(), JobStats::default());
    }

    #[test]
    fn cutoff_keeps_newer_jobs() {
        let reg = JobRegistry::new(16);
        reg.insert(job("a")).unwrap();
        let removed = reg.remove_created_before(Utc::now() - chrono::Duration::hours(1));
        assert!(removed.is_empty());
        assert!(reg.contains("a"));
    }

    #[tokio::test]
    async fn events_follow_mutations_in_order() {
        let reg = JobRegistry::new(16);
        reg.insert(job("a")).unwrap();
        let sub = reg.subscribe("a").unwrap();
        reg.start("a");
        reg.begin_file("a", "a.png");
        reg.register_image("a", image("a", "a.png"));
        reg.finish_file("a");
        reg.complete("a");

        let kinds: Vec<&'static str> = sub.map(|e| e.kind()).collect().await;
        assert_eq!(
            kinds,
            vec![
                "status", "progress", // start
                "progress",           // begin_file
                "image", "progress",  // register_image
                "progress",           // finish_file
                "progress", "status", // complete
            ]
        );
    }

    #[tokio::test]
    async fn failure_publishes_error_then_status() {
        let reg = JobRegistry::new(16);
        reg.insert(job("a")).unwrap();
        reg.start("a");
        let sub = reg.subscribe("a").unwrap();
        reg.fail("a", "pdftoppm crashed");
        let events: Vec<JobEvent> = sub.collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind(), "error");
        assert!(events[1].is_terminal());
        assert_eq!(
            reg.snapshot("a").unwrap().error.as_deref(),
            Some("pdftoppm crashed")
        );
    }

    #[tokio::test]
    async fn unsubscribe_is_one_shot() {
        let reg = JobRegistry::new(16);
        reg.insert(job("a")).unwrap();
        let id = reg
            .subscribe_with("a", std::sync::Arc::new(crate::events::NoopEventHandler))
            .unwrap();
        assert!(reg.unsubscribe("a", id));
        assert!(!reg.unsubscribe("a", id));
        assert!(!reg.unsubscribe("missing", id));
    }
}
