//! Job record: the mutable state of one processing job.
//!
//! A [`Job`] is owned by the [`crate::registry::JobRegistry`] and only
//! mutated on the single processing path. Every mutator checks the state
//! machine first, so once a job is `completed` or `failed` its images and
//! progress are frozen regardless of what a late strategy event tries to do.
//!
//! ```text
//! pending ──start──▶ processing ──complete──▶ completed
//!                         │
//!                         └──────fail───────▶ failed
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Lifecycle state of a job. Only ever moves forward.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// `completed` and `failed` are final.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether the state machine allows `self → next`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One uploaded file, already persisted by the caller. Read-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SourceFile {
    pub original_name: String,
    pub path: PathBuf,
    /// MIME type as reported by the uploader (may be empty or generic).
    #[serde(rename = "type")]
    pub mime_type: String,
    pub size: u64,
}

impl SourceFile {
    pub fn new(
        original_name: impl Into<String>,
        path: impl Into<PathBuf>,
        mime_type: impl Into<String>,
        size: u64,
    ) -> Self {
        Self {
            original_name: original_name.into(),
            path: path.into(),
            mime_type: mime_type.into(),
            size,
        }
    }

    /// Describe a file on disk, guessing its MIME type from the extension.
    pub fn from_path(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let size = std::fs::metadata(&path)?.len();
        let original_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        let mime_type = mime_guess::from_path(&path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();
        Ok(Self {
            original_name,
            path,
            mime_type,
            size,
        })
    }

    /// File name without extension, used as the prefix of rendered pages.
    pub fn stem(&self) -> String {
        Path::new(&self.original_name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "page".to_string())
    }
}

/// One output page or image attached to a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedImage {
    /// Deterministic id, see [`ProcessedImage::id_for`].
    pub id: String,
    /// Human label, e.g. `"plans.pdf - Page 3"`.
    pub name: String,
    /// Retrieval reference for the serving layer, never a filesystem path.
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_number: Option<usize>,
    /// Milliseconds from the start of the file to this image being available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time: Option<u64>,
    /// Backing file on disk.
    #[serde(skip)]
    pub file: PathBuf,
}

impl ProcessedImage {
    /// Stable id derived from the job id and the output file name, so
    /// registering the same output twice yields the same id.
    pub fn id_for(job_id: &str, file_name: &str) -> String {
        Uuid::new_v5(
            &Uuid::NAMESPACE_URL,
            format!("{job_id}/{file_name}").as_bytes(),
        )
        .to_string()
    }

    /// True if `image_ref` names this image, by id or by retrieval path.
    pub fn matches(&self, image_ref: &str) -> bool {
        self.id == image_ref || self.path == image_ref
    }
}

/// Progress counters. `total` may grow once a PDF's page count is known.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    pub total: usize,
    pub processed: usize,
    pub current_file: Option<String>,
}

/// Outcome of registering an image with a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageInsert {
    /// New image appended; `processed` incremented.
    Added,
    /// An image with the same id existed and was replaced in place.
    Replaced,
    /// The job is not processing; nothing changed.
    Rejected,
}

/// The unit of work: one submitted batch of files.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    pub files: Vec<SourceFile>,
    pub processed_images: Vec<ProcessedImage>,
    pub error: Option<String>,
    pub progress: JobProgress,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Units of `progress.total` attributed to the file in flight.
    file_budget: usize,
    /// New images registered for the file in flight.
    file_rendered: usize,
}

impl Job {
    /// Create a `pending` job. Each file counts as one unit of `total`
    /// until its real page count is known.
    pub fn new(id: impl Into<String>, files: Vec<SourceFile>) -> Self {
        let total = files.len();
        Self {
            id: id.into(),
            status: JobStatus::Pending,
            files,
            processed_images: Vec::new(),
            error: None,
            progress: JobProgress {
                total,
                processed: 0,
                current_file: None,
            },
            created_at: Utc::now(),
            completed_at: None,
            file_budget: 0,
            file_rendered: 0,
        }
    }

    /// `pending → processing`.
    pub fn start(&mut self) -> bool {
        self.transition(JobStatus::Processing)
    }

    /// `processing → completed`; stamps `completed_at`.
    pub fn complete(&mut self) -> bool {
        if !self.transition(JobStatus::Completed) {
            return false;
        }
        self.progress.current_file = None;
        self.completed_at = Some(Utc::now());
        true
    }

    /// `processing → failed`; stamps `completed_at` and records the cause.
    pub fn fail(&mut self, error: impl Into<String>) -> bool {
        if !self.transition(JobStatus::Failed) {
            return false;
        }
        self.error = Some(error.into());
        self.progress.current_file = None;
        self.completed_at = Some(Utc::now());
        true
    }

    fn transition(&mut self, next: JobStatus) -> bool {
        if self.status.can_transition_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }

    /// Mark `name` as the file in flight.
    pub fn begin_file(&mut self, name: &str) -> bool {
        if self.status != JobStatus::Processing {
            return false;
        }
        self.progress.current_file = Some(name.to_string());
        self.file_budget = 1;
        self.file_rendered = 0;
        true
    }

    /// Revise `total` upward once the current file's page count is known.
    pub fn announce_pages(&mut self, pages: usize) -> bool {
        if self.status != JobStatus::Processing {
            return false;
        }
        if pages > self.file_budget {
            self.progress.total += pages - self.file_budget;
            self.file_budget = pages;
        }
        true
    }

    /// Register an image for the file in flight.
    pub fn add_image(&mut self, image: ProcessedImage) -> ImageInsert {
        if self.status != JobStatus::Processing {
            return ImageInsert::Rejected;
        }
        if let Some(existing) = self.processed_images.iter_mut().find(|i| i.id == image.id) {
            *existing = image;
            return ImageInsert::Replaced;
        }
        self.processed_images.push(image);
        self.progress.processed += 1;
        self.file_rendered += 1;
        if self.file_rendered > self.file_budget {
            self.progress.total += self.file_rendered - self.file_budget;
            self.file_budget = self.file_rendered;
        }
        ImageInsert::Added
    }

    /// Settle the finished file's share of `total` to what it produced.
    pub fn finish_file(&mut self) -> bool {
        if self.status != JobStatus::Processing {
            return false;
        }
        self.progress.total = self.progress.total - self.file_budget + self.file_rendered;
        self.file_budget = 0;
        self.file_rendered = 0;
        self.progress.current_file = None;
        true
    }

    /// Remove an image by id or retrieval path. Progress counters are not
    /// touched: they describe the processing run, not the current list.
    pub fn remove_image(&mut self, image_ref: &str) -> Option<ProcessedImage> {
        let idx = self
            .processed_images
            .iter()
            .position(|i| i.matches(image_ref))?;
        Some(self.processed_images.remove(idx))
    }

    pub fn find_image(&self, image_ref: &str) -> Option<&ProcessedImage> {
        self.processed_images.iter().find(|i| i.matches(image_ref))
    }

    /// Immutable copy for readers.
    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id.clone(),
            status: self.status,
            progress: self.progress.clone(),
            processed_images: self.processed_images.clone(),
            error: self.error.clone(),
            files: self.files.clone(),
            created_at: self.created_at,
            completed_at: self.completed_at,
        }
    }
}

/// Point-in-time view of a job handed to callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub id: String,
    pub status: JobStatus,
    pub progress: JobProgress,
    pub processed_images: Vec<ProcessedImage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub files: Vec<SourceFile>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}
