//! Configuration types for the page queue.
//!
//! Every tunable lives in [`QueueConfig`], built via its
//! [`QueueConfigBuilder`]. One struct is easy to share between the scheduler,
//! the strategies and the CLI, and easy to log when two deployments behave
//! differently.

use crate::error::PageQueueError;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a [`crate::PageQueue`].
///
/// # Example
/// ```rust
/// use edgequake_pagequeue::QueueConfig;
/// use std::time::Duration;
///
/// let config = QueueConfig::builder()
///     .output_dir("/var/lib/pagequeue")
///     .dpi(150)
///     .render_timeout(Duration::from_secs(300))
///     .build()
///     .unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Root directory for rendered pages. Each job writes under
    /// `output_dir/<job_id>/`. Default: `<tmp>/pagequeue`.
    pub output_dir: PathBuf,

    /// Prefix of the retrieval reference stored in `ProcessedImage::path`.
    /// Default: `/api/images`.
    ///
    /// The reference is `"{prefix}/{job_id}/{file_name}"`; the serving layer
    /// maps it back to a file with [`crate::PageQueue::resolve_image`].
    pub image_url_prefix: String,

    /// Rendering resolution for both strategies. Range: 72–400. Default: 150.
    ///
    /// `pdftoppm` receives it as `-r`; PDFium renders at scale `dpi / 72`.
    pub dpi: u32,

    /// Primary strategy rasteriser command. Default: `pdftoppm`.
    pub pdftoppm_path: PathBuf,

    /// Page-count probe command used before rasterising. Default: `pdfinfo`.
    pub pdfinfo_path: PathBuf,

    /// Directory containing the PDFium shared library for the fallback
    /// strategy. `None` binds the system library. Default: `None`.
    pub pdfium_library_dir: Option<PathBuf>,

    /// How often the stability detector polls a page file's size. Default: 100 ms.
    pub stability_poll_interval: Duration,

    /// Give up waiting for a page file to settle after this long. Default: 10 s.
    pub stability_timeout: Duration,

    /// Wall-clock limit for one strategy on one file. Default: 10 min.
    ///
    /// Without it a hung `pdftoppm` would block the single-consumer queue
    /// forever.
    pub render_timeout: Duration,

    /// Buffered events per job channel before slow subscribers lag. Default: 256.
    pub event_capacity: usize,

    /// Age after which the janitor evicts a job. Default: 24 h.
    pub max_job_age: Duration,

    /// Interval between janitor sweeps. Default: 1 h.
    pub cleanup_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            output_dir: std::env::temp_dir().join("pagequeue"),
            image_url_prefix: "/api/images".to_string(),
            dpi: 150,
            pdftoppm_path: PathBuf::from("pdftoppm"),
            pdfinfo_path: PathBuf::from("pdfinfo"),
            pdfium_library_dir: None,
            stability_poll_interval: Duration::from_millis(100),
            stability_timeout: Duration::from_secs(10),
            render_timeout: Duration::from_secs(600),
            event_capacity: 256,
            max_job_age: Duration::from_secs(24 * 60 * 60),
            cleanup_interval: Duration::from_secs(60 * 60),
        }
    }
}

impl QueueConfig {
    /// Create a new builder for `QueueConfig`.
    pub fn builder() -> QueueConfigBuilder {
        QueueConfigBuilder {
            config: Self::default(),
        }
    }

    /// Directory holding the rendered pages of one job.
    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.output_dir.join(job_id)
    }

    /// Retrieval reference for a file belonging to `job_id`.
    pub fn image_ref(&self, job_id: &str, file_name: &str) -> String {
        format!(
            "{}/{}/{}",
            self.image_url_prefix.trim_end_matches('/'),
            job_id,
            file_name
        )
    }
}

/// Builder for [`QueueConfig`].
#[derive(Debug)]
pub struct QueueConfigBuilder {
    config: QueueConfig,
}

impl QueueConfigBuilder {
    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_dir = dir.into();
        self
    }

    pub fn image_url_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.image_url_prefix = prefix.into();
        self
    }

    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 400);
        self
    }

    pub fn pdftoppm_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.pdftoppm_path = path.into();
        self
    }

    pub fn pdfinfo_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.pdfinfo_path = path.into();
        self
    }

    pub fn pdfium_library_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.pdfium_library_dir = Some(dir.into());
        self
    }

    pub fn stability_poll_interval(mut self, interval: Duration) -> Self {
        self.config.stability_poll_interval = interval;
        self
    }

    pub fn stability_timeout(mut self, timeout: Duration) -> Self {
        self.config.stability_timeout = timeout;
        self
    }

    pub fn render_timeout(mut self, timeout: Duration) -> Self {
        self.config.render_timeout = timeout;
        self
    }

    pub fn event_capacity(mut self, n: usize) -> Self {
        self.config.event_capacity = n.max(1);
        self
    }

    pub fn max_job_age(mut self, age: Duration) -> Self {
        self.config.max_job_age = age;
        self
    }

    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.config.cleanup_interval = interval;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<QueueConfig, PageQueueError> {
        let c = &self.config;
        if c.dpi < 72 || c.dpi > 400 {
            return Err(PageQueueError::InvalidConfig(format!(
                "DPI must be 72–400, got {}",
                c.dpi
            )));
        }
        if c.stability_poll_interval.is_zero() {
            return Err(PageQueueError::InvalidConfig(
                "Stability poll interval must be > 0".into(),
            ));
        }
        if c.stability_timeout < c.stability_poll_interval {
            return Err(PageQueueError::InvalidConfig(format!(
                "Stability timeout ({:?}) is shorter than the poll interval ({:?})",
                c.stability_timeout, c.stability_poll_interval
            )));
        }
        if c.render_timeout.is_zero() {
            return Err(PageQueueError::InvalidConfig(
                "Render timeout must be > 0".into(),
            ));
        }
        if c.cleanup_interval.is_zero() {
            return Err(PageQueueError::InvalidConfig(
                "Cleanup interval must be > 0".into(),
            ));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_build() {
        let config = QueueConfig::builder().build().expect("defaults are valid");
        assert_eq!(config.dpi, 150);
        assert_eq!(config.pdftoppm_path, PathBuf::from("pdftoppm"));
        assert!(config.pdfium_library_dir.is_none());
    }

    #[test]
    fn dpi_is_clamped() {
        let config = QueueConfig::builder().dpi(1200).build().unwrap();
        assert_eq!(config.dpi, 400);
        let config = QueueConfig::builder().dpi(10).build().unwrap();
        assert_eq!(config.dpi, 72);
    }

    #[test]
    fn rejects_timeout_shorter_than_poll() {
        let err = QueueConfig::builder()
            .stability_poll_interval(Duration::from_millis(500))
            .stability_timeout(Duration::from_millis(100))
            .build()
            .unwrap_err();
        assert!(matches!(err, PageQueueError::InvalidConfig(_)));
    }

    #[test]
    fn rejects_zero_render_timeout() {
        let err = QueueConfig::builder()
            .render_timeout(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("Render timeout"));
    }

    #[test]
    fn image_ref_joins_prefix() {
        let config = QueueConfig::builder()
            .image_url_prefix("/files/")
            .build()
            .unwrap();
        assert_eq!(
            config.image_ref("job-1", "plan-1.png"),
            "/files/job-1/plan-1.png"
        );
    }
}
