//! CLI binary for edgequake-pagequeue.
//!
//! Submits the given files as one job, shows pages as they land, and prints
//! the final job snapshot.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_pagequeue::{
    new_job_id, JobEvent, JobSnapshot, JobStatus, PageQueue, QueueConfig, SourceFile,
};
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers ──────────────────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Rasterise a drawing set next to two photos
  pagequeue plans.pdf site-1.jpg site-2.jpg

  # Higher resolution into a chosen directory
  pagequeue --dpi 300 --output-dir ./pages plans.pdf

  # Machine-readable result
  pagequeue --json plans.pdf > job.json

BACKENDS:
  pdftoppm (poppler-utils) is tried first. If it is missing or fails, the
  embedded PDFium renderer is used instead; point PAGEQUEUE_PDFIUM_DIR at
  the directory holding libpdfium if it is not on the system search path.
"#;

/// Rasterise PDFs and collect images through the page queue.
#[derive(Parser, Debug)]
#[command(
    name = "pagequeue",
    version,
    about = "Turn PDFs and images into a job of page images",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Files to submit as one job.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Job id. Default: a random UUID.
    #[arg(long, env = "PAGEQUEUE_JOB_ID")]
    job_id: Option<String>,

    /// Root directory for rendered pages (one subdirectory per job).
    #[arg(short, long, env = "PAGEQUEUE_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    /// Rendering DPI (72–400).
    #[arg(long, env = "PAGEQUEUE_DPI", default_value_t = 150,
          value_parser = clap::value_parser!(u32).range(72..=400))]
    dpi: u32,

    /// Prefix of image retrieval references.
    #[arg(long, env = "PAGEQUEUE_IMAGE_PREFIX", default_value = "/api/images")]
    image_prefix: String,

    /// pdftoppm executable.
    #[arg(long, env = "PAGEQUEUE_PDFTOPPM", default_value = "pdftoppm")]
    pdftoppm: PathBuf,

    /// pdfinfo executable.
    #[arg(long, env = "PAGEQUEUE_PDFINFO", default_value = "pdfinfo")]
    pdfinfo: PathBuf,

    /// Directory containing libpdfium for the fallback renderer.
    #[arg(long, env = "PAGEQUEUE_PDFIUM_DIR")]
    pdfium_dir: Option<PathBuf>,

    /// Per-strategy render timeout in seconds.
    #[arg(long, env = "PAGEQUEUE_RENDER_TIMEOUT", default_value_t = 600)]
    render_timeout: u64,

    /// Print the final job snapshot as JSON.
    #[arg(long, env = "PAGEQUEUE_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "PAGEQUEUE_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "PAGEQUEUE_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "PAGEQUEUE_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Build queue ──────────────────────────────────────────────────────
    let mut builder = QueueConfig::builder()
        .dpi(cli.dpi)
        .image_url_prefix(cli.image_prefix.clone())
        .pdftoppm_path(cli.pdftoppm.clone())
        .pdfinfo_path(cli.pdfinfo.clone())
        .render_timeout(Duration::from_secs(cli.render_timeout));
    if let Some(dir) = &cli.output_dir {
        builder = builder.output_dir(dir.clone());
    }
    if let Some(dir) = &cli.pdfium_dir {
        builder = builder.pdfium_library_dir(dir.clone());
    }
    let config = builder.build().context("Invalid configuration")?;
    let queue = PageQueue::new(config);

    let files = cli
        .inputs
        .iter()
        .map(|p| SourceFile::from_path(p).with_context(|| format!("Cannot read {}", p.display())))
        .collect::<Result<Vec<_>>>()?;

    let job_id = cli.job_id.clone().unwrap_or_else(new_job_id);
    queue
        .submit(job_id.clone(), files)
        .context("Failed to submit job")?;
    let mut events = queue
        .subscribe(&job_id)
        .context("Job disappeared right after submission")?;

    // ── Follow events ────────────────────────────────────────────────────
    let bar = if show_progress {
        let bar = ProgressBar::new(events.snapshot().progress.total as u64);
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} {prefix:.bold}  [{bar:42.green/238}] {pos:>3}/{len} images  {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  "),
        );
        bar.set_prefix("Rendering");
        bar.enable_steady_tick(Duration::from_millis(80));
        Some(bar)
    } else {
        None
    };

    while let Some(event) = events.next().await {
        let Some(bar) = &bar else { continue };
        match event {
            JobEvent::Progress { progress, .. } => {
                bar.set_length(progress.total as u64);
                bar.set_position(progress.processed as u64);
                bar.set_message(progress.current_file.unwrap_or_default());
            }
            JobEvent::Image { image, .. } => {
                bar.println(format!("  {} {}  {}", green("✓"), image.name, dim(&image.path)));
            }
            JobEvent::Error { message, .. } => {
                bar.println(format!("  {} {}", red("✗"), red(&message)));
            }
            JobEvent::Status { .. } => {}
        }
    }
    if let Some(bar) = &bar {
        bar.finish_and_clear();
    }

    let snapshot = queue
        .status(&job_id)
        .context("Job was evicted before it finished")?;

    // ── Report ───────────────────────────────────────────────────────────
    if cli.json {
        let json = serde_json::to_string_pretty(&snapshot).context("Failed to serialise job")?;
        println!("{json}");
    } else if !cli.quiet {
        print_summary(&snapshot, &queue);
    }

    if snapshot.status == JobStatus::Failed {
        anyhow::bail!(
            "Job {} failed: {}",
            snapshot.id,
            snapshot.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

fn print_summary(snapshot: &JobSnapshot, queue: &PageQueue) {
    for image in &snapshot.processed_images {
        let file = queue
            .resolve_image(&snapshot.id, &image.id)
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        println!("{}\t{}", image.name, file);
    }
    let elapsed = snapshot
        .completed_at
        .map(|done| (done - snapshot.created_at).num_milliseconds() as f64 / 1000.0)
        .unwrap_or_default();
    if snapshot.status == JobStatus::Completed {
        eprintln!(
            "{} {} image(s) for job {} in {:.1}s",
            green("✔"),
            bold(&snapshot.processed_images.len().to_string()),
            snapshot.id,
            elapsed
        );
    }
}
