//! Upload classification: raster image, PDF, or unsupported.
//!
//! The uploader's MIME type is trusted first, then the file extension, then
//! the file's first bytes. Browsers routinely send `application/octet-stream`
//! for drawings exported from CAD tools, so the later checks matter.

use crate::job::SourceFile;
use std::path::Path;
use tokio::io::AsyncReadExt;

/// How the File Processor treats an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Already a raster image; registered without transformation.
    Image,
    /// Needs rasterising.
    Pdf,
    Unsupported,
}

/// Classify an upload. Only reads the file when metadata is inconclusive.
pub async fn classify(file: &SourceFile) -> FileKind {
    if let Some(kind) = kind_from_mime(&file.mime_type) {
        return kind;
    }

    for candidate in [Path::new(&file.original_name), file.path.as_path()] {
        let guessed = mime_guess::from_path(candidate);
        if let Some(kind) = guessed.iter().find_map(|m| kind_from_mime(m.essence_str())) {
            return kind;
        }
    }

    sniff(&file.path).await.unwrap_or(FileKind::Unsupported)
}

fn kind_from_mime(mime: &str) -> Option<FileKind> {
    let mime = mime.trim().to_ascii_lowercase();
    match mime.as_str() {
        "application/pdf" | "application/x-pdf" => Some(FileKind::Pdf),
        // Vector formats are not raster images.
        "image/svg+xml" => None,
        m if m.starts_with("image/") => Some(FileKind::Image),
        _ => None,
    }
}

/// Look at magic bytes when metadata is inconclusive.
async fn sniff(path: &Path) -> Option<FileKind> {
    let mut header = [0u8; 8];
    let mut f = tokio::fs::File::open(path).await.ok()?;
    let n = f.read(&mut header).await.ok()?;
    let header = &header[..n];

    if header.starts_with(b"%PDF") {
        Some(FileKind::Pdf)
    } else if header.starts_with(b"\x89PNG\r\n\x1a\n")
        || header.starts_with(&[0xFF, 0xD8, 0xFF])
        || header.starts_with(b"GIF8")
        || header.starts_with(b"II*\0")
        || header.starts_with(b"MM\0*")
    {
        Some(FileKind::Image)
    } else {
        None
    }
}
