//! File-stability detection for output written by an external process.
//!
//! `pdftoppm` creates each page file first and fills it afterwards, so a
//! creation event alone says nothing about whether the PNG is complete. A
//! file counts as stable once it is non-empty and its size is unchanged
//! across two consecutive polls.

use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Wait until `path` stops growing.
///
/// Returns `true` once the file is stable and `false` if `timeout` elapses
/// first. Never fails: a file that cannot be read yet is simply polled again.
pub async fn wait_until_stable(path: &Path, interval: Duration, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, poll_until_stable(path, interval)).await {
        Ok(()) => true,
        Err(_) => {
            debug!(
                "{} did not settle within {}ms; giving up",
                path.display(),
                timeout.as_millis()
            );
            false
        }
    }
}

async fn poll_until_stable(path: &Path, interval: Duration) {
    let mut last: Option<u64> = None;
    loop {
        let size = tokio::fs::metadata(path).await.ok().map(|m| m.len());
        match (last, size) {
            (Some(prev), Some(now)) if prev == now && now > 0 => return,
            _ => last = size,
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const POLL: Duration = Duration::from_millis(10);

    #[tokio::test]
    async fn complete_file_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p-1.png");
        std::fs::write(&path, b"png bytes").unwrap();
        assert!(wait_until_stable(&path, POLL, Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn empty_file_never_settles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p-1.png");
        std::fs::File::create(&path).unwrap();
        assert!(!wait_until_stable(&path, POLL, Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn missing_file_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.png");
        assert!(!wait_until_stable(&path, POLL, Duration::from_millis(80)).await);
    }

    #[tokio::test]
    async fn growing_file_settles_after_writer_stops() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p-1.png");
        let writer_path = path.clone();
        let writer = tokio::spawn(async move {
            let mut f = std::fs::File::create(&writer_path).unwrap();
            for _ in 0..5 {
                f.write_all(&[0u8; 64]).unwrap();
                f.flush().unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        assert!(wait_until_stable(&path, POLL, Duration::from_secs(2)).await);
        writer.await.unwrap();
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
    }
}
