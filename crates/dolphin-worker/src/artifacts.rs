//! Temporary artifact tracking.
//!
//! Every intermediate file of an attempt lives under
//! `{work_dir}/{job_id}/attempt-{n}` and is allocated through
//! [`TempArtifacts::path`], so cleanup knows exactly what to delete.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tokio::fs;
use tracing::{debug, warn};

use dolphin_models::JobId;

use crate::error::WorkerResult;

/// Directory holding every attempt of a job.
pub fn job_dir(work_dir: &Path, job_id: &JobId) -> PathBuf {
    work_dir.join(job_id.as_str())
}

/// Intermediate files owned by one attempt.
#[derive(Debug)]
pub struct TempArtifacts {
    job_dir: PathBuf,
    dir: PathBuf,
    tracked: Mutex<Vec<PathBuf>>,
    cleaned: AtomicBool,
}

impl TempArtifacts {
    /// Create the attempt directory.
    pub async fn create(work_dir: &Path, job_id: &JobId, attempt: u32) -> WorkerResult<Self> {
        let job_dir = job_dir(work_dir, job_id);
        let dir = job_dir.join(format!("attempt-{}", attempt));
        fs::create_dir_all(&dir).await?;
        debug!(job_id = %job_id, dir = %dir.display(), "Created attempt work dir");

        Ok(Self {
            job_dir,
            dir,
            tracked: Mutex::new(Vec::new()),
            cleaned: AtomicBool::new(false),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Allocate a tracked path for an intermediate file.
    pub fn path(&self, name: &str) -> PathBuf {
        let path = self.dir.join(name);
        self.lock().push(path.clone());
        path
    }

    /// Track a file created outside the attempt directory.
    pub fn track(&self, path: PathBuf) {
        self.lock().push(path);
    }

    /// Paths allocated so far, in allocation order.
    pub fn tracked(&self) -> Vec<PathBuf> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<PathBuf>> {
        self.tracked.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Delete every tracked file and the attempt directory.
    ///
    /// Failures are logged and never returned. Returns how many tracked files
    /// were removed.
    pub async fn cleanup(&self) -> usize {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return 0;
        }

        let mut removed = 0;
        for path in self.tracked() {
            match fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), "Failed to remove temp artifact: {}", e),
            }
        }

        if let Err(e) = fs::remove_dir_all(&self.dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(dir = %self.dir.display(), "Failed to remove attempt dir: {}", e);
            }
        }
        // Only succeeds once no other attempt directory remains.
        let _ = fs::remove_dir(&self.job_dir).await;

        debug!(dir = %self.dir.display(), removed, "Cleaned up temp artifacts");
        removed
    }
}

impl Drop for TempArtifacts {
    fn drop(&mut self) {
        if self.cleaned.load(Ordering::SeqCst) {
            return;
        }
        warn!(dir = %self.dir.display(), "TempArtifacts dropped without cleanup()");
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(dir = %self.dir.display(), "Failed to remove attempt dir: {}", e);
            }
        }
        let _ = std::fs::remove_dir(&self.job_dir);
    }
}

/// Remove everything a crashed attempt of `job_id` may have left behind.
pub async fn remove_job_dir(work_dir: &Path, job_id: &JobId) {
    let dir = job_dir(work_dir, job_id);
    match fs::remove_dir_all(&dir).await {
        Ok(()) => debug!(job_id = %job_id, "Removed leftover work dir"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(job_id = %job_id, dir = %dir.display(), "Failed to remove leftover work dir: {}", e),
    }
}

/// Job directories currently present under `work_dir`.
pub async fn list_job_dirs(work_dir: &Path) -> WorkerResult<Vec<JobId>> {
    let mut ids = Vec::new();
    let mut entries = match fs::read_dir(work_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
        Err(e) => return Err(e.into()),
    };

    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            ids.push(JobId::from_string(entry.file_name().to_string_lossy()));
        }
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_cleanup_removes_tracked_files_and_dirs() {
        let work = TempDir::new().unwrap();
        let job_id = JobId::new();
        let artifacts = TempArtifacts::create(work.path(), &job_id, 1).await.unwrap();

        let audio = artifacts.path("narration.wav");
        let clip = artifacts.path("intro.mp4");
        std::fs::write(&audio, b"audio").unwrap();
        std::fs::write(&clip, b"video").unwrap();
        assert!(audio.starts_with(work.path().join(job_id.as_str()).join("attempt-1")));

        assert_eq!(artifacts.cleanup().await, 2);
        assert!(!audio.exists());
        assert!(!work.path().join(job_id.as_str()).exists());

        // Second call is a no-op.
        assert_eq!(artifacts.cleanup().await, 0);
    }

    #[tokio::test]
    async fn test_cleanup_tolerates_never_written_paths() {
        let work = TempDir::new().unwrap();
        let artifacts = TempArtifacts::create(work.path(), &JobId::new(), 2).await.unwrap();
        let _ = artifacts.path("never-written.mp4");

        assert_eq!(artifacts.cleanup().await, 0);
        assert!(std::fs::read_dir(work.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_drop_without_cleanup_removes_dir() {
        let work = TempDir::new().unwrap();
        let job_id = JobId::new();
        {
            let artifacts = TempArtifacts::create(work.path(), &job_id, 1).await.unwrap();
            std::fs::write(artifacts.path("frame.png"), b"png").unwrap();
        }
        assert!(!job_dir(work.path(), &job_id).exists());
    }

    #[tokio::test]
    async fn test_remove_and_list_job_dirs() {
        let work = TempDir::new().unwrap();
        let crashed = JobId::new();
        std::fs::create_dir_all(job_dir(work.path(), &crashed).join("attempt-1")).unwrap();
        std::fs::write(work.path().join("stray.txt"), b"x").unwrap();

        assert_eq!(list_job_dirs(work.path()).await.unwrap(), vec![crashed.clone()]);

        remove_job_dir(work.path(), &crashed).await;
        assert!(list_job_dirs(work.path()).await.unwrap().is_empty());

        let missing = work.path().join("missing");
        assert!(list_job_dirs(&missing).await.unwrap().is_empty());
    }
}
