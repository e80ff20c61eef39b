//! Filesystem helpers for publishing output files.
//!
//! Files are written under a hidden sibling name and renamed into place, so a
//! reader never observes a partially written file under its final name.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::{MediaError, MediaResult};

/// Hidden temporary path in the same directory as `path`.
///
/// Same directory means same filesystem, so the final rename is atomic.
pub fn hidden_sibling(path: &Path) -> MediaResult<PathBuf> {
    let name = path
        .file_name()
        .ok_or_else(|| MediaError::invalid_media(format!("{} has no file name", path.display())))?;
    let hidden = format!(".{}.{}.partial", name.to_string_lossy(), Uuid::new_v4().simple());
    Ok(path.with_file_name(hidden))
}

/// Write `bytes` to `final_path` without ever exposing a partial file.
pub async fn persist_atomically(bytes: &[u8], final_path: &Path) -> MediaResult<()> {
    if let Some(parent) = final_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }

    let tmp = hidden_sibling(final_path)?;
    let written = async {
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        Ok::<_, std::io::Error>(())
    }
    .await;

    if let Err(e) = written {
        let _ = fs::remove_file(&tmp).await;
        return Err(MediaError::from(e));
    }

    rename_into_place(&tmp, final_path).await
}

/// Rename a fully written file onto its final name.
pub async fn rename_into_place(tmp: &Path, final_path: &Path) -> MediaResult<()> {
    fs::rename(tmp, final_path).await.map_err(|e| {
        tracing::error!(
            "Failed to publish {} as {}: {}",
            tmp.display(),
            final_path.display(),
            e
        );
        MediaError::from(e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_persist_creates_parent_and_writes() {
        let dir = TempDir::new().unwrap();
        let dst = dir.path().join("certs").join("job_en.png");

        persist_atomically(b"png bytes", &dst).await.unwrap();

        assert_eq!(fs::read(&dst).await.unwrap(), b"png bytes");
        let leftovers: Vec<_> = std::fs::read_dir(dst.parent().unwrap())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".partial"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_persist_overwrites_destination() {
        let dir = TempDir::new().unwrap();
        let dst = dir.path().join("out.png");
        fs::write(&dst, b"old").await.unwrap();

        persist_atomically(b"new", &dst).await.unwrap();
        assert_eq!(fs::read(&dst).await.unwrap(), b"new");
    }

    #[test]
    fn test_hidden_sibling_stays_in_directory() {
        let tmp = hidden_sibling(Path::new("/out/videos/abc.mp4")).unwrap();
        assert_eq!(tmp.parent(), Some(Path::new("/out/videos")));
        let name = tmp.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with(".abc.mp4."));
        assert!(name.ends_with(".partial"));
        assert!(hidden_sibling(Path::new("/")).is_err());
    }
}
