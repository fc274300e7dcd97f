//! Persistent tier: a gallery's download directory.
//!
//! Pages are plain files named by [`page_filename`], so the directory needs no
//! index: a page is found by probing each suffix of [`PERSISTENT_SCAN`] in order,
//! and the first hit wins.
//!
//! ## Write protocol
//!
//! Nothing is ever written under a canonical name directly. Bytes go to a
//! hidden staging file (`.00000001.<uuid>.part`) that the lookup never probes.
//! Committing renames it onto the canonical name, then deletes any file that
//! holds the same page under another extension. A failed rename leaves the old
//! file where it was. A [`StagedFile`] that is dropped
//! without being committed (error, verification failure, cancelled future)
//! deletes its staging file. Concurrent commits for the same page are
//! last-writer-wins.

use crate::error::StoreError;
use crate::extension::{ImageExtension, PERSISTENT_SCAN};
use crate::gif;
use crate::key::{PageIndex, page_filename};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

/// Locate a page file. Returns its path and the extension it is read back as.
pub async fn find(dir: &Path, index: PageIndex) -> Option<(PathBuf, ImageExtension)> {
    for (suffix, extension) in PERSISTENT_SCAN {
        let path = dir.join(page_filename(index, suffix));
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Some((path, extension));
        }
    }
    None
}

/// Remove the page file found by [`find`]. Returns whether a file was deleted.
pub async fn remove(dir: &Path, index: PageIndex) -> Result<bool, StoreError> {
    let Some((path, _)) = find(dir, index).await else {
        return Ok(false);
    };
    match tokio::fs::remove_file(&path).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(StoreError::persistent(path, err)),
    }
}

/// Write a complete payload as the page file.
pub async fn write(
    dir: &Path,
    index: PageIndex,
    extension: ImageExtension,
    data: &[u8],
) -> Result<PathBuf, StoreError> {
    let mut staged = StagedFile::create(dir, index).await?;
    staged.write_all(data).await?;
    staged.commit(extension).await
}

/// A page file being written under a non-canonical name.
#[derive(Debug)]
pub struct StagedFile {
    dir: PathBuf,
    index: PageIndex,
    temp: PathBuf,
    file: Option<tokio::fs::File>,
    written: u64,
    committed: bool,
}

impl StagedFile {
    /// Create the staging file. Failing here means the directory is unusable.
    pub async fn create(dir: &Path, index: PageIndex) -> Result<Self, StoreError> {
        let temp = dir.join(format!(
            ".{}.{}.part",
            page_filename(index, ""),
            Uuid::new_v4().simple()
        ));
        let file = tokio::fs::File::create(&temp)
            .await
            .map_err(|err| StoreError::persistent(&temp, err))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            index,
            temp,
            file: Some(file),
            written: 0,
            committed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.temp
    }

    /// Bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub async fn write_all(&mut self, chunk: &[u8]) -> Result<(), StoreError> {
        let Some(file) = self.file.as_mut() else {
            return Err(StoreError::persistent(
                &self.temp,
                std::io::Error::other("staged file already closed"),
            ));
        };
        file.write_all(chunk)
            .await
            .map_err(|err| StoreError::persistent(&self.temp, err))?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// Flush, post-process, and move onto the canonical filename.
    ///
    /// GIFs get their frame delays repaired in place before the rename, so a
    /// reader never sees the unrepaired file.
    pub async fn commit(mut self, extension: ImageExtension) -> Result<PathBuf, StoreError> {
        if let Some(mut file) = self.file.take() {
            file.flush()
                .await
                .map_err(|err| StoreError::persistent(&self.temp, err))?;
            file.sync_all()
                .await
                .map_err(|err| StoreError::persistent(&self.temp, err))?;
        }

        if extension.is_gif() {
            repair_gif(&self.temp).await?;
        }

        let target = self.dir.join(page_filename(self.index, extension.as_str()));
        tokio::fs::rename(&self.temp, &target)
            .await
            .map_err(|err| StoreError::persistent(&target, err))?;
        self.committed = true;

        // The new page is in place; leftovers under other extensions are stale.
        for (suffix, _) in PERSISTENT_SCAN {
            if suffix == extension.as_str() {
                continue;
            }
            let sibling = self.dir.join(page_filename(self.index, suffix));
            match tokio::fs::remove_file(&sibling).await {
                Ok(()) => debug!("replaced {:?}", sibling),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => warn!("failed to remove stale {:?}: {err}", sibling),
            }
        }
        Ok(target)
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        // Close the handle before unlinking so this also works on Windows.
        self.file.take();
        if let Err(err) = std::fs::remove_file(&self.temp)
            && err.kind() != std::io::ErrorKind::NotFound
        {
            warn!("failed to discard staged file {:?}: {err}", self.temp);
        }
    }
}

/// Run the GIF repair on a file without blocking the runtime.
pub(crate) async fn repair_gif(path: &Path) -> Result<(), StoreError> {
    let owned = path.to_path_buf();
    let result = tokio::task::spawn_blocking(move || gif::rewrite_file(&owned))
        .await
        .map_err(|err| StoreError::persistent(path, std::io::Error::other(err)))?;
    match result {
        Ok(repaired) => {
            if repaired > 0 {
                debug!("repaired {repaired} frame delays in {:?}", path);
            }
            Ok(())
        }
        // A payload labelled GIF that isn't one is stored as-is.
        Err(gif::GifError::NotGif) => {
            warn!("{:?} is labelled GIF but is not a GIF stream", path);
            Ok(())
        }
        Err(gif::GifError::Io(err)) => Err(StoreError::persistent(path, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn write_uses_canonical_name() {
        let tmp = TempDir::new().unwrap();
        let path = write(tmp.path(), 0, ImageExtension::Jpg, b"jpeg").await.unwrap();
        assert_eq!(path, tmp.path().join("00000001.jpg"));
        assert_eq!(entries(tmp.path()), vec!["00000001.jpg"]);
        assert_eq!(std::fs::read(path).unwrap(), b"jpeg");
    }

    #[tokio::test]
    async fn find_follows_scan_order() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("00000004.gif"), b"g").unwrap();
        std::fs::write(tmp.path().join("00000004.png"), b"p").unwrap();

        let (path, ext) = find(tmp.path(), 3).await.unwrap();
        assert_eq!(ext, ImageExtension::Png);
        assert!(path.ends_with("00000004.png"));
    }

    #[tokio::test]
    async fn legacy_jpeg_spelling_is_found() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("00000002.jpeg"), b"j").unwrap();
        let (_, ext) = find(tmp.path(), 1).await.unwrap();
        assert_eq!(ext, ImageExtension::Jpg);
    }

    #[tokio::test]
    async fn commit_replaces_other_extensions() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("00000001.png"), b"old").unwrap();
        write(tmp.path(), 0, ImageExtension::Jpg, b"new").await.unwrap();
        assert_eq!(entries(tmp.path()), vec!["00000001.jpg"]);
    }

    #[tokio::test]
    async fn failed_rename_keeps_existing_page() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("00000001.png"), b"old").unwrap();
        // A directory squatting on the target name makes the rename fail
        std::fs::create_dir(tmp.path().join("00000001.jpg")).unwrap();

        assert!(write(tmp.path(), 0, ImageExtension::Jpg, b"new").await.is_err());

        assert_eq!(std::fs::read(tmp.path().join("00000001.png")).unwrap(), b"old");
        assert_eq!(entries(tmp.path()), vec!["00000001.jpg", "00000001.png"]);
    }

    #[tokio::test]
    async fn dropped_staged_file_leaves_nothing() {
        let tmp = TempDir::new().unwrap();
        let mut staged = StagedFile::create(tmp.path(), 0).await.unwrap();
        staged.write_all(b"partial").await.unwrap();
        assert_eq!(staged.written(), 7);
        assert!(staged.path().exists());
        drop(staged);

        assert!(entries(tmp.path()).is_empty());
        assert!(find(tmp.path(), 0).await.is_none());
    }

    #[tokio::test]
    async fn staged_file_is_invisible_to_lookup() {
        let tmp = TempDir::new().unwrap();
        let mut staged = StagedFile::create(tmp.path(), 0).await.unwrap();
        staged.write_all(b"partial").await.unwrap();
        assert!(find(tmp.path(), 0).await.is_none());
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), 2, ImageExtension::Png, b"p").await.unwrap();
        assert!(remove(tmp.path(), 2).await.unwrap());
        assert!(!remove(tmp.path(), 2).await.unwrap());
    }

    #[tokio::test]
    async fn staging_in_missing_dir_fails() {
        let tmp = TempDir::new().unwrap();
        let missing = tmp.path().join("nope");
        assert!(matches!(
            StagedFile::create(&missing, 0).await,
            Err(StoreError::PersistentIo { .. })
        ));
    }

    #[tokio::test]
    async fn gif_commit_repairs_delays() {
        let tmp = TempDir::new().unwrap();
        let original = crate::gif::tests::tiny_gif(&[0]);
        let path = write(tmp.path(), 0, ImageExtension::Gif, &original).await.unwrap();
        let stored = std::fs::read(path).unwrap();
        assert_eq!(stored.len(), original.len());
        assert_ne!(stored, original);
        assert!(crate::gif::find_short_delays(&stored).unwrap().is_empty());
    }
}
