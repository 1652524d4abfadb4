use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

/// Which path a cleanup call took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// The version's log and checkpoint trees were deleted.
    Deleted,
    /// Deletion failed; the trees were renamed with an `_old` suffix.
    Renamed,
    /// Nothing existed to clean.
    NoOp,
    /// Cleanup gave up. Never escalated to the caller's error path.
    IgnoredFailure(String),
}

/// Discards the artifacts of a failed attempt.
pub trait ArtifactCleanup {
    /// Clean the log and checkpoint trees belonging to `checkpoint_dir`
    /// (a `.../checkpoints/version_<run>` path). Must not fail.
    fn clean(&mut self, checkpoint_dir: &Path) -> CleanupOutcome;
}

/// Filesystem operations used by [`ArtifactCleaner`].
pub trait ArtifactFs {
    fn exists(&self, path: &Path) -> bool;
    fn remove_dir_all(&self, path: &Path) -> io::Result<()>;
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
}

/// The real filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdFs;

impl ArtifactFs for StdFs {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir_all(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }
}

/// Deletes `logs/<version>` and `checkpoints/<version>` under the run
/// directory, falling back to renaming them when deletion fails.
#[derive(Debug, Clone, Default)]
pub struct ArtifactCleaner<F: ArtifactFs = StdFs> {
    fs: F,
}

impl ArtifactCleaner<StdFs> {
    pub fn new() -> Self {
        ArtifactCleaner { fs: StdFs }
    }
}

impl<F: ArtifactFs> ArtifactCleaner<F> {
    pub fn with_fs(fs: F) -> Self {
        ArtifactCleaner { fs }
    }

    /// The two trees owned by the version, or `None` if the path is not a
    /// `checkpoints/version_*` directory.
    pub fn targets(checkpoint_dir: &Path) -> Option<[PathBuf; 2]> {
        let version = checkpoint_dir.file_name()?.to_str()?;
        if !version.starts_with("version_") {
            return None;
        }
        let checkpoints = checkpoint_dir.parent()?;
        if checkpoints.file_name()?.to_str()? != "checkpoints" {
            return None;
        }
        let run_dir = checkpoints.parent()?;
        Some([
            run_dir.join("logs").join(version),
            run_dir.join("checkpoints").join(version),
        ])
    }

    /// First free `<name>_old`, `<name>_old_1`, ... next to `path`.
    fn quarantine_path(&self, path: &Path) -> PathBuf {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut candidate = path.with_file_name(format!("{name}_old"));
        let mut suffix = 1;
        while self.fs.exists(&candidate) {
            candidate = path.with_file_name(format!("{name}_old_{suffix}"));
            suffix += 1;
        }
        candidate
    }
}

impl<F: ArtifactFs> ArtifactCleanup for ArtifactCleaner<F> {
    fn clean(&mut self, checkpoint_dir: &Path) -> CleanupOutcome {
        let Some(targets) = Self::targets(checkpoint_dir) else {
            warn!(
                path = %checkpoint_dir.display(),
                "refusing to clean a directory outside checkpoints/version_*"
            );
            return CleanupOutcome::IgnoredFailure(format!(
                "{} is not a checkpoints/version_* directory",
                checkpoint_dir.display()
            ));
        };

        let existing: Vec<&PathBuf> = targets.iter().filter(|p| self.fs.exists(p)).collect();
        if existing.is_empty() {
            debug!(path = %checkpoint_dir.display(), "no artifacts to clean");
            return CleanupOutcome::NoOp;
        }

        let deleted = existing.iter().try_for_each(|p| self.fs.remove_dir_all(p));
        let err = match deleted {
            Ok(()) => {
                info!(path = %checkpoint_dir.display(), "removed artifacts of failed attempt");
                return CleanupOutcome::Deleted;
            }
            Err(err) => err,
        };

        warn!(error = %err, "could not delete artifacts, renaming them instead");
        let renamed = existing
            .iter()
            .filter(|p| self.fs.exists(p))
            .try_for_each(|p| {
                let target = self.quarantine_path(p);
                debug!(from = %p.display(), to = %target.display(), "quarantining");
                self.fs.rename(p, &target)
            });
        match renamed {
            Ok(()) => CleanupOutcome::Renamed,
            Err(err) => {
                warn!(error = %err, "artifact cleanup failed, continuing");
                CleanupOutcome::IgnoredFailure(err.to_string())
            }
        }
    }
}
