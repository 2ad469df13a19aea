//! File relocation between stage directories.
//!
//! Every handoff between stages is a single move. A rename is tried first; when the stage
//! roots live on different filesystems the file is copied and the source removed. Copies
//! are written under a hidden `.partial` name next to the destination and renamed into
//! place, so a destination path never holds a half-written file.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Errors that can occur while relocating files.
#[derive(Debug, Error)]
pub enum RelocateError {
    /// Failed to create the destination directory.
    #[error("Failed to create directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    /// Failed to remove a stale file at the destination.
    #[error("Failed to remove stale destination {path}: {source}")]
    RemoveStale { path: PathBuf, source: io::Error },

    /// Neither rename nor copy could place the file.
    #[error("Failed to move {from} to {to}: {source}")]
    Move {
        from: PathBuf,
        to: PathBuf,
        source: io::Error,
    },

    /// Failed to copy a file.
    #[error("Failed to copy {from} to {to}: {source}")]
    Copy {
        from: PathBuf,
        to: PathBuf,
        source: io::Error,
    },

    /// Failed to remove a file or directory.
    #[error("Failed to remove {path}: {source}")]
    Remove { path: PathBuf, source: io::Error },
}

/// Outcome of publishing one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Moved,
    /// The destination already existed; the staged copy was dropped.
    AlreadyPresent,
}

const PARTIAL_SUFFIX: &str = ".partial";

/// Whether `path` is a copy still being written (or abandoned by a crash).
pub fn is_partial_copy(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with('.') && name.ends_with(PARTIAL_SUFFIX))
}

fn partial_path(to: &Path) -> PathBuf {
    let mut name = OsString::from(".");
    name.push(to.file_name().unwrap_or_default());
    name.push(PARTIAL_SUFFIX);
    to.with_file_name(name)
}

/// Copy `from` to a partial name beside `to`, then rename it into place.
fn copy_then_rename(from: &Path, to: &Path) -> io::Result<()> {
    let partial = partial_path(to);
    if let Err(e) = fs::copy(from, &partial).and_then(|_| fs::rename(&partial, to)) {
        let _ = fs::remove_file(&partial);
        return Err(e);
    }
    Ok(())
}

fn ensure_parent(path: &Path) -> Result<(), RelocateError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| RelocateError::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    Ok(())
}

/// Move `from` to `to`, replacing any stale file already at `to`.
///
/// # Arguments
///
/// * `from` - The produced artifact
/// * `to` - Its location in the next stage
pub fn move_into_place(from: &Path, to: &Path) -> Result<(), RelocateError> {
    ensure_parent(to)?;
    remove_entry(to).map_err(|e| match e {
        RelocateError::Remove { path, source } => RelocateError::RemoveStale { path, source },
        other => other,
    })?;

    // Rename first (same filesystem); fall back to copy + remove across filesystems
    if fs::rename(from, to).is_err() {
        copy_then_rename(from, to).map_err(|source| RelocateError::Move {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
            source,
        })?;
        fs::remove_file(from).map_err(|source| RelocateError::Remove {
            path: from.to_path_buf(),
            source,
        })?;
    }
    debug!(from = %from.display(), to = %to.display(), "Relocated file");
    Ok(())
}

/// Copy `from` to `to`, creating parent directories as needed.
pub fn copy_into_place(from: &Path, to: &Path) -> Result<(), RelocateError> {
    ensure_parent(to)?;
    copy_then_rename(from, to).map_err(|source| RelocateError::Copy {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        source,
    })?;
    Ok(())
}

/// Move a staged file into the published tree.
///
/// An existing file at the destination is kept: publishing the same item twice is a
/// filesystem race, not an error, so the staged file is discarded instead.
pub fn publish_file(staged: &Path, destination: &Path) -> Result<PublishOutcome, RelocateError> {
    if destination.exists() {
        warn!(
            staged = %staged.display(),
            destination = %destination.display(),
            "Publish target already exists, keeping it"
        );
        remove_entry(staged)?;
        return Ok(PublishOutcome::AlreadyPresent);
    }
    move_into_place(staged, destination)?;
    Ok(PublishOutcome::Moved)
}

/// Remove a file or directory tree. A missing entry is not an error.
pub fn remove_entry(path: &Path) -> Result<(), RelocateError> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(RelocateError::Remove {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Remove empty directories under `dir`, deepest first, including `dir` itself when it
/// ends up empty. Returns the number of directories removed.
pub fn remove_empty_dirs(dir: &Path) -> usize {
    let dirs: Vec<PathBuf> = WalkDir::new(dir)
        .contents_first(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
        .map(|e| e.into_path())
        .collect();

    // remove_dir only succeeds on empty directories
    dirs.iter().filter(|d| fs::remove_dir(d).is_ok()).count()
}

/// Delete partial copies an interrupted run left under `dir`. Returns how many were removed.
pub fn remove_partial_copies(dir: &Path) -> Result<usize, RelocateError> {
    let partials: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && is_partial_copy(e.path()))
        .map(|e| e.into_path())
        .collect();

    for partial in &partials {
        remove_entry(partial)?;
    }
    Ok(partials.len())
}

/// Delete everything inside `dir`, keeping `dir` itself.
pub fn purge_dir_contents(dir: &Path) -> Result<usize, RelocateError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(source) => {
            return Err(RelocateError::Remove {
                path: dir.to_path_buf(),
                source,
            })
        }
    };

    let mut removed = 0;
    for entry in entries.filter_map(|e| e.ok()) {
        remove_entry(&entry.path())?;
        removed += 1;
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_move_into_place_creates_parents_and_replaces_stale() {
        let temp_dir = TempDir::new().unwrap();
        let from = temp_dir.path().join("scratch/movies/Film.mkv");
        let to = temp_dir.path().join("converted/movies/Film.mkv");
        write(&from, "fresh");
        write(&to, "stale");

        move_into_place(&from, &to).unwrap();

        assert!(!from.exists());
        assert_eq!(fs::read_to_string(&to).unwrap(), "fresh");
    }

    #[test]
    fn test_move_into_place_missing_source_fails() {
        let temp_dir = TempDir::new().unwrap();
        let result = move_into_place(
            &temp_dir.path().join("missing.mkv"),
            &temp_dir.path().join("out/missing.mkv"),
        );
        assert!(matches!(result, Err(RelocateError::Move { .. })));
    }

    #[test]
    fn test_publish_keeps_existing_destination() {
        let temp_dir = TempDir::new().unwrap();
        let staged = temp_dir.path().join("converted/tv/ep.mkv");
        let dest = temp_dir.path().join("out/tv/ep.mkv");
        write(&staged, "second");
        write(&dest, "first");

        let outcome = publish_file(&staged, &dest).unwrap();

        assert_eq!(outcome, PublishOutcome::AlreadyPresent);
        assert!(!staged.exists());
        assert_eq!(fs::read_to_string(&dest).unwrap(), "first");
    }

    #[test]
    fn test_publish_moves_file() {
        let temp_dir = TempDir::new().unwrap();
        let staged = temp_dir.path().join("converted/tv/ep.mkv");
        let dest = temp_dir.path().join("out/tv/ep.mkv");
        write(&staged, "data");

        assert_eq!(publish_file(&staged, &dest).unwrap(), PublishOutcome::Moved);
        assert_eq!(fs::read_to_string(&dest).unwrap(), "data");
    }

    #[test]
    fn test_remove_empty_dirs_keeps_non_empty() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("movies");
        fs::create_dir_all(root.join("a/b/c")).unwrap();
        write(&root.join("keep/file.nfo"), "x");

        let removed = remove_empty_dirs(&root);

        assert_eq!(removed, 3);
        assert!(!root.join("a").exists());
        assert!(root.join("keep/file.nfo").exists());
        assert!(root.exists());
    }

    #[test]
    fn test_purge_dir_contents() {
        let temp_dir = TempDir::new().unwrap();
        let scratch = temp_dir.path().join("scratch");
        write(&scratch.join("movies/partial.mkv"), "x");
        write(&scratch.join("stray.tmp"), "y");

        assert_eq!(purge_dir_contents(&scratch).unwrap(), 2);
        assert!(scratch.exists());
        assert_eq!(fs::read_dir(&scratch).unwrap().count(), 0);
        assert_eq!(purge_dir_contents(&temp_dir.path().join("absent")).unwrap(), 0);
    }

    #[test]
    fn test_remove_entry_missing_is_ok() {
        let temp_dir = TempDir::new().unwrap();
        assert!(remove_entry(&temp_dir.path().join("nope")).is_ok());
    }

    #[test]
    fn test_copy_fallback_leaves_no_partial() {
        let temp_dir = TempDir::new().unwrap();
        let from = temp_dir.path().join("scratch/Film.mkv");
        let to = temp_dir.path().join("converted/movies/Film.mkv");
        write(&from, "fresh");
        fs::create_dir_all(to.parent().unwrap()).unwrap();

        copy_then_rename(&from, &to).unwrap();

        assert_eq!(fs::read_to_string(&to).unwrap(), "fresh");
        assert!(from.exists());
        let names: Vec<_> = fs::read_dir(to.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![OsString::from("Film.mkv")]);
    }

    #[test]
    fn test_failed_copy_never_creates_destination() {
        let temp_dir = TempDir::new().unwrap();
        let to = temp_dir.path().join("converted/Film.mkv");
        fs::create_dir_all(to.parent().unwrap()).unwrap();

        assert!(copy_then_rename(&temp_dir.path().join("gone.mkv"), &to).is_err());
        assert!(!to.exists());
        assert!(!partial_path(&to).exists());
    }

    #[test]
    fn test_remove_partial_copies() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("converted");
        let done = root.join("movies/Film.mkv");
        write(&done, "complete");
        write(&partial_path(&root.join("movies/Other.mkv")), "trunc");

        assert!(is_partial_copy(&partial_path(&done)));
        assert!(!is_partial_copy(&done));
        assert!(!is_partial_copy(Path::new("movies/.hidden")));
        assert_eq!(remove_partial_copies(&root).unwrap(), 1);
        assert!(done.exists());
        assert_eq!(fs::read_dir(root.join("movies")).unwrap().count(), 1);
    }
}
