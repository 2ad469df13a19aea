//! Scanner module for discovering intake entries and media files.
//!
//! Jobs are the top-level entries (files or directories) of each category directory
//! under the incoming root. Inside a job, files with a media extension are classified;
//! everything else is carried along untouched.

use crate::relocate::is_partial_copy;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Media file extensions (case-insensitive matching).
pub const MEDIA_EXTENSIONS: &[&str] = &[".mkv", ".mp4", ".avi", ".mov", ".m4v", ".ts", ".m2ts"];

/// One top-level entry under a category directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobEntry {
    /// Category directory name (e.g. `movies`).
    pub category: String,
    /// Path relative to the incoming root, starting with the category.
    pub relative: PathBuf,
    /// Full path under the incoming root.
    pub absolute: PathBuf,
}

impl JobEntry {
    pub fn is_dir(&self) -> bool {
        self.absolute.is_dir()
    }
}

/// Checks if a file has a media extension (case-insensitive).
pub fn is_media_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext_lower = format!(".{}", ext.to_lowercase());
            MEDIA_EXTENSIONS.contains(&ext_lower.as_str())
        })
        .unwrap_or(false)
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().map(|n| n.starts_with('.')).unwrap_or(false)
}

/// Lists the top-level entries of every category directory, sorted by relative path.
///
/// Hidden entries are skipped. A category directory that does not exist yet yields
/// nothing; any other read error is returned.
pub fn list_job_entries(incoming_root: &Path, categories: &[String]) -> io::Result<Vec<JobEntry>> {
    let mut entries = Vec::new();

    for category in categories {
        let category_dir = incoming_root.join(category);
        let read = match fs::read_dir(&category_dir) {
            Ok(read) => read,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };

        for entry in read.filter_map(|e| e.ok()) {
            let name = entry.file_name();
            if is_hidden(&name) {
                continue;
            }
            entries.push(JobEntry {
                category: category.clone(),
                relative: Path::new(category).join(&name),
                absolute: entry.path(),
            });
        }
    }

    entries.sort_by(|a, b| a.relative.cmp(&b.relative));
    Ok(entries)
}

/// Every regular file under `path` (or `path` itself when it is a file), skipping
/// hidden directories and partial copies. Sorted for deterministic processing order.
pub fn files_under(path: &Path) -> Vec<PathBuf> {
    let walker = WalkDir::new(path)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            // Allow the root even if it starts with '.'
            !(entry.depth() > 0 && entry.file_type().is_dir() && is_hidden(entry.file_name()))
        });

    walker
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && !is_partial_copy(e.path()))
        .map(|e| e.into_path())
        .collect()
}

/// Media files under `path`, as returned by [`files_under`].
pub fn media_files_under(path: &Path) -> Vec<PathBuf> {
    files_under(path)
        .into_iter()
        .filter(|p| is_media_file(p))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::fs::File;
    use tempfile::TempDir;

    #[test]
    fn test_is_media_file() {
        assert!(is_media_file(Path::new("/media/movie.mkv")));
        assert!(is_media_file(Path::new("/media/movie.MKV"))); // case-insensitive
        assert!(is_media_file(Path::new("/media/movie.Mp4")));
        assert!(is_media_file(Path::new("/media/movie.avi")));
        assert!(!is_media_file(Path::new("/media/movie.nfo")));
        assert!(!is_media_file(Path::new("/media/movie.srt")));
        assert!(!is_media_file(Path::new("/media/movie"))); // no extension
    }

    #[test]
    fn test_list_job_entries() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir_all(root.join("movies/Film (2001)")).unwrap();
        File::create(root.join("movies/Short.mp4")).unwrap();
        File::create(root.join("movies/.partial")).unwrap();
        fs::create_dir_all(root.join("other/ignored")).unwrap();

        let entries =
            list_job_entries(root, &["tv".to_string(), "movies".to_string()]).unwrap();

        let relative: Vec<_> = entries.iter().map(|e| e.relative.clone()).collect();
        assert_eq!(
            relative,
            vec![
                PathBuf::from("movies/Film (2001)"),
                PathBuf::from("movies/Short.mp4"),
            ]
        );
        assert_eq!(entries[0].category, "movies");
        assert!(entries[0].is_dir());
        assert_eq!(entries[1].absolute, root.join("movies/Short.mp4"));
    }

    #[test]
    fn test_media_files_under_skips_hidden_dirs() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("Show");
        fs::create_dir_all(root.join("Season 1")).unwrap();
        fs::create_dir_all(root.join(".cache")).unwrap();
        File::create(root.join("Season 1/e01.mkv")).unwrap();
        File::create(root.join("Season 1/e01.srt")).unwrap();
        File::create(root.join(".cache/e02.mkv")).unwrap();

        assert_eq!(media_files_under(&root), vec![root.join("Season 1/e01.mkv")]);
        assert_eq!(files_under(&root).len(), 2);
    }

    #[test]
    fn test_files_under_skips_partial_copies() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("Film");
        fs::create_dir_all(&root).unwrap();
        File::create(root.join("Film.mkv")).unwrap();
        File::create(root.join(".Other.mkv.partial")).unwrap();

        assert_eq!(files_under(&root), vec![root.join("Film.mkv")]);
    }

    #[test]
    fn test_files_under_single_file() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("Film.avi");
        File::create(&file).unwrap();
        assert_eq!(media_files_under(&file), vec![file]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_media_extension_case_insensitive(
            stem in "[a-zA-Z0-9_]{1,16}",
            ext_idx in 0usize..MEDIA_EXTENSIONS.len(),
            upper in proptest::bool::ANY,
        ) {
            let ext = MEDIA_EXTENSIONS[ext_idx].trim_start_matches('.');
            let ext = if upper { ext.to_uppercase() } else { ext.to_string() };
            let path = PathBuf::from(format!("/media/{}.{}", stem, ext));
            prop_assert!(is_media_file(&path));
        }
    }
}
