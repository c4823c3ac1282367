//! Source tree traversal for archiving.
//!
//! Unreadable entries are reported to the caller instead of aborting the
//! walk, so one locked-down file does not cost the whole backup.

use std::io;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Follow symbolic links
    pub follow_links: bool,

    /// File or directory names to leave out (exact component match)
    pub exclude_patterns: Vec<String>,

    /// Directories pruned wherever they appear below a root, matched by
    /// canonical location
    pub exclude_paths: Vec<PathBuf>,
}

/// Kind of a filesystem entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Dir,
    File,
    Symlink,
    /// Sockets, fifos, device nodes
    Special,
}

/// An entry discovered below a source root
#[derive(Debug, Clone)]
pub struct SourceEntry {
    /// Full path to the entry
    pub path: PathBuf,

    /// Relative path from the root (empty for the root itself)
    pub relative_path: PathBuf,

    pub kind: EntryKind,

    /// Size in bytes (0 for non-files)
    pub size: u64,
}

/// What the walker reports for each visited path
#[derive(Debug)]
pub enum WalkEvent {
    Entry(SourceEntry),
    Unreadable { path: PathBuf, error: io::Error },
}

impl SourceEntry {
    fn from_entry(entry: &DirEntry, root: &Path) -> io::Result<Self> {
        let metadata = entry.metadata()?;
        let path = entry.path().to_path_buf();
        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();

        let file_type = metadata.file_type();
        let kind = if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_dir() {
            EntryKind::Dir
        } else if file_type.is_file() {
            EntryKind::File
        } else {
            EntryKind::Special
        };

        Ok(Self {
            path,
            relative_path,
            kind,
            size: if kind == EntryKind::File { metadata.len() } else { 0 },
        })
    }
}

/// Whether an I/O error means "skip this entry" rather than "abort"
pub fn is_skippable(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::PermissionDenied | io::ErrorKind::NotFound
    )
}

/// Walk a source tree, calling `callback` for every entry (the root first,
/// parents before children).
///
/// Entries that cannot be read are reported as [`WalkEvent::Unreadable`];
/// any other traversal error, or an error returned by the callback, stops
/// the walk.
pub fn walk_source<F>(root: &Path, options: &WalkOptions, mut callback: F) -> io::Result<()>
where
    F: FnMut(WalkEvent) -> io::Result<()>,
{
    let pruned = pruned_paths(root, &options.exclude_paths);
    let walker = WalkDir::new(root)
        .follow_links(options.follow_links)
        .into_iter()
        .filter_entry(|e| {
            !pruned.iter().any(|p| p == e.path())
                && (e.depth() == 0 || !should_exclude(e, &options.exclude_patterns))
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
                let is_loop = e.loop_ancestor().is_some();
                let error = io::Error::from(e);
                if is_skippable(&error) || is_loop {
                    callback(WalkEvent::Unreadable { path, error })?;
                    continue;
                }
                return Err(error);
            }
        };

        match SourceEntry::from_entry(&entry, root) {
            Ok(source_entry) => callback(WalkEvent::Entry(source_entry))?,
            Err(error) if is_skippable(&error) => callback(WalkEvent::Unreadable {
                path: entry.path().to_path_buf(),
                error,
            })?,
            Err(error) => return Err(error),
        }
    }

    Ok(())
}

/// Calculate total size of all regular files below `root`
pub fn calculate_total_size(root: &Path, options: &WalkOptions) -> io::Result<u64> {
    let mut total_size = 0u64;

    walk_source(root, options, |event| {
        if let WalkEvent::Entry(entry) = event {
            total_size += entry.size;
        }
        Ok(())
    })?;

    Ok(total_size)
}

/// Express each excluded path as it will appear while walking `root`.
///
/// Both sides are canonicalized so symlinked or relative spellings still
/// match; paths that do not exist or lie outside `root` are dropped.
fn pruned_paths(root: &Path, exclude_paths: &[PathBuf]) -> Vec<PathBuf> {
    if exclude_paths.is_empty() {
        return Vec::new();
    }
    let Ok(canonical_root) = root.canonicalize() else {
        return Vec::new();
    };
    exclude_paths
        .iter()
        .filter_map(|p| p.canonicalize().ok())
        .filter_map(|p| p.strip_prefix(&canonical_root).ok().map(|rel| root.join(rel)))
        .collect()
}

/// Check if a directory entry should be excluded based on patterns
fn should_exclude(entry: &DirEntry, patterns: &[String]) -> bool {
    let file_name = entry.file_name().to_string_lossy();
    patterns.iter().any(|p| file_name == p.as_str())
}
