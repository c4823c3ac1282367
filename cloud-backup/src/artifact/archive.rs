//! Compressed tar archive of the source trees.
//!
//! Each source is stored under its own final path component, so
//! `/var/www/site/index.html` lands at `www/site/index.html` and extraction
//! never recreates absolute paths.

use crate::fs::walker::{is_skippable, walk_source, EntryKind, WalkEvent, WalkOptions};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Archive label used for a source without a final component (`/`)
const ROOT_LABEL: &str = "rootfs";

/// What went into the archive
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveStats {
    pub files: u64,
    pub dirs: u64,
    pub symlinks: u64,
    /// Uncompressed bytes of regular files
    pub bytes: u64,
    /// Entries left out because they could not be read
    pub skipped: Vec<PathBuf>,
}

/// Pick a unique top-level name for every source.
///
/// Two sources sharing a final component (`/a/data`, `/b/data`) become
/// `data` and `data-2`.
pub fn archive_labels(sources: &[PathBuf]) -> Vec<String> {
    let mut used = HashSet::new();
    sources
        .iter()
        .map(|source| {
            let base = source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| ROOT_LABEL.to_string());
            let mut label = base.clone();
            let mut n = 2;
            while !used.insert(label.clone()) {
                label = format!("{}-{}", base, n);
                n += 1;
            }
            label
        })
        .collect()
}

/// Write a gzip-compressed tar of `sources` to `dest`.
///
/// Unreadable entries are skipped and listed in the returned stats; any
/// other failure aborts.
pub fn create_archive(sources: &[PathBuf], options: &WalkOptions, dest: &Path) -> io::Result<ArchiveStats> {
    let file = File::create(dest)?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(options.follow_links);

    let mut stats = ArchiveStats::default();

    for (source, label) in sources.iter().zip(archive_labels(sources)) {
        debug!("Archiving {} as {}", source.display(), label);

        walk_source(source, options, |event| {
            let entry = match event {
                WalkEvent::Entry(entry) => entry,
                WalkEvent::Unreadable { path, error } => {
                    warn!("Skipping unreadable path {}: {}", path.display(), error);
                    stats.skipped.push(path);
                    return Ok(());
                }
            };

            if entry.kind == EntryKind::Special {
                debug!("Skipping special file {}", entry.path.display());
                return Ok(());
            }

            let name = if entry.relative_path.as_os_str().is_empty() {
                PathBuf::from(&label)
            } else {
                Path::new(&label).join(&entry.relative_path)
            };
            match builder.append_path_with_name(&entry.path, &name) {
                Ok(()) => {
                    match entry.kind {
                        EntryKind::File => {
                            stats.files += 1;
                            stats.bytes += entry.size;
                        }
                        EntryKind::Dir => stats.dirs += 1,
                        EntryKind::Symlink => stats.symlinks += 1,
                        EntryKind::Special => {}
                    }
                    Ok(())
                }
                Err(e) if is_skippable(&e) => {
                    warn!("Skipping unreadable file {}: {}", entry.path.display(), e);
                    stats.skipped.push(entry.path);
                    Ok(())
                }
                Err(e) => Err(io::Error::new(
                    e.kind(),
                    format!("failed to archive {}: {}", entry.path.display(), e),
                )),
            }
        })?;
    }

    let encoder = builder.into_inner()?;
    let writer = encoder.finish()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;

    Ok(stats)
}
