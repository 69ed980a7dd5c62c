use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Defines errors that can arise while reading the watched input directory
/// or publishing files to the export directory.
///
/// None of these abort the control loop: the engine logs them and moves on
/// to the next candidate.
#[derive(Error, Debug)]
pub enum CorpusError {
    /// The watched input directory could not be listed.
    #[error("failed to list input directory {path:?}: {source}")]
    ListDir { path: PathBuf, source: io::Error },

    /// Moving a file into the export directory failed.
    #[error("failed to export {from:?} as {to:?}: {source}")]
    Export {
        from: PathBuf,
        to: PathBuf,
        source: io::Error,
    },
}

/// Monotonically increasing identifier source shared by everything that
/// needs unique file names (export ids, temporary file ids).
///
/// Handed out as an explicit service rather than a global so tests and
/// multiple engines in one process stay independent.
#[derive(Debug)]
pub struct SequenceCounter {
    next: AtomicU64,
}

impl SequenceCounter {
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    /// Returns the next identifier; never returns the same value twice.
    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// The identifier the next call to [`next_id`](Self::next_id) will return.
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::starting_at(0)
    }
}

/// Append-only record of input files already ingested, identified by
/// absolute path, in the order they were first seen.
#[derive(Debug, Default)]
pub struct SeenInputs {
    order: Vec<PathBuf>,
    index: HashSet<PathBuf>,
}

impl SeenInputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.index.contains(path)
    }

    /// Records `path`; returns `false` if it was already known.
    pub fn insert(&mut self, path: PathBuf) -> bool {
        if self.index.insert(path.clone()) {
            self.order.push(path);
            true
        } else {
            false
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Path> {
        self.order.iter().map(PathBuf::as_path)
    }

    /// Lists every non-hidden regular file in `dir` that has not been seen
    /// before, records them, and returns them sorted by file name.
    ///
    /// Files that vanish between listing and inspection are skipped.
    pub fn poll_new_files(&mut self, dir: &Path) -> Result<Vec<PathBuf>, CorpusError> {
        let list_err = |source| CorpusError::ListDir {
            path: dir.to_path_buf(),
            source,
        };
        let absolute_dir = fs::canonicalize(dir).map_err(list_err)?;
        let mut candidates = Vec::new();
        for entry in fs::read_dir(&absolute_dir).map_err(list_err)? {
            let Ok(entry) = entry else { continue };
            let path = entry.path();
            if is_hidden(&path) || !path.is_file() {
                continue;
            }
            candidates.push(path);
        }
        candidates.sort();

        let mut new_files = Vec::new();
        for path in candidates {
            if self.insert(path.clone()) {
                new_files.push(path);
            }
        }
        Ok(new_files)
    }
}

pub fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with('.'))
}

/// Publishes interesting inputs for the external fuzzer under sequential
/// names like `id:000123`.
#[derive(Debug)]
pub struct Exporter {
    export_dir: PathBuf,
    ids: SequenceCounter,
}

impl Exporter {
    pub fn new(export_dir: PathBuf, ids: SequenceCounter) -> Self {
        Self { export_dir, ids }
    }

    pub fn export_dir(&self) -> &Path {
        &self.export_dir
    }

    pub fn file_name(id: u64) -> String {
        format!("id:{id:06}")
    }

    /// Moves `source` into the export directory under the next sequence id.
    ///
    /// A same-filesystem rename is atomic. Across filesystems the content is
    /// first written to a hidden temporary file inside the export directory
    /// and then renamed, so a watcher never sees a partial file.
    pub fn export(&self, source: &Path) -> Result<PathBuf, CorpusError> {
        let target = self.export_dir.join(Self::file_name(self.ids.next_id()));
        let export_err = |source_err| CorpusError::Export {
            from: source.to_path_buf(),
            to: target.clone(),
            source: source_err,
        };
        fs::create_dir_all(&self.export_dir).map_err(export_err)?;
        if fs::rename(source, &target).is_ok() {
            return Ok(target);
        }

        let staged = tempfile::Builder::new()
            .prefix(".export-")
            .tempfile_in(&self.export_dir)
            .map_err(export_err)?;
        fs::copy(source, staged.path()).map_err(export_err)?;
        staged
            .persist(&target)
            .map_err(|persist_err| export_err(persist_err.error))?;
        if let Err(e) = fs::remove_file(source) {
            log::warn!("exported {target:?} but could not remove {source:?}: {e}");
        }
        Ok(target)
    }
}
