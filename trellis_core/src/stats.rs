use crate::feedback::format_cost;
use crate::trie::TrieStats;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub const TRIE_STATISTICS_FILE: &str = "trie-statistics.csv";
pub const GENERATION_FILE: &str = "generation.csv";
pub const PC_MAPPING_FILE: &str = "pc-mapping.csv";
pub const IMPORT_FILE: &str = "import.csv";
pub const EXPORT_FILE: &str = "export.csv";

/// Append-only CSV trail, one file per event kind. Write failures are
/// logged and never stop exploration.
#[derive(Debug, Clone, Default)]
pub struct AuditLog {
    dir: Option<PathBuf>,
}

impl AuditLog {
    /// Writes into `dir`, creating it on first use.
    pub fn new(dir: PathBuf) -> Self {
        Self { dir: Some(dir) }
    }

    /// Discards every event.
    pub fn disabled() -> Self {
        Self { dir: None }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    fn append(&self, file: &str, line: &str) {
        let Some(dir) = &self.dir else { return };
        if let Err(e) = append_line(dir, file, line) {
            log::warn!("could not append to audit file {file} in {dir:?}: {e}");
        }
    }

    pub fn trie_statistics(&self, stats: &TrieStats, queue_len: usize, seen_inputs: usize) {
        self.append(
            TRIE_STATISTICS_FILE,
            &format!(
                "{},{},{},{},{},{},{},{},{}",
                timestamp(),
                stats.nodes,
                stats.frontier,
                stats.fully_explored,
                stats.unvisited,
                stats.leaves,
                format_cost(stats.best_cost),
                queue_len,
                seen_inputs
            ),
        );
    }

    pub fn generation(&self, file: &Path, digest: &str) {
        self.append(
            GENERATION_FILE,
            &format!("{},{},{digest}", timestamp(), file.display()),
        );
    }

    pub fn path_condition(&self, file: &Path, path_condition: &str) {
        // Commas would split the CSV record.
        let escaped = path_condition.replace(',', "#");
        self.append(PC_MAPPING_FILE, &format!("{},{escaped}", file.display()));
    }

    /// `tags` is the suffix built by [`crate::feedback::ImportOutcome::import_tags`].
    pub fn import(&self, source: &Path, tags: &str) {
        self.append(
            IMPORT_FILE,
            &format!("{},{}{tags}", timestamp(), source.display()),
        );
    }

    /// `tags` is the suffix built by [`crate::feedback::ImportOutcome::export_tags`].
    pub fn export(&self, source: &Path, destination: &Path, tags: &str) {
        self.append(
            EXPORT_FILE,
            &format!(
                "{},{},{}{tags}",
                timestamp(),
                source.display(),
                destination.display()
            ),
        );
    }
}

fn append_line(dir: &Path, file: &str, line: &str) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    let mut handle = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(file))?;
    writeln!(handle, "{line}")
}

fn timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}
