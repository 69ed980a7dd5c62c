use crate::corpus::SequenceCounter;
use crate::oracle::Solution;
use crate::queue::PendingSolution;
use crate::stats::AuditLog;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Byte order for multi-byte encodings.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Endianness {
    #[default]
    Big,
    Little,
}

/// Layout used to turn a [`Solution`] into the bytes the target reads.
///
/// Every variant is a total function: unbound variables become zero and
/// values are truncated to the slot width.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", rename_all_fields = "kebab-case", tag = "kind")]
pub enum InputEncoding {
    /// One byte per variable `sym_0 .. sym_{count-1}`.
    Bytes { count: usize },
    /// `arrays` byte arrays of `min(input_size, max_len)` elements each,
    /// variable `sym_{array}_{index}`, laid out array after array.
    DynamicBytes { max_len: usize, arrays: usize },
    /// One 4-byte integer per variable `sym_0 .. sym_{count-1}`.
    Ints {
        count: usize,
        #[serde(default)]
        endian: Endianness,
    },
}

impl Default for InputEncoding {
    fn default() -> Self {
        InputEncoding::Bytes { count: 64 }
    }
}

impl InputEncoding {
    /// Input size used when a run has no recorded size of its own.
    pub fn max_input_size(&self) -> usize {
        match *self {
            InputEncoding::Bytes { count } | InputEncoding::Ints { count, .. } => count,
            InputEncoding::DynamicBytes { max_len, .. } => max_len,
        }
    }

    pub fn encode(&self, solution: &Solution, input_size: usize) -> Vec<u8> {
        let value = |name: String| solution.get(&name).unwrap_or(0);
        match *self {
            InputEncoding::Bytes { count } => {
                (0..count).map(|i| value(format!("sym_{i}")) as u8).collect()
            }
            InputEncoding::DynamicBytes { max_len, arrays } => {
                let len = input_size.min(max_len);
                let mut data = Vec::with_capacity(len * arrays);
                for array in 0..arrays {
                    for index in 0..len {
                        data.push(value(format!("sym_{array}_{index}")) as u8);
                    }
                }
                data
            }
            InputEncoding::Ints { count, endian } => {
                let mut data = Vec::with_capacity(count * 4);
                for i in 0..count {
                    let v = value(format!("sym_{i}")) as i32;
                    match endian {
                        Endianness::Big => data.extend_from_slice(&v.to_be_bytes()),
                        Endianness::Little => data.extend_from_slice(&v.to_le_bytes()),
                    }
                }
                data
            }
        }
    }
}

#[derive(Error, Debug)]
pub enum MaterializeError {
    #[error("failed to write generated input {path:?}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

/// Turns queued solutions into input files in a temporary directory.
#[derive(Debug)]
pub struct Materializer {
    tmp_dir: PathBuf,
    encoding: InputEncoding,
    file_ids: Arc<SequenceCounter>,
    known_digests: HashSet<[u8; 16]>,
    audit: AuditLog,
}

impl Materializer {
    pub fn new(
        tmp_dir: PathBuf,
        encoding: InputEncoding,
        file_ids: Arc<SequenceCounter>,
        audit: AuditLog,
    ) -> Self {
        Self {
            tmp_dir,
            encoding,
            file_ids,
            known_digests: HashSet::new(),
            audit,
        }
    }

    pub fn encoding(&self) -> &InputEncoding {
        &self.encoding
    }

    /// Writes `pending` as a new file and returns its path, or `None` when
    /// the encoded bytes match an input generated earlier.
    pub fn materialize(
        &mut self,
        pending: &PendingSolution,
    ) -> Result<Option<PathBuf>, MaterializeError> {
        let data = self.encoding.encode(&pending.solution, pending.input_size);
        let digest = md5::compute(&data);
        if self.known_digests.contains(&digest.0) {
            log::debug!("skipping duplicate generated input {digest:x}");
            return Ok(None);
        }

        let path = self.tmp_dir.join(self.file_ids.next_id().to_string());
        write_input(&self.tmp_dir, &path, &data)
            .map_err(|source| MaterializeError::Write {
                path: path.clone(),
                source,
            })?;
        self.known_digests.insert(digest.0);

        self.audit.generation(&path, &format!("{digest:x}"));
        self.audit
            .path_condition(&path, &pending.path_condition.to_string());
        Ok(Some(path))
    }
}

fn write_input(dir: &Path, path: &Path, data: &[u8]) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    fs::write(path, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::PathCondition;
    use crate::stats::{GENERATION_FILE, PC_MAPPING_FILE};
    use tempfile::tempdir;

    fn solution(pairs: &[(&str, i64)]) -> Solution {
        pairs.iter().map(|&(k, v)| (k, v)).collect()
    }

    #[test]
    fn bytes_encoding_zero_fills_unbound_variables() {
        let encoding = InputEncoding::Bytes { count: 4 };
        let data = encoding.encode(&solution(&[("sym_0", 65), ("sym_2", 300)]), 0);
        assert_eq!(data, vec![65, 0, 44, 0]);
    }

    #[test]
    fn dynamic_bytes_respect_input_size_and_maximum() {
        let encoding = InputEncoding::DynamicBytes {
            max_len: 3,
            arrays: 2,
        };
        let s = solution(&[("sym_0_0", 1), ("sym_0_1", 2), ("sym_1_0", 9), ("sym_1_4", 7)]);
        assert_eq!(encoding.encode(&s, 2), vec![1, 2, 9, 0]);
        assert_eq!(encoding.encode(&s, 10), vec![1, 2, 0, 9, 0, 0]);
    }

    #[test]
    fn int_encoding_honours_byte_order() {
        let s = solution(&[("sym_0", 1), ("sym_1", -2)]);
        let big = InputEncoding::Ints {
            count: 2,
            endian: Endianness::Big,
        };
        let little = InputEncoding::Ints {
            count: 2,
            endian: Endianness::Little,
        };
        assert_eq!(big.encode(&s, 0), vec![0, 0, 0, 1, 0xff, 0xff, 0xff, 0xfe]);
        assert_eq!(little.encode(&s, 0), vec![1, 0, 0, 0, 0xfe, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn encoding_is_deterministic() {
        let encoding = InputEncoding::Ints {
            count: 3,
            endian: Endianness::Little,
        };
        let s = solution(&[("sym_1", 12345)]);
        assert_eq!(encoding.encode(&s, 0), encoding.encode(&s, 0));
    }

    #[test]
    fn encoding_parses_from_toml() {
        let encoding: InputEncoding =
            toml::from_str("kind = \"ints\"\ncount = 10\nendian = \"little\"\n").unwrap();
        assert_eq!(
            encoding,
            InputEncoding::Ints {
                count: 10,
                endian: Endianness::Little
            }
        );
        let encoding: InputEncoding =
            toml::from_str("kind = \"dynamic-bytes\"\nmax-len = 8\narrays = 1\n").unwrap();
        assert_eq!(encoding.max_input_size(), 8);
    }

    #[test]
    fn materializer_writes_sequential_files_and_logs_them() {
        let work = tempdir().unwrap();
        let tmp_dir = work.path().join("tmp");
        let audit_dir = work.path().join("audit");
        let mut materializer = Materializer::new(
            tmp_dir.clone(),
            InputEncoding::Bytes { count: 2 },
            Arc::new(SequenceCounter::default()),
            AuditLog::new(audit_dir.clone()),
        );

        let first = PendingSolution {
            path_condition: PathCondition::new(vec!["sym_0 > 100".into()]),
            solution: solution(&[("sym_0", 101)]),
            input_size: 2,
        };
        let second = PendingSolution {
            solution: solution(&[("sym_0", 5)]),
            ..first.clone()
        };

        let a = materializer.materialize(&first).unwrap().unwrap();
        let b = materializer.materialize(&second).unwrap().unwrap();
        assert_eq!(a, tmp_dir.join("0"));
        assert_eq!(b, tmp_dir.join("1"));
        assert_eq!(fs::read(&a).unwrap(), vec![101, 0]);

        let generation = fs::read_to_string(audit_dir.join(GENERATION_FILE)).unwrap();
        assert_eq!(generation.lines().count(), 2);
        let mapping = fs::read_to_string(audit_dir.join(PC_MAPPING_FILE)).unwrap();
        assert!(mapping.contains("sym_0 > 100"));
    }

    #[test]
    fn duplicate_bytes_are_not_written_twice() {
        let work = tempdir().unwrap();
        let mut materializer = Materializer::new(
            work.path().to_path_buf(),
            InputEncoding::Bytes { count: 1 },
            Arc::new(SequenceCounter::default()),
            AuditLog::disabled(),
        );
        let pending = PendingSolution {
            path_condition: PathCondition::default(),
            solution: solution(&[("sym_0", 3)]),
            input_size: 1,
        };
        assert!(materializer.materialize(&pending).unwrap().is_some());
        assert!(materializer.materialize(&pending).unwrap().is_none());
        assert_eq!(fs::read_dir(work.path()).unwrap().count(), 1);
    }
}
