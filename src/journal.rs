//! Append-only JSONL journal of backtest results.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::model::{ArtifactId, ExperimentId, InvocationId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub ts_ms: u64,
    pub experiment_id: ExperimentId,
    pub invocation_id: InvocationId,
    pub strategy_id: String,
    pub result_ref: ArtifactId,
    pub metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    pub seed: u64,
    pub environment_hash: String,
}

#[derive(Debug)]
pub struct Journal {
    file: File,
    path: PathBuf,
}

impl Journal {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, entry: &JournalEntry) -> Result<()> {
        let line = serde_json::to_string(entry)?;
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        self.file.flush()?;
        Ok(())
    }

    /// Read entries back, skipping lines that do not parse (a torn final write).
    pub fn replay(path: impl AsRef<Path>) -> Result<Vec<JournalEntry>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(vec![]);
        }
        let reader = BufReader::new(File::open(path)?);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(entry) = serde_json::from_str::<JournalEntry>(&line) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::tempdir;

    fn entry(n: u64) -> JournalEntry {
        let mut metrics = BTreeMap::new();
        metrics.insert("sharpe".to_string(), 1.25);
        JournalEntry {
            ts_ms: n,
            experiment_id: ExperimentId::from("exp-1"),
            invocation_id: InvocationId::from(format!("inv-{n}")),
            strategy_id: "ema_cross".into(),
            result_ref: ArtifactId::from("c".repeat(64)),
            metrics,
            parameters: BTreeMap::new(),
            seed: 7,
            environment_hash: "env".into(),
        }
    }

    #[test]
    fn test_append_and_replay() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("results.jsonl");
        {
            let mut j = Journal::open(&path).unwrap();
            j.append(&entry(1)).unwrap();
            j.append(&entry(2)).unwrap();
        }
        let entries = Journal::replay(&path).unwrap();
        assert_eq!(entries, vec![entry(1), entry(2)]);
    }

    #[test]
    fn test_torn_line_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("results.jsonl");
        {
            let mut j = Journal::open(&path).unwrap();
            j.append(&entry(1)).unwrap();
        }
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"{\"ts_ms\": 2, \"experim").unwrap();
        assert_eq!(Journal::replay(&path).unwrap().len(), 1);
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        assert!(Journal::replay(dir.path().join("absent.jsonl")).unwrap().is_empty());
    }
}
