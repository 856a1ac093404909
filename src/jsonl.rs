// JSONL file operations

use eyre::{Context, Result};
use fs2::FileExt;
use serde::{Serialize, de::DeserializeOwned};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use tracing::{info, warn};

/// Append a record to a JSONL file under an exclusive lock
pub fn append_jsonl<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .context("Failed to open JSONL file for appending")?;

    file.lock_exclusive().context("Failed to acquire file lock")?;

    let json = serde_json::to_string(record)?;
    writeln!(file, "{}", json)?;
    file.sync_all()?; // Ensure data is flushed to disk

    file.unlock().context("Failed to release file lock")?;
    Ok(())
}

/// Read every record in file order, keeping the first occurrence of each id
///
/// Lines that fail to read or parse are skipped with a warning.
pub fn read_jsonl_unique<T>(path: &Path) -> Result<Vec<T>>
where
    T: DeserializeOwned + HasId,
{
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = File::open(path).context("Failed to open JSONL file")?;
    let reader = BufReader::new(file);
    let mut seen: HashSet<String> = HashSet::new();
    let mut records = Vec::new();

    for (line_num, line) in reader.lines().enumerate() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                warn!(
                    file = ?path,
                    line = line_num + 1,
                    error = ?e,
                    "Failed to read line, skipping"
                );
                continue;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        let record: T = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                warn!(
                    file = ?path,
                    line = line_num + 1,
                    error = ?e,
                    "Failed to parse JSON, skipping"
                );
                continue;
            }
        };

        // Merged logs can carry the same entry twice
        if seen.insert(record.id().to_string()) {
            records.push(record);
        }
    }

    info!(
        file = ?path,
        count = records.len(),
        "Loaded records from JSONL"
    );

    Ok(records)
}

pub trait HasId {
    fn id(&self) -> &str;
}

impl HasId for crate::status::StatusLogEntry {
    fn id(&self) -> &str {
        &self.id
    }
}
