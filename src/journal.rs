// Results journal: JSONL source of truth with a SQLite index

use crate::filter::{Filter, FilterOp, FilterValue};
use crate::jsonl;
use crate::status::{StatusLogEntry, StatusRecorder};
use chrono::Utc;
use eyre::{Context, Result};
use rusqlite::{Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const CURRENT_VERSION: u32 = 1;
const JOURNAL_DIR: &str = ".suitesched";
const LOG_FILE: &str = "status_log.jsonl";
const DB_FILE: &str = "journal.db";

/// Recorded status-log entries, queryable by job, test, host and status
pub struct Journal {
    base_path: PathBuf,
    db: Connection,
}

impl Journal {
    /// Open or create a journal in a `.suitesched` subdirectory of `path`.
    ///
    /// The index is rebuilt from the log when the log changed since the last sync.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let base_path = path.as_ref().join(JOURNAL_DIR);
        fs::create_dir_all(&base_path).context("Failed to create journal directory")?;

        let db = Connection::open(base_path.join(DB_FILE)).context("Failed to open SQLite database")?;
        let mut journal = Self { base_path, db };

        journal.create_schema()?;
        journal.create_gitignore()?;
        journal.write_version()?;

        if journal.is_stale()? {
            info!("Journal index is stale, reindexing from JSONL");
            journal.reindex()?;
        }

        Ok(journal)
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn log_path(&self) -> PathBuf {
        self.base_path.join(LOG_FILE)
    }

    fn create_schema(&self) -> Result<()> {
        debug!("Creating journal schema");

        self.db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS entries (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                job_id INTEGER,
                test_name TEXT NOT NULL,
                hostname TEXT,
                status_code TEXT NOT NULL,
                subdir TEXT,
                timestamp INTEGER NOT NULL,
                data_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_entries_job ON entries(job_id);
            CREATE INDEX IF NOT EXISTS idx_entries_test ON entries(test_name);
            CREATE INDEX IF NOT EXISTS idx_entries_host ON entries(hostname);
            CREATE INDEX IF NOT EXISTS idx_entries_status ON entries(status_code);

            CREATE TABLE IF NOT EXISTS sync_metadata (
                file TEXT PRIMARY KEY,
                last_sync_time INTEGER NOT NULL,
                file_mtime INTEGER NOT NULL
            );
            "#,
        )?;

        Ok(())
    }

    fn create_gitignore(&self) -> Result<()> {
        let gitignore_path = self.base_path.join(".gitignore");
        if !gitignore_path.exists() {
            fs::write(
                gitignore_path,
                format!("{db}\n{db}-shm\n{db}-wal\n", db = DB_FILE),
            )?;
        }
        Ok(())
    }

    fn write_version(&self) -> Result<()> {
        let version_path = self.base_path.join(".version");
        if !version_path.exists() {
            fs::write(version_path, CURRENT_VERSION.to_string())?;
        }
        Ok(())
    }

    fn log_mtime(&self) -> Result<Option<i64>> {
        let path = self.log_path();
        if !path.exists() {
            return Ok(None);
        }
        let mtime = fs::metadata(&path)?
            .modified()?
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Ok(Some(mtime))
    }

    /// True when the log was modified since the index was last synced
    pub fn is_stale(&self) -> Result<bool> {
        let Some(file_mtime) = self.log_mtime()? else {
            return Ok(false);
        };

        let stored_mtime: Option<i64> = self
            .db
            .query_row(
                "SELECT file_mtime FROM sync_metadata WHERE file = ?1",
                [LOG_FILE],
                |row| row.get(0),
            )
            .optional()?;

        Ok(match stored_mtime {
            None => true,
            Some(mtime) => file_mtime > mtime,
        })
    }

    fn insert(db: &Connection, entry: &StatusLogEntry) -> Result<usize> {
        let data_json = serde_json::to_string(entry).context("Failed to serialize entry")?;
        let inserted = db.execute(
            "INSERT OR IGNORE INTO entries
                (id, job_id, test_name, hostname, status_code, subdir, timestamp, data_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                entry.id,
                entry.job_id,
                entry.operation,
                entry.hostname,
                entry.status_code,
                entry.subdir,
                entry.timestamp,
                data_json
            ],
        )?;
        Ok(inserted)
    }

    fn mark_synced(&self) -> Result<()> {
        let file_mtime = self.log_mtime()?.unwrap_or(0);
        self.db.execute(
            "INSERT OR REPLACE INTO sync_metadata (file, last_sync_time, file_mtime)
             VALUES (?1, ?2, ?3)",
            rusqlite::params![LOG_FILE, Utc::now().timestamp_millis(), file_mtime],
        )?;
        Ok(())
    }

    /// Append one entry to the log and the index
    pub fn append(&mut self, entry: &StatusLogEntry) -> Result<()> {
        jsonl::append_jsonl(&self.log_path(), entry)?;
        Self::insert(&self.db, entry)?;
        self.mark_synced()?;
        Ok(())
    }

    /// Rebuild the index from the log; returns the number of entries indexed
    pub fn reindex(&mut self) -> Result<usize> {
        let entries: Vec<StatusLogEntry> = jsonl::read_jsonl_unique(&self.log_path())?;

        let tx = self.db.transaction()?;
        tx.execute("DELETE FROM entries", [])?;
        let mut count = 0;
        for entry in &entries {
            count += Self::insert(&tx, entry)?;
        }
        tx.commit()?;

        self.mark_synced()?;
        info!(count, "Reindexed journal");
        Ok(count)
    }

    /// Entries matching every filter, in recording order
    pub fn list(&self, filters: &[Filter]) -> Result<Vec<StatusLogEntry>> {
        let mut query = String::from("SELECT data_json FROM entries WHERE 1 = 1");
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        for filter in filters {
            query.push_str(&format!(
                " AND {} {} ?{}",
                filter.field.column(),
                filter.op.to_sql(),
                params.len() + 1
            ));
            match (&filter.value, filter.op) {
                (FilterValue::Text(s), FilterOp::Contains) => params.push(Box::new(format!("%{}%", s))),
                (FilterValue::Int(i), FilterOp::Contains) => params.push(Box::new(format!("%{}%", i))),
                (FilterValue::Text(s), _) => params.push(Box::new(s.clone())),
                (FilterValue::Int(i), _) => params.push(Box::new(*i)),
            }
        }
        query.push_str(" ORDER BY seq ASC");

        let mut stmt = self.db.prepare(&query)?;
        let params_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let rows = stmt.query_map(params_refs.as_slice(), |row| row.get::<_, String>(0))?;

        let mut results = Vec::new();
        for row_result in rows {
            let data_json = row_result?;
            let entry: StatusLogEntry = serde_json::from_str(&data_json).context("Failed to deserialize entry")?;
            results.push(entry);
        }

        Ok(results)
    }

    pub fn count(&self) -> Result<usize> {
        let n: i64 = self.db.query_row("SELECT COUNT(*) FROM entries", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

impl StatusRecorder for Journal {
    fn record(&mut self, entry: StatusLogEntry) -> Result<()> {
        self.append(&entry)
    }
}
