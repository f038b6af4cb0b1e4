//! SQLite-backed metadata store.
//!
//! Three tables: `projects` (latest synchronized version), `swap_table`
//! (last-accessed stamp, NULL while swapped, plus the compression used at
//! eviction) and `url_index` (attachment URL → committed path). Statements
//! run behind a single connection mutex; every critical section is one
//! statement, so unrelated projects only contend for microseconds.

use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};

use super::{MetadataStore, StoreError};
use crate::project::{ProjectName, ProjectState};
use crate::swap::SwapCompression;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS projects (
    name TEXT PRIMARY KEY,
    version_id INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS swap_table (
    project_name TEXT PRIMARY KEY,
    last_accessed INTEGER,
    swap_compression TEXT
);
CREATE TABLE IF NOT EXISTS url_index (
    project_name TEXT NOT NULL,
    url TEXT NOT NULL,
    path TEXT NOT NULL,
    PRIMARY KEY (project_name, url)
);
CREATE INDEX IF NOT EXISTS idx_url_index_project_path
    ON url_index (project_name, path);
";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let conn = self.conn.lock().expect("sqlite connection lock poisoned");
        f(&conn)
    }
}

impl MetadataStore for SqliteStore {
    fn latest_version(&self, project: &ProjectName) -> Result<u64, StoreError> {
        self.with_conn(|conn| {
            let version: Option<i64> = conn
                .query_row(
                    "SELECT version_id FROM projects WHERE name = ?1",
                    params![project.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(version.unwrap_or(0).try_into().unwrap_or(0))
        })
    }

    fn set_latest_version(&self, project: &ProjectName, version: u64) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO projects (name, version_id) VALUES (?1, ?2)
                 ON CONFLICT(name) DO UPDATE SET version_id = excluded.version_id",
                params![project.as_str(), version as i64],
            )?;
            Ok(())
        })
    }

    fn path_for_url(&self, project: &ProjectName, url: &str) -> Result<Option<String>, StoreError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT path FROM url_index WHERE project_name = ?1 AND url = ?2",
                    params![project.as_str(), url],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    fn record_url(&self, project: &ProjectName, url: &str, path: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO url_index (project_name, url, path) VALUES (?1, ?2, ?3)
                 ON CONFLICT(project_name, url) DO UPDATE SET path = excluded.path",
                params![project.as_str(), url, path],
            )?;
            Ok(())
        })
    }

    fn delete_paths(&self, project: &ProjectName, paths: &[String]) -> Result<(), StoreError> {
        if paths.is_empty() {
            return Ok(());
        }
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare_cached("DELETE FROM url_index WHERE project_name = ?1 AND path = ?2")?;
            for path in paths {
                stmt.execute(params![project.as_str(), path])?;
            }
            Ok(())
        })
    }

    fn project_names(&self) -> Result<Vec<ProjectName>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT name FROM projects ORDER BY name")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let mut names = Vec::new();
            for raw in rows {
                let raw = raw?;
                let name = ProjectName::new(raw.clone())
                    .map_err(|e| StoreError::Corrupt(format!("project name {raw:?}: {e}")))?;
                names.push(name);
            }
            Ok(names)
        })
    }

    fn last_accessed(&self, project: &ProjectName) -> Result<Option<i64>, StoreError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT last_accessed FROM swap_table WHERE project_name = ?1",
                    params![project.as_str()],
                    |row| row.get::<_, Option<i64>>(0),
                )
                .optional()?
                .flatten())
        })
    }

    fn set_last_accessed(
        &self,
        project: &ProjectName,
        at_millis: Option<i64>,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO swap_table (project_name, last_accessed) VALUES (?1, ?2)
                 ON CONFLICT(project_name) DO UPDATE SET last_accessed = excluded.last_accessed",
                params![project.as_str(), at_millis],
            )?;
            Ok(())
        })
    }

    fn oldest_present_project(
        &self,
        excluding: &[ProjectName],
    ) -> Result<Option<ProjectName>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT project_name FROM swap_table
                 WHERE last_accessed IS NOT NULL
                 ORDER BY last_accessed ASC",
            )?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            for raw in rows {
                let raw = raw?;
                if excluding.iter().any(|p| p.as_str() == raw) {
                    continue;
                }
                return ProjectName::new(raw.clone())
                    .map(Some)
                    .map_err(|e| StoreError::Corrupt(format!("project name {raw:?}: {e}")));
            }
            Ok(None)
        })
    }

    fn present_count(&self) -> Result<u64, StoreError> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM swap_table WHERE last_accessed IS NOT NULL",
                [],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }

    fn total_count(&self) -> Result<u64, StoreError> {
        self.with_conn(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM projects", [], |row| row.get(0))?;
            Ok(count as u64)
        })
    }

    fn swap_compression(
        &self,
        project: &ProjectName,
    ) -> Result<Option<SwapCompression>, StoreError> {
        self.with_conn(|conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT swap_compression FROM swap_table WHERE project_name = ?1",
                    params![project.as_str()],
                    |row| row.get(0),
                )
                .optional()?
                .flatten();
            match raw {
                None => Ok(None),
                Some(raw) => SwapCompression::from_str(&raw)
                    .map(Some)
                    .map_err(|_| StoreError::Corrupt(format!("swap compression {raw:?}"))),
            }
        })
    }

    fn set_swap_compression(
        &self,
        project: &ProjectName,
        method: SwapCompression,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO swap_table (project_name, swap_compression) VALUES (?1, ?2)
                 ON CONFLICT(project_name)
                 DO UPDATE SET swap_compression = excluded.swap_compression",
                params![project.as_str(), method.as_str()],
            )?;
            Ok(())
        })
    }

    fn project_state(&self, project: &ProjectName) -> Result<ProjectState, StoreError> {
        self.with_conn(|conn| {
            let row: Option<Option<i64>> = conn
                .query_row(
                    "SELECT last_accessed FROM swap_table WHERE project_name = ?1",
                    params![project.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(match row {
                None => ProjectState::NotPresent,
                Some(None) => ProjectState::Swapped,
                Some(Some(_)) => ProjectState::Present,
            })
        })
    }

    fn delete_project(&self, project: &ProjectName) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM url_index WHERE project_name = ?1",
                params![project.as_str()],
            )?;
            conn.execute(
                "DELETE FROM swap_table WHERE project_name = ?1",
                params![project.as_str()],
            )?;
            conn.execute(
                "DELETE FROM projects WHERE name = ?1",
                params![project.as_str()],
            )?;
            Ok(())
        })
    }
}
