//! In-memory metadata store for tests and ephemeral deployments.

use std::collections::BTreeMap;
use std::sync::Mutex;

use super::{MetadataStore, StoreError};
use crate::project::{ProjectName, ProjectState};
use crate::swap::SwapCompression;

#[derive(Default, Clone)]
struct ProjectRow {
    version: Option<u64>,
    /// Mirrors the SQLite swap row: absent row = never materialized,
    /// present row with `None` stamp = swapped.
    swap_row: bool,
    last_accessed: Option<i64>,
    compression: Option<SwapCompression>,
    urls: BTreeMap<String, String>,
}

#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<BTreeMap<ProjectName, ProjectRow>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_row<T>(&self, project: &ProjectName, f: impl FnOnce(&mut ProjectRow) -> T) -> T {
        let mut rows = self.rows.lock().expect("memory store lock poisoned");
        f(rows.entry(project.clone()).or_default())
    }
}

impl MetadataStore for MemoryStore {
    fn latest_version(&self, project: &ProjectName) -> Result<u64, StoreError> {
        let rows = self.rows.lock().expect("memory store lock poisoned");
        Ok(rows.get(project).and_then(|r| r.version).unwrap_or(0))
    }

    fn set_latest_version(&self, project: &ProjectName, version: u64) -> Result<(), StoreError> {
        self.with_row(project, |row| row.version = Some(version));
        Ok(())
    }

    fn path_for_url(&self, project: &ProjectName, url: &str) -> Result<Option<String>, StoreError> {
        let rows = self.rows.lock().expect("memory store lock poisoned");
        Ok(rows.get(project).and_then(|r| r.urls.get(url).cloned()))
    }

    fn record_url(&self, project: &ProjectName, url: &str, path: &str) -> Result<(), StoreError> {
        self.with_row(project, |row| {
            row.urls.insert(url.to_string(), path.to_string());
        });
        Ok(())
    }

    fn delete_paths(&self, project: &ProjectName, paths: &[String]) -> Result<(), StoreError> {
        self.with_row(project, |row| {
            row.urls.retain(|_, path| !paths.contains(path));
        });
        Ok(())
    }

    fn project_names(&self) -> Result<Vec<ProjectName>, StoreError> {
        let rows = self.rows.lock().expect("memory store lock poisoned");
        Ok(rows
            .iter()
            .filter(|(_, row)| row.version.is_some())
            .map(|(name, _)| name.clone())
            .collect())
    }

    fn last_accessed(&self, project: &ProjectName) -> Result<Option<i64>, StoreError> {
        let rows = self.rows.lock().expect("memory store lock poisoned");
        Ok(rows.get(project).and_then(|r| r.last_accessed))
    }

    fn set_last_accessed(
        &self,
        project: &ProjectName,
        at_millis: Option<i64>,
    ) -> Result<(), StoreError> {
        self.with_row(project, |row| {
            row.swap_row = true;
            row.last_accessed = at_millis;
        });
        Ok(())
    }

    fn oldest_present_project(
        &self,
        excluding: &[ProjectName],
    ) -> Result<Option<ProjectName>, StoreError> {
        let rows = self.rows.lock().expect("memory store lock poisoned");
        Ok(rows
            .iter()
            .filter(|(name, _)| !excluding.contains(name))
            .filter_map(|(name, row)| row.last_accessed.map(|at| (at, name.clone())))
            .min()
            .map(|(_, name)| name))
    }

    fn present_count(&self) -> Result<u64, StoreError> {
        let rows = self.rows.lock().expect("memory store lock poisoned");
        Ok(rows.values().filter(|r| r.last_accessed.is_some()).count() as u64)
    }

    fn total_count(&self) -> Result<u64, StoreError> {
        let rows = self.rows.lock().expect("memory store lock poisoned");
        Ok(rows.values().filter(|r| r.version.is_some()).count() as u64)
    }

    fn swap_compression(
        &self,
        project: &ProjectName,
    ) -> Result<Option<SwapCompression>, StoreError> {
        let rows = self.rows.lock().expect("memory store lock poisoned");
        Ok(rows.get(project).and_then(|r| r.compression))
    }

    fn set_swap_compression(
        &self,
        project: &ProjectName,
        method: SwapCompression,
    ) -> Result<(), StoreError> {
        self.with_row(project, |row| {
            row.swap_row = true;
            row.compression = Some(method);
        });
        Ok(())
    }

    fn project_state(&self, project: &ProjectName) -> Result<ProjectState, StoreError> {
        let rows = self.rows.lock().expect("memory store lock poisoned");
        Ok(match rows.get(project) {
            None => ProjectState::NotPresent,
            Some(row) if !row.swap_row => ProjectState::NotPresent,
            Some(row) if row.last_accessed.is_none() => ProjectState::Swapped,
            Some(_) => ProjectState::Present,
        })
    }

    fn delete_project(&self, project: &ProjectName) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().expect("memory store lock poisoned");
        rows.remove(project);
        Ok(())
    }
}
