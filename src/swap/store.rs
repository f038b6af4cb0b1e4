//! Pluggable blob stores for evicted project archives.
//!
//! `is_safe` reports whether the backend durably persists data. The no-op
//! and in-memory stores exist for tests and for deployments that never
//! evict; configuration refuses to pair them with real eviction.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Mutex;

use thiserror::Error;

use crate::project::ProjectName;

#[derive(Error, Debug)]
pub enum SwapStoreError {
    #[error("no archive stored for project {project}")]
    NoArchive { project: ProjectName },
    #[error("swap store upload failed: {0}")]
    Upload(#[source] io::Error),
    #[error("swap store download failed: {0}")]
    Download(#[source] io::Error),
    #[error("swap store io error: {0}")]
    Io(#[from] io::Error),
}

pub trait SwapStore: Send + Sync {
    fn upload(
        &self,
        project: &ProjectName,
        data: Box<dyn Read + Send>,
        content_length: u64,
    ) -> Result<(), SwapStoreError>;

    fn download(&self, project: &ProjectName) -> Result<Box<dyn Read + Send>, SwapStoreError>;

    fn remove(&self, project: &ProjectName) -> Result<(), SwapStoreError>;

    /// Whether this backend durably persists uploads.
    fn is_safe(&self) -> bool;
}

/// Discards uploads. Only useful when eviction is disabled.
#[derive(Default)]
pub struct NoopSwapStore;

impl SwapStore for NoopSwapStore {
    fn upload(
        &self,
        _project: &ProjectName,
        _data: Box<dyn Read + Send>,
        _content_length: u64,
    ) -> Result<(), SwapStoreError> {
        Ok(())
    }

    fn download(&self, project: &ProjectName) -> Result<Box<dyn Read + Send>, SwapStoreError> {
        Err(SwapStoreError::NoArchive {
            project: project.clone(),
        })
    }

    fn remove(&self, _project: &ProjectName) -> Result<(), SwapStoreError> {
        Ok(())
    }

    fn is_safe(&self) -> bool {
        false
    }
}

/// Holds archives in memory. For tests.
#[derive(Default)]
pub struct InMemorySwapStore {
    blobs: Mutex<HashMap<ProjectName, Vec<u8>>>,
}

impl InMemorySwapStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, project: &ProjectName) -> bool {
        self.blobs
            .lock()
            .expect("swap blob lock poisoned")
            .contains_key(project)
    }
}

impl SwapStore for InMemorySwapStore {
    fn upload(
        &self,
        project: &ProjectName,
        mut data: Box<dyn Read + Send>,
        content_length: u64,
    ) -> Result<(), SwapStoreError> {
        let mut blob = Vec::with_capacity(content_length as usize);
        data.read_to_end(&mut blob).map_err(SwapStoreError::Upload)?;
        self.blobs
            .lock()
            .expect("swap blob lock poisoned")
            .insert(project.clone(), blob);
        Ok(())
    }

    fn download(&self, project: &ProjectName) -> Result<Box<dyn Read + Send>, SwapStoreError> {
        let blobs = self.blobs.lock().expect("swap blob lock poisoned");
        match blobs.get(project) {
            Some(blob) => Ok(Box::new(io::Cursor::new(blob.clone()))),
            None => Err(SwapStoreError::NoArchive {
                project: project.clone(),
            }),
        }
    }

    fn remove(&self, project: &ProjectName) -> Result<(), SwapStoreError> {
        self.blobs
            .lock()
            .expect("swap blob lock poisoned")
            .remove(project);
        Ok(())
    }

    fn is_safe(&self) -> bool {
        false
    }
}

/// Stores archives as files under a directory, e.g. a mounted object store
/// or a separate disk.
pub struct FsSwapStore {
    dir: PathBuf,
}

impl FsSwapStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, SwapStoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn archive_path(&self, project: &ProjectName) -> PathBuf {
        self.dir.join(format!("{}.tar.gz", project.as_str()))
    }
}

impl SwapStore for FsSwapStore {
    fn upload(
        &self,
        project: &ProjectName,
        mut data: Box<dyn Read + Send>,
        _content_length: u64,
    ) -> Result<(), SwapStoreError> {
        let path = self.archive_path(project);
        let tmp = path.with_extension("tmp");
        let mut out = fs::File::create(&tmp).map_err(SwapStoreError::Upload)?;
        io::copy(&mut data, &mut out).map_err(SwapStoreError::Upload)?;
        out.sync_all().map_err(SwapStoreError::Upload)?;
        fs::rename(&tmp, &path).map_err(SwapStoreError::Upload)?;
        Ok(())
    }

    fn download(&self, project: &ProjectName) -> Result<Box<dyn Read + Send>, SwapStoreError> {
        match fs::File::open(self.archive_path(project)) {
            Ok(file) => Ok(Box::new(file)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(SwapStoreError::NoArchive {
                project: project.clone(),
            }),
            Err(err) => Err(SwapStoreError::Download(err)),
        }
    }

    fn remove(&self, project: &ProjectName) -> Result<(), SwapStoreError> {
        match fs::remove_file(self.archive_path(project)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(SwapStoreError::Io(err)),
        }
    }

    fn is_safe(&self) -> bool {
        true
    }
}
