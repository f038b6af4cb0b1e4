//! Attachment resource cache.
//!
//! Attachments are content-addressed by URL and assumed immutable, so a URL
//! fetched once for a project is never downloaded again: the bytes are
//! re-read from the working tree at the path recorded in the URL index. The
//! index entry is written only after a successful download.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

use crate::data::RawFile;
use crate::project::ProjectName;
use crate::store::{MetadataStore, StoreError};

#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("failed to fetch {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("attachment {url} is {size} bytes, at or over the {max} byte limit")]
    TooLarge { url: String, size: u64, max: u64 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outbound transport for attachment URLs. Implementations may fetch
/// distinct URLs concurrently; the cache itself imposes no ordering.
pub trait UrlFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> Result<Bytes, Box<dyn std::error::Error + Send + Sync>>;
}

pub struct UrlResourceCache {
    db: Arc<dyn MetadataStore>,
    fetcher: Arc<dyn UrlFetcher>,
    max_file_size: Option<u64>,
}

impl UrlResourceCache {
    pub fn new(
        db: Arc<dyn MetadataStore>,
        fetcher: Arc<dyn UrlFetcher>,
        max_file_size: Option<u64>,
    ) -> Self {
        Self {
            db,
            fetcher,
            max_file_size,
        }
    }

    /// Resolves one attachment to a file at `new_path`.
    ///
    /// `file_table` is the project's current working tree; `fetched` caches
    /// downloads within a single pull so one snapshot batch never fetches
    /// the same URL twice.
    pub fn get(
        &self,
        project: &ProjectName,
        url: &str,
        new_path: &str,
        file_table: &BTreeMap<String, RawFile>,
        fetched: &mut HashMap<String, Bytes>,
    ) -> Result<RawFile, ResourceError> {
        if let Some(indexed_path) = self.db.path_for_url(project, url)? {
            if let Some(existing) = file_table.get(&indexed_path) {
                tracing::debug!(project = %project, url, path = %indexed_path, "attachment cache hit");
                return Ok(RawFile::new(new_path.to_string(), existing.contents.clone()));
            }
            // Indexed path no longer exists in the tree; fall through and
            // refetch, overwriting the stale entry.
            tracing::debug!(project = %project, url, path = %indexed_path, "stale attachment index entry");
        }

        let contents = match fetched.get(url) {
            Some(contents) => contents.clone(),
            None => {
                let contents = self
                    .fetcher
                    .fetch(url)
                    .map_err(|source| ResourceError::Fetch {
                        url: url.to_string(),
                        source,
                    })?;
                fetched.insert(url.to_string(), contents.clone());
                contents
            }
        };

        if let Some(max) = self.max_file_size {
            let size = contents.len() as u64;
            if size >= max {
                return Err(ResourceError::TooLarge {
                    url: url.to_string(),
                    size,
                    max,
                });
            }
        }

        self.db.record_url(project, url, new_path)?;
        Ok(RawFile::new(new_path.to_string(), contents))
    }
}
