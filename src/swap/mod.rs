//! Cold storage for evicted projects and the watermark-driven swap job.

pub mod job;
pub mod store;

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::project::ProjectName;
use crate::repo::RepoError;
use crate::store::StoreError;

pub use job::{SwapJob, SwapJobConfig};
pub use store::{FsSwapStore, InMemorySwapStore, NoopSwapStore, SwapStore, SwapStoreError};

/// Compression applied to a project archive at eviction time and recorded
/// in the metadata store. Gzip is the only method; the restore path assumes
/// it rather than reading the record back.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapCompression {
    Gzip,
}

impl SwapCompression {
    pub fn as_str(self) -> &'static str {
        match self {
            SwapCompression::Gzip => "gzip",
        }
    }
}

impl FromStr for SwapCompression {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gzip" => Ok(SwapCompression::Gzip),
            _ => Err(()),
        }
    }
}

#[derive(Error, Debug)]
pub enum SwapError {
    #[error("project {project} is not present on disk")]
    NotPresent { project: ProjectName },
    #[error("project {project} is not swapped out")]
    NotSwapped { project: ProjectName },
    #[error(transparent)]
    Store(#[from] SwapStoreError),
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Metadata(#[from] StoreError),
}
