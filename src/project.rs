//! Project identity and lifecycle state.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A validated project name.
///
/// Project names come straight out of request paths, so the constructor
/// rejects anything that could escape the repository root: empty names,
/// names starting with `.`, and names containing path separators.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct ProjectName(String);

impl ProjectName {
    pub fn new(name: impl Into<String>) -> Result<Self, ProjectNameError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ProjectNameError::Empty);
        }
        if name.starts_with('.') {
            return Err(ProjectNameError::LeadingDot { name });
        }
        if name.contains('/') || name.contains('\\') {
            return Err(ProjectNameError::PathSeparator { name });
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ProjectName {
    type Err = ProjectNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl<'de> Deserialize<'de> for ProjectName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Self::new(raw).map_err(serde::de::Error::custom)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProjectNameError {
    #[error("project name is empty")]
    Empty,
    #[error("project name starts with a dot: {name:?}")]
    LeadingDot { name: String },
    #[error("project name contains a path separator: {name:?}")]
    PathSeparator { name: String },
}

/// Where a project currently lives.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProjectState {
    /// Never seen before; no repository and no metadata row.
    NotPresent,
    /// Repository is materialized on disk.
    Present,
    /// Repository has been evicted to the swap store.
    Swapped,
}
