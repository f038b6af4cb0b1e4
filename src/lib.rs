#![forbid(unsafe_code)]

pub mod api;
pub mod bridge;
pub mod config;
pub mod data;
pub mod error;
pub mod lock;
pub mod postback;
pub mod project;
pub mod repo;
pub mod resource;
pub mod store;
pub mod swap;
pub mod telemetry;

pub use error::{Error, Severity};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the types most callers need at the crate root.
pub use crate::api::{ApiError, SnapshotApi, SubmitOutcome, VersionInfo};
pub use crate::bridge::Bridge;
pub use crate::config::BridgeConfig;
pub use crate::data::{
    Attachment, CandidateSnapshot, CommitAuthor, RawDirectory, RawFile, Snapshot,
};
pub use crate::postback::{PostbackCorrelator, PushRejection};
pub use crate::project::{ProjectName, ProjectState};
