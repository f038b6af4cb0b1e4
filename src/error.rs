//! Crate-level error surface.
//!
//! A thin wrapper over the per-component errors, plus the classification the
//! callers need: whether a failure is an expected user-facing condition or a
//! severe one that should page someone, and a multi-line human-readable
//! rendering for VCS clients (which show server-sent text on refusal).

use thiserror::Error;

use crate::api::ApiError;
use crate::config::ConfigError;
use crate::postback::{PostbackError, PushRejection};
use crate::project::ProjectNameError;
use crate::repo::RepoError;
use crate::resource::ResourceError;
use crate::store::StoreError;
use crate::swap::SwapError;

/// How a failure should be treated operationally.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Severity {
    /// An expected condition the end user can act on (pull again, fix
    /// files, check the project name).
    User,
    /// Likely a systemic problem; logged with full detail, the user sees a
    /// generic message.
    Severe,
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Project(#[from] ProjectNameError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Repo(#[from] RepoError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Swap(#[from] SwapError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The remote rejected the push, immediately or via postback.
    #[error(transparent)]
    Rejected(#[from] PushRejection),

    /// No confirmation arrived within the bounded wait.
    #[error("timed out waiting for push confirmation")]
    PostbackTimeout,

    /// Correlation failures other than timeout/rejection (internal).
    #[error(transparent)]
    Postback(PostbackError),

    #[error("push has {count} files, over the limit of {max}")]
    TooManyFiles { count: usize, max: u64 },

    #[error("file {path} is {size} bytes, at or over the limit of {max}")]
    FileTooLarge { path: String, size: u64, max: u64 },
}

impl Error {
    pub fn severity(&self) -> Severity {
        match self {
            Error::Project(_)
            | Error::TooManyFiles { .. }
            | Error::FileTooLarge { .. } => Severity::User,

            Error::Api(ApiError::NotFound { .. } | ApiError::Forbidden { .. }) => Severity::User,
            Error::Api(_) => Severity::Severe,

            Error::Repo(RepoError::EmbeddedRepository { .. }) => Severity::User,
            Error::Repo(_) => Severity::Severe,

            Error::Rejected(PushRejection::Internal) => Severity::Severe,
            Error::Rejected(_) => Severity::User,

            Error::Resource(ResourceError::TooLarge { .. }) => Severity::User,
            Error::Resource(_) => Severity::Severe,

            Error::Store(_)
            | Error::Swap(_)
            | Error::Config(_)
            | Error::PostbackTimeout
            | Error::Postback(_) => Severity::Severe,
        }
    }

    /// Multi-line explanation rendered to the end user by their VCS client.
    pub fn user_message(&self) -> String {
        match self {
            Error::Api(ApiError::NotFound { project }) => format!(
                "Project {project} was not found.\n\
                 It may never have existed, or it may have been moved or deleted.\n\
                 Check the project URL and try again."
            ),
            Error::Api(ApiError::Forbidden { project }) => format!(
                "You do not have access to project {project}.\n\
                 Ask the project owner for access, or check your credentials."
            ),
            Error::Rejected(PushRejection::OutOfDate) => String::from(
                "The project has changed since your last sync.\n\
                 Pull the latest changes, merge, and push again.",
            ),
            Error::Rejected(PushRejection::InvalidFiles { problems }) => {
                let mut lines = vec![String::from("The remote rejected some files in this push:")];
                lines.extend(problems.iter().cloned());
                lines.join("\n")
            }
            Error::Rejected(PushRejection::InvalidProject { problems }) => {
                let mut lines = vec![String::from("The remote rejected this project:")];
                lines.extend(problems.iter().cloned());
                lines.join("\n")
            }
            Error::Repo(RepoError::EmbeddedRepository { project, path }) => format!(
                "Project {project} contains a nested git repository at {path}.\n\
                 Remove it before syncing."
            ),
            Error::TooManyFiles { count, max } => format!(
                "This push contains {count} files, over the limit of {max}.\n\
                 Remove some files and try again."
            ),
            Error::FileTooLarge { path, size, max } => format!(
                "File {path} is {size} bytes, at or over the limit of {max}.\n\
                 Remove or shrink it and try again."
            ),
            Error::Resource(ResourceError::TooLarge { url, size, max }) => format!(
                "Attachment {url} is {size} bytes, at or over the limit of {max}."
            ),
            Error::Project(err) => err.to_string(),
            // Severe conditions: full detail goes to the log, not the user.
            _ => String::from(
                "Something went wrong processing this request.\n\
                 Please try again later.",
            ),
        }
    }
}
