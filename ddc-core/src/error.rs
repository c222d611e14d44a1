//! Scale-down error abstractions.

use thiserror::Error;

/// Errors which abort a scale-down pass.
///
/// A pass which is merely waiting on a graceful retirement is not an error. That condition is
/// reported as a regular value by the retirement logic, so nothing here may ever be mistaken
/// for it.
#[derive(Debug, Error)]
pub enum ScaleDownError {
    /// A backend's host could not be parsed for its pod ordinal.
    #[error("malformed backend host identifier `{host}`, expected a trailing pod ordinal")]
    MalformedHostIdentifier { host: String },
    /// The database's master frontend could not be reached.
    #[error("error connecting to master frontend: {0:#}")]
    Connection(#[source] anyhow::Error),
    /// The backend membership of the compute group could not be listed.
    #[error("error listing compute group backends: {0:#}")]
    Membership(#[source] anyhow::Error),
    /// A drop or decommission command was rejected.
    #[error("error issuing backend retirement command: {0:#}")]
    Command(#[source] anyhow::Error),
}

impl ScaleDownError {
    /// Check if this error was raised by a rejected retirement command.
    ///
    /// Only these errors mark the compute group as `ScaleDownFailed`.
    pub fn is_command(&self) -> bool {
        matches!(self, Self::Command(_))
    }
}
