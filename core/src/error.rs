use thiserror::Error;

/// Failures surfaced synchronously from job registration.
#[derive(Debug, Error)]
pub enum ChronError {
    /// The job name is empty or not kebab-case alphanumerics.
    #[error("invalid job name {0:?}: names are dash-separated alphanumeric segments")]
    InvalidName(String),

    /// The registry already contains a job with this name.
    #[error("duplicate job name {0:?}")]
    DuplicateName(String),

    /// The cron expression could not be parsed as five-field syntax.
    #[error("invalid cron expression {expression:?}: {reason}")]
    InvalidCron {
        /// The expression as given.
        expression: String,
        /// Why it was rejected.
        reason: String,
    },
}
