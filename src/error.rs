use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Spec the controller refuses to act on. Surfaced as a Failed condition
    /// and not retried.
    #[error("{reason}: {message}")]
    InvalidChart { reason: String, message: String },

    /// A live Job needed replacement; the apply deleted it and the requeued
    /// reconcile recreates it.
    #[error("create or replace job {0}")]
    ReplaceJob(String),

    /// The delete Job has not reported success yet.
    #[error("waiting for delete of helm chart {0} by {1}")]
    UninstallPending(String, String),

    #[error("Finalizer error: {0}")]
    Finalizer(#[source] Box<kube::runtime::finalizer::Error<Error>>),
}

/// Short alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn invalid_chart(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidChart {
            reason: reason.into(),
            message: message.into(),
        }
    }

    /// Rejections are terminal until the user edits the spec; everything
    /// else is worth a requeue.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::InvalidChart { .. })
    }
}
