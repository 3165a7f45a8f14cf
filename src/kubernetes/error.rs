use crate::error::ErrorList;
use crate::helm::ChartError;

use super::api::StoreError;
use super::resolver::ResolveError;
use super::revision_tag::ConditionReason;
use super::usage::UsageError;

/// Error type for reconciliation of a single RevisionTag
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Another ConcreteRevision already uses the tag's name
    #[error("{0}")]
    NameAlreadyExists(String),

    /// The target reference is unset or points at nothing
    #[error("{0}")]
    ReferenceNotFound(String),

    /// Looking up the target failed for a reason other than absence
    #[error("{0}")]
    Validation(String),

    #[error("failed to retrieve ConcreteRevision for RevisionTag {tag:?}: {cause}")]
    Resolve { tag: String, cause: ResolveError },

    #[error("RevisionTag {0:?} has no uid yet")]
    MissingUid(String),

    #[error("failed to install/update chart \"revisiontags\": {0}")]
    Install(#[source] ChartError),

    #[error("failed to uninstall chart \"revisiontags\": {0}")]
    Uninstall(#[source] ChartError),

    #[error("failed to determine if RevisionTag is in use: {0}")]
    UsageCheck(#[from] UsageError),

    #[error("failed to patch labels: {0}")]
    LabelPatch(#[source] StoreError),

    #[error("failed to patch status: {0}")]
    StatusPatch(#[source] StoreError),

    #[error("failed to update finalizers: {0}")]
    Finalizer(#[source] StoreError),

    #[error("{0}")]
    Multiple(ErrorList<Error>),
}

impl Error {
    /// Joins independent failures; `Ok` when there were none
    pub fn join(errors: ErrorList<Error>) -> Result<(), Error> {
        if errors.len() > 1 {
            return Err(Error::Multiple(errors));
        }
        match errors.into_iter().next() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Reason reported on the Reconciled condition for this failure
    pub fn reason(&self) -> ConditionReason {
        match self {
            Error::NameAlreadyExists(_) => ConditionReason::NameAlreadyExists,
            Error::ReferenceNotFound(_) => ConditionReason::ReferenceNotFound,
            Error::Resolve { cause, .. } if cause.is_reference_not_found() => {
                ConditionReason::ReferenceNotFound
            }
            _ => ConditionReason::ReconcileError,
        }
    }

    /// Whether retrying without a change to the cluster is pointless
    pub fn is_permanent(&self) -> bool {
        match self {
            Error::NameAlreadyExists(_) | Error::ReferenceNotFound(_) => true,
            Error::Resolve { cause, .. } => cause.is_permanent(),
            Error::Multiple(errors) => !errors.is_empty() && errors.iter().all(Error::is_permanent),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::LabelPatch(e) | Error::StatusPatch(e) | Error::Finalizer(e) => e.is_not_found(),
            Error::Multiple(errors) => errors.iter().any(Error::is_not_found),
            _ => false,
        }
    }
}
