use kube::ResourceExt;

use super::api::{ClusterStore, StoreError};
use super::error::Error;
use super::revision::ConcreteRevision;
use super::revision_tag::{RevisionTag, TargetReference, CONCRETE_REVISION_KIND, LOGICAL_GROUP_KIND};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetKind {
    ConcreteRevision,
    LogicalGroup,
}

impl TargetKind {
    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            CONCRETE_REVISION_KIND => Some(TargetKind::ConcreteRevision),
            LOGICAL_GROUP_KIND => Some(TargetKind::LogicalGroup),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("unknown targetRef.kind {0:?}")]
    UnknownKind(String),

    #[error("referenced LogicalGroup {group:?} has no active revision")]
    NoActiveRevision { group: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ResolveError {
    /// The target, or the revision it designates, does not exist (yet)
    pub fn is_reference_not_found(&self) -> bool {
        match self {
            ResolveError::UnknownKind(_) | ResolveError::NoActiveRevision { .. } => true,
            ResolveError::Store(e) => e.is_not_found(),
        }
    }

    /// Only a change to the tag itself can fix an unknown kind
    pub fn is_permanent(&self) -> bool {
        matches!(self, ResolveError::UnknownKind(_))
    }
}

/// Looks up the ConcreteRevision a target reference designates.
/// A LogicalGroup is followed through its active revision.
pub async fn resolve(
    store: &dyn ClusterStore,
    target: &TargetReference,
) -> Result<ConcreteRevision, ResolveError> {
    let revision_name = match TargetKind::parse(&target.kind) {
        Some(TargetKind::ConcreteRevision) => target.name.clone(),
        Some(TargetKind::LogicalGroup) => {
            let group = store.get_group(&target.name).await?;
            group
                .active_revision_name()
                .ok_or_else(|| ResolveError::NoActiveRevision {
                    group: target.name.clone(),
                })?
                .to_string()
        }
        None => return Err(ResolveError::UnknownKind(target.kind.clone())),
    };
    Ok(store.get_revision(&revision_name).await?)
}

/// Checks that must pass before a tag is resolved and installed
pub async fn validate(store: &dyn ClusterStore, tag: &RevisionTag) -> Result<(), Error> {
    let target = &tag.spec.target_ref;
    if target.kind.is_empty() || target.name.is_empty() {
        return Err(Error::ReferenceNotFound("spec.targetRef not set".to_string()));
    }

    // tags and revisions share the injection label namespace
    match store.get_revision(&tag.name_any()).await {
        Err(e) if e.is_not_found() => {}
        _ => {
            return Err(Error::NameAlreadyExists(format!(
                "there is a {CONCRETE_REVISION_KIND} with this name"
            )))
        }
    }

    let lookup = match TargetKind::parse(&target.kind) {
        Some(TargetKind::LogicalGroup) => store.get_group(&target.name).await.map(|_| ()),
        Some(TargetKind::ConcreteRevision) => store.get_revision(&target.name).await.map(|_| ()),
        // reported by resolution
        None => return Ok(()),
    };
    let kind = target.kind.as_str();
    match lookup {
        Ok(()) => Ok(()),
        Err(e) if e.is_not_found() => Err(Error::ReferenceNotFound(format!(
            "referenced {kind} resource does not exist"
        ))),
        Err(e) => Err(Error::Validation(format!(
            "failed to get referenced {kind} resource: {e}"
        ))),
    }
}
