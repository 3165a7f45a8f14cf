use chrono::{DateTime, Utc};
use kube::ResourceExt;

use super::error::Error;
use super::revision::ConcreteRevision;
use super::revision_tag::{
    ConditionReason, ConditionStatus, ConditionType, RevisionTag, RevisionTagCondition,
    RevisionTagStatus,
};
use super::usage::UsageError;

pub fn reconciled_condition(err: Option<&Error>) -> RevisionTagCondition {
    let condition = RevisionTagCondition::new(ConditionType::Reconciled, ConditionStatus::True);
    let Some(err) = err else {
        return condition;
    };

    let reason = err.reason();
    let message = match reason {
        ConditionReason::NameAlreadyExists | ConditionReason::ReferenceNotFound => err.to_string(),
        _ => format!("error reconciling resource: {err}"),
    };
    RevisionTagCondition {
        status: ConditionStatus::False,
        ..condition
    }
    .with_reason(reason, message)
}

pub fn in_use_condition(in_use: &Result<bool, UsageError>) -> RevisionTagCondition {
    match in_use {
        Ok(true) => RevisionTagCondition::new(ConditionType::InUse, ConditionStatus::True)
            .with_reason(
                ConditionReason::ReferencedByWorkloads,
                "Referenced by at least one pod or namespace",
            ),
        Ok(false) => RevisionTagCondition::new(ConditionType::InUse, ConditionStatus::False)
            .with_reason(
                ConditionReason::NotReferenced,
                "Not referenced by any pod or namespace",
            ),
        Err(e) => RevisionTagCondition::new(ConditionType::InUse, ConditionStatus::Unknown)
            .with_reason(
                ConditionReason::UsageCheckFailed,
                format!("failed to determine if revision tag is in use: {e}"),
            ),
    }
}

/// Reconciled's reason if it is not true, else InUse's, else Healthy
pub fn derive_state(
    reconciled: &RevisionTagCondition,
    in_use: &RevisionTagCondition,
) -> ConditionReason {
    if !reconciled.is_true() {
        return reconciled.reason.unwrap_or(ConditionReason::ReconcileError);
    }
    if !in_use.is_true() {
        return in_use.reason.unwrap_or(ConditionReason::UsageCheckFailed);
    }
    ConditionReason::Healthy
}

/// Computes the status to persist, starting from the current one so that
/// the bound revision survives a failed reconcile
pub fn determine_status(
    tag: &RevisionTag,
    revision: Option<&ConcreteRevision>,
    reconciled: RevisionTagCondition,
    in_use: RevisionTagCondition,
    now: DateTime<Utc>,
) -> RevisionTagStatus {
    let mut status = tag.status.clone().unwrap_or_default();
    status.observed_generation = tag.metadata.generation;

    if let (true, Some(revision)) = (reconciled.is_true(), revision) {
        status.revision = Some(revision.name_any());
        status.revision_namespace = Some(revision.spec.namespace.clone());
    }

    status.state = Some(derive_state(&reconciled, &in_use));
    status.set_condition(reconciled, now);
    status.set_condition(in_use, now);
    status
}
