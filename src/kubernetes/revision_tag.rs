use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const API_VERSION: &str = "revtag.mesh.dev/v1alpha1";

pub const REVISION_TAG_KIND: &str = "RevisionTag";
pub const CONCRETE_REVISION_KIND: &str = "ConcreteRevision";
pub const LOGICAL_GROUP_KIND: &str = "LogicalGroup";

/// Points a tag at the release it should follow
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub struct TargetReference {
    /// `LogicalGroup` or `ConcreteRevision`.
    /// Kept as a string so that an unknown kind reaches the controller and is
    /// reported in status instead of failing deserialization in the watcher.
    #[serde(default)]
    pub kind: String,

    /// Name of the referenced object
    #[serde(default)]
    pub name: String,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub enum ConditionType {
    Reconciled,
    InUse,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// Reasons attached to conditions. The aggregate `status.state` is also one of these.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash, JsonSchema)]
pub enum ConditionReason {
    NameAlreadyExists,
    ReferenceNotFound,
    ReconcileError,
    ReferencedByWorkloads,
    NotReferenced,
    UsageCheckFailed,
    Healthy,
}

impl ConditionReason {
    pub const ALL: [ConditionReason; 7] = [
        ConditionReason::NameAlreadyExists,
        ConditionReason::ReferenceNotFound,
        ConditionReason::ReconcileError,
        ConditionReason::ReferencedByWorkloads,
        ConditionReason::NotReferenced,
        ConditionReason::UsageCheckFailed,
        ConditionReason::Healthy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionReason::NameAlreadyExists => "NameAlreadyExists",
            ConditionReason::ReferenceNotFound => "ReferenceNotFound",
            ConditionReason::ReconcileError => "ReconcileError",
            ConditionReason::ReferencedByWorkloads => "ReferencedByWorkloads",
            ConditionReason::NotReferenced => "NotReferenced",
            ConditionReason::UsageCheckFailed => "UsageCheckFailed",
            ConditionReason::Healthy => "Healthy",
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RevisionTagCondition {
    #[serde(rename = "type")]
    pub type_: ConditionType,

    pub status: ConditionStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<ConditionReason>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// Last time the condition's status changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl RevisionTagCondition {
    pub fn new(type_: ConditionType, status: ConditionStatus) -> Self {
        Self {
            type_,
            status,
            reason: None,
            message: String::new(),
            last_transition_time: None,
        }
    }

    pub fn with_reason(mut self, reason: ConditionReason, message: impl Into<String>) -> Self {
        self.reason = Some(reason);
        self.message = message.into();
        self
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// RevisionTag status information
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RevisionTagStatus {
    /// Generation of the spec last processed by the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<RevisionTagCondition>,

    /// Aggregate of the conditions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ConditionReason>,

    /// The ConcreteRevision the tag is bound to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,

    /// Namespace the tag's release was installed into
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_namespace: Option<String>,
}

impl RevisionTagStatus {
    pub fn condition(&self, type_: ConditionType) -> Option<&RevisionTagCondition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Replaces the condition of the same type. The transition time moves
    /// only when the status itself changes.
    pub fn set_condition(&mut self, mut condition: RevisionTagCondition, now: DateTime<Utc>) {
        match self.conditions.iter_mut().find(|c| c.type_ == condition.type_) {
            Some(existing) => {
                condition.last_transition_time = if existing.status == condition.status {
                    existing.last_transition_time.or(Some(now))
                } else {
                    Some(now)
                };
                *existing = condition;
            }
            None => {
                condition.last_transition_time = Some(now);
                self.conditions.push(condition);
            }
        }
    }
}

/// RevisionTag spec fields
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[kube(
    group = "revtag.mesh.dev",
    version = "v1alpha1",
    kind = "RevisionTag",
    shortname = "revtag",
    status = "RevisionTagStatus",
    printcolumn = r#"{"name":"Status", "jsonPath":".status.state", "type":"string"}"#,
    printcolumn = r#"{"name":"In Use", "jsonPath":".status.conditions[?(@.type==\"InUse\")].status", "type":"string"}"#,
    printcolumn = r#"{"name":"Revision", "jsonPath":".status.revision", "type":"string"}"#,
    printcolumn = r#"{"name":"Age", "jsonPath":".metadata.creationTimestamp", "type":"date"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RevisionTagSpec {
    pub target_ref: TargetReference,
}

impl RevisionTag {
    pub fn bound_namespace(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.revision_namespace.as_deref())
    }

    /// Owner reference stamped on everything installed for this tag, so the
    /// release is garbage collected with it. `None` until the API server
    /// has assigned a UID.
    pub fn child_owner_reference(&self) -> Option<OwnerReference> {
        Some(OwnerReference {
            api_version: String::from(API_VERSION),
            kind: String::from(REVISION_TAG_KIND),
            name: self.name_any(),
            uid: self.uid()?,
            controller: Some(true),
            block_owner_deletion: Some(true),
        })
    }
}
