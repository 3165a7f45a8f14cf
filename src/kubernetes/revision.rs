use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Sidecar injector settings of a revision's installation values
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SidecarInjectorWebhookValues {
    /// Inject every namespace that has not opted out, without requiring a label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_namespaces_by_default: Option<bool>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Installation values handed to the chart.
/// Only the keys the controller reads or writes are typed; everything else
/// is carried through untouched.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RevisionValues {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub revision_tags: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sidecar_injector_webhook: Option<SidecarInjectorWebhookValues>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl RevisionValues {
    pub fn enables_namespaces_by_default(&self) -> bool {
        self.sidecar_injector_webhook
            .as_ref()
            .and_then(|w| w.enable_namespaces_by_default)
            .unwrap_or(false)
    }
}

/// One installable, versioned release of the mesh control plane
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[kube(
    group = "revtag.mesh.dev",
    version = "v1alpha1",
    kind = "ConcreteRevision",
    shortname = "crev",
    printcolumn = r#"{"name":"Namespace", "jsonPath":".spec.namespace", "type":"string"}"#,
    printcolumn = r#"{"name":"Version", "jsonPath":".spec.version", "type":"string"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ConcreteRevisionSpec {
    /// Namespace the revision (and any tag bound to it) is installed into
    pub namespace: String,

    /// Selects the chart directory `<resources>/<version>/charts/...`
    pub version: String,

    #[serde(default)]
    pub values: RevisionValues,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LogicalGroupStatus {
    /// The ConcreteRevision currently designated as active
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_revision_name: Option<String>,
}

/// A rollout group that designates one ConcreteRevision as active
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[kube(
    group = "revtag.mesh.dev",
    version = "v1alpha1",
    kind = "LogicalGroup",
    shortname = "lgroup",
    status = "LogicalGroupStatus",
    printcolumn = r#"{"name":"Active Revision", "jsonPath":".status.activeRevisionName", "type":"string"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LogicalGroupSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl LogicalGroup {
    /// Active revision name, treating an empty string as unset
    pub fn active_revision_name(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.active_revision_name.as_deref())
            .filter(|name| !name.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_keep_unknown_keys() {
        let values: RevisionValues = serde_json::from_value(serde_json::json!({
            "revisionTags": ["old"],
            "global": { "hub": "docker.io/istio" },
            "sidecarInjectorWebhook": {
                "enableNamespacesByDefault": true,
                "rewriteAppHTTPProbe": false
            }
        }))
        .expect("deserialize");

        assert_eq!(values.revision_tags, vec!["old".to_string()]);
        assert!(values.enables_namespaces_by_default());

        let back = serde_json::to_value(&values).expect("serialize");
        assert_eq!(back["global"]["hub"], "docker.io/istio");
        assert_eq!(back["sidecarInjectorWebhook"]["rewriteAppHTTPProbe"], false);
    }

    #[test]
    fn namespaces_by_default_is_off_unless_set() {
        assert!(!RevisionValues::default().enables_namespaces_by_default());

        let values = RevisionValues {
            sidecar_injector_webhook: Some(SidecarInjectorWebhookValues {
                enable_namespaces_by_default: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(!values.enables_namespaces_by_default());
    }

    #[test]
    fn empty_active_revision_counts_as_none() {
        let mut group = LogicalGroup::new("default", LogicalGroupSpec::default());
        assert_eq!(group.active_revision_name(), None);

        group.status = Some(LogicalGroupStatus {
            active_revision_name: Some(String::new()),
        });
        assert_eq!(group.active_revision_name(), None);

        group.status = Some(LogicalGroupStatus {
            active_revision_name: Some("default-v1-24".to_string()),
        });
        assert_eq!(group.active_revision_name(), Some("default-v1-24"));
    }
}
