use std::collections::BTreeMap;

use super::revision::ConcreteRevision;

pub const ISTIO_INJECTION_LABEL: &str = "istio-injection";
pub const ISTIO_INJECTION_ENABLED_VALUE: &str = "enabled";
pub const ISTIO_REV_LABEL: &str = "istio.io/rev";
pub const ISTIO_SIDECAR_INJECT_LABEL: &str = "sidecar.istio.io/inject";

/// Set on a RevisionTag, names the ConcreteRevision it is currently bound to
pub const REFERENCED_REVISION_LABEL: &str = "revtag.mesh.dev/referenced-revision";

/// Tag name selected by `istio-injection=enabled`
pub const DEFAULT_REVISION: &str = "default";

/// Tag selected by a namespace's labels, if any
pub fn referenced_tag_from_namespace(labels: &BTreeMap<String, String>) -> Option<&str> {
    if injection_enabled(labels) {
        return Some(DEFAULT_REVISION);
    }
    labels
        .get(ISTIO_REV_LABEL)
        .map(String::as_str)
        .filter(|rev| !rev.is_empty())
}

/// Tag selected by a pod's labels, if any.
///
/// Only labels are considered: the injection annotation written on injected
/// pods carries the real revision name, never the tag.
pub fn referenced_tag_from_pod(labels: &BTreeMap<String, String>) -> Option<&str> {
    if injection_enabled(labels) {
        return Some(DEFAULT_REVISION);
    }
    if labels.get(ISTIO_SIDECAR_INJECT_LABEL).map(String::as_str) == Some("false") {
        return None;
    }
    labels
        .get(ISTIO_REV_LABEL)
        .map(String::as_str)
        .filter(|rev| !rev.is_empty())
}

fn injection_enabled(labels: &BTreeMap<String, String>) -> bool {
    labels.get(ISTIO_INJECTION_LABEL).map(String::as_str) == Some(ISTIO_INJECTION_ENABLED_VALUE)
}

/// How namespaces without any injection label are treated by a revision.
///
/// With `NamespacesByDefault` every namespace is injected by the revision
/// behind the `default` tag unless it opts out, so that tag is in use no
/// matter which labels exist. Label-driven selection is unaffected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InjectionPolicy {
    LabelSelected,
    NamespacesByDefault,
}

impl InjectionPolicy {
    pub fn for_revision(revision: &ConcreteRevision) -> Self {
        if revision.spec.values.enables_namespaces_by_default() {
            InjectionPolicy::NamespacesByDefault
        } else {
            InjectionPolicy::LabelSelected
        }
    }

    /// Whether the tag is selected without any label pointing at it
    pub fn implicitly_selects(&self, tag_name: &str) -> bool {
        *self == InjectionPolicy::NamespacesByDefault && tag_name == DEFAULT_REVISION
    }
}
