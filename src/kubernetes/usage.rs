use kube::ResourceExt;

use super::api::{ClusterStore, StoreError};
use super::injection::{
    referenced_tag_from_namespace, referenced_tag_from_pod, InjectionPolicy, DEFAULT_REVISION,
};
use super::revision::ConcreteRevision;
use super::revision_tag::RevisionTag;

#[derive(Debug, thiserror::Error)]
pub enum UsageError {
    #[error("failed to list namespaces: {0}")]
    ListNamespaces(#[source] StoreError),

    #[error("failed to list pods: {0}")]
    ListPods(#[source] StoreError),
}

/// Whether any namespace or pod selects the tag, directly by label or
/// implicitly through the default tag's injection policy.
///
/// `revision` is what the tag resolved to in this reconciliation. Without
/// one there is no policy to consult, and a resolution failure is already
/// reported on the Reconciled condition.
pub async fn is_referenced_by_workloads(
    store: &dyn ClusterStore,
    tag: &RevisionTag,
    revision: Option<&ConcreteRevision>,
) -> Result<bool, UsageError> {
    let name = tag.name_any();

    let namespaces = store
        .list_namespaces()
        .await
        .map_err(UsageError::ListNamespaces)?;
    if let Some(ns) = namespaces
        .iter()
        .find(|ns| referenced_tag_from_namespace(ns.labels()) == Some(name.as_str()))
    {
        log::debug!("RevisionTag {name} is referenced by namespace {}", ns.name_any());
        return Ok(true);
    }

    let pods = store.list_pods().await.map_err(UsageError::ListPods)?;
    if let Some(pod) = pods
        .iter()
        .find(|pod| referenced_tag_from_pod(pod.labels()) == Some(name.as_str()))
    {
        log::debug!(
            "RevisionTag {name} is referenced by pod {}/{}",
            pod.namespace().unwrap_or_default(),
            pod.name_any()
        );
        return Ok(true);
    }

    if let Some(revision) = revision.filter(|_| name == DEFAULT_REVISION) {
        if InjectionPolicy::for_revision(revision).implicitly_selects(&name) {
            log::debug!(
                "RevisionTag {name} is referenced implicitly, {} injects namespaces by default",
                revision.name_any()
            );
            return Ok(true);
        }
    }

    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kubernetes::memory::{labeled_meta, MemoryStore};
    use crate::kubernetes::revision::{
        ConcreteRevision, ConcreteRevisionSpec, RevisionValues, SidecarInjectorWebhookValues,
    };
    use crate::kubernetes::revision_tag::{RevisionTagSpec, TargetReference};
    use k8s_openapi::api::core::v1::{Namespace, Pod};

    fn tag(name: &str) -> RevisionTag {
        RevisionTag::new(
            name,
            RevisionTagSpec {
                target_ref: TargetReference {
                    kind: "ConcreteRevision".to_string(),
                    name: "rev-a".to_string(),
                },
            },
        )
    }

    fn namespace(name: &str, labels: &[(&str, &str)]) -> Namespace {
        Namespace {
            metadata: labeled_meta(name, labels),
            ..Default::default()
        }
    }

    fn pod(name: &str, labels: &[(&str, &str)]) -> Pod {
        let mut metadata = labeled_meta(name, labels);
        metadata.namespace = Some("apps".to_string());
        Pod {
            metadata,
            ..Default::default()
        }
    }

    fn revision(by_default: bool) -> ConcreteRevision {
        ConcreteRevision::new(
            "rev-a",
            ConcreteRevisionSpec {
                namespace: "istio-system".to_string(),
                version: "v1.24.0".to_string(),
                values: RevisionValues {
                    sidecar_injector_webhook: Some(SidecarInjectorWebhookValues {
                        enable_namespaces_by_default: Some(by_default),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            },
        )
    }

    #[tokio::test]
    async fn injection_enabled_namespace_references_default() {
        let store = MemoryStore::new();
        let rev = revision(false);
        store.put_namespace(namespace("ns1", &[("istio-injection", "enabled")]));

        assert!(is_referenced_by_workloads(&store, &tag("default"), Some(&rev)).await.unwrap());
        assert!(!is_referenced_by_workloads(&store, &tag("canary"), Some(&rev)).await.unwrap());
    }

    #[tokio::test]
    async fn rev_label_on_pod_references_tag() {
        let store = MemoryStore::new();
        store.put_pod(pod("web-0", &[("istio.io/rev", "canary")]));
        assert!(is_referenced_by_workloads(&store, &tag("canary"), None).await.unwrap());
    }

    #[tokio::test]
    async fn opted_out_pod_is_not_a_reference() {
        let store = MemoryStore::new();
        store.put_pod(pod(
            "web-0",
            &[("istio.io/rev", "canary"), ("sidecar.istio.io/inject", "false")],
        ));
        assert!(!is_referenced_by_workloads(&store, &tag("canary"), None).await.unwrap());
    }

    #[tokio::test]
    async fn default_tag_is_referenced_when_revision_injects_by_default() {
        let store = MemoryStore::new();
        let injecting = revision(true);
        assert!(is_referenced_by_workloads(&store, &tag("default"), Some(&injecting))
            .await
            .unwrap());
        // only the default tag is selected implicitly
        assert!(!is_referenced_by_workloads(&store, &tag("canary"), Some(&injecting))
            .await
            .unwrap());

        let opt_in = revision(false);
        assert!(!is_referenced_by_workloads(&store, &tag("default"), Some(&opt_in))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn unresolved_default_tag_is_not_referenced_implicitly() {
        let store = MemoryStore::new();
        assert!(!is_referenced_by_workloads(&store, &tag("default"), None).await.unwrap());

        store.put_pod(pod("web-0", &[("istio-injection", "enabled")]));
        assert!(is_referenced_by_workloads(&store, &tag("default"), None).await.unwrap());
    }

    #[tokio::test]
    async fn list_failures_are_errors() {
        let store = MemoryStore::new();
        store.fail_namespace_list(true);
        let err = is_referenced_by_workloads(&store, &tag("canary"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, UsageError::ListNamespaces(_)));

        store.fail_namespace_list(false);
        store.fail_pod_list(true);
        let err = is_referenced_by_workloads(&store, &tag("canary"), None)
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("failed to list pods"));
    }
}
