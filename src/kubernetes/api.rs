use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::api::{GroupVersionKind, ListParams};
use kube::discovery::pinned_kind;
use kube::{
    api::{Api, DynamicObject, Patch, PatchParams, ResourceExt},
    client::Client,
    core::discovery,
};

use super::revision::{ConcreteRevision, LogicalGroup};
use super::revision_tag::{RevisionTag, RevisionTagStatus, CONCRETE_REVISION_KIND, LOGICAL_GROUP_KIND};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} {name:?} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("invalid JSON patch: {0}")]
    Patch(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        match self {
            StoreError::NotFound { .. } => true,
            StoreError::Kube(kube::Error::Api(e)) => e.code == 404,
            _ => false,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Everything the reconciler reads from or writes to the cluster.
///
/// Lists are point-in-time snapshots with no isolation from concurrent
/// writers; a reference missed by one scan is picked up on the next event.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    async fn get_revision(&self, name: &str) -> StoreResult<ConcreteRevision>;

    async fn get_group(&self, name: &str) -> StoreResult<LogicalGroup>;

    async fn list_namespaces(&self) -> StoreResult<Vec<Namespace>>;

    async fn list_pods(&self) -> StoreResult<Vec<Pod>>;

    /// Sets (`Some`) or removes (`None`) the given labels on a tag
    async fn patch_tag_labels(
        &self,
        name: &str,
        labels: &BTreeMap<String, Option<String>>,
    ) -> StoreResult<()>;

    async fn patch_tag_status(&self, name: &str, status: &RevisionTagStatus) -> StoreResult<()>;

    /// Appends `finalizer`, provided the tag's finalizers are still `expected`
    async fn add_tag_finalizer(
        &self,
        name: &str,
        expected: &[String],
        finalizer: &str,
    ) -> StoreResult<()>;

    /// Removes the finalizer at `index`, provided it is still `finalizer`
    async fn remove_tag_finalizer(
        &self,
        name: &str,
        index: usize,
        finalizer: &str,
    ) -> StoreResult<()>;
}

/// ClusterStore backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn tags(&self) -> Api<RevisionTag> {
        Api::all(self.client.clone())
    }

    /// A failed `test` op rejects the whole patch with 422
    async fn json_patch_tag(&self, name: &str, ops: serde_json::Value) -> StoreResult<()> {
        let patch = serde_json::from_value(ops)?;
        self.tags()
            .patch(name, &PatchParams::default(), &Patch::Json::<()>(patch))
            .await?;
        Ok(())
    }
}

fn not_found_as(kind: &'static str, name: &str, err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(e) if e.code == 404 => StoreError::NotFound {
            kind,
            name: name.to_string(),
        },
        e => StoreError::Kube(e),
    }
}

#[async_trait]
impl ClusterStore for KubeStore {
    async fn get_revision(&self, name: &str) -> StoreResult<ConcreteRevision> {
        let api: Api<ConcreteRevision> = Api::all(self.client.clone());
        api.get(name)
            .await
            .map_err(|e| not_found_as(CONCRETE_REVISION_KIND, name, e))
    }

    async fn get_group(&self, name: &str) -> StoreResult<LogicalGroup> {
        let api: Api<LogicalGroup> = Api::all(self.client.clone());
        api.get(name)
            .await
            .map_err(|e| not_found_as(LOGICAL_GROUP_KIND, name, e))
    }

    async fn list_namespaces(&self) -> StoreResult<Vec<Namespace>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_pods(&self) -> StoreResult<Vec<Pod>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn patch_tag_labels(
        &self,
        name: &str,
        labels: &BTreeMap<String, Option<String>>,
    ) -> StoreResult<()> {
        // null values remove the label under merge-patch semantics
        let patch = serde_json::json!({ "metadata": { "labels": labels } });
        self.tags()
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_tag_status(&self, name: &str, status: &RevisionTagStatus) -> StoreResult<()> {
        let patch = serde_json::json!({ "status": status });
        self.tags()
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn add_tag_finalizer(
        &self,
        name: &str,
        expected: &[String],
        finalizer: &str,
    ) -> StoreResult<()> {
        let ops = if expected.is_empty() {
            serde_json::json!([
                { "op": "test", "path": "/metadata/finalizers", "value": null },
                { "op": "add", "path": "/metadata/finalizers", "value": [finalizer] },
            ])
        } else {
            serde_json::json!([
                { "op": "test", "path": "/metadata/finalizers", "value": expected },
                { "op": "add", "path": "/metadata/finalizers/-", "value": finalizer },
            ])
        };
        self.json_patch_tag(name, ops).await
    }

    async fn remove_tag_finalizer(
        &self,
        name: &str,
        index: usize,
        finalizer: &str,
    ) -> StoreResult<()> {
        let path = format!("/metadata/finalizers/{index}");
        let ops = serde_json::json!([
            { "op": "test", "path": path, "value": finalizer },
            { "op": "remove", "path": path },
        ]);
        self.json_patch_tag(name, ops).await
    }
}

/// Merge-patch `patch` onto an arbitrary object, resolving its API via discovery
pub async fn patch_dynamic(
    client: &Client,
    obj: &DynamicObject,
    patch: &serde_json::Value,
) -> Result<DynamicObject, anyhow::Error> {
    // require name + type info
    let name = obj
        .metadata
        .name
        .clone()
        .ok_or_else(|| anyhow::anyhow!("metadata.name required"))?;
    let gvk = GroupVersionKind::try_from(
        obj.types
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("missing types on DynamicObject"))?,
    )
    .map_err(|e| anyhow::anyhow!("failed parsing GVK: {}", e))?;

    log::debug!(
        "Patching {} {}/{}",
        gvk.kind,
        obj.namespace().unwrap_or_default(),
        name
    );

    // resolve ApiResource and scope
    let (ar, caps) = pinned_kind(client, &gvk)
        .await
        .map_err(|e| anyhow::anyhow!("GVK {gvk:?} not found via discovery: {}", e))?;

    let api: Api<DynamicObject> = match (caps.scope, obj.namespace()) {
        (discovery::Scope::Namespaced, Some(ns)) => Api::namespaced_with(client.clone(), &ns, &ar),
        (discovery::Scope::Namespaced, None) => Api::default_namespaced_with(client.clone(), &ar),
        (discovery::Scope::Cluster, _) => Api::all_with(client.clone(), &ar),
    };

    api.patch(&name, &PatchParams::default(), &Patch::Merge(patch))
        .await
        .map_err(|e| anyhow::anyhow!("failed to patch object: {}", e))
}
