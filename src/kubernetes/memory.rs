use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::api::ObjectMeta;
use kube::ResourceExt;

use super::api::{ClusterStore, StoreError, StoreResult};
use super::revision::{ConcreteRevision, LogicalGroup};
use super::revision_tag::{
    RevisionTag, RevisionTagStatus, CONCRETE_REVISION_KIND, LOGICAL_GROUP_KIND,
};

#[derive(Default)]
struct State {
    tags: BTreeMap<String, RevisionTag>,
    revisions: BTreeMap<String, ConcreteRevision>,
    groups: BTreeMap<String, LogicalGroup>,
    namespaces: Vec<Namespace>,
    pods: Vec<Pod>,
    fail_namespace_list: bool,
    fail_pod_list: bool,
    fail_revision_get: bool,
    fail_lookups_of: BTreeSet<String>,
    status_patches: usize,
    label_patches: usize,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

fn server_error(message: &str) -> StoreError {
    StoreError::Kube(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: message.to_string(),
        reason: "InternalError".to_string(),
        code: 500,
    }))
}

// what the API server answers when a JSON patch `test` op fails
fn test_failed(path: &str) -> StoreError {
    StoreError::Kube(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("test failed at {path}"),
        reason: "Invalid".to_string(),
        code: 422,
    }))
}

fn tag_not_found(name: &str) -> StoreError {
    StoreError::NotFound {
        kind: "RevisionTag",
        name: name.to_string(),
    }
}

pub fn labeled_meta(name: &str, labels: &[(&str, &str)]) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        labels: Some(
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        ),
        ..Default::default()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::unwrap_used)]
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Inserts a tag, assigning a uid and generation the way the API server would
    pub fn put_tag(&self, mut tag: RevisionTag) {
        let name = tag.name_any();
        tag.metadata.uid.get_or_insert_with(|| format!("uid-{name}"));
        tag.metadata.generation.get_or_insert(1);
        self.state().tags.insert(name, tag);
    }

    pub fn tag(&self, name: &str) -> Option<RevisionTag> {
        self.state().tags.get(name).cloned()
    }

    /// Marks a tag as deleted. It stays visible until its finalizers are gone.
    pub fn delete_tag(&self, name: &str) {
        let mut state = self.state();
        let remove = match state.tags.get_mut(name) {
            Some(tag) if tag.finalizers().is_empty() => true,
            Some(tag) => {
                tag.metadata.deletion_timestamp = Some(
                    k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()),
                );
                false
            }
            None => false,
        };
        if remove {
            state.tags.remove(name);
        }
    }

    pub fn put_revision(&self, revision: ConcreteRevision) {
        self.state().revisions.insert(revision.name_any(), revision);
    }

    pub fn put_group(&self, group: LogicalGroup) {
        self.state().groups.insert(group.name_any(), group);
    }

    pub fn put_namespace(&self, ns: Namespace) {
        self.state().namespaces.push(ns);
    }

    pub fn put_pod(&self, pod: Pod) {
        self.state().pods.push(pod);
    }

    pub fn fail_namespace_list(&self, fail: bool) {
        self.state().fail_namespace_list = fail;
    }

    pub fn fail_pod_list(&self, fail: bool) {
        self.state().fail_pod_list = fail;
    }

    pub fn fail_revision_get(&self, fail: bool) {
        self.state().fail_revision_get = fail;
    }

    /// Fails gets of revisions or groups with this name only
    pub fn fail_lookups_of(&self, name: &str) {
        self.state().fail_lookups_of.insert(name.to_string());
    }

    /// Changes a tag's finalizers behind the back of whoever cached it
    pub fn set_finalizers(&self, name: &str, finalizers: &[&str]) {
        if let Some(tag) = self.state().tags.get_mut(name) {
            tag.metadata.finalizers = Some(finalizers.iter().map(|f| f.to_string()).collect());
        }
    }

    pub fn status_patches(&self) -> usize {
        self.state().status_patches
    }

    pub fn label_patches(&self) -> usize {
        self.state().label_patches
    }
}

#[async_trait]
impl ClusterStore for MemoryStore {
    async fn get_revision(&self, name: &str) -> StoreResult<ConcreteRevision> {
        let state = self.state();
        if state.fail_revision_get || state.fail_lookups_of.contains(name) {
            return Err(server_error("etcd unavailable"));
        }
        state
            .revisions
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: CONCRETE_REVISION_KIND,
                name: name.to_string(),
            })
    }

    async fn get_group(&self, name: &str) -> StoreResult<LogicalGroup> {
        let state = self.state();
        if state.fail_lookups_of.contains(name) {
            return Err(server_error("etcd unavailable"));
        }
        state
            .groups
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: LOGICAL_GROUP_KIND,
                name: name.to_string(),
            })
    }

    async fn list_namespaces(&self) -> StoreResult<Vec<Namespace>> {
        let state = self.state();
        if state.fail_namespace_list {
            return Err(server_error("namespaces unavailable"));
        }
        Ok(state.namespaces.clone())
    }

    async fn list_pods(&self) -> StoreResult<Vec<Pod>> {
        let state = self.state();
        if state.fail_pod_list {
            return Err(server_error("pods unavailable"));
        }
        Ok(state.pods.clone())
    }

    async fn patch_tag_labels(
        &self,
        name: &str,
        labels: &BTreeMap<String, Option<String>>,
    ) -> StoreResult<()> {
        let mut state = self.state();
        state.label_patches += 1;
        let tag = state.tags.get_mut(name).ok_or_else(|| tag_not_found(name))?;
        let current = tag.labels_mut();
        for (key, value) in labels {
            match value {
                Some(value) => {
                    current.insert(key.clone(), value.clone());
                }
                None => {
                    current.remove(key);
                }
            }
        }
        Ok(())
    }

    async fn patch_tag_status(&self, name: &str, status: &RevisionTagStatus) -> StoreResult<()> {
        let mut state = self.state();
        state.status_patches += 1;
        let tag = state.tags.get_mut(name).ok_or_else(|| tag_not_found(name))?;
        tag.status = Some(status.clone());
        Ok(())
    }

    async fn add_tag_finalizer(
        &self,
        name: &str,
        expected: &[String],
        finalizer: &str,
    ) -> StoreResult<()> {
        let mut state = self.state();
        let tag = state.tags.get_mut(name).ok_or_else(|| tag_not_found(name))?;
        if tag.finalizers() != expected {
            return Err(test_failed("/metadata/finalizers"));
        }
        tag.finalizers_mut().push(finalizer.to_string());
        Ok(())
    }

    async fn remove_tag_finalizer(
        &self,
        name: &str,
        index: usize,
        finalizer: &str,
    ) -> StoreResult<()> {
        let mut state = self.state();
        let tag = state.tags.get_mut(name).ok_or_else(|| tag_not_found(name))?;
        if tag.finalizers().get(index).map(String::as_str) != Some(finalizer) {
            return Err(test_failed(&format!("/metadata/finalizers/{index}")));
        }
        tag.finalizers_mut().remove(index);
        // a deleted object goes away once nothing holds it back
        if tag.metadata.deletion_timestamp.is_some() && tag.finalizers().is_empty() {
            state.tags.remove(name);
        }
        Ok(())
    }
}
