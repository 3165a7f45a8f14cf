use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::{stream, Stream, StreamExt};
use k8s_openapi::api::admissionregistration::v1::MutatingWebhookConfiguration;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::{Resource, ResourceExt};

use super::injection::{
    referenced_tag_from_namespace, referenced_tag_from_pod, REFERENCED_REVISION_LABEL,
};
use super::revision::{ConcreteRevision, LogicalGroup};
use super::revision_tag::RevisionTag;

pub fn namespace_to_tag(ns: &Namespace) -> Option<ObjectRef<RevisionTag>> {
    referenced_tag_from_namespace(ns.labels()).map(ObjectRef::new)
}

pub fn pod_to_tag(pod: &Pod) -> Option<ObjectRef<RevisionTag>> {
    referenced_tag_from_pod(pod.labels()).map(ObjectRef::new)
}

/// Tags whose back-reference label names one of `revisions`
pub fn tags_referencing(
    tags: &[Arc<RevisionTag>],
    revisions: &[&str],
) -> Vec<ObjectRef<RevisionTag>> {
    tags.iter()
        .filter(|tag| {
            tag.labels()
                .get(REFERENCED_REVISION_LABEL)
                .is_some_and(|bound| revisions.contains(&bound.as_str()))
        })
        .map(|tag| ObjectRef::from_obj(tag.as_ref()))
        .collect()
}

pub fn revision_to_tags(
    tags: &[Arc<RevisionTag>],
    revision: &ConcreteRevision,
) -> Vec<ObjectRef<RevisionTag>> {
    tags_referencing(tags, &[revision.name_any().as_str()])
}

/// Remembers the last active revision seen for each LogicalGroup, so a
/// group that switches revisions also wakes the tags still bound to the
/// old one.
#[derive(Default)]
pub struct ActiveRevisions {
    last: Mutex<HashMap<String, String>>,
}

impl ActiveRevisions {
    /// Records the group's active revision and returns the one it replaced
    pub fn record(&self, group: &LogicalGroup) -> Option<String> {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        let name = group.name_any();
        let current = group.active_revision_name().map(str::to_string);
        match current {
            Some(current) => last.insert(name, current.clone()).filter(|p| *p != current),
            None => last.remove(&name),
        }
    }
}

pub fn group_to_tags(
    tags: &[Arc<RevisionTag>],
    group: &LogicalGroup,
    previous: Option<&str>,
) -> Vec<ObjectRef<RevisionTag>> {
    let revisions: Vec<&str> = group
        .active_revision_name()
        .into_iter()
        .chain(previous)
        .collect();
    if revisions.is_empty() {
        return Vec::new();
    }
    tags_referencing(tags, &revisions)
}

/// Objects watched for changes. Anything but the status counts as a change.
pub trait WatchedObject: Resource + Clone + Send + Sync + 'static {}

impl WatchedObject for Namespace {}
impl WatchedObject for Pod {}
impl WatchedObject for MutatingWebhookConfiguration {}

pub fn change_fingerprint<K: WatchedObject>(obj: &K) -> u64 {
    let meta = obj.meta();
    let tracked = serde_json::json!({
        "generation": meta.generation,
        "labels": meta.labels,
        "annotations": meta.annotations,
        "ownerReferences": meta.owner_references,
        "finalizers": meta.finalizers,
    });
    let mut hasher = DefaultHasher::new();
    tracked.to_string().hash(&mut hasher);
    hasher.finish()
}

/// Drops updates that only touched the status. Creations and deletions
/// always pass, including objects that vanished while the watch was
/// relisting.
pub struct ChangeFilter<K: Resource> {
    seen: HashMap<ObjectRef<K>, (u64, K)>,
    // refs listed since the last Init, while a relist is in progress
    relisted: Option<HashSet<ObjectRef<K>>>,
}

impl<K> Default for ChangeFilter<K>
where
    K: WatchedObject,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    fn default() -> Self {
        Self {
            seen: HashMap::new(),
            relisted: None,
        }
    }
}

impl<K> ChangeFilter<K>
where
    K: WatchedObject,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    pub fn observe(&mut self, event: watcher::Event<K>) -> Vec<K> {
        match event {
            watcher::Event::Apply(obj) => self.apply(obj).into_iter().collect(),
            watcher::Event::InitApply(obj) => {
                if let Some(relisted) = self.relisted.as_mut() {
                    relisted.insert(ObjectRef::from_obj(&obj));
                }
                self.apply(obj).into_iter().collect()
            }
            watcher::Event::Delete(obj) => {
                self.seen.remove(&ObjectRef::from_obj(&obj));
                vec![obj]
            }
            watcher::Event::Init => {
                self.relisted = Some(HashSet::new());
                Vec::new()
            }
            watcher::Event::InitDone => {
                let Some(relisted) = self.relisted.take() else {
                    return Vec::new();
                };
                let (kept, gone): (HashMap<_, _>, HashMap<_, _>) = std::mem::take(&mut self.seen)
                    .into_iter()
                    .partition(|(obj_ref, _)| relisted.contains(obj_ref));
                self.seen = kept;
                // the watch never saw these deleted
                gone.into_values().map(|(_, obj)| obj).collect()
            }
        }
    }

    fn apply(&mut self, obj: K) -> Option<K> {
        let fingerprint = change_fingerprint(&obj);
        match self
            .seen
            .insert(ObjectRef::from_obj(&obj), (fingerprint, obj.clone()))
        {
            Some((previous, _)) if previous == fingerprint => None,
            _ => Some(obj),
        }
    }
}

/// Flattens a watch into the objects that changed in a way that matters
pub fn changed_objects<K, S>(events: S) -> impl Stream<Item = Result<K, watcher::Error>> + Send
where
    K: WatchedObject,
    K::DynamicType: Default + Eq + Hash + Clone + Send,
    S: Stream<Item = Result<watcher::Event<K>, watcher::Error>> + Send,
{
    let mut filter = ChangeFilter::default();
    events.flat_map(move |event| {
        let passed: Vec<Result<K, watcher::Error>> = match event {
            Ok(event) => filter.observe(event).into_iter().map(Ok).collect(),
            Err(e) => vec![Err(e)],
        };
        stream::iter(passed)
    })
}
