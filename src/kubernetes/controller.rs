use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use k8s_openapi::api::admissionregistration::v1::MutatingWebhookConfiguration;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::{
    api::{Api, ResourceExt},
    client::Client,
    runtime::{controller::Action, watcher, Controller, WatchStreamExt},
};

use super::api::{ClusterStore, KubeStore};
use super::error::Error;
use super::injection::REFERENCED_REVISION_LABEL;
use super::lifecycle::ReleaseManager;
use super::mapper::{
    changed_objects, group_to_tags, namespace_to_tag, pod_to_tag, revision_to_tags,
    ActiveRevisions,
};
use super::resolver::{resolve, validate};
use super::revision::{ConcreteRevision, LogicalGroup};
use super::revision_tag::{ConditionType, RevisionTag};
use super::status::{determine_status, in_use_condition, reconciled_condition};
use super::usage::is_referenced_by_workloads;
use crate::config::Config;
use crate::error::ErrorList;
use crate::helm::HelmCli;
use crate::metrics;

pub const FINALIZER: &str = "revtag.mesh.dev/finalizer";

/// Shared state handed to every reconciliation
pub struct Context {
    pub store: Arc<dyn ClusterStore>,
    pub releases: ReleaseManager,
    pub requeue_transient: Duration,
    pub requeue_permanent: Duration,
}

impl Context {
    pub fn new(store: Arc<dyn ClusterStore>, releases: ReleaseManager, config: &Config) -> Self {
        Self {
            store,
            releases,
            requeue_transient: config.requeue_transient,
            requeue_permanent: config.requeue_permanent,
        }
    }
}

fn finalizer_index(tag: &RevisionTag) -> Option<usize> {
    tag.finalizers().iter().position(|f| f == FINALIZER)
}

/// The reconciliation function for RevisionTag resources
pub async fn reconcile(tag: Arc<RevisionTag>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = tag.name_any();
    metrics::record_reconciliation();

    if tag.metadata.deletion_timestamp.is_some() {
        return finalize(&tag, &ctx).await;
    }

    if finalizer_index(&tag).is_none() {
        ctx.store
            .add_tag_finalizer(&name, tag.finalizers(), FINALIZER)
            .await
            .map_err(Error::Finalizer)?;
        log::debug!("Added finalizer to RevisionTag {}", name);
    }

    log::debug!("Reconciling RevisionTag {}", name);
    let (revision, result) = apply_tag(&tag, &ctx).await;
    let reconcile_err = result.err();

    let labels = update_labels(&tag, revision.as_ref(), &ctx).await;
    let status = update_status(&tag, revision.as_ref(), reconcile_err.as_ref(), &ctx).await;

    let mut errors = ErrorList::new();
    if let Some(e) = reconcile_err {
        errors.push(e);
    }
    errors.add(labels);
    errors.add(status);
    Error::join(errors)?;

    Ok(Action::await_change())
}

/// Validates, resolves and installs. The resolved revision is returned even
/// when the install fails so that labels still follow it.
async fn apply_tag(
    tag: &RevisionTag,
    ctx: &Context,
) -> (Option<ConcreteRevision>, Result<(), Error>) {
    if let Err(e) = validate(ctx.store.as_ref(), tag).await {
        return (None, Err(e));
    }

    let revision = match resolve(ctx.store.as_ref(), &tag.spec.target_ref).await {
        Ok(revision) => revision,
        Err(cause) => {
            return (
                None,
                Err(Error::Resolve {
                    tag: tag.name_any(),
                    cause,
                }),
            )
        }
    };

    let result = ctx.releases.install(tag, &revision).await.map(|release| {
        log::info!(
            "RevisionTag {} installed as release {}/{} (revision {})",
            tag.name_any(),
            release.namespace,
            release.name,
            release.revision
        );
    });
    (Some(revision), result)
}

async fn update_labels(
    tag: &RevisionTag,
    revision: Option<&ConcreteRevision>,
    ctx: &Context,
) -> Result<(), Error> {
    let wanted = revision.map(|r| r.name_any());
    if tag.labels().get(REFERENCED_REVISION_LABEL) == wanted.as_ref() {
        return Ok(());
    }

    log::debug!(
        "Setting {} on RevisionTag {} to {:?}",
        REFERENCED_REVISION_LABEL,
        tag.name_any(),
        wanted
    );
    let labels = BTreeMap::from([(REFERENCED_REVISION_LABEL.to_string(), wanted)]);
    ctx.store
        .patch_tag_labels(&tag.name_any(), &labels)
        .await
        .map_err(Error::LabelPatch)
}

async fn update_status(
    tag: &RevisionTag,
    revision: Option<&ConcreteRevision>,
    reconcile_err: Option<&Error>,
    ctx: &Context,
) -> Result<(), Error> {
    let name = tag.name_any();
    let in_use = is_referenced_by_workloads(ctx.store.as_ref(), tag, revision).await;
    let status = determine_status(
        tag,
        revision,
        reconciled_condition(reconcile_err),
        in_use_condition(&in_use),
        Utc::now(),
    );
    metrics::record_tag_state(&name, status.state);

    let was_in_use = tag
        .status
        .as_ref()
        .and_then(|s| s.condition(ConditionType::InUse))
        .map(|c| c.status);
    let in_use_now = status.condition(ConditionType::InUse).map(|c| c.status);
    if was_in_use != in_use_now {
        log::info!("RevisionTag {} InUse is now {:?}", name, in_use_now);
    }

    let mut errors = ErrorList::new();
    if let Err(e) = in_use {
        errors.push(Error::UsageCheck(e));
    }

    if tag.status.as_ref() == Some(&status) {
        log::debug!("Status of RevisionTag {} is unchanged", name);
    } else {
        match ctx.store.patch_tag_status(&name, &status).await {
            Ok(()) => metrics::record_status_patch(),
            Err(e) => errors.push(Error::StatusPatch(e)),
        }
    }
    Error::join(errors)
}

async fn finalize(tag: &RevisionTag, ctx: &Context) -> Result<Action, Error> {
    let name = tag.name_any();
    let Some(index) = finalizer_index(tag) else {
        return Ok(Action::await_change());
    };

    log::info!("Finalizing RevisionTag {}", name);
    ctx.releases.uninstall(tag).await?;

    ctx.store
        .remove_tag_finalizer(&name, index, FINALIZER)
        .await
        .map_err(Error::Finalizer)?;
    metrics::record_tag_state(&name, None);
    Ok(Action::await_change())
}

/// Error handler for the controller
pub fn error_policy(tag: Arc<RevisionTag>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = tag.name_any();
    if error.is_not_found() {
        log::debug!("RevisionTag {} went away during reconciliation: {}", name, error);
        return Action::await_change();
    }

    metrics::record_reconcile_error(error.reason());
    if error.is_permanent() {
        log::warn!("RevisionTag {} is not reconcilable as is: {}", name, error);
        Action::requeue(ctx.requeue_permanent)
    } else {
        log::error!("Error reconciling RevisionTag {}: {}", name, error);
        Action::requeue(ctx.requeue_transient)
    }
}

/// Start the Kubernetes controller
pub async fn start_controller(client: Client, config: Config) {
    let charts = Arc::new(HelmCli::new(config.helm_binary.clone(), client.clone()));
    let context = Arc::new(Context::new(
        Arc::new(KubeStore::new(client.clone())),
        ReleaseManager::new(charts, config.resource_directory.clone()),
        &config,
    ));

    let tags: Api<RevisionTag> = Api::all(client.clone());
    let controller = Controller::new(tags, watcher::Config::default());
    let tag_index = controller.store();

    let namespaces = changed_objects(
        watcher(Api::<Namespace>::all(client.clone()), watcher::Config::default())
            .default_backoff(),
    );
    let pods = changed_objects(
        watcher(Api::<Pod>::all(client.clone()), watcher::Config::default()).default_backoff(),
    );
    let webhooks = changed_objects(
        watcher(
            Api::<MutatingWebhookConfiguration>::all(client.clone()),
            watcher::Config::default(),
        )
        .default_backoff(),
    );

    let active_revisions = ActiveRevisions::default();
    let group_index = tag_index.clone();
    let revision_index = tag_index;

    log::info!("Starting RevisionTag controller");

    controller
        .watches_stream(namespaces, |ns| namespace_to_tag(&ns))
        .watches_stream(pods, |pod| pod_to_tag(&pod))
        .watches(
            Api::<LogicalGroup>::all(client.clone()),
            watcher::Config::default(),
            move |group| {
                let previous = active_revisions.record(&group);
                let refs = group_to_tags(&group_index.state(), &group, previous.as_deref());
                log::debug!(
                    "LogicalGroup {} maps to {} RevisionTag(s)",
                    group.name_any(),
                    refs.len()
                );
                refs
            },
        )
        .watches(
            Api::<ConcreteRevision>::all(client),
            watcher::Config::default(),
            move |revision| revision_to_tags(&revision_index.state(), &revision),
        )
        .owns_stream(webhooks)
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => log::debug!("Reconciliation completed: {}", obj),
                Err(kube::runtime::controller::Error::ObjectNotFound(obj)) => {
                    log::debug!("Object {} is gone, nothing to reconcile", obj)
                }
                Err(e) => log::error!("Reconciliation error: {:?}", e),
            }
        })
        .await;

    log::info!("RevisionTag controller stopped");
}
