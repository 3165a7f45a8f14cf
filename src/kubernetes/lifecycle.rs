use std::path::{Path, PathBuf};
use std::sync::Arc;

use kube::ResourceExt;

use crate::helm::{ChartError, ChartManager, Release};
use crate::metrics;

use super::error::Error;
use super::revision::ConcreteRevision;
use super::revision_tag::RevisionTag;

pub const REVISION_TAGS_CHART_NAME: &str = "revisiontags";

pub fn release_name(tag: &RevisionTag) -> String {
    format!("{}-{}", tag.name_any(), REVISION_TAGS_CHART_NAME)
}

pub fn chart_dir(resource_directory: &Path, revision: &ConcreteRevision) -> PathBuf {
    resource_directory
        .join(&revision.spec.version)
        .join("charts")
        .join(REVISION_TAGS_CHART_NAME)
}

/// Installs and removes the chart that exposes a revision under a tag's name
#[derive(Clone)]
pub struct ReleaseManager {
    charts: Arc<dyn ChartManager>,
    resource_directory: PathBuf,
}

impl ReleaseManager {
    pub fn new(charts: Arc<dyn ChartManager>, resource_directory: impl Into<PathBuf>) -> Self {
        Self {
            charts,
            resource_directory: resource_directory.into(),
        }
    }

    pub async fn install(
        &self,
        tag: &RevisionTag,
        revision: &ConcreteRevision,
    ) -> Result<Release, Error> {
        let owner = tag
            .child_owner_reference()
            .ok_or_else(|| Error::MissingUid(tag.name_any()))?;

        let mut values = revision.spec.values.clone();
        values.revision_tags = vec![tag.name_any()];
        let values = serde_json::to_value(&values)
            .map_err(|e| Error::Install(ChartError::Output(e)))?;

        let release_name = release_name(tag);
        log::info!(
            "Installing release {} for RevisionTag {} into {}",
            release_name,
            tag.name_any(),
            revision.spec.namespace
        );
        metrics::record_chart_operation("install");
        self.charts
            .upgrade_or_install(
                &chart_dir(&self.resource_directory, revision),
                &values,
                &revision.spec.namespace,
                &release_name,
                &owner,
            )
            .await
            .map_err(Error::Install)
    }

    /// Removes the tag's release from the namespace recorded in its status
    pub async fn uninstall(&self, tag: &RevisionTag) -> Result<(), Error> {
        let release_name = release_name(tag);
        let Some(namespace) = tag.bound_namespace() else {
            log::info!(
                "RevisionTag {} was never installed, nothing to uninstall",
                tag.name_any()
            );
            return Ok(());
        };

        metrics::record_chart_operation("uninstall");
        let found = self
            .charts
            .uninstall(&release_name, namespace)
            .await
            .map_err(Error::Uninstall)?;
        if found {
            log::info!("Uninstalled release {namespace}/{release_name}");
        } else {
            log::debug!("Release {namespace}/{release_name} was already gone");
        }
        Ok(())
    }
}
