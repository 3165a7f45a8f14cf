use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::DynamicObject;
use kube::{Client, Resource, ResourceExt};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::kubernetes::api::patch_dynamic;

/// Handle on an installed release
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Release {
    pub name: String,
    pub namespace: String,
    /// Helm's release revision, bumped on every upgrade
    pub revision: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum ChartError {
    #[error("failed to run {binary}: {cause}")]
    Spawn {
        binary: String,
        cause: std::io::Error,
    },

    #[error("helm {command} failed: {stderr}")]
    Command {
        command: &'static str,
        stderr: String,
    },

    #[error("failed to encode values: {0}")]
    Values(#[from] serde_yaml::Error),

    #[error("failed to parse helm output: {0}")]
    Output(#[from] serde_json::Error),

    #[error("failed to parse release manifest: {0}")]
    Manifest(String),

    #[error("failed to set owner reference on {kind} {name}: {cause:#}")]
    Ownership {
        kind: String,
        name: String,
        cause: anyhow::Error,
    },
}

/// Installs and removes chart releases
#[async_trait]
pub trait ChartManager: Send + Sync {
    /// Upgrades the release, installing it first if it does not exist.
    /// Safe to call repeatedly with the same inputs.
    async fn upgrade_or_install(
        &self,
        chart_dir: &Path,
        values: &serde_json::Value,
        namespace: &str,
        release_name: &str,
        owner: &OwnerReference,
    ) -> Result<Release, ChartError>;

    /// Returns whether a release was found and removed
    async fn uninstall(&self, release_name: &str, namespace: &str) -> Result<bool, ChartError>;
}

/// ChartManager driving the `helm` binary
pub struct HelmCli {
    binary: String,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct HelmReleaseOutput {
    name: String,
    namespace: String,
    version: u32,
    #[serde(default)]
    manifest: String,
}

impl HelmCli {
    pub fn new(binary: impl Into<String>, client: Client) -> Self {
        Self {
            binary: binary.into(),
            client,
        }
    }

    async fn run(
        &self,
        command: &'static str,
        args: &[String],
        stdin: Option<&[u8]>,
    ) -> Result<std::process::Output, ChartError> {
        log::debug!("Running {} {}", self.binary, args.join(" "));

        let spawn_error = |cause| ChartError::Spawn {
            binary: self.binary.clone(),
            cause,
        };

        let mut child = Command::new(&self.binary)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_error)?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input).await.map_err(spawn_error)?;
            // closing stdin lets helm finish reading values
            drop(pipe);
        }

        let output = child.wait_with_output().await.map_err(spawn_error)?;
        if !output.status.success() {
            return Err(ChartError::Command {
                command,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }

    async fn stamp_owner(&self, manifest: &str, owner: &OwnerReference) -> Result<(), ChartError> {
        for mut obj in parse_manifest(manifest)? {
            if !ensure_owner_reference(&mut obj, owner) {
                continue;
            }
            let patch = serde_json::json!({
                "metadata": { "ownerReferences": obj.metadata.owner_references }
            });
            patch_dynamic(&self.client, &obj, &patch)
                .await
                .map_err(|cause| ChartError::Ownership {
                    kind: obj
                        .types
                        .as_ref()
                        .map(|t| t.kind.clone())
                        .unwrap_or_default(),
                    name: obj.name_any(),
                    cause,
                })?;
        }
        Ok(())
    }
}

pub fn upgrade_args(chart_dir: &Path, namespace: &str, release_name: &str) -> Vec<String> {
    vec![
        "upgrade".to_string(),
        release_name.to_string(),
        chart_dir.display().to_string(),
        "--install".to_string(),
        "--namespace".to_string(),
        namespace.to_string(),
        "--values".to_string(),
        "-".to_string(),
        "--output".to_string(),
        "json".to_string(),
    ]
}

pub fn uninstall_args(namespace: &str, release_name: &str) -> Vec<String> {
    vec![
        "uninstall".to_string(),
        release_name.to_string(),
        "--namespace".to_string(),
        namespace.to_string(),
    ]
}

fn is_release_not_found(stderr: &str) -> bool {
    stderr.contains("release: not found")
}

/// Splits a rendered multi-document manifest into objects, skipping empty documents
pub fn parse_manifest(manifest: &str) -> Result<Vec<DynamicObject>, ChartError> {
    let mut objects = Vec::new();
    for document in serde_yaml::Deserializer::from_str(manifest) {
        let value = serde_yaml::Value::deserialize(document)
            .map_err(|e| ChartError::Manifest(e.to_string()))?;
        if value.is_null() {
            continue;
        }
        let obj: DynamicObject =
            serde_yaml::from_value(value).map_err(|e| ChartError::Manifest(e.to_string()))?;
        objects.push(obj);
    }
    Ok(objects)
}

/// Adds `owner` to the object's owner references. Returns false if it was already there.
pub fn ensure_owner_reference<T: Resource>(resource: &mut T, owner: &OwnerReference) -> bool {
    let owner_refs = resource
        .meta_mut()
        .owner_references
        .get_or_insert_with(Vec::new);

    if owner_refs.iter().any(|existing| existing.uid == owner.uid) {
        return false;
    }
    owner_refs.push(owner.clone());
    true
}

#[async_trait]
impl ChartManager for HelmCli {
    async fn upgrade_or_install(
        &self,
        chart_dir: &Path,
        values: &serde_json::Value,
        namespace: &str,
        release_name: &str,
        owner: &OwnerReference,
    ) -> Result<Release, ChartError> {
        let values = serde_yaml::to_string(values)?;
        let output = self
            .run(
                "upgrade",
                &upgrade_args(chart_dir, namespace, release_name),
                Some(values.as_bytes()),
            )
            .await?;

        let release: HelmReleaseOutput = serde_json::from_slice(&output.stdout)?;
        self.stamp_owner(&release.manifest, owner).await?;

        Ok(Release {
            name: release.name,
            namespace: release.namespace,
            revision: release.version,
        })
    }

    async fn uninstall(&self, release_name: &str, namespace: &str) -> Result<bool, ChartError> {
        match self
            .run("uninstall", &uninstall_args(namespace, release_name), None)
            .await
        {
            Ok(_) => Ok(true),
            Err(ChartError::Command { stderr, .. }) if is_release_not_found(&stderr) => {
                log::debug!("Release {}/{} already uninstalled", namespace, release_name);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    fn owner(uid: &str) -> OwnerReference {
        OwnerReference {
            api_version: "revtag.mesh.dev/v1alpha1".to_string(),
            kind: "RevisionTag".to_string(),
            name: "default".to_string(),
            uid: uid.to_string(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    #[test]
    fn manifest_is_split_into_objects() {
        let manifest = indoc! {r#"
            ---
            # Source: revisiontags/templates/revision-tags.yaml
            apiVersion: admissionregistration.k8s.io/v1
            kind: MutatingWebhookConfiguration
            metadata:
              name: istio-revision-tag-default
            webhooks: []
            ---
            ---
            apiVersion: v1
            kind: Service
            metadata:
              name: istiod-default
              namespace: istio-system
            spec:
              ports:
                - port: 443
        "#};

        let objects = parse_manifest(manifest).expect("parse");
        assert_eq!(objects.len(), 2);
        assert_eq!(
            objects[0].types.as_ref().map(|t| t.kind.as_str()),
            Some("MutatingWebhookConfiguration")
        );
        assert_eq!(objects[1].namespace().as_deref(), Some("istio-system"));
    }

    #[test]
    fn empty_manifest_has_no_objects() {
        assert!(parse_manifest("").expect("parse").is_empty());
    }

    #[test]
    fn owner_reference_is_added_once() {
        let mut obj = DynamicObject {
            types: None,
            metadata: Default::default(),
            data: serde_json::json!({}),
        };

        assert!(ensure_owner_reference(&mut obj, &owner("abc")));
        assert!(!ensure_owner_reference(&mut obj, &owner("abc")));
        assert_eq!(obj.metadata.owner_references.as_ref().map(Vec::len), Some(1));

        assert!(ensure_owner_reference(&mut obj, &owner("def")));
        assert_eq!(obj.metadata.owner_references.as_ref().map(Vec::len), Some(2));
    }

    #[test]
    fn upgrade_installs_and_reads_values_from_stdin() {
        let args = upgrade_args(
            Path::new("/charts/v1.24.0/charts/revisiontags"),
            "istio-system",
            "default-revisiontags",
        );
        assert_eq!(
            args,
            vec![
                "upgrade",
                "default-revisiontags",
                "/charts/v1.24.0/charts/revisiontags",
                "--install",
                "--namespace",
                "istio-system",
                "--values",
                "-",
                "--output",
                "json",
            ]
        );
    }

    #[test]
    fn uninstall_is_scoped_to_namespace() {
        assert_eq!(
            uninstall_args("istio-system", "canary-revisiontags"),
            vec!["uninstall", "canary-revisiontags", "--namespace", "istio-system"]
        );
    }

    #[test]
    fn missing_release_is_recognised() {
        assert!(is_release_not_found(
            "Error: uninstall: Release not loaded: default-revisiontags: release: not found"
        ));
        assert!(!is_release_not_found("Error: Kubernetes cluster unreachable"));
    }

    #[test]
    fn helm_json_output_is_parsed() {
        let out: HelmReleaseOutput = serde_json::from_str(
            r#"{"name":"default-revisiontags","namespace":"istio-system","version":3,"info":{"status":"deployed"}}"#,
        )
        .expect("parse");
        assert_eq!(out.version, 3);
        assert!(out.manifest.is_empty());
    }

    #[tokio::test]
    async fn fake_upgrade_is_idempotent() {
        let charts = fake::FakeChartManager::new();
        let values = serde_json::json!({ "revisionTags": ["default"] });
        let dir = Path::new("/charts/v1/charts/revisiontags");

        let first = charts
            .upgrade_or_install(dir, &values, "istio-system", "default-revisiontags", &owner("a"))
            .await
            .expect("install");
        let second = charts
            .upgrade_or_install(dir, &values, "istio-system", "default-revisiontags", &owner("a"))
            .await
            .expect("upgrade");

        assert_eq!(first.name, second.name);
        assert_eq!(second.revision, 2);
        assert_eq!(charts.release_count(), 1);
        assert!(charts.uninstall("default-revisiontags", "istio-system").await.expect("uninstall"));
        assert!(!charts.uninstall("default-revisiontags", "istio-system").await.expect("uninstall"));
    }
}
