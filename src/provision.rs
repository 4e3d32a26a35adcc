//! Infrastructure provisioning.
//!
//! The daemon talks to infrastructure through the [`Provisioner`] contract.
//! The shipped implementation drives terraform: each cluster gets its own
//! state directory, and provider credentials are injected into the
//! terraform process environment after being resolved through the
//! [`SecretsGetter`] contract.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use crate::plan::Plan;
use crate::store::{Cluster, ClusterStore};
use crate::util::errors::{Error, Result};

/// Providers the daemon knows how to provision infrastructure on.
pub const SUPPORTED_PROVIDERS: &[&str] = &["aws", "azure"];

const TERRAFORM_BINARY_PATH: &str = "terraform/bin/terraform";
const TERRAFORM_PROVIDERS_DIR: &str = "terraform/providers";
const TERRAFORM_CLUSTERS_DIR: &str = "terraform/clusters";

/// The secrets each provider requires, as a map from the secret name
/// declared in the cluster spec to the environment variable it must be
/// exposed as.
pub fn expected_secrets(provider: &str) -> Result<BTreeMap<String, String>> {
    let env_vars: &[&str] = match provider {
        "aws" => &["AWS_ACCESS_KEY_ID", "AWS_SECRET_ACCESS_KEY"],
        "azure" => &[
            "ARM_SUBSCRIPTION_ID",
            "ARM_CLIENT_ID",
            "ARM_CLIENT_SECRET",
            "ARM_TENANT_ID",
        ],
        other => return Err(Error::UnsupportedProvider(other.to_string())),
    };
    Ok(env_vars
        .iter()
        .map(|v| (v.to_string(), v.to_string()))
        .collect())
}

/// Creates and destroys infrastructure for a cluster.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Provision the infrastructure described in the plan. Returns the plan
    /// updated with the provisioned details (node IPs, load balanced FQDN).
    /// Must converge when re-run over an existing footprint.
    async fn provision(&self, plan: Plan) -> Result<Plan>;

    /// Destroy the infrastructure that was provisioned for the cluster.
    async fn destroy(&self, cluster_name: &str) -> Result<()>;
}

/// Builds a provisioner for a cluster based on its declared provider.
pub trait ProvisionerFactory: Send + Sync {
    fn create(&self, cluster_name: &str, cluster: &Cluster) -> Result<Box<dyn Provisioner>>;
}

/// Provides secrets required when interacting with cloud provider APIs.
pub trait SecretsGetter: Send + Sync {
    /// Resolve the expected secrets of a cluster into `KEY=VALUE` strings
    /// suitable for subprocess environment injection. The expected map goes
    /// from declared secret name to environment variable name. Fails if a
    /// required secret is missing.
    fn get_as_environment_variables(
        &self,
        cluster_name: &str,
        expected: &BTreeMap<String, String>,
    ) -> Result<Vec<String>>;
}

/// Resolves secrets from the cluster records in the store.
pub struct StoreSecretsGetter {
    clusters: ClusterStore,
}

impl StoreSecretsGetter {
    pub fn new(clusters: ClusterStore) -> StoreSecretsGetter {
        StoreSecretsGetter { clusters }
    }
}

impl SecretsGetter for StoreSecretsGetter {
    fn get_as_environment_variables(
        &self,
        cluster_name: &str,
        expected: &BTreeMap<String, String>,
    ) -> Result<Vec<String>> {
        let cluster = self
            .clusters
            .get(cluster_name)?
            .ok_or_else(|| Error::ClusterNotFound(cluster_name.to_string()))?;
        let mut env_vars = Vec::with_capacity(expected.len());
        for (secret_name, env_var) in expected {
            let value = cluster
                .spec
                .provisioner
                .secrets
                .get(secret_name)
                .ok_or_else(|| Error::MissingSecret {
                    cluster: cluster_name.to_string(),
                    name: secret_name.clone(),
                })?;
            env_vars.push(format!("{env_var}={value}"));
        }
        Ok(env_vars)
    }
}

/// Terraform-backed provisioner. All terraform invocations run in the
/// cluster's state directory so that concurrent clusters don't share state.
pub struct Terraform {
    binary_path: PathBuf,
    providers_dir: PathBuf,
    clusters_dir: PathBuf,
    provider: String,
    /// KEY=VALUE credential pairs added to the terraform environment.
    env: Vec<(String, String)>,
}

#[async_trait]
impl Provisioner for Terraform {
    async fn provision(&self, plan: Plan) -> Result<Plan> {
        let cluster_name = plan.cluster.name.clone();
        let state_dir = self.clusters_dir.join(&cluster_name);
        tokio::fs::create_dir_all(&state_dir).await?;

        // Terraform runs inside the cluster state dir; the provider module
        // path must stay valid from there.
        let provider_dir = absolute(&self.providers_dir)?
            .join(&self.provider)
            .to_string_lossy()
            .into_owned();
        let plan_out = format!("-out={cluster_name}");

        info!(cluster = %cluster_name, provider = %self.provider, "provisioning infrastructure");
        self.run(&state_dir, &["init", &provider_dir]).await?;
        self.run(&state_dir, &["plan", &plan_out, &provider_dir])
            .await?;
        self.run(&state_dir, &["apply", &cluster_name]).await?;

        // The provider template renders the updated plan as a terraform
        // output once the footprint exists.
        let rendered = self
            .run(&state_dir, &["output", "rendered_template"])
            .await?;
        let provisioned: Plan = serde_yaml::from_str(&rendered)
            .map_err(|e| Error::Provision(format!("error decoding rendered plan: {e}")))?;
        Ok(provisioned)
    }

    async fn destroy(&self, cluster_name: &str) -> Result<()> {
        let state_dir = self.clusters_dir.join(cluster_name);
        info!(cluster = %cluster_name, "destroying provisioned infrastructure");
        self.run(&state_dir, &["destroy", "-force"]).await?;
        Ok(())
    }
}

impl Terraform {
    async fn run(&self, dir: &Path, args: &[&str]) -> Result<String> {
        let output = Command::new(absolute(&self.binary_path)?)
            .args(args)
            .current_dir(dir)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .output()
            .await
            .map_err(|e| {
                Error::Provision(format!(
                    "error running {} {}: {e}",
                    self.binary_path.display(),
                    args.join(" ")
                ))
            })?;
        if !output.status.success() {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            return Err(Error::Provision(format!(
                "terraform {} failed: {}",
                args.first().unwrap_or(&""),
                combined.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// Builds terraform provisioners with credentials resolved from the
/// cluster's declared secrets.
pub struct TerraformFactory {
    binary_path: PathBuf,
    providers_dir: PathBuf,
    clusters_dir: PathBuf,
    secrets: Arc<dyn SecretsGetter>,
}

impl TerraformFactory {
    pub fn new(secrets: Arc<dyn SecretsGetter>) -> TerraformFactory {
        TerraformFactory {
            binary_path: PathBuf::from(TERRAFORM_BINARY_PATH),
            providers_dir: PathBuf::from(TERRAFORM_PROVIDERS_DIR),
            clusters_dir: PathBuf::from(TERRAFORM_CLUSTERS_DIR),
            secrets,
        }
    }
}

impl ProvisionerFactory for TerraformFactory {
    fn create(&self, cluster_name: &str, cluster: &Cluster) -> Result<Box<dyn Provisioner>> {
        let provider = cluster.spec.provisioner.provider.clone();
        let expected = expected_secrets(&provider)?;
        let env = self
            .secrets
            .get_as_environment_variables(cluster_name, &expected)?
            .into_iter()
            .filter_map(|pair| {
                pair.split_once('=')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
            })
            .collect();
        Ok(Box::new(Terraform {
            binary_path: self.binary_path.clone(),
            providers_dir: self.providers_dir.clone(),
            clusters_dir: self.clusters_dir.clone(),
            provider,
            env,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{
        ClusterSpec, ClusterState, ClusterStatus, KvStore, ProvisionerSpec, CLUSTER_BUCKET,
    };

    fn cluster_with_secrets(secrets: BTreeMap<String, String>) -> Cluster {
        Cluster {
            spec: ClusterSpec {
                desired_state: ClusterState::Installed,
                etcd_count: 1,
                master_count: 1,
                worker_count: 1,
                ingress_count: 0,
                provisioner: ProvisionerSpec {
                    provider: "aws".to_string(),
                    options: BTreeMap::new(),
                    secrets,
                },
            },
            status: ClusterStatus::default(),
        }
    }

    #[test]
    fn unknown_providers_are_rejected() {
        assert!(matches!(
            expected_secrets("digitalocean"),
            Err(Error::UnsupportedProvider(_))
        ));
        assert!(expected_secrets("aws").is_ok());
        assert!(expected_secrets("azure").is_ok());
    }

    #[tokio::test]
    async fn secrets_getter_resolves_declared_secrets() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(KvStore::open(dir.path().join("store.db")).unwrap());
        store.create_bucket(CLUSTER_BUCKET).unwrap();
        let clusters = ClusterStore::new(store, CLUSTER_BUCKET);

        let secrets = BTreeMap::from([
            ("AWS_ACCESS_KEY_ID".to_string(), "AKIA123".to_string()),
            ("AWS_SECRET_ACCESS_KEY".to_string(), "shhh".to_string()),
        ]);
        clusters
            .put("c1", &cluster_with_secrets(secrets))
            .await
            .unwrap();

        let getter = StoreSecretsGetter::new(clusters);
        let expected = expected_secrets("aws").unwrap();
        let env = getter.get_as_environment_variables("c1", &expected).unwrap();
        assert!(env.contains(&"AWS_ACCESS_KEY_ID=AKIA123".to_string()));
        assert!(env.contains(&"AWS_SECRET_ACCESS_KEY=shhh".to_string()));
    }

    #[tokio::test]
    async fn secrets_getter_fails_on_missing_secret() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(KvStore::open(dir.path().join("store.db")).unwrap());
        store.create_bucket(CLUSTER_BUCKET).unwrap();
        let clusters = ClusterStore::new(store, CLUSTER_BUCKET);

        clusters
            .put("c1", &cluster_with_secrets(BTreeMap::new()))
            .await
            .unwrap();

        let getter = StoreSecretsGetter::new(clusters);
        let expected = expected_secrets("aws").unwrap();
        let err = getter
            .get_as_environment_variables("c1", &expected)
            .unwrap_err();
        assert!(matches!(err, Error::MissingSecret { .. }));
    }
}
