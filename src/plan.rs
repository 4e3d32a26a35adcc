//! The cluster plan file.
//!
//! The plan (`kismatic-cluster.yaml`) is the contract between the daemon and
//! its collaborators: the provisioner fills in node details, and the
//! executor installs whatever the plan describes. It lives at the root of
//! the cluster's assets directory.

use std::path::Path;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::store::ClusterSpec;
use crate::util::errors::Result;

pub const PLAN_FILENAME: &str = "kismatic-cluster.yaml";
pub const LOG_FILENAME: &str = "kismatic.log";
pub const ASSETS_SUBDIR: &str = "assets";
pub const RUNS_SUBDIR: &str = "runs";

const ADMIN_PASSWORD_LENGTH: usize = 16;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub cluster: ClusterConfig,
    pub etcd: NodeGroup,
    pub master: MasterNodeGroup,
    pub worker: NodeGroup,
    pub ingress: NodeGroup,
    pub provisioner: PlanProvisioner,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
    pub admin_password: String,
    pub networking: NetworkConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// The CNI plugin to install. An empty plugin means the cluster is
    /// brought up without a networking stack.
    pub plugin: String,
    pub pod_cidr_block: String,
    pub service_cidr_block: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            plugin: "calico".to_string(),
            pod_cidr_block: "172.16.0.0/16".to_string(),
            service_cidr_block: "172.20.0.0/16".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeGroup {
    pub expected_count: u32,
    #[serde(default)]
    pub nodes: Vec<Node>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MasterNodeGroup {
    pub expected_count: u32,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub load_balanced_fqdn: String,
    #[serde(default)]
    pub load_balanced_short_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub host: String,
    pub ip: String,
    #[serde(default)]
    pub internal_ip: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanProvisioner {
    pub provider: String,
    #[serde(default)]
    pub options: std::collections::BTreeMap<String, String>,
}

impl Plan {
    /// Whether a CNI plugin is configured. The smoke test is only
    /// meaningful when the cluster gets a networking stack.
    pub fn network_configured(&self) -> bool {
        !self.cluster.networking.plugin.is_empty()
    }
}

/// Derive a plan from the declared spec. Generated credentials from a
/// previous plan (the admin password) are preserved across replans.
pub fn from_spec(name: &str, spec: &ClusterSpec, previous: Option<&Plan>) -> Plan {
    let admin_password = previous
        .map(|p| p.cluster.admin_password.clone())
        .filter(|password| !password.is_empty())
        .unwrap_or_else(generate_admin_password);
    Plan {
        cluster: ClusterConfig {
            name: name.to_string(),
            admin_password,
            networking: NetworkConfig::default(),
        },
        etcd: NodeGroup {
            expected_count: spec.etcd_count,
            nodes: Vec::new(),
        },
        master: MasterNodeGroup {
            expected_count: spec.master_count,
            ..Default::default()
        },
        worker: NodeGroup {
            expected_count: spec.worker_count,
            nodes: Vec::new(),
        },
        ingress: NodeGroup {
            expected_count: spec.ingress_count,
            nodes: Vec::new(),
        },
        provisioner: PlanProvisioner {
            provider: spec.provisioner.provider.clone(),
            options: spec.provisioner.options.clone(),
        },
    }
}

pub async fn read(path: &Path) -> Result<Plan> {
    let raw = tokio::fs::read_to_string(path).await?;
    Ok(serde_yaml::from_str(&raw)?)
}

pub async fn write(path: &Path, plan: &Plan) -> Result<()> {
    let raw = serde_yaml::to_string(plan)?;
    tokio::fs::write(path, raw).await?;
    Ok(())
}

fn generate_admin_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ADMIN_PASSWORD_LENGTH)
        .map(char::from)
        .collect()
}
