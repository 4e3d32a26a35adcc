//! Install-time operations executed against a provisioned cluster.
//!
//! The controller drives these through the [`Executor`] contract; the
//! shipped implementation shells out to `ansible-playbook`, keeping the
//! output of every run under the cluster's `runs/` directory.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use crate::plan::{Plan, RUNS_SUBDIR};
use crate::util::errors::{Error, Result};

const PLAYBOOKS_DIR: &str = "ansible/playbooks";
const INVENTORY_FILENAME: &str = "inventory.ini";

/// Executes install-time operations against the nodes described in a plan.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn run_pre_flight_check(&self, plan: &Plan) -> Result<()>;
    async fn generate_certificates(&self, plan: &Plan, use_existing_ca: bool) -> Result<()>;
    async fn generate_kubeconfig(&self, plan: &Plan) -> Result<()>;
    async fn install(&self, plan: &Plan, restart_services: bool) -> Result<()>;
    async fn run_smoke_test(&self, plan: &Plan) -> Result<()>;
}

/// Builds an executor bound to a cluster's assets directory.
pub trait ExecutorFactory: Send + Sync {
    fn create(&self, cluster_name: &str, assets_root_dir: &Path) -> Result<Box<dyn Executor>>;
}

/// Runs install operations as ansible playbooks. Each run leaves its output
/// under `{assets}/runs/{timestamp}-{playbook}/` for later diagnosis.
pub struct PlaybookExecutor {
    playbooks_dir: PathBuf,
    cluster_assets_dir: PathBuf,
}

#[async_trait]
impl Executor for PlaybookExecutor {
    async fn run_pre_flight_check(&self, plan: &Plan) -> Result<()> {
        self.run_playbook("preflight", plan, &[]).await
    }

    async fn generate_certificates(&self, plan: &Plan, use_existing_ca: bool) -> Result<()> {
        let use_existing = format!("use_existing_ca={use_existing_ca}");
        self.run_playbook("certificates", plan, &["-e", &use_existing])
            .await
    }

    async fn generate_kubeconfig(&self, plan: &Plan) -> Result<()> {
        self.run_playbook("kubeconfig", plan, &[]).await
    }

    async fn install(&self, plan: &Plan, restart_services: bool) -> Result<()> {
        let restart = format!("force_restart_services={restart_services}");
        self.run_playbook("kubernetes", plan, &["-e", &restart]).await
    }

    async fn run_smoke_test(&self, plan: &Plan) -> Result<()> {
        self.run_playbook("smoketest", plan, &[]).await
    }
}

impl PlaybookExecutor {
    async fn run_playbook(&self, name: &str, plan: &Plan, extra_args: &[&str]) -> Result<()> {
        let run_dir = self.cluster_assets_dir.join(RUNS_SUBDIR).join(format!(
            "{}-{name}",
            chrono::Utc::now().format("%Y%m%d%H%M%S")
        ));
        tokio::fs::create_dir_all(&run_dir).await?;

        let inventory = run_dir.join(INVENTORY_FILENAME);
        tokio::fs::write(&inventory, render_inventory(plan)).await?;

        let playbook = self.playbooks_dir.join(format!("{name}.yaml"));
        info!(cluster = %plan.cluster.name, playbook = %playbook.display(), "running playbook");
        let output = Command::new("ansible-playbook")
            .arg("-i")
            .arg(&inventory)
            .arg(&playbook)
            .args(extra_args)
            .output()
            .await
            .map_err(|e| Error::Executor(format!("error running ansible-playbook: {e}")))?;

        let mut combined = output.stdout.clone();
        combined.extend_from_slice(&output.stderr);
        tokio::fs::write(run_dir.join("out.log"), &combined).await?;

        if !output.status.success() {
            return Err(Error::Executor(format!(
                "playbook {name} failed, output kept in {}",
                run_dir.display()
            )));
        }
        Ok(())
    }
}

/// Render an ansible inventory from the plan's node groups.
fn render_inventory(plan: &Plan) -> String {
    let mut out = String::new();
    let groups = [
        ("etcd", &plan.etcd.nodes),
        ("master", &plan.master.nodes),
        ("worker", &plan.worker.nodes),
        ("ingress", &plan.ingress.nodes),
    ];
    for (group, nodes) in groups {
        out.push_str(&format!("[{group}]\n"));
        for node in nodes {
            let internal = if node.internal_ip.is_empty() {
                &node.ip
            } else {
                &node.internal_ip
            };
            out.push_str(&format!(
                "{} ansible_host={} internal_ipv4={}\n",
                node.host, node.ip, internal
            ));
        }
        out.push('\n');
    }
    out
}

/// Factory for [`PlaybookExecutor`]s.
pub struct PlaybookExecutorFactory {
    playbooks_dir: PathBuf,
}

impl PlaybookExecutorFactory {
    pub fn new() -> PlaybookExecutorFactory {
        PlaybookExecutorFactory {
            playbooks_dir: PathBuf::from(PLAYBOOKS_DIR),
        }
    }
}

impl Default for PlaybookExecutorFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutorFactory for PlaybookExecutorFactory {
    fn create(&self, cluster_name: &str, assets_root_dir: &Path) -> Result<Box<dyn Executor>> {
        Ok(Box::new(PlaybookExecutor {
            playbooks_dir: self.playbooks_dir.clone(),
            cluster_assets_dir: assets_root_dir.join(cluster_name),
        }))
    }
}
