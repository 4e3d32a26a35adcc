use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::install::Executor;
use crate::plan;
use crate::provision::ProvisionerFactory;
use crate::store::{Cluster, ClusterSpec, ClusterState, ClusterStatus, ClusterStore};
use crate::util::errors::{Error, Result};
use crate::util::metrics::Metrics;

/// Whether the loop keeps waiting for notifications or exits because the
/// cluster is gone.
pub(crate) enum ControllerFlow {
    Continue,
    Exit,
}

/// The action a transition executes. Actions may run for minutes and are
/// expected to be idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Plan,
    Provision,
    Install,
    Destroy,
}

/// The outcome of consulting the transition table for a (current, desired)
/// pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    /// Move to the given state without doing any work.
    Step(ClusterState),
    /// Execute an action; the action decides the resulting state.
    Act(Action),
    /// Nothing to do for this combination.
    Rest,
    /// No transition is defined; this combination should not happen.
    Undefined,
}

/// The transition table. `destroyed` as the desired state routes every
/// non-terminal state through `destroying`; otherwise the cluster walks
/// plan → provision → install.
fn next_transition(current: Option<ClusterState>, desired: ClusterState) -> Transition {
    use ClusterState::*;
    let destroy_wanted = desired == Destroyed;
    match current {
        None => Transition::Step(Planning),
        Some(Planning) => Transition::Act(Action::Plan),
        Some(Planned) | Some(PlanningFailed) if destroy_wanted => Transition::Step(Destroying),
        Some(Planned) => Transition::Step(Provisioning),
        Some(PlanningFailed) => Transition::Step(Planning),
        Some(Provisioning) => Transition::Act(Action::Provision),
        Some(Provisioned) | Some(ProvisionFailed) if destroy_wanted => Transition::Step(Destroying),
        Some(Provisioned) => Transition::Step(Installing),
        Some(ProvisionFailed) => Transition::Step(Provisioning),
        Some(Installing) => Transition::Act(Action::Install),
        Some(Installed) | Some(InstallFailed) if destroy_wanted => Transition::Step(Destroying),
        Some(Installed) => Transition::Rest,
        Some(InstallFailed) => Transition::Step(Installing),
        Some(Destroying) => Transition::Act(Action::Destroy),
        Some(DestroyFailed) if destroy_wanted => Transition::Step(Destroying),
        Some(DestroyFailed) | Some(Destroyed) => Transition::Undefined,
    }
}

/// Manages the lifecycle of a single cluster by driving its status toward
/// the declared desired state, one transition at a time. Every resulting
/// status is persisted before the next transition runs, so a restart
/// resumes from the last persisted state.
pub(crate) struct ClusterController {
    name: String,
    assets_dir: PathBuf,
    store: ClusterStore,
    executor: Box<dyn Executor>,
    provisioners: Arc<dyn ProvisionerFactory>,
    last_spec: ClusterSpec,
    log: ClusterLog,
    metrics: Metrics,
}

impl ClusterController {
    pub(crate) fn new(
        name: &str,
        assets_dir: PathBuf,
        store: ClusterStore,
        executor: Box<dyn Executor>,
        provisioners: Arc<dyn ProvisionerFactory>,
        cluster: &Cluster,
        metrics: Metrics,
    ) -> Result<ClusterController> {
        std::fs::create_dir_all(&assets_dir)?;
        let log = ClusterLog {
            path: assets_dir.join(plan::LOG_FILENAME),
        };
        Ok(ClusterController {
            name: name.to_string(),
            assets_dir,
            store,
            executor,
            provisioners,
            last_spec: cluster.spec.clone(),
            log,
            metrics,
        })
    }

    /// Process notifications until the channel closes or the cluster is
    /// destroyed. Notifications are coalesced by the sender; each one
    /// triggers a full reconcile against the latest stored record.
    pub(crate) async fn run(mut self, mut notifications: mpsc::Receiver<()>) {
        info!(cluster = %self.name, "started cluster controller");
        self.log.append("started controller");
        while notifications.recv().await.is_some() {
            debug!(cluster = %self.name, "got notification");
            if let ControllerFlow::Exit = self.reconcile().await {
                break;
            }
        }
        info!(cluster = %self.name, "stopping controller");
        self.log.append("stopping controller");
    }

    /// Take the cluster toward its desired state, persisting the status
    /// after every transition. Store errors abort the pass; the periodic
    /// resync will retry.
    pub(crate) async fn reconcile(&mut self) -> ControllerFlow {
        let _timer = self.metrics.count_and_measure(&self.name);
        let mut transitioned = false;
        loop {
            let mut cluster = match self.store.get(&self.name) {
                Ok(Some(cluster)) => cluster,
                Ok(None) => return ControllerFlow::Continue,
                Err(e) => {
                    error!(cluster = %self.name, error = %e, "error getting cluster from store");
                    return ControllerFlow::Continue;
                }
            };

            // A configuration change invalidates previous planning, so the
            // cluster goes through a replan unless it is on its way out.
            if cluster.spec != self.last_spec {
                self.last_spec = cluster.spec.clone();
                if cluster.spec.desired_state != ClusterState::Destroyed {
                    info!(cluster = %self.name, "spec changed, planning again");
                    self.log.append("spec changed, planning again");
                    cluster.status.current_state = Some(ClusterState::Planning);
                }
            }

            if cluster.status.waiting_for_manual_retry {
                debug!(cluster = %self.name, "waiting for manual retry, nothing to do");
                return ControllerFlow::Continue;
            }

            let desired = cluster.spec.desired_state;
            if cluster.status.current_state == Some(desired) {
                // A destroyed record that is still in the store means a
                // previous removal failed; finish the job.
                if desired == ClusterState::Destroyed {
                    return self.remove_from_store().await;
                }
                if transitioned {
                    info!(cluster = %self.name, state = %desired, "cluster reached desired state");
                    self.log.append(&format!("reached desired state {desired}"));
                }
                return ControllerFlow::Continue;
            }

            match next_transition(cluster.status.current_state, desired) {
                Transition::Rest => return ControllerFlow::Continue,
                Transition::Undefined => {
                    // The only way out of this is deleting the cluster, as
                    // this combination should not happen.
                    error!(
                        cluster = %self.name,
                        current = ?cluster.status.current_state,
                        desired = %desired,
                        "no transition defined for the cluster's current state"
                    );
                    self.log.append(&format!(
                        "no transition defined toward desired state {desired}"
                    ));
                    cluster.status.waiting_for_manual_retry = true;
                    let _ = self.persist_status(cluster.status).await;
                    return ControllerFlow::Continue;
                }
                Transition::Step(state) => {
                    debug!(cluster = %self.name, state = %state, "transitioning");
                    cluster.status.current_state = Some(state);
                    if self.persist_status(cluster.status).await.is_err() {
                        return ControllerFlow::Continue;
                    }
                }
                Transition::Act(action) => {
                    let status = self.execute(action, &cluster).await;
                    let reached = status.current_state;
                    if self.persist_status(status).await.is_err() {
                        return ControllerFlow::Continue;
                    }
                    if reached == Some(ClusterState::Destroyed) {
                        return self.remove_from_store().await;
                    }
                }
            }
            transitioned = true;
        }
    }

    async fn remove_from_store(&self) -> ControllerFlow {
        match self.store.delete(&self.name).await {
            Ok(()) => {
                info!(cluster = %self.name, "cluster destroyed and removed from the store");
                self.log.append("cluster destroyed and removed from the store");
                ControllerFlow::Exit
            }
            Err(e) => {
                error!(cluster = %self.name, error = %e, "error removing destroyed cluster from store");
                ControllerFlow::Continue
            }
        }
    }

    async fn execute(&self, action: Action, cluster: &Cluster) -> ClusterStatus {
        match action {
            Action::Plan => self.plan(cluster).await,
            Action::Provision => self.provision(cluster).await,
            Action::Install => self.install(cluster).await,
            Action::Destroy => self.destroy(cluster).await,
        }
    }

    /// Write the record back, keeping whatever spec is in the store and
    /// replacing only the status. The spec may have changed while an action
    /// was running; the HTTP API never writes status, so the two writers
    /// cannot clobber each other.
    async fn persist_status(&self, status: ClusterStatus) -> Result<()> {
        let result = match self.store.get(&self.name) {
            Ok(Some(mut latest)) => {
                latest.status = status;
                self.store.put(&self.name, &latest).await.map_err(Error::from)
            }
            Ok(None) => Err(Error::ClusterNotFound(self.name.clone())),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = &result {
            error!(cluster = %self.name, error = %e, "error storing cluster state");
        }
        result
    }

    async fn plan(&self, cluster: &Cluster) -> ClusterStatus {
        let mut status = cluster.status.clone();
        info!(cluster = %self.name, "planning cluster");
        self.log.append("planning cluster");
        match self.run_plan(cluster).await {
            Ok(()) => {
                status.current_state = Some(ClusterState::Planned);
            }
            Err(e) => {
                error!(cluster = %self.name, error = %e, "error planning cluster");
                self.log.append(&format!("error planning cluster: {e}"));
                self.metrics.reconcile_failure(&self.name, &e);
                status.current_state = Some(ClusterState::PlanningFailed);
                status.waiting_for_manual_retry = true;
            }
        }
        status
    }

    async fn run_plan(&self, cluster: &Cluster) -> Result<()> {
        tokio::fs::create_dir_all(self.assets_dir.join(plan::ASSETS_SUBDIR)).await?;
        let plan_path = self.plan_path();
        let previous = if plan_path.exists() {
            Some(plan::read(&plan_path).await?)
        } else {
            None
        };
        let plan = plan::from_spec(&self.name, &cluster.spec, previous.as_ref());
        plan::write(&plan_path, &plan).await
    }

    async fn provision(&self, cluster: &Cluster) -> ClusterStatus {
        let mut status = cluster.status.clone();
        info!(cluster = %self.name, "provisioning infrastructure for cluster");
        self.log.append("provisioning infrastructure for cluster");
        match self.run_provision(cluster, &mut status).await {
            Ok(()) => {
                status.current_state = Some(ClusterState::Provisioned);
            }
            Err(e) => {
                error!(cluster = %self.name, error = %e, "error provisioning cluster");
                self.log.append(&format!("error provisioning cluster: {e}"));
                self.metrics.reconcile_failure(&self.name, &e);
                status.current_state = Some(ClusterState::ProvisionFailed);
                status.waiting_for_manual_retry = true;
            }
        }
        status
    }

    async fn run_provision(&self, cluster: &Cluster, status: &mut ClusterStatus) -> Result<()> {
        let plan = plan::read(&self.plan_path()).await?;
        let provisioner = self.provisioners.create(&self.name, cluster)?;
        let updated = provisioner.provision(plan).await?;
        plan::write(&self.plan_path(), &updated).await?;
        if !updated.master.load_balanced_fqdn.is_empty() {
            status.cluster_ip = Some(updated.master.load_balanced_fqdn.clone());
        }
        Ok(())
    }

    async fn install(&self, cluster: &Cluster) -> ClusterStatus {
        let mut status = cluster.status.clone();
        info!(cluster = %self.name, "installing cluster");
        self.log.append("installing cluster");
        match self.run_install().await {
            Ok(()) => {
                status.current_state = Some(ClusterState::Installed);
            }
            Err(e) => {
                error!(cluster = %self.name, error = %e, "error installing cluster");
                self.log.append(&format!("error installing cluster: {e}"));
                self.metrics.reconcile_failure(&self.name, &e);
                status.current_state = Some(ClusterState::InstallFailed);
                status.waiting_for_manual_retry = true;
            }
        }
        status
    }

    async fn run_install(&self) -> Result<()> {
        let plan = plan::read(&self.plan_path()).await?;
        self.executor.run_pre_flight_check(&plan).await?;
        self.executor.generate_certificates(&plan, false).await?;
        self.executor.generate_kubeconfig(&plan).await?;
        self.executor.install(&plan, false).await?;
        // Skip the smoke test when the cluster was brought up without a
        // networking stack.
        if plan.network_configured() {
            self.executor.run_smoke_test(&plan).await?;
        }
        Ok(())
    }

    async fn destroy(&self, cluster: &Cluster) -> ClusterStatus {
        let mut status = cluster.status.clone();
        info!(cluster = %self.name, "destroying cluster");
        self.log.append("destroying cluster");
        let result = match self.provisioners.create(&self.name, cluster) {
            Ok(provisioner) => provisioner.destroy(&self.name).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                status.current_state = Some(ClusterState::Destroyed);
            }
            Err(e) => {
                error!(cluster = %self.name, error = %e, "error destroying cluster");
                self.log.append(&format!("error destroying cluster: {e}"));
                self.metrics.reconcile_failure(&self.name, &e);
                status.current_state = Some(ClusterState::DestroyFailed);
                status.waiting_for_manual_retry = true;
            }
        }
        status
    }

    fn plan_path(&self) -> PathBuf {
        self.assets_dir.join(plan::PLAN_FILENAME)
    }
}

/// Plain-text per-cluster log, served by the logs endpoint. Failures to
/// write are reported on the process log and otherwise ignored.
struct ClusterLog {
    path: PathBuf,
}

impl ClusterLog {
    fn append(&self, line: &str) {
        let stamped = format!("{} {line}\n", chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"));
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(stamped.as_bytes()));
        if let Err(e) = result {
            tracing::warn!(path = %self.path.display(), error = %e, "could not write cluster log line");
        }
    }
}
