//! Cluster lifecycle controllers.
//!
//! A single supervisor owns one controller task per cluster defined in the
//! store. The supervisor reacts to store watch events, dispatches
//! notifications to the right controller, and periodically rescans the
//! whole store to recover from missed events and to pick up clusters that
//! were loaded from disk at startup.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::install::ExecutorFactory;
use crate::provision::ProvisionerFactory;
use crate::store::{Cluster, ClusterStore, ClusterWatchEvent};
use crate::util::metrics::Metrics;

mod cluster;

use cluster::ClusterController;

/// The size of the notification buffer assigned to each cluster
/// controller. Notifications beyond it are dropped and recovered by the
/// next reconciliation pass.
pub const CLUSTER_CONTROLLER_NOTIFICATION_BUFFER: usize = 10;

/// Buffer of the supervisor's own subscription on the cluster bucket.
const SUPERVISOR_WATCH_BUFFER: usize = 64;

/// How often the supervisor rescans the store when not configured
/// otherwise.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(600);

/// State shared between the controllers and the web server
#[derive(Clone)]
pub struct State {
    /// Diagnostics populated by the supervisor
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    registry: prometheus::Registry,
    metrics: Metrics,
}

impl Default for State {
    fn default() -> Self {
        let registry = prometheus::Registry::default();
        let metrics = Metrics::default().register(&registry).unwrap();
        State {
            diagnostics: Arc::new(RwLock::new(Diagnostics::default())),
            registry,
            metrics,
        }
    }
}

impl State {
    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    async fn touch(&self) {
        self.diagnostics.write().await.last_event = Utc::now();
    }

    async fn set_managed_clusters(&self, count: usize) {
        self.diagnostics.write().await.managed_clusters = count;
        self.metrics.managed_clusters.set(count as i64);
    }
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    pub managed_clusters: usize,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Diagnostics {
            last_event: Utc::now(),
            managed_clusters: 0,
        }
    }
}

struct ControllerHandle {
    notify: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

/// Supervises one [`ClusterController`] per cluster present in the store.
///
/// Because there is only one channel between the store and the supervisor,
/// each controller gets its own bounded channel so notifications can be
/// dispatched immediately; when a controller's buffer is full the
/// notification is dropped.
pub struct MultiClusterController {
    assets_root_dir: PathBuf,
    store: ClusterStore,
    executors: Arc<dyn ExecutorFactory>,
    provisioners: Arc<dyn ProvisionerFactory>,
    reconcile_interval: Duration,
    state: State,
    controllers: HashMap<String, ControllerHandle>,
}

impl MultiClusterController {
    pub fn new(
        assets_root_dir: PathBuf,
        store: ClusterStore,
        executors: Arc<dyn ExecutorFactory>,
        provisioners: Arc<dyn ProvisionerFactory>,
        reconcile_interval: Duration,
        state: State,
    ) -> MultiClusterController {
        MultiClusterController {
            assets_root_dir,
            store,
            executors,
            provisioners,
            reconcile_interval,
            state,
            controllers: HashMap::new(),
        }
    }

    /// Run until the shutdown token fires. On shutdown every controller's
    /// notification channel is closed and the supervisor waits for the
    /// controllers to observe the closure and return.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("started multi-cluster controller");
        let watch_cancel = CancellationToken::new();
        let mut watch = self.store.watch(watch_cancel.clone(), SUPERVISOR_WATCH_BUFFER);
        // The first tick fires immediately, which starts controllers for
        // clusters already in the store at startup.
        let mut ticker = tokio::time::interval(self.reconcile_interval);
        loop {
            tokio::select! {
                event = watch.recv() => match event {
                    Some(event) => self.handle_watch_event(event).await,
                    None => {
                        warn!("store watch closed, stopping the multi-cluster controller");
                        break;
                    }
                },
                _ = ticker.tick() => self.resync().await,
                _ = shutdown.cancelled() => break,
            }
        }
        info!("stopping the multi-cluster controller");
        watch_cancel.cancel();
        for (name, handle) in self.controllers.drain() {
            drop(handle.notify);
            if let Err(e) = handle.task.await {
                warn!(cluster = %name, error = %e, "cluster controller task failed");
            }
        }
    }

    async fn handle_watch_event(&mut self, event: ClusterWatchEvent) {
        self.state.touch().await;
        match event.cluster {
            // Stop the cluster controller if the cluster has been deleted.
            None => {
                if let Some(handle) = self.controllers.remove(&event.name) {
                    info!(cluster = %event.name, "cluster deleted, stopping its controller");
                    drop(handle.notify);
                }
                self.state.set_managed_clusters(self.controllers.len()).await;
            }
            Some(cluster) => {
                // Create a controller the first time we hear about a
                // cluster, then pass the notification along.
                if !self.controllers.contains_key(&event.name) {
                    self.spawn_controller(&event.name, &cluster);
                    self.state.set_managed_clusters(self.controllers.len()).await;
                }
                self.notify(&event.name);
            }
        }
    }

    /// The safety net against dropped watch notifications: make the set of
    /// controllers match the set of clusters in the store, then poke every
    /// controller with the latest definition.
    async fn resync(&mut self) {
        debug!("running full reconciliation pass");
        let defined = match self.store.get_all() {
            Ok(defined) => defined,
            Err(e) => {
                error!(error = %e, "failed to get all the clusters defined in the store");
                return;
            }
        };

        for (name, cluster) in &defined {
            if !self.controllers.contains_key(name) {
                self.spawn_controller(name, cluster);
            }
        }

        // Remove lingering controllers, if any.
        let lingering: Vec<String> = self
            .controllers
            .keys()
            .filter(|name| !defined.contains_key(*name))
            .cloned()
            .collect();
        for name in lingering {
            if let Some(handle) = self.controllers.remove(&name) {
                info!(cluster = %name, "cluster no longer in the store, stopping its controller");
                drop(handle.notify);
            }
        }

        self.state.set_managed_clusters(self.controllers.len()).await;

        for name in self.controllers.keys() {
            self.notify(name);
        }
    }

    fn spawn_controller(&mut self, name: &str, cluster: &Cluster) {
        let executor = match self.executors.create(name, &self.assets_root_dir) {
            Ok(executor) => executor,
            Err(e) => {
                error!(cluster = %name, error = %e, "error creating executor for new cluster");
                return;
            }
        };
        let controller = match ClusterController::new(
            name,
            self.assets_root_dir.join(name),
            self.store.clone(),
            executor,
            self.provisioners.clone(),
            cluster,
            self.state.metrics.clone(),
        ) {
            Ok(controller) => controller,
            Err(e) => {
                error!(cluster = %name, error = %e, "error creating controller for new cluster");
                return;
            }
        };
        info!(cluster = %name, "starting cluster controller");
        let (notify, notifications) = mpsc::channel(CLUSTER_CONTROLLER_NOTIFICATION_BUFFER);
        let task = tokio::spawn(controller.run(notifications));
        self.controllers
            .insert(name.to_string(), ControllerHandle { notify, task });
    }

    fn notify(&self, name: &str) {
        if let Some(handle) = self.controllers.get(name) {
            // Don't block if the controller's buffer is full; the next
            // reconciliation pass re-triggers it.
            if handle.notify.try_send(()).is_err() {
                info!(cluster = %name, "controller buffer is full, dropping notification");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;

    use crate::install::{Executor, ExecutorFactory};
    use crate::plan::Plan;
    use crate::provision::{Provisioner, ProvisionerFactory};
    use crate::store::Cluster;
    use crate::util::errors::{Error, Result};

    /// Switches that make stub collaborators fail on demand.
    #[derive(Default)]
    pub(crate) struct StubFailures {
        provision: AtomicBool,
        install: AtomicBool,
        destroy: AtomicBool,
    }

    impl StubFailures {
        pub(crate) fn fail_provision(&self, fail: bool) {
            self.provision.store(fail, Ordering::SeqCst);
        }

        pub(crate) fn fail_install(&self, fail: bool) {
            self.install.store(fail, Ordering::SeqCst);
        }

        pub(crate) fn fail_destroy(&self, fail: bool) {
            self.destroy.store(fail, Ordering::SeqCst);
        }
    }

    /// Stub executor and provisioner factories that count collaborator
    /// calls, shared across every controller they create.
    #[derive(Default)]
    pub(crate) struct StubFactories {
        pub(crate) failures: Arc<StubFailures>,
        executor_calls: Arc<AtomicUsize>,
        install_calls: Arc<AtomicUsize>,
        provision_calls: Arc<AtomicUsize>,
        destroy_calls: Arc<AtomicUsize>,
    }

    impl StubFactories {
        pub(crate) fn executor(&self) -> Box<dyn Executor> {
            Box::new(StubExecutor {
                failures: self.failures.clone(),
                calls: self.executor_calls.clone(),
                install_calls: self.install_calls.clone(),
            })
        }

        pub(crate) fn executors(&self) -> Arc<dyn ExecutorFactory> {
            Arc::new(StubExecutorFactory {
                failures: self.failures.clone(),
                calls: self.executor_calls.clone(),
                install_calls: self.install_calls.clone(),
            })
        }

        pub(crate) fn provisioners(&self) -> Arc<dyn ProvisionerFactory> {
            Arc::new(StubProvisionerFactory {
                failures: self.failures.clone(),
                provision_calls: self.provision_calls.clone(),
                destroy_calls: self.destroy_calls.clone(),
            })
        }

        pub(crate) fn executor_calls(&self) -> usize {
            self.executor_calls.load(Ordering::SeqCst)
        }

        pub(crate) fn install_calls(&self) -> usize {
            self.install_calls.load(Ordering::SeqCst)
        }

        pub(crate) fn provision_calls(&self) -> usize {
            self.provision_calls.load(Ordering::SeqCst)
        }

        pub(crate) fn destroy_calls(&self) -> usize {
            self.destroy_calls.load(Ordering::SeqCst)
        }
    }

    struct StubExecutor {
        failures: Arc<StubFailures>,
        calls: Arc<AtomicUsize>,
        install_calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Executor for StubExecutor {
        async fn run_pre_flight_check(&self, _plan: &Plan) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn generate_certificates(&self, _plan: &Plan, _use_existing_ca: bool) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn generate_kubeconfig(&self, _plan: &Plan) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn install(&self, _plan: &Plan, _restart_services: bool) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.install_calls.fetch_add(1, Ordering::SeqCst);
            if self.failures.install.load(Ordering::SeqCst) {
                return Err(Error::Executor("install blew up".to_string()));
            }
            Ok(())
        }

        async fn run_smoke_test(&self, _plan: &Plan) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct StubExecutorFactory {
        failures: Arc<StubFailures>,
        calls: Arc<AtomicUsize>,
        install_calls: Arc<AtomicUsize>,
    }

    impl ExecutorFactory for StubExecutorFactory {
        fn create(
            &self,
            _cluster_name: &str,
            _assets_root_dir: &std::path::Path,
        ) -> Result<Box<dyn Executor>> {
            Ok(Box::new(StubExecutor {
                failures: self.failures.clone(),
                calls: self.calls.clone(),
                install_calls: self.install_calls.clone(),
            }))
        }
    }

    struct StubProvisioner {
        failures: Arc<StubFailures>,
        provision_calls: Arc<AtomicUsize>,
        destroy_calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Provisioner for StubProvisioner {
        async fn provision(&self, mut plan: Plan) -> Result<Plan> {
            self.provision_calls.fetch_add(1, Ordering::SeqCst);
            if self.failures.provision.load(Ordering::SeqCst) {
                return Err(Error::Provision("provision blew up".to_string()));
            }
            plan.master.load_balanced_fqdn = "lb.example.com".to_string();
            Ok(plan)
        }

        async fn destroy(&self, _cluster_name: &str) -> Result<()> {
            self.destroy_calls.fetch_add(1, Ordering::SeqCst);
            if self.failures.destroy.load(Ordering::SeqCst) {
                return Err(Error::Provision("destroy blew up".to_string()));
            }
            Ok(())
        }
    }

    struct StubProvisionerFactory {
        failures: Arc<StubFailures>,
        provision_calls: Arc<AtomicUsize>,
        destroy_calls: Arc<AtomicUsize>,
    }

    impl ProvisionerFactory for StubProvisionerFactory {
        fn create(&self, _cluster_name: &str, _cluster: &Cluster) -> Result<Box<dyn Provisioner>> {
            Ok(Box::new(StubProvisioner {
                failures: self.failures.clone(),
                provision_calls: self.provision_calls.clone(),
                destroy_calls: self.destroy_calls.clone(),
            }))
        }
    }
}
