use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{KvStore, StoreError, WatchResponse};

/// The bucket that holds one entry per cluster, keyed by cluster name.
pub const CLUSTER_BUCKET: &str = "kismatic";

/// The lifecycle states a cluster moves through. `desiredState` is limited
/// to the resting states (planned, provisioned, installed, destroyed);
/// `currentState` may be any of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClusterState {
    Planning,
    Planned,
    PlanningFailed,
    Provisioning,
    Provisioned,
    ProvisionFailed,
    Installing,
    Installed,
    InstallFailed,
    Destroying,
    DestroyFailed,
    Destroyed,
}

impl ClusterState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterState::Planning => "planning",
            ClusterState::Planned => "planned",
            ClusterState::PlanningFailed => "planningFailed",
            ClusterState::Provisioning => "provisioning",
            ClusterState::Provisioned => "provisioned",
            ClusterState::ProvisionFailed => "provisionFailed",
            ClusterState::Installing => "installing",
            ClusterState::Installed => "installed",
            ClusterState::InstallFailed => "installFailed",
            ClusterState::Destroying => "destroying",
            ClusterState::DestroyFailed => "destroyFailed",
            ClusterState::Destroyed => "destroyed",
        }
    }

    pub fn parse(s: &str) -> Option<ClusterState> {
        let state = match s {
            "planning" => ClusterState::Planning,
            "planned" => ClusterState::Planned,
            "planningFailed" => ClusterState::PlanningFailed,
            "provisioning" => ClusterState::Provisioning,
            "provisioned" => ClusterState::Provisioned,
            "provisionFailed" => ClusterState::ProvisionFailed,
            "installing" => ClusterState::Installing,
            "installed" => ClusterState::Installed,
            "installFailed" => ClusterState::InstallFailed,
            "destroying" => ClusterState::Destroying,
            "destroyFailed" => ClusterState::DestroyFailed,
            "destroyed" => ClusterState::Destroyed,
            _ => return None,
        };
        Some(state)
    }
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cluster record: the user's declared configuration plus the observed
/// state. The spec is written by the HTTP API; the status is written by the
/// cluster's controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    pub spec: ClusterSpec,
    #[serde(default)]
    pub status: ClusterStatus,
}

/// The declarative desired configuration of a cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    pub desired_state: ClusterState,
    pub etcd_count: u32,
    pub master_count: u32,
    pub worker_count: u32,
    pub ingress_count: u32,
    pub provisioner: ProvisionerSpec,
}

/// The infrastructure provisioner to use for a cluster. Secrets are
/// persisted with the record but must never be exposed through the API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionerSpec {
    pub provider: String,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    #[serde(default)]
    pub secrets: BTreeMap<String, String>,
}

/// The observed state of a cluster, maintained by its controller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    #[serde(default)]
    pub current_state: Option<ClusterState>,
    #[serde(default)]
    pub waiting_for_manual_retry: bool,
    #[serde(default)]
    pub cluster_ip: Option<String>,
}

/// A decoded change event on the cluster bucket. A `None` cluster signals
/// that the record was deleted.
#[derive(Debug, Clone)]
pub struct ClusterWatchEvent {
    pub name: String,
    pub cluster: Option<Cluster>,
}

/// A typed view over the store fixed to a single bucket, so that clients
/// don't deal with bucket names or serialization.
#[derive(Clone)]
pub struct ClusterStore {
    store: Arc<KvStore>,
    bucket: String,
}

impl ClusterStore {
    pub fn new(store: Arc<KvStore>, bucket: &str) -> ClusterStore {
        ClusterStore {
            store,
            bucket: bucket.to_string(),
        }
    }

    pub fn get(&self, name: &str) -> Result<Option<Cluster>, StoreError> {
        match self.store.get(&self.bucket, name)? {
            None => Ok(None),
            Some(raw) if raw.is_empty() => Ok(None),
            Some(raw) => Ok(Some(serde_json::from_slice(&raw).map_err(StoreError::Decode)?)),
        }
    }

    pub async fn put(&self, name: &str, cluster: &Cluster) -> Result<(), StoreError> {
        let raw = serde_json::to_vec(cluster).map_err(StoreError::Encode)?;
        self.store.put(&self.bucket, name, &raw).await
    }

    pub fn get_all(&self) -> Result<BTreeMap<String, Cluster>, StoreError> {
        let mut clusters = BTreeMap::new();
        for entry in self.store.list(&self.bucket)? {
            let cluster = serde_json::from_slice(&entry.value).map_err(StoreError::Decode)?;
            clusters.insert(entry.key, cluster);
        }
        Ok(clusters)
    }

    pub async fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.store.delete(&self.bucket, name).await
    }

    /// Subscribe to decoded change events on the cluster bucket. Carries
    /// the drop-on-full semantics of [`KvStore::watch`].
    pub fn watch(&self, cancel: CancellationToken, buffer: usize) -> mpsc::Receiver<ClusterWatchEvent> {
        let raw = self.store.watch(cancel, &self.bucket, buffer);
        let (tx, rx) = mpsc::channel(buffer.max(1));
        tokio::spawn(decode_watch_events(raw, tx));
        rx
    }
}

async fn decode_watch_events(
    mut raw: mpsc::Receiver<WatchResponse>,
    tx: mpsc::Sender<ClusterWatchEvent>,
) {
    while let Some(event) = raw.recv().await {
        let cluster = match event.value {
            None => None,
            Some(value) if value.is_empty() => None,
            Some(value) => match serde_json::from_slice(&value) {
                Ok(cluster) => Some(cluster),
                Err(e) => {
                    warn!(key = %event.key, error = %e, "dropping watch event with undecodable cluster record");
                    continue;
                }
            },
        };
        let decoded = ClusterWatchEvent {
            name: event.key,
            cluster,
        };
        if tx.send(decoded).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_cluster(desired: ClusterState) -> Cluster {
        Cluster {
            spec: ClusterSpec {
                desired_state: desired,
                etcd_count: 1,
                master_count: 1,
                worker_count: 2,
                ingress_count: 0,
                provisioner: ProvisionerSpec {
                    provider: "aws".to_string(),
                    options: BTreeMap::from([("region".to_string(), "us-east-1".to_string())]),
                    secrets: BTreeMap::from([(
                        "AWS_ACCESS_KEY_ID".to_string(),
                        "AKIA123".to_string(),
                    )]),
                },
            },
            status: ClusterStatus::default(),
        }
    }

    fn cluster_store() -> (tempfile::TempDir, ClusterStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(KvStore::open(dir.path().join("store.db")).expect("open store"));
        store.create_bucket(CLUSTER_BUCKET).expect("create bucket");
        (dir, ClusterStore::new(store, CLUSTER_BUCKET))
    }

    #[tokio::test]
    async fn cluster_records_round_trip() {
        let (_dir, clusters) = cluster_store();
        let cluster = sample_cluster(ClusterState::Installed);

        clusters.put("c1", &cluster).await.unwrap();
        let got = clusters.get("c1").unwrap().expect("cluster present");
        assert_eq!(got, cluster);
        assert_eq!(clusters.get("missing").unwrap(), None);
    }

    #[tokio::test]
    async fn get_all_returns_every_record() {
        let (_dir, clusters) = cluster_store();
        clusters.put("a", &sample_cluster(ClusterState::Planned)).await.unwrap();
        clusters.put("b", &sample_cluster(ClusterState::Installed)).await.unwrap();

        let all = clusters.get_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["a"].spec.desired_state, ClusterState::Planned);
        assert_eq!(all["b"].spec.desired_state, ClusterState::Installed);
    }

    #[tokio::test]
    async fn watch_decodes_records_and_signals_deletion() {
        let (_dir, clusters) = cluster_store();
        let cancel = CancellationToken::new();
        let mut watch = clusters.watch(cancel.clone(), 10);

        let cluster = sample_cluster(ClusterState::Provisioned);
        clusters.put("c1", &cluster).await.unwrap();
        clusters.delete("c1").await.unwrap();

        let put = watch.recv().await.unwrap();
        assert_eq!(put.name, "c1");
        assert_eq!(put.cluster.as_ref().unwrap().spec, cluster.spec);

        let deleted = watch.recv().await.unwrap();
        assert_eq!(deleted.name, "c1");
        assert!(deleted.cluster.is_none());
        cancel.cancel();
    }

    #[test]
    fn states_serialize_with_camel_case_names() {
        assert_eq!(
            serde_json::to_string(&ClusterState::ProvisionFailed).unwrap(),
            "\"provisionFailed\""
        );
        assert_eq!(ClusterState::parse("installFailed"), Some(ClusterState::InstallFailed));
        assert_eq!(ClusterState::parse("bogus"), None);
        assert_eq!(ClusterState::Planning.to_string(), "planning");
    }
}
