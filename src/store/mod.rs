use std::path::Path;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod cluster;
mod watch;

pub use cluster::{
    Cluster, ClusterSpec, ClusterState, ClusterStatus, ClusterStore, ClusterWatchEvent,
    ProvisionerSpec, CLUSTER_BUCKET,
};
pub use watch::WatchResponse;

use watch::{WatchManager, WatchMsg};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage engine error: {0}")]
    Engine(#[from] sled::Error),

    #[error("bucket {0:?} does not exist")]
    NoSuchBucket(String),

    #[error("key cannot be empty")]
    EmptyKey,

    #[error("error decoding stored record: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("error encoding record for storage: {0}")]
    Encode(#[source] serde_json::Error),
}

/// A key-value pair as returned by [`KvStore::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: String,
    pub value: Vec<u8>,
}

/// Durable, bucketed key-value store with change notifications.
///
/// Writes commit (and flush) to disk before watchers are notified, so a
/// notification always refers to durable state. A single watch-manager task
/// owns the watcher registrations; `Put`/`Delete` post a message to it after
/// the write lands.
pub struct KvStore {
    db: sled::Db,
    notifier: mpsc::UnboundedSender<WatchMsg>,
    shutdown: CancellationToken,
}

impl KvStore {
    /// Open (or create) the store at the given path and start its watch
    /// manager.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        let shutdown = CancellationToken::new();
        let notifier = WatchManager::spawn(shutdown.clone());
        Ok(KvStore {
            db,
            notifier,
            shutdown,
        })
    }

    /// Stop the watch-manager task, closing every subscriber stream. File
    /// handles are released when the store is dropped.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Create a bucket. Creating a bucket that already exists is a no-op.
    pub fn create_bucket(&self, name: &str) -> Result<(), StoreError> {
        self.db.open_tree(name)?;
        Ok(())
    }

    /// Delete a bucket and all its keys. Deleting a missing bucket is a
    /// no-op.
    pub fn delete_bucket(&self, name: &str) -> Result<(), StoreError> {
        self.db.drop_tree(name)?;
        Ok(())
    }

    /// Write a key into a bucket. The bucket must exist and the key must be
    /// non-empty. Watchers of the bucket are notified once the write is
    /// durable.
    pub async fn put(&self, bucket: &str, key: &str, value: &[u8]) -> Result<(), StoreError> {
        if key.is_empty() {
            return Err(StoreError::EmptyKey);
        }
        let tree = self.bucket(bucket)?;
        tree.insert(key, value)?;
        tree.flush_async().await?;
        self.notify(bucket, key, Some(value.to_vec()));
        Ok(())
    }

    /// Read a key from a bucket. Returns `None` when the key is absent.
    pub fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let tree = self.bucket(bucket)?;
        Ok(tree.get(key)?.map(|v| v.to_vec()))
    }

    /// List all entries in a bucket in key order.
    pub fn list(&self, bucket: &str) -> Result<Vec<Entry>, StoreError> {
        let tree = self.bucket(bucket)?;
        let mut entries = Vec::new();
        for item in tree.iter() {
            let (key, value) = item?;
            entries.push(Entry {
                key: String::from_utf8_lossy(&key).into_owned(),
                value: value.to_vec(),
            });
        }
        Ok(entries)
    }

    /// Delete a key from a bucket. Watchers receive the key with an empty
    /// value once the deletion is durable.
    pub async fn delete(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        if key.is_empty() {
            return Err(StoreError::EmptyKey);
        }
        let tree = self.bucket(bucket)?;
        tree.remove(key)?;
        tree.flush_async().await?;
        self.notify(bucket, key, None);
        Ok(())
    }

    /// Subscribe to change notifications on a bucket.
    ///
    /// Events arrive in per-bucket write order. Delivery is non-blocking:
    /// when the subscriber's buffer (of at least one event) is full, events
    /// are dropped and a log line is emitted; subscribers recover through a
    /// periodic full resync. Cancelling the token closes the stream after
    /// any in-flight event is delivered.
    pub fn watch(
        &self,
        cancel: CancellationToken,
        bucket: &str,
        buffer: usize,
    ) -> mpsc::Receiver<WatchResponse> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let _ = self.notifier.send(WatchMsg::Register {
            bucket: bucket.to_string(),
            sender: tx,
            cancel,
        });
        rx
    }

    fn bucket(&self, name: &str) -> Result<sled::Tree, StoreError> {
        if !self.db.tree_names().iter().any(|n| n.as_ref() == name.as_bytes()) {
            return Err(StoreError::NoSuchBucket(name.to_string()));
        }
        Ok(self.db.open_tree(name)?)
    }

    fn notify(&self, bucket: &str, key: &str, value: Option<Vec<u8>>) {
        // The manager is only gone once the store has been closed.
        let _ = self.notifier.send(WatchMsg::Write {
            bucket: bucket.to_string(),
            key: key.to_string(),
            value,
        });
    }
}

impl Drop for KvStore {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
