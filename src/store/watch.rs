use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A single change notification delivered to a bucket watcher.
///
/// A `None` value signals that the key was deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchResponse {
    pub key: String,
    pub value: Option<Vec<u8>>,
}

/// Messages understood by the watch manager. The manager reacts to three
/// events: a new watch issued on a bucket, a write performed on a bucket,
/// and a watch canceled by the client.
pub(super) enum WatchMsg {
    Register {
        bucket: String,
        sender: mpsc::Sender<WatchResponse>,
        cancel: CancellationToken,
    },
    Write {
        bucket: String,
        key: String,
        value: Option<Vec<u8>>,
    },
    Canceled {
        bucket: String,
        watcher_id: u64,
    },
}

/// The watch manager keeps track of all the watches set on the store.
///
/// It is the sole owner of the watcher map; every interaction goes through
/// its mailbox, so no locking is needed and there is at most one consumer
/// of the map.
pub(super) struct WatchManager {
    mailbox: mpsc::UnboundedReceiver<WatchMsg>,
    feedback: mpsc::UnboundedSender<WatchMsg>,
    shutdown: CancellationToken,
    watchers: HashMap<String, HashMap<u64, mpsc::Sender<WatchResponse>>>,
    next_watcher_id: u64,
}

impl WatchManager {
    /// Start the manager task and return the sender used to post messages
    /// to its mailbox.
    pub(super) fn spawn(shutdown: CancellationToken) -> mpsc::UnboundedSender<WatchMsg> {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = WatchManager {
            mailbox: rx,
            feedback: tx.clone(),
            shutdown,
            watchers: HashMap::new(),
            next_watcher_id: 0,
        };
        tokio::spawn(manager.run());
        tx
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                msg = self.mailbox.recv() => match msg {
                    Some(msg) => self.handle(msg),
                    None => return,
                },
                _ = self.shutdown.cancelled() => {
                    // Dropping the registered senders closes every
                    // subscriber stream after in-flight events drain.
                    return;
                }
            }
        }
    }

    fn handle(&mut self, msg: WatchMsg) {
        match msg {
            WatchMsg::Register { bucket, sender, cancel } => {
                let id = self.next_watcher_id;
                self.next_watcher_id += 1;
                self.watchers.entry(bucket.clone()).or_default().insert(id, sender);

                // Detect watch cancellation without touching the map from
                // another task.
                let feedback = self.feedback.clone();
                let shutdown = self.shutdown.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            let _ = feedback.send(WatchMsg::Canceled { bucket, watcher_id: id });
                        }
                        _ = shutdown.cancelled() => {}
                    }
                });
            }
            WatchMsg::Canceled { bucket, watcher_id } => {
                if let Some(bucket_watchers) = self.watchers.get_mut(&bucket) {
                    // Dropping the sender closes the subscriber's stream.
                    bucket_watchers.remove(&watcher_id);
                }
            }
            WatchMsg::Write { bucket, key, value } => {
                let Some(bucket_watchers) = self.watchers.get(&bucket) else {
                    debug!(bucket = %bucket, "no watchers registered for bucket");
                    return;
                };
                for sender in bucket_watchers.values() {
                    let response = WatchResponse {
                        key: key.clone(),
                        value: value.clone(),
                    };
                    match sender.try_send(response) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            warn!(bucket = %bucket, key = %key, "watcher buffer is full, dropping notification");
                        }
                        // The receiver is gone but cancellation has not
                        // been observed yet; it will be reaped shortly.
                        Err(mpsc::error::TrySendError::Closed(_)) => {}
                    }
                }
            }
        }
    }
}
