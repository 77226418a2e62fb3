use std::time::Duration;

use etcd_client::WatchOptions;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::types::*;
use super::{NAMESPACES_PREFIX, NODES_PREFIX, PODS_PREFIX, Registry, SERVICES_PREFIX, SUBNETS_PREFIX};

const EVENT_CHANNEL_SIZE: usize = 1000;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

impl Registry {
    /// Node registrations and removals, in revision order.
    pub fn watch_nodes(&self, cancel: CancellationToken) -> mpsc::Receiver<NodeEvent> {
        self.spawn_watch(&[NODES_PREFIX], cancel, |event_type, key, value| {
            Some(NodeEvent {
                event_type,
                node: key.to_owned(),
                ip: String::from_utf8_lossy(value).into_owned(),
            })
        })
    }

    pub fn watch_subnets(&self, cancel: CancellationToken) -> mpsc::Receiver<SubnetEvent> {
        self.spawn_watch(&[SUBNETS_PREFIX], cancel, |event_type, key, value| {
            match serde_json::from_slice(value) {
                Ok(subnet) => Some(SubnetEvent {
                    event_type,
                    node: key.to_owned(),
                    subnet,
                }),
                Err(e) => {
                    warn!(%e, "failed to decode subnet event for {key}");
                    None
                }
            }
        })
    }

    pub fn watch_namespaces(&self, cancel: CancellationToken) -> mpsc::Receiver<NamespaceEvent> {
        self.spawn_watch(&[NAMESPACES_PREFIX], cancel, |event_type, key, value| {
            match serde_json::from_slice(value) {
                Ok(namespace) => Some(NamespaceEvent { event_type, namespace }),
                Err(e) => {
                    warn!(%e, "failed to decode namespace event for {key}");
                    None
                }
            }
        })
    }

    pub fn watch_services(&self, cancel: CancellationToken) -> mpsc::Receiver<ServiceEvent> {
        self.spawn_watch(&[SERVICES_PREFIX], cancel, |event_type, key, value| {
            match serde_json::from_slice(value) {
                Ok(service) => Some(ServiceEvent { event_type, service }),
                Err(e) => {
                    warn!(%e, "failed to decode service event for {key}");
                    None
                }
            }
        })
    }

    /// Pods scheduled to one node.
    pub fn watch_pods(&self, node: &str, cancel: CancellationToken) -> mpsc::Receiver<PodEvent> {
        self.spawn_watch(&[PODS_PREFIX, node], cancel, |event_type, key, value| {
            match serde_json::from_slice(value) {
                Ok(pod) => Some(PodEvent { event_type, pod }),
                Err(e) => {
                    warn!(%e, "failed to decode pod event for {key}");
                    None
                }
            }
        })
    }

    /// Runs a restartable prefix watch, delivering decoded events over a
    /// bounded channel. The loop remembers the last observed revision; on
    /// a transient error or stream end it sleeps, rebuilds the client
    /// transport, and resumes from revision+1, so handlers see every event
    /// at least once.
    fn spawn_watch<T, F>(
        &self,
        key_parts: &[&str],
        cancel: CancellationToken,
        decode: F,
    ) -> mpsc::Receiver<T>
    where
        T: Send + 'static,
        F: Fn(EventType, &str, &[u8]) -> Option<T> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let mut parts = key_parts.to_vec();
        parts.push("");
        let prefix = self.key_for(&parts);
        let conn = self.connection();

        tokio::spawn(async move {
            let mut revision: i64 = 0;
            loop {
                if cancel.is_cancelled() {
                    return;
                }

                let mut options = WatchOptions::new().with_prefix().with_prev_key();
                if revision > 0 {
                    options = options.with_start_revision(revision + 1);
                }
                let mut client = conn.client();
                let stream = match client.watch(prefix.as_str(), Some(options)).await {
                    Ok((watcher, stream)) => Some((watcher, stream)),
                    Err(e) => {
                        warn!(%e, "failed to start watch on {prefix}");
                        None
                    }
                };

                if let Some((_watcher, mut stream)) = stream {
                    debug!("watching {prefix} from revision {}", revision + 1);
                    loop {
                        let message = tokio::select! {
                            _ = cancel.cancelled() => return,
                            message = stream.message() => message,
                        };
                        let resp = match message {
                            Ok(Some(resp)) => resp,
                            Ok(None) => {
                                warn!("watch stream on {prefix} ended");
                                break;
                            }
                            Err(e) => {
                                warn!(%e, "transient error watching {prefix}");
                                break;
                            }
                        };
                        for event in resp.events() {
                            let Some(kv) = event.kv() else {
                                continue;
                            };
                            revision = revision.max(kv.mod_revision());
                            let Ok(key) = kv.key_str() else {
                                continue;
                            };
                            let key = key.strip_prefix(prefix.as_str()).unwrap_or(key);

                            let (event_type, value) = match event.event_type() {
                                etcd_client::EventType::Put => {
                                    let event_type = if kv.version() == 1 {
                                        EventType::Added
                                    } else {
                                        EventType::Modified
                                    };
                                    (event_type, kv.value())
                                }
                                etcd_client::EventType::Delete => {
                                    let Some(prev) = event.prev_kv() else {
                                        warn!("delete event for {key} carried no previous value");
                                        continue;
                                    };
                                    (EventType::Deleted, prev.value())
                                }
                            };

                            if let Some(decoded) = decode(event_type, key, value)
                                && tx.send(decoded).await.is_err()
                            {
                                // receiver dropped, watch no longer needed
                                return;
                            }
                        }
                    }
                }

                // Stale transports linger after an empty body or timeout;
                // rebuild the client before resuming.
                sleep(RECONNECT_DELAY).await;
                if let Err(e) = conn.reset().await {
                    warn!(%e, "failed to reset registry client for {prefix}");
                }
            }
        });

        rx
    }
}
