use std::collections::HashSet;
use std::sync::Arc;

use tracing::{error, info};

use podnet_netid::{self as netid, Allocator, GLOBAL_VNID, REQUESTED_VNID_ANNOTATION};

use crate::registry::{EventType, Namespace, NamespaceEvent};
use crate::{Error, Result};

use super::{NamespaceStore, retry_on_conflict};

/// Assigns a VNID to each namespace. An operator can pin a namespace to
/// an id another namespace already holds by writing the requested-VNID
/// annotation; the controller consumes the hint and clears it.
pub struct VnidController<S> {
    allocator: Arc<Allocator>,
    store: S,
    /// Namespaces assigned the global VNID, reachable from every tenant.
    global_namespaces: HashSet<String>,
}

impl<S: NamespaceStore> VnidController<S> {
    pub fn new(allocator: Arc<Allocator>, store: S, global_namespaces: Vec<String>) -> Self {
        Self {
            allocator,
            store,
            global_namespaces: global_namespaces.into_iter().collect(),
        }
    }

    pub async fn handle_event(&self, event: &NamespaceEvent) {
        let result = match event.event_type {
            EventType::Added | EventType::Modified => self.add_or_update(&event.namespace).await,
            EventType::Deleted => self.delete(&event.namespace).await,
        };
        if let Err(e) = result {
            error!(
                %e,
                "failed to apply netid allocation for {} event on namespace {}",
                event.event_type, event.namespace.name
            );
        }
    }

    /// Allocates or adopts a VNID for the namespace and persists it. A
    /// freshly allocated id is released again unless the write lands.
    pub async fn add_or_update(&self, namespace: &Namespace) -> Result<()> {
        let requested = match namespace.annotations.get(REQUESTED_VNID_ANNOTATION) {
            Some(value) => Some(value.parse::<u32>().map_err(|_| {
                Error::Other(format!("malformed requested netid {value:?}"))
            })?),
            None => None,
        };

        let name = &namespace.name;
        let (id, user_requested) = match requested {
            Some(id) => {
                // only the global VNID or ids some namespace already
                // holds may be requested
                if id != GLOBAL_VNID && !self.allocator.has(id) {
                    return Err(Error::RequestedVnidNotAllocated(id));
                }
                (id, true)
            }
            None => {
                if netid::get_vnid(&namespace.annotations).is_ok() {
                    // already assigned and no new request, nothing to do
                    return Ok(());
                }
                if self.global_namespaces.contains(name.as_str()) {
                    (GLOBAL_VNID, false)
                } else {
                    (self.allocator.allocate_next()?, false)
                }
            }
        };
        let owns_allocation = !user_requested && id != GLOBAL_VNID;

        let persisted = retry_on_conflict(|| self.persist(name, id)).await;
        match persisted {
            Ok(true) => {
                if user_requested {
                    info!("updated netid {id} for namespace {name:?}");
                } else {
                    info!("assigned netid {id} for namespace {name:?}");
                }
                Ok(())
            }
            Ok(false) => {
                // namespace disappeared under us
                if owns_allocation {
                    self.allocator.release(id);
                }
                Ok(())
            }
            Err(e) => {
                if owns_allocation {
                    self.allocator.release(id);
                }
                Err(e)
            }
        }
    }

    /// One optimistic write attempt: re-reads the namespace, sets the
    /// assigned id, clears any request. `false` when the namespace no
    /// longer exists.
    async fn persist(&self, name: &str, id: u32) -> Result<bool> {
        let (mut namespace, revision) = match self.store.get_namespace(name).await {
            Ok(found) => found,
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e),
        };
        netid::set_vnid(&mut namespace.annotations, id)?;
        netid::delete_requested_vnid(&mut namespace.annotations);
        self.store.update_namespace(&namespace, revision).await?;
        Ok(true)
    }

    /// Releases the namespace's VNID unless it is global or another
    /// namespace still carries it.
    pub async fn delete(&self, namespace: &Namespace) -> Result<()> {
        let Ok(id) = netid::get_vnid(&namespace.annotations) else {
            return Ok(());
        };
        if id == GLOBAL_VNID {
            return Ok(());
        }

        let name = &namespace.name;
        let all = self.store.list_namespaces().await?;
        for other in &all {
            if other.name == *name {
                continue;
            }
            if netid::get_vnid(&other.annotations) == Ok(id) {
                info!(
                    "ignored releasing netid {id} for namespace {name:?} (still in use by {:?})",
                    other.name
                );
                return Ok(());
            }
        }

        self.allocator.release(id);
        info!("released netid {id} for namespace {name:?}");
        Ok(())
    }
}
