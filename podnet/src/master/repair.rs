use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use podnet_netid::{self as netid, Allocator, Error as NetIdError, GLOBAL_VNID, VnidRange};

use crate::{Error, Result};

use super::{NamespaceStore, RangeStore, decode_bitmap, encode_bitmap, retry_on_conflict};

/// Periodically rebuilds the persisted VNID allocation from the
/// namespaces that actually exist: leaked ids fall out of the snapshot,
/// duplicates and out-of-range ids get flagged. Runs once before the
/// controller starts so a restarted master cannot re-hand-out a live id.
pub struct Repair<S> {
    store: S,
    range: VnidRange,
}

impl<S: NamespaceStore + RangeStore> Repair<S> {
    pub fn new(store: S, range: VnidRange) -> Self {
        Self { store, range }
    }

    pub async fn run_until(&self, interval: Duration, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(interval) => {}
            }
            if let Err(e) = self.run_once().await {
                error!(%e, "netid repair pass failed");
            }
        }
    }

    pub async fn run_once(&self) -> Result<()> {
        retry_on_conflict(|| self.run_once_inner()).await
    }

    async fn run_once_inner(&self) -> Result<()> {
        let (_, revision) = self.store.get_range_allocation().await?;

        let namespaces = self.store.list_namespaces().await?;

        let mut id_counts = ahash::HashMap::default();
        for namespace in &namespaces {
            if let Ok(id) = netid::get_vnid(&namespace.annotations) {
                *id_counts.entry(id).or_insert(0u32) += 1;
            }
        }

        let rebuilt = Allocator::new(self.range);
        for namespace in &namespaces {
            let Ok(id) = netid::get_vnid(&namespace.annotations) else {
                continue;
            };
            // the global VNID is not part of the allocation
            if id == GLOBAL_VNID {
                continue;
            }

            match rebuilt.allocate(id) {
                Ok(()) => {}
                Err(NetIdError::Allocated) => {
                    if id_counts.get(&id) == Some(&1) {
                        warn!(
                            "unexpected netid {id} allocated error for namespace {:?}",
                            namespace.name
                        );
                    }
                    // several namespaces sharing one id is a join, not a
                    // leak; one bit covers them all
                }
                Err(NetIdError::NotInRange) => {
                    warn!(
                        "netid {id} for namespace {:?} is not within the range {}; \
                         please recreate the namespace",
                        namespace.name, self.range
                    );
                }
                Err(NetIdError::Full) => {
                    return Err(Error::Other(format!(
                        "the netid range {} is full; widen the range to accommodate \
                         new namespaces",
                        self.range
                    )));
                }
                Err(e) => {
                    return Err(Error::Other(format!(
                        "unable to allocate netid {id} for namespace {:?}: {e}",
                        namespace.name
                    )));
                }
            }
        }

        let (range, data) = rebuilt.snapshot();
        let allocation = crate::registry::RangeAllocation {
            range,
            data: encode_bitmap(&data),
        };
        self.store
            .create_or_update_range_allocation(&allocation, revision)
            .await?;
        info!("netid repair pass complete, {} ids free", rebuilt.free());
        Ok(())
    }
}

/// Restores an allocator from a persisted snapshot record.
pub fn restore_allocator(
    allocator: &Allocator,
    record: &crate::registry::RangeAllocation,
) -> Result<()> {
    if record.range.is_empty() {
        return Ok(());
    }
    let data = decode_bitmap(&record.data)?;
    allocator.restore(&record.range, &data)?;
    Ok(())
}
