use std::sync::RwLock;
use std::time::Duration;

use ahash::HashMap;
use tracing::info;

use crate::{Error, Result};

const LOOKUP_RETRIES: u32 = 20;
const LOOKUP_INTERVAL: Duration = Duration::from_millis(100);

/// The node's namespace -> VNID table, fed by the namespace watch. This
/// is a hot read path touched from several watches, so reads take the
/// lock only for the lookup itself, never across datapath calls.
#[derive(Default)]
pub struct VnidMap {
    map: RwLock<HashMap<String, u32>>,
}

impl VnidMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_vnid(&self, name: &str) -> Result<u32> {
        self.map
            .read()
            .unwrap()
            .get(name)
            .copied()
            .ok_or_else(|| Error::NotFound(format!("netid for namespace {name}")))
    }

    /// Namespace and service events race across watch streams; a service
    /// can arrive before its namespace's VNID has propagated from the
    /// master. Retry briefly before reporting a miss.
    pub async fn wait_and_get_vnid(&self, name: &str) -> Result<u32> {
        for _ in 0..LOOKUP_RETRIES {
            if let Ok(id) = self.get_vnid(name) {
                return Ok(id);
            }
            tokio::time::sleep(LOOKUP_INTERVAL).await;
        }
        Err(Error::NotFound(format!("netid for namespace {name}")))
    }

    pub fn set_vnid(&self, name: &str, id: u32) {
        self.map.write().unwrap().insert(name.to_owned(), id);
        info!("associate netid {id} to namespace {name:?}");
    }

    pub fn unset_vnid(&self, name: &str) -> Result<u32> {
        let id = self
            .map
            .write()
            .unwrap()
            .remove(name)
            .ok_or_else(|| Error::NotFound(format!("netid for namespace {name}")))?;
        info!("dissociate netid {id} from namespace {name:?}");
        Ok(id)
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_set_get_unset() {
        let vnids = VnidMap::new();
        assert!(vnids.get_vnid("web").is_err());

        vnids.set_vnid("web", 42);
        assert_eq!(vnids.get_vnid("web").unwrap(), 42);

        assert_eq!(vnids.unset_vnid("web").unwrap(), 42);
        assert!(vnids.get_vnid("web").is_err());
        assert!(vnids.unset_vnid("web").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_absorbs_propagation_delay() {
        let vnids = Arc::new(VnidMap::new());

        let writer = vnids.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            writer.set_vnid("late", 77);
        });

        assert_eq!(vnids.wait_and_get_vnid("late").await.unwrap(), 77);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_gives_up_after_retries() {
        let vnids = VnidMap::new();
        assert!(vnids.wait_and_get_vnid("never").await.is_err());
    }
}
