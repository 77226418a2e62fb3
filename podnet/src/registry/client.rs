use std::sync::RwLock;
use std::time::Duration;

use etcd_client::Client;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::{Error, Result};

/// Holds the etcd connection and rebuilds it when the transport goes
/// stale. Watch loops reset the client after an error before resuming.
pub struct Connection {
    endpoints: Vec<String>,
    client: RwLock<Client>,
}

impl Connection {
    pub async fn connect(endpoints: Vec<String>) -> Result<Self> {
        let client = Client::connect(&endpoints, None).await?;
        Ok(Self {
            endpoints,
            client: RwLock::new(client),
        })
    }

    pub fn client(&self) -> Client {
        self.client.read().unwrap().clone()
    }

    /// Replaces the underlying client, retrying with doubling backoff
    /// until a connection is established or the attempts run out.
    pub async fn reset(&self) -> Result<()> {
        let mut backoff = Duration::from_millis(500);
        for _ in 0..5 {
            match Client::connect(&self.endpoints, None).await {
                Ok(client) => {
                    *self.client.write().unwrap() = client;
                    return Ok(());
                }
                Err(e) => {
                    warn!(%e, "failed to reconnect to registry, backing off");
                    sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
        Err(Error::Other(format!(
            "unable to reconnect to registry at {}",
            self.endpoints.join(", ")
        )))
    }

    /// Synchronous liveness probe used at master startup: polls the
    /// cluster status every 5s until it answers or the deadline passes.
    pub async fn check_alive(&self, timeout_seconds: u64) -> bool {
        let mut remaining = timeout_seconds as i64;
        loop {
            let mut client = self.client();
            match client.status().await {
                Ok(status) => {
                    info!(version = status.version(), "registry is alive");
                    return true;
                }
                Err(e) => warn!(%e, "registry status probe failed"),
            }
            if remaining <= 0 {
                return false;
            }
            sleep(Duration::from_secs(5)).await;
            remaining -= 5;
        }
    }
}
