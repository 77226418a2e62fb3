//! Cluster master: assigns a subnet to every node and, under the
//! multi-tenant plugin, a VNID to every namespace.

pub mod repair;
pub mod subnets;
pub mod vnids;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use podnet_netid::{Allocator, VnidRange};

use crate::config::MasterArgs;
use crate::registry::{Namespace, NetworkConfig, RangeAllocation, Registry, Subnet};
use crate::{Error, Result};

pub use repair::Repair;
pub use subnets::SubnetController;
pub use vnids::VnidController;

const STARTUP_ALIVE_TIMEOUT_SECONDS: u64 = 60;
const CONFLICT_RETRIES: u32 = 5;

/// Registry surface the subnet controller needs.
#[async_trait]
pub trait SubnetStore: Send + Sync {
    async fn get_nodes(&self) -> Result<Vec<(String, String)>>;
    async fn get_subnets(&self) -> Result<Vec<(String, Subnet)>>;
    async fn get_subnet(&self, node: &str) -> Result<Subnet>;
    async fn create_subnet(&self, node: &str, subnet: &Subnet) -> Result<()>;
    async fn delete_subnet(&self, node: &str) -> Result<()>;
}

/// Registry surface the VNID controller and repair loop need.
#[async_trait]
pub trait NamespaceStore: Send + Sync {
    async fn list_namespaces(&self) -> Result<Vec<Namespace>>;
    async fn get_namespace(&self, name: &str) -> Result<(Namespace, i64)>;
    async fn update_namespace(&self, namespace: &Namespace, revision: i64) -> Result<()>;
}

#[async_trait]
pub trait RangeStore: Send + Sync {
    async fn get_range_allocation(&self) -> Result<(RangeAllocation, i64)>;
    async fn create_or_update_range_allocation(
        &self,
        allocation: &RangeAllocation,
        revision: i64,
    ) -> Result<()>;
}

#[async_trait]
impl SubnetStore for Registry {
    async fn get_nodes(&self) -> Result<Vec<(String, String)>> {
        Registry::get_nodes(self).await
    }
    async fn get_subnets(&self) -> Result<Vec<(String, Subnet)>> {
        Registry::get_subnets(self).await
    }
    async fn get_subnet(&self, node: &str) -> Result<Subnet> {
        Registry::get_subnet(self, node).await
    }
    async fn create_subnet(&self, node: &str, subnet: &Subnet) -> Result<()> {
        Registry::create_subnet(self, node, subnet).await
    }
    async fn delete_subnet(&self, node: &str) -> Result<()> {
        Registry::delete_subnet(self, node).await
    }
}

#[async_trait]
impl NamespaceStore for Registry {
    async fn list_namespaces(&self) -> Result<Vec<Namespace>> {
        Registry::list_namespaces(self).await
    }
    async fn get_namespace(&self, name: &str) -> Result<(Namespace, i64)> {
        Registry::get_namespace(self, name).await
    }
    async fn update_namespace(&self, namespace: &Namespace, revision: i64) -> Result<()> {
        Registry::update_namespace(self, namespace, revision).await
    }
}

#[async_trait]
impl RangeStore for Registry {
    async fn get_range_allocation(&self) -> Result<(RangeAllocation, i64)> {
        Registry::get_range_allocation(self).await
    }
    async fn create_or_update_range_allocation(
        &self,
        allocation: &RangeAllocation,
        revision: i64,
    ) -> Result<()> {
        Registry::create_or_update_range_allocation(self, allocation, revision).await
    }
}

/// Runs `f` until it stops failing with `Conflict`, with doubling
/// backoff, up to `CONFLICT_RETRIES` attempts.
pub(crate) async fn retry_on_conflict<T, F, Fut>(mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = Duration::from_millis(10);
    let mut last = None;
    for _ in 0..CONFLICT_RETRIES {
        match f().await {
            Err(e) if e.is_conflict() => {
                last = Some(e);
                sleep(backoff).await;
                backoff *= 2;
            }
            other => return other,
        }
    }
    Err(last.expect("loop ran at least once"))
}

pub async fn run(args: MasterArgs, cancel: CancellationToken) -> Result<()> {
    let registry = Registry::connect(
        args.registry.etcd_endpoints.clone(),
        args.registry.etcd_prefix.clone(),
    )
    .await?;

    if !registry.check_alive(STARTUP_ALIVE_TIMEOUT_SECONDS).await {
        return Err(Error::Other("registry did not come up in time".into()));
    }
    registry.init_nodes().await?;
    registry.init_subnets().await?;

    let config = match registry.get_network_config().await {
        Ok(config) => config,
        Err(e) if e.is_not_found() => {
            info!(
                "writing cluster network config: {} with {} host bits",
                args.network, args.host_bits
            );
            registry
                .write_network_config(&args.network, args.host_bits)
                .await?;
            NetworkConfig {
                network: args.network.clone(),
                host_bits: args.host_bits,
            }
        }
        Err(e) => return Err(e),
    };

    let controller = SubnetController::new(registry.clone(), &config).await?;
    controller.reconcile().await?;

    if args.plugin.multitenant() {
        start_vnid_master(
            registry.clone(),
            args.global_namespaces.clone(),
            Duration::from_secs(args.repair_interval_minutes * 60),
            cancel.clone(),
        )
        .await?;
    }

    info!("master started, watching nodes");
    let mut node_events = registry.watch_nodes(cancel.child_token());
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            event = node_events.recv() => match event {
                Some(event) => controller.handle_node_event(&event).await,
                None => return Err(Error::Other("node watch ended".into())),
            }
        }
    }
}

/// Brings up VNID assignment: one repair pass before anything else, the
/// allocator seeded from the repaired snapshot, then the controller and
/// the periodic repair task.
async fn start_vnid_master(
    registry: Registry,
    global_namespaces: Vec<String>,
    repair_interval: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let range = VnidRange::full();

    let repair = Repair::new(registry.clone(), range);
    repair.run_once().await.map_err(|e| {
        Error::Other(format!("unable to initialize netid allocations: {e}"))
    })?;

    let allocator = Arc::new(Allocator::new(range));
    let (record, _) = registry.get_range_allocation().await?;
    repair::restore_allocator(&allocator, &record)?;
    info!("netid allocator ready, {} ids free", allocator.free());

    let repair_cancel = cancel.child_token();
    tokio::spawn(async move { repair.run_until(repair_interval, repair_cancel).await });

    let controller = VnidController::new(allocator, registry.clone(), global_namespaces);
    let mut namespace_events = registry.watch_namespaces(cancel.child_token());
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = namespace_events.recv() => match event {
                    Some(event) => controller.handle_event(&event).await,
                    None => {
                        error!("namespace watch ended");
                        return;
                    }
                }
            }
        }
    });

    Ok(())
}

pub(crate) fn encode_bitmap(data: &[u8]) -> String {
    BASE64.encode(data)
}

pub(crate) fn decode_bitmap(data: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(data)
        .map_err(|e| Error::Other(format!("corrupt netid snapshot: {e}")))
}
