//! Typed façade over the coordination store. All cross-node state lives
//! here; masters and nodes hold only derived caches.

pub mod client;
pub mod types;
mod watch;

use std::sync::Arc;

use etcd_client::{Compare, CompareOp, GetOptions, Txn, TxnOp};
use tracing::warn;

pub use client::Connection;
pub use types::*;

use crate::{Error, Result};

pub const NODES_PREFIX: &str = "nodes";
pub const SUBNETS_PREFIX: &str = "subnets";
pub const NAMESPACES_PREFIX: &str = "namespaces";
pub const SERVICES_PREFIX: &str = "services";
pub const PODS_PREFIX: &str = "pods";
pub const CONFIG_NETWORK_KEY: &str = "config/ContainerNetwork";
pub const CONFIG_SUBNET_LENGTH_KEY: &str = "config/SubnetLength";
pub const RANGES_VNID_KEY: &str = "ranges/namespacevnids";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkConfig {
    pub network: String,
    pub host_bits: u32,
}

#[derive(Clone)]
pub struct Registry {
    conn: Arc<Connection>,
    prefix: String,
}

impl Registry {
    pub async fn connect(endpoints: Vec<String>, prefix: impl Into<String>) -> Result<Self> {
        let conn = Connection::connect(endpoints).await?;
        Ok(Self {
            conn: Arc::new(conn),
            prefix: prefix.into(),
        })
    }

    pub async fn check_alive(&self, timeout_seconds: u64) -> bool {
        self.conn.check_alive(timeout_seconds).await
    }

    fn key(&self, parts: &[&str]) -> String {
        let mut key = self.prefix.trim_end_matches('/').to_owned();
        for part in parts {
            key.push('/');
            key.push_str(part);
        }
        key
    }

    pub(crate) fn key_for(&self, parts: &[&str]) -> String {
        self.key(parts)
    }

    pub(crate) fn connection(&self) -> Arc<Connection> {
        self.conn.clone()
    }

    /// The v3 keyspace is flat, so directory init reduces to a probe that
    /// the prefix is reachable.
    pub async fn init_nodes(&self) -> Result<()> {
        let mut client = self.conn.client();
        client
            .get(self.key(&[NODES_PREFIX]), Some(GetOptions::new().with_prefix().with_count_only()))
            .await?;
        Ok(())
    }

    pub async fn init_subnets(&self) -> Result<()> {
        let mut client = self.conn.client();
        client
            .get(self.key(&[SUBNETS_PREFIX]), Some(GetOptions::new().with_prefix().with_count_only()))
            .await?;
        Ok(())
    }

    /// Writes both cluster-config keys in one transaction so a reader
    /// never observes only one of them.
    pub async fn write_network_config(&self, network: &str, host_bits: u32) -> Result<()> {
        let mut client = self.conn.client();
        let txn = Txn::new().and_then(vec![
            TxnOp::put(self.key(&[CONFIG_NETWORK_KEY]), network, None),
            TxnOp::put(self.key(&[CONFIG_SUBNET_LENGTH_KEY]), host_bits.to_string(), None),
        ]);
        client.txn(txn).await?;
        Ok(())
    }

    pub async fn get_network_config(&self) -> Result<NetworkConfig> {
        let mut client = self.conn.client();
        let network = {
            let resp = client.get(self.key(&[CONFIG_NETWORK_KEY]), None).await?;
            match resp.kvs().first() {
                Some(kv) => kv.value_str()?.to_owned(),
                None => return Err(Error::NotFound(CONFIG_NETWORK_KEY.into())),
            }
        };
        let resp = client.get(self.key(&[CONFIG_SUBNET_LENGTH_KEY]), None).await?;
        let host_bits = match resp.kvs().first() {
            Some(kv) => kv
                .value_str()?
                .parse()
                .map_err(|_| Error::Other("malformed SubnetLength config".into()))?,
            None => return Err(Error::NotFound(CONFIG_SUBNET_LENGTH_KEY.into())),
        };
        Ok(NetworkConfig { network, host_bits })
    }

    /// Registers a node; an existing registration wins (create-if-absent).
    pub async fn create_node(&self, node: &str, ip: &str) -> Result<()> {
        let key = self.key(&[NODES_PREFIX, node]);
        let mut client = self.conn.client();
        let txn = Txn::new()
            .when(vec![Compare::create_revision(key.clone(), CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(key, ip, None)]);
        client.txn(txn).await?;
        Ok(())
    }

    pub async fn get_nodes(&self) -> Result<Vec<(String, String)>> {
        let prefix = self.key(&[NODES_PREFIX]) + "/";
        let mut client = self.conn.client();
        let resp = client
            .get(prefix.clone(), Some(GetOptions::new().with_prefix()))
            .await?;
        let mut nodes = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            let key = kv.key_str()?;
            let name = key.strip_prefix(&prefix).unwrap_or(key).to_owned();
            nodes.push((name, kv.value_str()?.to_owned()));
        }
        Ok(nodes)
    }

    /// All subnet leases, as `(node name, record)` pairs.
    pub async fn get_subnets(&self) -> Result<Vec<(String, Subnet)>> {
        let prefix = self.key(&[SUBNETS_PREFIX]) + "/";
        let mut client = self.conn.client();
        let resp = client
            .get(prefix.clone(), Some(GetOptions::new().with_prefix()))
            .await?;
        let mut subnets = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            let key = kv.key_str()?;
            let node = key.strip_prefix(&prefix).unwrap_or(key).to_owned();
            match serde_json::from_slice::<Subnet>(kv.value()) {
                Ok(sub) => subnets.push((node, sub)),
                Err(e) => warn!(%e, "skipping malformed subnet record {key:?}"),
            }
        }
        Ok(subnets)
    }

    pub async fn get_subnet(&self, node: &str) -> Result<Subnet> {
        let mut client = self.conn.client();
        let resp = client.get(self.key(&[SUBNETS_PREFIX, node]), None).await?;
        match resp.kvs().first() {
            Some(kv) => Ok(serde_json::from_slice(kv.value())?),
            None => Err(Error::NotFound(format!("subnet for node {node}"))),
        }
    }

    pub async fn create_subnet(&self, node: &str, subnet: &Subnet) -> Result<()> {
        let mut client = self.conn.client();
        client
            .put(self.key(&[SUBNETS_PREFIX, node]), serde_json::to_vec(subnet)?, None)
            .await?;
        Ok(())
    }

    pub async fn delete_subnet(&self, node: &str) -> Result<()> {
        let mut client = self.conn.client();
        let resp = client.delete(self.key(&[SUBNETS_PREFIX, node]), None).await?;
        if resp.deleted() == 0 {
            return Err(Error::NotFound(format!("subnet for node {node}")));
        }
        Ok(())
    }

    pub async fn list_namespaces(&self) -> Result<Vec<Namespace>> {
        let prefix = self.key(&[NAMESPACES_PREFIX]) + "/";
        let mut client = self.conn.client();
        let resp = client.get(prefix, Some(GetOptions::new().with_prefix())).await?;
        let mut namespaces = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            match serde_json::from_slice::<Namespace>(kv.value()) {
                Ok(ns) => namespaces.push(ns),
                Err(e) => warn!(%e, "skipping malformed namespace record {:?}", kv.key_str()),
            }
        }
        Ok(namespaces)
    }

    /// Returns the namespace and the revision to pass back to
    /// `update_namespace` for a compare-and-update.
    pub async fn get_namespace(&self, name: &str) -> Result<(Namespace, i64)> {
        let mut client = self.conn.client();
        let resp = client.get(self.key(&[NAMESPACES_PREFIX, name]), None).await?;
        match resp.kvs().first() {
            Some(kv) => Ok((serde_json::from_slice(kv.value())?, kv.mod_revision())),
            None => Err(Error::NotFound(format!("namespace {name}"))),
        }
    }

    /// Compare-and-update keyed on the revision from `get_namespace`;
    /// revision 0 means create-if-absent. Loses race -> `Conflict`.
    pub async fn update_namespace(&self, namespace: &Namespace, revision: i64) -> Result<()> {
        let key = self.key(&[NAMESPACES_PREFIX, &namespace.name]);
        let value = serde_json::to_vec(namespace)?;
        let compare = if revision == 0 {
            Compare::create_revision(key.clone(), CompareOp::Equal, 0)
        } else {
            Compare::mod_revision(key.clone(), CompareOp::Equal, revision)
        };
        let mut client = self.conn.client();
        let resp = client
            .txn(Txn::new().when(vec![compare]).and_then(vec![TxnOp::put(key, value, None)]))
            .await?;
        if !resp.succeeded() {
            return Err(Error::Conflict(format!("namespace {}", namespace.name)));
        }
        Ok(())
    }

    pub async fn get_services(&self, namespace: &str) -> Result<Vec<Service>> {
        let prefix = self.key(&[SERVICES_PREFIX, namespace]) + "/";
        let mut client = self.conn.client();
        let resp = client.get(prefix, Some(GetOptions::new().with_prefix())).await?;
        let mut services = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            match serde_json::from_slice::<Service>(kv.value()) {
                Ok(svc) => services.push(svc),
                Err(e) => warn!(%e, "skipping malformed service record {:?}", kv.key_str()),
            }
        }
        Ok(services)
    }

    /// Pods running on `node`, optionally narrowed to one namespace.
    pub async fn get_pods(&self, node: &str, namespace: Option<&str>) -> Result<Vec<Pod>> {
        let prefix = self.key(&[PODS_PREFIX, node]) + "/";
        let mut client = self.conn.client();
        let resp = client.get(prefix, Some(GetOptions::new().with_prefix())).await?;
        let mut pods = Vec::new();
        for kv in resp.kvs() {
            match serde_json::from_slice::<Pod>(kv.value()) {
                Ok(pod) => {
                    if namespace.is_none_or(|ns| pod.namespace == ns) {
                        pods.push(pod);
                    }
                }
                Err(e) => warn!(%e, "skipping malformed pod record {:?}", kv.key_str()),
            }
        }
        Ok(pods)
    }

    /// Returns the persisted allocator snapshot and its revision; a
    /// missing record reads as empty with revision 0.
    pub async fn get_range_allocation(&self) -> Result<(RangeAllocation, i64)> {
        let mut client = self.conn.client();
        let resp = client.get(self.key(&[RANGES_VNID_KEY]), None).await?;
        match resp.kvs().first() {
            Some(kv) => Ok((serde_json::from_slice(kv.value())?, kv.mod_revision())),
            None => Ok((RangeAllocation::default(), 0)),
        }
    }

    pub async fn create_or_update_range_allocation(
        &self,
        allocation: &RangeAllocation,
        revision: i64,
    ) -> Result<()> {
        let key = self.key(&[RANGES_VNID_KEY]);
        let value = serde_json::to_vec(allocation)?;
        let compare = if revision == 0 {
            Compare::create_revision(key.clone(), CompareOp::Equal, 0)
        } else {
            Compare::mod_revision(key.clone(), CompareOp::Equal, revision)
        };
        let mut client = self.conn.client();
        let resp = client
            .txn(Txn::new().when(vec![compare]).and_then(vec![TxnOp::put(key, value, None)]))
            .await?;
        if !resp.succeeded() {
            return Err(Error::Conflict(RANGES_VNID_KEY.into()));
        }
        Ok(())
    }
}
