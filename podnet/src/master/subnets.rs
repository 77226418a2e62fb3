use ipnetwork::Ipv4Network;
use tracing::{error, info};

use podnet_netutils::{SubnetAllocator, node_ip};

use crate::registry::{EventType, NetworkConfig, NodeEvent, Subnet};
use crate::{Error, Result};

use super::SubnetStore;

/// Assigns a subnet to every registered node and releases it when the
/// node goes away. The in-memory allocator is the exclusive owner of the
/// in-use set; registry records are reconciled against it at startup.
pub struct SubnetController<S> {
    store: S,
    allocator: SubnetAllocator,
}

impl<S: SubnetStore> SubnetController<S> {
    /// Seeds the allocator's in-use set from the existing subnet records.
    pub async fn new(store: S, config: &NetworkConfig) -> Result<Self> {
        let in_use: Vec<String> = store
            .get_subnets()
            .await?
            .into_iter()
            .map(|(_, subnet)| subnet.sub)
            .collect();
        let allocator = SubnetAllocator::new(&config.network, config.host_bits, &in_use)?;
        Ok(Self { store, allocator })
    }

    /// One full pass: every node without a subnet gets one, every subnet
    /// whose node is gone is released.
    pub async fn reconcile(&self) -> Result<()> {
        let nodes = self.store.get_nodes().await?;
        let subnets = self.store.get_subnets().await?;

        for (name, ip) in &nodes {
            if !subnets.iter().any(|(node, _)| node == name) {
                if let Err(e) = self.add_node(name, ip).await {
                    error!(%e, "failed to assign subnet to node {name}");
                }
            }
        }

        for (name, _) in &subnets {
            if !nodes.iter().any(|(node, _)| node == name) {
                info!("node {name} is gone, releasing its subnet");
                if let Err(e) = self.delete_node(name).await {
                    error!(%e, "failed to release subnet of node {name}");
                }
            }
        }

        Ok(())
    }

    pub async fn handle_node_event(&self, event: &NodeEvent) {
        let result = match event.event_type {
            EventType::Added | EventType::Modified => {
                self.add_node(&event.node, &event.ip).await
            }
            EventType::Deleted => self.delete_node(&event.node).await,
        };
        if let Err(e) = result {
            error!(%e, "failed to handle {} event for node {}", event.event_type, event.node);
        }
    }

    async fn add_node(&self, node: &str, ip_hint: &str) -> Result<()> {
        match self.store.get_subnet(node).await {
            Ok(_) => return Ok(()),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        // the registered value is normally an IP already; fall back to
        // resolving the node name
        let ip = if ip_hint.is_empty() {
            node_ip(node)?
        } else {
            node_ip(ip_hint)?
        };

        let subnet = self.allocator.get_network()?;
        let record = Subnet {
            node_ip: ip.to_string(),
            sub: subnet.to_string(),
        };
        if let Err(e) = self.store.create_subnet(node, &record).await {
            // give the subnet back so the next attempt can reuse it
            self.allocator.release_network(subnet);
            return Err(e);
        }
        info!("assigned subnet {subnet} to node {node} ({ip})");
        Ok(())
    }

    /// Releases before deleting: a crash in between leaves a
    /// reserved-but-unused CIDR, which the next startup's seed pass
    /// recovers.
    async fn delete_node(&self, node: &str) -> Result<()> {
        let subnet = match self.store.get_subnet(node).await {
            Ok(record) => record,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        let cidr: Ipv4Network = subnet
            .sub
            .parse()
            .map_err(|_| Error::InvalidCidr(subnet.sub.clone()))?;
        self.allocator.release_network(cidr);
        self.store.delete_subnet(node).await?;
        info!("released subnet {} of node {node}", subnet.sub);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;

    #[derive(Default)]
    struct MemoryStore {
        nodes: Mutex<Vec<(String, String)>>,
        subnets: Mutex<HashMap<String, Subnet>>,
        fail_create: Mutex<bool>,
    }

    #[async_trait]
    impl SubnetStore for MemoryStore {
        async fn get_nodes(&self) -> Result<Vec<(String, String)>> {
            Ok(self.nodes.lock().unwrap().clone())
        }
        async fn get_subnets(&self) -> Result<Vec<(String, Subnet)>> {
            let subnets = self.subnets.lock().unwrap();
            let mut all: Vec<_> = subnets.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            all.sort_by(|a, b| a.0.cmp(&b.0));
            Ok(all)
        }
        async fn get_subnet(&self, node: &str) -> Result<Subnet> {
            self.subnets
                .lock()
                .unwrap()
                .get(node)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("subnet for node {node}")))
        }
        async fn create_subnet(&self, node: &str, subnet: &Subnet) -> Result<()> {
            if *self.fail_create.lock().unwrap() {
                return Err(Error::Other("registry write failed".into()));
            }
            self.subnets
                .lock()
                .unwrap()
                .insert(node.to_owned(), subnet.clone());
            Ok(())
        }
        async fn delete_subnet(&self, node: &str) -> Result<()> {
            self.subnets
                .lock()
                .unwrap()
                .remove(node)
                .map(|_| ())
                .ok_or_else(|| Error::NotFound(format!("subnet for node {node}")))
        }
    }

    fn config() -> NetworkConfig {
        NetworkConfig {
            network: "10.1.0.0/16".into(),
            host_bits: 8,
        }
    }

    fn node_event(event_type: EventType, node: &str, ip: &str) -> NodeEvent {
        NodeEvent {
            event_type,
            node: node.into(),
            ip: ip.into(),
        }
    }

    #[tokio::test]
    async fn test_reconcile_assigns_missing_subnets() {
        let store = MemoryStore::default();
        store.nodes.lock().unwrap().push(("node-1".into(), "10.20.0.1".into()));
        store.nodes.lock().unwrap().push(("node-2".into(), "10.20.0.2".into()));

        let controller = SubnetController::new(store, &config()).await.unwrap();
        controller.reconcile().await.unwrap();

        let subnets = controller.store.get_subnets().await.unwrap();
        assert_eq!(subnets.len(), 2);
        assert_eq!(subnets[0].1.sub, "10.1.0.0/24");
        assert_eq!(subnets[0].1.node_ip, "10.20.0.1");
        assert_eq!(subnets[1].1.sub, "10.1.1.0/24");
    }

    #[tokio::test]
    async fn test_reconcile_releases_orphaned_subnets() {
        let store = MemoryStore::default();
        store.subnets.lock().unwrap().insert(
            "gone-node".into(),
            Subnet {
                node_ip: "10.20.0.9".into(),
                sub: "10.1.0.0/24".into(),
            },
        );

        let controller = SubnetController::new(store, &config()).await.unwrap();
        controller.reconcile().await.unwrap();

        assert!(controller.store.get_subnets().await.unwrap().is_empty());
        // the freed subnet is reusable
        let event = node_event(EventType::Added, "node-1", "10.20.0.1");
        controller.handle_node_event(&event).await;
        assert_eq!(
            controller.store.get_subnet("node-1").await.unwrap().sub,
            "10.1.0.0/24"
        );
    }

    #[tokio::test]
    async fn test_added_node_skips_existing_subnet() {
        let store = MemoryStore::default();
        store.subnets.lock().unwrap().insert(
            "node-1".into(),
            Subnet {
                node_ip: "10.20.0.1".into(),
                sub: "10.1.5.0/24".into(),
            },
        );
        let controller = SubnetController::new(store, &config()).await.unwrap();

        controller
            .handle_node_event(&node_event(EventType::Added, "node-1", "10.20.0.1"))
            .await;

        assert_eq!(
            controller.store.get_subnet("node-1").await.unwrap().sub,
            "10.1.5.0/24"
        );
    }

    #[tokio::test]
    async fn test_failed_write_releases_allocation() {
        let store = MemoryStore::default();
        let controller = SubnetController::new(store, &config()).await.unwrap();

        *controller.store.fail_create.lock().unwrap() = true;
        controller
            .handle_node_event(&node_event(EventType::Added, "node-1", "10.20.0.1"))
            .await;

        *controller.store.fail_create.lock().unwrap() = false;
        controller
            .handle_node_event(&node_event(EventType::Added, "node-2", "10.20.0.2"))
            .await;

        // node-2 got the subnet node-1's failed write gave back
        assert_eq!(
            controller.store.get_subnet("node-2").await.unwrap().sub,
            "10.1.0.0/24"
        );
    }

    #[tokio::test]
    async fn test_deleted_node_releases_subnet() {
        let store = MemoryStore::default();
        let controller = SubnetController::new(store, &config()).await.unwrap();

        controller
            .handle_node_event(&node_event(EventType::Added, "node-1", "10.20.0.1"))
            .await;
        controller
            .handle_node_event(&node_event(EventType::Deleted, "node-1", "10.20.0.1"))
            .await;
        assert!(controller.store.get_subnet("node-1").await.unwrap_err().is_not_found());

        controller
            .handle_node_event(&node_event(EventType::Added, "node-2", "10.20.0.2"))
            .await;
        assert_eq!(
            controller.store.get_subnet("node-2").await.unwrap().sub,
            "10.1.0.0/24"
        );
    }

    #[tokio::test]
    async fn test_unresolvable_node_fails_add() {
        let store = MemoryStore::default();
        let controller = SubnetController::new(store, &config()).await.unwrap();

        controller
            .handle_node_event(&node_event(EventType::Added, "no-such-host.invalid", ""))
            .await;
        assert!(controller.store.get_subnets().await.unwrap().is_empty());

        // nothing leaked: the next node still gets the first subnet
        controller
            .handle_node_event(&node_event(EventType::Added, "node-1", "10.20.0.1"))
            .await;
        assert_eq!(
            controller.store.get_subnet("node-1").await.unwrap().sub,
            "10.1.0.0/24"
        );
    }
}
