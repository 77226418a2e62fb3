use tracing::{debug, error, info, warn};

use podnet_netid::{self as netid, GLOBAL_VNID};

use crate::registry::{EventType, NamespaceEvent, Service, ServiceEvent};
use crate::{Error, Result};

use super::{NodeAgent, NodeStore};

impl<S: NodeStore> NodeAgent<S> {
    /// Fills the VNID map from a namespace listing, so services already
    /// in the cluster can resolve their tenant before the first
    /// namespace event arrives.
    pub async fn populate_vnid_map(&self) -> Result<()> {
        for namespace in self.store.list_namespaces().await? {
            match netid::get_vnid(&namespace.annotations) {
                Ok(id) => self.vnids.set_vnid(&namespace.name, id),
                Err(netid::Error::NotFound) => {}
                Err(e) => {
                    error!(%e, "invalid netid, ignoring namespace {:?}", namespace.name);
                }
            }
        }
        Ok(())
    }

    pub async fn handle_namespace_event(&self, event: &NamespaceEvent) {
        let namespace = &event.namespace;
        let name = &namespace.name;
        debug!("{} event for namespace {name:?}", event.event_type);

        match event.event_type {
            EventType::Added | EventType::Modified => {
                let Ok(net_id) = netid::get_vnid(&namespace.annotations) else {
                    // VNID may not be assigned by the master yet
                    return;
                };
                let old_net_id = self.vnids.get_vnid(name).ok();
                if old_net_id == Some(net_id) {
                    return;
                }
                self.vnids.set_vnid(name, net_id);

                if let Err(e) = self.update_pod_network(name, net_id).await {
                    error!(%e, "failed to update pod network for namespace {name:?}");
                    // put the old mapping back so a retry sees the change
                    match old_net_id {
                        Some(old) => self.vnids.set_vnid(name, old),
                        None => {
                            let _ = self.vnids.unset_vnid(name);
                        }
                    }
                }
            }
            EventType::Deleted => {
                // reprogram to the global VNID first, so multitenant
                // rules fail closed; the map entry goes away after
                if let Err(e) = self.update_pod_network(name, GLOBAL_VNID).await {
                    error!(%e, "failed to update pod network for namespace {name:?}");
                }
                let _ = self.vnids.unset_vnid(name);
            }
        }
    }

    /// Rewrites the VNID-carrying flows for everything in a namespace:
    /// the CNI update for each running local pod, then the service
    /// dispatch rules.
    pub(super) async fn update_pod_network(&self, namespace: &str, net_id: u32) -> Result<()> {
        for pod in self.local_pods_of(namespace) {
            self.flows
                .update_pod(&pod.namespace, &pod.name, &pod.container_id, net_id)
                .await?;
        }

        let mut failures = Vec::new();
        for service in self.store.get_services(namespace).await? {
            if let Err(e) = self.flows.del_service_rules(&service).await {
                error!(%e, "failed to remove rules for service {}/{}", namespace, service.name);
            }
            if let Err(e) = self.flows.add_service_rules(&service, net_id).await {
                failures.push(format!("{}: {e}", service.name));
            }
        }
        if !failures.is_empty() {
            return Err(Error::Other(format!(
                "failed to re-add service rules: {}",
                failures.join("; ")
            )));
        }
        Ok(())
    }

    pub async fn handle_service_event(&self, event: &ServiceEvent) {
        let service = &event.service;
        if service.cluster_ip.is_none() {
            // headless services get no dispatch flows
            return;
        }
        debug!(
            "{} event for service {}/{}",
            event.event_type, service.namespace, service.name
        );

        match event.event_type {
            EventType::Added | EventType::Modified => {
                let previous = self.known_service(&service.uid);
                if let Some(previous) = &previous {
                    if !service_changed(previous, service) {
                        return;
                    }
                    if let Err(e) = self.flows.del_service_rules(previous).await {
                        error!(%e, "failed to remove stale rules for service {}/{}",
                            service.namespace, service.name);
                    }
                }

                let net_id = match self.vnids.wait_and_get_vnid(&service.namespace).await {
                    Ok(id) => id,
                    Err(e) => {
                        warn!(%e, "skipped adding rules for service {}/{}",
                            service.namespace, service.name);
                        return;
                    }
                };
                match self.flows.add_service_rules(service, net_id).await {
                    Ok(()) => {
                        self.remember_service(service.clone());
                        info!("added rules for service {}/{}", service.namespace, service.name);
                    }
                    Err(e) => {
                        error!(%e, "failed to add rules for service {}/{}",
                            service.namespace, service.name);
                    }
                }
            }
            EventType::Deleted => {
                self.forget_service(&service.uid);
                if let Err(e) = self.flows.del_service_rules(service).await {
                    error!(%e, "failed to remove rules for service {}/{}",
                        service.namespace, service.name);
                }
            }
        }
    }

    fn known_service(&self, uid: &str) -> Option<Service> {
        self.services.lock().unwrap().get(uid).cloned()
    }

    fn remember_service(&self, service: Service) {
        self.services
            .lock()
            .unwrap()
            .insert(service.uid.clone(), service);
    }

    fn forget_service(&self, uid: &str) {
        self.services.lock().unwrap().remove(uid);
    }
}

/// Only protocol or port changes require reprogramming; everything else
/// about a service is irrelevant to the dispatch flows.
fn service_changed(old: &Service, new: &Service) -> bool {
    old.ports != new.ports
}

#[cfg(test)]
mod test {
    use std::net::Ipv4Addr;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use podnet_netid::VNID_ANNOTATION;

    use crate::commands::testing::FakeRunner;
    use crate::flows::MultiTenantFlows;
    use crate::registry::{Namespace, Pod, ServicePort, ServiceProtocol};

    use super::*;

    #[derive(Default)]
    struct MemoryStore {
        namespaces: Mutex<Vec<Namespace>>,
        services: Mutex<Vec<Service>>,
        pods: Mutex<Vec<Pod>>,
    }

    #[async_trait]
    impl NodeStore for MemoryStore {
        async fn list_namespaces(&self) -> Result<Vec<Namespace>> {
            Ok(self.namespaces.lock().unwrap().clone())
        }
        async fn get_services(&self, namespace: &str) -> Result<Vec<Service>> {
            Ok(self
                .services
                .lock()
                .unwrap()
                .iter()
                .filter(|s| s.namespace == namespace)
                .cloned()
                .collect())
        }
        async fn get_pods(&self, node: &str, namespace: Option<&str>) -> Result<Vec<Pod>> {
            Ok(self
                .pods
                .lock()
                .unwrap()
                .iter()
                .filter(|p| p.node == node && namespace.is_none_or(|ns| p.namespace == ns))
                .cloned()
                .collect())
        }
    }

    fn agent(store: MemoryStore) -> (Arc<FakeRunner>, NodeAgent<MemoryStore>) {
        let runner = Arc::new(FakeRunner::new());
        let flows = Arc::new(MultiTenantFlows::new(runner.clone()));
        let agent = NodeAgent::new(store, flows, "node-1".to_owned(), Ipv4Addr::new(10, 20, 0, 1));
        (runner, agent)
    }

    fn namespace(name: &str, vnid: u32) -> Namespace {
        let mut ns = Namespace::new(name);
        ns.annotations
            .insert(VNID_ANNOTATION.into(), vnid.to_string());
        ns
    }

    fn service(uid: &str, namespace: &str, port: u16) -> Service {
        Service {
            uid: uid.into(),
            namespace: namespace.into(),
            name: format!("svc-{uid}"),
            cluster_ip: Some("172.30.0.10".into()),
            ports: vec![ServicePort {
                protocol: ServiceProtocol::Tcp,
                port,
            }],
        }
    }

    fn pod(uid: &str, namespace: &str) -> Pod {
        Pod {
            uid: uid.into(),
            namespace: namespace.into(),
            name: format!("pod-{uid}"),
            node: "node-1".into(),
            container_id: format!("ctr-{uid}"),
            ip: Some("10.1.2.5".into()),
        }
    }

    #[tokio::test]
    async fn test_populate_vnid_map() {
        let store = MemoryStore::default();
        store.namespaces.lock().unwrap().push(namespace("web", 42));
        store.namespaces.lock().unwrap().push(Namespace::new("unassigned"));
        let (_, agent) = agent(store);

        agent.populate_vnid_map().await.unwrap();

        assert_eq!(agent.vnids.get_vnid("web").unwrap(), 42);
        assert!(agent.vnids.get_vnid("unassigned").is_err());
    }

    #[tokio::test]
    async fn test_namespace_event_updates_pods_and_services() {
        let store = MemoryStore::default();
        store.services.lock().unwrap().push(service("s1", "web", 80));
        store.pods.lock().unwrap().push(pod("p1", "web"));
        let (runner, agent) = agent(store);
        agent.refresh_local_pods().await.unwrap();
        agent.vnids.set_vnid("web", 41);

        let event = NamespaceEvent {
            event_type: EventType::Modified,
            namespace: namespace("web", 42),
        };
        agent.handle_namespace_event(&event).await;

        assert_eq!(agent.vnids.get_vnid("web").unwrap(), 42);
        let recorded = runner.recorded();
        assert!(recorded.iter().any(|c| c == "podnet-ovs update web pod-p1 ctr-p1 42"));
        assert!(recorded.iter().any(|c| c.contains("del-flows") && c.contains("tp_dst=80")));
        assert!(recorded.iter().any(|c| c.contains("add-flow") && c.contains("reg0=42")));
    }

    #[tokio::test]
    async fn test_namespace_event_unchanged_vnid_is_skipped() {
        let (runner, agent) = agent(MemoryStore::default());
        agent.vnids.set_vnid("web", 42);

        let event = NamespaceEvent {
            event_type: EventType::Modified,
            namespace: namespace("web", 42),
        };
        agent.handle_namespace_event(&event).await;

        assert!(runner.recorded().is_empty());
    }

    #[tokio::test]
    async fn test_namespace_event_rolls_back_map_on_failure() {
        let store = MemoryStore::default();
        store.pods.lock().unwrap().push(pod("p1", "web"));
        let (runner, agent) = agent(store);
        agent.refresh_local_pods().await.unwrap();
        agent.vnids.set_vnid("web", 41);
        runner.stub_failure("podnet-ovs update web pod-p1 ctr-p1 42", "update failed");

        let event = NamespaceEvent {
            event_type: EventType::Modified,
            namespace: namespace("web", 42),
        };
        agent.handle_namespace_event(&event).await;

        assert_eq!(agent.vnids.get_vnid("web").unwrap(), 41);
    }

    #[tokio::test]
    async fn test_namespace_delete_fails_closed() {
        let store = MemoryStore::default();
        store.pods.lock().unwrap().push(pod("p1", "web"));
        let (runner, agent) = agent(store);
        agent.refresh_local_pods().await.unwrap();
        agent.vnids.set_vnid("web", 42);

        let event = NamespaceEvent {
            event_type: EventType::Deleted,
            namespace: namespace("web", 42),
        };
        agent.handle_namespace_event(&event).await;

        assert!(agent.vnids.get_vnid("web").is_err());
        // pods were repointed at the global VNID before the unset
        assert!(runner
            .recorded()
            .iter()
            .any(|c| c == "podnet-ovs update web pod-p1 ctr-p1 0"));
    }

    #[tokio::test]
    async fn test_service_event_programs_rules() {
        let (runner, agent) = agent(MemoryStore::default());
        agent.vnids.set_vnid("web", 42);

        let event = ServiceEvent {
            event_type: EventType::Added,
            service: service("s1", "web", 80),
        };
        agent.handle_service_event(&event).await;

        let recorded = runner.recorded();
        assert_eq!(recorded.len(), 1);
        assert!(recorded[0].contains("table=4,tcp,nw_dst=172.30.0.10,tp_dst=80,priority=200,reg0=42"));
    }

    #[tokio::test]
    async fn test_service_event_dedupes_unchanged() {
        let (runner, agent) = agent(MemoryStore::default());
        agent.vnids.set_vnid("web", 42);

        let event = ServiceEvent {
            event_type: EventType::Added,
            service: service("s1", "web", 80),
        };
        agent.handle_service_event(&event).await;
        // same uid, same ports: nothing to do
        agent.handle_service_event(&event).await;
        assert_eq!(runner.recorded().len(), 1);

        // port change: old rules out, new rules in
        let event = ServiceEvent {
            event_type: EventType::Modified,
            service: service("s1", "web", 8080),
        };
        agent.handle_service_event(&event).await;

        let recorded = runner.recorded();
        assert_eq!(recorded.len(), 3);
        assert!(recorded[1].contains("del-flows") && recorded[1].contains("tp_dst=80"));
        assert!(recorded[2].contains("add-flow") && recorded[2].contains("tp_dst=8080"));
    }

    #[tokio::test]
    async fn test_service_delete_removes_rules() {
        let (runner, agent) = agent(MemoryStore::default());
        agent.vnids.set_vnid("web", 42);

        let svc = service("s1", "web", 80);
        agent.handle_service_event(&ServiceEvent {
            event_type: EventType::Added,
            service: svc.clone(),
        })
        .await;
        agent.handle_service_event(&ServiceEvent {
            event_type: EventType::Deleted,
            service: svc,
        })
        .await;

        let recorded = runner.recorded();
        assert!(recorded[1].contains("del-flows br0 table=4,tcp,nw_dst=172.30.0.10,tp_dst=80"));
        // a re-add after delete programs rules again
        assert!(agent.known_service("s1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_service_without_vnid_is_skipped() {
        let (runner, agent) = agent(MemoryStore::default());

        let event = ServiceEvent {
            event_type: EventType::Added,
            service: service("s1", "web", 80),
        };
        agent.handle_service_event(&event).await;

        assert!(runner.recorded().is_empty());
    }
}
