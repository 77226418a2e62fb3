//! Per-node agent: registers the node, waits for its subnet, programs
//! the datapath, and keeps it converged from the registry watches.

pub mod files;
pub mod vnid_map;
pub mod vnids;

use std::future::Future;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use ahash::HashMap;
use async_trait::async_trait;
use tokio::sync::mpsc::Receiver;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use podnet_netutils::node_ip;

use crate::commands::{CommandRunner, ExecRunner};
use crate::config::NodeArgs;
use crate::flows::{FlowController, MultiTenantFlows, SingleTenantFlows};
use crate::registry::{
    EventType, Namespace, Pod, PodEvent, Registry, Service, Subnet, SubnetEvent,
};
use crate::{Error, Result};

pub use vnid_map::VnidMap;

const SUBNET_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Registry surface the agent's event handlers need.
#[async_trait]
pub trait NodeStore: Send + Sync {
    async fn list_namespaces(&self) -> Result<Vec<Namespace>>;
    async fn get_services(&self, namespace: &str) -> Result<Vec<Service>>;
    async fn get_pods(&self, node: &str, namespace: Option<&str>) -> Result<Vec<Pod>>;
}

#[async_trait]
impl NodeStore for Registry {
    async fn list_namespaces(&self) -> Result<Vec<Namespace>> {
        Registry::list_namespaces(self).await
    }
    async fn get_services(&self, namespace: &str) -> Result<Vec<Service>> {
        Registry::get_services(self, namespace).await
    }
    async fn get_pods(&self, node: &str, namespace: Option<&str>) -> Result<Vec<Pod>> {
        Registry::get_pods(self, node, namespace).await
    }
}

pub struct NodeAgent<S> {
    store: S,
    flows: Arc<dyn FlowController>,
    pub vnids: VnidMap,
    /// Known services by uid, for change detection and rule cleanup.
    services: Mutex<HashMap<String, Service>>,
    /// Running local pods by uid; rebuilt from the registry at startup,
    /// then maintained by the pod watch.
    local_pods: RwLock<HashMap<String, Pod>>,
    hostname: String,
    local_ip: Ipv4Addr,
}

impl<S: NodeStore> NodeAgent<S> {
    pub fn new(
        store: S,
        flows: Arc<dyn FlowController>,
        hostname: String,
        local_ip: Ipv4Addr,
    ) -> Self {
        Self {
            store,
            flows,
            vnids: VnidMap::new(),
            services: Mutex::new(HashMap::default()),
            local_pods: RwLock::new(HashMap::default()),
            hostname,
            local_ip,
        }
    }

    pub async fn handle_subnet_event(&self, event: &SubnetEvent) {
        let result = self.apply_subnet_event(event).await;
        if let Err(e) = result {
            error!(
                %e,
                "failed to handle {} event for subnet of node {}",
                event.event_type, event.node
            );
        }
    }

    async fn apply_subnet_event(&self, event: &SubnetEvent) -> Result<()> {
        let node_ip: Ipv4Addr = event
            .subnet
            .node_ip
            .parse()
            .map_err(|_| Error::Other(format!("bad node IP {:?}", event.subnet.node_ip)))?;
        match event.event_type {
            EventType::Added | EventType::Modified => {
                self.flows
                    .add_of_rules(node_ip, &event.subnet.sub, self.local_ip)
                    .await
            }
            EventType::Deleted => self.flows.del_of_rules(node_ip, self.local_ip).await,
        }
    }

    /// Seeds the running-pod cache from the registry.
    pub async fn refresh_local_pods(&self) -> Result<()> {
        let pods = self.store.get_pods(&self.hostname, None).await?;
        let mut cache = self.local_pods.write().unwrap();
        cache.clear();
        for pod in pods {
            if pod.ip.is_some() {
                cache.insert(pod.uid.clone(), pod);
            }
        }
        Ok(())
    }

    pub fn handle_pod_event(&self, event: &PodEvent) {
        let pod = &event.pod;
        match event.event_type {
            EventType::Added | EventType::Modified => {
                if pod.ip.is_some() {
                    debug!("tracking local pod {}/{}", pod.namespace, pod.name);
                    self.local_pods
                        .write()
                        .unwrap()
                        .insert(pod.uid.clone(), pod.clone());
                }
            }
            EventType::Deleted => {
                debug!("dropping local pod {}/{}", pod.namespace, pod.name);
                self.local_pods.write().unwrap().remove(&pod.uid);
            }
        }
    }

    fn local_pods_of(&self, namespace: &str) -> Vec<Pod> {
        self.local_pods
            .read()
            .unwrap()
            .values()
            .filter(|p| p.namespace == namespace)
            .cloned()
            .collect()
    }

    /// Re-runs the CNI update for every tracked pod, for after a
    /// bring-up that reprogrammed the datapath under running pods.
    pub async fn update_local_pods(&self) {
        let pods: Vec<Pod> = self.local_pods.read().unwrap().values().cloned().collect();
        for pod in pods {
            let vnid = self
                .vnids
                .get_vnid(&pod.namespace)
                .unwrap_or(podnet_netid::GLOBAL_VNID);
            if let Err(e) = self
                .flows
                .update_pod(&pod.namespace, &pod.name, &pod.container_id, vnid)
                .await
            {
                warn!(%e, "could not update pod {}/{}", pod.namespace, pod.name);
            }
        }
    }
}

pub async fn run(args: NodeArgs, ready: CancellationToken, cancel: CancellationToken) -> Result<()> {
    let registry = Registry::connect(
        args.registry.etcd_endpoints.clone(),
        args.registry.etcd_prefix.clone(),
    )
    .await?;
    let runner: Arc<dyn CommandRunner> = Arc::new(ExecRunner);

    let hostname = match &args.hostname {
        Some(hostname) => hostname.clone(),
        None => resolve_hostname(runner.as_ref()).await?,
    };
    let local_ip: Ipv4Addr = match &args.node_ip {
        Some(ip) => ip
            .parse()
            .map_err(|_| Error::Other(format!("bad node IP {ip:?}")))?,
        None => node_ip(&hostname)?,
    };
    let multitenant = args.plugin.multitenant();
    info!(
        "starting node agent on {hostname} ({local_ip}) with the {} plugin",
        args.plugin
    );

    registry.create_node(&hostname, &local_ip.to_string()).await?;
    let subnet = wait_for_subnet(&registry, &hostname, &cancel).await?;
    let config = registry.get_network_config().await?;
    info!("assigned subnet {}, cluster network {}", subnet.sub, config.network);

    files::write_node_config(
        Path::new(files::NODE_CONFIG_PATH),
        &config.network,
        &subnet.sub,
        args.mtu,
    )?;
    files::write_cni_config(
        Path::new(files::CNI_CONFIG_PATH),
        &args.master_kubeconfig.display().to_string(),
        multitenant,
    )?;

    let flows: Arc<dyn FlowController> = if multitenant {
        Arc::new(MultiTenantFlows::new(runner.clone()))
    } else {
        Arc::new(SingleTenantFlows::new(runner.clone()))
    };
    let changed = flows
        .setup(&subnet.sub, &config.network, &args.services_network, args.mtu)
        .await?;

    let agent = Arc::new(NodeAgent::new(
        registry.clone(),
        flows,
        hostname.clone(),
        local_ip,
    ));

    agent.refresh_local_pods().await?;
    if multitenant {
        // populate synchronously so services arriving on the watch can
        // resolve their VNIDs immediately
        agent.populate_vnid_map().await?;
    }
    if changed {
        agent.update_local_pods().await;
    }

    let subnet_events = registry.watch_subnets(cancel.child_token());
    spawn_event_loop(agent.clone(), subnet_events, cancel.clone(), "subnets", |agent, event| async move {
        agent.handle_subnet_event(&event).await;
    });

    let pod_events = registry.watch_pods(&hostname, cancel.child_token());
    spawn_event_loop(agent.clone(), pod_events, cancel.clone(), "pods", |agent, event| async move {
        agent.handle_pod_event(&event);
    });

    if multitenant {
        let namespace_events = registry.watch_namespaces(cancel.child_token());
        spawn_event_loop(agent.clone(), namespace_events, cancel.clone(), "namespaces", |agent, event| async move {
            agent.handle_namespace_event(&event).await;
        });

        let service_events = registry.watch_services(cancel.child_token());
        spawn_event_loop(agent.clone(), service_events, cancel.clone(), "services", |agent, event| async move {
            agent.handle_service_event(&event).await;
        });
    }

    ready.cancel();
    info!("pod network ready");

    cancel.cancelled().await;
    Ok(())
}

/// Any subsystem depending on the pod network can block on this with a
/// two minute deadline.
pub async fn wait_for_pod_network(ready: &CancellationToken) -> Result<()> {
    let log_interval = Duration::from_secs(10);
    let intervals = 12;

    for _ in 0..intervals {
        tokio::select! {
            _ = ready.cancelled() => return Ok(()),
            _ = sleep(log_interval) => info!("waiting for pod network to be ready..."),
        }
    }
    Err(Error::Other("pod network is not ready (timeout: 2 mins)".into()))
}

/// The master assigns the subnet asynchronously after the node shows up
/// in the registry; poll for it forever.
async fn wait_for_subnet(
    registry: &Registry,
    hostname: &str,
    cancel: &CancellationToken,
) -> Result<Subnet> {
    loop {
        match registry.get_subnet(hostname).await {
            Ok(subnet) => return Ok(subnet),
            Err(e) if e.is_not_found() => {
                debug!("no subnet assigned to {hostname} yet");
            }
            Err(e) => warn!(%e, "could not fetch our subnet"),
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(Error::Other("shut down before a subnet was assigned".into()));
            }
            _ = sleep(SUBNET_POLL_INTERVAL) => {}
        }
    }
}

async fn resolve_hostname(runner: &dyn CommandRunner) -> Result<String> {
    let output = runner.run("uname", &["-n".to_owned()]).await?;
    let hostname = output.trim().to_owned();
    if hostname.is_empty() {
        return Err(Error::Other("could not determine hostname".into()));
    }
    Ok(hostname)
}

fn spawn_event_loop<T, F, Fut>(
    agent: Arc<NodeAgent<Registry>>,
    mut events: Receiver<T>,
    cancel: CancellationToken,
    kind: &'static str,
    handle: F,
) where
    T: Send + 'static,
    F: Fn(Arc<NodeAgent<Registry>>, T) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        info!("started {kind} watch");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = events.recv() => match event {
                    Some(event) => handle(agent.clone(), event).await,
                    None => {
                        warn!("{kind} watch ended");
                        return;
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod test {
    use crate::commands::testing::FakeRunner;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_pod_network_ready() {
        let ready = CancellationToken::new();
        let signal = ready.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(30)).await;
            signal.cancel();
        });
        wait_for_pod_network(&ready).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_pod_network_deadline() {
        let ready = CancellationToken::new();
        assert!(wait_for_pod_network(&ready).await.is_err());
    }

    #[tokio::test]
    async fn test_resolve_hostname() {
        let runner = FakeRunner::new();
        runner.stub_output("uname -n", "node-7.example.com\n");
        assert_eq!(resolve_hostname(&runner).await.unwrap(), "node-7.example.com");
    }

    #[tokio::test]
    async fn test_resolve_hostname_empty_is_an_error() {
        let runner = FakeRunner::new();
        assert!(resolve_hostname(&runner).await.is_err());
    }
}
