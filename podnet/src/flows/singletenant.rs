use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use podnet_netutils::generate_default_gateway;

use crate::commands::CommandRunner;
use crate::commands::ovs::OvsTransaction;
use crate::registry::Service;
use crate::Result;

use super::{BR, FlowController, devices, generate_cookie, parse_subnet};

/// Single-tenant pipeline: one flow table forwarding by destination
/// subnet, no VNID tagging. The container rendezvous port is ofport 9.
pub struct SingleTenantFlows {
    runner: Arc<dyn CommandRunner>,
    setup_lock: Mutex<()>,
}

const RENDEZVOUS_OFPORT: u32 = 9;

impl SingleTenantFlows {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            setup_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl FlowController for SingleTenantFlows {
    async fn setup(
        &self,
        local_subnet: &str,
        cluster_network: &str,
        _services_network: &str,
        _mtu: u32,
    ) -> Result<bool> {
        let _guard = self.setup_lock.lock().await;

        let subnet = parse_subnet(local_subnet)?;
        let gateway = generate_default_gateway(subnet);
        let gateway_cidr = format!("{gateway}/{}", subnet.prefix());

        let gate = |flow: &str| flow.contains("table=0") && flow.contains("arp");
        if devices::already_set_up(self.runner.as_ref(), &gateway_cidr, gate).await {
            info!("pod network already set up");
            return Ok(false);
        }

        devices::setup_devices(
            self.runner.as_ref(),
            &gateway_cidr,
            local_subnet,
            cluster_network,
            RENDEZVOUS_OFPORT,
        )
        .await?;

        let mut otx = OvsTransaction::new(self.runner.as_ref(), BR);
        otx.delete_flows("");
        otx.add_flow("table=0, cookie=0x0, priority=50, actions=output:2".to_string());
        otx.add_flow(format!(
            "table=0, cookie=0x0, priority=100, arp, nw_dst={gateway}, actions=output:2"
        ));
        otx.add_flow(format!(
            "table=0, cookie=0x0, priority=100, ip, nw_dst={gateway}, actions=output:2"
        ));
        otx.commit().await?;

        devices::setup_iptables(self.runner.as_ref(), cluster_network).await?;

        Ok(true)
    }

    async fn add_of_rules(
        &self,
        node_ip: Ipv4Addr,
        node_subnet: &str,
        local_ip: Ipv4Addr,
    ) -> Result<()> {
        let cookie = generate_cookie(node_ip);
        let mut otx = OvsTransaction::new(self.runner.as_ref(), BR);
        if node_ip == local_ip {
            // our own subnet: hand local traffic to the container
            // rendezvous port
            otx.add_flow(format!(
                "table=0, cookie=0x{cookie}, priority=75, ip, nw_dst={node_subnet}, actions=output:{RENDEZVOUS_OFPORT}"
            ));
            otx.add_flow(format!(
                "table=0, cookie=0x{cookie}, priority=75, arp, nw_dst={node_subnet}, actions=output:{RENDEZVOUS_OFPORT}"
            ));
        } else {
            otx.add_flow(format!(
                "table=0, cookie=0x{cookie}, priority=100, ip, nw_dst={node_subnet}, actions=set_field:{node_ip}->tun_dst,output:1"
            ));
            otx.add_flow(format!(
                "table=0, cookie=0x{cookie}, priority=100, arp, nw_dst={node_subnet}, actions=set_field:{node_ip}->tun_dst,output:1"
            ));
        }
        info!("added flows for node {node_ip} ({node_subnet})");
        otx.commit().await
    }

    async fn del_of_rules(&self, node_ip: Ipv4Addr, _local_ip: Ipv4Addr) -> Result<()> {
        let cookie = generate_cookie(node_ip);
        let mut otx = OvsTransaction::new(self.runner.as_ref(), BR);
        otx.delete_flows(&format!("table=0, cookie=0x{cookie}/0xffffffff, ip"));
        otx.delete_flows(&format!("table=0, cookie=0x{cookie}/0xffffffff, arp"));
        info!("removed flows for node {node_ip}");
        otx.commit().await
    }

    // no service dispatch table in this pipeline
    async fn add_service_rules(&self, _service: &Service, _vnid: u32) -> Result<()> {
        Ok(())
    }

    async fn del_service_rules(&self, _service: &Service) -> Result<()> {
        Ok(())
    }

    // pod flows carry no VNID, nothing to rewrite
    async fn update_pod(
        &self,
        _namespace: &str,
        _pod: &str,
        _container_id: &str,
        _vnid: u32,
    ) -> Result<()> {
        Ok(())
    }
}
