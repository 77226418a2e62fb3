use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use podnet_netutils::generate_default_gateway;

use crate::commands::CommandRunner;
use crate::commands::ovs::OvsTransaction;
use crate::registry::Service;
use crate::{Error, Result};

use super::{BR, FlowController, devices, generate_cookie, parse_subnet};

/// External helper invoked to rewrite a pod's table-3/table-6 flows when
/// its namespace moves to a different VNID.
const POD_UPDATE_HELPER: &str = "podnet-ovs";

const RENDEZVOUS_OFPORT: u32 = 3;

/// Multi-tenant pipeline. Packets are tagged with their namespace VNID
/// in reg0; the VXLAN tunnel id carries it between nodes.
///
/// Tables: 0 MAC learning, 1 dispatch by in_port, 2 from-vxlan, 3
/// from-container (filled per-pod by the CNI plugin), 4 services, 5
/// general routing, 6 local pod delivery, 7 remote pod delivery, 8
/// MAC/ARP dispatch. The numbers are part of the contract with the CNI
/// plugin and must not shift.
pub struct MultiTenantFlows {
    runner: Arc<dyn CommandRunner>,
    setup_lock: Mutex<()>,
}

impl MultiTenantFlows {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            setup_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl FlowController for MultiTenantFlows {
    async fn setup(
        &self,
        local_subnet: &str,
        cluster_network: &str,
        services_network: &str,
        _mtu: u32,
    ) -> Result<bool> {
        let _guard = self.setup_lock.lock().await;

        let subnet = parse_subnet(local_subnet)?;
        let gateway = generate_default_gateway(subnet);
        let gateway_cidr = format!("{gateway}/{}", subnet.prefix());

        let gate = |flow: &str| flow.contains("NXM_NX_TUN_IPV4");
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

        // Table 0; learn MAC addresses and continue with table 1
        otx.add_flow(
            "table=0, actions=learn(table=8, priority=200, hard_timeout=900, \
             NXM_OF_ETH_DST[]=NXM_OF_ETH_SRC[], \
             load:NXM_NX_TUN_IPV4_SRC[]->NXM_NX_TUN_IPV4_DST[], \
             output:NXM_OF_IN_PORT[]), goto_table:1",
        );

        // Table 1; initial dispatch
        otx.add_flow("table=1, arp, actions=goto_table:8");
        otx.add_flow("table=1, in_port=1, actions=goto_table:2");
        otx.add_flow("table=1, in_port=2, actions=goto_table:5");
        otx.add_flow("table=1, in_port=3, actions=goto_table:5");
        otx.add_flow("table=1, actions=goto_table:3");

        // Table 2; incoming from vxlan
        otx.add_flow("table=2, arp, actions=goto_table:8");
        otx.add_flow(format!(
            "table=2, priority=200, ip, nw_dst={gateway}, actions=output:2"
        ));
        otx.add_flow("table=2, tun_id=0, actions=goto_table:5");
        otx.add_flow(format!(
            "table=2, priority=100, ip, nw_dst={local_subnet}, \
             actions=move:NXM_NX_TUN_ID[0..31]->NXM_NX_REG0[], goto_table:6"
        ));

        // Table 3; incoming from container; filled in by the CNI plugin

        // Table 4; services
        otx.add_flow(format!(
            "table=4, priority=100, ip, nw_dst={services_network}, actions=drop"
        ));
        otx.add_flow("table=4, priority=0, actions=goto_table:5");

        // Table 5; general routing
        otx.add_flow(format!(
            "table=5, priority=200, ip, nw_dst={gateway}, actions=output:2"
        ));
        otx.add_flow(format!(
            "table=5, priority=150, ip, nw_dst={local_subnet}, actions=goto_table:6"
        ));
        otx.add_flow(format!(
            "table=5, priority=100, ip, nw_dst={cluster_network}, actions=goto_table:7"
        ));
        otx.add_flow("table=5, priority=0, ip, actions=output:2");

        // Table 6; to local container; per-pod rules filled in by the CNI
        // plugin, global traffic bypasses the tenant check
        otx.add_flow("table=6, priority=200, ip, reg0=0, actions=goto_table:8");

        // Table 7; to remote container; filled in by add_of_rules

        // Table 8; MAC dispatch / ARP, filled in by table 0's learn()
        // rule and per-node ARP rules from add_of_rules
        otx.add_flow("table=8, priority=0, arp, actions=flood");

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
        if node_ip == local_ip {
            return Ok(());
        }

        let cookie = generate_cookie(node_ip);
        let mut otx = OvsTransaction::new(self.runner.as_ref(), BR);
        otx.add_flow(format!(
            "table=7, cookie=0x{cookie}, priority=100, ip, nw_dst={node_subnet}, \
             actions=move:NXM_NX_REG0[]->NXM_NX_TUN_ID[0..31],set_field:{node_ip}->tun_dst,output:1"
        ));
        otx.add_flow(format!(
            "table=8, cookie=0x{cookie}, priority=100, arp, nw_dst={node_subnet}, \
             actions=move:NXM_NX_REG0[]->NXM_NX_TUN_ID[0..31],set_field:{node_ip}->tun_dst,output:1"
        ));
        info!("added flows for node {node_ip} ({node_subnet})");
        otx.commit().await
    }

    async fn del_of_rules(&self, node_ip: Ipv4Addr, local_ip: Ipv4Addr) -> Result<()> {
        if node_ip == local_ip {
            return Ok(());
        }

        let cookie = generate_cookie(node_ip);
        let mut otx = OvsTransaction::new(self.runner.as_ref(), BR);
        otx.delete_flows(&format!("table=7, cookie=0x{cookie}/0xffffffff"));
        otx.delete_flows(&format!("table=8, cookie=0x{cookie}/0xffffffff"));
        info!("removed flows for node {node_ip}");
        otx.commit().await
    }

    async fn add_service_rules(&self, service: &Service, vnid: u32) -> Result<()> {
        let Some(ip) = service.cluster_ip.as_deref() else {
            return Ok(());
        };
        let mut otx = OvsTransaction::new(self.runner.as_ref(), BR);
        for port in &service.ports {
            let base = base_service_rule(ip, port.protocol.to_string(), port.port);
            let flow = if vnid == podnet_netid::GLOBAL_VNID {
                format!("{base},priority=200,actions=output:2")
            } else {
                format!("{base},priority=200,reg0={vnid},actions=output:2")
            };
            otx.add_flow(flow);
        }
        debug!(
            "added service rules for {}/{} vnid {vnid}",
            service.namespace, service.name
        );
        otx.commit().await
    }

    async fn del_service_rules(&self, service: &Service) -> Result<()> {
        let Some(ip) = service.cluster_ip.as_deref() else {
            return Ok(());
        };
        let mut otx = OvsTransaction::new(self.runner.as_ref(), BR);
        for port in &service.ports {
            otx.delete_flows(&base_service_rule(ip, port.protocol.to_string(), port.port));
        }
        debug!(
            "removed service rules for {}/{}",
            service.namespace, service.name
        );
        otx.commit().await
    }

    async fn update_pod(
        &self,
        namespace: &str,
        pod: &str,
        container_id: &str,
        vnid: u32,
    ) -> Result<()> {
        let args = vec![
            "update".to_owned(),
            namespace.to_owned(),
            pod.to_owned(),
            container_id.to_owned(),
            vnid.to_string(),
        ];
        self.runner
            .run(POD_UPDATE_HELPER, &args)
            .await
            .map_err(|e| Error::Other(format!("failed to update pod network: {e}")))?;
        Ok(())
    }
}

fn base_service_rule(ip: &str, protocol: String, port: u16) -> String {
    format!("table=4,{protocol},nw_dst={ip},tp_dst={port}")
}
