use tracing::info;

use crate::commands::ip::IpTransaction;
use crate::commands::iptables::IptablesTransaction;
use crate::commands::ovs::OvsTransaction;
use crate::commands::{CommandRunner, set_sysctl};
use crate::Result;

use super::{BR, LBR, TUN, VLINUXBR, VOVSBR, VXLAN};

/// Inspects the datapath for the fingerprint of a completed bring-up:
/// the gateway address on the Linux bridge and a pipeline-specific
/// sentinel in the flow dump. Both present means setup already ran.
pub(super) async fn already_set_up(
    runner: &dyn CommandRunner,
    gateway_cidr: &str,
    sentinel: impl Fn(&str) -> bool,
) -> bool {
    let itx = IpTransaction::new(runner, LBR);
    let Ok(addresses) = itx.get_addresses().await else {
        return false;
    };
    if !addresses.iter().any(|a| a == gateway_cidr) {
        return false;
    }

    let otx = OvsTransaction::new(runner, BR);
    let Ok(flows) = otx.dump_flows().await else {
        return false;
    };
    flows.iter().any(|f| sentinel(f))
}

/// Creates the veth pair, Linux bridge, OVS bridge and its ports, the
/// tun0 gateway, and the cluster route. Every step deletes before it
/// adds, so a rerun after a partial failure converges.
pub(super) async fn setup_devices(
    runner: &dyn CommandRunner,
    gateway_cidr: &str,
    local_subnet: &str,
    cluster_network: &str,
    rendezvous_ofport: u32,
) -> Result<()> {
    let gateway = gateway_cidr.split('/').next().unwrap_or(gateway_cidr);

    let mut itx = IpTransaction::new(runner, VLINUXBR);
    itx.delete_link();
    itx.ignore_error();
    itx.add_link(&["type", "veth", "peer", "name", VOVSBR]);
    itx.set_link(&["up"]);
    itx.set_link(&["txqueuelen", "0"]);
    itx.commit().await?;

    let mut itx = IpTransaction::new(runner, VOVSBR);
    itx.set_link(&["up"]);
    itx.set_link(&["txqueuelen", "0"]);
    itx.commit().await?;

    let mut itx = IpTransaction::new(runner, LBR);
    itx.set_link(&["down"]);
    itx.ignore_error();
    itx.delete_link();
    itx.ignore_error();
    itx.add_link(&["type", "bridge"]);
    itx.add_address(gateway_cidr);
    itx.delete_route(local_subnet, &["proto", "kernel", "scope", "link", "src", gateway]);
    itx.ignore_error();
    itx.set_link(&["up"]);
    itx.add_slave(VLINUXBR);
    itx.commit().await?;

    let mut otx = OvsTransaction::new(runner, BR);
    otx.delete_bridge();
    otx.ignore_error();
    otx.add_bridge(&["fail-mode=secure", "protocols=OpenFlow13"]);
    otx.add_port(
        VXLAN,
        1,
        &["type=vxlan", "options:remote_ip=\"flow\"", "options:key=\"flow\""],
    );
    otx.add_port(TUN, 2, &["type=internal"]);
    otx.add_port(VOVSBR, rendezvous_ofport, &[]);
    otx.commit().await?;

    let mut itx = IpTransaction::new(runner, TUN);
    itx.add_address(gateway_cidr);
    itx.set_link(&["up"]);
    itx.add_route(cluster_network, &["proto", "kernel", "scope", "link"]);
    itx.commit().await?;

    // docker creates its own bridge and will not clean it up
    let mut itx = IpTransaction::new(runner, "docker0");
    itx.set_link(&["down"]);
    itx.ignore_error();
    itx.delete_link();
    itx.ignore_error();
    let _ = itx.commit().await;

    set_sysctl(runner, "net.ipv4.ip_forward", "1").await?;
    set_sysctl(runner, &format!("net.ipv4.conf.{TUN}.forwarding"), "1").await?;

    info!("configured pod network devices, gateway {gateway_cidr}");
    Ok(())
}

pub(super) async fn setup_iptables(
    runner: &dyn CommandRunner,
    cluster_network: &str,
) -> Result<()> {
    let mut tx = IptablesTransaction::new(runner);
    tx.ensure_rule(
        Some("nat"),
        "POSTROUTING",
        &["-s", cluster_network, "!", "-d", cluster_network, "-j", "MASQUERADE"],
    );
    tx.ensure_rule_first(
        None,
        "INPUT",
        &["-p", "udp", "-m", "multiport", "--dports", "4789", "-j", "ACCEPT"],
    );
    tx.ensure_rule_first(None, "INPUT", &["-i", TUN, "-j", "ACCEPT"]);
    tx.ensure_rule(None, "FORWARD", &["-d", cluster_network, "-j", "ACCEPT"]);
    tx.ensure_rule(None, "FORWARD", &["-s", cluster_network, "-j", "ACCEPT"]);
    tx.commit().await
}
