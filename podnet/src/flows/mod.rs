//! Per-node datapath programming. The two controllers translate cluster
//! state into OVS flow tables: `singletenant` is a flat table with
//! per-node forwarding, `multitenant` adds VNID tagging and tenant
//! isolation across an eight-table pipeline.

mod devices;
pub mod multitenant;
pub mod singletenant;

use std::net::Ipv4Addr;

use async_trait::async_trait;
use ipnetwork::Ipv4Network;

pub use multitenant::MultiTenantFlows;
pub use singletenant::SingleTenantFlows;

use crate::registry::Service;
use crate::{Error, Result};

pub const BR: &str = "br0";
pub const LBR: &str = "lbr0";
pub const TUN: &str = "tun0";
pub const VLINUXBR: &str = "vlinuxbr";
pub const VOVSBR: &str = "vovsbr";
pub const VXLAN: &str = "vxlan0";

/// Brings local datapath state in line with cluster state. All methods
/// are idempotent; `setup` returns whether it actually reprogrammed the
/// datapath (false when the idempotence gate found prior state).
#[async_trait]
pub trait FlowController: Send + Sync {
    async fn setup(
        &self,
        local_subnet: &str,
        cluster_network: &str,
        services_network: &str,
        mtu: u32,
    ) -> Result<bool>;

    /// Installs the forwarding rules for one node's subnet.
    async fn add_of_rules(
        &self,
        node_ip: Ipv4Addr,
        node_subnet: &str,
        local_ip: Ipv4Addr,
    ) -> Result<()>;

    /// Removes exactly the rules installed for one node, by cookie.
    async fn del_of_rules(&self, node_ip: Ipv4Addr, local_ip: Ipv4Addr) -> Result<()>;

    async fn add_service_rules(&self, service: &Service, vnid: u32) -> Result<()>;

    async fn del_service_rules(&self, service: &Service) -> Result<()>;

    /// Re-runs the CNI update for a pod so its flows carry the given VNID.
    async fn update_pod(
        &self,
        namespace: &str,
        pod: &str,
        container_id: &str,
        vnid: u32,
    ) -> Result<()>;
}

/// Per-node flow cookie: the full node IP, eight hex digits. Deleting
/// with `cookie=0x<hex>/0xffffffff` then affects exactly that node's
/// rules.
pub fn generate_cookie(ip: Ipv4Addr) -> String {
    let octets = ip.octets();
    format!(
        "{:02x}{:02x}{:02x}{:02x}",
        octets[0], octets[1], octets[2], octets[3]
    )
}

pub(crate) fn parse_subnet(cidr: &str) -> Result<Ipv4Network> {
    cidr.parse()
        .map_err(|_| Error::InvalidCidr(cidr.to_owned()))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_generate_cookie_full_ip() {
        assert_eq!(generate_cookie(Ipv4Addr::new(10, 1, 2, 3)), "0a010203");
        assert_eq!(generate_cookie(Ipv4Addr::new(192, 168, 0, 255)), "c0a800ff");
    }

    #[test]
    fn test_cookies_unique_per_ip() {
        // the old first-byte-of-md5 scheme collided; full IPs cannot
        let a = generate_cookie(Ipv4Addr::new(10, 1, 0, 1));
        let b = generate_cookie(Ipv4Addr::new(10, 1, 0, 2));
        assert_ne!(a, b);
        assert_eq!(a.len(), 8);
        assert_eq!(b.len(), 8);
    }
}
