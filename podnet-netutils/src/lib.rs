pub mod subnets;

use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs};

use ipnetwork::Ipv4Network;
use thiserror::Error;

pub use subnets::SubnetAllocator;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid network {0:?}")]
    InvalidNetwork(String),

    #[error("host bits must be between 1 and {max} for network {network}")]
    InvalidHostBits { network: String, max: u32 },

    #[error("no subnets available")]
    Exhausted,

    #[error("failed to obtain IP address for node {0:?}")]
    NodeResolution(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub fn ip_to_u32(ip: Ipv4Addr) -> u32 {
    u32::from_be_bytes(ip.octets())
}

pub fn u32_to_ip(u: u32) -> Ipv4Addr {
    Ipv4Addr::from(u.to_be_bytes())
}

/// The default gateway of a node subnet is its network address with the
/// low bit set, e.g. 10.1.2.0/24 -> 10.1.2.1.
pub fn generate_default_gateway(subnet: Ipv4Network) -> Ipv4Addr {
    u32_to_ip(ip_to_u32(subnet.network()) | 0x1)
}

/// Resolve a node name to an IPv4 address. IP literals pass through;
/// hostnames resolve to the first non-loopback IPv4 address.
pub fn node_ip(node_name: &str) -> Result<Ipv4Addr> {
    if let Ok(ip) = node_name.parse::<Ipv4Addr>() {
        return Ok(ip);
    }

    let addrs = (node_name, 0)
        .to_socket_addrs()
        .map_err(|_| Error::NodeResolution(node_name.to_owned()))?;
    for addr in addrs {
        if let IpAddr::V4(ip) = addr.ip()
            && !ip.is_loopback()
        {
            return Ok(ip);
        }
    }
    Err(Error::NodeResolution(node_name.to_owned()))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_generate_default_gateway() {
        let sn: Ipv4Network = "10.1.2.0/24".parse().unwrap();
        assert_eq!(generate_default_gateway(sn), Ipv4Addr::new(10, 1, 2, 1));

        let sn: Ipv4Network = "10.0.8.0/22".parse().unwrap();
        assert_eq!(generate_default_gateway(sn), Ipv4Addr::new(10, 0, 8, 1));
    }

    #[test]
    fn test_ip_u32_round_trip() {
        let ip = Ipv4Addr::new(192, 168, 12, 7);
        assert_eq!(u32_to_ip(ip_to_u32(ip)), ip);
        assert_eq!(ip_to_u32(Ipv4Addr::new(10, 0, 0, 0)), 0x0a00_0000);
    }

    #[test]
    fn test_node_ip_literal() {
        assert_eq!(node_ip("10.20.30.40").unwrap(), Ipv4Addr::new(10, 20, 30, 40));
    }

    #[test]
    fn test_node_ip_unresolvable() {
        assert!(node_ip("no-such-host.invalid").is_err());
    }
}
