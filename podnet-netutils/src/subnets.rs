use std::collections::HashSet;
use std::sync::Mutex;

use ipnetwork::Ipv4Network;
use tracing::warn;

use crate::{Error, Result, ip_to_u32, u32_to_ip};

/// Hands out non-overlapping fixed-width subnets of a cluster network.
///
/// Candidate subnets are enumerated by a wrapping counter. When the subnet
/// field of the address straddles an octet boundary, the counter bits are
/// rotated so that the subnets with all zeroes in the shared octet are used
/// first: with network 10.1.0.0/16 and 6 host bits the sequence runs
/// 10.1.0.0/26, 10.1.1.0/26, ... 10.1.255.0/26, 10.1.0.64/26, ...
pub struct SubnetAllocator {
    network: Ipv4Network,
    host_bits: u32,
    left_shift: u32,
    left_mask: u32,
    right_shift: u32,
    right_mask: u32,
    inner: Mutex<Inner>,
}

struct Inner {
    next: u32,
    in_use: HashSet<Ipv4Network>,
}

impl SubnetAllocator {
    pub fn new(network: &str, host_bits: u32, in_use: &[String]) -> Result<Self> {
        let network: Ipv4Network = network
            .parse()
            .map_err(|_| Error::InvalidNetwork(network.to_owned()))?;
        let network = normalize(network);

        let net_mask_size = u32::from(network.prefix());
        if host_bits == 0 || host_bits >= 32u32.saturating_sub(net_mask_size) {
            return Err(Error::InvalidHostBits {
                network: network.to_string(),
                max: 31u32.saturating_sub(net_mask_size),
            });
        }
        let subnet_bits = 32 - net_mask_size - host_bits;

        let crosses_octet =
            host_bits % 8 != 0 && (host_bits - 1) / 8 != (host_bits + subnet_bits - 1) / 8;
        let (left_shift, left_mask, right_shift, right_mask) = if crosses_octet {
            let left_shift = 8 - host_bits % 8;
            let left_mask = 1u32
                .checked_shl(32 - net_mask_size)
                .map_or(u32::MAX, |v| v - 1);
            (
                left_shift,
                left_mask,
                subnet_bits - left_shift,
                ((1u32 << left_shift) - 1) << host_bits,
            )
        } else {
            (0, u32::MAX, 0, 0)
        };

        let mut set = HashSet::new();
        for entry in in_use {
            let Ok(sub) = entry.parse::<Ipv4Network>() else {
                warn!("skipping malformed in-use subnet {entry:?}");
                continue;
            };
            let sub = normalize(sub);
            if !network.contains(sub.network()) {
                warn!("skipping in-use subnet {sub} outside network {network}");
                continue;
            }
            set.insert(sub);
        }

        Ok(Self {
            network,
            host_bits,
            left_shift,
            left_mask,
            right_shift,
            right_mask,
            inner: Mutex::new(Inner {
                next: 0,
                in_use: set,
            }),
        })
    }

    /// Returns the next free subnet, spreading successive allocations
    /// across the network. Allocation order is deterministic given the
    /// initial in-use set.
    pub fn get_network(&self) -> Result<Ipv4Network> {
        let mut inner = self.inner.lock().unwrap();

        let base = ip_to_u32(self.network.network());
        let net_mask_size = u32::from(self.network.prefix());
        let subnet_bits = 32 - net_mask_size - self.host_bits;
        let num_subnets = 1u32 << subnet_bits;
        let prefix = (net_mask_size + subnet_bits) as u8;

        for i in 0..num_subnets {
            let n = (i.wrapping_add(inner.next)) % num_subnets;
            let shifted = n << self.host_bits;
            let addr = base
                | ((shifted << self.left_shift) & self.left_mask)
                | ((shifted >> self.right_shift) & self.right_mask);
            let candidate = Ipv4Network::new(u32_to_ip(addr), prefix)
                .expect("prefix bounded by 32");
            if !inner.in_use.contains(&candidate) {
                inner.in_use.insert(candidate);
                inner.next = n.wrapping_add(1) % num_subnets;
                return Ok(candidate);
            }
        }

        Err(Error::Exhausted)
    }

    /// Returns a subnet to the pool. Releasing a subnet that was never
    /// allocated is a no-op.
    pub fn release_network(&self, subnet: Ipv4Network) {
        let mut inner = self.inner.lock().unwrap();
        inner.in_use.remove(&normalize(subnet));
    }
}

fn normalize(net: Ipv4Network) -> Ipv4Network {
    Ipv4Network::new(net.network(), net.prefix()).expect("prefix unchanged")
}
