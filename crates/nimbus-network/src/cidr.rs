use crate::error::{NetworkError, Result};
use ipnet::{Ipv4Net, Ipv6Net};
use std::net::{Ipv4Addr, Ipv6Addr};

/// Carve a parent block into `num_networks` contiguous subnets of
/// `network_size` addresses each.
///
/// `network_size` must be a power of two; the subnet prefix length is
/// `32 - log2(network_size)`.
pub fn carve_subnets(
    parent: Ipv4Net,
    num_networks: u32,
    network_size: u32,
) -> Result<Vec<Ipv4Net>> {
    if num_networks == 0 {
        return Err(NetworkError::invalid_network(
            "num_networks must be at least 1",
            "Request one or more networks",
        ));
    }
    if !network_size.is_power_of_two() {
        return Err(NetworkError::invalid_network(
            format!("network_size {} is not a power of two", network_size),
            "Use a subnet size like 16, 128 or 256",
        ));
    }
    let parent_size = 1u64 << (32 - parent.prefix_len());
    let needed = num_networks as u64 * network_size as u64;
    if needed > parent_size {
        return Err(NetworkError::invalid_network(
            format!(
                "{} is too small for {} networks of {} addresses",
                parent, num_networks, network_size
            ),
            "Shrink num_networks/network_size or widen the parent block",
        ));
    }

    let significant_bits = 32 - network_size.trailing_zeros() as u8;
    let base = u32::from(parent.network());
    (0..num_networks)
        .map(|index| {
            let start = base + index * network_size;
            Ipv4Net::new(Ipv4Addr::from(start), significant_bits).map_err(|_| {
                NetworkError::invalid_network(
                    format!("prefix length {} is out of range", significant_bits),
                    "network_size must fit in an IPv4 subnet",
                )
            })
        })
        .collect()
}

/// The `index`-th /64 under a v6 parent block
pub fn subnet_v6(parent: Ipv6Net, index: u32) -> Result<Ipv6Net> {
    if parent.prefix_len() > 64 {
        return Err(NetworkError::invalid_network(
            format!("v6 block {} is narrower than /64", parent),
            "Use a v6 range of /64 or wider",
        ));
    }
    let start = u128::from(parent.network()) + ((index as u128) << 64);
    Ipv6Net::new(Ipv6Addr::from(start), 64).map_err(|_| {
        NetworkError::invalid_network(
            "derived v6 subnet is invalid",
            "Use a v6 range of /64 or wider",
        )
    })
}

/// Address at `offset` within a subnet
pub fn nth(subnet: Ipv4Net, offset: u32) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(subnet.network()) + offset)
}

/// Number of addresses in a subnet
pub fn subnet_len(subnet: Ipv4Net) -> u32 {
    let host_bits = 32 - subnet.prefix_len();
    if host_bits == 32 {
        u32::MAX
    } else {
        1u32 << host_bits
    }
}
