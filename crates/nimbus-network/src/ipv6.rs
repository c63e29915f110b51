use crate::error::{NetworkError, Result};
use ipnet::Ipv6Net;
use std::net::Ipv6Addr;

/// Derive an instance's global v6 address from its network prefix and
/// mac address (modified EUI-64: flip the universal/local bit, insert
/// ff:fe between the OUI and the NIC bits).
///
/// No allocation step is involved; the same inputs always produce the
/// same address. The project id is accepted for contract compatibility
/// and does not participate in the derivation.
pub fn to_global(prefix: Ipv6Net, mac: &str, _project_id: &str) -> Result<Ipv6Addr> {
    let octets = parse_mac(mac)?;
    let interface_id: u64 = ((octets[0] ^ 0x02) as u64) << 56
        | (octets[1] as u64) << 48
        | (octets[2] as u64) << 40
        | 0xff_u64 << 32
        | 0xfe_u64 << 24
        | (octets[3] as u64) << 16
        | (octets[4] as u64) << 8
        | octets[5] as u64;
    let address = (u128::from(prefix.network()) & !0xffff_ffff_ffff_ffffu128)
        | interface_id as u128;
    Ok(Ipv6Addr::from(address))
}

fn parse_mac(mac: &str) -> Result<[u8; 6]> {
    let mut octets = [0u8; 6];
    let parts: Vec<&str> = mac.split(':').collect();
    if parts.len() != 6 {
        return Err(NetworkError::invalid_network(
            format!("malformed mac address '{}'", mac),
            "Expected six colon-separated hex octets",
        ));
    }
    for (slot, part) in octets.iter_mut().zip(parts) {
        *slot = u8::from_str_radix(part, 16).map_err(|_| {
            NetworkError::invalid_network(
                format!("malformed mac address '{}'", mac),
                "Expected six colon-separated hex octets",
            )
        })?;
    }
    Ok(octets)
}
