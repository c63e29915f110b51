use rand::Rng;

/// Generate a mac address for a vif on an instance.
///
/// The `02:16:3e` OUI marks the address locally administered and
/// unicast; the low 24 bits are random, with the first octet capped so
/// the pattern stays within `00..=7f`.
pub fn generate_mac_address<R: Rng>(rng: &mut R) -> String {
    format!(
        "02:16:3e:{:02x}:{:02x}:{:02x}",
        rng.gen_range(0x00..=0x7f),
        rng.gen::<u8>(),
        rng.gen::<u8>()
    )
}

/// Whether a mac matches the locally-administered pattern vifs use
pub fn is_managed_mac(mac: &str) -> bool {
    let bytes = mac.as_bytes();
    if bytes.len() != 17 || !mac.starts_with("02:16:3e:") {
        return false;
    }
    mac.split(':')
        .all(|part| part.len() == 2 && part.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()))
}
