//! OVN's convention for deriving a deterministic MAC from an IPv4 address:
//! the locally-administered prefix `0a:58:` followed by the address octets.

use std::net::Ipv4Addr;

pub fn derive_mac(ip: Ipv4Addr) -> String {
    let o = ip.octets();
    format!(
        "0a:58:{:02x}:{:02x}:{:02x}:{:02x}",
        o[0], o[1], o[2], o[3]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_known_mac() {
        assert_eq!(
            derive_mac("10.244.1.2".parse().unwrap()),
            "0a:58:0a:f4:01:02"
        );
    }

    #[test]
    fn derives_zero_address() {
        assert_eq!(derive_mac(Ipv4Addr::UNSPECIFIED), "0a:58:00:00:00:00");
    }
}
