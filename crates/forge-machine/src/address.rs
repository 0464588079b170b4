//! Home-network address selection.

use std::net::IpAddr;

use tracing::debug;

use forge_core::HomeNetwork;

/// Parse reported address strings, dropping anything unparseable.
///
/// Link-local IPv6 addresses may carry a `%iface` zone suffix, which is
/// stripped.
pub fn parse_addresses<S: AsRef<str>>(raw: &[S]) -> Vec<IpAddr> {
    raw.iter()
        .filter_map(|s| {
            let s = s.as_ref();
            let bare = s.split('%').next().unwrap_or(s);
            match bare.parse() {
                Ok(ip) => Some(ip),
                Err(_) => {
                    debug!(address = %s, "ignoring unparseable address");
                    None
                }
            }
        })
        .collect()
}

/// IPv4 before IPv6, then ascending within a family.
pub fn sort_addresses(addresses: &mut [IpAddr]) {
    addresses.sort_by_key(|ip| (ip.is_ipv6(), *ip));
}

/// First address, in sorted order, inside any home network.
pub fn select_home_address(addresses: &[IpAddr], home: &[HomeNetwork]) -> Option<IpAddr> {
    let mut sorted = addresses.to_vec();
    sort_addresses(&mut sorted);
    sorted
        .into_iter()
        .find(|ip| home.iter().any(|net| net.contains(*ip)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn home() -> Vec<HomeNetwork> {
        vec![
            "192.168.1.0/24".parse().unwrap(),
            "2001:67c:2190:1506::/64".parse().unwrap(),
        ]
    }

    #[test]
    fn parses_and_strips_zone() {
        let parsed = parse_addresses(&["10.0.0.1", "fe80::1%eth0", "garbage"]);
        assert_eq!(
            parsed,
            vec!["10.0.0.1".parse::<IpAddr>().unwrap(), "fe80::1".parse().unwrap()]
        );
    }

    #[test]
    fn ipv4_sorts_before_ipv6() {
        let mut addrs = parse_addresses(&["2001:67c:2190:1506::5", "192.168.1.9", "10.0.0.1"]);
        sort_addresses(&mut addrs);
        assert_eq!(addrs[0], "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(addrs[1], "192.168.1.9".parse::<IpAddr>().unwrap());
        assert!(addrs[2].is_ipv6());
    }

    #[test]
    fn picks_first_home_address() {
        let addrs = parse_addresses(&[
            "127.0.0.1",
            "192.168.1.77",
            "192.168.1.12",
            "2001:67c:2190:1506::5",
        ]);
        assert_eq!(
            select_home_address(&addrs, &home()),
            Some("192.168.1.12".parse().unwrap())
        );
    }

    #[test]
    fn falls_back_to_ipv6_home() {
        let addrs = parse_addresses(&["10.0.0.1", "2001:67c:2190:1506::5", "fe80::1"]);
        assert_eq!(
            select_home_address(&addrs, &home()),
            Some("2001:67c:2190:1506::5".parse().unwrap())
        );
    }

    #[test]
    fn no_home_address() {
        let addrs = parse_addresses(&["10.0.0.1", "127.0.0.1"]);
        assert_eq!(select_home_address(&addrs, &home()), None);
    }
}
