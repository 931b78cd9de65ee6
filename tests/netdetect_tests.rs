use ipnet::Ipv4Net;
use mfp_scan_rs::error::ScanError;
use mfp_scan_rs::netdetect::{
    dedup_hosts, expand_network, ipv4_to_default_cidr, network_hosts, range_hosts, MAX_RANGE_SPAN,
};
use std::net::Ipv4Addr;

#[test]
fn default_cidr_is_24() {
    let cidr = ipv4_to_default_cidr(Ipv4Addr::new(192, 168, 42, 99));
    assert_eq!(cidr.to_string(), "192.168.42.0/24");
}

#[test]
fn expand_excludes_network_and_broadcast() {
    let net = Ipv4Net::new(Ipv4Addr::new(10, 0, 0, 0), 30).unwrap();
    assert_eq!(
        expand_network(net),
        vec![Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)]
    );
}

#[test]
fn slash_24_has_254_hosts() {
    let hosts = network_hosts("192.168.1.0/24".parse().unwrap()).unwrap();
    assert_eq!(hosts.len(), 254);
    assert_eq!(hosts.first(), Some(&Ipv4Addr::new(192, 168, 1, 1)));
    assert_eq!(hosts.last(), Some(&Ipv4Addr::new(192, 168, 1, 254)));
}

#[test]
fn looser_than_24_is_rejected() {
    for cidr in ["10.0.0.0/23", "10.0.0.0/16", "10.0.0.0/8"] {
        let err = network_hosts(cidr.parse().unwrap()).unwrap_err();
        assert!(matches!(err, ScanError::RangeTooLarge { .. }), "{cidr}");
        assert!(err.is_client_error());
    }
}

#[test]
fn range_is_inclusive_and_ascending() {
    let start = Ipv4Addr::new(10, 0, 0, 250);
    let end = Ipv4Addr::new(10, 0, 1, 5);
    let hosts = range_hosts(start, end).unwrap();
    assert_eq!(hosts.len(), (u32::from(end) - u32::from(start) + 1) as usize);
    assert!(hosts.windows(2).all(|w| u32::from(w[0]) < u32::from(w[1])));
    assert_eq!(hosts[0], start);
    assert_eq!(*hosts.last().unwrap(), end);
}

#[test]
fn range_span_limit() {
    let start = Ipv4Addr::new(10, 0, 0, 0);
    let at_limit = Ipv4Addr::from(u32::from(start) + MAX_RANGE_SPAN);
    assert_eq!(range_hosts(start, at_limit).unwrap().len(), 1001);

    let over = Ipv4Addr::from(u32::from(start) + MAX_RANGE_SPAN + 1);
    let err = range_hosts(start, over).unwrap_err();
    assert!(matches!(
        err,
        ScanError::RangeTooLarge {
            requested: 1002,
            limit: 1001
        }
    ));
}

#[test]
fn dedup_drops_repeats_and_reserved_addresses() {
    let ips = vec![
        Ipv4Addr::new(10, 0, 0, 2),
        Ipv4Addr::new(127, 0, 0, 1),
        Ipv4Addr::new(10, 0, 0, 2),
        Ipv4Addr::new(169, 254, 1, 1),
        Ipv4Addr::new(10, 0, 0, 3),
    ];
    assert_eq!(
        dedup_hosts(ips),
        vec![Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 3)]
    );
}
