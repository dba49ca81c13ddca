//! End-to-end scenarios against a single-worker mock, covering the core
//! paths: allow-through, the source allow-list, round-robin fairness,
//! ICMP echo, ICMP error broadcast, and cross-agent persistence.

mod common;

use lb_core::{
    BackingStore, Manager, PacketHandlerConfig, Protocol, Real, Scheduler, SessionsTimeouts,
    StateConfig, Subnet, VirtualService, VsFlags, VsIdentifier,
};

fn real(ip: &str) -> Real {
    Real {
        ip: ip.parse().unwrap(),
        weight: 1,
        enable: true,
        src_addr: "9.9.9.9".parse().unwrap(),
        src_mask: "255.255.255.255".parse().unwrap(),
    }
}

fn single_vs_config(vs: VirtualService) -> lb_core::BalancerConfig {
    lb_core::BalancerConfig {
        packet_handler: PacketHandlerConfig {
            source_address_v4: "9.9.9.9".parse().unwrap(),
            source_address_v6: "::9".parse().unwrap(),
            decap_addresses: vec![],
            vs: vec![vs],
            sessions_timeouts: SessionsTimeouts::default(),
        },
        state: StateConfig::default(),
    }
}

#[test]
fn basic_allow_through() {
    let vs = VirtualService {
        addr: "1.1.1.1".parse().unwrap(),
        port: 80,
        proto: Protocol::Tcp,
        scheduler: Scheduler::RoundRobin,
        flags: VsFlags::default(),
        allowed_srcs: vec![Subnet { addr: "3.3.3.0".parse().unwrap(), prefix_len: 24 }],
        reals: vec![real("2.2.2.2")],
        peers: vec![],
    };
    let manager = Manager::standalone(&single_vs_config(vs), 1).unwrap();

    let frame = common::tcp_frame(
        "3.3.3.3".parse().unwrap(),
        1000,
        "1.1.1.1".parse().unwrap(),
        80,
        engine::transform::headers::TCP_FLAG_SYN,
    );
    let out = manager.process_frame(frame, 0, 0);
    assert_eq!(out.len(), 1);
    let (_, dst, proto) = common::parse_ipv4(&out[0]);
    assert_eq!(dst, "2.2.2.2".parse::<std::net::Ipv4Addr>().unwrap());
    assert_eq!(proto, engine::transform::headers::IPPROTO_IPIP);

    let info = manager.info(0);
    assert_eq!(info.active_sessions, 1);

    let stats = manager.stats();
    let vs_stats = &stats.vs[0].stats;
    assert_eq!(vs_stats.incoming_packets, 1);
    assert_eq!(vs_stats.outgoing_packets, 1);
}

#[test]
fn source_blocked() {
    let vs = VirtualService {
        addr: "10.10.1.1".parse().unwrap(),
        port: 80,
        proto: Protocol::Tcp,
        scheduler: Scheduler::RoundRobin,
        flags: VsFlags::default(),
        allowed_srcs: vec![Subnet { addr: "10.0.1.0".parse().unwrap(), prefix_len: 24 }],
        reals: vec![real("10.0.2.2")],
        peers: vec![],
    };
    let manager = Manager::standalone(&single_vs_config(vs), 1).unwrap();

    let frame = common::tcp_frame(
        "10.0.99.50".parse().unwrap(),
        12346,
        "10.10.1.1".parse().unwrap(),
        80,
        engine::transform::headers::TCP_FLAG_SYN,
    );
    let out = manager.process_frame(frame, 0, 0);
    assert!(out.is_empty());

    let stats = manager.stats();
    let vs_stats = &stats.vs[0].stats;
    assert_eq!(vs_stats.incoming_packets, 1);
    assert_eq!(vs_stats.outgoing_packets, 0);
    assert_eq!(vs_stats.packet_src_not_allowed, 1);
}

#[test]
fn round_robin_distribution() {
    let vs = VirtualService {
        addr: "20.20.20.20".parse().unwrap(),
        port: 80,
        proto: Protocol::Tcp,
        scheduler: Scheduler::RoundRobin,
        flags: VsFlags::default(),
        allowed_srcs: vec![],
        reals: vec![real("1.0.0.1"), real("1.0.0.2"), real("1.0.0.3")],
        peers: vec![],
    };
    let manager = Manager::standalone(&single_vs_config(vs), 1).unwrap();

    for client in 1u8..=15 {
        let frame = common::tcp_frame(
            std::net::Ipv4Addr::new(3, 3, 3, client),
            1000 + client as u16,
            "20.20.20.20".parse().unwrap(),
            80,
            engine::transform::headers::TCP_FLAG_SYN,
        );
        let out = manager.process_frame(frame, 0, client as u64);
        assert_eq!(out.len(), 1);
    }

    let stats = manager.stats();
    let reals = &stats.vs[0].reals;
    assert_eq!(reals.len(), 3);
    for named in reals {
        assert_eq!(named.stats.packets, 5);
    }
}

#[test]
fn icmp_echo_reply() {
    let vs = VirtualService {
        addr: "10.1.1.1".parse().unwrap(),
        port: 80,
        proto: Protocol::Tcp,
        scheduler: Scheduler::RoundRobin,
        flags: VsFlags::default(),
        allowed_srcs: vec![],
        reals: vec![real("10.2.2.2")],
        peers: vec![],
    };
    let manager = Manager::standalone(&single_vs_config(vs), 1).unwrap();

    let frame = common::icmp_echo_request(
        "10.0.1.1".parse().unwrap(),
        "10.1.1.1".parse().unwrap(),
        1234,
        1,
    );
    let out = manager.process_frame(frame, 0, 0);
    assert_eq!(out.len(), 1);

    let parsed = engine::packet::parse(out[0].clone()).unwrap();
    match parsed.l3 {
        engine::packet::L3Header::V4(h) => {
            assert_eq!(h.src, "10.1.1.1".parse::<std::net::Ipv4Addr>().unwrap());
            assert_eq!(h.dst, "10.0.1.1".parse::<std::net::Ipv4Addr>().unwrap());
            assert_eq!(h.ttl, 64);
        }
        _ => panic!("expected ipv4"),
    }
    let icmp = engine::transform::headers::IcmpHeader::parse(parsed.l4()).unwrap();
    assert_eq!(icmp.icmp_type, engine::transform::headers::ICMP_ECHO_REPLY);
    assert_eq!(icmp.rest_of_header >> 16, 1234);
    assert_eq!(icmp.rest_of_header & 0xFFFF, 1);
}

#[test]
fn icmp_error_broadcast_carries_marker_and_drops_original() {
    let vs = VirtualService {
        addr: "6.6.6.6".parse().unwrap(),
        port: 80,
        proto: Protocol::Tcp,
        scheduler: Scheduler::RoundRobin,
        flags: VsFlags::default(),
        allowed_srcs: vec![],
        reals: vec![real("7.7.7.7")],
        peers: vec!["5.5.5.6".parse().unwrap(), "5.5.5.7".parse().unwrap()],
    };
    let manager = Manager::standalone(&single_vs_config(vs), 1).unwrap();

    let frame = common::icmp_dest_unreachable_embedding_tcp(
        "9.9.9.9".parse().unwrap(),
        "3.3.3.3".parse().unwrap(),
        1111,
        "6.6.6.6".parse().unwrap(),
        80,
    );
    let out = manager.process_frame(frame, 0, 0);
    assert_eq!(out.len(), 2);

    let mut seen_peers = std::collections::HashSet::new();
    for clone in &out {
        let outer = engine::packet::parse(clone.clone()).unwrap();
        let (outer_dst, marker_id) = match outer.l3 {
            engine::packet::L3Header::V4(h) => {
                let (_inner_l3, offset) = engine::packet::parse_embedded(outer.l4()).unwrap();
                let inner_icmp =
                    engine::transform::headers::IcmpHeader::parse(&outer.l4()[offset..]).unwrap();
                (h.dst, inner_icmp.identifier())
            }
            _ => panic!("expected ipv4 outer header"),
        };
        assert_eq!(marker_id, 0x0BDC);
        seen_peers.insert(outer_dst);
    }
    assert_eq!(seen_peers.len(), 2);
    assert!(seen_peers.contains(&"5.5.5.6".parse::<std::net::Ipv4Addr>().unwrap()));
    assert!(seen_peers.contains(&"5.5.5.7".parse::<std::net::Ipv4Addr>().unwrap()));
}

#[test]
fn tunneled_icmp_error_with_marker_is_decapsulated_and_dropped() {
    let vs = VirtualService {
        addr: "6.6.6.6".parse().unwrap(),
        port: 80,
        proto: Protocol::Tcp,
        scheduler: Scheduler::RoundRobin,
        flags: VsFlags::default(),
        allowed_srcs: vec![],
        reals: vec![real("7.7.7.7")],
        peers: vec!["5.5.5.6".parse().unwrap(), "5.5.5.7".parse().unwrap()],
    };
    let mut config = single_vs_config(vs);
    config.packet_handler.decap_addresses = vec!["50.50.50.50".parse().unwrap()];
    let manager = Manager::standalone(&config, 1).unwrap();

    let reported = common::icmp_dest_unreachable_embedding_tcp(
        "9.9.9.9".parse().unwrap(),
        "3.3.3.3".parse().unwrap(),
        1111,
        "6.6.6.6".parse().unwrap(),
        80,
    );
    let parsed = engine::packet::parse(reported).unwrap();
    let marked = engine::icmp::with_broadcast_marker(&parsed).unwrap();
    let tunneled = common::wrap_in_ipip(
        &marked,
        "4.4.4.4".parse().unwrap(),
        "50.50.50.50".parse().unwrap(),
    );

    let out = manager.process_frame(tunneled, 0, 0);
    assert!(out.is_empty());

    let stats = manager.stats();
    assert_eq!(stats.icmpv4.packet_clones_received, 1);
    assert_eq!(stats.icmpv4.broadcasted_packets, 0);
}

#[test]
fn cross_agent_persistence() {
    let vs2 = VirtualService {
        addr: "30.30.30.2".parse().unwrap(),
        port: 80,
        proto: Protocol::Tcp,
        scheduler: Scheduler::RoundRobin,
        flags: VsFlags::default(),
        allowed_srcs: vec![],
        reals: vec![real("40.40.40.2")],
        peers: vec![],
    };
    let vs3 = VirtualService {
        addr: "30.30.30.3".parse().unwrap(),
        port: 80,
        proto: Protocol::Tcp,
        scheduler: Scheduler::RoundRobin,
        flags: VsFlags::default(),
        allowed_srcs: vec![],
        reals: vec![real("40.40.40.3")],
        peers: vec![],
    };
    let config = lb_core::BalancerConfig {
        packet_handler: PacketHandlerConfig {
            source_address_v4: "9.9.9.9".parse().unwrap(),
            source_address_v6: "::9".parse().unwrap(),
            decap_addresses: vec![],
            vs: vec![vs2, vs3],
            sessions_timeouts: SessionsTimeouts::default(),
        },
        state: StateConfig::default(),
    };

    let store = BackingStore::new();
    let manager1 = Manager::create(&store, "lb-fleet", &config, 1).unwrap();

    for client in 1u8..=3 {
        let frame = common::tcp_frame(
            std::net::Ipv4Addr::new(50, 50, 50, client),
            2000 + client as u16,
            "30.30.30.2".parse().unwrap(),
            80,
            engine::transform::headers::TCP_FLAG_SYN,
        );
        manager1.process_frame(frame, 0, 0);
    }
    for client in 1u8..=2 {
        let frame = common::tcp_frame(
            std::net::Ipv4Addr::new(60, 60, 60, client),
            3000 + client as u16,
            "30.30.30.3".parse().unwrap(),
            80,
            engine::transform::headers::TCP_FLAG_SYN,
        );
        manager1.process_frame(frame, 0, 0);
    }

    let vs2_id = VsIdentifier::new("30.30.30.2".parse().unwrap(), 80, Protocol::Tcp);
    let vs3_id = VsIdentifier::new("30.30.30.3".parse().unwrap(), 80, Protocol::Tcp);

    let manager2 = Manager::attach(&store, "lb-fleet").unwrap();
    let info_before = manager2.info(0);
    assert_eq!(info_before.active_sessions, 5);
    assert_eq!(info_before.vs.iter().find(|v| v.id == vs2_id).unwrap().active_sessions, 3);
    assert_eq!(info_before.vs.iter().find(|v| v.id == vs3_id).unwrap().active_sessions, 2);
    assert_eq!(manager1.info(0).active_sessions, info_before.active_sessions);

    for client in 10u8..=11 {
        let frame = common::tcp_frame(
            std::net::Ipv4Addr::new(50, 50, 50, client),
            4000 + client as u16,
            "30.30.30.2".parse().unwrap(),
            80,
            engine::transform::headers::TCP_FLAG_SYN,
        );
        manager2.process_frame(frame, 0, 0);
    }

    let info_after = manager1.info(0);
    assert_eq!(info_after.active_sessions, 7);
    assert_eq!(info_after.vs.iter().find(|v| v.id == vs2_id).unwrap().active_sessions, 5);
    assert_eq!(info_after.vs.iter().find(|v| v.id == vs3_id).unwrap().active_sessions, 2);
}
