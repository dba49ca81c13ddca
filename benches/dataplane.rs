use criterion::{criterion_group, criterion_main, Criterion, Throughput};

use engine::session::table::SessionTable;
use engine::session::SessionKey;
use lb_core::{
    BalancerConfig, Manager, PacketHandlerConfig, Protocol, Real, Scheduler, SessionsTimeouts,
    StateConfig, VirtualService, VsFlags,
};

fn real(last_octet: u8) -> Real {
    Real {
        ip: std::net::Ipv4Addr::new(40, 0, 0, last_octet).into(),
        weight: 1,
        enable: true,
        src_addr: "9.9.9.9".parse().unwrap(),
        src_mask: "255.255.255.255".parse().unwrap(),
    }
}

fn round_robin_config() -> BalancerConfig {
    BalancerConfig {
        packet_handler: PacketHandlerConfig {
            source_address_v4: "9.9.9.9".parse().unwrap(),
            source_address_v6: "::9".parse().unwrap(),
            decap_addresses: vec![],
            vs: vec![VirtualService {
                addr: "20.20.20.20".parse().unwrap(),
                port: 80,
                proto: Protocol::Tcp,
                scheduler: Scheduler::RoundRobin,
                flags: VsFlags::default(),
                allowed_srcs: vec![],
                reals: vec![real(1), real(2), real(3), real(4)],
                peers: vec![],
            }],
            sessions_timeouts: SessionsTimeouts::default(),
        },
        state: StateConfig::default(),
    }
}

fn tcp_syn(client: u8, port: u16) -> bytes::Bytes {
    use engine::transform::headers::{Ipv4Header, ETHERTYPE_IPV4, IPPROTO_TCP, TCP_FLAG_SYN};
    use engine::packet::{EthernetHeader, ETH_HEADER_LEN};
    use bytes::BytesMut;

    let mut buf = BytesMut::new();
    buf.resize(ETH_HEADER_LEN, 0);
    let eth = EthernetHeader { dst: [1; 6], src: [2; 6], ethertype: ETHERTYPE_IPV4 };
    buf[0..ETH_HEADER_LEN].copy_from_slice(&eth.to_bytes());

    let mut tcp = vec![0u8; 20];
    tcp[0..2].copy_from_slice(&port.to_be_bytes());
    tcp[2..4].copy_from_slice(&80u16.to_be_bytes());
    tcp[12] = 5 << 4;
    tcp[13] = TCP_FLAG_SYN;

    let ip = Ipv4Header {
        tos: 0,
        total_len: (Ipv4Header::LEN + tcp.len()) as u16,
        id: 0,
        flags_frag: 0,
        ttl: 64,
        proto: IPPROTO_TCP,
        checksum: 0,
        src: std::net::Ipv4Addr::new(3, 3, 3, client),
        dst: "20.20.20.20".parse().unwrap(),
    }
    .with_checksum_recomputed();
    buf.extend_from_slice(&ip.to_bytes());
    buf.extend_from_slice(&tcp);
    buf.freeze()
}

fn scheduler_distribution(c: &mut Criterion) {
    let mut group = c.benchmark_group("dataplane");
    group.throughput(Throughput::Elements(1));

    group.bench_function("round_robin_fresh_flow", |bencher| {
        let manager = Manager::standalone(&round_robin_config(), 1).unwrap();
        let mut client = 0u8;
        let mut now = 0u64;
        bencher.iter(|| {
            client = client.wrapping_add(1);
            now += 1;
            let frame = tcp_syn(client, 1000 + client as u16);
            let out = manager.process_frame(frame, 0, now);
            std::hint::black_box(out);
        });
    });

    group.finish();
}

fn session_table_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("session_table");
    group.throughput(Throughput::Elements(1));

    group.bench_function("insert_then_lookup", |bencher| {
        let table = SessionTable::new(16_384, 0.75);
        let mut seq: u64 = 0;
        bencher.iter(|| {
            seq += 1;
            let key = SessionKey {
                client_ip: std::net::Ipv4Addr::from((seq as u32).to_be_bytes()).into(),
                client_port: (seq % 65535) as u16,
                vs_ip: "20.20.20.20".parse().unwrap(),
                vs_port: 80,
                proto: lb_core::Protocol::Tcp,
            };
            let _ = table.insert(key, "40.0.0.1".parse().unwrap(), seq);
            std::hint::black_box(table.lookup(&key, seq));
        });
    });

    group.finish();
}

criterion_group!(benches, scheduler_distribution, session_table_throughput);
criterion_main!(benches);
