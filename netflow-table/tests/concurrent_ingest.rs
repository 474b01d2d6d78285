use std::thread;

use netflow_table::{
    FlowKey, FlowTable, Ingest, Ipv4Header, TableConfig, TcpHeader, dump, export_to_file,
    render_csv, stats,
};
use netflow_table_common::{IPPROTO_TCP, IPPROTO_UDP, TCP_ACK, TCP_FIN, TCP_PSH, TCP_SYN};

const WORKERS: usize = 8;

fn addr(a: u8, b: u8, c: u8, d: u8) -> u32 {
    u32::from_be_bytes([a, b, c, d])
}

#[test]
fn same_flow_from_many_workers_loses_no_update() {
    const PER_WORKER: u64 = 20_000;
    let table = FlowTable::create(TableConfig::with_entries(64), None, 0).unwrap();
    let key = FlowKey::new(addr(10, 0, 0, 1), addr(10, 0, 0, 2), 1234, 80, IPPROTO_TCP);

    thread::scope(|s| {
        for worker in 0..WORKERS {
            let table = &table;
            s.spawn(move || {
                let tcp = TcpHeader::new([TCP_SYN, TCP_ACK, TCP_PSH, TCP_FIN][worker % 4]);
                for _ in 0..PER_WORKER {
                    table.entry_add(&key, &Ipv4Header::new(0, 64), Some(&tcp)).unwrap();
                }
            });
        }
    });

    let total = WORKERS as u64 * PER_WORKER;
    let rec = table.lookup(&key).unwrap();
    assert_eq!(rec.packets_sent, total);
    assert_eq!(rec.bytes_sent, total * 64);
    assert_eq!(rec.tcp_flags, TCP_SYN | TCP_ACK | TCP_PSH | TCP_FIN);
    assert_eq!(stats(&table).flows, 1);
    // quiescent now, so the best-effort counter has caught up
    assert_eq!(table.packet_count(), total);
}

#[test]
fn overlapping_flows_on_a_tiny_table_stay_isolated() {
    const FLOWS: u16 = 200;
    const ROUNDS: u64 = 50;
    // every flow shares one of two slots, so chains are long and contended
    let table = FlowTable::create(TableConfig::with_entries(2), None, 0).unwrap();
    let (src, dst) = (addr(192, 168, 0, 1), addr(192, 168, 0, 2));

    thread::scope(|s| {
        for _ in 0..WORKERS {
            let table = &table;
            s.spawn(move || {
                for _ in 0..ROUNDS {
                    for port in 0..FLOWS {
                        let key = FlowKey::new(src, dst, port, 53, IPPROTO_UDP);
                        let ip = Ipv4Header::new(0, 100 + port);
                        table.entry_add(&key, &ip, None).unwrap();
                    }
                }
            });
        }
    });

    let per_flow = WORKERS as u64 * ROUNDS;
    for port in 0..FLOWS {
        let key = FlowKey::new(src, dst, port, 53, IPPROTO_UDP);
        let rec = table.lookup(&key).unwrap();
        assert_eq!(rec.packets_sent, per_flow, "port {port}");
        assert_eq!(rec.bytes_sent, per_flow * (100 + port as u64), "port {port}");
    }

    let s = stats(&table);
    assert_eq!(s.flows, FLOWS as u64);
    assert!(s.occupied_slots <= 2);
    assert_eq!(dump(&table).len(), FLOWS as usize);
}

#[test]
fn exactly_one_worker_creates_each_flow() {
    let table = FlowTable::create(TableConfig::with_entries(16), None, 0).unwrap();
    let key = FlowKey::new(addr(1, 1, 1, 1), addr(2, 2, 2, 2), 40000, 443, IPPROTO_TCP);

    let created: usize = thread::scope(|s| {
        let handles: Vec<_> = (0..WORKERS)
            .map(|_| {
                let table = &table;
                s.spawn(move || {
                    let ip = Ipv4Header::new(0, 1);
                    let outcomes = (0..100).map(|_| table.entry_add(&key, &ip, None).unwrap());
                    outcomes.filter(|o| *o == Ingest::Created).count()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).sum()
    });

    assert_eq!(created, 1);
}

#[test]
fn export_during_ingest_never_tears_the_destination() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("flows.csv");
    let table = FlowTable::create(TableConfig::with_entries(256), None, 0).unwrap();

    thread::scope(|s| {
        for worker in 0..4u32 {
            let table = &table;
            s.spawn(move || {
                let src = addr(10, 1, 0, worker as u8);
                for i in 0..5_000u32 {
                    let key = FlowKey::new(src, 0x0a00_0000 | (i % 500), 1000, 80, IPPROTO_TCP);
                    table.entry_add(&key, &Ipv4Header::new(0, 40), None).unwrap();
                }
            });
        }
        let table = &table;
        let path = &path;
        s.spawn(move || {
            for _ in 0..20 {
                export_to_file(table, path).unwrap();
                let content = std::fs::read_to_string(path).unwrap();
                for line in content.lines() {
                    assert_eq!(line.split(',').count(), 7, "torn line {line:?}");
                }
            }
        });
    });

    // quiescent: export and stats agree exactly
    let before = stats(&table);
    let summary = export_to_file(&table, &path).unwrap();
    assert_eq!(summary.flows, before.flows);
    assert_eq!(before.flows, 4 * 500);

    let content = std::fs::read_to_string(&path).unwrap();
    let (bytes, packets) = content.lines().fold((0u64, 0u64), |(b, p), line| {
        let fields: Vec<&str> = line.split(',').collect();
        (
            b + fields[5].parse::<u64>().unwrap(),
            p + fields[6].parse::<u64>().unwrap(),
        )
    });
    assert_eq!(bytes, before.bytes);
    assert_eq!(packets, before.packets);
    assert_eq!(render_csv(&table).unwrap(), content.into_bytes());
}
