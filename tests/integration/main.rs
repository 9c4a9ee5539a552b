//! Myco integration harness.
//!
//! Drives whole fleets of in-process nodes through the public engine API:
//! tick, drain the outbox, route every packet through a switchboard that
//! plays transport. No sockets, no sleeps — the clock is injected, so every
//! scenario is deterministic and fast.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use myco_core::compress;
use myco_core::digest::{self, Entry, MAX_DIGEST_ENTRIES, SECTION_DELTA};
use myco_core::hlc;
use myco_core::node::DEPLOY_PAYLOAD_LEN;
use myco_core::packet::MAX_PAYLOAD;
use myco_core::{
    Executor, MsgType, NoAuth, Node, NodeOptions, NodeStorage, Packet, PacketAuth, ServiceRecord,
};

// ── Harness ───────────────────────────────────────────────────────────────────

const START_MS: u64 = 1_700_000_000_000;

fn fixed_clock() -> u64 {
    START_MS
}

/// Executor that counts invocations per service id and keeps the last
/// record it saw, behind shared handles the test can inspect.
#[derive(Clone, Default)]
struct Counting {
    counts: Arc<Mutex<HashMap<u64, u32>>>,
    last: Arc<Mutex<HashMap<u64, ServiceRecord>>>,
}

impl Counting {
    fn count(&self, id: u64) -> u32 {
        *self.counts.lock().unwrap().get(&id).unwrap_or(&0)
    }

    fn last_record(&self, id: u64) -> Option<ServiceRecord> {
        self.last.lock().unwrap().get(&id).copied()
    }
}

impl Executor for Counting {
    type Error = Infallible;

    fn deploy(&mut self, record: ServiceRecord) -> Result<(), Self::Error> {
        let id = record.service_id();
        *self.counts.lock().unwrap().entry(id).or_insert(0) += 1;
        self.last.lock().unwrap().insert(id, record);
        Ok(())
    }
}

struct SimNode {
    node: Node<Counting, NoAuth>,
    executed: Counting,
    key: [u8; 32],
}

fn mk_node(id: u16) -> SimNode {
    let executed = Counting::default();
    let node = Node::init(
        id,
        NodeStorage::new_boxed(),
        vec![0u8; 8 * 1024].into_boxed_slice(),
        executed.clone(),
        NoAuth,
        NodeOptions {
            clock: fixed_clock,
            ..NodeOptions::default()
        },
    )
    .expect("node init");
    let key = node.public_key();
    SimNode { node, executed, key }
}

/// A fully meshed fleet with injected membership.
fn mk_fleet(n: u16) -> Vec<SimNode> {
    let mut fleet: Vec<SimNode> = (1..=n).map(mk_node).collect();
    let keys: Vec<[u8; 32]> = fleet.iter().map(|s| s.key).collect();
    for sim in &mut fleet {
        sim.node.set_peers(&keys);
    }
    fleet
}

/// Deliver every packet in every outbox, then tick every node once.
/// Broadcasts go to all other nodes, targeted packets to their recipient.
fn route_and_tick(fleet: &mut [SimNode]) {
    let keys: Vec<[u8; 32]> = fleet.iter().map(|s| s.key).collect();
    let mut inboxes: Vec<Vec<Packet>> = vec![Vec::new(); fleet.len()];
    for (i, sim) in fleet.iter().enumerate() {
        for out in sim.node.outbox() {
            match out.recipient {
                Some(pk) => {
                    if let Some(j) = keys.iter().position(|k| *k == pk) {
                        inboxes[j].push(out.packet.clone());
                    }
                }
                None => {
                    for j in 0..fleet.len() {
                        if j != i {
                            inboxes[j].push(out.packet.clone());
                        }
                    }
                }
            }
        }
    }
    for (sim, inbox) in fleet.iter_mut().zip(inboxes) {
        sim.node.tick(&inbox);
    }
}

fn record(id: u64, name: &str) -> ServiceRecord {
    ServiceRecord::new(id, name, "github:example/hello", "run").expect("record")
}

/// True once every node holds every expected (id, version) with a record.
fn converged(fleet: &[SimNode], expected: &HashMap<u64, u64>) -> bool {
    fleet.iter().all(|sim| {
        expected.iter().all(|(&id, &version)| {
            sim.node.registry().version_of(id) == version && sim.node.store().get(id).is_some()
        })
    })
}

fn decode_section(pkt: &Packet, kind: u8) -> Vec<Entry> {
    let mut scratch = [0u8; MAX_PAYLOAD];
    let data: &[u8] = if pkt.is_compressed() {
        let n = compress::decompress(pkt.payload_bytes(), &mut scratch).expect("decompress");
        &scratch[..n]
    } else {
        pkt.payload_bytes()
    };
    let mut out = [Entry::default(); MAX_DIGEST_ENTRIES];
    for section in digest::Sections::new(data) {
        let (k, body) = section.expect("well-formed section");
        if k == kind {
            let n = digest::decode_columnar(body, &mut out).expect("columnar body");
            return out[..n].to_vec();
        }
    }
    Vec::new()
}

// ══════════════════════════════════════════════════════════════════════════════
//  Single node
// ══════════════════════════════════════════════════════════════════════════════

/// A lone node announces its injected service and runs the executor once.
#[test]
fn single_node_deploy() {
    let mut sim = mk_node(1);
    let rec = ServiceRecord::new(42, "hello", "github:example/hello", "run").unwrap();
    assert!(sim.node.inject_service(rec).unwrap());

    sim.node.tick(&[]);
    let outbox = sim.node.outbox();
    assert_eq!(outbox.len(), 1);
    assert_eq!(outbox[0].packet.msg_type, MsgType::Sync as u8);

    let delta = decode_section(&outbox[0].packet, SECTION_DELTA);
    assert_eq!(delta.len(), 1);
    assert_eq!(delta[0].id, 42);
    assert!(delta[0].version >> 16 >= START_MS, "wall must be current");

    assert_eq!(sim.executed.count(42), 1);
    assert_eq!(sim.executed.last_record(42).unwrap().name_str(), "hello");
}

// ══════════════════════════════════════════════════════════════════════════════
//  Two nodes
// ══════════════════════════════════════════════════════════════════════════════

/// The literal advertise → request → deploy ferry between two nodes.
#[test]
fn two_node_converge() {
    let mut a = mk_node(1);
    let mut b = mk_node(2);

    assert!(a.node.inject_service(record(7, "seven")).unwrap());
    a.node.tick(&[]);
    let sync = a.node.outbox()[0].packet.clone();
    assert_eq!(sync.msg_type, MsgType::Sync as u8);
    let v1 = a.node.registry().version_of(7);

    // Deliver A's Sync to B; B asks A for the record.
    b.node.tick(&[sync]);
    let request = b
        .node
        .outbox()
        .iter()
        .find(|o| o.packet.msg_type == MsgType::Request as u8)
        .expect("B must request the advertised id")
        .clone();
    assert_eq!(request.recipient, Some(a.key));

    // Deliver B's Request to A; A replies with a targeted Deploy.
    a.node.tick(&[request.packet]);
    let deploy = a
        .node
        .outbox()
        .iter()
        .find(|o| o.packet.msg_type == MsgType::Deploy as u8)
        .expect("A must answer the request")
        .clone();
    assert_eq!(deploy.recipient, Some(b.key));

    // Deliver A's Deploy to B; B accepts.
    b.node.tick(&[deploy.packet]);
    assert_eq!(b.node.registry().version_of(7), v1);
    assert_eq!(b.node.store().get(7).unwrap().name_str(), "seven");
    assert_eq!(b.executed.count(7), 1, "executor exactly once on B");
}

/// A later local write on B overwrites A's earlier record everywhere.
#[test]
fn newer_version_wins_everywhere() {
    let mut fleet = mk_fleet(2);
    assert!(fleet[0].node.inject_service(record(99, "one")).unwrap());

    let mut expected = HashMap::new();
    expected.insert(99, fleet[0].node.registry().version_of(99));
    for _ in 0..20 {
        route_and_tick(&mut fleet);
        if converged(&fleet, &expected) {
            break;
        }
    }
    assert!(converged(&fleet, &expected), "first record must spread");

    // B has observed A's version, so its next write sorts strictly after.
    assert!(fleet[1].node.inject_service(record(99, "two")).unwrap());
    let v2 = fleet[1].node.registry().version_of(99);
    assert!(hlc::newer(v2, expected[&99]));

    expected.insert(99, v2);
    for _ in 0..20 {
        route_and_tick(&mut fleet);
        if converged(&fleet, &expected) {
            break;
        }
    }
    assert!(converged(&fleet, &expected));
    for sim in &fleet {
        assert_eq!(sim.node.store().get(99).unwrap().name_str(), "two");
    }
}

/// More dirty entries than one delta batch can carry still all make it over.
#[test]
fn large_backlog_drains_over_multiple_ticks() {
    let mut fleet = mk_fleet(2);
    let mut expected = HashMap::new();
    for id in 1..=100u64 {
        assert!(fleet[0].node.inject_service(record(id, "bulk")).unwrap());
        expected.insert(id, fleet[0].node.registry().version_of(id));
    }

    for _ in 0..40 {
        route_and_tick(&mut fleet);
        if converged(&fleet, &expected) {
            break;
        }
    }
    assert!(converged(&fleet, &expected), "all 100 services must spread");
    for id in 1..=100u64 {
        assert_eq!(fleet[1].executed.count(id), 1, "id {id} exactly once");
    }
}

// ══════════════════════════════════════════════════════════════════════════════
//  Fleet convergence
// ══════════════════════════════════════════════════════════════════════════════

/// Writes made during a partition spread once the switchboard reconnects,
/// carried by the periodic Control digests.
#[test]
fn partitioned_fleet_reconverges() {
    let mut fleet = mk_fleet(4);

    let mut expected = HashMap::new();
    for id in 1..=5u64 {
        assert!(fleet[0].node.inject_service(record(id, "from-a")).unwrap());
        expected.insert(id, fleet[0].node.registry().version_of(id));
    }
    for id in 10..=12u64 {
        assert!(fleet[3].node.inject_service(record(id, "from-d")).unwrap());
        expected.insert(id, fleet[3].node.registry().version_of(id));
    }

    // Partition: every node ticks but nothing is delivered, so the initial
    // delta Syncs are lost on the floor.
    for _ in 0..3 {
        for sim in &mut fleet {
            sim.node.tick(&[]);
        }
    }

    // Reconnect and let anti-entropy do its job.
    let mut ticks = 0;
    while !converged(&fleet, &expected) {
        route_and_tick(&mut fleet);
        ticks += 1;
        assert!(ticks <= 30, "fleet failed to converge after {ticks} ticks");
    }

    // Identical registries and stores everywhere, executor exactly once
    // per id per node for the single accepted version.
    for sim in &fleet {
        for (&id, &version) in &expected {
            assert_eq!(sim.node.registry().version_of(id), version);
            assert!(sim.node.store().get(id).is_some());
            assert_eq!(sim.executed.count(id), 1, "id {id} exactly once");
        }
    }
}

// ══════════════════════════════════════════════════════════════════════════════
//  Packet authentication
// ══════════════════════════════════════════════════════════════════════════════

/// Auth hook that rejects every fourth packet it sees.
#[derive(Default)]
struct FlakyAuth {
    seen: AtomicU32,
}

impl PacketAuth for FlakyAuth {
    fn open(&self, _packet: &Packet) -> bool {
        let n = self.seen.fetch_add(1, Ordering::Relaxed) + 1;
        n % 4 != 0
    }
}

fn advert_packet(id: u64, sender: [u8; 32]) -> Packet {
    let entries = [Entry {
        id,
        version: hlc::pack(START_MS + 10, 0),
    }];
    let mut payload = [0u8; MAX_PAYLOAD];
    let mut pos = 0;
    digest::push_section(&mut payload, &mut pos, SECTION_DELTA, &entries).unwrap();
    let mut pkt = Packet::new(MsgType::Sync, 9, sender);
    pkt.set_payload(&payload[..pos]);
    pkt
}

/// With plaintext disallowed, rejected packets count and are not processed.
#[test]
fn mac_failures_are_counted_and_dropped() {
    let executed = Counting::default();
    let mut node: Node<Counting, FlakyAuth> = Node::init(
        1,
        NodeStorage::new_boxed(),
        vec![0u8; 4096].into_boxed_slice(),
        executed,
        FlakyAuth::default(),
        NodeOptions {
            clock: fixed_clock,
            ..NodeOptions::default()
        },
    )
    .unwrap();

    let inputs: Vec<Packet> = (1..=100u64)
        .map(|id| advert_packet(id, [0x50 + (id % 8) as u8; 32]))
        .collect();
    node.tick(&inputs);

    assert_eq!(node.mac_failures(), 25, "one in four must fail");
    assert_eq!(node.missing_len(), 75, "rejected adverts must not be tracked");
}

/// With plaintext allowed, the counter still advances but packets process.
#[test]
fn allow_unverified_processes_rejected_packets() {
    let executed = Counting::default();
    let mut node: Node<Counting, FlakyAuth> = Node::init(
        1,
        NodeStorage::new_boxed(),
        vec![0u8; 4096].into_boxed_slice(),
        executed,
        FlakyAuth::default(),
        NodeOptions {
            clock: fixed_clock,
            allow_unverified: true,
            ..NodeOptions::default()
        },
    )
    .unwrap();

    let inputs: Vec<Packet> = (1..=100u64)
        .map(|id| advert_packet(id, [0x50 + (id % 8) as u8; 32]))
        .collect();
    node.tick(&inputs);

    assert_eq!(node.mac_failures(), 25);
    assert_eq!(node.missing_len(), 100, "everything processed regardless");
}

// ══════════════════════════════════════════════════════════════════════════════
//  Deploy payload fidelity
// ══════════════════════════════════════════════════════════════════════════════

/// Records survive the full gossip path bit-for-bit.
#[test]
fn record_payload_is_preserved_end_to_end() {
    let mut fleet = mk_fleet(3);
    let rec = ServiceRecord::new(
        1234,
        "payments-api",
        "github:acme/payments?ref=v2.3.1",
        "payments-server",
    )
    .unwrap();
    assert!(fleet[0].node.inject_service(rec).unwrap());
    let mut expected = HashMap::new();
    expected.insert(1234, fleet[0].node.registry().version_of(1234));

    let mut ticks = 0;
    while !converged(&fleet, &expected) {
        route_and_tick(&mut fleet);
        ticks += 1;
        assert!(ticks <= 20, "record failed to spread");
    }
    for sim in &fleet {
        let held = sim.node.store().get(1234).unwrap();
        assert_eq!(held, &rec);
        assert_eq!(held.flake_uri_str(), "github:acme/payments?ref=v2.3.1");
    }
    // Deploy payloads are version + record, nothing else.
    assert_eq!(DEPLOY_PAYLOAD_LEN, 8 + 168);
}
