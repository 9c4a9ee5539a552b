//! The replicated node engine.
//!
//! A Node owns the registry, store, WAL, missing tracker and clock, and is
//! the only code that mutates them. The embedder feeds it batches of
//! inbound packets via [`Node::tick`] and drains the outbox after every
//! call; everything in between is synchronous, lock-free and — after
//! construction — allocation-free. All buffers are fixed-size slabs inside
//! [`NodeStorage`] or stack arrays bounded by the packet payload.

use std::sync::atomic::{AtomicU64, Ordering};

use rand::rngs::SmallRng;
use rand::{Rng, RngCore, SeedableRng};
use zerocopy::byteorder::U16;
use zerocopy::{AsBytes, FromBytes};

use crate::compress;
use crate::crypto::{Identity, NoAuth, PacketAuth};
use crate::digest::{
    self, Entry, MAX_DIGEST_ENTRIES, SECTION_DELTA, SECTION_RECENT, SECTION_SAMPLE,
};
use crate::hlc::{self, Hlc};
use crate::missing::{MissingTracker, MAX_MISSING, MISSING_SET_SLOTS};
use crate::packet::{MsgType, Packet, FLAG_COMPRESSED, MAGIC, MAX_PAYLOAD, WIRE_VERSION};
use crate::registry::{Registry, RECENT_RING};
use crate::store::{ServiceRecord, Store, RECORD_LEN};
use crate::wal::{Wal, WalError};

/// Outbound packets a single tick may accumulate.
pub const MAX_OUTBOX: usize = 64;

/// Peers the gossip forwarder can pick targets from.
pub const MAX_PEERS: usize = 64;

/// Missing-list pops per tick.
pub const MISSING_BUDGET: usize = 64;

/// Dirty entries drained into one Sync delta.
pub const DELTA_BATCH: usize = 64;

/// Entries in a periodic random sample.
pub const SAMPLE_SIZE: usize = 32;

/// Bytes of a Deploy payload: version + record.
pub const DEPLOY_PAYLOAD_LEN: usize = 8 + RECORD_LEN;

/// Callback invoked on every accepted service record, at least once per
/// accepted version. Errors are logged and swallowed — the registry has
/// already advanced by the time the executor runs.
pub trait Executor {
    type Error: core::fmt::Display;

    fn deploy(&mut self, record: ServiceRecord) -> Result<(), Self::Error>;
}

/// Embedders that pick an executor at runtime hold it boxed.
impl<E: Executor + ?Sized> Executor for Box<E> {
    type Error = E::Error;

    fn deploy(&mut self, record: ServiceRecord) -> Result<(), Self::Error> {
        (**self).deploy(record)
    }
}

/// Runtime knobs consumed once at [`Node::init`]. The embedder maps its
/// config file or environment onto this; the core never reads either.
pub struct NodeOptions {
    /// Peers a freshly accepted Deploy is forwarded to. At least 1.
    pub gossip_fanout: u8,

    /// Emit a Control digest every this many ticks.
    pub control_interval: u64,

    /// Include a random sample digest every this many ticks.
    pub sample_interval: u64,

    /// Process packets even when the auth hook rejects them. The
    /// MAC-failure counter advances either way.
    pub allow_unverified: bool,

    /// Millisecond clock the HLC reads. Injected so simulations control
    /// time; defaults to the system clock.
    pub clock: fn() -> u64,

    /// Production identity. When absent the node derives a deterministic
    /// keypair from its node id (tests, simulations).
    pub identity: Option<Identity>,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            gossip_fanout: 4,
            control_interval: 10,
            sample_interval: 50,
            allow_unverified: false,
            clock: system_millis,
            identity: None,
        }
    }
}

fn system_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One outbox slot: a packet plus its addressing. `recipient == None`
/// means broadcast — the embedder delivers to every known peer.
#[derive(Clone, Debug)]
pub struct Outbound {
    pub packet: Packet,
    pub recipient: Option<[u8; 32]>,
}

/// The node's fixed storage slab: every container the engine mutates.
/// Constructed once, boxed, and handed to [`Node::init`].
pub struct NodeStorage {
    registry: Registry,
    store: Store,
    missing: MissingTracker<MAX_MISSING, MISSING_SET_SLOTS>,
    outbox: heapless::Vec<Outbound, MAX_OUTBOX>,
}

impl NodeStorage {
    pub fn new_boxed() -> Box<Self> {
        Box::new(Self {
            registry: Registry::new(),
            store: Store::new(),
            missing: MissingTracker::new(),
            outbox: heapless::Vec::new(),
        })
    }
}

/// Errors surfaced at construction. Everything after init is absorbed.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("gossip fanout {0} is invalid, need at least 1")]
    BadFanout(u8),

    #[error("periodic intervals must be at least 1 tick")]
    BadInterval,

    #[error(transparent)]
    Wal(#[from] WalError),
}

/// Errors surfaced from [`Node::inject_service`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InjectError {
    #[error("service store is full")]
    StoreFull,
}

/// The tick engine. Generic over the executor and the inbound auth hook.
pub struct Node<E: Executor, A: PacketAuth = NoAuth> {
    node_id: u16,
    identity: Identity,
    hlc: Hlc,
    wal: Wal,
    knowledge: u64,
    storage: Box<NodeStorage>,
    peers: heapless::Vec<[u8; 32], MAX_PEERS>,
    rng: SmallRng,
    executor: E,
    auth: A,
    opts: NodeOptions,
    tick_count: u64,
    dirty_sync: bool,
    mac_failures: AtomicU64,
}

impl<E: Executor, A: PacketAuth> Node<E, A> {
    /// Build a node around its storage slab and WAL buffer. Recovers the
    /// knowledge watermark from the WAL and seeds the HLC past it so
    /// versions issued after a restart never fall behind pre-restart ones.
    pub fn init(
        node_id: u16,
        storage: Box<NodeStorage>,
        wal_buf: Box<[u8]>,
        executor: E,
        auth: A,
        mut options: NodeOptions,
    ) -> Result<Self, InitError> {
        if options.gossip_fanout == 0 {
            return Err(InitError::BadFanout(options.gossip_fanout));
        }
        if options.control_interval == 0 || options.sample_interval == 0 {
            return Err(InitError::BadInterval);
        }
        let wal = Wal::new(wal_buf)?;
        let knowledge = wal.recover();

        let identity = options
            .identity
            .take()
            .unwrap_or_else(|| Identity::from_node_id(node_id));

        let mut hlc = Hlc::new();
        if knowledge > 0 {
            hlc.observe(knowledge, (options.clock)());
        }

        Ok(Self {
            node_id,
            identity,
            hlc,
            wal,
            knowledge,
            storage,
            peers: heapless::Vec::new(),
            rng: SmallRng::seed_from_u64(0x6D79_636F ^ u64::from(node_id)),
            executor,
            auth,
            opts: options,
            tick_count: 0,
            dirty_sync: false,
            mac_failures: AtomicU64::new(0),
        })
    }

    /// Inject the current membership. The forwarder picks gossip targets
    /// from this table; with no membership, forwards degrade to broadcast.
    pub fn set_peers(&mut self, peers: &[[u8; 32]]) {
        self.peers.clear();
        for p in peers.iter().take(MAX_PEERS) {
            if *p != self.identity.public {
                let _ = self.peers.push(*p);
            }
        }
    }

    /// Locally originate a new version of `record`. Returns Ok(true) when
    /// the version was accepted and the executor ran, Ok(false) when a
    /// higher remote version already shadows it.
    pub fn inject_service(&mut self, record: ServiceRecord) -> Result<bool, InjectError> {
        let id = record.service_id();
        if !self.storage.store.can_accept(id) {
            return Err(InjectError::StoreFull);
        }
        let version = self.hlc.next((self.opts.clock)());
        if !self.storage.registry.update(id, version) {
            return Ok(false);
        }
        let _ = self.storage.store.put(record);
        self.advance_knowledge(version);
        self.run_executor(record);
        self.dirty_sync = true;
        Ok(true)
    }

    /// One engine step: consume a batch of inbound packets, emit outbound
    /// ones. Inputs are processed in order; the outbox is cleared first and
    /// filled in emission order.
    pub fn tick(&mut self, inputs: &[Packet]) {
        self.tick_count += 1;
        self.storage.outbox.clear();

        self.pull_missing();
        for pkt in inputs {
            self.handle_packet(pkt);
        }
        self.emit_sync();
        if self.tick_count % self.opts.control_interval == 0 {
            self.emit_control();
        }
    }

    /// The packets produced by the last tick, in emission order.
    pub fn outbox(&self) -> &[Outbound] {
        &self.storage.outbox
    }

    /// Packets rejected by the auth hook since init. Monotonic.
    pub fn mac_failures(&self) -> u64 {
        self.mac_failures.load(Ordering::Relaxed)
    }

    pub fn node_id(&self) -> u16 {
        self.node_id
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.identity.public
    }

    /// Recovered-or-advanced knowledge watermark.
    pub fn knowledge(&self) -> u64 {
        self.knowledge
    }

    /// The WAL buffer contents, for embedders that persist it.
    pub fn wal_bytes(&self) -> &[u8] {
        self.wal.bytes()
    }

    pub fn registry(&self) -> &Registry {
        &self.storage.registry
    }

    pub fn store(&self) -> &Store {
        &self.storage.store
    }

    pub fn missing_len(&self) -> usize {
        self.storage.missing.len()
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn executor_mut(&mut self) -> &mut E {
        &mut self.executor
    }

    // ── Tick stages ──────────────────────────────────────────────────────────

    /// Stage 1: re-request ids we know we lag on, budgeted per tick.
    fn pull_missing(&mut self) {
        for _ in 0..MISSING_BUDGET {
            if self.storage.outbox.is_full() {
                return;
            }
            let Some(item) = self.storage.missing.pop() else {
                // List drained: reset the set so tombstones never pile up.
                self.storage.missing.clear();
                return;
            };
            if self.storage.registry.version_of(item.id) == 0 {
                self.send_request(item.id, item.source);
            }
        }
    }

    fn handle_packet(&mut self, pkt: &Packet) {
        if pkt.magic.get() != MAGIC || pkt.version != WIRE_VERSION {
            tracing::debug!(magic = pkt.magic.get(), version = pkt.version, "alien packet");
            return;
        }
        if pkt.sender == self.identity.public {
            // Our own broadcast, echoed back by the transport.
            return;
        }
        if !self.auth.open(pkt) {
            self.mac_failures.fetch_add(1, Ordering::Relaxed);
            if !self.opts.allow_unverified {
                return;
            }
        }
        let Ok(msg) = MsgType::try_from(pkt.msg_type) else {
            return;
        };
        match msg {
            MsgType::Deploy => self.handle_deploy(pkt),
            MsgType::Request => self.handle_request(pkt),
            MsgType::Sync | MsgType::Control => self.handle_digest(pkt),
        }
    }

    fn handle_deploy(&mut self, pkt: &Packet) {
        let payload = pkt.payload_bytes();
        if payload.len() < DEPLOY_PAYLOAD_LEN {
            tracing::warn!(len = payload.len(), "short deploy payload, skipping");
            return;
        }
        let version = u64::from_le_bytes(payload[..8].try_into().unwrap_or([0; 8]));
        let Some(record) = ServiceRecord::read_from(&payload[8..DEPLOY_PAYLOAD_LEN]) else {
            return;
        };
        self.hlc.observe(version, (self.opts.clock)());

        let id = record.service_id();
        if !hlc::newer(version, self.storage.registry.version_of(id)) {
            return;
        }
        if !self.storage.store.can_accept(id) {
            // Non-fatal: an unstorable record must not enter the registry
            // either, or we would advertise a version we cannot serve.
            tracing::debug!(id, "store full, dropping deploy");
            return;
        }
        if !self.storage.registry.update(id, version) {
            return;
        }
        let _ = self.storage.store.put(record);
        self.advance_knowledge(version);
        self.run_executor(record);
        self.dirty_sync = true;
        self.forward_deploy(pkt);
    }

    fn handle_request(&mut self, pkt: &Packet) {
        let payload = pkt.payload_bytes();
        if payload.len() < 8 {
            tracing::warn!(len = payload.len(), "short request payload, skipping");
            return;
        }
        let id = u64::from_le_bytes(payload[..8].try_into().unwrap_or([0; 8]));
        let Some(record) = self.storage.store.get(id).copied() else {
            return;
        };
        let version = self.storage.registry.version_of(id);
        self.send_deploy(version, &record, Some(pkt.sender));
    }

    fn handle_digest(&mut self, pkt: &Packet) {
        let payload = pkt.payload_bytes();
        let mut scratch = [0u8; MAX_PAYLOAD];
        let data: &[u8] = if pkt.is_compressed() {
            match compress::decompress(payload, &mut scratch) {
                Ok(n) => &scratch[..n],
                Err(e) => {
                    tracing::debug!(error = %e, "undecompressable digest, skipping");
                    return;
                }
            }
        } else {
            payload
        };

        let mut entries = [Entry::default(); MAX_DIGEST_ENTRIES];
        if digest::is_sectioned(data) {
            for section in digest::Sections::new(data) {
                let (kind, body) = match section {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::debug!(error = %e, "bad digest section, skipping packet");
                        return;
                    }
                };
                if !matches!(kind, SECTION_DELTA | SECTION_RECENT | SECTION_SAMPLE) {
                    continue;
                }
                let n = match digest::decode_columnar(body, &mut entries) {
                    Ok(n) => n,
                    Err(e) => {
                        tracing::debug!(error = %e, "bad digest body, skipping packet");
                        return;
                    }
                };
                for entry in entries.iter().take(n) {
                    self.advertise(*entry, pkt.sender);
                }
            }
        } else {
            // Sectionless payloads are bare row digests from older peers.
            let n = match digest::decode_row(data, &mut entries) {
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!(error = %e, "bad row digest, skipping packet");
                    return;
                }
            };
            for entry in entries.iter().take(n) {
                self.advertise(*entry, pkt.sender);
            }
        }
    }

    /// A peer claims to hold `entry`. Track it as missing and ask for it
    /// right away; the tracker covers the retry if this Request is lost.
    fn advertise(&mut self, entry: Entry, sender: [u8; 32]) {
        self.hlc.observe(entry.version, (self.opts.clock)());
        if !hlc::newer(entry.version, self.storage.registry.version_of(entry.id)) {
            return;
        }
        self.storage
            .missing
            .insert(entry.id, sender, &mut self.rng);
        if !self.storage.outbox.is_full() {
            self.send_request(entry.id, sender);
        }
    }

    /// Stage 4: delta digest, plus the periodic random sample.
    fn emit_sync(&mut self) {
        let sample_due = self.tick_count % self.opts.sample_interval == 0;
        if !self.dirty_sync && !sample_due {
            return;
        }
        let mut delta = [Entry::default(); DELTA_BATCH];
        let dn = self.storage.registry.drain_dirty(&mut delta);
        let mut sample = [Entry::default(); SAMPLE_SIZE];
        let sn = if sample_due {
            self.storage.registry.sample(&mut sample, &mut self.rng)
        } else {
            0
        };
        if dn == 0 && sn == 0 {
            self.dirty_sync = false;
            return;
        }
        let mut pkt = Packet::new(MsgType::Sync, self.node_id, self.identity.public);
        assemble_digest(&mut pkt, SECTION_DELTA, &delta[..dn], &sample[..sn]);
        if dn > 0 {
            self.dirty_sync = false;
        }
        self.emit(pkt, None);
    }

    /// Stage 5: recency digest, every `control_interval` ticks.
    fn emit_control(&mut self) {
        let mut recent = [Entry::default(); RECENT_RING];
        let rn = self.storage.registry.copy_recent(&mut recent);
        let sample_due = self.tick_count % self.opts.sample_interval == 0;
        let mut sample = [Entry::default(); SAMPLE_SIZE];
        let sn = if sample_due {
            self.storage.registry.sample(&mut sample, &mut self.rng)
        } else {
            0
        };
        if rn == 0 && sn == 0 {
            return;
        }
        let mut pkt = Packet::new(MsgType::Control, self.node_id, self.identity.public);
        assemble_digest(&mut pkt, SECTION_RECENT, &recent[..rn], &sample[..sn]);
        self.emit(pkt, None);
    }

    // ── Emission helpers ─────────────────────────────────────────────────────

    fn send_request(&mut self, id: u64, peer: [u8; 32]) {
        let mut pkt = Packet::new(MsgType::Request, self.node_id, self.identity.public);
        pkt.set_payload(&id.to_le_bytes());
        self.emit(pkt, Some(peer));
    }

    fn send_deploy(&mut self, version: u64, record: &ServiceRecord, recipient: Option<[u8; 32]>) {
        let mut pkt = Packet::new(MsgType::Deploy, self.node_id, self.identity.public);
        pkt.payload[..8].copy_from_slice(&version.to_le_bytes());
        pkt.payload[8..DEPLOY_PAYLOAD_LEN].copy_from_slice(record.as_bytes());
        pkt.payload_len = U16::new(DEPLOY_PAYLOAD_LEN as u16);
        self.emit(pkt, recipient);
    }

    /// Rumor-monger an accepted Deploy to random peers, sender rewritten to
    /// this node. Payload (version + record) is carried unchanged.
    fn forward_deploy(&mut self, original: &Packet) {
        let mut copy = original.clone();
        copy.node_id = U16::new(self.node_id);
        copy.sender = self.identity.public;
        copy.auth_tag = [0; 12];

        if self.peers.is_empty() {
            self.emit(copy, None);
            return;
        }
        let want = usize::from(self.opts.gossip_fanout).min(self.peers.len());
        let mut idx: [usize; MAX_PEERS] = core::array::from_fn(|i| i);
        let n = self.peers.len();
        let mut chosen = 0;
        for k in 0..n {
            if chosen == want {
                break;
            }
            let j = self.rng.gen_range(k..n);
            idx.swap(k, j);
            let peer = self.peers[idx[k]];
            if peer == original.sender {
                continue;
            }
            if !self.emit(copy.clone(), Some(peer)) {
                return;
            }
            chosen += 1;
        }
    }

    fn emit(&mut self, mut pkt: Packet, recipient: Option<[u8; 32]>) -> bool {
        self.rng.fill_bytes(&mut pkt.nonce);
        if self
            .storage
            .outbox
            .push(Outbound { packet: pkt, recipient })
            .is_err()
        {
            tracing::debug!("outbox full, dropping outbound packet");
            return false;
        }
        true
    }

    fn run_executor(&mut self, record: ServiceRecord) {
        if let Err(e) = self.executor.deploy(record) {
            tracing::warn!(
                id = record.service_id(),
                error = %e,
                "executor failed, record kept"
            );
        }
    }

    fn advance_knowledge(&mut self, version: u64) {
        if version > self.knowledge {
            self.knowledge = version;
            self.wal.append(version);
        }
    }
}

/// Assemble `primary` + optional `sample` sections into the packet payload:
/// stage both columnar, ship raw if they fit, compress if not, and as a
/// last resort re-encode the primary section truncated to whatever fits.
fn assemble_digest(pkt: &mut Packet, primary_kind: u8, primary: &[Entry], sample: &[Entry]) {
    let mut staging = [0u8; 2 * MAX_PAYLOAD];
    let mut pos = 0usize;
    if !primary.is_empty() && digest::push_section(&mut staging, &mut pos, primary_kind, primary).is_err() {
        let used = encode_truncated(primary_kind, primary, &mut pkt.payload);
        pkt.payload_len = U16::new(used as u16);
        return;
    }
    if !sample.is_empty() {
        // Best effort: a sample that does not fit simply waits for a
        // quieter tick.
        let _ = digest::push_section(&mut staging, &mut pos, SECTION_SAMPLE, sample);
    }
    if pos <= MAX_PAYLOAD {
        pkt.payload[..pos].copy_from_slice(&staging[..pos]);
        pkt.payload_len = U16::new(pos as u16);
        return;
    }
    if let Some(clen) = compress::compress(&staging[..pos], &mut pkt.payload) {
        pkt.flags |= FLAG_COMPRESSED;
        pkt.payload_len = U16::new(clen as u16);
        return;
    }
    let used = encode_truncated(primary_kind, primary, &mut pkt.payload);
    pkt.payload_len = U16::new(used as u16);
}

/// Encode as many leading entries as fit the payload as a single section.
fn encode_truncated(kind: u8, entries: &[Entry], payload: &mut [u8; MAX_PAYLOAD]) -> usize {
    let mut n = entries.len();
    loop {
        let mut pos = 0;
        match digest::push_section(payload, &mut pos, kind, &entries[..n]) {
            Ok(()) => return pos,
            Err(_) => {
                if n == 0 {
                    return 0;
                }
                n -= 1;
            }
        }
    }
}
