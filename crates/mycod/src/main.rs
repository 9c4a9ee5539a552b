//! mycod — Myco peer-to-peer daemon.
//!
//! Wraps the myco-core node engine in a UDP transport loop: collect a
//! batch of datagrams, tick the node every `tick_ms`, seal and send
//! whatever lands in the outbox. Membership, identity, and the executor
//! all come from config; the core never touches any of them directly.

mod auth;
mod config;
mod executor;
mod peers;

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::RngCore;
use tokio::net::UdpSocket;

use myco_core::crypto::Identity;
use myco_core::packet::PACKET_LEN;
use myco_core::{Node, NodeOptions, NodeStorage, Packet, ServiceRecord};

use auth::MacAuth;
use config::MycoConfig;
use executor::BoxedExecutor;
use peers::PeerTable;

type DaemonNode = Node<BoxedExecutor, MacAuth>;

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG controls verbosity, e.g. RUST_LOG=debug mycod
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = MycoConfig::load().context("loading config")?;
    tracing::info!(
        node_id = config.identity.node_id,
        listen = %config.network.listen,
        peers = config.peers.len(),
        "mycod starting"
    );

    let identity = load_or_create_identity(&config.identity.keypair_path)?;
    tracing::info!(public_key = hex::encode(identity.public), "identity ready");

    let peers = PeerTable::from_config(&config.peers).context("parsing peer table")?;
    let peer_keys = peers.keys();
    let auth = MacAuth::new(&identity, &peer_keys);
    let sealer = auth.clone();

    let options = NodeOptions {
        gossip_fanout: config.gossip.fanout,
        control_interval: config.gossip.control_interval,
        sample_interval: config.gossip.sample_interval,
        allow_unverified: config.gossip.allow_unverified,
        identity: Some(identity),
        ..NodeOptions::default()
    };
    let exec = executor::from_command(&config.executor.command);
    let mut node = Node::init(
        config.identity.node_id,
        NodeStorage::new_boxed(),
        vec![0u8; config.network.wal_bytes].into_boxed_slice(),
        exec,
        auth,
        options,
    )
    .context("initialising node")?;
    node.set_peers(&peer_keys);

    seed_services(&mut node, &config);

    let socket = UdpSocket::bind(&config.network.listen)
        .await
        .with_context(|| format!("binding {}", config.network.listen))?;

    run_loop(&socket, &mut node, &peers, &sealer, &config).await
}

/// Load the stored private key, or generate and persist a fresh one.
fn load_or_create_identity(path: &Path) -> Result<Identity> {
    if path.exists() {
        let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let key: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("{} is {} bytes, want 32", path.display(), bytes.len()))?;
        return Ok(Identity::from_private(key));
    }
    let mut key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut key);
    let identity = Identity::from_private(key);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    std::fs::write(path, *identity.private_bytes())
        .with_context(|| format!("writing {}", path.display()))?;
    tracing::info!(path = %path.display(), "generated new identity keypair");
    Ok(identity)
}

/// Inject configured seed services before the first tick.
fn seed_services(node: &mut DaemonNode, config: &MycoConfig) {
    for seed in &config.services {
        let record = match ServiceRecord::new(seed.id, &seed.name, &seed.flake_uri, &seed.exec_name)
        {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(id = seed.id, error = %e, "invalid seed service, skipping");
                continue;
            }
        };
        match node.inject_service(record) {
            Ok(true) => tracing::info!(id = seed.id, name = %seed.name, "seed service injected"),
            Ok(false) => tracing::warn!(id = seed.id, "seed service shadowed by a newer version"),
            Err(e) => tracing::error!(id = seed.id, error = %e, "seed service rejected"),
        }
    }
}

async fn run_loop(
    socket: &UdpSocket,
    node: &mut DaemonNode,
    peers: &PeerTable,
    sealer: &MacAuth,
    config: &MycoConfig,
) -> Result<()> {
    let mut interval = tokio::time::interval(Duration::from_millis(config.network.tick_ms.max(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut batch: Vec<Packet> = Vec::with_capacity(config.network.batch);
    let mut buf = [0u8; 2 * PACKET_LEN];
    let mut reported_failures = 0u64;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                node.tick(&batch);
                batch.clear();
                drain_outbox(socket, node, peers, sealer).await;

                let failures = node.mac_failures();
                if failures != reported_failures {
                    tracing::warn!(failures, "packets failed MAC verification");
                    reported_failures = failures;
                }
            }
            recv = socket.recv_from(&mut buf) => {
                let (len, from) = recv.context("udp recv")?;
                if len != PACKET_LEN {
                    tracing::debug!(len, %from, "dropping datagram of wrong size");
                    continue;
                }
                if batch.len() >= config.network.batch {
                    tracing::debug!(%from, "tick batch full, dropping datagram");
                    continue;
                }
                if let Some(mut pkt) = Packet::parse(&buf[..len]) {
                    pkt.clamp_payload_len();
                    batch.push(pkt);
                }
            }
        }
    }
}

/// Send everything the tick produced, in order. Targeted packets go to
/// their recipient; broadcasts fan out to every configured peer, each
/// copy sealed under that peer's shared key.
async fn drain_outbox(
    socket: &UdpSocket,
    node: &DaemonNode,
    peers: &PeerTable,
    sealer: &MacAuth,
) {
    for out in node.outbox() {
        match out.recipient {
            Some(peer) => {
                let Some(addr) = peers.addr_of(&peer) else {
                    tracing::debug!("no address for targeted recipient, dropping");
                    continue;
                };
                let mut pkt = out.packet.clone();
                sealer.seal_for(&peer, &mut pkt);
                if let Err(e) = socket.send_to(pkt.wire_bytes(), addr).await {
                    tracing::warn!(%addr, error = %e, "send failed");
                }
            }
            None => {
                for (peer, addr) in peers.iter() {
                    let mut pkt = out.packet.clone();
                    sealer.seal_for(peer, &mut pkt);
                    if let Err(e) = socket.send_to(pkt.wire_bytes(), *addr).await {
                        tracing::warn!(%addr, error = %e, "broadcast send failed");
                    }
                }
            }
        }
    }
}
