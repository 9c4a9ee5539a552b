//! Per-peer packet MACs.
//!
//! At startup the daemon derives one shared key per configured peer from
//! its own X25519 secret and the peer's public key. Inbound packets are
//! verified against the key matching their sender field; outbound packets
//! are sealed with the key of the destination peer just before the socket
//! write, so a broadcast gets a fresh tag per destination.

use std::collections::HashMap;

use myco_core::crypto::{self, Identity, PacketAuth};
use myco_core::Packet;

#[derive(Clone, Default)]
pub struct MacAuth {
    keys: HashMap<[u8; 32], [u8; 32]>,
}

impl MacAuth {
    pub fn new(identity: &Identity, peer_keys: &[[u8; 32]]) -> Self {
        let keys = peer_keys
            .iter()
            .map(|peer| (*peer, identity.shared_key(peer)))
            .collect();
        Self { keys }
    }

    /// Seal `packet` for delivery to `peer`. No-op for unknown peers — the
    /// send path never addresses those.
    pub fn seal_for(&self, peer: &[u8; 32], packet: &mut Packet) {
        if let Some(key) = self.keys.get(peer) {
            crypto::seal(key, packet);
        }
    }
}

impl PacketAuth for MacAuth {
    fn open(&self, packet: &Packet) -> bool {
        match self.keys.get(&packet.sender) {
            Some(key) => crypto::verify_tag(key, packet),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use myco_core::MsgType;

    #[test]
    fn sealed_packets_verify_on_the_other_side() {
        let a = Identity::from_node_id(1);
        let b = Identity::from_node_id(2);
        let a_pub = a.public;
        let b_pub = b.public;
        let auth_a = MacAuth::new(&a, &[b_pub]);
        let auth_b = MacAuth::new(&b, &[a_pub]);

        let mut pkt = Packet::new(MsgType::Sync, 1, a_pub);
        pkt.set_payload(b"delta");
        auth_a.seal_for(&b_pub, &mut pkt);
        assert!(auth_b.open(&pkt));
    }

    #[test]
    fn unknown_sender_is_rejected() {
        let a = Identity::from_node_id(1);
        let auth = MacAuth::new(&a, &[]);
        let pkt = Packet::new(MsgType::Sync, 9, [0x99; 32]);
        assert!(!auth.open(&pkt));
    }

    #[test]
    fn tampering_is_detected() {
        let a = Identity::from_node_id(1);
        let b = Identity::from_node_id(2);
        let auth_a = MacAuth::new(&a, &[b.public]);
        let auth_b = MacAuth::new(&b, &[a.public]);

        let mut pkt = Packet::new(MsgType::Deploy, 1, a.public);
        pkt.set_payload(b"record");
        auth_a.seal_for(&b.public, &mut pkt);
        pkt.payload[3] ^= 0x80;
        assert!(!auth_b.open(&pkt));
    }
}
