//! Identity and packet authentication.
//!
//! The core does not encrypt anything itself — transport privacy is the
//! embedder's job. What lives here is the identity keypair, the shared-key
//! derivation the embedder builds its per-peer MACs from, and the tag
//! computation both sides agree on: a keyed BLAKE3 over every packet byte
//! except the 12-byte tag field, truncated to 12 bytes.
//!
//! All private key material is ZeroizeOnDrop — wiped from memory when
//! dropped. There is no unsafe code in this module.

use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};
use zerocopy::AsBytes;

use crate::packet::{Packet, AUTH_TAG_LEN, AUTH_TAG_OFFSET};

/// Domain-separation contexts for key derivation. Protocol-level strings;
/// changing either breaks interop with every deployed node.
const IDENTITY_CONTEXT: &str = "myco v1 node identity";
const MAC_CONTEXT: &str = "myco v1 packet mac";

/// A node's long-term X25519 keypair.
///
/// Simulations and tests derive it deterministically from the node id;
/// production loads stored private key bytes. Both construction paths end
/// up here, behind the same type.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Identity {
    /// Private key — zeroized on drop, never exposed directly.
    private: Zeroizing<[u8; 32]>,
    /// Public key — carried in every packet this node sends.
    pub public: [u8; 32],
}

impl Identity {
    /// Deterministic identity for a numeric node id.
    pub fn from_node_id(node_id: u16) -> Self {
        let seed = blake3::derive_key(IDENTITY_CONTEXT, &node_id.to_le_bytes());
        Self::from_private(seed)
    }

    /// Reconstruct an identity from stored private key bytes. The public
    /// key is always derived, never stored.
    pub fn from_private(private_bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(private_bytes);
        let public = PublicKey::from(&secret);
        Self {
            private: Zeroizing::new(private_bytes),
            public: *public.as_bytes(),
        }
    }

    /// Serialize the private key for persistent storage (mode 0600).
    pub fn private_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(*self.private)
    }

    /// Derive the symmetric MAC key shared with `peer_public`:
    /// BLAKE3-derive_key over the X25519 shared secret. Both sides compute
    /// the same key, so tags verify in either direction.
    pub fn shared_key(&self, peer_public: &[u8; 32]) -> [u8; 32] {
        let secret = StaticSecret::from(*self.private);
        let shared = secret.diffie_hellman(&PublicKey::from(*peer_public));
        blake3::derive_key(MAC_CONTEXT, shared.as_bytes())
    }
}

/// Compute the 12-byte tag for a packet under `key`. Covers every packet
/// byte except the tag field itself.
pub fn compute_tag(key: &[u8; 32], packet: &Packet) -> [u8; AUTH_TAG_LEN] {
    let bytes = packet.as_bytes();
    let mut hasher = blake3::Hasher::new_keyed(key);
    hasher.update(&bytes[..AUTH_TAG_OFFSET]);
    hasher.update(&bytes[AUTH_TAG_OFFSET + AUTH_TAG_LEN..]);
    let hash = hasher.finalize();
    let mut tag = [0u8; AUTH_TAG_LEN];
    tag.copy_from_slice(&hash.as_bytes()[..AUTH_TAG_LEN]);
    tag
}

/// Write the tag into the packet.
pub fn seal(key: &[u8; 32], packet: &mut Packet) {
    packet.auth_tag = compute_tag(key, packet);
}

/// Check the packet's tag against `key`.
pub fn verify_tag(key: &[u8; 32], packet: &Packet) -> bool {
    compute_tag(key, packet) == packet.auth_tag
}

/// Inbound packet verification hook the node consults before dispatch.
///
/// The embedder implements this with its per-peer key table. The default
/// [`NoAuth`] accepts everything — the right choice for closed test
/// harnesses and simulations.
pub trait PacketAuth {
    /// True if the packet is authentic and may be processed.
    fn open(&self, packet: &Packet) -> bool;
}

/// Accept-everything verifier.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAuth;

impl PacketAuth for NoAuth {
    fn open(&self, _packet: &Packet) -> bool {
        true
    }
}
