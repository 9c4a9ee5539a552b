//! Static peer table: public key → socket address.
//!
//! Membership is injected from config; the daemon resolves outbox
//! recipients against it and fans broadcasts out to every entry.

use std::collections::HashMap;
use std::net::SocketAddr;

use anyhow::{bail, Context, Result};

use crate::config::PeerConfig;

#[derive(Debug, Default)]
pub struct PeerTable {
    by_key: HashMap<[u8; 32], SocketAddr>,
}

impl PeerTable {
    pub fn from_config(peers: &[PeerConfig]) -> Result<Self> {
        let mut by_key = HashMap::with_capacity(peers.len());
        for peer in peers {
            let bytes = hex::decode(&peer.public_key)
                .with_context(|| format!("bad peer key hex: {}", peer.public_key))?;
            if bytes.len() != 32 {
                bail!("peer key {} is {} bytes, want 32", peer.public_key, bytes.len());
            }
            let mut key = [0u8; 32];
            key.copy_from_slice(&bytes);
            let addr: SocketAddr = peer
                .addr
                .parse()
                .with_context(|| format!("bad peer address: {}", peer.addr))?;
            by_key.insert(key, addr);
        }
        Ok(Self { by_key })
    }

    pub fn addr_of(&self, key: &[u8; 32]) -> Option<SocketAddr> {
        self.by_key.get(key).copied()
    }

    pub fn keys(&self) -> Vec<[u8; 32]> {
        self.by_key.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8; 32], &SocketAddr)> {
        self.by_key.iter()
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}
