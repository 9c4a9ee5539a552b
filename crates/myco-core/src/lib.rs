//! myco-core — the replicated node engine.
//!
//! A deterministic, allocation-free state machine that owns a service
//! registry, timestamps mutations with a hybrid logical clock, exchanges
//! compact digests with peers over a fixed-size datagram protocol, and
//! hands accepted service records to an executor callback. The daemon
//! crate (mycod) wraps it in sockets, config, and a real executor.

pub mod compress;
pub mod crypto;
pub mod digest;
pub mod hlc;
pub mod missing;
pub mod node;
pub mod packet;
pub mod registry;
pub mod store;
pub mod wal;

pub use crypto::{Identity, NoAuth, PacketAuth};
pub use node::{Executor, InitError, InjectError, Node, NodeOptions, NodeStorage, Outbound};
pub use packet::{MsgType, Packet};
pub use registry::Entry;
pub use store::ServiceRecord;
