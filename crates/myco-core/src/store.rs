//! Service records and the fixed-capacity record store.
//!
//! A record is plain-old-data: it travels inside every Deploy packet
//! unchanged, so its layout is wire format just like the packet header.
//! The store is a flat slot array — lookups are linear scans, which at
//! `MAX_SERVICES = 512` is cheaper than any index worth maintaining
//! without allocating.

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

/// Hard ceiling on the number of services a node tracks.
pub const MAX_SERVICES: usize = 512;

/// Size of a service record on the wire.
pub const RECORD_LEN: usize = 168;

/// A deployable unit: a stable 64-bit id plus the strings the executor
/// needs to build and run it. All strings are null-padded to fixed width.
#[derive(Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct ServiceRecord {
    /// Human-readable service name.
    pub name: [u8; 64],

    /// Build reference handed to the toolchain (e.g. a flake URI).
    pub flake_uri: [u8; 64],

    /// Name of the executable or unit the toolchain should run.
    pub exec_name: [u8; 32],

    /// Stable service identifier.
    pub id: U64<LittleEndian>,
}

assert_eq_size!(ServiceRecord, [u8; RECORD_LEN]);

impl ServiceRecord {
    /// Build a record from string fields. Fails if any field does not fit
    /// its fixed width.
    pub fn new(id: u64, name: &str, flake_uri: &str, exec_name: &str) -> Result<Self, StoreError> {
        let mut rec = Self::new_zeroed();
        rec.id = U64::new(id);
        copy_padded(&mut rec.name, name)?;
        copy_padded(&mut rec.flake_uri, flake_uri)?;
        copy_padded(&mut rec.exec_name, exec_name)?;
        Ok(rec)
    }

    pub fn service_id(&self) -> u64 {
        self.id.get()
    }

    pub fn name_str(&self) -> &str {
        str_field(&self.name)
    }

    pub fn flake_uri_str(&self) -> &str {
        str_field(&self.flake_uri)
    }

    pub fn exec_name_str(&self) -> &str {
        str_field(&self.exec_name)
    }
}

impl core::fmt::Debug for ServiceRecord {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ServiceRecord")
            .field("id", &self.service_id())
            .field("name", &self.name_str())
            .field("flake_uri", &self.flake_uri_str())
            .field("exec_name", &self.exec_name_str())
            .finish()
    }
}

impl PartialEq for ServiceRecord {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for ServiceRecord {}

impl Default for ServiceRecord {
    fn default() -> Self {
        Self::new_zeroed()
    }
}

fn copy_padded(dst: &mut [u8], src: &str) -> Result<(), StoreError> {
    let bytes = src.as_bytes();
    if bytes.len() > dst.len() {
        return Err(StoreError::FieldTooLong {
            len: bytes.len(),
            max: dst.len(),
        });
    }
    dst[..bytes.len()].copy_from_slice(bytes);
    Ok(())
}

fn str_field(field: &[u8]) -> &str {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    core::str::from_utf8(&field[..end]).unwrap_or("")
}

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    id: u64,
    active: bool,
    record: ServiceRecord,
}

/// Fixed-capacity store of service records, the source of truth for the
/// payload that accompanies a version. A record exists iff some slot holds
/// its id and is active. Eviction only happens by overwrite on a newer
/// version; there is deliberately no remove.
pub struct Store {
    slots: [Slot; MAX_SERVICES],
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            slots: [Slot::default(); MAX_SERVICES],
        }
    }

    /// Insert or overwrite the record for its id.
    pub fn put(&mut self, record: ServiceRecord) -> Result<(), StoreError> {
        let id = record.service_id();
        if let Some(slot) = self.slots.iter_mut().find(|s| s.active && s.id == id) {
            slot.record = record;
            return Ok(());
        }
        if let Some(slot) = self.slots.iter_mut().find(|s| !s.active) {
            *slot = Slot {
                id,
                active: true,
                record,
            };
            return Ok(());
        }
        Err(StoreError::Full)
    }

    /// Whether a `put` for this id would succeed.
    pub fn can_accept(&self, id: u64) -> bool {
        self.slots
            .iter()
            .any(|s| (s.active && s.id == id) || !s.active)
    }

    pub fn get(&self, id: u64) -> Option<&ServiceRecord> {
        self.slots
            .iter()
            .find(|s| s.active && s.id == id)
            .map(|s| &s.record)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&ServiceRecord> {
        self.slots
            .iter()
            .find(|s| s.active && s.record.name_str() == name)
            .map(|s| &s.record)
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.active).count()
    }

    pub fn is_empty(&self) -> bool {
        !self.slots.iter().any(|s| s.active)
    }
}

/// Errors surfaced by the store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("no free slot for a new service ({MAX_SERVICES} in use)")]
    Full,

    #[error("record field of {len} bytes exceeds fixed width {max}")]
    FieldTooLong { len: usize, max: usize },
}
