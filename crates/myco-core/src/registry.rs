//! Last-writer-wins version registry.
//!
//! Maps service id to its highest known HLC version and tracks two digest
//! projections on top of that map: a dirty set (ids mutated since the last
//! drain, feeding the per-tick Sync delta) and a recency ring (the most
//! recently updated ids, feeding the periodic Control digest). A third
//! projection, the uniform random sample, is computed on demand.

use rand::Rng;

use crate::hlc;
use crate::store::MAX_SERVICES;

/// Length of the recency ring.
pub const RECENT_RING: usize = 32;

/// A single (id, version) digest entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Entry {
    pub id: u64,
    pub version: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    id: u64,
    version: u64,
    used: bool,
    dirty: bool,
}

/// Fixed-capacity id → version map with digest projections.
pub struct Registry {
    slots: [Slot; MAX_SERVICES],
    /// Recency ring, oldest first — newest entries live at the tail so a
    /// promotion is a slice shift plus a tail write.
    recent: heapless::Vec<u64, RECENT_RING>,
    live: usize,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            slots: [Slot::default(); MAX_SERVICES],
            recent: heapless::Vec::new(),
            live: 0,
        }
    }

    /// Record `version` for `id` if it is new or strictly newer than what
    /// is held. Returns true iff the map changed; on change the id is
    /// marked dirty and promoted to the newest end of the recency ring.
    pub fn update(&mut self, id: u64, version: u64) -> bool {
        if let Some(slot) = self.slots.iter_mut().find(|s| s.used && s.id == id) {
            if !hlc::newer(version, slot.version) {
                return false;
            }
            slot.version = version;
            slot.dirty = true;
            self.touch_recent(id);
            return true;
        }
        match self.slots.iter_mut().find(|s| !s.used) {
            Some(slot) => {
                *slot = Slot {
                    id,
                    version,
                    used: true,
                    dirty: true,
                };
                self.live += 1;
                self.touch_recent(id);
                true
            }
            // Registry full: the node is at its service ceiling. Callers
            // gate on store capacity first, so this is a backstop.
            None => false,
        }
    }

    /// The held version for `id`, or 0 if absent.
    pub fn version_of(&self, id: u64) -> u64 {
        self.slots
            .iter()
            .find(|s| s.used && s.id == id)
            .map_or(0, |s| s.version)
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Copy up to `out.len()` dirty entries into `out`, clearing their
    /// dirty bits. Entries that do not fit stay dirty for the next drain.
    pub fn drain_dirty(&mut self, out: &mut [Entry]) -> usize {
        let mut n = 0;
        for slot in self.slots.iter_mut() {
            if n == out.len() {
                break;
            }
            if slot.used && slot.dirty {
                out[n] = Entry {
                    id: slot.id,
                    version: slot.version,
                };
                slot.dirty = false;
                n += 1;
            }
        }
        n
    }

    /// Copy the recency ring, newest first, into `out`. Clears nothing.
    pub fn copy_recent(&self, out: &mut [Entry]) -> usize {
        let n = self.recent.len().min(out.len());
        for (e, &id) in out.iter_mut().zip(self.recent.iter().rev()) {
            *e = Entry {
                id,
                version: self.version_of(id),
            };
        }
        n
    }

    /// Fill `out` with entries drawn uniformly at random from the live set,
    /// no repeats within one call. Classic reservoir sampling.
    pub fn sample(&self, out: &mut [Entry], rng: &mut impl Rng) -> usize {
        let k = out.len();
        let mut seen = 0usize;
        for slot in self.slots.iter().filter(|s| s.used) {
            let entry = Entry {
                id: slot.id,
                version: slot.version,
            };
            if seen < k {
                out[seen] = entry;
            } else {
                let j = rng.gen_range(0..=seen);
                if j < k {
                    out[j] = entry;
                }
            }
            seen += 1;
        }
        seen.min(k)
    }

    /// Promote `id` to the newest end of the recency ring, evicting the
    /// oldest entry if the ring is full.
    fn touch_recent(&mut self, id: u64) {
        if let Some(pos) = self.recent.iter().position(|&r| r == id) {
            self.recent.copy_within(pos + 1.., pos);
        } else if self.recent.push(id).is_ok() {
            return;
        } else {
            self.recent.copy_within(1.., 0);
        }
        let tail = self.recent.len() - 1;
        self.recent[tail] = id;
    }
}
