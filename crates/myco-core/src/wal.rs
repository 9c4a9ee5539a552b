//! Append-only ring over a caller-provided byte buffer.
//!
//! The WAL persists exactly one thing: a monotonic u64 knowledge watermark.
//! Recovery only needs the highest value that survived, so a frame is as
//! small as it can be — the 8 big-endian value bytes plus a CRC32 over
//! them. Frames with a bad CRC are skipped silently; a torn write costs at
//! most one frame of history.

/// Bytes per frame: 8-byte big-endian value + 4-byte CRC32 (little-endian).
pub const FRAME_LEN: usize = 12;

/// Write-ahead log over an externally owned buffer.
///
/// The writer owns a head offset and wraps when a frame would run past the
/// end of the buffer. The caller decides how the buffer is persisted (mmap,
/// plain file, nothing at all for tests).
#[derive(Debug)]
pub struct Wal {
    buf: Box<[u8]>,
    head: usize,
}

impl Wal {
    /// Take ownership of `buf`. Fails if a single frame cannot fit.
    pub fn new(buf: Box<[u8]>) -> Result<Self, WalError> {
        if buf.len() < FRAME_LEN {
            return Err(WalError::BufferTooSmall { len: buf.len() });
        }
        Ok(Self { buf, head: 0 })
    }

    /// Append a frame at the head, wrapping first if it would not fit.
    pub fn append(&mut self, value: u64) {
        if self.head + FRAME_LEN > self.buf.len() {
            self.head = 0;
        }
        let frame = &mut self.buf[self.head..self.head + FRAME_LEN];
        let be = value.to_be_bytes();
        frame[..8].copy_from_slice(&be);
        frame[8..].copy_from_slice(&crc32fast::hash(&be).to_le_bytes());
        self.head += FRAME_LEN;
    }

    /// Scan every frame slot and return the highest value whose CRC checks
    /// out, or 0 if none does. Zeroed and torn frames fail the CRC and are
    /// skipped.
    pub fn recover(&self) -> u64 {
        let mut best = 0u64;
        let mut off = 0;
        while off + FRAME_LEN <= self.buf.len() {
            let frame = &self.buf[off..off + FRAME_LEN];
            let stored_crc = u32::from_le_bytes([frame[8], frame[9], frame[10], frame[11]]);
            if crc32fast::hash(&frame[..8]) == stored_crc {
                let value = u64::from_be_bytes(frame[..8].try_into().unwrap_or([0; 8]));
                best = best.max(value);
            }
            off += FRAME_LEN;
        }
        best
    }

    /// The underlying buffer. Embedders that persist the WAL (mmap, plain
    /// file) read it from here after draining a tick.
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Current head offset. Test hook.
    #[cfg(test)]
    pub(crate) fn head(&self) -> usize {
        self.head
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WalError {
    #[error("wal buffer of {len} bytes cannot hold a {FRAME_LEN}-byte frame")]
    BufferTooSmall { len: usize },
}
