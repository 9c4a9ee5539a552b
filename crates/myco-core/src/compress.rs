//! Byte-oriented LZ77-style payload compressor.
//!
//! Digest payloads repeat themselves heavily (varint id runs, clustered
//! wall deltas), so a 64-byte window with 2-byte backrefs captures most of
//! the redundancy at a fraction of the complexity of a real entropy coder.
//!
//! Stream layout: a 2-byte little-endian uncompressed length, then tokens.
//! Literal run: `[len-1][bytes]` with len ≤ 128 (high bit clear).
//! Backref:     `[0x80|len-3][distance]` with distance 1..=64, len 3..=66.
//!
//! Compression is declared successful only when the output is strictly
//! shorter than the input; callers fall back to the raw bytes otherwise.

/// Furthest back a match may reach.
pub const MAX_DISTANCE: usize = 64;

/// Longest match a single backref can encode.
pub const MAX_MATCH: usize = 66;

/// Shortest match worth a backref. Below this a literal is smaller.
pub const MIN_MATCH: usize = 3;

/// Longest literal run a single token can carry.
const MAX_LITERAL_RUN: usize = 128;

/// Compress `src` into `out`. Returns the compressed length, or None when
/// the result would not be strictly shorter than the input (or would not
/// fit `out`).
pub fn compress(src: &[u8], out: &mut [u8]) -> Option<usize> {
    if src.is_empty() || src.len() > u16::MAX as usize || out.len() < 2 {
        return None;
    }
    out[..2].copy_from_slice(&(src.len() as u16).to_le_bytes());
    let mut pos = 2usize;
    let mut i = 0usize;
    let mut lit_start = 0usize;

    while i < src.len() {
        let (best_len, best_dist) = longest_match(src, i);
        if best_len >= MIN_MATCH {
            emit_literals(src, lit_start, i, out, &mut pos)?;
            if pos + 2 > out.len() {
                return None;
            }
            out[pos] = 0x80 | (best_len - MIN_MATCH) as u8;
            out[pos + 1] = best_dist as u8;
            pos += 2;
            i += best_len;
            lit_start = i;
        } else {
            i += 1;
        }
    }
    emit_literals(src, lit_start, src.len(), out, &mut pos)?;

    (pos < src.len()).then_some(pos)
}

fn longest_match(src: &[u8], at: usize) -> (usize, usize) {
    let mut best_len = 0;
    let mut best_dist = 0;
    let limit = (src.len() - at).min(MAX_MATCH);
    for dist in 1..=at.min(MAX_DISTANCE) {
        let mut len = 0;
        // Matches may overlap their own output (dist < len), which the
        // decoder reproduces byte by byte.
        while len < limit && src[at + len] == src[at - dist + len] {
            len += 1;
        }
        if len > best_len {
            best_len = len;
            best_dist = dist;
            if len == limit {
                break;
            }
        }
    }
    (best_len, best_dist)
}

fn emit_literals(
    src: &[u8],
    mut start: usize,
    end: usize,
    out: &mut [u8],
    pos: &mut usize,
) -> Option<()> {
    while start < end {
        let chunk = (end - start).min(MAX_LITERAL_RUN);
        if *pos + 1 + chunk > out.len() {
            return None;
        }
        out[*pos] = (chunk - 1) as u8;
        out[*pos + 1..*pos + 1 + chunk].copy_from_slice(&src[start..start + chunk]);
        *pos += 1 + chunk;
        start += chunk;
    }
    Some(())
}

/// Expand `src` into `out`, returning the produced length.
pub fn decompress(src: &[u8], out: &mut [u8]) -> Result<usize, CompressError> {
    if src.len() < 2 {
        return Err(CompressError::Truncated);
    }
    let expected = u16::from_le_bytes([src[0], src[1]]) as usize;
    if expected > out.len() {
        return Err(CompressError::TooLong { len: expected });
    }
    let mut pos = 2usize;
    let mut produced = 0usize;

    while pos < src.len() {
        let token = src[pos];
        pos += 1;
        if token & 0x80 != 0 {
            let len = (token & 0x7F) as usize + MIN_MATCH;
            let dist = *src.get(pos).ok_or(CompressError::Truncated)? as usize;
            pos += 1;
            if dist == 0 || dist > produced {
                return Err(CompressError::BadDistance { dist, produced });
            }
            if produced + len > out.len() {
                return Err(CompressError::TooLong { len: produced + len });
            }
            for k in 0..len {
                out[produced + k] = out[produced + k - dist];
            }
            produced += len;
        } else {
            let len = token as usize + 1;
            if pos + len > src.len() {
                return Err(CompressError::Truncated);
            }
            if produced + len > out.len() {
                return Err(CompressError::TooLong { len: produced + len });
            }
            out[produced..produced + len].copy_from_slice(&src[pos..pos + len]);
            pos += len;
            produced += len;
        }
    }
    if produced != expected {
        return Err(CompressError::Truncated);
    }
    Ok(produced)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompressError {
    #[error("compressed stream ends mid-token")]
    Truncated,

    #[error("backref distance {dist} invalid at {produced} produced bytes")]
    BadDistance { dist: usize, produced: usize },

    #[error("decompressed length {len} exceeds the output buffer")]
    TooLong { len: usize },
}
