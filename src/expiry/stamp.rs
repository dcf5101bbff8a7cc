//! Expiry stamps and their binary layout.
//!
//! A stamp orders registrations by the second they become due. `seq` and
//! `writer_id` only break ties between registrations made for the same
//! second; they carry no causal meaning.
//!
//! ## Layout (16 bytes)
//!
//! ```text
//! ┌──────────────────────────┬──────────────┬──────────────┐
//! │ expire_at (8, BE, sign^) │ seq (4, BE)  │ writer (4,BE)│
//! └──────────────────────────┴──────────────┴──────────────┘
//! ```
//!
//! Flipping the sign bit of `expire_at` makes unsigned byte order equal signed
//! numeric order, so comparing encoded stamps bytewise is the same as
//! comparing stamps. The primary index relies on this: its natural key order
//! is stamp order.

use crate::error::{StoreError, StoreResult};
use bytes::{BufMut, Bytes, BytesMut};

/// Encoded size of an [`ExpiryStamp`].
pub const STAMP_LEN: usize = 16;

const SIGN_BIT: u64 = 1 << 63;

/// When a TTL registration becomes eligible for reaping.
///
/// Ordered by `expire_at`, then `seq`, then `writer_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExpiryStamp {
    /// Wall-clock second at which the registration is due
    pub expire_at: i64,
    /// Per-writer sequence number
    pub seq: u32,
    /// Id of the writer that made the registration
    pub writer_id: u32,
}

impl ExpiryStamp {
    pub fn new(expire_at: i64, seq: u32, writer_id: u32) -> Self {
        Self {
            expire_at,
            seq,
            writer_id,
        }
    }

    /// Stamp for a registration made at `now` with a TTL of `ttl_secs`.
    pub fn after(now: i64, ttl_secs: u32, seq: u32, writer_id: u32) -> Self {
        Self::new(now.saturating_add(i64::from(ttl_secs)), seq, writer_id)
    }

    /// Returns true if the registration is due at `now`.
    #[inline]
    pub fn is_due(&self, now: i64) -> bool {
        self.expire_at <= now
    }

    pub fn encode(&self) -> [u8; STAMP_LEN] {
        let mut out = [0u8; STAMP_LEN];
        out[..8].copy_from_slice(&((self.expire_at as u64) ^ SIGN_BIT).to_be_bytes());
        out[8..12].copy_from_slice(&self.seq.to_be_bytes());
        out[12..].copy_from_slice(&self.writer_id.to_be_bytes());
        out
    }

    /// Decodes a stamp from exactly [`STAMP_LEN`] bytes.
    ///
    /// `db` names the structure the bytes came from, for the error.
    pub fn decode(raw: &[u8], db: &str) -> StoreResult<Self> {
        let raw: &[u8; STAMP_LEN] = raw.try_into().map_err(|_| {
            StoreError::malformed(
                db,
                format!("stamp is {} bytes, expected {}", raw.len(), STAMP_LEN),
            )
        })?;

        let mut expire_at = [0u8; 8];
        let mut seq = [0u8; 4];
        let mut writer_id = [0u8; 4];
        expire_at.copy_from_slice(&raw[..8]);
        seq.copy_from_slice(&raw[8..12]);
        writer_id.copy_from_slice(&raw[12..]);

        Ok(Self {
            expire_at: (u64::from_be_bytes(expire_at) ^ SIGN_BIT) as i64,
            seq: u32::from_be_bytes(seq),
            writer_id: u32::from_be_bytes(writer_id),
        })
    }

    /// Primary index key: the encoded stamp followed by the target key, so
    /// equal stamps for different keys coexist.
    pub fn primary_key(&self, target: &[u8]) -> Bytes {
        let mut key = BytesMut::with_capacity(STAMP_LEN + target.len());
        key.put_slice(&self.encode());
        key.put_slice(target);
        key.freeze()
    }
}

impl std::fmt::Display for ExpiryStamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.expire_at, self.seq, self.writer_id)
    }
}
