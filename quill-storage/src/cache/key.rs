//! Fixed-width binary cache keys for rendered responses.
//!
//! A [`CacheKey`] is the identity of a computation: every parameter that can
//! change the rendered bytes is encoded into it, and nothing else. Keys can
//! only be built through [`CacheKey::new`], which requires a tenant, so a
//! response can never be cached without a tenant scope.

use quill_core::{EntityIdType, RenderFlags, TenantId};
use std::fmt;

/// Encoded key length in bytes.
const KEY_LEN: usize = 18;

/// Which kind of response a key identifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResponseKind {
    /// A page of a tenant's post list. Subject is the page number.
    PostList = 1,
    /// A single post. Subject is the post id.
    Post = 2,
    /// Comments of a post. Subject is the post id.
    CommentList = 3,
    /// Tenant front matter (name, description). Subject is unused (0).
    TenantProfile = 4,
}

impl ResponseKind {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(ResponseKind::PostList),
            2 => Some(ResponseKind::Post),
            3 => Some(ResponseKind::CommentList),
            4 => Some(ResponseKind::TenantProfile),
            _ => None,
        }
    }
}

/// A cache key scoped to a tenant.
///
/// # Binary Format
///
/// The key encodes to a fixed 18-byte array:
/// - Byte 0: response kind discriminant
/// - Bytes 1-8: tenant id (big-endian i64)
/// - Bytes 9-16: subject (page number or object id, big-endian i64)
/// - Byte 17: render flags
///
/// Every field has a fixed width, so distinct parameter tuples always
/// produce distinct keys and equality is plain byte equality.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey([u8; KEY_LEN]);

impl CacheKey {
    /// Encoded length of every key.
    pub const LEN: usize = KEY_LEN;

    /// Build the key for a computation.
    pub fn new(kind: ResponseKind, tenant_id: TenantId, subject: i64, flags: RenderFlags) -> Self {
        let mut bytes = [0u8; KEY_LEN];
        bytes[0] = kind as u8;
        bytes[1..9].copy_from_slice(&tenant_id.as_i64().to_be_bytes());
        bytes[9..17].copy_from_slice(&subject.to_be_bytes());
        bytes[17] = flags.bits();
        Self(bytes)
    }

    /// Key of one page of a tenant's post list.
    pub fn post_list(tenant_id: TenantId, page: u32, flags: RenderFlags) -> Self {
        Self::new(ResponseKind::PostList, tenant_id, i64::from(page), flags)
    }

    /// Decode a key from bytes.
    ///
    /// Returns `None` if the slice has the wrong length, names an unknown
    /// response kind or carries unknown flag bits.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; KEY_LEN] = bytes.try_into().ok()?;
        ResponseKind::from_byte(bytes[0])?;
        RenderFlags::from_bits(bytes[17])?;
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn kind(&self) -> ResponseKind {
        // Only `new` and `decode` build keys, and both validate byte 0.
        ResponseKind::from_byte(self.0[0]).unwrap_or(ResponseKind::PostList)
    }

    pub fn tenant_id(&self) -> TenantId {
        TenantId::new(i64::from_be_bytes(Self::word(&self.0[1..9])))
    }

    pub fn subject(&self) -> i64 {
        i64::from_be_bytes(Self::word(&self.0[9..17]))
    }

    pub fn flags(&self) -> RenderFlags {
        RenderFlags::from_bits_truncate(self.0[17])
    }

    /// The tenant-scoping bytes shared by every key of one tenant.
    pub fn tenant_prefix(tenant_id: TenantId) -> [u8; 8] {
        tenant_id.as_i64().to_be_bytes()
    }

    /// Whether this key belongs to `tenant_id`.
    pub fn belongs_to(&self, tenant_id: TenantId) -> bool {
        self.0[1..9] == Self::tenant_prefix(tenant_id)
    }

    fn word(slice: &[u8]) -> [u8; 8] {
        let mut word = [0u8; 8];
        word.copy_from_slice(slice);
        word
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheKey")
            .field("kind", &self.kind())
            .field("tenant", &self.tenant_id().as_i64())
            .field("subject", &self.subject())
            .field("flags", &self.flags())
            .finish()
    }
}
