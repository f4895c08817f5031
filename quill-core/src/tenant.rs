//! Tenant records and shard routing.
//!
//! Every tenant's posts and comments live on exactly one backing-store
//! shard. The shard is chosen by [`ShardRouter::assign`] when the tenant is
//! created and stored in the tenant record, so later lookups never
//! recompute it. Changing the shard count therefore never moves existing
//! tenants.

use crate::{ConfigError, QuillResult, ShardId, TenantId, Timestamp};
use serde::{Deserialize, Serialize};

/// A tenant: one publication hosted by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub tenant_id: TenantId,
    /// URL-safe name, e.g. the subdomain.
    pub slug: String,
    /// Shard owning this tenant's data. Fixed at creation.
    pub shard_id: ShardId,
    pub created_at: Timestamp,
}

impl Tenant {
    /// The shard that owns this tenant's data.
    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }
}

/// Assigns tenants to shards.
///
/// `assign` is a pure, total function of the tenant id and the shard count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardRouter {
    shard_count: u16,
}

impl ShardRouter {
    /// Create a router over `shard_count` shards.
    pub fn new(shard_count: usize) -> QuillResult<Self> {
        let count = u16::try_from(shard_count).ok().filter(|c| *c > 0).ok_or_else(|| {
            ConfigError::InvalidValue {
                field: "shard_count".to_string(),
                value: shard_count.to_string(),
                reason: "shard_count must be between 1 and 65535".to_string(),
            }
        })?;
        Ok(Self { shard_count: count })
    }

    pub fn shard_count(&self) -> usize {
        self.shard_count as usize
    }

    /// Pick the shard for a newly created tenant.
    pub fn assign(&self, tenant_id: TenantId) -> ShardId {
        use crate::EntityIdType;
        let slot = tenant_id.as_i64().rem_euclid(i64::from(self.shard_count));
        ShardId::new(slot as u16)
    }

    /// Whether `shard` names one of this router's shards.
    pub fn contains(&self, shard: ShardId) -> bool {
        shard.as_u16() < self.shard_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EntityIdType;
    use proptest::prelude::*;

    #[test]
    fn test_router_rejects_zero_shards() {
        assert!(ShardRouter::new(0).is_err());
        assert!(ShardRouter::new(70_000).is_err());
        assert!(ShardRouter::new(1).is_ok());
    }

    #[test]
    fn test_single_shard_routes_everything_to_zero() {
        let router = ShardRouter::new(1).unwrap();
        assert_eq!(router.assign(TenantId::new(12345)), ShardId::new(0));
        assert_eq!(router.assign(TenantId::new(-8)), ShardId::new(0));
    }

    #[test]
    fn test_tenant_shard_is_the_stored_one() {
        let tenant = Tenant {
            tenant_id: TenantId::new(5),
            slug: "field-notes".to_string(),
            shard_id: ShardId::new(1),
            created_at: chrono::Utc::now(),
        };
        // A later router with a different shard count must not matter.
        let router = ShardRouter::new(8).unwrap();
        assert_ne!(router.assign(tenant.tenant_id), tenant.shard_id());
        assert_eq!(tenant.shard_id(), ShardId::new(1));
    }

    proptest! {
        #[test]
        fn prop_assign_is_stable_and_in_range(raw in any::<i64>(), count in 1usize..64) {
            let router = ShardRouter::new(count).unwrap();
            let tenant = TenantId::new(raw);
            let first = router.assign(tenant);
            prop_assert!(router.contains(first));
            for _ in 0..4 {
                prop_assert_eq!(router.assign(tenant), first);
            }
        }
    }
}
