//! Role-based visibility over document buckets.
//!
//! Visibility is the only place the principal's role influences the core.
//! When a principal asks for a specific resource outside their set, the
//! carrying API answers "not found" — nothing in this module (or in any
//! result shape) distinguishes "absent" from "hidden".

use crate::core::{Bucket, Role};

/// The buckets a role may read.
#[must_use]
pub const fn visible_buckets(role: Role) -> &'static [Bucket] {
    match role {
        Role::User => &[Bucket::Public],
        // Superusers read confidential content; write restrictions are
        // enforced outside the retrieval layer.
        Role::Superuser | Role::Admin => &[Bucket::Public, Bucket::Confidential],
    }
}

/// Whether `role` may read chunks from `bucket`.
#[must_use]
pub fn can_see(role: Role, bucket: Bucket) -> bool {
    visible_buckets(role).contains(&bucket)
}
