pub mod jwt;
pub mod middleware;

use bookclub_common::types::UserIdentity;

/// Verifies an identity token issued by the platform's login flow.
///
/// Rejection reasons are for logs only; clients just see that admission
/// failed.
pub trait IdentityVerifier: Send + Sync {
    fn verify(&self, token: &str) -> anyhow::Result<UserIdentity>;
}
