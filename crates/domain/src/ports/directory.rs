use crate::DomainResult;
use crate::identity::UserRef;

/// Rebuildable cache of display snapshots keyed by user id, fed from the
/// identity provider's token claims as identities are seen.
pub trait UserDirectory: Send + Sync {
    fn record(&self, user: &UserRef) -> crate::ports::BoxFuture<'_, DomainResult<()>>;

    fn resolve(
        &self,
        user_id: &str,
    ) -> crate::ports::BoxFuture<'_, DomainResult<Option<UserRef>>>;
}
