use super::{AuthError, Principal};

/// Reserved subject of the administrator principal.
pub const ADMIN_SUBJECT: &str = "admin";

/// Exact, case-sensitive match against [`ADMIN_SUBJECT`]. No trimming, no
/// roles.
pub fn require_admin(principal: &Principal) -> Result<(), AuthError> {
    if principal.subject == ADMIN_SUBJECT {
        Ok(())
    } else {
        Err(AuthError::Forbidden)
    }
}
