//! Bearer-token authentication and the admin-only access policy.
//!
//! Requests are authenticated by [`middleware::auth_middleware`], which turns
//! a valid token into a [`Principal`] request extension. Privileged routes
//! additionally pass through [`middleware::admin_only`], which applies
//! [`gate::require_admin`].

pub mod gate;
pub mod middleware;
pub mod token;

pub use gate::{require_admin, ADMIN_SUBJECT};
pub use token::TokenAuthority;

/// The authenticated identity of a request, taken from the token subject.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Principal {
    pub subject: String,
}

/// Why a request was refused. Every variant except `Forbidden` is reported
/// to the client as a plain 401; the distinction only reaches the log.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("no token supplied")]
    Missing,

    #[error("invalid token: {0}")]
    Invalid(String),

    #[error("token expired")]
    Expired,

    #[error("forbidden")]
    Forbidden,
}
