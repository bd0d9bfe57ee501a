pub mod document;
pub mod singbox;

#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use std::path::Path;

pub use document::{Inbound, ProxyDocument, UserCredential};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("configuration rejected: {0}")]
    Invalid(String),

    #[error("restart failed: {0}")]
    Restart(String),

    #[error("timed out after {0}s")]
    Timeout(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// The externally managed proxy process. The crate never speaks the proxy's
/// protocol; it only asks the service to check a configuration document and
/// to (re)start from one.
#[async_trait]
pub trait ProxyController: Send + Sync {
    /// Statically validate the document at `config`. Must not touch the
    /// running instance.
    async fn validate(&self, config: &Path) -> Result<(), ControllerError>;

    /// Restart the proxy so that it serves the document at `config`.
    async fn restart(&self, config: &Path) -> Result<(), ControllerError>;
}
