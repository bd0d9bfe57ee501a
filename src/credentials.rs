//! Per-user proxy credentials, stored inside the proxy's own configuration
//! document.
//!
//! # Single writer
//!
//! Every mutation runs inside one async mutex that covers the whole
//! read → modify → write → validate → replace → restart sequence. Two
//! concurrent requests for the same unknown user therefore cannot both
//! append, and two requests for different users cannot clobber each other's
//! write.
//!
//! # Durability
//!
//! The new document is staged next to the live one and handed to the
//! controller for validation first, so a malformed document never replaces
//! a working one. If the restart then fails, the previous bytes are put
//! back: the running proxy is still serving the old document and the file
//! on disk keeps matching it. Nothing is cached in memory; every operation
//! re-reads the document.
//!
//! Mutations are detached onto their own task, so a client hanging up
//! mid-request cannot interrupt a half-finished persist.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;

use crate::auth::ADMIN_SUBJECT;
use crate::error::{Error, Result};
use crate::proxy::document::{generate_secret, DOCUMENT_FILE};
use crate::proxy::{ProxyController, ProxyDocument};
use crate::util;

/// Outcome of [`CredentialStore::revoke`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Revocation {
    Removed,
    /// Nothing to do; the document and the proxy were left alone.
    NotPresent,
}

pub struct CredentialStore {
    document_path: PathBuf,
    controller: Arc<dyn ProxyController>,
    writer: Mutex<()>,
}

impl CredentialStore {
    /// Open the document in `data_dir`. A missing or malformed document is a
    /// configuration error.
    pub fn open(data_dir: &Path, controller: Arc<dyn ProxyController>) -> Result<Self> {
        let document_path = data_dir.join(DOCUMENT_FILE);
        let doc = ProxyDocument::load(&document_path).map_err(|e| {
            Error::Config(format!(
                "cannot load proxy document {}: {}",
                document_path.display(),
                e
            ))
        })?;

        log::info!(
            "Credential store loaded: {} users",
            doc.shadowsocks()?.users.len()
        );

        Ok(Self {
            document_path,
            controller,
            writer: Mutex::new(()),
        })
    }

    pub fn document_path(&self) -> &Path {
        &self.document_path
    }

    /// Secret for `username`, provisioning one if the user is unknown.
    pub async fn get_or_create(self: &Arc<Self>, username: &str) -> Result<String> {
        let (_, secret) = self.provision(username).await?;
        Ok(secret)
    }

    /// Client profile for `username` connecting to `server`, provisioning
    /// the user on first use.
    pub async fn connect_config(self: &Arc<Self>, username: &str, server: &str) -> Result<Value> {
        let (doc, secret) = self.provision(username).await?;
        doc.client_config(server, &secret)
    }

    /// Remove `username`'s credential and restart the proxy.
    pub async fn revoke(self: &Arc<Self>, username: &str) -> Result<Revocation> {
        if username == ADMIN_SUBJECT {
            return Err(Error::InvalidRequest(
                "the admin credential cannot be revoked".into(),
            ));
        }

        let store = Arc::clone(self);
        let name = username.to_string();
        detached(async move {
            let _guard = store.writer.lock().await;

            let (previous, mut doc) = store.read()?;
            if !doc.shadowsocks_mut()?.remove_user(&name) {
                log::info!("Revoke requested for unknown user {}", name);
                return Ok(Revocation::NotPresent);
            }

            store.commit(&previous, &doc).await?;
            log::info!("AUDIT action=revoke user={}", name);
            Ok(Revocation::Removed)
        })
        .await
    }

    /// Names of all provisioned (non-admin) users, in document order.
    pub async fn list(&self) -> Result<Vec<String>> {
        let _guard = self.writer.lock().await;
        let (_, doc) = self.read()?;
        Ok(doc
            .shadowsocks()?
            .users
            .iter()
            .map(|u| u.name.clone())
            .collect())
    }

    async fn provision(self: &Arc<Self>, username: &str) -> Result<(ProxyDocument, String)> {
        if username.is_empty() {
            return Err(Error::InvalidRequest("empty username".into()));
        }

        let store = Arc::clone(self);
        let name = username.to_string();
        detached(async move {
            // Lookups take the lock too: the document on disk may be a
            // candidate whose restart has not succeeded yet.
            let _guard = store.writer.lock().await;

            let (previous, mut doc) = store.read()?;
            let inbound = doc.shadowsocks_mut()?;
            if let Some(secret) = inbound.password_for(&name) {
                let secret = secret.to_string();
                return Ok((doc, secret));
            }
            if name == ADMIN_SUBJECT {
                return Err(Error::Config("admin password missing from proxy document".into()));
            }

            let secret = generate_secret(&inbound.method);
            inbound.add_user(&name, secret.clone());

            store.commit(&previous, &doc).await?;
            log::info!("AUDIT action=provision user={}", name);
            Ok((doc, secret))
        })
        .await
    }

    fn read(&self) -> Result<(Vec<u8>, ProxyDocument)> {
        let bytes = std::fs::read(&self.document_path)?;
        let doc = ProxyDocument::from_slice(&bytes)?;
        Ok((bytes, doc))
    }

    /// Stage, validate, replace, restart. Caller must hold `writer`.
    async fn commit(&self, previous: &[u8], doc: &ProxyDocument) -> Result<()> {
        let data = doc.to_bytes()?;
        let staged = util::staged_path(&self.document_path);
        util::atomic_write_private(&staged, &data)?;

        if let Err(e) = self.controller.validate(&staged).await {
            let _ = std::fs::remove_file(&staged);
            log::error!("Proxy rejected the updated document: {}", e);
            return Err(Error::Provisioning(format!("document rejected: {}", e)));
        }

        if let Err(e) = std::fs::rename(&staged, &self.document_path) {
            let _ = std::fs::remove_file(&staged);
            return Err(e.into());
        }

        if let Err(e) = self.controller.restart(&self.document_path).await {
            log::error!(
                "Proxy restart failed, restoring previous document {}: {}",
                self.document_path.display(),
                e
            );
            if let Err(restore) = util::atomic_write_private(&self.document_path, previous) {
                log::error!("Failed to restore previous document: {}", restore);
            }
            return Err(Error::Provisioning(format!("restart failed: {}", e)));
        }

        Ok(())
    }
}

/// Run `fut` on its own task so that dropping the caller does not cancel it.
async fn detached<T, F>(fut: F) -> Result<T>
where
    T: Send + 'static,
    F: std::future::Future<Output = Result<T>> + Send + 'static,
{
    tokio::spawn(fut)
        .await
        .map_err(|e| Error::Provisioning(format!("credential task failed: {}", e)))?
}
