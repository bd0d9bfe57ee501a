//! The parts of the sing-box configuration document this crate reads and
//! writes. Everything else in the document is carried through untouched via
//! the flattened `extra` maps.

use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::distr::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::auth::ADMIN_SUBJECT;
use crate::error::{Error, Result};

pub const DOCUMENT_FILE: &str = "sing-box-config.json";

/// Cipher used for freshly initialised servers.
pub const DEFAULT_METHOD: &str = "chacha20-ietf-poly1305";

/// Local SOCKS listener placed in client configs, for testing the profile
/// directly with sing-box. Clients importing the profile replace it.
const CLIENT_SOCKS_PORT: u16 = 8888;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCredential {
    pub name: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Inbound {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen: Option<String>,
    #[serde(default)]
    pub listen_port: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,
    /// Primary credential, used by the admin principal.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<UserCredential>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Inbound {
    /// Secret for `name`; the admin resolves to the primary password, never
    /// to the per-user list.
    pub fn password_for(&self, name: &str) -> Option<&str> {
        if name == ADMIN_SUBJECT {
            return Some(self.password.as_str()).filter(|p| !p.is_empty());
        }
        self.users
            .iter()
            .find(|u| u.name == name)
            .map(|u| u.password.as_str())
    }

    pub fn add_user(&mut self, name: &str, password: String) {
        self.users.push(UserCredential {
            name: name.to_string(),
            password,
        });
    }

    /// Remove every entry named `name`. Returns whether anything was removed.
    pub fn remove_user(&mut self, name: &str) -> bool {
        let before = self.users.len();
        self.users.retain(|u| u.name != name);
        self.users.len() < before
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<Value>,
    #[serde(default)]
    pub inbounds: Vec<Inbound>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ProxyDocument {
    /// Minimal server document: one shadowsocks inbound on all interfaces.
    pub fn basic(listen_port: u16) -> Self {
        Self {
            log: Some(json!({ "level": "debug", "output": "stdout" })),
            inbounds: vec![Inbound {
                kind: "shadowsocks".into(),
                tag: Some("ss-inbound".into()),
                listen: Some("0.0.0.0".into()),
                listen_port,
                method: DEFAULT_METHOD.into(),
                password: generate_secret(DEFAULT_METHOD),
                users: Vec::new(),
                extra: Map::new(),
            }],
            extra: Map::new(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        Self::from_slice(&data)
    }

    pub fn from_slice(data: &[u8]) -> Result<Self> {
        let doc: Self = serde_json::from_slice(data)?;
        doc.shadowsocks()?;
        Ok(doc)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// The managed inbound: the first one, which must be shadowsocks.
    pub fn shadowsocks(&self) -> Result<&Inbound> {
        match self.inbounds.first() {
            Some(inbound) if inbound.kind == "shadowsocks" => Ok(inbound),
            Some(_) => Err(Error::Config("inbound is not shadowsocks".into())),
            None => Err(Error::Config("no inbounds found, invalid config".into())),
        }
    }

    pub fn shadowsocks_mut(&mut self) -> Result<&mut Inbound> {
        match self.inbounds.first_mut() {
            Some(inbound) if inbound.kind == "shadowsocks" => Ok(inbound),
            Some(_) => Err(Error::Config("inbound is not shadowsocks".into())),
            None => Err(Error::Config("no inbounds found, invalid config".into())),
        }
    }

    /// Client profile connecting to this server as a user with `password`.
    pub fn client_config(&self, server: &str, password: &str) -> Result<Value> {
        let inbound = self.shadowsocks()?;
        Ok(json!({
            "log": { "level": "debug", "output": "stdout" },
            "inbounds": [{
                "type": "socks",
                "tag": "socks-in",
                "listen": "127.0.0.1",
                "listen_port": CLIENT_SOCKS_PORT,
            }],
            "outbounds": [{
                "type": "shadowsocks",
                "tag": "ss-outbound",
                "server": server,
                "server_port": inbound.listen_port,
                "method": inbound.method,
                "password": password,
            }],
        }))
    }
}

/// Random secret sized for the inbound's cipher. The 2022 ciphers need a
/// base64 key of exactly the cipher's key length; the legacy AEAD ciphers
/// accept any password.
pub fn generate_secret(method: &str) -> String {
    let mut rng = rand::rng();
    match method {
        "2022-blake3-aes-128-gcm" => {
            let mut key = [0u8; 16];
            rng.fill(&mut key);
            STANDARD.encode(key)
        }
        "2022-blake3-aes-256-gcm" | "2022-blake3-chacha20-poly1305" => {
            let mut key = [0u8; 32];
            rng.fill(&mut key);
            STANDARD.encode(key)
        }
        _ => {
            let password: String = (&mut rng)
                .sample_iter(&Alphanumeric)
                .take(32)
                .map(char::from)
                .collect();
            STANDARD.encode(password)
        }
    }
}
