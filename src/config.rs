use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rand::distr::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::auth::{TokenAuthority, ADMIN_SUBJECT};
use crate::error::{Error, Result};
use crate::proxy::document::DOCUMENT_FILE;
use crate::proxy::ProxyDocument;
use crate::tls::signing::{DEFAULT_SIGNING_ENDPOINT, DEFAULT_SIGNING_TIMEOUT};
use crate::util;

pub const SERVER_FILE: &str = "server.json";
const SECRET_LEN: usize = 32;

/// Expiry of the bootstrap admin token.
pub fn admin_expiration() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2900, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Random non-privileged port.
pub fn random_port() -> u16 {
    rand::rng().random_range(1024..=u16::MAX)
}

/// Persisted server identity and API credentials (`server.json`).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub external_ip: String,
    pub port: u16,
    pub access_token: String,
    pub hmac_secret: String,
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("external_ip", &self.external_ip)
            .field("port", &self.port)
            .field("access_token", &"<redacted>")
            .field("hmac_secret", &"<redacted>")
            .finish()
    }
}

impl ServerConfig {
    pub fn path(data_dir: &Path) -> PathBuf {
        data_dir.join(SERVER_FILE)
    }

    /// Load and validate `server.json`. Every field is required.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = Self::path(data_dir);
        let data = std::fs::read(&path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_slice(&data)
            .map_err(|e| Error::Config(format!("invalid {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.external_ip.is_empty() {
            return Err(Error::Config("external_ip is missing".into()));
        }
        if self.port == 0 {
            return Err(Error::Config("port is missing".into()));
        }
        if self.access_token.is_empty() {
            return Err(Error::Config("access_token is missing".into()));
        }
        if self.hmac_secret.is_empty() {
            return Err(Error::Config("hmac_secret is missing".into()));
        }
        Ok(())
    }

    /// Create a fresh `server.json` with a new HMAC secret and admin token.
    /// Refuses to overwrite an existing file.
    pub fn generate(data_dir: &Path, external_ip: &str, port: Option<u16>) -> Result<Self> {
        let path = Self::path(data_dir);
        if path.exists() {
            return Err(Error::Config(format!("{} already exists", path.display())));
        }
        if external_ip.is_empty() {
            return Err(Error::Config("a public IP is required to initialize".into()));
        }

        let hmac_secret: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(SECRET_LEN)
            .map(char::from)
            .collect();
        let access_token = TokenAuthority::new(hmac_secret.as_bytes())?
            .issue(ADMIN_SUBJECT, Some(admin_expiration()))?;

        let config = Self {
            external_ip: external_ip.to_string(),
            port: port.unwrap_or_else(random_port),
            access_token,
            hmac_secret,
        };
        util::atomic_write_private(&path, &serde_json::to_vec_pretty(&config)?)?;
        log::info!("Wrote {}", path.display());
        Ok(config)
    }

    pub fn token_authority(&self) -> Result<TokenAuthority> {
        TokenAuthority::new(self.hmac_secret.as_bytes())
    }

    /// Import link handed to the client application.
    pub fn new_server_url(&self) -> String {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("ip", &self.external_ip)
            .append_pair("port", &self.port.to_string())
            .append_pair("token", &self.access_token)
            .finish();
        format!("lantern://new-private-server?{}", query)
    }
}

/// Write the basic proxy document (one shadowsocks inbound). Refuses to
/// overwrite an existing document.
pub fn write_basic_document(data_dir: &Path, port: Option<u16>) -> Result<ProxyDocument> {
    let path = data_dir.join(DOCUMENT_FILE);
    if path.exists() {
        return Err(Error::Config(format!("{} already exists", path.display())));
    }
    let doc = ProxyDocument::basic(port.unwrap_or_else(random_port));
    util::atomic_write_private(&path, &doc.to_bytes()?)?;
    log::info!("Wrote {}", path.display());
    Ok(doc)
}

/// Runtime options, collected from the command line and environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub public_ip: Option<String>,
    pub api_port: Option<u16>,
    pub vpn_port: Option<u16>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    /// CA bundle the reachability probe trusts in addition to the defaults.
    pub ca_cert: Option<PathBuf>,
    pub sign_cert: bool,
    pub signing_endpoint: String,
    pub signing_timeout: Duration,
    pub sing_box_binary: PathBuf,
    pub no_systemd: bool,
}

impl Settings {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            public_ip: None,
            api_port: None,
            vpn_port: None,
            tls_cert: None,
            tls_key: None,
            ca_cert: None,
            sign_cert: false,
            signing_endpoint: DEFAULT_SIGNING_ENDPOINT.to_string(),
            signing_timeout: DEFAULT_SIGNING_TIMEOUT,
            sing_box_binary: PathBuf::from(crate::proxy::singbox::DEFAULT_BINARY),
            no_systemd: std::env::var("NO_SYSTEMD").is_ok_and(|v| !v.is_empty()),
        }
    }

    pub fn server_file(&self) -> PathBuf {
        ServerConfig::path(&self.data_dir)
    }

    pub fn document_file(&self) -> PathBuf {
        self.data_dir.join(DOCUMENT_FILE)
    }

    /// Both override paths or neither.
    pub fn tls_overrides(&self) -> Result<Option<(PathBuf, PathBuf)>> {
        match (&self.tls_cert, &self.tls_key) {
            (Some(cert), Some(key)) => Ok(Some((cert.clone(), key.clone()))),
            (None, None) => Ok(None),
            _ => Err(Error::Config(
                "--tls-cert and --tls-key must be given together".into(),
            )),
        }
    }
}

/// Create `server.json` and the proxy document. Fails if either exists.
pub fn initialize(settings: &Settings) -> Result<ServerConfig> {
    for path in [settings.server_file(), settings.document_file()] {
        if path.exists() {
            return Err(Error::Config(format!(
                "{} already exists, refusing to overwrite",
                path.display()
            )));
        }
    }
    std::fs::create_dir_all(&settings.data_dir)?;

    let public_ip = settings.public_ip.as_deref().unwrap_or_default();
    let config = ServerConfig::generate(&settings.data_dir, public_ip, settings.api_port)?;
    write_basic_document(&settings.data_dir, settings.vpn_port)?;
    Ok(config)
}

/// Load whatever exists and create whatever is missing.
pub fn load_or_initialize(settings: &Settings) -> Result<ServerConfig> {
    std::fs::create_dir_all(&settings.data_dir)?;

    let config = if settings.server_file().exists() {
        ServerConfig::load(&settings.data_dir)?
    } else {
        let public_ip = settings.public_ip.as_deref().unwrap_or_default();
        ServerConfig::generate(&settings.data_dir, public_ip, settings.api_port)?
    };

    if !settings.document_file().exists() {
        write_basic_document(&settings.data_dir, settings.vpn_port)?;
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(dir: &Path) -> Settings {
        let mut settings = Settings::new(dir);
        settings.public_ip = Some("203.0.113.10".into());
        settings
    }

    #[test]
    fn generated_config_round_trips_and_admin_token_validates() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig::generate(dir.path(), "203.0.113.10", Some(8443)).unwrap();

        assert_eq!(config.port, 8443);
        assert_eq!(config.hmac_secret.len(), SECRET_LEN);
        assert_eq!(ServerConfig::load(dir.path()).unwrap(), config);

        let tokens = config.token_authority().unwrap();
        assert_eq!(tokens.validate(&config.access_token).unwrap(), "admin");
        let just_before = admin_expiration() - chrono::Duration::seconds(1);
        assert!(tokens.validate_at(&config.access_token, just_before).is_ok());
        assert!(tokens
            .validate_at(&config.access_token, admin_expiration())
            .is_err());
    }

    #[test]
    fn random_port_is_unprivileged() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig::generate(dir.path(), "203.0.113.10", None).unwrap();
        assert!(config.port >= 1024);
    }

    #[test]
    fn generate_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        ServerConfig::generate(dir.path(), "203.0.113.10", None).unwrap();
        assert!(matches!(
            ServerConfig::generate(dir.path(), "203.0.113.10", None),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn generate_requires_an_address() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ServerConfig::generate(dir.path(), "", None),
            Err(Error::Config(_))
        ));
        assert!(!ServerConfig::path(dir.path()).exists());
    }

    #[test]
    fn load_rejects_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = ServerConfig::path(dir.path());

        std::fs::write(&path, r#"{"external_ip":"1.2.3.4","port":1}"#).unwrap();
        assert!(matches!(ServerConfig::load(dir.path()), Err(Error::Config(_))));

        std::fs::write(
            &path,
            r#"{"external_ip":"1.2.3.4","port":1,"access_token":"t","hmac_secret":""}"#,
        )
        .unwrap();
        assert!(matches!(ServerConfig::load(dir.path()), Err(Error::Config(_))));
    }

    #[test]
    fn load_missing_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(ServerConfig::load(dir.path()), Err(Error::Config(_))));
    }

    #[test]
    fn new_server_url_format() {
        let config = ServerConfig {
            external_ip: "203.0.113.10".into(),
            port: 8443,
            access_token: "aaa.bbb.ccc".into(),
            hmac_secret: "s".into(),
        };
        assert_eq!(
            config.new_server_url(),
            "lantern://new-private-server?ip=203.0.113.10&port=8443&token=aaa.bbb.ccc"
        );
    }

    #[test]
    fn debug_redacts_secrets() {
        let config = ServerConfig {
            external_ip: "203.0.113.10".into(),
            port: 8443,
            access_token: "the-token".into(),
            hmac_secret: "the-secret".into(),
        };
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("the-token"));
        assert!(!rendered.contains("the-secret"));
    }

    #[test]
    fn initialize_writes_both_files_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path());
        settings.vpn_port = Some(9000);

        initialize(&settings).unwrap();
        let doc = ProxyDocument::load(&settings.document_file()).unwrap();
        assert_eq!(doc.shadowsocks().unwrap().listen_port, 9000);

        assert!(matches!(initialize(&settings), Err(Error::Config(_))));
    }

    #[test]
    fn load_or_initialize_keeps_existing_state() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());

        let first = load_or_initialize(&settings).unwrap();
        let doc_before = std::fs::read(settings.document_file()).unwrap();
        let second = load_or_initialize(&settings).unwrap();

        assert_eq!(first, second);
        assert_eq!(std::fs::read(settings.document_file()).unwrap(), doc_before);
    }

    #[test]
    fn tls_overrides_must_be_paired() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path());
        assert!(settings.tls_overrides().unwrap().is_none());

        settings.tls_cert = Some(dir.path().join("c.pem"));
        assert!(matches!(settings.tls_overrides(), Err(Error::Config(_))));

        settings.tls_key = Some(dir.path().join("k.pem"));
        assert!(settings.tls_overrides().unwrap().is_some());
    }
}
