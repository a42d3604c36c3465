//! Iroh endpoint plumbing and identity persistence.
//!
//! The overlay network owns path discovery, session establishment and
//! encryption; this module only binds endpoints, persists the secret key
//! and enforces the listener's allow-list.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use iroh::endpoint::{Connection, Endpoint, RelayMode};
use iroh::{PublicKey, SecretKey};

/// Protocol identifier for frame fetches.
pub const ALPN: &[u8] = b"farview/0";

/// Name of the key file inside the config directory.
const IDENTITY_FILE: &str = "identity";

/// Load the per-installation secret key, creating it on first use.
///
/// The key lives in a file named `identity` under `config_dir`. Creation
/// happens at most once per directory; subsequent calls load the same key.
pub fn load_or_create_identity(config_dir: &Path) -> Result<SecretKey> {
    let path = config_dir.join(IDENTITY_FILE);

    if path.is_file() {
        tracing::debug!("Loading identity from {}", path.display());
        let bytes = std::fs::read(&path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("Invalid identity file, expected 32 bytes"))?;
        return Ok(SecretKey::from_bytes(&bytes));
    }

    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("Could not create {}", config_dir.display()))?;

    let key = SecretKey::generate(&mut rand::rng());
    std::fs::write(&path, key.to_bytes())
        .with_context(|| format!("Could not write {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
    }
    tracing::debug!("Writing new identity to {}", path.display());

    Ok(key)
}

/// Parse an endpoint identifier as printed by [`endpoint_id`].
pub fn parse_endpoint_id(s: &str) -> Result<PublicKey> {
    s.parse::<PublicKey>()
        .map_err(|e| anyhow::anyhow!("Invalid endpoint id {:?}: {}", s, e))
}

/// Bind an endpoint that accepts frame requests.
pub async fn bind_listener(secret_key: SecretKey) -> Result<Endpoint> {
    let endpoint = Endpoint::builder()
        .secret_key(secret_key)
        .relay_mode(RelayMode::Default)
        .alpns(vec![ALPN.to_vec()])
        .bind()
        .await?;
    Ok(endpoint)
}

/// Bind an endpoint for outgoing fetches (ephemeral key unless one is given).
pub async fn bind_fetcher(secret_key: Option<SecretKey>) -> Result<Endpoint> {
    let secret_key = secret_key.unwrap_or_else(|| SecretKey::generate(&mut rand::rng()));
    let endpoint = Endpoint::builder()
        .secret_key(secret_key)
        .relay_mode(RelayMode::Default)
        .bind()
        .await?;
    Ok(endpoint)
}

/// Accept the next incoming connection, retrying transient handshake
/// failures. Returns None only if the endpoint is closed.
pub async fn accept(endpoint: &Endpoint) -> Option<Connection> {
    loop {
        let incoming = endpoint.accept().await?;
        match incoming.await {
            Ok(conn) => return Some(conn),
            Err(e) => {
                tracing::warn!("Incoming connection handshake failed: {}", e);
                continue;
            }
        }
    }
}

/// Connect to a remote listener, bounding path resolution and session
/// establishment by `timeout`.
pub async fn connect(
    endpoint: &Endpoint,
    remote: PublicKey,
    timeout: Duration,
) -> Result<Connection> {
    tokio::time::timeout(timeout, endpoint.connect(remote, ALPN))
        .await
        .map_err(|_| anyhow::anyhow!("No path to {} within {:?}", remote, timeout))?
        .with_context(|| format!("Could not open session to {}", remote))
}

/// Allow-list over remote identities. Empty means "allow everyone",
/// matching the behavior of running without `-a` flags.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    allowed: Vec<PublicKey>,
}

impl AllowList {
    pub fn new(allowed: Vec<PublicKey>) -> Self {
        Self { allowed }
    }

    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty()
    }

    pub fn permits(&self, remote: &PublicKey) -> bool {
        self.allowed.is_empty() || self.allowed.contains(remote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_created_once_and_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let first = load_or_create_identity(dir.path()).unwrap();
        let second = load_or_create_identity(dir.path()).unwrap();
        assert_eq!(first.public(), second.public());
    }

    #[test]
    fn test_identity_creates_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("deep").join("config");
        let key = load_or_create_identity(&nested).unwrap();
        assert!(nested.join("identity").is_file());
        assert_eq!(
            key.public(),
            load_or_create_identity(&nested).unwrap().public()
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_identity_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        load_or_create_identity(dir.path()).unwrap();
        let mode = std::fs::metadata(dir.path().join("identity"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_identity_rejects_truncated_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("identity"), [0u8; 7]).unwrap();
        assert!(load_or_create_identity(dir.path()).is_err());
    }

    #[test]
    fn test_endpoint_id_round_trip() {
        let key = SecretKey::generate(&mut rand::rng());
        let printed = key.public().to_string();
        assert_eq!(parse_endpoint_id(&printed).unwrap(), key.public());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_endpoint_id("not-an-endpoint-id").is_err());
    }

    #[test]
    fn test_allow_list() {
        let a = SecretKey::generate(&mut rand::rng()).public();
        let b = SecretKey::generate(&mut rand::rng()).public();

        let open = AllowList::default();
        assert!(open.permits(&a));

        let restricted = AllowList::new(vec![a]);
        assert!(restricted.permits(&a));
        assert!(!restricted.permits(&b));
    }
}
