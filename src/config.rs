use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Settings for one named connection.
///
/// Every field has a default, so a TOML table only needs the values that
/// differ from a local development server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    /// Registry key. Must be non-empty and unique among live connections.
    pub identity: String,
    /// Full connection URL; overrides the discrete host/port/user fields.
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub ssl_mode: SslMode,
    /// Accept invalid/self-signed certificates in Prefer/Require modes.
    pub accept_invalid_certs: bool,
    /// Optional path to a PEM bundle with extra trusted CA certificates.
    pub ca_cert_path: Option<String>,
    pub pool: PoolOptions,
    /// Create missing tables for every registered collection at registration.
    pub schema_sync: bool,
    /// When false, writes run on a plain pooled client without BEGIN/COMMIT.
    pub enable_transactions: bool,
    /// Log compiled SQL at info level instead of debug.
    pub debug: bool,
}

/// SSL/TLS connection modes for PostgreSQL.
///
/// These match the standard PostgreSQL sslmode parameter:
/// - `Disable`: No SSL (unencrypted)
/// - `Prefer`: Try SSL first, fall back to non-SSL (default)
/// - `Require`: Require SSL but don't verify certificate
/// - `VerifyCa`: Require SSL and verify the server certificate is signed by a trusted CA
/// - `VerifyFull`: Like VerifyCa, but also verify the server hostname matches the certificate
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    Disable,
    #[default]
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl SslMode {
    /// The sslmode keyword the driver understands. Certificate verification
    /// for the verify-* modes is enforced by the TLS connector instead.
    pub fn driver_keyword(&self) -> &'static str {
        match self {
            SslMode::Disable => "disable",
            SslMode::Prefer => "prefer",
            SslMode::Require | SslMode::VerifyCa | SslMode::VerifyFull => "require",
        }
    }

    pub fn verifies_certificates(&self) -> bool {
        matches!(self, SslMode::VerifyCa | SslMode::VerifyFull)
    }
}

/// Pool sizing and timeouts. Durations are stored in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PoolOptions {
    /// Clients opened eagerly at registration.
    pub min: usize,
    pub max: usize,
    /// Upper bound for the liveness check run when a client is recycled.
    pub ping_timeout_ms: u64,
    /// Clients unused for longer than this are closed by the idle sweep.
    pub idle_timeout_ms: u64,
    /// How long a caller waits for a free client.
    pub acquire_timeout_ms: u64,
    /// Interval of the idle sweep.
    pub sync_interval_ms: u64,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            min: 1,
            max: 16,
            ping_timeout_ms: 10_000,
            idle_timeout_ms: 30_000,
            acquire_timeout_ms: 300_000,
            sync_interval_ms: 2_000,
        }
    }
}

impl PoolOptions {
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms.max(1))
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            identity: String::new(),
            url: None,
            host: String::from("localhost"),
            port: 5432,
            database: String::from("postgres"),
            user: String::from("postgres"),
            password: String::from("postgres"),
            ssl_mode: SslMode::default(),
            accept_invalid_certs: false,
            ca_cert_path: None,
            pool: PoolOptions::default(),
            schema_sync: false,
            enable_transactions: true,
            debug: false,
        }
    }
}

impl ConnectionOptions {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            ..Self::default()
        }
    }

    pub fn with_url(identity: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            url: Some(url.into()),
            ..Self::default()
        }
    }

    /// libpq-style key=value string for the discrete connection fields.
    pub fn connection_string(&self) -> String {
        format!(
            "host={} port={} dbname={} user={} password={} sslmode={} connect_timeout=10",
            quote_conn_value(&self.host),
            self.port,
            quote_conn_value(&self.database),
            quote_conn_value(&self.user),
            quote_conn_value(&self.password),
            self.ssl_mode.driver_keyword()
        )
    }

    pub fn display_string(&self) -> String {
        match &self.url {
            Some(_) => format!("{} (url)", self.identity),
            None => format!("{}@{}:{}/{}", self.user, self.host, self.port, self.database),
        }
    }

    /// Driver configuration. A URL wins over the discrete fields; an empty
    /// password falls back to `PGPASSWORD`.
    pub fn pg_config(&self) -> Result<tokio_postgres::Config> {
        let mut config: tokio_postgres::Config = match &self.url {
            Some(url) => url
                .parse()
                .with_context(|| format!("Invalid connection URL for '{}'", self.identity))?,
            None => self
                .connection_string()
                .parse()
                .context("Invalid connection settings")?,
        };
        if config.get_password().map_or(true, |p| p.is_empty()) {
            if let Ok(password) = std::env::var("PGPASSWORD") {
                config.password(password);
            }
        }
        Ok(config)
    }
}

/// A set of connections loaded from a TOML file with `[[connections]]` tables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdapterConfig {
    #[serde(default)]
    pub connections: Vec<ConnectionOptions>,
}

impl AdapterConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse adapter configuration")
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_toml_str(&content)
    }
}

/// Quote a value for use in a libpq key=value connection string.
/// Wraps in single quotes and escapes backslashes and single quotes.
fn quote_conn_value(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{}'", escaped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = ConnectionOptions::default();
        assert_eq!(options.host, "localhost");
        assert_eq!(options.port, 5432);
        assert_eq!(options.database, "postgres");
        assert_eq!(options.user, "postgres");
        assert_eq!(options.ssl_mode, SslMode::Prefer);
        assert!(options.enable_transactions);
        assert!(!options.schema_sync);
        assert_eq!(options.pool.min, 1);
        assert_eq!(options.pool.max, 16);
        assert_eq!(options.pool.idle_timeout(), Duration::from_secs(30));
        assert_eq!(options.pool.acquire_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_quote_conn_value() {
        assert_eq!(quote_conn_value("plain"), "'plain'");
        assert_eq!(quote_conn_value("it's"), "'it\\'s'");
        assert_eq!(quote_conn_value("back\\slash"), "'back\\\\slash'");
    }

    #[test]
    fn test_connection_string_maps_verify_modes() {
        let mut options = ConnectionOptions::new("main");
        options.ssl_mode = SslMode::VerifyFull;
        let conn = options.connection_string();
        assert!(conn.contains("sslmode=require"));
        assert!(conn.contains("host='localhost'"));
        assert!(options.ssl_mode.verifies_certificates());
    }

    #[test]
    fn test_pg_config_from_fields() {
        let mut options = ConnectionOptions::new("main");
        options.host = "db.internal".into();
        options.port = 6543;
        options.database = "app".into();
        let config = options.pg_config().unwrap();
        assert_eq!(config.get_dbname(), Some("app"));
        assert_eq!(config.get_ports(), &[6543]);
    }

    #[test]
    fn test_pg_config_url_overrides_fields() {
        let options = ConnectionOptions::with_url("main", "postgres://alice:pw@remote:7000/shop");
        let config = options.pg_config().unwrap();
        assert_eq!(config.get_user(), Some("alice"));
        assert_eq!(config.get_dbname(), Some("shop"));
        assert_eq!(config.get_ports(), &[7000]);
    }

    #[test]
    fn test_adapter_config_from_toml() {
        let config = AdapterConfig::from_toml_str(
            r#"
            [[connections]]
            identity = "primary"
            host = "db1"
            ssl_mode = "verify-full"
            schema_sync = true

            [connections.pool]
            max = 4
            idle_timeout_ms = 5000

            [[connections]]
            identity = "replica"
            url = "postgres://u@db2/app"
            enable_transactions = false
            "#,
        )
        .unwrap();

        assert_eq!(config.connections.len(), 2);
        let primary = &config.connections[0];
        assert_eq!(primary.identity, "primary");
        assert_eq!(primary.ssl_mode, SslMode::VerifyFull);
        assert!(primary.schema_sync);
        assert_eq!(primary.pool.max, 4);
        assert_eq!(primary.pool.min, 1);
        assert_eq!(primary.pool.idle_timeout_ms, 5000);
        assert_eq!(primary.port, 5432);

        let replica = &config.connections[1];
        assert_eq!(replica.url.as_deref(), Some("postgres://u@db2/app"));
        assert!(!replica.enable_transactions);
    }

    #[test]
    fn test_password_not_serialized() {
        let mut options = ConnectionOptions::new("main");
        options.password = "secret".into();
        let content = toml::to_string(&AdapterConfig {
            connections: vec![options],
        })
        .unwrap();
        assert!(!content.contains("secret"));
    }
}
