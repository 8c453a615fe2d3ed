//! Server introspection: version checks, table existence and `describe`.

use std::fmt;
use std::sync::OnceLock;

use indexmap::IndexMap;
use regex::Regex;
use serde::Serialize;
use tokio_postgres::Client;
use tracing::{debug, warn};

use crate::error::{AdapterError, Result};
use crate::schema::TableDefinition;
use crate::types::{truncate_identifier, SemanticType, TableDirectives};

/// Oldest PostgreSQL release the compiled SQL runs on (aggregate FILTER).
pub const MIN_POSTGRES: ServerVersion = ServerVersion::new(9, 4, 0);
pub const MIN_POSTGIS: ServerVersion = ServerVersion::new(2, 1, 0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ServerVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ServerVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// First `major[.minor[.patch]]` in a version banner such as
    /// `PostgreSQL 9.6.3 on x86_64-pc-linux-gnu` or `PostgreSQL 16beta1`.
    pub fn parse(banner: &str) -> Option<Self> {
        static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
        let pattern = PATTERN
            .get_or_init(|| Regex::new(r"(\d+)(?:\.(\d+))?(?:\.(\d+))?").ok())
            .as_ref()?;
        let captures = pattern.captures(banner)?;
        let part = |i: usize| {
            captures
                .get(i)
                .and_then(|m| m.as_str().parse::<u32>().ok())
                .unwrap_or(0)
        };
        Some(Self::new(part(1), part(2), part(3)))
    }

    pub fn at_least(&self, major: u32, minor: u32) -> bool {
        (self.major, self.minor) >= (major, minor)
    }

    fn require(self, component: &'static str, minimum: ServerVersion) -> Result<Self> {
        if self < minimum {
            return Err(AdapterError::UnsupportedServerVersion {
                component,
                found: self.to_string(),
                required: format!("{}.{}", minimum.major, minimum.minor),
            });
        }
        Ok(self)
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

fn parse_banner(component: &'static str, banner: &str) -> Result<ServerVersion> {
    ServerVersion::parse(banner).ok_or_else(|| AdapterError::UnsupportedServerVersion {
        component,
        found: banner.to_string(),
        required: format!("{}.{}", MIN_POSTGRES.major, MIN_POSTGRES.minor),
    })
}

/// Parse a `SELECT version()` banner and reject servers that are too old.
pub fn validate_server_version(banner: &str) -> Result<ServerVersion> {
    parse_banner("PostgreSQL", banner)?.require("PostgreSQL", MIN_POSTGRES)
}

pub fn validate_postgis_version(banner: &str) -> Result<ServerVersion> {
    parse_banner("PostGIS", banner)?.require("PostGIS", MIN_POSTGIS)
}

pub async fn server_version(client: &Client) -> Result<ServerVersion> {
    let row = client.query_one("SELECT version()", &[]).await?;
    let banner: String = row.get(0);
    debug!(banner = %banner, "server version");
    validate_server_version(&banner)
}

/// PostGIS library version; a missing extension counts as unsupported.
pub async fn postgis_version(client: &Client) -> Result<ServerVersion> {
    match client.query_one("SELECT PostGIS_Lib_Version()", &[]).await {
        Ok(row) => {
            let banner: String = row.get(0);
            validate_postgis_version(&banner)
        }
        Err(e) => {
            debug!(error = %e, "PostGIS not available");
            Err(AdapterError::UnsupportedServerVersion {
                component: "PostGIS",
                found: "none".into(),
                required: format!("{}.{}", MIN_POSTGIS.major, MIN_POSTGIS.minor),
            })
        }
    }
}

pub async fn table_exists(client: &Client, table: &str) -> Result<bool> {
    let row = client
        .query_one(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM pg_catalog.pg_class c
                JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
                WHERE c.relname = $1::text
                  AND c.relkind IN ('r', 'p', 'v', 'm', 'f')
                  AND n.nspname = ANY(current_schemas(false))
            )
            "#,
            &[&truncate_identifier(table)],
        )
        .await?;
    Ok(row.get(0))
}

/// Create the table and its indexes unless a relation with that name
/// already exists. Returns whether anything was created.
pub async fn ensure_table(client: &Client, definition: &TableDefinition) -> Result<bool> {
    if table_exists(client, &definition.name).await? {
        debug!(table = %definition.name, "table already exists");
        return Ok(false);
    }
    let generates_uuids = definition.attributes.values().any(|attr| {
        attr.primary_key
            && attr.semantic == SemanticType::Uuid
            && attr.db_type.is_none()
            && attr.default.is_none()
    });
    if generates_uuids {
        if let Err(e) = client
            .batch_execute("CREATE EXTENSION IF NOT EXISTS \"uuid-ossp\"")
            .await
        {
            warn!(error = %e, table = %definition.name, "could not enable uuid-ossp");
        }
    }
    for statement in TableDirectives::for_table(definition).statements() {
        debug!(sql = %statement, "creating table");
        client.batch_execute(&statement).await?;
    }
    Ok(true)
}

/// One column as reported by `describe`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDescription {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub default_value: Option<String>,
    pub max_length: Option<i32>,
    pub primary_key: bool,
    pub unique: bool,
    pub indexed: bool,
}

pub type TableDescription = IndexMap<String, ColumnDescription>;

/// Column and index information for a table in the current search path, or
/// `None` when the table does not exist.
pub async fn describe_table(client: &Client, table: &str) -> Result<Option<TableDescription>> {
    let table = truncate_identifier(table);
    let rows = client
        .query(
            r#"
            SELECT
                c.column_name::text as name,
                c.data_type::text as data_type,
                c.is_nullable::text = 'YES' as is_nullable,
                c.column_default::text as default_value,
                c.character_maximum_length::int4 as max_length
            FROM information_schema.columns c
            WHERE c.table_schema = current_schema() AND c.table_name = $1::text
            ORDER BY c.ordinal_position
            "#,
            &[&table],
        )
        .await?;
    if rows.is_empty() {
        return Ok(None);
    }

    let mut columns: TableDescription = rows
        .iter()
        .map(|row| {
            let name: String = row.get("name");
            let column = ColumnDescription {
                name: name.clone(),
                data_type: row.get("data_type"),
                nullable: row.get("is_nullable"),
                default_value: row.get("default_value"),
                max_length: row.get("max_length"),
                primary_key: false,
                unique: false,
                indexed: false,
            };
            (name, column)
        })
        .collect();

    let indexes = client
        .query(
            r#"
            SELECT
                a.attname::text as column_name,
                bool_or(ix.indisprimary) as is_primary,
                bool_or(ix.indisunique AND ix.indnatts = 1) as is_unique
            FROM pg_catalog.pg_index ix
            JOIN pg_catalog.pg_class t ON t.oid = ix.indrelid
            JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
            JOIN pg_catalog.pg_attribute a ON a.attrelid = t.oid AND a.attnum = ANY(ix.indkey)
            WHERE n.nspname = current_schema() AND t.relname = $1::text
            GROUP BY a.attname
            "#,
            &[&table],
        )
        .await?;
    for row in &indexes {
        let name: String = row.get("column_name");
        if let Some(column) = columns.get_mut(&name) {
            column.indexed = true;
            column.primary_key = row.get("is_primary");
            column.unique = column.primary_key || row.get::<_, bool>("is_unique");
        }
    }
    Ok(Some(columns))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_banners() {
        assert_eq!(
            ServerVersion::parse("PostgreSQL 9.6.3 on x86_64-pc-linux-gnu, compiled by gcc"),
            Some(ServerVersion::new(9, 6, 3))
        );
        assert_eq!(
            ServerVersion::parse("PostgreSQL 15.4 (Debian 15.4-1.pgdg120+1) on aarch64"),
            Some(ServerVersion::new(15, 4, 0))
        );
        assert_eq!(
            ServerVersion::parse("PostgreSQL 16beta1"),
            Some(ServerVersion::new(16, 0, 0))
        );
        assert_eq!(ServerVersion::parse("2.1.8"), Some(ServerVersion::new(2, 1, 8)));
        assert_eq!(ServerVersion::parse("no digits"), None);
    }

    #[test]
    fn test_minimum_server_version() {
        assert!(validate_server_version("PostgreSQL 9.4.0 on x86_64").is_ok());
        assert!(validate_server_version("PostgreSQL 12.1").is_ok());

        let err = validate_server_version("PostgreSQL 9.3.25 on x86_64").unwrap_err();
        assert_eq!(err.code(), "E_UNSUPPORTED_VERSION");
        assert!(err.to_string().contains("9.3.25"));
        assert!(err.to_string().contains("9.4"));

        assert!(validate_server_version("garbage").is_err());
    }

    #[test]
    fn test_minimum_postgis_version() {
        assert!(validate_postgis_version("2.1.8").is_ok());
        assert!(validate_postgis_version("3.4.0").is_ok());
        assert_eq!(
            validate_postgis_version("2.0.7").unwrap_err().code(),
            "E_UNSUPPORTED_VERSION"
        );
    }

    #[test]
    fn test_at_least() {
        let version = ServerVersion::new(11, 2, 0);
        assert!(version.at_least(11, 0));
        assert!(version.at_least(9, 6));
        assert!(!version.at_least(12, 0));
    }
}
