use std::collections::BTreeMap;

use serde_json::Value;
use tokio_postgres::Client;
use tracing::debug;

use super::catalog::ServerVersion;
use crate::criteria::CompiledQuery;
use crate::error::{AdapterError, Result};
use crate::types::quote_ident;

/// A server-side function callable through `procedure`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredProcedure {
    /// `None` for built-ins resolved through the search path.
    pub schema: Option<String>,
    pub name: String,
    /// Argument types in declaration order.
    pub signature: Vec<String>,
}

impl StoredProcedure {
    pub fn builtin(name: impl Into<String>) -> Self {
        Self {
            schema: None,
            name: name.into(),
            signature: Vec::new(),
        }
    }

    /// Name callers use: schema-qualified unless the function lives in
    /// `public`.
    pub fn full_name(&self) -> String {
        match self.schema.as_deref() {
            None | Some("public") => self.name.clone(),
            Some(schema) => format!("{}.{}", schema, self.name),
        }
    }

    /// `SELECT * FROM "schema"."name"($1::type, ...)` with `args` bound.
    /// Arguments beyond the catalogued signature are passed uncast.
    pub fn invocation(&self, args: Vec<Value>) -> CompiledQuery {
        let placeholders: Vec<String> = (1..=args.len())
            .map(|i| match self.signature.get(i - 1) {
                Some(ty) => format!("${}::{}", i, ty),
                None => format!("${}", i),
            })
            .collect();
        let target = match &self.schema {
            Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(&self.name)),
            None => self.name.clone(),
        };
        CompiledQuery::new(
            format!("SELECT * FROM {}({})", target, placeholders.join(", ")),
            args,
        )
    }
}

/// Stored procedures discovered at registration, keyed by lowercased full
/// name.
#[derive(Debug, Clone, Default)]
pub struct ProcedureCatalog {
    procedures: BTreeMap<String, StoredProcedure>,
}

impl ProcedureCatalog {
    pub fn from_procedures(procedures: impl IntoIterator<Item = StoredProcedure>) -> Self {
        let mut catalog = Self::default();
        for procedure in procedures {
            catalog.insert(procedure);
        }
        catalog.insert(StoredProcedure::builtin("version"));
        catalog
    }

    fn insert(&mut self, procedure: StoredProcedure) {
        self.procedures
            .insert(procedure.full_name().to_lowercase(), procedure);
    }

    pub async fn load(client: &Client, version: ServerVersion) -> Result<Self> {
        let filter = if version.at_least(11, 0) {
            "p.prokind = 'f'"
        } else {
            "NOT p.proisagg AND NOT p.proiswindow"
        };
        let sql = format!(
            r#"
            SELECT
                n.nspname::text as schema,
                p.proname::text as name,
                pg_catalog.oidvectortypes(p.proargtypes) as signature
            FROM pg_catalog.pg_proc p
            JOIN pg_catalog.pg_namespace n ON n.oid = p.pronamespace
            WHERE n.nspname NOT IN ('pg_catalog', 'information_schema')
              AND n.nspname NOT LIKE 'pg_toast%'
              AND n.nspname NOT LIKE 'pg_temp%'
              AND {}
            ORDER BY n.nspname, p.proname
            "#,
            filter
        );
        let rows = client.query(sql.as_str(), &[]).await?;
        let procedures = rows.iter().map(|row| {
            let signature: String = row.get("signature");
            StoredProcedure {
                schema: Some(row.get("schema")),
                name: row.get("name"),
                signature: parse_signature(&signature),
            }
        });
        let catalog = Self::from_procedures(procedures);
        debug!(procedures = catalog.len(), "stored procedure catalog loaded");
        Ok(catalog)
    }

    /// Case-insensitive lookup.
    pub fn get(&self, name: &str) -> Result<&StoredProcedure> {
        self.procedures
            .get(&name.to_lowercase())
            .ok_or_else(|| AdapterError::UnknownProcedure(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.procedures.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.procedures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procedures.is_empty()
    }
}

/// Split a comma-separated type list, keeping commas inside parentheses
/// (`numeric(10,2)`) with their type.
pub fn parse_signature(signature: &str) -> Vec<String> {
    let mut types = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for c in signature.chars() {
        match c {
            '(' => {
                depth += 1;
                current.push(c);
            }
            ')' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ',' if depth == 0 => types.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    types.push(current);
    types
        .into_iter()
        .map(|ty| ty.trim().to_string())
        .filter(|ty| !ty.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn procedure(schema: &str, name: &str, signature: &str) -> StoredProcedure {
        StoredProcedure {
            schema: Some(schema.into()),
            name: name.into(),
            signature: parse_signature(signature),
        }
    }

    #[test]
    fn test_parse_signature() {
        assert_eq!(parse_signature("integer, text"), vec!["integer", "text"]);
        assert_eq!(
            parse_signature("numeric(10,2), character varying[]"),
            vec!["numeric(10,2)", "character varying[]"]
        );
        assert!(parse_signature("").is_empty());
    }

    #[test]
    fn test_full_names() {
        assert_eq!(procedure("public", "add", "").full_name(), "add");
        assert_eq!(procedure("billing", "Charge", "").full_name(), "billing.Charge");
        assert_eq!(StoredProcedure::builtin("version").full_name(), "version");
    }

    #[test]
    fn test_catalog_lookup_is_case_insensitive() {
        let catalog = ProcedureCatalog::from_procedures(vec![
            procedure("public", "add_numbers", "integer, integer"),
            procedure("billing", "Charge", "uuid"),
        ]);
        assert_eq!(catalog.len(), 3);
        assert_eq!(catalog.get("ADD_NUMBERS").unwrap().name, "add_numbers");
        assert_eq!(catalog.get("billing.charge").unwrap().name, "Charge");
        assert!(catalog.get("version").is_ok());

        let err = catalog.get("missing").unwrap_err();
        assert_eq!(err.code(), "E_UNKNOWN_PROCEDURE");
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_invocation() {
        let add = procedure("public", "add_numbers", "integer, integer");
        let query = add.invocation(vec![json!(1), json!(2)]);
        assert_eq!(
            query.sql,
            "SELECT * FROM \"public\".\"add_numbers\"($1::integer, $2::integer)"
        );
        assert_eq!(query.values, vec![json!(1), json!(2)]);

        let version = StoredProcedure::builtin("version");
        assert_eq!(version.invocation(Vec::new()).sql, "SELECT * FROM version()");
    }
}
