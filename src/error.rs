use std::error::Error as StdError;
use std::fmt;

use thiserror::Error;

pub type Result<T, E = AdapterError> = std::result::Result<T, E>;

/// Coarse classification of a SQLSTATE code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Class 42 syntax errors
    Syntax,
    /// Missing table/column, ambiguous reference, privileges
    Semantic,
    /// Class 23 integrity violations
    Constraint,
    /// Data exceptions and runtime failures
    Execution,
    /// Invalid transaction state or rollback
    Transaction,
    /// Connection/communication errors
    Connection,
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Syntax => write!(f, "Syntax Error"),
            ErrorCategory::Semantic => write!(f, "Semantic Error"),
            ErrorCategory::Constraint => write!(f, "Constraint Violation"),
            ErrorCategory::Execution => write!(f, "Execution Error"),
            ErrorCategory::Transaction => write!(f, "Transaction Error"),
            ErrorCategory::Connection => write!(f, "Connection Error"),
            ErrorCategory::Unknown => write!(f, "Error"),
        }
    }
}

/// Error reported by the server, with the fields PostgreSQL attaches to it.
#[derive(Debug, Clone)]
pub struct DatabaseError {
    pub category: ErrorCategory,
    /// PostgreSQL severity (ERROR, FATAL, etc.)
    pub severity: String,
    /// SQLSTATE code, empty for client-side failures
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    pub schema: Option<String>,
    pub table: Option<String>,
    pub column: Option<String>,
    pub constraint: Option<String>,
}

impl DatabaseError {
    pub fn from_pg_error(err: &tokio_postgres::Error) -> Self {
        if let Some(db_err) = err.as_db_error() {
            let code = db_err.code().code().to_string();
            DatabaseError {
                category: categorize_sqlstate(&code),
                severity: db_err.severity().to_string(),
                code,
                message: db_err.message().to_string(),
                detail: db_err.detail().map(str::to_string),
                hint: db_err.hint().map(str::to_string),
                schema: db_err.schema().map(str::to_string),
                table: db_err.table().map(str::to_string),
                column: db_err.column().map(str::to_string),
                constraint: db_err.constraint().map(str::to_string),
            }
        } else {
            // Closed socket, protocol error, conversion failure
            let category = if err.is_closed() || err.source().is_some() {
                ErrorCategory::Connection
            } else {
                ErrorCategory::Unknown
            };
            let mut error = DatabaseError::from_string(err.to_string());
            error.category = category;
            error.detail = err.source().map(|e| e.to_string());
            error
        }
    }

    pub fn from_string(message: String) -> Self {
        DatabaseError {
            category: ErrorCategory::Unknown,
            severity: "ERROR".to_string(),
            code: String::new(),
            message,
            detail: None,
            hint: None,
            schema: None,
            table: None,
            column: None,
            constraint: None,
        }
    }

    /// Multi-line rendering including SQLSTATE, detail and hint.
    pub fn display_full(&self) -> String {
        let mut lines = vec![format!("{}: {}", self.category, self.message)];

        if !self.code.is_empty() {
            lines.push(format!("  SQLSTATE: {}", self.code));
        }
        if let Some(detail) = &self.detail {
            lines.push(format!("  Detail: {}", detail));
        }
        if let Some(hint) = &self.hint {
            lines.push(format!("  Hint: {}", hint));
        }
        match (&self.schema, &self.table) {
            (Some(schema), Some(table)) => lines.push(format!("  Table: {}.{}", schema, table)),
            (None, Some(table)) => lines.push(format!("  Table: {}", table)),
            _ => {}
        }
        if let Some(constraint) = &self.constraint {
            lines.push(format!("  Constraint: {}", constraint));
        }

        lines.join("\n")
    }
}

impl fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Integrity constraint families recognised from SQLSTATE class 23.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    Unique,
    NotNull,
    ForeignKey,
    Check,
    Other,
}

impl ConstraintKind {
    pub fn from_sqlstate(code: &str) -> Option<Self> {
        match code {
            "23505" => Some(ConstraintKind::Unique),
            "23502" => Some(ConstraintKind::NotNull),
            "23503" => Some(ConstraintKind::ForeignKey),
            "23514" => Some(ConstraintKind::Check),
            _ if code.starts_with("23") => Some(ConstraintKind::Other),
            _ => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ConstraintKind::Unique => "E_UNIQUE",
            ConstraintKind::NotNull => "E_NOTNULL",
            ConstraintKind::ForeignKey => "E_FOREIGN_KEY",
            ConstraintKind::Check => "E_CHECK",
            ConstraintKind::Other => "E_CONSTRAINT",
        }
    }
}

/// A rejected write, with the offending attributes when the server names them.
#[derive(Debug, Clone)]
pub struct ConstraintViolation {
    pub kind: ConstraintKind,
    pub message: String,
    pub invalid_attributes: Vec<String>,
    pub table: Option<String>,
    pub constraint: Option<String>,
    pub detail: Option<String>,
}

impl ConstraintViolation {
    fn from_database_error(kind: ConstraintKind, err: DatabaseError) -> Self {
        let mut invalid_attributes = match &err.column {
            Some(column) => vec![column.clone()],
            None => Vec::new(),
        };
        if invalid_attributes.is_empty() {
            if let Some(detail) = &err.detail {
                invalid_attributes = parse_key_columns(detail);
            }
        }
        ConstraintViolation {
            kind,
            message: err.message,
            invalid_attributes,
            table: err.table,
            constraint: err.constraint,
            detail: err.detail,
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("connection is missing an identity")]
    IdentityMissing,

    #[error("a connection named '{0}' is already registered")]
    IdentityDuplicate(String),

    #[error("no connection named '{0}' is registered")]
    UnknownConnection(String),

    #[error("table '{0}' is not part of the registered schema")]
    UnknownTable(String),

    #[error("{component} {found} detected; {component} {required} or higher is required")]
    UnsupportedServerVersion {
        component: &'static str,
        found: String,
        required: String,
    },

    #[error("{}", .0.message)]
    Constraint(ConstraintViolation),

    #[error("no stored procedure found with the name {0}")]
    UnknownProcedure(String),

    #[error("invalid criteria: {0}")]
    InvalidCriteria(String),

    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("{0:#}")]
    Connection(#[from] anyhow::Error),

    #[error("{0}")]
    Query(DatabaseError),
}

impl AdapterError {
    /// Stable machine-readable code for callers that branch on error kind.
    pub fn code(&self) -> &'static str {
        match self {
            AdapterError::IdentityMissing => "E_IDENTITY_MISSING",
            AdapterError::IdentityDuplicate(_) => "E_IDENTITY_DUPLICATE",
            AdapterError::UnknownConnection(_) => "E_UNKNOWN_CONNECTION",
            AdapterError::UnknownTable(_) => "E_UNKNOWN_TABLE",
            AdapterError::UnsupportedServerVersion { .. } => "E_UNSUPPORTED_VERSION",
            AdapterError::Constraint(violation) => violation.kind.code(),
            AdapterError::UnknownProcedure(_) => "E_UNKNOWN_PROCEDURE",
            AdapterError::InvalidCriteria(_) => "E_INVALID_CRITERIA",
            AdapterError::InvalidGeometry(_) => "E_INVALID_GEOMETRY",
            AdapterError::Config(_) => "E_CONFIG",
            AdapterError::Transaction(_) => "E_TRANSACTION",
            AdapterError::Connection(_) => "E_CONNECTION",
            AdapterError::Query(_) => "E_QUERY",
        }
    }

    pub fn is_constraint(&self) -> bool {
        matches!(self, AdapterError::Constraint(_))
    }

    /// Attributes named by a constraint violation; empty for other errors.
    pub fn invalid_attributes(&self) -> &[String] {
        match self {
            AdapterError::Constraint(violation) => &violation.invalid_attributes,
            _ => &[],
        }
    }
}

impl From<tokio_postgres::Error> for AdapterError {
    fn from(err: tokio_postgres::Error) -> Self {
        let db_err = DatabaseError::from_pg_error(&err);
        match ConstraintKind::from_sqlstate(&db_err.code) {
            Some(kind) => {
                AdapterError::Constraint(ConstraintViolation::from_database_error(kind, db_err))
            }
            None => AdapterError::Query(db_err),
        }
    }
}

impl From<deadpool_postgres::PoolError> for AdapterError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        match err {
            deadpool_postgres::PoolError::Backend(pg) => AdapterError::from(pg),
            other => AdapterError::Connection(anyhow::anyhow!("connection pool error: {}", other)),
        }
    }
}

/// Categorize a SQLSTATE code into an ErrorCategory.
fn categorize_sqlstate(code: &str) -> ErrorCategory {
    if code.len() < 2 {
        return ErrorCategory::Unknown;
    }
    match &code[..2] {
        "42" => {
            if code == "42601" || code == "42000" {
                ErrorCategory::Syntax
            } else {
                ErrorCategory::Semantic
            }
        }
        "23" => ErrorCategory::Constraint,
        "22" | "53" | "54" | "55" | "57" => ErrorCategory::Execution,
        "25" | "40" => ErrorCategory::Transaction,
        "08" => ErrorCategory::Connection,
        _ => ErrorCategory::Unknown,
    }
}

/// Column names from a detail line such as `Key (a, b)=(1, 2) already exists.`
fn parse_key_columns(detail: &str) -> Vec<String> {
    let Some(start) = detail.find("Key (") else {
        return Vec::new();
    };
    let rest = &detail[start + 5..];
    let Some(end) = rest.find(")=(") else {
        return Vec::new();
    };
    rest[..end]
        .split(',')
        .map(|column| column.trim().trim_matches('"').to_string())
        .filter(|column| !column.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categorize_sqlstate() {
        assert_eq!(categorize_sqlstate("42601"), ErrorCategory::Syntax);
        assert_eq!(categorize_sqlstate("42P01"), ErrorCategory::Semantic);
        assert_eq!(categorize_sqlstate("23505"), ErrorCategory::Constraint);
        assert_eq!(categorize_sqlstate("22012"), ErrorCategory::Execution);
        assert_eq!(categorize_sqlstate("40001"), ErrorCategory::Transaction);
        assert_eq!(categorize_sqlstate("08006"), ErrorCategory::Connection);
        assert_eq!(categorize_sqlstate("XX000"), ErrorCategory::Unknown);
        assert_eq!(categorize_sqlstate(""), ErrorCategory::Unknown);
    }

    #[test]
    fn test_constraint_kind_from_sqlstate() {
        assert_eq!(ConstraintKind::from_sqlstate("23505"), Some(ConstraintKind::Unique));
        assert_eq!(ConstraintKind::from_sqlstate("23502"), Some(ConstraintKind::NotNull));
        assert_eq!(ConstraintKind::from_sqlstate("23503"), Some(ConstraintKind::ForeignKey));
        assert_eq!(ConstraintKind::from_sqlstate("23514"), Some(ConstraintKind::Check));
        assert_eq!(ConstraintKind::from_sqlstate("23P01"), Some(ConstraintKind::Other));
        assert_eq!(ConstraintKind::from_sqlstate("22002"), None);
        assert_eq!(ConstraintKind::from_sqlstate("42601"), None);
    }

    #[test]
    fn test_parse_key_columns() {
        assert_eq!(
            parse_key_columns("Key (email)=(a@b.c) already exists."),
            vec!["email".to_string()]
        );
        assert_eq!(
            parse_key_columns("Key (\"firstName\", last_name)=(a, b) already exists."),
            vec!["firstName".to_string(), "last_name".to_string()]
        );
        assert!(parse_key_columns("something else entirely").is_empty());
    }

    #[test]
    fn test_violation_prefers_reported_column() {
        let mut err = DatabaseError::from_string("null value in column \"name\"".into());
        err.code = "23502".into();
        err.column = Some("name".into());
        err.detail = Some("Key (other)=(1)".into());
        let violation = ConstraintViolation::from_database_error(ConstraintKind::NotNull, err);
        assert_eq!(violation.invalid_attributes, vec!["name".to_string()]);
        assert_eq!(violation.kind.code(), "E_NOTNULL");
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(AdapterError::IdentityMissing.code(), "E_IDENTITY_MISSING");
        assert_eq!(AdapterError::IdentityDuplicate("a".into()).code(), "E_IDENTITY_DUPLICATE");
        assert_eq!(AdapterError::UnknownProcedure("f".into()).code(), "E_UNKNOWN_PROCEDURE");
        let err = AdapterError::UnsupportedServerVersion {
            component: "PostgreSQL",
            found: "9.3.9".into(),
            required: "9.4".into(),
        };
        assert_eq!(err.code(), "E_UNSUPPORTED_VERSION");
        assert_eq!(
            err.to_string(),
            "PostgreSQL 9.3.9 detected; PostgreSQL 9.4 or higher is required"
        );
    }

    #[test]
    fn test_display_full() {
        let mut err = DatabaseError::from_string("duplicate key value".into());
        err.category = ErrorCategory::Constraint;
        err.code = "23505".into();
        err.detail = Some("Key (email)=(x) already exists.".into());
        err.table = Some("users".into());
        let full = err.display_full();
        assert!(full.contains("Constraint Violation: duplicate key value"));
        assert!(full.contains("SQLSTATE: 23505"));
        assert!(full.contains("Table: users"));
    }
}
