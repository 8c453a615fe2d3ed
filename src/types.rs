//! Mapping from semantic attribute types to native PostgreSQL column
//! definitions, and the DDL statements built from them.

use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use crate::schema::{ResolvedAttribute, TableDefinition};

/// PostgreSQL truncates identifiers longer than this many bytes.
pub const MAX_IDENTIFIER_LENGTH: usize = 63;

/// Semantic attribute types callers may declare.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SemanticType {
    String,
    Text,
    Integer,
    BigInteger,
    Float,
    Double,
    Decimal,
    Boolean,
    Date,
    DateTime,
    Time,
    Json,
    Jsonb,
    Binary,
    Uuid,
    Array,
    Serial,
    BigSerial,
    Enum,
    /// The column type is given verbatim by `dbType`.
    Native,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownType(pub String);

impl fmt::Display for UnknownType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown attribute type '{}'", self.0)
    }
}

impl std::error::Error for UnknownType {}

impl FromStr for SemanticType {
    type Err = UnknownType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let semantic = match s.trim().to_lowercase().as_str() {
            "string" | "character varying" | "varchar" => SemanticType::String,
            "text" | "mediumtext" | "longtext" => SemanticType::Text,
            "int" | "integer" | "smallint" | "number" => SemanticType::Integer,
            "bigint" | "biginteger" => SemanticType::BigInteger,
            "float" | "real" => SemanticType::Float,
            "double" | "double precision" => SemanticType::Double,
            "decimal" | "numeric" => SemanticType::Decimal,
            "boolean" | "bool" => SemanticType::Boolean,
            "date" => SemanticType::Date,
            "datetime" | "datestamp" | "timestamp" => SemanticType::DateTime,
            "time" => SemanticType::Time,
            "json" => SemanticType::Json,
            "jsonb" => SemanticType::Jsonb,
            "binary" | "bytea" => SemanticType::Binary,
            "uuid" => SemanticType::Uuid,
            "array" => SemanticType::Array,
            "serial" | "smallserial" => SemanticType::Serial,
            "bigserial" => SemanticType::BigSerial,
            "enum" | "enu" => SemanticType::Enum,
            "sqltype" => SemanticType::Native,
            other => return Err(UnknownType(other.to_string())),
        };
        Ok(semantic)
    }
}

impl SemanticType {
    /// Type of a column that stores a reference to a key of this type.
    pub fn referencing_type(&self) -> SemanticType {
        match self {
            SemanticType::Serial => SemanticType::Integer,
            SemanticType::BigSerial => SemanticType::BigInteger,
            other => other.clone(),
        }
    }

    fn native(&self, attr: &ResolvedAttribute) -> String {
        match self {
            SemanticType::String => format!("varchar({})", attr.length.unwrap_or(255)),
            SemanticType::Text | SemanticType::Enum | SemanticType::Native => "text".into(),
            SemanticType::Integer => "integer".into(),
            SemanticType::BigInteger => "bigint".into(),
            SemanticType::Float => "real".into(),
            SemanticType::Double => "double precision".into(),
            SemanticType::Decimal => format!(
                "decimal({}, {})",
                attr.precision.unwrap_or(8),
                attr.scale.unwrap_or(2)
            ),
            SemanticType::Boolean => "boolean".into(),
            SemanticType::Date => "date".into(),
            SemanticType::DateTime if attr.standard => "timestamp".into(),
            SemanticType::DateTime => "timestamptz".into(),
            SemanticType::Time => "time".into(),
            SemanticType::Json => "json".into(),
            SemanticType::Jsonb => "jsonb".into(),
            SemanticType::Binary => "bytea".into(),
            SemanticType::Uuid => "uuid".into(),
            SemanticType::Array => "text[]".into(),
            SemanticType::Serial => "serial".into(),
            SemanticType::BigSerial => "bigserial".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnConstraint {
    NotNull,
    Unique,
    Default(String),
    Check(String),
}

impl ColumnConstraint {
    fn render(&self) -> String {
        match self {
            ColumnConstraint::NotNull => "NOT NULL".into(),
            ColumnConstraint::Unique => "UNIQUE".into(),
            ColumnConstraint::Default(expr) => format!("DEFAULT {}", expr),
            ColumnConstraint::Check(expr) => format!("CHECK ({})", expr),
        }
    }
}

/// One column of a CREATE TABLE or ADD COLUMN statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDirective {
    pub name: String,
    pub sql_type: String,
    pub constraints: Vec<ColumnConstraint>,
}

impl ColumnDirective {
    pub fn render(&self) -> String {
        let mut parts = vec![quote_ident(&self.name), self.sql_type.clone()];
        parts.extend(self.constraints.iter().map(ColumnConstraint::render));
        parts.join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableConstraint {
    PrimaryKey(Vec<String>),
    Unique(Vec<String>),
}

impl TableConstraint {
    fn render(&self) -> String {
        match self {
            TableConstraint::PrimaryKey(columns) => format!("PRIMARY KEY ({})", ident_list(columns)),
            TableConstraint::Unique(columns) => format!("UNIQUE ({})", ident_list(columns)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDirective {
    pub name: String,
    pub table: String,
    pub column: String,
    pub method: Option<String>,
}

impl IndexDirective {
    pub fn render(&self) -> String {
        let using = self
            .method
            .as_ref()
            .map(|method| format!(" USING {}", method))
            .unwrap_or_default();
        format!(
            "CREATE INDEX {} ON {}{} ({})",
            quote_ident(&self.name),
            quote_ident(&self.table),
            using,
            quote_ident(&self.column)
        )
    }
}

/// Everything needed to create one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDirectives {
    pub table: String,
    pub columns: Vec<ColumnDirective>,
    pub constraints: Vec<TableConstraint>,
    pub indexes: Vec<IndexDirective>,
}

impl TableDirectives {
    pub fn for_table(definition: &TableDefinition) -> Self {
        let table = truncate_identifier(&definition.name).to_string();
        let columns = definition.attributes.values().map(column_directive).collect();

        let mut constraints = Vec::new();
        let primary: Vec<String> = definition
            .attributes
            .values()
            .filter(|attr| attr.primary_key)
            .map(|attr| attr.name.clone())
            .collect();
        if !primary.is_empty() {
            constraints.push(TableConstraint::PrimaryKey(primary));
        }
        for attr in definition.attributes.values() {
            if attr.composite_unique.is_empty() {
                continue;
            }
            let constraint = TableConstraint::Unique(attr.composite_unique.clone());
            if !constraints.contains(&constraint) {
                constraints.push(constraint);
            }
        }

        let indexes = definition
            .attributes
            .values()
            .filter_map(|attr| index_directive(&table, attr))
            .collect();

        Self {
            table,
            columns,
            constraints,
            indexes,
        }
    }

    /// CREATE TABLE followed by one CREATE INDEX per indexed column.
    pub fn statements(&self) -> Vec<String> {
        let mut body: Vec<String> = self.columns.iter().map(ColumnDirective::render).collect();
        body.extend(self.constraints.iter().map(TableConstraint::render));

        let mut statements = vec![format!(
            "CREATE TABLE {} ({})",
            quote_ident(&self.table),
            body.join(", ")
        )];
        statements.extend(self.indexes.iter().map(IndexDirective::render));
        statements
    }
}

pub fn column_directive(attr: &ResolvedAttribute) -> ColumnDirective {
    let mut constraints = Vec::new();

    let sql_type = if !attr.enum_values.is_empty() {
        let values: Vec<String> = attr.enum_values.iter().map(|v| quote_literal(v)).collect();
        constraints.push(ColumnConstraint::Check(format!(
            "{} IN ({})",
            quote_ident(&attr.name),
            values.join(", ")
        )));
        "text".to_string()
    } else if attr.auto_increment {
        match attr.semantic {
            SemanticType::BigInteger | SemanticType::BigSerial => "bigserial".into(),
            _ => "serial".into(),
        }
    } else if let Some(db_type) = &attr.db_type {
        db_type.clone()
    } else {
        attr.semantic.native(attr)
    };

    if attr.not_null {
        constraints.push(ColumnConstraint::NotNull);
    }
    if attr.unique && !attr.primary_key {
        constraints.push(ColumnConstraint::Unique);
    }
    match &attr.default {
        Some(Value::String(s)) if s.eq_ignore_ascii_case("AUTO_INCREMENT") => {}
        Some(value) if !attr.auto_increment => {
            constraints.push(ColumnConstraint::Default(default_literal(value, attr)));
        }
        None if attr.primary_key
            && attr.semantic == SemanticType::Uuid
            && attr.db_type.is_none() =>
        {
            constraints.push(ColumnConstraint::Default("uuid_generate_v4()".into()));
        }
        _ => {}
    }

    ColumnDirective {
        name: attr.name.clone(),
        sql_type,
        constraints,
    }
}

fn index_directive(table: &str, attr: &ResolvedAttribute) -> Option<IndexDirective> {
    let spec = attr.index.as_ref()?;
    let name = spec
        .name
        .clone()
        .unwrap_or_else(|| format!("{}_{}_index", table, attr.name));
    Some(IndexDirective {
        name: truncate_identifier(&name).to_string(),
        table: table.to_string(),
        column: attr.name.clone(),
        method: spec.method.clone(),
    })
}

pub fn add_column_statements(table: &str, attr: &ResolvedAttribute) -> Vec<String> {
    let table = truncate_identifier(table);
    let mut statements = vec![format!(
        "ALTER TABLE {} ADD COLUMN {}",
        quote_ident(table),
        column_directive(attr).render()
    )];
    if let Some(index) = index_directive(table, attr) {
        statements.push(index.render());
    }
    statements
}

pub fn drop_column_statement(table: &str, column: &str) -> String {
    format!(
        "ALTER TABLE {} DROP COLUMN {}",
        quote_ident(truncate_identifier(table)),
        quote_ident(column)
    )
}

pub fn drop_table_statement(table: &str) -> String {
    format!("DROP TABLE IF EXISTS {}", quote_ident(truncate_identifier(table)))
}

/// Cut an identifier to PostgreSQL's limit without splitting a character.
pub fn truncate_identifier(name: &str) -> &str {
    if name.len() <= MAX_IDENTIFIER_LENGTH {
        return name;
    }
    let mut end = MAX_IDENTIFIER_LENGTH;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn ident_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Native array literal (`{"a","b"}`) for a JSON array.
pub fn array_literal(values: &[Value]) -> String {
    let elements: Vec<String> = values
        .iter()
        .map(|value| match value {
            Value::Null => "NULL".to_string(),
            Value::Array(inner) => array_literal(inner),
            Value::String(s) => quote_array_element(s),
            other => quote_array_element(&other.to_string()),
        })
        .collect();
    format!("{{{}}}", elements.join(","))
}

fn quote_array_element(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// SQL literal for a column default.
pub fn default_literal(value: &Value, attr: &ResolvedAttribute) -> String {
    match value {
        Value::Null => "NULL".into(),
        Value::Bool(true) => "TRUE".into(),
        Value::Bool(false) => "FALSE".into(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => quote_literal(s),
        Value::Array(items) if attr.is_array() => quote_literal(&array_literal(items)),
        other => quote_literal(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::IndexSpec;
    use serde_json::json;

    fn attr(name: &str, semantic: SemanticType) -> ResolvedAttribute {
        ResolvedAttribute {
            name: name.into(),
            attribute: name.into(),
            semantic,
            db_type: None,
            length: None,
            precision: None,
            scale: None,
            standard: false,
            enum_values: Vec::new(),
            primary_key: false,
            auto_increment: false,
            unique: false,
            composite_unique: Vec::new(),
            index: None,
            not_null: false,
            default: None,
            references: None,
        }
    }

    #[test]
    fn test_semantic_type_from_str() {
        assert_eq!("STRING".parse::<SemanticType>().unwrap(), SemanticType::String);
        assert_eq!("datetime".parse::<SemanticType>().unwrap(), SemanticType::DateTime);
        assert_eq!("bytea".parse::<SemanticType>().unwrap(), SemanticType::Binary);
        assert_eq!("mediumtext".parse::<SemanticType>().unwrap(), SemanticType::Text);
        assert!("hologram".parse::<SemanticType>().is_err());
    }

    #[test]
    fn test_native_types() {
        let cases = [
            (SemanticType::String, "varchar(255)"),
            (SemanticType::Text, "text"),
            (SemanticType::Integer, "integer"),
            (SemanticType::BigInteger, "bigint"),
            (SemanticType::Float, "real"),
            (SemanticType::Double, "double precision"),
            (SemanticType::Decimal, "decimal(8, 2)"),
            (SemanticType::Boolean, "boolean"),
            (SemanticType::Date, "date"),
            (SemanticType::DateTime, "timestamptz"),
            (SemanticType::Time, "time"),
            (SemanticType::Json, "json"),
            (SemanticType::Jsonb, "jsonb"),
            (SemanticType::Binary, "bytea"),
            (SemanticType::Uuid, "uuid"),
            (SemanticType::Array, "text[]"),
            (SemanticType::Serial, "serial"),
            (SemanticType::BigSerial, "bigserial"),
        ];
        for (semantic, expected) in cases {
            assert_eq!(column_directive(&attr("c", semantic)).sql_type, expected);
        }
    }

    #[test]
    fn test_string_length_and_decimal_precision() {
        let mut name = attr("name", SemanticType::String);
        name.length = Some(40);
        assert_eq!(column_directive(&name).sql_type, "varchar(40)");

        let mut price = attr("price", SemanticType::Decimal);
        price.precision = Some(10);
        price.scale = Some(4);
        assert_eq!(column_directive(&price).sql_type, "decimal(10, 4)");
    }

    #[test]
    fn test_enum_wins_over_everything() {
        let mut status = attr("status", SemanticType::String);
        status.enum_values = vec!["open".into(), "closed".into()];
        status.db_type = Some("varchar(10)".into());
        status.auto_increment = true;
        let directive = column_directive(&status);
        assert_eq!(directive.sql_type, "text");
        assert_eq!(
            directive.render(),
            "\"status\" text CHECK (\"status\" IN ('open', 'closed'))"
        );
    }

    #[test]
    fn test_auto_increment_before_db_type() {
        let mut id = attr("id", SemanticType::Integer);
        id.auto_increment = true;
        id.db_type = Some("smallint".into());
        assert_eq!(column_directive(&id).sql_type, "serial");

        let mut big = attr("id", SemanticType::BigInteger);
        big.auto_increment = true;
        assert_eq!(column_directive(&big).sql_type, "bigserial");
    }

    #[test]
    fn test_db_type_verbatim() {
        let mut location = attr("location", SemanticType::Json);
        location.db_type = Some("geometry(Point, 4326)".into());
        assert_eq!(column_directive(&location).sql_type, "geometry(Point, 4326)");
    }

    #[test]
    fn test_constraints() {
        let mut email = attr("email", SemanticType::String);
        email.not_null = true;
        email.unique = true;
        email.default = Some(json!("n/a"));
        assert_eq!(
            column_directive(&email).render(),
            "\"email\" varchar(255) NOT NULL UNIQUE DEFAULT 'n/a'"
        );

        let mut id = attr("id", SemanticType::Integer);
        id.primary_key = true;
        id.unique = true;
        id.auto_increment = true;
        id.default = Some(json!("AUTO_INCREMENT"));
        assert_eq!(column_directive(&id).render(), "\"id\" serial");
    }

    #[test]
    fn test_uuid_primary_key_default() {
        let mut id = attr("id", SemanticType::Uuid);
        id.primary_key = true;
        assert_eq!(
            column_directive(&id).render(),
            "\"id\" uuid DEFAULT uuid_generate_v4()"
        );
    }

    #[test]
    fn test_default_literals() {
        let tags = {
            let mut a = attr("tags", SemanticType::Array);
            a.default = Some(json!(["a", "b"]));
            a
        };
        assert_eq!(
            column_directive(&tags).render(),
            "\"tags\" text[] DEFAULT '{\"a\",\"b\"}'"
        );

        let mut active = attr("active", SemanticType::Boolean);
        active.default = Some(json!(true));
        assert_eq!(column_directive(&active).render(), "\"active\" boolean DEFAULT TRUE");

        let mut meta = attr("meta", SemanticType::Json);
        meta.default = Some(json!({"k": "it's"}));
        assert_eq!(
            column_directive(&meta).render(),
            "\"meta\" json DEFAULT '{\"k\":\"it''s\"}'"
        );
    }

    #[test]
    fn test_create_table_statements() {
        let mut id = attr("id", SemanticType::Integer);
        id.primary_key = true;
        id.auto_increment = true;
        let mut a = attr("a", SemanticType::String);
        a.composite_unique = vec!["a".into(), "b".into()];
        a.index = Some(IndexSpec {
            name: None,
            method: None,
        });
        let mut b = attr("b", SemanticType::String);
        b.composite_unique = vec!["a".into(), "b".into()];
        let definition = TableDefinition::new("pets", vec![id, a, b]);

        let statements = TableDirectives::for_table(&definition).statements();
        assert_eq!(
            statements[0],
            "CREATE TABLE \"pets\" (\"id\" serial, \"a\" varchar(255), \"b\" varchar(255), \
             PRIMARY KEY (\"id\"), UNIQUE (\"a\", \"b\"))"
        );
        assert_eq!(
            statements[1],
            "CREATE INDEX \"pets_a_index\" ON \"pets\" (\"a\")"
        );
    }

    #[test]
    fn test_unique_object_forms_render_constraints() {
        let collections: indexmap::IndexMap<String, crate::schema::CollectionInput> =
            serde_json::from_value(json!({ "t": { "attributes": {
                "id": { "type": "integer", "primaryKey": true },
                "nick": { "type": "string", "unique": { "unique": true } },
                "b": { "type": "string", "unique": { "composite": ["c"] } },
                "c": "string"
            } } }))
            .unwrap();
        let schema = crate::schema::build_schema(&collections);
        let statements = TableDirectives::for_table(schema.table("t").unwrap()).statements();
        assert!(statements[0].contains("\"nick\" varchar(255) UNIQUE"));
        assert!(statements[0].contains("UNIQUE (\"b\", \"c\")"));
        assert!(!statements[0].contains("UNIQUE (\"c\")"));
    }

    #[test]
    fn test_long_table_names_truncated() {
        let long = "t".repeat(80);
        let definition = TableDefinition::new(long.clone(), vec![attr("c", SemanticType::Text)]);
        let directives = TableDirectives::for_table(&definition);
        assert_eq!(directives.table.len(), MAX_IDENTIFIER_LENGTH);
        assert_eq!(drop_table_statement(&long), format!("DROP TABLE IF EXISTS \"{}\"", "t".repeat(63)));
    }

    #[test]
    fn test_truncate_identifier_char_boundary() {
        let name = format!("{}é", "a".repeat(62));
        assert_eq!(truncate_identifier(&name), "a".repeat(62));
        assert_eq!(truncate_identifier("short"), "short");
    }

    #[test]
    fn test_index_name_truncated_and_method() {
        let mut c = attr("column_with_a_rather_long_name", SemanticType::Jsonb);
        c.index = Some(IndexSpec {
            name: None,
            method: Some("gin".into()),
        });
        let statements = add_column_statements("table_with_a_rather_long_name_as_well", &c);
        assert_eq!(
            statements[0],
            "ALTER TABLE \"table_with_a_rather_long_name_as_well\" ADD COLUMN \
             \"column_with_a_rather_long_name\" jsonb"
        );
        assert!(statements[1].contains("USING gin"));
        let name = statements[1].split('"').nth(1).unwrap();
        assert_eq!(name.len(), MAX_IDENTIFIER_LENGTH);
    }

    #[test]
    fn test_array_literal() {
        assert_eq!(array_literal(&[json!("a"), json!("b c")]), "{\"a\",\"b c\"}");
        assert_eq!(array_literal(&[json!(1), Value::Null]), "{\"1\",NULL}");
        assert_eq!(array_literal(&[json!("q\"x")]), "{\"q\\\"x\"}");
        assert_eq!(array_literal(&[json!([1, 2]), json!([3, 4])]), "{{\"1\",\"2\"},{\"3\",\"4\"}}");
        assert_eq!(array_literal(&[json!({"a": 1})]), "{\"{\\\"a\\\":1}\"}");
        assert_eq!(array_literal(&[]), "{}");
    }

    #[test]
    fn test_quote_ident_escapes() {
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
