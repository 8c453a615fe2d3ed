//! Criteria → SQL compiler.
//!
//! Every statement is built clause by clause in textual order so that bound
//! values receive `$n` placeholders in the order they appear.

use serde_json::Value;

use super::{Criteria, Filter, Operator, SortSpec};
use crate::codec::SqlValue;
use crate::error::{AdapterError, Result};
use crate::schema::{Schema, TableDefinition};
use crate::spatial;
use crate::types::{array_literal, quote_literal};

/// Fixed dialect settings shared by every statement an adapter compiles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialectOptions {
    /// Bind values as `$n` parameters instead of inlining literals.
    pub parameterized: bool,
    /// When false, string comparisons use `LOWER()` and `ILIKE`.
    pub case_sensitive: bool,
    pub escape_character: char,
    /// Append `RETURNING` to writes so affected rows come back.
    pub can_return_values: bool,
}

impl Default for DialectOptions {
    fn default() -> Self {
        Self {
            parameterized: true,
            case_sensitive: true,
            escape_character: '"',
            can_return_values: true,
        }
    }
}

impl DialectOptions {
    pub fn quote(&self, ident: &str) -> String {
        let q = self.escape_character;
        let doubled: String = [q, q].iter().collect();
        format!("{q}{}{q}", ident.replace(q, &doubled))
    }

    pub fn qualify(&self, table: &str, column: &str) -> String {
        format!("{}.{}", self.quote(table), self.quote(column))
    }

    pub fn placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }
}

/// SQL text plus the values bound to its placeholders, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub sql: String,
    pub values: Vec<Value>,
}

impl CompiledQuery {
    pub fn new(sql: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            values,
        }
    }
}

pub(crate) struct SqlWriter<'d> {
    dialect: &'d DialectOptions,
    values: Vec<Value>,
}

impl<'d> SqlWriter<'d> {
    pub(crate) fn new(dialect: &'d DialectOptions) -> Self {
        Self {
            dialect,
            values: Vec::new(),
        }
    }

    pub(crate) fn bind(&mut self, value: Value) -> String {
        if !self.dialect.parameterized {
            return inline_literal(&value);
        }
        self.values.push(value);
        self.dialect.placeholder(self.values.len())
    }

    pub(crate) fn bind_sql_value(&mut self, value: &SqlValue) -> String {
        match value {
            SqlValue::Param(value) => self.bind(value.clone()),
            SqlValue::Geometry { value, srid } => {
                let placeholder = self.bind(value.clone());
                spatial::write_expression(&placeholder, *srid)
            }
        }
    }

    pub(crate) fn finish(self, sql: String) -> CompiledQuery {
        CompiledQuery::new(sql, self.values)
    }
}

fn inline_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".into(),
        Value::Bool(true) => "TRUE".into(),
        Value::Bool(false) => "FALSE".into(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => quote_literal(s),
        Value::Array(items) => quote_literal(&array_literal(items)),
        Value::Object(_) => quote_literal(&value.to_string()),
    }
}

/// Compiles criteria against one connection's schema.
pub struct CriteriaCompiler<'a> {
    pub(crate) schema: &'a Schema,
    pub(crate) dialect: &'a DialectOptions,
}

impl<'a> CriteriaCompiler<'a> {
    pub fn new(schema: &'a Schema, dialect: &'a DialectOptions) -> Self {
        Self { schema, dialect }
    }

    pub fn find(&self, table: &str, criteria: &Criteria) -> Result<CompiledQuery> {
        let definition = self.schema.table(table)?;
        let mut writer = SqlWriter::new(self.dialect);
        let mut parts = Vec::new();

        if criteria.is_aggregate() {
            parts.push(format!("SELECT {}", self.aggregate_projection(table, criteria)?));
        } else {
            parts.push(format!("SELECT {}", self.projection(definition, table)));
        }
        parts.push(format!("FROM {}", self.dialect.quote(table)));

        if let Some(clause) = self.where_clause(&mut writer, table, criteria.filter.as_ref())? {
            parts.push(format!("WHERE {}", clause));
        }
        if !criteria.group_by.is_empty() {
            let groups: Vec<String> = criteria
                .group_by
                .iter()
                .map(|column| self.dialect.qualify(table, column))
                .collect();
            parts.push(format!("GROUP BY {}", groups.join(", ")));
        }
        parts.push(format!("ORDER BY {}", self.order_by(table, &criteria.sort)));
        parts.push(pagination(criteria));

        Ok(writer.finish(parts.join(" ")))
    }

    pub fn count(&self, table: &str, criteria: &Criteria) -> Result<CompiledQuery> {
        self.schema.table(table)?;
        let mut writer = SqlWriter::new(self.dialect);
        let mut parts = vec![
            format!("SELECT COUNT(*) AS {}", self.dialect.quote("count")),
            format!("FROM {}", self.dialect.quote(table)),
        ];
        if let Some(clause) = self.where_clause(&mut writer, table, criteria.filter.as_ref())? {
            parts.push(format!("WHERE {}", clause));
        }
        Ok(writer.finish(parts.join(" ")))
    }

    /// INSERT of one sanitized record. An empty record inserts defaults.
    pub fn insert(&self, table: &str, values: &[(String, SqlValue)]) -> Result<CompiledQuery> {
        let definition = self.schema.table(table)?;
        let mut writer = SqlWriter::new(self.dialect);
        let mut parts = vec![format!("INSERT INTO {}", self.dialect.quote(table))];

        if values.is_empty() {
            parts.push("DEFAULT VALUES".to_string());
        } else {
            let columns: Vec<String> = values.iter().map(|(c, _)| self.dialect.quote(c)).collect();
            let placeholders: Vec<String> =
                values.iter().map(|(_, v)| writer.bind_sql_value(v)).collect();
            parts.push(format!("({})", columns.join(", ")));
            parts.push(format!("VALUES ({})", placeholders.join(", ")));
        }
        if let Some(returning) = self.returning(definition, table) {
            parts.push(returning);
        }
        Ok(writer.finish(parts.join(" ")))
    }

    /// UPDATE of every row matching the criteria. Sort and pagination are
    /// ignored; callers handle an empty change set before compiling.
    pub fn update(
        &self,
        table: &str,
        criteria: &Criteria,
        values: &[(String, SqlValue)],
    ) -> Result<CompiledQuery> {
        let definition = self.schema.table(table)?;
        if values.is_empty() {
            return Err(AdapterError::InvalidCriteria(
                "update requires at least one changed attribute".into(),
            ));
        }
        let mut writer = SqlWriter::new(self.dialect);
        let assignments: Vec<String> = values
            .iter()
            .map(|(column, value)| {
                format!("{} = {}", self.dialect.quote(column), writer.bind_sql_value(value))
            })
            .collect();
        let mut parts = vec![
            format!("UPDATE {}", self.dialect.quote(table)),
            format!("SET {}", assignments.join(", ")),
        ];
        if let Some(clause) = self.where_clause(&mut writer, table, criteria.filter.as_ref())? {
            parts.push(format!("WHERE {}", clause));
        }
        if let Some(returning) = self.returning(definition, table) {
            parts.push(returning);
        }
        Ok(writer.finish(parts.join(" ")))
    }

    pub fn destroy(&self, table: &str, criteria: &Criteria) -> Result<CompiledQuery> {
        let definition = self.schema.table(table)?;
        let mut writer = SqlWriter::new(self.dialect);
        let mut parts = vec![format!("DELETE FROM {}", self.dialect.quote(table))];
        if let Some(clause) = self.where_clause(&mut writer, table, criteria.filter.as_ref())? {
            parts.push(format!("WHERE {}", clause));
        }
        if let Some(returning) = self.returning(definition, table) {
            parts.push(returning);
        }
        Ok(writer.finish(parts.join(" ")))
    }

    /// `"alias".*` followed by a GeoJSON projection of each geometry column.
    pub(crate) fn projection(&self, definition: &TableDefinition, alias: &str) -> String {
        let mut items = vec![format!("{}.*", self.dialect.quote(alias))];
        items.extend(definition.spatial_columns().map(|attr| {
            spatial::select_expression(
                &self.dialect.qualify(alias, &attr.name),
                &self.dialect.quote(&attr.name),
            )
        }));
        items.join(", ")
    }

    fn aggregate_projection(&self, table: &str, criteria: &Criteria) -> Result<String> {
        let mut items: Vec<String> = criteria
            .group_by
            .iter()
            .map(|column| self.dialect.qualify(table, column))
            .collect();
        items.extend(criteria.aggregates.iter().map(|aggregate| {
            format!(
                "{}({}) AS {}",
                aggregate.function.sql_name(),
                self.dialect.qualify(table, &aggregate.column),
                self.dialect.quote(&aggregate.column)
            )
        }));
        if items.is_empty() {
            return Err(AdapterError::InvalidCriteria("empty aggregate projection".into()));
        }
        Ok(items.join(", "))
    }

    fn returning(&self, definition: &TableDefinition, table: &str) -> Option<String> {
        self.dialect
            .can_return_values
            .then(|| format!("RETURNING {}", self.projection(definition, table)))
    }

    /// Qualified sort tokens, or the constant `1` when no sort is given.
    pub(crate) fn order_by(&self, alias: &str, sort: &[SortSpec]) -> String {
        if sort.is_empty() {
            return "1".to_string();
        }
        sort.iter()
            .map(|spec| {
                let direction = if spec.is_ascending() { "ASC" } else { "DESC" };
                format!("{} {}", self.dialect.qualify(alias, &spec.column), direction)
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub(crate) fn where_clause(
        &self,
        writer: &mut SqlWriter<'_>,
        alias: &str,
        filter: Option<&Filter>,
    ) -> Result<Option<String>> {
        match filter {
            None => Ok(None),
            Some(Filter::And(items)) if items.is_empty() => Ok(None),
            Some(filter) => self.compile_filter(writer, alias, filter).map(Some),
        }
    }

    fn compile_filter(
        &self,
        writer: &mut SqlWriter<'_>,
        alias: &str,
        filter: &Filter,
    ) -> Result<String> {
        match filter {
            Filter::And(items) => self.compile_group(writer, alias, items, " AND ", "TRUE"),
            Filter::Or(items) => self.compile_group(writer, alias, items, " OR ", "FALSE"),
            Filter::Not(inner) => Ok(format!("NOT ({})", self.compile_filter(writer, alias, inner)?)),
            Filter::Condition { column, op, value } => {
                self.compile_condition(writer, alias, column, *op, value)
            }
        }
    }

    fn compile_group(
        &self,
        writer: &mut SqlWriter<'_>,
        alias: &str,
        items: &[Filter],
        separator: &str,
        empty: &str,
    ) -> Result<String> {
        match items {
            [] => Ok(empty.to_string()),
            [single] => self.compile_filter(writer, alias, single),
            _ => {
                let compiled = items
                    .iter()
                    .map(|item| self.compile_filter(writer, alias, item))
                    .collect::<Result<Vec<_>>>()?;
                Ok(format!("({})", compiled.join(separator)))
            }
        }
    }

    fn compile_condition(
        &self,
        writer: &mut SqlWriter<'_>,
        alias: &str,
        column: &str,
        op: Operator,
        value: &Value,
    ) -> Result<String> {
        let target = self.dialect.qualify(alias, column);
        let fold_case = !self.dialect.case_sensitive && value.is_string();
        let like = if self.dialect.case_sensitive { "LIKE" } else { "ILIKE" };

        let sql = match op {
            Operator::IsNull => format!("{} IS NULL", target),
            Operator::IsNotNull => format!("{} IS NOT NULL", target),
            Operator::Eq | Operator::NotEq | Operator::Lt | Operator::Lte | Operator::Gt | Operator::Gte => {
                let symbol = match op {
                    Operator::Eq => "=",
                    Operator::NotEq => "<>",
                    Operator::Lt => "<",
                    Operator::Lte => "<=",
                    Operator::Gt => ">",
                    _ => ">=",
                };
                let placeholder = writer.bind(value.clone());
                if fold_case {
                    format!("LOWER({}) {} LOWER({})", target, symbol, placeholder)
                } else {
                    format!("{} {} {}", target, symbol, placeholder)
                }
            }
            Operator::In | Operator::NotIn => {
                let negate = op == Operator::NotIn;
                let items = match value {
                    Value::Array(items) => items.clone(),
                    other => vec![other.clone()],
                };
                let has_null = items.iter().any(Value::is_null);
                let placeholders: Vec<String> = items
                    .into_iter()
                    .filter(|item| !item.is_null())
                    .map(|item| writer.bind(item))
                    .collect();
                in_list(&target, &placeholders, has_null, negate)
            }
            Operator::Like | Operator::Contains | Operator::StartsWith | Operator::EndsWith => {
                let text = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                let pattern = match op {
                    Operator::Contains => format!("%{}%", text),
                    Operator::StartsWith => format!("{}%", text),
                    Operator::EndsWith => format!("%{}", text),
                    _ => text,
                };
                format!("{} {} {}", target, like, writer.bind(Value::String(pattern)))
            }
        };
        Ok(sql)
    }
}

fn in_list(target: &str, placeholders: &[String], has_null: bool, negate: bool) -> String {
    let list = (!placeholders.is_empty()).then(|| {
        let keyword = if negate { "NOT IN" } else { "IN" };
        format!("{} {} ({})", target, keyword, placeholders.join(", "))
    });
    let null_check = has_null.then(|| {
        let keyword = if negate { "IS NOT NULL" } else { "IS NULL" };
        format!("{} {}", target, keyword)
    });
    match (list, null_check) {
        (Some(list), Some(null)) if negate => format!("({} AND {})", list, null),
        (Some(list), Some(null)) => format!("({} OR {})", list, null),
        (Some(list), None) => list,
        (None, Some(null)) => null,
        (None, None) if negate => "TRUE".to_string(),
        (None, None) => "FALSE".to_string(),
    }
}

pub(crate) fn pagination(criteria: &Criteria) -> String {
    format!(
        "LIMIT {} OFFSET {}",
        criteria.effective_limit(),
        criteria.effective_skip()
    )
}

/// Rewrite legacy `?` placeholders to `$1, $2, ...`.
///
/// Text that already uses `$n` is returned unchanged. Question marks inside
/// quotes and the jsonb operators `?|` and `?&` are left alone; `??` yields a
/// literal `?`.
pub fn translate_placeholders(sql: &str) -> String {
    let bytes = sql.as_bytes();
    if bytes
        .windows(2)
        .any(|pair| pair[0] == b'$' && pair[1].is_ascii_digit())
    {
        return sql.to_string();
    }

    let mut out = String::with_capacity(sql.len() + 8);
    let mut index = 0;
    let mut in_single = false;
    let mut in_double = false;
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' if !in_double => {
                in_single = !in_single;
                out.push(c);
            }
            '"' if !in_single => {
                in_double = !in_double;
                out.push(c);
            }
            '?' if !in_single && !in_double => match chars.peek() {
                Some('|') | Some('&') => out.push('?'),
                Some('?') => {
                    chars.next();
                    out.push('?');
                }
                _ => {
                    index += 1;
                    out.push_str(&format!("${}", index));
                }
            },
            _ => out.push(c),
        }
    }
    out
}
