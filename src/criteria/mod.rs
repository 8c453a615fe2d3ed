//! Query criteria: filter trees, sort, pagination, aggregates and joins,
//! and their compilation into parameterized SQL.

pub mod compiler;
pub mod join;

pub use compiler::{translate_placeholders, CompiledQuery, CriteriaCompiler, DialectOptions};

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{AdapterError, Result};

/// Limit used when none is given.
pub const DEFAULT_LIMIT: i64 = i32::MAX as i64;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Criteria {
    pub filter: Option<Filter>,
    pub sort: Vec<SortSpec>,
    pub limit: Option<i64>,
    pub skip: Option<i64>,
    pub joins: Vec<JoinSpec>,
    pub group_by: Vec<String>,
    pub aggregates: Vec<Aggregate>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Condition {
        column: String,
        op: Operator,
        value: Value,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    NotEq,
    Lt,
    Lte,
    Gt,
    Gte,
    In,
    NotIn,
    Like,
    Contains,
    StartsWith,
    EndsWith,
    IsNull,
    IsNotNull,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortSpec {
    pub column: String,
    /// 1 sorts ascending; anything else sorts descending.
    pub direction: i32,
}

impl SortSpec {
    pub fn is_ascending(&self) -> bool {
        self.direction == 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFn {
    Sum,
    Average,
    Min,
    Max,
}

impl AggregateFn {
    pub fn sql_name(&self) -> &'static str {
        match self {
            AggregateFn::Sum => "SUM",
            AggregateFn::Average => "AVG",
            AggregateFn::Min => "MIN",
            AggregateFn::Max => "MAX",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregate {
    pub function: AggregateFn,
    pub column: String,
}

/// One association to load alongside the parent rows.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinSpec {
    pub parent: String,
    pub parent_key: String,
    pub child: String,
    pub child_key: String,
    /// Key the aggregated children are returned under.
    pub alias: String,
    /// Joins with `select == false` only link a junction table.
    pub select: bool,
    pub remove_parent_key: bool,
    pub junction_table: bool,
    pub criteria: Criteria,
}

impl JoinSpec {
    pub fn new(
        parent: impl Into<String>,
        parent_key: impl Into<String>,
        child: impl Into<String>,
        child_key: impl Into<String>,
        alias: impl Into<String>,
    ) -> Self {
        Self {
            parent: parent.into(),
            parent_key: parent_key.into(),
            child: child.into(),
            child_key: child_key.into(),
            alias: alias.into(),
            select: true,
            remove_parent_key: false,
            junction_table: false,
            criteria: Criteria::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinInput {
    parent: String,
    parent_key: String,
    child: String,
    child_key: String,
    alias: Option<String>,
    #[serde(default = "default_true")]
    select: SelectInput,
    #[serde(default)]
    remove_parent_key: bool,
    #[serde(default)]
    junction_table: bool,
    #[serde(default)]
    criteria: Option<Value>,
}

/// `select` is either a flag or a list of child columns; only `false` matters.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SelectInput {
    Flag(bool),
    Columns(Vec<String>),
}

fn default_true() -> SelectInput {
    SelectInput::Flag(true)
}

const RESERVED_KEYS: &[&str] = &[
    "where", "sort", "limit", "skip", "joins", "groupBy", "sum", "average", "min", "max",
    "select", "omit",
];

impl Criteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => Filter::And(vec![existing, filter]),
            None => filter,
        });
        self
    }

    pub fn sort_by(mut self, column: impl Into<String>, direction: i32) -> Self {
        self.sort.push(SortSpec {
            column: column.into(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn skip(mut self, skip: i64) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn join(mut self, join: JoinSpec) -> Self {
        self.joins.push(join);
        self
    }

    pub fn effective_limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_LIMIT)
    }

    pub fn effective_skip(&self) -> i64 {
        self.skip.unwrap_or(0)
    }

    pub fn is_paginated(&self) -> bool {
        self.limit.is_some() || self.skip.is_some()
    }

    pub fn is_aggregate(&self) -> bool {
        !self.group_by.is_empty() || !self.aggregates.is_empty()
    }

    /// Parse the JSON criteria shape used by ORM callers.
    ///
    /// A missing `where` key means every non-reserved key is a filter.
    pub fn from_json(value: &Value) -> Result<Self> {
        let object = match value {
            Value::Null => return Ok(Self::default()),
            Value::Object(object) => object,
            other => {
                return Err(AdapterError::InvalidCriteria(format!(
                    "criteria must be an object, got {}",
                    other
                )))
            }
        };

        let mut criteria = Self::default();
        let filter = match object.get("where") {
            Some(Value::Null) => None,
            Some(Value::Object(conditions)) => parse_conditions(conditions)?,
            Some(other) => {
                return Err(AdapterError::InvalidCriteria(format!(
                    "where must be an object, got {}",
                    other
                )))
            }
            None => {
                let loose: Map<String, Value> = object
                    .iter()
                    .filter(|(key, _)| !RESERVED_KEYS.contains(&key.as_str()))
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect();
                parse_conditions(&loose)?
            }
        };
        criteria.filter = filter;

        if let Some(sort) = object.get("sort") {
            criteria.sort = parse_sort(sort)?;
        }
        criteria.limit = parse_count(object.get("limit"), "limit")?;
        criteria.skip = parse_count(object.get("skip"), "skip")?;
        criteria.group_by = parse_columns(object.get("groupBy"), "groupBy")?;
        for (key, function) in [
            ("sum", AggregateFn::Sum),
            ("average", AggregateFn::Average),
            ("min", AggregateFn::Min),
            ("max", AggregateFn::Max),
        ] {
            for column in parse_columns(object.get(key), key)? {
                criteria.aggregates.push(Aggregate { function, column });
            }
        }
        if let Some(joins) = object.get("joins") {
            criteria.joins = parse_joins(joins)?;
        }
        Ok(criteria)
    }
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Condition {
            column: column.into(),
            op: Operator::Eq,
            value: value.into(),
        }
    }

    pub fn compare(column: impl Into<String>, op: Operator, value: impl Into<Value>) -> Self {
        Filter::Condition {
            column: column.into(),
            op,
            value: value.into(),
        }
    }
}

fn parse_conditions(conditions: &Map<String, Value>) -> Result<Option<Filter>> {
    let mut filters = Vec::new();
    for (key, value) in conditions {
        match key.as_str() {
            "or" => filters.push(Filter::Or(parse_filter_list(value, "or")?)),
            "and" => filters.push(Filter::And(parse_filter_list(value, "and")?)),
            "not" => match value {
                Value::Object(inner) => {
                    if let Some(inner) = parse_conditions(inner)? {
                        filters.push(Filter::Not(Box::new(inner)));
                    }
                }
                other => {
                    return Err(AdapterError::InvalidCriteria(format!(
                        "not expects an object, got {}",
                        other
                    )))
                }
            },
            column => filters.extend(parse_column(column, value)?),
        }
    }
    Ok(match filters.len() {
        0 => None,
        1 => filters.pop(),
        _ => Some(Filter::And(filters)),
    })
}

fn parse_filter_list(value: &Value, key: &str) -> Result<Vec<Filter>> {
    let Value::Array(items) = value else {
        return Err(AdapterError::InvalidCriteria(format!("{} expects an array", key)));
    };
    let mut filters = Vec::new();
    for item in items {
        let Value::Object(conditions) = item else {
            return Err(AdapterError::InvalidCriteria(format!(
                "{} entries must be objects",
                key
            )));
        };
        // an empty branch matches everything
        filters.push(parse_conditions(conditions)?.unwrap_or(Filter::And(Vec::new())));
    }
    Ok(filters)
}

fn parse_column(column: &str, value: &Value) -> Result<Vec<Filter>> {
    let condition = |op, value: &Value| Filter::Condition {
        column: column.to_string(),
        op,
        value: value.clone(),
    };
    match value {
        Value::Null => Ok(vec![condition(Operator::IsNull, &Value::Null)]),
        Value::Array(_) => Ok(vec![condition(Operator::In, value)]),
        Value::Object(modifiers) => {
            let mut filters = Vec::new();
            for (key, operand) in modifiers {
                let Some(op) = operator_for(key) else {
                    return Err(AdapterError::InvalidCriteria(format!(
                        "unsupported modifier '{}' in condition on '{}'",
                        key, column
                    )));
                };
                let op = match (op, operand) {
                    (Operator::NotEq, Value::Null) => Operator::IsNotNull,
                    (Operator::NotEq, Value::Array(_)) => Operator::NotIn,
                    (Operator::Eq, Value::Null) => Operator::IsNull,
                    (op, _) => op,
                };
                filters.push(condition(op, operand));
            }
            Ok(filters)
        }
        scalar => Ok(vec![condition(Operator::Eq, scalar)]),
    }
}

fn operator_for(key: &str) -> Option<Operator> {
    let op = match key {
        "<" | "lessThan" => Operator::Lt,
        "<=" | "lessThanOrEqual" => Operator::Lte,
        ">" | "greaterThan" => Operator::Gt,
        ">=" | "greaterThanOrEqual" => Operator::Gte,
        "!" | "!=" | "not" | "ne" => Operator::NotEq,
        "in" => Operator::In,
        "nin" => Operator::NotIn,
        "like" => Operator::Like,
        "contains" => Operator::Contains,
        "startsWith" => Operator::StartsWith,
        "endsWith" => Operator::EndsWith,
        "=" | "equals" => Operator::Eq,
        _ => return None,
    };
    Some(op)
}

fn parse_sort(value: &Value) -> Result<Vec<SortSpec>> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Object(fields) => fields
            .iter()
            .map(|(column, direction)| {
                Ok(SortSpec {
                    column: column.clone(),
                    direction: parse_direction(direction)?,
                })
            })
            .collect(),
        Value::Array(items) => {
            let mut sort = Vec::new();
            for item in items {
                sort.extend(parse_sort(item)?);
            }
            Ok(sort)
        }
        Value::String(text) => text
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| {
                let mut words = part.split_whitespace();
                let column = words.next().unwrap_or_default().to_string();
                let direction = match words.next() {
                    Some(word) => parse_direction(&Value::String(word.to_string()))?,
                    None => 1,
                };
                Ok(SortSpec { column, direction })
            })
            .collect(),
        other => Err(AdapterError::InvalidCriteria(format!("invalid sort: {}", other))),
    }
}

fn parse_direction(value: &Value) -> Result<i32> {
    match value {
        Value::Number(n) => Ok(n.as_i64().map_or(-1, |n| if n == 1 { 1 } else { -1 })),
        Value::String(s) if s.eq_ignore_ascii_case("asc") => Ok(1),
        Value::String(s) if s.eq_ignore_ascii_case("desc") => Ok(-1),
        other => Err(AdapterError::InvalidCriteria(format!(
            "invalid sort direction: {}",
            other
        ))),
    }
}

fn parse_count(value: Option<&Value>, key: &str) -> Result<Option<i64>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => match n.as_i64() {
            Some(n) if n >= 0 => Ok(Some(n)),
            _ => Err(AdapterError::InvalidCriteria(format!(
                "{} must be a non-negative integer",
                key
            ))),
        },
        Some(Value::String(s)) => match s.trim().parse::<i64>() {
            Ok(n) if n >= 0 => Ok(Some(n)),
            _ => Err(AdapterError::InvalidCriteria(format!(
                "{} must be a non-negative integer",
                key
            ))),
        },
        Some(other) => Err(AdapterError::InvalidCriteria(format!(
            "{} must be a non-negative integer, got {}",
            key, other
        ))),
    }
}

fn parse_columns(value: Option<&Value>, key: &str) -> Result<Vec<String>> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(column)) => Ok(vec![column.clone()]),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(column) => Ok(column.clone()),
                other => Err(AdapterError::InvalidCriteria(format!(
                    "{} entries must be column names, got {}",
                    key, other
                ))),
            })
            .collect(),
        Some(other) => Err(AdapterError::InvalidCriteria(format!(
            "{} must be a column name or list, got {}",
            key, other
        ))),
    }
}

fn parse_joins(value: &Value) -> Result<Vec<JoinSpec>> {
    let inputs: Vec<JoinInput> = serde_json::from_value(value.clone())
        .map_err(|e| AdapterError::InvalidCriteria(format!("invalid joins: {}", e)))?;
    inputs
        .into_iter()
        .map(|input| {
            let criteria = match &input.criteria {
                Some(value) => Criteria::from_json(value)?,
                None => Criteria::default(),
            };
            Ok(JoinSpec {
                alias: input.alias.unwrap_or_else(|| input.child.clone()),
                parent: input.parent,
                parent_key: input.parent_key,
                child: input.child,
                child_key: input.child_key,
                select: !matches!(input.select, SelectInput::Flag(false)),
                remove_parent_key: input.remove_parent_key,
                junction_table: input.junction_table,
                criteria,
            })
        })
        .collect()
}
