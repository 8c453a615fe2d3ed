//! Conversion between caller records and PostgreSQL values.
//!
//! Outbound values are sent in text format, shaped by the parameter type the
//! server reports for the prepared statement. Inbound rows are decoded into
//! JSON and then cast against the table definition.

use std::collections::HashSet;
use std::error::Error as StdError;

use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, Utc};
use serde_json::{Map, Number, Value};
use tokio_postgres::types::{to_sql_checked, Format, FromSql, IsNull, Kind, ToSql, Type};
use tokio_postgres::Row;
use tracing::debug;

use crate::error::{AdapterError, Result};
use crate::schema::{ResolvedAttribute, TableDefinition};
use crate::spatial;
use crate::types::array_literal;

/// A row as seen by callers: column name to JSON value.
pub type Record = Map<String, Value>;

/// A sanitized value ready to be bound into a write statement.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Param(Value),
    /// GeoJSON geometry to be transformed into the column's SRID.
    Geometry { value: Value, srid: u32 },
}

/// A parameter encoded in PostgreSQL's text format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireValue {
    Null,
    Text(String),
}

impl ToSql for WireValue {
    fn to_sql(
        &self,
        _ty: &Type,
        out: &mut BytesMut,
    ) -> std::result::Result<IsNull, Box<dyn StdError + Sync + Send>> {
        match self {
            WireValue::Null => Ok(IsNull::Yes),
            WireValue::Text(text) => {
                out.extend_from_slice(text.as_bytes());
                Ok(IsNull::No)
            }
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    fn encode_format(&self, _ty: &Type) -> Format {
        Format::Text
    }

    to_sql_checked!();
}

/// Encode bound values against the parameter types of a prepared statement.
pub fn encode_params(values: &[Value], types: &[Type]) -> Result<Vec<WireValue>> {
    if values.len() != types.len() {
        return Err(AdapterError::InvalidCriteria(format!(
            "statement expects {} parameters, {} were supplied",
            types.len(),
            values.len()
        )));
    }
    Ok(values
        .iter()
        .zip(types)
        .map(|(value, ty)| encode_value(value, ty))
        .collect())
}

pub fn encode_value(value: &Value, ty: &Type) -> WireValue {
    let text = match value {
        Value::Null => return WireValue::Null,
        _ if *ty == Type::JSON || *ty == Type::JSONB => match value {
            Value::String(s) if is_serialized_document(s) => s.clone(),
            other => other.to_string(),
        },
        _ if matches!(ty.kind(), Kind::Array(_)) => match value {
            Value::Array(items) => array_literal(items),
            Value::String(s) if s.trim_start().starts_with('[') => {
                match serde_json::from_str::<Value>(s) {
                    Ok(Value::Array(items)) => array_literal(&items),
                    _ => s.clone(),
                }
            }
            Value::String(s) => s.clone(),
            other => array_literal(std::slice::from_ref(other)),
        },
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    WireValue::Text(text)
}

/// Text that already holds a JSON object or array. Scalar-looking text such
/// as `"42"` stays a JSON string.
fn is_serialized_document(text: &str) -> bool {
    matches!(
        serde_json::from_str::<Value>(text),
        Ok(Value::Object(_)) | Ok(Value::Array(_))
    )
}

/// Strip attributes the table does not declare, and auto-increment columns,
/// then validate and convert what remains.
pub fn sanitize(record: Record, table: &TableDefinition) -> Result<Vec<(String, SqlValue)>> {
    let kept: Vec<(&ResolvedAttribute, Value)> = record
        .into_iter()
        .filter_map(|(key, value)| match table.attribute(&key) {
            None => {
                debug!(table = %table.name, attribute = %key, "dropping unknown attribute");
                None
            }
            Some(attr) if attr.auto_increment => None,
            Some(attr) => Some((attr, value)),
        })
        .collect();

    kept.into_iter()
        .map(|(attr, value)| {
            let sql_value = if attr.is_spatial() {
                let srid = attr.native_srid();
                match spatial::geometry_param(&value, srid)? {
                    Some(geometry) => SqlValue::Geometry {
                        value: geometry,
                        srid,
                    },
                    None => SqlValue::Param(Value::Null),
                }
            } else {
                SqlValue::Param(value)
            };
            Ok((attr.name.clone(), sql_value))
        })
        .collect()
}

pub fn decode_rows(rows: &[Row]) -> Vec<Record> {
    rows.iter().map(decode_row).collect()
}

/// Later columns with the same name replace earlier ones, so a GeoJSON
/// projection aliased to its column name wins over the raw geometry.
pub fn decode_row(row: &Row) -> Record {
    let mut record = Record::new();
    for (idx, column) in row.columns().iter().enumerate() {
        record.insert(column.name().to_string(), decode_value(row, idx, column.type_()));
    }
    record
}

/// Apply table-specific casts to a decoded record.
///
/// Geometry columns arrive as GeoJSON text and are parsed (null on failure).
/// Elements of array columns that hold JSON text are parsed; elements that
/// are not JSON stay as they are.
pub fn cast_record(mut record: Record, table: &TableDefinition) -> Record {
    for attr in table.attributes.values() {
        let Some(value) = record.get_mut(&attr.name) else {
            continue;
        };
        if attr.is_spatial() {
            *value = spatial::parse_geojson(value.take());
        } else if attr.is_array() {
            if let Value::Array(items) = value {
                for item in items.iter_mut() {
                    if let Value::String(text) = item {
                        if let Ok(parsed) = serde_json::from_str::<Value>(text) {
                            *item = parsed;
                        }
                    }
                }
            }
        }
    }
    record
}

/// Aggregated child rows of a join: drop nulls, keep the first row per
/// primary key, cast each row.
pub fn collapse_children(value: Value, child: &TableDefinition) -> Value {
    let Value::Array(items) = value else {
        return Value::Array(Vec::new());
    };
    let pk = child.primary_key();
    let mut seen = HashSet::new();
    let children = items
        .into_iter()
        .filter_map(|item| match item {
            Value::Object(record) => Some(record),
            _ => None,
        })
        .filter(|record| match record.get(pk) {
            Some(Value::Null) | None => true,
            Some(key) => seen.insert(key.to_string()),
        })
        .map(|record| Value::Object(cast_record(record, child)))
        .collect();
    Value::Array(children)
}

fn get<'a, T: FromSql<'a>>(row: &'a Row, idx: usize) -> Option<T> {
    row.try_get::<_, Option<T>>(idx).ok().flatten()
}

fn decode_value(row: &Row, idx: usize, pg_type: &Type) -> Value {
    let value = match *pg_type {
        Type::BOOL => get::<bool>(row, idx).map(Value::Bool),
        Type::INT2 => get::<i16>(row, idx).map(Value::from),
        Type::INT4 => get::<i32>(row, idx).map(Value::from),
        Type::INT8 => get::<i64>(row, idx).map(Value::from),
        Type::OID => get::<u32>(row, idx).map(Value::from),
        Type::FLOAT4 => get::<f32>(row, idx).map(|f| float_value(f as f64)),
        Type::FLOAT8 => get::<f64>(row, idx).map(float_value),
        Type::NUMERIC => get::<PgNumeric>(row, idx).map(|n| Value::String(n.0)),
        Type::TEXT | Type::VARCHAR | Type::NAME | Type::CHAR | Type::BPCHAR | Type::UNKNOWN => {
            get::<String>(row, idx).map(Value::String)
        }
        Type::BYTEA => get::<Vec<u8>>(row, idx).map(|b| Value::String(bytea_text(&b))),
        Type::DATE => get::<NaiveDate>(row, idx).map(|d| Value::String(d.to_string())),
        Type::TIME => get::<NaiveTime>(row, idx).map(|t| Value::String(t.to_string())),
        Type::TIMESTAMP => get::<NaiveDateTime>(row, idx).map(|dt| Value::String(naive_text(&dt))),
        Type::TIMESTAMPTZ => get::<DateTime<Utc>>(row, idx)
            .map(|dt| Value::String(dt.to_rfc3339_opts(SecondsFormat::AutoSi, true))),
        Type::JSON | Type::JSONB => get::<Value>(row, idx),
        Type::UUID => get::<uuid::Uuid>(row, idx).map(|u| Value::String(u.to_string())),
        _ => match pg_type.kind() {
            Kind::Array(member) => Some(decode_array(row, idx, member)),
            _ => get::<RawValue>(row, idx).map(RawValue::into_value),
        },
    };
    value.unwrap_or(Value::Null)
}

fn decode_array(row: &Row, idx: usize, member: &Type) -> Value {
    match *member {
        Type::BOOL => array_of::<bool>(row, idx, Value::Bool),
        Type::INT2 => array_of::<i16>(row, idx, Value::from),
        Type::INT4 => array_of::<i32>(row, idx, Value::from),
        Type::INT8 => array_of::<i64>(row, idx, Value::from),
        Type::FLOAT4 => array_of::<f32>(row, idx, |f| float_value(f as f64)),
        Type::FLOAT8 => array_of::<f64>(row, idx, float_value),
        Type::NUMERIC => array_of::<PgNumeric>(row, idx, |n| Value::String(n.0)),
        Type::TEXT | Type::VARCHAR | Type::NAME | Type::CHAR | Type::BPCHAR => {
            array_of::<String>(row, idx, Value::String)
        }
        Type::JSON | Type::JSONB => array_of::<Value>(row, idx, |v| v),
        Type::UUID => array_of::<uuid::Uuid>(row, idx, |u| Value::String(u.to_string())),
        Type::DATE => array_of::<NaiveDate>(row, idx, |d| Value::String(d.to_string())),
        Type::TIMESTAMPTZ => array_of::<DateTime<Utc>>(row, idx, |dt| {
            Value::String(dt.to_rfc3339_opts(SecondsFormat::AutoSi, true))
        }),
        _ => array_of::<RawValue>(row, idx, RawValue::into_value),
    }
}

fn array_of<'a, T: FromSql<'a>>(row: &'a Row, idx: usize, convert: impl Fn(T) -> Value) -> Value {
    match row.try_get::<_, Option<Vec<Option<T>>>>(idx) {
        Ok(Some(items)) => Value::Array(
            items
                .into_iter()
                .map(|item| item.map(&convert).unwrap_or(Value::Null))
                .collect(),
        ),
        Ok(None) => Value::Null,
        Err(e) => {
            debug!(error = %e, "could not decode array column");
            Value::Null
        }
    }
}

fn float_value(f: f64) -> Value {
    Number::from_f64(f)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(f.to_string()))
}

fn bytea_text(bytes: &[u8]) -> String {
    format!("\\x{}", hex::encode(bytes))
}

fn naive_text(dt: &NaiveDateTime) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string()
}

/// Exact decimal text of a binary NUMERIC value.
struct PgNumeric(String);

impl<'a> FromSql<'a> for PgNumeric {
    fn from_sql(
        _ty: &Type,
        raw: &'a [u8],
    ) -> std::result::Result<Self, Box<dyn StdError + Sync + Send>> {
        numeric_to_string(raw).map(PgNumeric)
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

fn numeric_to_string(raw: &[u8]) -> std::result::Result<String, Box<dyn StdError + Sync + Send>> {
    if raw.len() < 8 {
        return Err("numeric value is truncated".into());
    }
    let ndigits = u16::from_be_bytes([raw[0], raw[1]]) as usize;
    let weight = i16::from_be_bytes([raw[2], raw[3]]) as i32;
    let sign = u16::from_be_bytes([raw[4], raw[5]]);
    let dscale = u16::from_be_bytes([raw[6], raw[7]]) as usize;
    if raw.len() < 8 + ndigits * 2 {
        return Err("numeric value is truncated".into());
    }

    match sign {
        NUMERIC_NAN => return Ok("NaN".into()),
        NUMERIC_PINF => return Ok("Infinity".into()),
        NUMERIC_NINF => return Ok("-Infinity".into()),
        _ => {}
    }

    let digits: Vec<i16> = raw[8..8 + ndigits * 2]
        .chunks_exact(2)
        .map(|pair| i16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    // base-10000 digit at a position relative to the decimal point
    let digit_at = |pos: i32| -> i16 {
        usize::try_from(pos)
            .ok()
            .and_then(|p| digits.get(p).copied())
            .unwrap_or(0)
    };

    let mut out = String::new();
    if sign == NUMERIC_NEG {
        out.push('-');
    }
    if weight < 0 {
        out.push('0');
    } else {
        for pos in 0..=weight {
            if pos == 0 {
                out.push_str(&digit_at(pos).to_string());
            } else {
                out.push_str(&format!("{:04}", digit_at(pos)));
            }
        }
    }
    if dscale > 0 {
        let mut fraction = String::with_capacity(dscale + 4);
        let mut pos = weight + 1;
        while fraction.len() < dscale {
            fraction.push_str(&format!("{:04}", digit_at(pos)));
            pos += 1;
        }
        fraction.truncate(dscale);
        out.push('.');
        out.push_str(&fraction);
    }
    Ok(out)
}

/// Bytes of a value whose type has no dedicated decoding.
struct RawValue(Vec<u8>);

impl RawValue {
    fn into_value(self) -> Value {
        match String::from_utf8(self.0) {
            Ok(text) => Value::String(text),
            Err(e) => Value::String(hex::encode_upper(e.into_bytes())),
        }
    }
}

impl<'a> FromSql<'a> for RawValue {
    fn from_sql(
        _ty: &Type,
        raw: &'a [u8],
    ) -> std::result::Result<Self, Box<dyn StdError + Sync + Send>> {
        Ok(RawValue(raw.to_vec()))
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}
