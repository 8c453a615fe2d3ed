//! PostGIS geometry columns: recognising them from `dbType`, and the
//! GeoJSON conversions applied on the way in and out.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{json, Value};

use crate::error::{AdapterError, Result};

/// A parsed `dbType` such as `geometry(Point, 4326)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpatialType {
    pub base: String,
    pub geometry: Option<String>,
    pub srid: Option<u32>,
}

fn spatial_type_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^(\w+)(?:\((\w+),\s*(\d+)\))?$").ok())
        .as_ref()
}

pub fn parse_spatial_type(db_type: &str) -> Option<SpatialType> {
    let captures = spatial_type_pattern()?.captures(db_type.trim())?;
    Some(SpatialType {
        base: captures[1].to_lowercase(),
        geometry: captures.get(2).map(|m| m.as_str().to_string()),
        srid: captures.get(3).and_then(|m| m.as_str().parse().ok()),
    })
}

/// Only `geometry` columns get GeoJSON treatment; `geography` is left alone.
pub fn is_spatial(db_type: Option<&str>) -> bool {
    db_type
        .and_then(parse_spatial_type)
        .is_some_and(|parsed| parsed.base == "geometry")
}

/// SRID declared by the column type, or 0 when none is given.
pub fn native_srid(db_type: Option<&str>) -> u32 {
    db_type
        .and_then(parse_spatial_type)
        .and_then(|parsed| parsed.srid)
        .unwrap_or(0)
}

/// Projection for reading a geometry column back as GeoJSON text, given
/// the already-quoted column reference and output name.
pub fn select_expression(column: &str, alias: &str) -> String {
    format!("ST_AsGeoJSON({}) AS {}", column, alias)
}

/// Expression that turns a GeoJSON parameter into a geometry in the
/// column's native SRID.
pub fn write_expression(placeholder: &str, native_srid: u32) -> String {
    if native_srid == 0 {
        format!("ST_GeomFromGeoJSON({})", placeholder)
    } else {
        format!(
            "ST_Transform(ST_GeomFromGeoJSON({}), {})",
            placeholder, native_srid
        )
    }
}

/// Normalise an incoming geometry value to a GeoJSON geometry carrying an
/// explicit `crs`. Returns `None` for null or empty input.
///
/// Features are unwrapped to their geometry. When no CRS is present the
/// column's native SRID is declared, unless the column has none.
pub fn geometry_param(value: &Value, native_srid: u32) -> Result<Option<Value>> {
    let parsed = match value {
        Value::Null => return Ok(None),
        Value::String(s) if s.trim().is_empty() => return Ok(None),
        Value::String(s) => serde_json::from_str::<Value>(s)
            .map_err(|e| AdapterError::InvalidGeometry(format!("not valid GeoJSON: {}", e)))?,
        Value::Object(_) => value.clone(),
        other => {
            return Err(AdapterError::InvalidGeometry(format!(
                "expected a GeoJSON object, got {}",
                other
            )))
        }
    };

    let mut geometry = match parsed {
        Value::Object(mut object) if object.get("type") == Some(&json!("Feature")) => {
            match object.remove("geometry") {
                Some(Value::Object(inner)) => inner,
                Some(Value::Null) | None => return Ok(None),
                Some(other) => {
                    return Err(AdapterError::InvalidGeometry(format!(
                        "feature geometry must be an object, got {}",
                        other
                    )))
                }
            }
        }
        Value::Object(object) => object,
        Value::Null => return Ok(None),
        other => {
            return Err(AdapterError::InvalidGeometry(format!(
                "expected a GeoJSON object, got {}",
                other
            )))
        }
    };
    if geometry.is_empty() {
        return Ok(None);
    }

    let declared = declared_srid(geometry.get("crs"), native_srid)?;
    if !geometry.contains_key("crs") && declared != 0 {
        geometry.insert(
            "crs".into(),
            json!({ "type": "name", "properties": { "name": format!("EPSG:{}", declared) } }),
        );
    }
    Ok(Some(Value::Object(geometry)))
}

/// SRID named by a GeoJSON `crs` member (`EPSG:<n>`), or the native one.
fn declared_srid(crs: Option<&Value>, native_srid: u32) -> Result<u32> {
    let Some(crs) = crs else {
        return Ok(native_srid);
    };
    let name = crs
        .pointer("/properties/name")
        .and_then(Value::as_str)
        .ok_or_else(|| AdapterError::InvalidGeometry("crs is missing properties.name".into()))?;
    let code = name
        .rsplit(':')
        .next()
        .filter(|_| name.to_uppercase().contains("EPSG"))
        .and_then(|code| code.parse::<u32>().ok())
        .ok_or_else(|| {
            AdapterError::InvalidGeometry(format!("crs name '{}' is not of the form EPSG:<srid>", name))
        })?;
    Ok(code)
}

/// Decode a GeoJSON text column. Anything unparseable becomes null.
pub fn parse_geojson(value: Value) -> Value {
    match value {
        Value::String(text) => serde_json::from_str(&text).unwrap_or(Value::Null),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_spatial_type() {
        let parsed = parse_spatial_type("geometry(Point, 4326)").unwrap();
        assert_eq!(parsed.base, "geometry");
        assert_eq!(parsed.geometry.as_deref(), Some("Point"));
        assert_eq!(parsed.srid, Some(4326));

        let bare = parse_spatial_type("geometry").unwrap();
        assert_eq!(bare.srid, None);

        assert!(parse_spatial_type("varchar(255)").is_none());
    }

    #[test]
    fn test_is_spatial() {
        assert!(is_spatial(Some("geometry(Point, 4326)")));
        assert!(is_spatial(Some("geometry(Linestring, 3857)")));
        assert!(is_spatial(Some("GEOMETRY")));
        assert!(!is_spatial(Some("geography(GEOMETRYCOLLECTION, 4326)")));
        assert!(!is_spatial(Some("text")));
        assert!(!is_spatial(None));
    }

    #[test]
    fn test_native_srid() {
        assert_eq!(native_srid(Some("geometry(Point, 4326)")), 4326);
        assert_eq!(native_srid(Some("geometry(Linestring, 3857)")), 3857);
        assert_eq!(native_srid(Some("geography(GEOMETRYCOLLECTION, 4326)")), 4326);
        assert_eq!(native_srid(Some("geometry")), 0);
        assert_eq!(native_srid(None), 0);
    }

    #[test]
    fn test_write_expression() {
        assert_eq!(
            write_expression("$1", 4326),
            "ST_Transform(ST_GeomFromGeoJSON($1), 4326)"
        );
        assert_eq!(write_expression("$2", 0), "ST_GeomFromGeoJSON($2)");
    }

    #[test]
    fn test_select_expression() {
        assert_eq!(
            select_expression("\"places\".\"location\"", "\"location\""),
            "ST_AsGeoJSON(\"places\".\"location\") AS \"location\""
        );
    }

    #[test]
    fn test_geometry_param_injects_native_crs() {
        let point = json!({ "type": "Point", "coordinates": [1.0, 2.0] });
        let param = geometry_param(&point, 4326).unwrap().unwrap();
        assert_eq!(param["crs"]["properties"]["name"], "EPSG:4326");
        assert_eq!(param["coordinates"], json!([1.0, 2.0]));
    }

    #[test]
    fn test_geometry_param_keeps_declared_crs() {
        let point = json!({
            "type": "Point",
            "coordinates": [1.0, 2.0],
            "crs": { "type": "name", "properties": { "name": "EPSG:3857" } }
        });
        let param = geometry_param(&point, 4326).unwrap().unwrap();
        assert_eq!(param["crs"]["properties"]["name"], "EPSG:3857");
    }

    #[test]
    fn test_geometry_param_rejects_bad_crs() {
        let point = json!({
            "type": "Point",
            "coordinates": [1.0, 2.0],
            "crs": { "type": "name", "properties": { "name": "urn:ogc:def:crs:OGC:1.3:CRS84" } }
        });
        let err = geometry_param(&point, 4326).unwrap_err();
        assert_eq!(err.code(), "E_INVALID_GEOMETRY");
    }

    #[test]
    fn test_geometry_param_unwraps_feature_and_text() {
        let feature = json!({
            "type": "Feature",
            "properties": {},
            "geometry": { "type": "Point", "coordinates": [0, 0] }
        });
        let param = geometry_param(&feature, 0).unwrap().unwrap();
        assert_eq!(param["type"], "Point");
        assert!(param.get("crs").is_none());

        let text = Value::String(r#"{"type":"Point","coordinates":[3,4]}"#.into());
        let param = geometry_param(&text, 4326).unwrap().unwrap();
        assert_eq!(param["coordinates"], json!([3, 4]));
    }

    #[test]
    fn test_geometry_param_empty_and_invalid() {
        assert!(geometry_param(&Value::Null, 4326).unwrap().is_none());
        assert!(geometry_param(&json!({}), 4326).unwrap().is_none());
        assert!(geometry_param(&json!(""), 4326).unwrap().is_none());
        assert!(geometry_param(&json!("not json"), 4326).is_err());
        assert!(geometry_param(&json!(5), 4326).is_err());
    }

    #[test]
    fn test_parse_geojson() {
        let parsed = parse_geojson(json!(r#"{"type":"Point","coordinates":[1,2]}"#));
        assert_eq!(parsed["type"], "Point");
        assert_eq!(parse_geojson(json!("garbage")), Value::Null);
        assert_eq!(parse_geojson(Value::Null), Value::Null);
    }
}
