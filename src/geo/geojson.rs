use serde_json::{Value, json};

use super::rect::{Point, Rectangle, minimum_bounding_rectangle};
use crate::{Error, Result};

fn invalid(msg: impl Into<String>) -> Error {
    Error::InvalidGeometry(msg.into())
}

/// Flatten every coordinate of a GeoJSON document into one point list.
///
/// Accepts a FeatureCollection, a Feature or a bare geometry. Members of a
/// collection that are not `Feature` objects are skipped.
pub fn extract_points(doc: &Value) -> Result<Vec<Point>> {
    let points = parse_document(doc)?;
    if points.is_empty() {
        return Err(invalid("no coordinates provided"));
    }
    Ok(points)
}

/// Same as [`extract_points`], from raw JSON bytes.
pub fn extract_points_from_slice(bytes: &[u8]) -> Result<Vec<Point>> {
    let doc: Value =
        serde_json::from_slice(bytes).map_err(|e| invalid(format!("invalid JSON: {e}")))?;
    extract_points(&doc)
}

fn parse_document(doc: &Value) -> Result<Vec<Point>> {
    let kind = doc
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("geojson type is required"))?;

    match kind {
        "FeatureCollection" => {
            let features = doc
                .get("features")
                .and_then(Value::as_array)
                .ok_or_else(|| invalid("features must be an array"))?;
            let mut points = Vec::new();
            for feature in features {
                if feature.get("type").and_then(Value::as_str) == Some("Feature") {
                    points.extend(parse_feature(feature)?);
                }
            }
            Ok(points)
        }
        "Feature" => parse_feature(doc),
        _ => parse_geometry(doc),
    }
}

fn parse_feature(feature: &Value) -> Result<Vec<Point>> {
    match feature.get("geometry") {
        Some(geometry @ Value::Object(_)) => parse_geometry(geometry),
        _ => Err(invalid("feature.geometry is required")),
    }
}

fn parse_geometry(geometry: &Value) -> Result<Vec<Point>> {
    let kind = geometry
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("geometry type is required"))?;
    let coords = geometry.get("coordinates").unwrap_or(&Value::Null);

    // Nesting depth of coordinate arrays below `coordinates`.
    let depth = match kind {
        "Point" => return Ok(vec![coordinate(coords)?]),
        "MultiPoint" | "LineString" => 1,
        "MultiLineString" | "Polygon" => 2,
        "MultiPolygon" => 3,
        other => return Err(invalid(format!("unsupported geometry type: {other}"))),
    };
    let items = coords
        .as_array()
        .ok_or_else(|| invalid("coordinates must be an array"))?;

    let mut points = Vec::new();
    collect(items, depth, &mut points)?;
    Ok(points)
}

fn collect(items: &[Value], depth: usize, out: &mut Vec<Point>) -> Result<()> {
    for item in items {
        if depth == 1 {
            out.push(coordinate(item)?);
        } else if let Some(inner) = item.as_array() {
            collect(inner, depth - 1, out)?;
        }
    }
    Ok(())
}

fn coordinate(value: &Value) -> Result<Point> {
    match value.as_array().map(Vec::as_slice) {
        Some([x, y, ..]) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => Ok(Point::new(x, y)),
            _ => Err(invalid("coordinates must be numbers")),
        },
        _ => Err(invalid("coordinate must be [x, y]")),
    }
}

/// Render a rectangle as a GeoJSON Feature with a closed polygon and its `area`.
pub fn rectangle_feature(rect: &Rectangle) -> Value {
    let ring: Vec<[f64; 2]> = rect.ring().iter().map(|p| [p.x, p.y]).collect();
    json!({
        "type": "Feature",
        "geometry": {
            "type": "Polygon",
            "coordinates": [ring],
        },
        "properties": {
            "area": rect.area,
        },
    })
}

/// Minimum bounding rectangle of any GeoJSON document, as a Feature.
pub fn bounding_rectangle_feature(doc: &Value) -> Result<Value> {
    let points = extract_points(doc)?;
    let rect = minimum_bounding_rectangle(&points)?;
    Ok(rectangle_feature(&rect))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err_msg(doc: Value) -> String {
        match extract_points(&doc) {
            Err(Error::InvalidGeometry(msg)) => msg,
            other => panic!("expected InvalidGeometry, got {other:?}"),
        }
    }

    #[test]
    fn test_point_is_lon_lat() {
        let points = extract_points(&json!({"type": "Point", "coordinates": [-118.25, 34.05, 12.0]}))
            .unwrap();
        assert_eq!(points, vec![Point::new(-118.25, 34.05)]);
    }

    #[test]
    fn test_nested_geometries_are_flattened() {
        let polygon = json!({
            "type": "Polygon",
            "coordinates": [[[0, 0], [1, 0], [1, 1], [0, 0]], [[0.2, 0.2], [0.3, 0.2], [0.2, 0.2]]]
        });
        assert_eq!(extract_points(&polygon).unwrap().len(), 7);

        let multi = json!({
            "type": "MultiPolygon",
            "coordinates": [[[[0, 0], [1, 0], [0, 0]]], [[[5, 5], [6, 5], [5, 5]]]]
        });
        assert_eq!(extract_points(&multi).unwrap().len(), 6);

        let line = json!({"type": "LineString", "coordinates": [[0, 0], [2, 2]]});
        assert_eq!(extract_points(&line).unwrap().len(), 2);
    }

    #[test]
    fn test_feature_collection_skips_non_features() {
        let doc = json!({
            "type": "FeatureCollection",
            "features": [
                {"type": "Feature", "geometry": {"type": "Point", "coordinates": [1, 2]}},
                {"type": "Other", "geometry": {"type": "Point", "coordinates": [3, 4]}},
                {"type": "Feature", "geometry": {"type": "MultiPoint", "coordinates": [[5, 6], [7, 8]]}}
            ]
        });
        let points = extract_points(&doc).unwrap();
        assert_eq!(points.len(), 3);
        assert_eq!(points[2], Point::new(7.0, 8.0));
    }

    #[test]
    fn test_errors() {
        assert_eq!(err_msg(json!({"coordinates": [1, 2]})), "geojson type is required");
        assert_eq!(
            err_msg(json!({"type": "Circle", "coordinates": [1, 2]})),
            "unsupported geometry type: Circle"
        );
        assert_eq!(
            err_msg(json!({"type": "Point", "coordinates": [1]})),
            "coordinate must be [x, y]"
        );
        assert_eq!(
            err_msg(json!({"type": "Point", "coordinates": ["a", 1]})),
            "coordinates must be numbers"
        );
        assert_eq!(
            err_msg(json!({"type": "MultiPoint", "coordinates": []})),
            "no coordinates provided"
        );
        assert_eq!(
            err_msg(json!({"type": "Feature", "properties": {}})),
            "feature.geometry is required"
        );
        assert!(extract_points_from_slice(b"{nope").is_err());
    }

    #[test]
    fn test_bounding_rectangle_feature_shape() {
        let doc = json!({
            "type": "Feature",
            "geometry": {"type": "MultiPoint", "coordinates": [[0, 0], [4, 0], [4, 2], [0, 2], [2, 1]]}
        });
        let feature = bounding_rectangle_feature(&doc).unwrap();
        assert_eq!(feature["type"], "Feature");
        assert_eq!(feature["geometry"]["type"], "Polygon");

        let ring = feature["geometry"]["coordinates"][0].as_array().unwrap();
        assert_eq!(ring.len(), 5);
        assert_eq!(ring[0], ring[4]);

        let area = feature["properties"]["area"].as_f64().unwrap();
        assert!((area - 8.0).abs() < 1e-9);
    }
}
