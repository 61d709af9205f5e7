//! Clustering and bounding geometry for geo-tagged points.
//!
//! Both engines are pure and synchronous; handlers call them directly.

mod dbscan;
mod geojson;
mod rect;

pub use dbscan::{Cluster, EARTH_RADIUS_M, Located, dbscan, haversine_m};
pub use geojson::{
    bounding_rectangle_feature, extract_points, extract_points_from_slice, rectangle_feature,
};
pub use rect::{Point, Rectangle, convex_hull, minimum_bounding_rectangle};

use serde::{Deserialize, Serialize};

use crate::model::{AircraftCategory, Metadata};
use crate::{Error, Result};

/// Used when a request asks for a non-positive density threshold.
pub const DEFAULT_MIN_POINTS: i64 = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterPoint {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub icao: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub callsign: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<AircraftCategory>,
    #[serde(default)]
    pub on_ground: bool,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

impl ClusterPoint {
    pub fn new(id: impl Into<String>, latitude: f64, longitude: f64) -> Self {
        ClusterPoint {
            id: id.into(),
            icao: String::new(),
            callsign: String::new(),
            latitude,
            longitude,
            altitude: None,
            category: None,
            on_ground: false,
            metadata: Metadata::new(),
        }
    }
}

impl Located for ClusterPoint {
    fn lat(&self) -> f64 {
        self.latitude
    }
    fn lng(&self) -> f64 {
        self.longitude
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterRequest {
    pub points: Vec<ClusterPoint>,
    pub eps_meters: f64,
    #[serde(default)]
    pub min_points: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterResult {
    pub id: String,
    pub points: Vec<ClusterPoint>,
    pub centroid_lat: f64,
    pub centroid_lng: f64,
    pub media_present: bool,
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ClusterResponse {
    pub clusters: Vec<ClusterResult>,
}

/// Validate a clustering request and group its points.
pub fn cluster(request: &ClusterRequest) -> Result<ClusterResponse> {
    if !(request.eps_meters > 0.0) {
        return Err(Error::InvalidParameter(
            "eps_meters must be greater than zero".into(),
        ));
    }
    if request.points.is_empty() {
        return Ok(ClusterResponse::default());
    }
    if request.points.iter().any(|p| {
        !(-90.0..=90.0).contains(&p.latitude) || !(-180.0..=180.0).contains(&p.longitude)
    }) {
        return Err(Error::InvalidParameter(
            "invalid coordinates in points".into(),
        ));
    }
    let min_points = if request.min_points > 0 {
        request.min_points
    } else {
        DEFAULT_MIN_POINTS
    };

    let clusters = dbscan(&request.points, request.eps_meters, min_points as usize)
        .into_iter()
        .map(|c| summarize(&request.points, c))
        .collect::<Vec<_>>();

    tracing::debug!(
        clusters = clusters.len(),
        points = request.points.len(),
        "aircraft clustered"
    );
    Ok(ClusterResponse { clusters })
}

fn summarize(points: &[ClusterPoint], cluster: Cluster) -> ClusterResult {
    let members: Vec<ClusterPoint> = cluster.members.iter().map(|&i| points[i].clone()).collect();
    let n = members.len() as f64;
    let (sum_lat, sum_lng) = members
        .iter()
        .fold((0.0, 0.0), |(a, b), p| (a + p.latitude, b + p.longitude));
    ClusterResult {
        id: cluster.id,
        centroid_lat: sum_lat / n,
        centroid_lng: sum_lng / n,
        media_present: members
            .iter()
            .any(|p| p.category == Some(AircraftCategory::Media)),
        size: members.len(),
        points: members,
    }
}
