//! Density-based clustering over lat/lng points with great-circle distance.
//!
//! Neighborhoods are found by a linear scan, so a call is O(n²). That is fine for
//! the tens to low hundreds of points a clustering request carries.

use std::collections::VecDeque;

/// Mean earth radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Anything with a latitude and longitude in degrees.
pub trait Located {
    fn lat(&self) -> f64;
    fn lng(&self) -> f64;
}

impl Located for (f64, f64) {
    fn lat(&self) -> f64 {
        self.0
    }
    fn lng(&self) -> f64 {
        self.1
    }
}

/// Great-circle distance between two points, in meters.
pub fn haversine_m(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lng = (lng2 - lng1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    2.0 * a.sqrt().atan2((1.0 - a).sqrt()) * EARTH_RADIUS_M
}

/// One cluster: its id (`cluster-N`, numbered from 1) and member indices in input order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cluster {
    pub id: String,
    pub members: Vec<usize>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Label {
    Unvisited,
    Noise,
    Cluster(usize),
}

/// Cluster `points` with radius `eps_m` meters and density threshold `min_points`.
///
/// A point is a core point when at least `min_points` *other* points lie within
/// `eps_m` of it. Noise is not returned. Border assignment depends on input order,
/// as in classical DBSCAN. Degenerate parameters or an empty input yield no clusters.
pub fn dbscan<P: Located>(points: &[P], eps_m: f64, min_points: usize) -> Vec<Cluster> {
    if eps_m <= 0.0 || eps_m.is_nan() || min_points == 0 || points.is_empty() {
        return Vec::new();
    }

    let mut labels = vec![Label::Unvisited; points.len()];
    let mut next_id = 0;

    for i in 0..points.len() {
        if labels[i] != Label::Unvisited {
            continue;
        }
        let neighbors = region_query(points, i, eps_m);
        if neighbors.len() < min_points {
            labels[i] = Label::Noise;
            continue;
        }
        next_id += 1;
        labels[i] = Label::Cluster(next_id);
        expand(points, &mut labels, neighbors, next_id, eps_m, min_points);
    }

    let mut clusters: Vec<Cluster> = (1..=next_id)
        .map(|n| Cluster {
            id: format!("cluster-{n}"),
            members: Vec::new(),
        })
        .collect();
    for (idx, label) in labels.iter().enumerate() {
        if let Label::Cluster(n) = label {
            clusters[n - 1].members.push(idx);
        }
    }
    clusters
}

fn expand<P: Located>(
    points: &[P],
    labels: &mut [Label],
    seeds: Vec<usize>,
    id: usize,
    eps_m: f64,
    min_points: usize,
) {
    let mut queue: VecDeque<usize> = seeds.into();
    while let Some(n) = queue.pop_front() {
        match labels[n] {
            Label::Noise => {
                // Border point: joins, but does not grow the cluster.
                labels[n] = Label::Cluster(id);
            }
            Label::Unvisited => {
                labels[n] = Label::Cluster(id);
                let neighbors = region_query(points, n, eps_m);
                if neighbors.len() >= min_points {
                    queue.extend(neighbors);
                }
            }
            Label::Cluster(_) => {}
        }
    }
}

fn region_query<P: Located>(points: &[P], idx: usize, eps_m: f64) -> Vec<usize> {
    let target = &points[idx];
    points
        .iter()
        .enumerate()
        .filter(|&(i, p)| {
            i != idx && haversine_m(target.lat(), target.lng(), p.lat(), p.lng()) <= eps_m
        })
        .map(|(i, _)| i)
        .collect()
}
