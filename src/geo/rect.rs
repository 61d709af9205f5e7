use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A planar point. For GeoJSON input `x` is longitude and `y` latitude.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Point { x, y }
    }

    fn rotate(self, cos: f64, sin: f64) -> Point {
        Point {
            x: self.x * cos - self.y * sin,
            y: self.x * sin + self.y * cos,
        }
    }
}

/// A minimum-area rectangle: four ordered corners and their area.
#[derive(Debug, Clone, PartialEq)]
pub struct Rectangle {
    pub corners: [Point; 4],
    pub area: f64,
}

impl Rectangle {
    fn axis_aligned(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Rectangle {
            corners: [
                Point::new(min_x, min_y),
                Point::new(max_x, min_y),
                Point::new(max_x, max_y),
                Point::new(min_x, max_y),
            ],
            area: (max_x - min_x) * (max_y - min_y),
        }
    }

    /// Corners as a closed ring, first corner repeated last.
    pub fn ring(&self) -> [Point; 5] {
        let [a, b, c, d] = self.corners;
        [a, b, c, d, a]
    }

    /// True when `p` lies inside or on the boundary, within `eps`.
    pub fn contains(&self, p: Point, eps: f64) -> bool {
        let [a, b, _, d] = self.corners;
        let (ab, ad) = ((b.x - a.x, b.y - a.y), (d.x - a.x, d.y - a.y));
        let ap = (p.x - a.x, p.y - a.y);
        let dot = |u: (f64, f64), v: (f64, f64)| u.0 * v.0 + u.1 * v.1;
        let (len_ab, len_ad) = (dot(ab, ab), dot(ad, ad));
        let within = |proj: f64, len: f64| {
            if len == 0.0 {
                proj.abs() <= eps
            } else {
                proj >= -eps * len.sqrt() && proj <= len + eps * len.sqrt()
            }
        };
        within(dot(ap, ab), len_ab) && within(dot(ap, ad), len_ad)
    }
}

/// Smallest-area enclosing rectangle via convex hull and rotating calipers.
///
/// One point gives a zero-area rectangle on that point, two points their
/// axis-aligned box. Otherwise every hull edge is tried as a side; the first
/// rotation with minimal area wins.
pub fn minimum_bounding_rectangle(points: &[Point]) -> Result<Rectangle> {
    match points {
        [] => Err(Error::InvalidGeometry("no points provided".into())),
        [p] => Ok(Rectangle {
            corners: [*p; 4],
            area: 0.0,
        }),
        [p, q] => Ok(Rectangle::axis_aligned(
            p.x.min(q.x),
            p.y.min(q.y),
            p.x.max(q.x),
            p.y.max(q.y),
        )),
        _ => {
            let hull = convex_hull(points);
            if hull.len() < 3 {
                return minimum_bounding_rectangle(&hull);
            }
            Ok(rotating_calipers(&hull))
        }
    }
}

fn rotating_calipers(hull: &[Point]) -> Rectangle {
    let mut best: Option<Rectangle> = None;

    for (i, p1) in hull.iter().enumerate() {
        let p2 = hull[(i + 1) % hull.len()];
        let angle = (p2.y - p1.y).atan2(p2.x - p1.x);
        let (sin, cos) = (-angle).sin_cos();

        let (mut min_x, mut min_y) = (f64::INFINITY, f64::INFINITY);
        let (mut max_x, mut max_y) = (f64::NEG_INFINITY, f64::NEG_INFINITY);
        for p in hull {
            let r = p.rotate(cos, sin);
            min_x = min_x.min(r.x);
            max_x = max_x.max(r.x);
            min_y = min_y.min(r.y);
            max_y = max_y.max(r.y);
        }

        let area = (max_x - min_x) * (max_y - min_y);
        if best.as_ref().is_none_or(|b| area < b.area) {
            let (sin_back, cos_back) = angle.sin_cos();
            let mut rect = Rectangle::axis_aligned(min_x, min_y, max_x, max_y);
            for corner in &mut rect.corners {
                *corner = corner.rotate(cos_back, sin_back);
            }
            best = Some(rect);
        }
    }

    // A hull always has at least three edges here.
    best.unwrap_or(Rectangle {
        corners: [hull[0]; 4],
        area: 0.0,
    })
}

/// Monotonic chain convex hull, counter-clockwise, without collinear points.
pub fn convex_hull(points: &[Point]) -> Vec<Point> {
    if points.len() <= 1 {
        return points.to_vec();
    }
    let mut pts = points.to_vec();
    pts.sort_by(|a, b| a.x.total_cmp(&b.x).then(a.y.total_cmp(&b.y)));

    let mut lower: Vec<Point> = Vec::with_capacity(pts.len());
    for &p in &pts {
        while lower.len() >= 2 && cross(lower[lower.len() - 2], lower[lower.len() - 1], p) <= 0.0 {
            lower.pop();
        }
        lower.push(p);
    }

    let mut upper: Vec<Point> = Vec::with_capacity(pts.len());
    for &p in pts.iter().rev() {
        while upper.len() >= 2 && cross(upper[upper.len() - 2], upper[upper.len() - 1], p) <= 0.0 {
            upper.pop();
        }
        upper.push(p);
    }

    lower.pop();
    upper.pop();
    lower.extend(upper);
    lower
}

fn cross(o: Point, a: Point, b: Point) -> f64 {
    (a.x - o.x) * (b.y - o.y) - (a.y - o.y) * (b.x - o.x)
}
