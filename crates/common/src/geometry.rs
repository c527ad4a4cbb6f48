//! Polygon geometry for region-of-interest containment tests.
//!
//! A region of interest is a closed polygon in image coordinates. A detection
//! counts as inside the region when its bounding-box rectangle and the
//! polygon overlap with strictly positive area — edge-touching contact does
//! not count.

/// A point in image coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    #[must_use]
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// An axis-aligned rectangle described by two opposite corners.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub x_min: f64,
    pub y_min: f64,
    pub x_max: f64,
    pub y_max: f64,
}

impl Rect {
    /// Build a rectangle, normalising swapped corners.
    #[must_use]
    pub fn new(x_min: f64, y_min: f64, x_max: f64, y_max: f64) -> Self {
        Self {
            x_min: x_min.min(x_max),
            y_min: y_min.min(y_max),
            x_max: x_min.max(x_max),
            y_max: y_min.max(y_max),
        }
    }
}

/// Signed area of a polygon via the shoelace formula.
///
/// Positive for counter-clockwise winding, negative for clockwise.
#[must_use]
pub fn signed_area(polygon: &[Point]) -> f64 {
    if polygon.len() < 3 {
        return 0.0;
    }
    let mut sum = 0.0;
    for i in 0..polygon.len() {
        let a = polygon[i];
        let b = polygon[(i + 1) % polygon.len()];
        sum += a.x * b.y - b.x * a.y;
    }
    sum / 2.0
}

/// Absolute polygon area.
#[must_use]
pub fn area(polygon: &[Point]) -> f64 {
    signed_area(polygon).abs()
}

/// Area of the intersection between a polygon and an axis-aligned rectangle.
///
/// The polygon is clipped against the rectangle's four half-planes
/// (Sutherland–Hodgman; the clip region is convex so this is exact). The
/// polygon may be concave; coordinates outside the rectangle simply clip to
/// an empty or smaller region.
#[must_use]
pub fn rect_intersection_area(polygon: &[Point], rect: Rect) -> f64 {
    if polygon.len() < 3 {
        return 0.0;
    }

    // Each half-plane keeps points where keep(p) is true; intersect(a, b)
    // returns the crossing point on the boundary.
    let mut clipped: Vec<Point> = polygon.to_vec();
    let planes: [(fn(Point, f64) -> bool, fn(Point, Point, f64) -> Point, f64); 4] = [
        (|p, v| p.x >= v, intersect_vertical, rect.x_min),
        (|p, v| p.x <= v, intersect_vertical, rect.x_max),
        (|p, v| p.y >= v, intersect_horizontal, rect.y_min),
        (|p, v| p.y <= v, intersect_horizontal, rect.y_max),
    ];

    for (keep, intersect, value) in planes {
        if clipped.len() < 3 {
            return 0.0;
        }
        let mut next = Vec::with_capacity(clipped.len() + 4);
        for i in 0..clipped.len() {
            let current = clipped[i];
            let previous = clipped[(i + clipped.len() - 1) % clipped.len()];
            let current_in = keep(current, value);
            let previous_in = keep(previous, value);

            if current_in {
                if !previous_in {
                    next.push(intersect(previous, current, value));
                }
                next.push(current);
            } else if previous_in {
                next.push(intersect(previous, current, value));
            }
        }
        clipped = next;
    }

    area(&clipped)
}

/// Whether the rectangle overlaps the polygon with positive area.
#[must_use]
pub fn rect_overlaps(polygon: &[Point], rect: Rect) -> bool {
    rect_intersection_area(polygon, rect) > 0.0
}

fn intersect_vertical(a: Point, b: Point, x: f64) -> Point {
    let t = if (b.x - a.x).abs() < f64::EPSILON {
        0.0
    } else {
        (x - a.x) / (b.x - a.x)
    };
    Point::new(x, a.y + t * (b.y - a.y))
}

fn intersect_horizontal(a: Point, b: Point, y: f64) -> Point {
    let t = if (b.y - a.y).abs() < f64::EPSILON {
        0.0
    } else {
        (y - a.y) / (b.y - a.y)
    };
    Point::new(a.x + t * (b.x - a.x), y)
}
