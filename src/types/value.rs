//! Canonical scalar value representation shared by the write path, the
//! planner, and index providers.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Typed property value tagged with explicit type information so persisted
/// payloads remain unambiguous.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum Value {
    /// Boolean literal.
    Bool(bool),
    /// Signed 64-bit integer literal.
    Int(i64),
    /// 64-bit floating point literal.
    Float(f64),
    /// UTF-8 string literal.
    String(String),
    /// Nanoseconds since Unix epoch in UTC.
    Timestamp(i64),
    /// Geographic shape.
    Geo(GeoShape),
}

/// Declared data type of a property key.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub enum PropType {
    /// Booleans.
    Bool,
    /// Signed 64-bit integers.
    Int,
    /// 64-bit floats.
    Float,
    /// UTF-8 strings.
    String,
    /// Nanosecond-precision instants.
    Timestamp,
    /// Geographic shapes.
    Geo,
}

impl fmt::Display for PropType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PropType::Bool => "bool",
            PropType::Int => "int",
            PropType::Float => "float",
            PropType::String => "string",
            PropType::Timestamp => "timestamp",
            PropType::Geo => "geo",
        };
        f.write_str(name)
    }
}

impl Value {
    /// Declared type this value belongs to.
    pub fn prop_type(&self) -> PropType {
        match self {
            Value::Bool(_) => PropType::Bool,
            Value::Int(_) => PropType::Int,
            Value::Float(_) => PropType::Float,
            Value::String(_) => PropType::String,
            Value::Timestamp(_) => PropType::Timestamp,
            Value::Geo(_) => PropType::Geo,
        }
    }

    /// Rank used to order values of different types relative to each other.
    fn type_rank(&self) -> u8 {
        match self {
            Value::Bool(_) => 0,
            Value::Int(_) => 1,
            Value::Float(_) => 2,
            Value::String(_) => 3,
            Value::Timestamp(_) => 4,
            Value::Geo(_) => 5,
        }
    }

    /// Whether this value supports range comparison (`<`, `<=`, `>`, `>=`).
    pub fn is_orderable(&self) -> bool {
        !matches!(self, Value::Geo(_))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    /// Total order: values of the same type compare naturally (floats via
    /// `total_cmp`, so negative zero sorts before zero); values of different
    /// types order by type rank.
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (Value::Geo(a), Value::Geo(b)) => a.canonical_bytes().cmp(&b.canonical_bytes()),
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Timestamp(ns) => write!(f, "@{ns}ns"),
            Value::Geo(g) => write!(f, "{g}"),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value as i64)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<GeoShape> for Value {
    fn from(value: GeoShape) -> Self {
        Value::Geo(value)
    }
}

/// Geographic shape in WGS84 degrees.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape")]
pub enum GeoShape {
    /// Single point.
    Point {
        /// Latitude in degrees, south negative.
        lat: f64,
        /// Longitude in degrees, west negative.
        lon: f64,
    },
    /// Axis-aligned bounding box.
    Box {
        /// Southern edge.
        south: f64,
        /// Western edge.
        west: f64,
        /// Northern edge.
        north: f64,
        /// Eastern edge.
        east: f64,
    },
    /// Circle around a center point.
    Circle {
        /// Center latitude in degrees.
        lat: f64,
        /// Center longitude in degrees.
        lon: f64,
        /// Radius in meters.
        radius_m: f64,
    },
}

const EARTH_RADIUS_M: f64 = 6_371_000.0;

fn haversine_m(lat_a: f64, lon_a: f64, lat_b: f64, lon_b: f64) -> f64 {
    let (la, lb) = (lat_a.to_radians(), lat_b.to_radians());
    let dlat = (lat_b - lat_a).to_radians();
    let dlon = (lon_b - lon_a).to_radians();
    let h = (dlat / 2.0).sin().powi(2) + la.cos() * lb.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

impl GeoShape {
    /// Point constructor.
    pub fn point(lat: f64, lon: f64) -> Self {
        GeoShape::Point { lat, lon }
    }

    /// Bounding-box constructor from south-west and north-east corners.
    pub fn bbox(south: f64, west: f64, north: f64, east: f64) -> Self {
        GeoShape::Box {
            south,
            west,
            north,
            east,
        }
    }

    /// Circle constructor with radius in meters.
    pub fn circle(lat: f64, lon: f64, radius_m: f64) -> Self {
        GeoShape::Circle { lat, lon, radius_m }
    }

    fn contains_point(&self, plat: f64, plon: f64) -> bool {
        match *self {
            GeoShape::Point { lat, lon } => lat == plat && lon == plon,
            GeoShape::Box {
                south,
                west,
                north,
                east,
            } => plat >= south && plat <= north && plon >= west && plon <= east,
            GeoShape::Circle { lat, lon, radius_m } => {
                haversine_m(lat, lon, plat, plon) <= radius_m
            }
        }
    }

    fn corners(south: f64, west: f64, north: f64, east: f64) -> [(f64, f64); 4] {
        [
            (south, west),
            (south, east),
            (north, west),
            (north, east),
        ]
    }

    /// Whether `self` lies entirely inside `other`.
    pub fn within(&self, other: &GeoShape) -> bool {
        match *self {
            GeoShape::Point { lat, lon } => other.contains_point(lat, lon),
            GeoShape::Box {
                south,
                west,
                north,
                east,
            } => Self::corners(south, west, north, east)
                .iter()
                .all(|&(lat, lon)| other.contains_point(lat, lon)),
            GeoShape::Circle { lat, lon, radius_m } => match *other {
                GeoShape::Point { .. } => radius_m == 0.0 && other.contains_point(lat, lon),
                GeoShape::Circle {
                    lat: olat,
                    lon: olon,
                    radius_m: oradius,
                } => haversine_m(lat, lon, olat, olon) + radius_m <= oradius,
                // Conservative: the circle's bounding corners must fall inside.
                GeoShape::Box { .. } => {
                    let dlat = (radius_m / EARTH_RADIUS_M).to_degrees();
                    let dlon = dlat / lat.to_radians().cos().abs().max(1e-9);
                    Self::corners(lat - dlat, lon - dlon, lat + dlat, lon + dlon)
                        .iter()
                        .all(|&(clat, clon)| other.contains_point(clat, clon))
                }
            },
        }
    }

    /// Whether `self` fully contains `other`.
    pub fn contains(&self, other: &GeoShape) -> bool {
        other.within(self)
    }

    /// Whether the two shapes share at least one point.
    pub fn intersects(&self, other: &GeoShape) -> bool {
        match (*self, *other) {
            (GeoShape::Point { lat, lon }, _) => other.contains_point(lat, lon),
            (_, GeoShape::Point { lat, lon }) => self.contains_point(lat, lon),
            (
                GeoShape::Box {
                    south: s1,
                    west: w1,
                    north: n1,
                    east: e1,
                },
                GeoShape::Box {
                    south: s2,
                    west: w2,
                    north: n2,
                    east: e2,
                },
            ) => s1 <= n2 && s2 <= n1 && w1 <= e2 && w2 <= e1,
            (
                GeoShape::Circle { lat, lon, radius_m },
                GeoShape::Circle {
                    lat: olat,
                    lon: olon,
                    radius_m: oradius,
                },
            ) => haversine_m(lat, lon, olat, olon) <= radius_m + oradius,
            (GeoShape::Circle { lat, lon, radius_m }, GeoShape::Box { .. })
            | (GeoShape::Box { .. }, GeoShape::Circle { lat, lon, radius_m }) => {
                let bx = if matches!(self, GeoShape::Box { .. }) {
                    self
                } else {
                    other
                };
                let (clat, clon) = bx.clamp_to(lat, lon);
                haversine_m(lat, lon, clat, clon) <= radius_m
            }
        }
    }

    /// Whether the two shapes share no point.
    pub fn disjoint(&self, other: &GeoShape) -> bool {
        !self.intersects(other)
    }

    fn clamp_to(&self, lat: f64, lon: f64) -> (f64, f64) {
        match *self {
            GeoShape::Box {
                south,
                west,
                north,
                east,
            } => (lat.clamp(south, north), lon.clamp(west, east)),
            GeoShape::Point { lat, lon } => (lat, lon),
            GeoShape::Circle { lat, lon, .. } => (lat, lon),
        }
    }

    /// Canonical byte image, used only to give geo values a stable order.
    pub(crate) fn canonical_bytes(&self) -> [u8; 33] {
        let mut out = [0u8; 33];
        match *self {
            GeoShape::Point { lat, lon } => {
                out[0] = 1;
                out[1..9].copy_from_slice(&lat.to_bits().to_be_bytes());
                out[9..17].copy_from_slice(&lon.to_bits().to_be_bytes());
            }
            GeoShape::Box {
                south,
                west,
                north,
                east,
            } => {
                out[0] = 2;
                out[1..9].copy_from_slice(&south.to_bits().to_be_bytes());
                out[9..17].copy_from_slice(&west.to_bits().to_be_bytes());
                out[17..25].copy_from_slice(&north.to_bits().to_be_bytes());
                out[25..33].copy_from_slice(&east.to_bits().to_be_bytes());
            }
            GeoShape::Circle { lat, lon, radius_m } => {
                out[0] = 3;
                out[1..9].copy_from_slice(&lat.to_bits().to_be_bytes());
                out[9..17].copy_from_slice(&lon.to_bits().to_be_bytes());
                out[17..25].copy_from_slice(&radius_m.to_bits().to_be_bytes());
            }
        }
        out
    }
}

impl fmt::Display for GeoShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            GeoShape::Point { lat, lon } => write!(f, "point({lat}, {lon})"),
            GeoShape::Box {
                south,
                west,
                north,
                east,
            } => write!(f, "box({south}, {west}, {north}, {east})"),
            GeoShape::Circle { lat, lon, radius_m } => {
                write!(f, "circle({lat}, {lon}, {radius_m}m)")
            }
        }
    }
}
