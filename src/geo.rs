//! Coordinates, distances and cell coverage

use serde::{Deserialize, Serialize};

/// Mean earth radius in meters (great-circle model)
const EARTH_RADIUS_M: f64 = 6_371_009.0;
const METERS_PER_MILE: f64 = 1_609.344;

/// Cell edge length used by [`GridCoverer`], in degrees of latitude
const GRID_CELL_DEGREES: f64 = 0.0025;

/// A point on the map without altitude
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn with_altitude(self, alt: f64) -> Location {
        Location {
            lat: self.lat,
            lon: self.lon,
            alt,
        }
    }
}

/// A reported position including altitude
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
}

impl Location {
    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.lat, self.lon)
    }
}

/// A coordinate rounded to a fixed number of decimal places.
///
/// Used as the key for every coordinate-indexed cache (cell grid,
/// altitudes, spawn candidates), so two points that round the same way
/// share an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GridKey {
    pub lat: i64,
    pub lon: i64,
    pub precision: u8,
}

impl GridKey {
    pub fn round(point: Coordinate, precision: u8) -> Self {
        let scale = 10f64.powi(precision as i32);
        Self {
            lat: (point.lat * scale).round() as i64,
            lon: (point.lon * scale).round() as i64,
            precision,
        }
    }

    pub fn coordinate(&self) -> Coordinate {
        let scale = 10f64.powi(self.precision as i32);
        Coordinate::new(self.lat as f64 / scale, self.lon as f64 / scale)
    }
}

/// Great-circle distance in meters
pub fn distance_m(a: Coordinate, b: Coordinate) -> f64 {
    let (lat1, lat2) = (a.lat.to_radians(), b.lat.to_radians());
    let dlat = lat2 - lat1;
    let dlon = (b.lon - a.lon).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

pub fn distance_miles(a: Coordinate, b: Coordinate) -> f64 {
    distance_m(a, b) / METERS_PER_MILE
}

/// Flat distance in degrees; cheap and only meaningful for short hops
pub fn degree_distance(a: Coordinate, b: Coordinate) -> f64 {
    ((a.lat - b.lat).powi(2) + (a.lon - b.lon).powi(2)).sqrt()
}

/// Produces the service cell identifiers that cover a circle.
pub trait CellCoverer: Send + Sync {
    fn cover(&self, center: Coordinate, radius_m: f64) -> Vec<u64>;
}

/// Fixed square grid in degree space.
///
/// Cell ids pack the row in the high 32 bits and the column in the low 32
/// bits. Rows and columns are offset so both stay positive.
#[derive(Debug, Clone)]
pub struct GridCoverer {
    cell_degrees: f64,
}

impl Default for GridCoverer {
    fn default() -> Self {
        Self {
            cell_degrees: GRID_CELL_DEGREES,
        }
    }
}

impl GridCoverer {
    pub fn new(cell_degrees: f64) -> Self {
        Self { cell_degrees }
    }

    fn cell_index(&self, value: f64, offset: f64) -> i64 {
        ((value + offset) / self.cell_degrees).floor() as i64
    }

    fn cell_id(row: i64, col: i64) -> u64 {
        ((row as u64) << 32) | (col as u64 & 0xffff_ffff)
    }
}

impl CellCoverer for GridCoverer {
    fn cover(&self, center: Coordinate, radius_m: f64) -> Vec<u64> {
        let lat_span = (radius_m / EARTH_RADIUS_M).to_degrees();
        let cos_lat = center.lat.to_radians().cos().abs().max(1e-6);
        let lon_span = lat_span / cos_lat;

        let row_min = self.cell_index(center.lat - lat_span, 90.0);
        let row_max = self.cell_index(center.lat + lat_span, 90.0);
        let col_min = self.cell_index(center.lon - lon_span, 180.0);
        let col_max = self.cell_index(center.lon + lon_span, 180.0);

        let mut ids = Vec::new();
        for row in row_min..=row_max {
            for col in col_min..=col_max {
                // Nearest point of this cell to the center
                let south = row as f64 * self.cell_degrees - 90.0;
                let west = col as f64 * self.cell_degrees - 180.0;
                let nearest = Coordinate::new(
                    center.lat.clamp(south, south + self.cell_degrees),
                    center.lon.clamp(west, west + self.cell_degrees),
                );
                if distance_m(center, nearest) <= radius_m {
                    ids.push(Self::cell_id(row, col));
                }
            }
        }
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_known_pair() {
        // One degree of latitude is roughly 111.2 km
        let a = Coordinate::new(40.0, -105.0);
        let b = Coordinate::new(41.0, -105.0);
        let d = distance_m(a, b);
        assert!((d - 111_195.0).abs() < 200.0, "got {}", d);
    }

    #[test]
    fn test_distance_zero() {
        let a = Coordinate::new(40.1, -105.2);
        assert_eq!(distance_m(a, a), 0.0);
    }

    #[test]
    fn test_grid_key_rounding() {
        let a = GridKey::round(Coordinate::new(40.12344, -105.98766), 4);
        let b = GridKey::round(Coordinate::new(40.12341, -105.98768), 4);
        assert_eq!(a, b);
        assert_eq!(a.lat, 401234);
        assert_eq!(a.lon, -1059877);

        let back = a.coordinate();
        assert!((back.lat - 40.1234).abs() < 1e-9);
    }

    #[test]
    fn test_cover_includes_center_cell() {
        let coverer = GridCoverer::default();
        let center = Coordinate::new(40.0011, -105.0013);
        let ids = coverer.cover(center, 500.0);
        assert!(!ids.is_empty());

        // A tiny radius only touches the cell holding the center
        let single = coverer.cover(center, 0.1);
        assert_eq!(single.len(), 1);
        assert!(ids.contains(&single[0]));
    }

    #[test]
    fn test_cover_is_deterministic() {
        let coverer = GridCoverer::default();
        let center = Coordinate::new(-33.86, 151.2);
        assert_eq!(coverer.cover(center, 500.0), coverer.cover(center, 500.0));
    }
}
