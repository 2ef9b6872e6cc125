use serde::{Deserialize, Serialize};
use std::fmt;

const BASE32: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";

pub const MAX_PRECISION: usize = 12;

/// Encode a coordinate as a base-32 geohash of `precision` characters.
///
/// Bits alternate between longitude and latitude (longitude first), each bit
/// halving the remaining range. Precision is clamped to `1..=MAX_PRECISION`.
/// Callers validate coordinates beforehand; out-of-range input clamps to the
/// nearest edge cell instead of failing.
pub fn encode(latitude: f64, longitude: f64, precision: usize) -> String {
    let precision = precision.clamp(1, MAX_PRECISION);
    let mut lat_range = (-90.0_f64, 90.0_f64);
    let mut lon_range = (-180.0_f64, 180.0_f64);

    let mut hash = String::with_capacity(precision);
    let mut even_bit = true;
    let mut bit = 0u8;
    let mut ch = 0usize;

    while hash.len() < precision {
        let (range, value) = if even_bit {
            (&mut lon_range, longitude)
        } else {
            (&mut lat_range, latitude)
        };

        let mid = (range.0 + range.1) / 2.0;
        ch <<= 1;
        if value >= mid {
            ch |= 1;
            range.0 = mid;
        } else {
            range.1 = mid;
        }

        even_bit = !even_bit;
        bit += 1;
        if bit == 5 {
            hash.push(BASE32[ch] as char);
            bit = 0;
            ch = 0;
        }
    }

    hash
}

/// Identifier of the pending batch an update joins.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchKey(String);

impl BatchKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives batch keys from region and coordinates.
#[derive(Debug, Clone, Copy)]
pub struct KeyDeriver {
    geospatial: bool,
    precision: usize,
}

impl KeyDeriver {
    pub fn new(geospatial: bool, precision: usize) -> Self {
        Self {
            geospatial,
            precision: precision.clamp(1, MAX_PRECISION),
        }
    }

    pub fn region_only() -> Self {
        Self::new(false, 6)
    }

    pub fn derive(&self, region_id: &str, latitude: f64, longitude: f64) -> BatchKey {
        if self.geospatial {
            BatchKey(format!(
                "{}:{}",
                region_id,
                encode(latitude, longitude, self.precision)
            ))
        } else {
            BatchKey(region_id.to_string())
        }
    }
}

impl Default for KeyDeriver {
    fn default() -> Self {
        Self::new(true, 6)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_geohashes() {
        assert_eq!(encode(57.64911, 10.40744, 11), "u4pruydqqvj");
        assert_eq!(encode(42.6, -5.6, 5), "ezs42");
        assert_eq!(encode(0.0, 0.0, 1), "s");
    }

    #[test]
    fn test_prefix_property() {
        let long = encode(37.7749, -122.4194, 9);
        let short = encode(37.7749, -122.4194, 6);
        assert!(long.starts_with(&short));
    }

    #[test]
    fn test_extreme_coordinates_are_total() {
        assert_eq!(encode(90.0, 180.0, 6).len(), 6);
        assert_eq!(encode(-90.0, -180.0, 6), "000000");
        assert_eq!(encode(90.0, 180.0, 6), "zzzzzz");
    }

    #[test]
    fn test_precision_is_clamped() {
        assert_eq!(encode(10.0, 10.0, 0).len(), 1);
        assert_eq!(encode(10.0, 10.0, 40).len(), MAX_PRECISION);
    }

    #[test]
    fn test_key_derivation_modes() {
        let geo = KeyDeriver::default();
        assert_eq!(geo.derive("ams", 52.3676, 4.9041).as_str(), "ams:u173zt");

        let region = KeyDeriver::region_only();
        assert_eq!(region.derive("ams", 52.3676, 4.9041).as_str(), "ams");
    }

    #[test]
    fn test_nearby_points_share_a_cell() {
        let deriver = KeyDeriver::default();
        let a = deriver.derive("nyc", 40.75800, -73.98550);
        let b = deriver.derive("nyc", 40.75810, -73.98540);
        assert_eq!(a, b);
    }
}
