//! Geographic utility functions.
//!
//! Bounding-box parsing and containment (including boxes that cross the
//! dateline), longitude normalisation, and great-circle distance used for
//! station reconciliation.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{FederationError, Result};

/// Mean Earth radius in kilometres.
pub const EARTH_RADIUS_KM: f64 = 6371.0088;

/// A geographic location.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
    /// Elevation above sea level in metres, when the RI reports one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elevation: Option<f64>,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64, elevation: Option<f64>) -> Self {
        Self {
            latitude,
            longitude,
            elevation,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=360.0).contains(&self.longitude)
    }

    /// Great-circle distance to another point, in kilometres.
    pub fn distance_km(&self, other: &GeoPoint) -> f64 {
        haversine_km(self.latitude, self.longitude, other.latitude, other.longitude)
    }
}

/// Spatial filter. `min_lon > max_lon` denotes a box crossing the dateline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    pub fn new(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Result<Self> {
        let bbox = Self {
            min_lon,
            min_lat,
            max_lon,
            max_lat,
        };
        bbox.validate()?;
        Ok(bbox)
    }

    pub fn validate(&self) -> Result<()> {
        if [self.min_lon, self.min_lat, self.max_lon, self.max_lat]
            .iter()
            .any(|v| !v.is_finite())
        {
            return Err(bbox_error("Bounding box values must be finite"));
        }

        if self.min_lat > self.max_lat {
            return Err(bbox_error(format!(
                "min_lat ({}) must be <= max_lat ({})",
                self.min_lat, self.max_lat
            )));
        }

        if !(-90.0..=90.0).contains(&self.min_lat) || !(-90.0..=90.0).contains(&self.max_lat) {
            return Err(bbox_error("Latitude must be in the range -90 to 90"));
        }

        if !(-180.0..=360.0).contains(&self.min_lon) || !(-180.0..=360.0).contains(&self.max_lon)
        {
            return Err(bbox_error("Longitude must be in the range -180 to 360"));
        }

        Ok(())
    }

    /// Whether the box wraps around the dateline.
    pub fn crosses_dateline(&self) -> bool {
        normalize_longitude(self.min_lon) > normalize_longitude(self.max_lon)
    }

    pub fn contains(&self, point: &GeoPoint) -> bool {
        if point.latitude < self.min_lat || point.latitude > self.max_lat {
            return false;
        }

        // A box spanning the full circle would normalise to an empty range
        if self.max_lon - self.min_lon >= 360.0 {
            return true;
        }

        let lon = normalize_longitude(point.longitude);
        let min_lon = normalize_longitude(self.min_lon);
        let max_lon = normalize_longitude(self.max_lon);

        if min_lon <= max_lon {
            lon >= min_lon && lon <= max_lon
        } else {
            lon >= min_lon || lon <= max_lon
        }
    }
}

impl FromStr for BoundingBox {
    type Err = FederationError;

    fn from_str(s: &str) -> Result<Self> {
        let (min_lon, min_lat, max_lon, max_lat) = parse_bbox(s)?;
        BoundingBox::new(min_lon, min_lat, max_lon, max_lat)
    }
}

fn bbox_error(message: impl Into<String>) -> FederationError {
    FederationError::InvalidQuery {
        param: "bbox".to_string(),
        message: message.into(),
    }
}

/// Parse a bounding box string "min_lon,min_lat,max_lon,max_lat" into its components
pub fn parse_bbox(bbox: &str) -> Result<(f64, f64, f64, f64)> {
    let parts: Vec<&str> = bbox.split(',').map(str::trim).collect();
    if parts.len() != 4 {
        return Err(bbox_error(
            "Bounding box must be in format 'min_lon,min_lat,max_lon,max_lat'",
        ));
    }

    let names = ["min_lon", "min_lat", "max_lon", "max_lat"];
    let mut values = [0.0f64; 4];
    for (i, part) in parts.iter().enumerate() {
        values[i] = part
            .parse::<f64>()
            .map_err(|_| bbox_error(format!("Invalid {}: {}", names[i], part)))?;
    }

    Ok((values[0], values[1], values[2], values[3]))
}

/// Normalize a longitude value to the range [-180, 180)
pub fn normalize_longitude(lon: f64) -> f64 {
    let mut normalized = ((lon + 180.0) % 360.0 + 360.0) % 360.0 - 180.0;

    // Exactly 180.0 maps to -180.0
    if normalized == 180.0 {
        normalized = -180.0;
    }

    normalized
}

/// Great-circle distance between two lat/lon pairs in kilometres.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().min(1.0).asin();
    EARTH_RADIUS_KM * c
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bbox() {
        let result = parse_bbox("10.5,20.5,30.5,40.5");
        assert!(result.is_ok());
        let (min_lon, min_lat, max_lon, max_lat) = result.unwrap();
        assert_eq!(min_lon, 10.5);
        assert_eq!(min_lat, 20.5);
        assert_eq!(max_lon, 30.5);
        assert_eq!(max_lat, 40.5);

        assert!(parse_bbox("10.5,20.5,30.5").is_err());
        assert!(parse_bbox("10.5,20.5,not_a_number,40.5").is_err());
    }

    #[test]
    fn test_bbox_validation() {
        assert!("10.5,-91.0,30.5,40.5".parse::<BoundingBox>().is_err());
        assert!("10.5,20.5,30.5,91.0".parse::<BoundingBox>().is_err());
        assert!("10.5,40.5,30.5,20.5".parse::<BoundingBox>().is_err());
        assert!("-10, 40, 10, 50".parse::<BoundingBox>().is_ok());
    }

    #[test]
    fn test_normalize_longitude() {
        assert_eq!(normalize_longitude(0.0), 0.0);
        assert_eq!(normalize_longitude(180.0), -180.0);
        assert_eq!(normalize_longitude(-180.0), -180.0);
        assert_eq!(normalize_longitude(190.0), -170.0);
        assert_eq!(normalize_longitude(-190.0), 170.0);
        assert_eq!(normalize_longitude(370.0), 10.0);
        assert_eq!(normalize_longitude(-370.0), -10.0);
    }

    #[test]
    fn test_contains_regular_box() {
        let bbox = BoundingBox::new(-10.0, 40.0, 10.0, 50.0).unwrap();
        assert!(!bbox.crosses_dateline());
        assert!(bbox.contains(&GeoPoint::new(45.0, 2.0, None)));
        assert!(bbox.contains(&GeoPoint::new(40.0, -10.0, None)));
        assert!(!bbox.contains(&GeoPoint::new(39.9, 2.0, None)));
        assert!(!bbox.contains(&GeoPoint::new(45.0, 11.0, None)));
    }

    #[test]
    fn test_contains_dateline_crossing_box() {
        let bbox = BoundingBox::new(170.0, -20.0, -170.0, 20.0).unwrap();
        assert!(bbox.crosses_dateline());
        assert!(bbox.contains(&GeoPoint::new(0.0, 175.0, None)));
        assert!(bbox.contains(&GeoPoint::new(0.0, -175.0, None)));
        assert!(bbox.contains(&GeoPoint::new(0.0, 185.0, None)));
        assert!(!bbox.contains(&GeoPoint::new(0.0, 0.0, None)));
    }

    #[test]
    fn test_contains_full_circle() {
        let bbox = BoundingBox::new(-180.0, -90.0, 180.0, 90.0).unwrap();
        assert!(bbox.contains(&GeoPoint::new(0.0, 179.9, None)));
        assert!(bbox.contains(&GeoPoint::new(0.0, -180.0, None)));
    }

    #[test]
    fn test_haversine() {
        assert_eq!(haversine_km(45.0, 3.0, 45.0, 3.0), 0.0);

        // Paris to London, roughly 344 km
        let d = haversine_km(48.8566, 2.3522, 51.5074, -0.1278);
        assert!((d - 343.5).abs() < 2.0, "distance was {}", d);

        // One degree of latitude is about 111 km
        let d = GeoPoint::new(0.0, 0.0, None).distance_km(&GeoPoint::new(1.0, 0.0, None));
        assert!((d - 111.2).abs() < 0.5, "distance was {}", d);
    }
}
