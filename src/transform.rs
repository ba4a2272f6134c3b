//! Datum conversion from the provider's BD-09 coordinates to WGS-84.
//!
//! The provider reports points in BD-09, an obfuscated datum layered on top of
//! the national GCJ-02 datum, which is itself an offset of WGS-84. Conversion
//! runs in two fixed stages: BD-09 to GCJ-02, then GCJ-02 to WGS-84. The
//! second stage is a regional approximation; points far outside mainland
//! China come back degraded rather than rejected.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

const X_PI: f64 = PI * 3000.0 / 180.0;
const BD_LNG_OFFSET: f64 = 0.0065;
const BD_LAT_OFFSET: f64 = 0.006;

/// Krasovsky 1940 semi-major axis.
const SEMI_MAJOR_AXIS: f64 = 6378245.0;
const ECCENTRICITY_SQUARED: f64 = 0.00669342162296594323;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lng: f64,
    pub lat: f64,
}

impl Coordinate {
    pub fn new(lng: f64, lat: f64) -> Self {
        Self { lng, lat }
    }
}

/// Full BD-09 to WGS-84 conversion.
pub fn convert(bd09: Coordinate) -> Coordinate {
    gcj02_to_wgs84(bd09_to_gcj02(bd09))
}

pub fn bd09_to_gcj02(point: Coordinate) -> Coordinate {
    let x = point.lng - BD_LNG_OFFSET;
    let y = point.lat - BD_LAT_OFFSET;
    let z = (x * x + y * y).sqrt() - 0.00002 * (y * X_PI).sin();
    let theta = y.atan2(x) - 0.000003 * (x * X_PI).cos();
    Coordinate {
        lng: z * theta.cos(),
        lat: z * theta.sin(),
    }
}

pub fn gcj02_to_wgs84(point: Coordinate) -> Coordinate {
    let (d_lat, d_lng) = delta(point.lat, point.lng);
    Coordinate {
        lng: point.lng - d_lng,
        lat: point.lat - d_lat,
    }
}

fn delta(lat: f64, lng: f64) -> (f64, f64) {
    let raw_lat = transform_lat(lng - 105.0, lat - 35.0);
    let raw_lng = transform_lng(lng - 105.0, lat - 35.0);

    let rad_lat = lat / 180.0 * PI;
    let magic = 1.0 - ECCENTRICITY_SQUARED * rad_lat.sin() * rad_lat.sin();
    let sqrt_magic = magic.sqrt();

    let d_lat = (raw_lat * 180.0)
        / ((SEMI_MAJOR_AXIS * (1.0 - ECCENTRICITY_SQUARED)) / (magic * sqrt_magic) * PI);
    let d_lng = (raw_lng * 180.0) / (SEMI_MAJOR_AXIS / sqrt_magic * rad_lat.cos() * PI);
    (d_lat, d_lng)
}

fn transform_lat(x: f64, y: f64) -> f64 {
    let mut ret = -100.0 + 2.0 * x + 3.0 * y + 0.2 * y * y + 0.1 * x * y + 0.2 * x.abs().sqrt();
    ret += (20.0 * (6.0 * x * PI).sin() + 20.0 * (2.0 * x * PI).sin()) * 2.0 / 3.0;
    ret += (20.0 * (y * PI).sin() + 40.0 * (y / 3.0 * PI).sin()) * 2.0 / 3.0;
    ret += (160.0 * (y / 12.0 * PI).sin() + 320.0 * (y * PI / 30.0).sin()) * 2.0 / 3.0;
    ret
}

fn transform_lng(x: f64, y: f64) -> f64 {
    let mut ret = 300.0 + x + 2.0 * y + 0.1 * x * x + 0.1 * x * y + 0.1 * x.abs().sqrt();
    ret += (20.0 * (6.0 * x * PI).sin() + 20.0 * (2.0 * x * PI).sin()) * 2.0 / 3.0;
    ret += (20.0 * (x * PI).sin() + 40.0 * (x / 3.0 * PI).sin()) * 2.0 / 3.0;
    ret += (150.0 * (x / 12.0 * PI).sin() + 300.0 * (x / 30.0 * PI).sin()) * 2.0 / 3.0;
    ret
}
