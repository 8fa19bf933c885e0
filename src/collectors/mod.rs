//! Weather data collectors.
//!
//! One collector per external source, all behind the same two-method
//! contract. Forecast-only sources answer observation requests with an
//! empty vector and vice versa. Point-level problems (a bad time step, an
//! out-of-range value, an unparseable field) are logged and dropped inside
//! the collector; only call-level failures (retry exhaustion, open
//! circuit) surface as errors, and the scheduler jobs turn those into an
//! empty result plus an execution-log message.

pub mod arome;
pub mod ffvl;
pub mod http;
pub mod meteo_parapente;
pub mod romma;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::errors::CollectError;
use crate::helpers::{f64_to_decimal_0dp, f64_to_decimal_1dp};

/// Database ids of the known parameters, resolved once per job run.
#[derive(Debug, Clone, Copy)]
pub struct ParameterIds {
    pub wind_speed: i32,
    pub wind_direction: i32,
    pub temperature: i32,
}

/// Everything a collector needs to fetch forecasts for one site.
#[derive(Debug, Clone)]
pub struct ForecastRequest {
    pub site_id: i32,
    pub model_id: i32,
    pub forecast_run: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub parameter_ids: ParameterIds,
}

/// Everything a collector needs to fetch observations for one site.
#[derive(Debug, Clone)]
pub struct ObservationRequest {
    pub site_id: i32,
    pub observation_time: DateTime<Utc>,
    pub beacon_id: Option<i32>,
    pub parameter_ids: ParameterIds,
}

/// A single forecast value produced by a collector.
#[derive(Debug, Clone, PartialEq)]
pub struct ForecastPoint {
    pub site_id: i32,
    pub model_id: i32,
    pub parameter_id: i32,
    pub forecast_run: DateTime<Utc>,
    pub valid_time: DateTime<Utc>,
    pub value: Decimal,
}

/// A single observed value produced by a collector.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservationPoint {
    pub site_id: i32,
    pub parameter_id: i32,
    pub observation_time: DateTime<Utc>,
    pub value: Decimal,
}

/// Uniform contract over all data sources.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Collector identifier for logs and error messages.
    fn name(&self) -> &'static str;

    /// Human-readable description of the data source.
    fn source(&self) -> &'static str;

    async fn collect_forecast(
        &self,
        request: &ForecastRequest,
    ) -> Result<Vec<ForecastPoint>, CollectError>;

    async fn collect_observation(
        &self,
        request: &ObservationRequest,
    ) -> Result<Vec<ObservationPoint>, CollectError>;
}

// ---------------------------------------------------------------------------
// Shared value conversion & validation
// ---------------------------------------------------------------------------

/// The parameter kinds collectors know how to validate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterKind {
    WindSpeed,
    WindDirection,
    Temperature,
}

impl ParameterKind {
    /// Physically reasonable (min, max) bounds, inclusive.
    ///
    /// wind_speed 0–200 km/h, wind_direction 0–360°, temperature −50–50 °C.
    pub fn validation_range(self) -> (Decimal, Decimal) {
        match self {
            ParameterKind::WindSpeed => (Decimal::ZERO, Decimal::from(200)),
            ParameterKind::WindDirection => (Decimal::ZERO, Decimal::from(360)),
            ParameterKind::Temperature => (Decimal::from(-50), Decimal::from(50)),
        }
    }

}

/// Check a value against the parameter's validation range. Out-of-range
/// (aberrant) values are dropped by callers, with a warning.
pub(crate) fn within_range(kind: ParameterKind, value: Decimal) -> bool {
    let (min, max) = kind.validation_range();
    min <= value && value <= max
}

/// Wind speed from U/V components (m/s), in km/h.
pub(crate) fn wind_speed_kmh_f64(u: f64, v: f64) -> f64 {
    (u * u + v * v).sqrt() * 3.6
}

/// Meteorological wind direction from U/V components, in degrees [0, 360).
///
/// Direction is where the wind comes FROM: atan2(−u, −v).
pub(crate) fn wind_direction_deg_f64(u: f64, v: f64) -> f64 {
    if u == 0.0 && v == 0.0 {
        return 0.0;
    }
    let mut deg = (-u).atan2(-v).to_degrees();
    if deg < 0.0 {
        deg += 360.0;
    }
    deg
}

/// Wind speed in km/h, rounded to 0.1.
pub(crate) fn wind_speed_kmh(u: f64, v: f64) -> Decimal {
    f64_to_decimal_1dp(wind_speed_kmh_f64(u, v))
}

/// Meteorological wind direction in degrees, rounded to 1.
pub(crate) fn wind_direction_deg(u: f64, v: f64) -> Decimal {
    let deg = f64_to_decimal_0dp(wind_direction_deg_f64(u, v));
    // 359.5° rounds up to 360, which is outside [0, 360)
    if deg == Decimal::from(360) {
        Decimal::ZERO
    } else {
        deg
    }
}

/// Temperature in °C from Kelvin, rounded to 0.1.
pub(crate) fn kelvin_to_celsius(kelvin: f64) -> Decimal {
    f64_to_decimal_1dp(kelvin - 273.15)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_wind_speed_from_components() {
        // u=3, v=4 → 5 m/s → 18 km/h
        assert_eq!(wind_speed_kmh(3.0, 4.0), Decimal::from_str("18.0").unwrap());
    }

    #[test]
    fn test_wind_direction_north() {
        // Wind from the north blows southward: v negative
        assert_eq!(wind_direction_deg(0.0, -5.0), Decimal::ZERO);
    }

    #[test]
    fn test_wind_direction_west_is_270() {
        // Wind from the west blows eastward: u positive
        assert_eq!(wind_direction_deg(5.0, 0.0), Decimal::from(270));
    }

    #[test]
    fn test_wind_direction_calm_is_zero() {
        assert_eq!(wind_direction_deg(0.0, 0.0), Decimal::ZERO);
    }

    #[test]
    fn test_wind_direction_never_reaches_360() {
        // Just west of north rounds to 360 → must normalise back to 0
        let d = wind_direction_deg(0.004, -5.0);
        assert!(
            d >= Decimal::ZERO && d < Decimal::from(360),
            "direction {d} out of [0, 360)"
        );
    }

    #[test]
    fn test_uv_speed_direction_round_trip() {
        // u/v → speed/direction → u/v must agree within 1e-3 (raw math,
        // before storage quantisation).
        let cases = [
            (3.0, 4.0),
            (-2.5, 1.7),
            (0.1, -9.3),
            (-7.0, -7.0),
            (5.0, 0.0),
        ];
        for (u, v) in cases {
            let speed_ms = wind_speed_kmh_f64(u, v) / 3.6;
            let dir_rad = wind_direction_deg_f64(u, v).to_radians();
            let u2 = -speed_ms * dir_rad.sin();
            let v2 = -speed_ms * dir_rad.cos();
            assert!(
                (u - u2).abs() < 1e-3 && (v - v2).abs() < 1e-3,
                "round trip failed for ({u}, {v}): got ({u2}, {v2})"
            );
        }
    }

    #[test]
    fn test_kelvin_to_celsius() {
        assert_eq!(
            kelvin_to_celsius(273.15),
            Decimal::from_str("0.0").unwrap()
        );
        assert_eq!(
            kelvin_to_celsius(268.05),
            Decimal::from_str("-5.1").unwrap()
        );
    }

    #[test]
    fn test_within_range_wind_speed() {
        assert!(within_range(
            ParameterKind::WindSpeed,
            Decimal::from_str("120.0").unwrap()
        ));
        assert!(!within_range(
            ParameterKind::WindSpeed,
            Decimal::from_str("200.1").unwrap()
        ));
        assert!(!within_range(
            ParameterKind::WindSpeed,
            Decimal::from_str("-0.1").unwrap()
        ));
    }

    #[test]
    fn test_within_range_temperature_bounds_inclusive() {
        assert!(within_range(ParameterKind::Temperature, Decimal::from(-50)));
        assert!(within_range(ParameterKind::Temperature, Decimal::from(50)));
        assert!(!within_range(ParameterKind::Temperature, Decimal::from(51)));
    }
}
