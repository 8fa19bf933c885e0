//! AROME forecast collector (Météo-France GRIB2 download).
//!
//! Downloads one GRIB2 package per forecast run (reference time + 00H24H
//! range), decodes it off a temporary file, extracts u10/v10/t2m at the
//! grid point nearest to the site, and converts to forecast points:
//!
//! - wind speed  = √(u² + v²) × 3.6 (m/s → km/h), 0.1 resolution
//! - wind dir    = atan2(−u, −v) in degrees, [0, 360), 1° resolution
//! - temperature = Kelvin − 273.15, 0.1 resolution
//!
//! Authenticated by a bearer token from configuration; a missing token is
//! tolerated (the request goes out unauthenticated and usually fails,
//! cleanly). Upstream rate limit is 50 req/min, enforced as a 1.2 s
//! minimum inter-request interval.

use std::collections::BTreeMap;
use std::io::{BufReader, Write};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};

use super::http::{retry_with_backoff, CircuitBreaker, HttpClient, RateLimiter, RetryPolicy};
use super::{
    kelvin_to_celsius, wind_direction_deg, wind_speed_kmh, within_range, Collector,
    ForecastPoint, ForecastRequest, ObservationPoint, ObservationRequest, ParameterKind,
};
use crate::errors::CollectError;

const API_ENDPOINT: &str =
    "https://public-api.meteofrance.fr/previnum/DPPaquetAROME/v1/models/AROME/grids/0.025/packages";
/// Surface-parameters package.
const PACKAGE: &str = "SP1";
/// Forecast time range carried in the URL.
const TIME_RANGE: &str = "00H24H";
/// Longer timeout: GRIB2 packages are multi-megabyte.
const TIMEOUT: Duration = Duration::from_secs(30);
/// 50 requests per minute ⇒ 1.2 s between requests.
const MIN_REQUEST_INTERVAL: Duration = Duration::from_millis(1200);

/// GRIB2 (discipline, category, number) triplets for the fields we extract.
const VAR_U10: (u8, u8, u8) = (0, 2, 2);
const VAR_V10: (u8, u8, u8) = (0, 2, 3);
const VAR_T2M: (u8, u8, u8) = (0, 0, 0);

/// One forecast hour's worth of raw grid values at the site.
#[derive(Debug, Default, Clone, Copy)]
struct SiteStep {
    u: Option<f64>,
    v: Option<f64>,
    t_kelvin: Option<f64>,
}

pub struct AromeCollector {
    client: HttpClient,
    rate_limiter: RateLimiter,
    breaker: CircuitBreaker,
}

impl AromeCollector {
    pub fn new(api_token: Option<&str>) -> Result<Self, CollectError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static("ForecastCheck/0.1 (forecast accuracy pipeline)"),
        );
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        if let Some(token) = api_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|e| {
                CollectError::Parse(format!("invalid METEOFRANCE_API_TOKEN: {e}"))
            })?;
            headers.insert(AUTHORIZATION, value);
        } else {
            tracing::warn!("No Météo-France API token configured; AROME requests will be unauthenticated");
        }

        Ok(Self {
            client: HttpClient::new(TIMEOUT, headers)?,
            rate_limiter: RateLimiter::new(MIN_REQUEST_INTERVAL),
            breaker: CircuitBreaker::with_defaults("AROME"),
        })
    }

    fn build_url(forecast_run: DateTime<Utc>) -> String {
        let ref_time = forecast_run.format("%Y-%m-%dT%H:%M:%SZ");
        format!(
            "{API_ENDPOINT}/{PACKAGE}/productARO?referencetime={ref_time}&time={TIME_RANGE}&format=grib2"
        )
    }

    async fn download_grib2(&self, forecast_run: DateTime<Utc>) -> Result<Vec<u8>, CollectError> {
        let url = Self::build_url(forecast_run);
        retry_with_backoff(RetryPolicy::default(), "AROME GRIB2 download", || {
            let url = url.clone();
            async move {
                self.rate_limiter.acquire().await;
                self.client.get_bytes(&url).await
            }
        })
        .await
    }

    /// Decode the GRIB2 payload and pull out u10/v10/t2m at the grid point
    /// nearest to (latitude, longitude), keyed by forecast hour.
    ///
    /// The multi-message file is parsed off a temporary file, removed on
    /// drop on every exit path. Individual submessages that fail to decode
    /// are logged and skipped.
    fn extract_site_series(
        grib2_bytes: &[u8],
        latitude: f64,
        longitude: f64,
    ) -> Result<BTreeMap<i64, SiteStep>, CollectError> {
        if grib2_bytes.is_empty() {
            return Err(CollectError::Parse("empty GRIB2 payload".into()));
        }

        let mut tmp = tempfile::NamedTempFile::new()
            .map_err(|e| CollectError::Parse(format!("failed to create temp file: {e}")))?;
        tmp.write_all(grib2_bytes)
            .map_err(|e| CollectError::Parse(format!("failed to write temp file: {e}")))?;

        let file = tmp
            .reopen()
            .map_err(|e| CollectError::Parse(format!("failed to reopen temp file: {e}")))?;
        let grib2 = grib::from_reader(BufReader::new(file))
            .map_err(|e| CollectError::Parse(format!("failed to read GRIB2: {e:?}")))?;

        let mut steps: BTreeMap<i64, SiteStep> = BTreeMap::new();
        // The grid is identical across submessages of one package; resolve
        // the nearest-point index once.
        let mut site_index: Option<usize> = None;

        for (_index, submessage) in grib2.iter() {
            let discipline = submessage.indicator().discipline;
            let prod_def = submessage.prod_def();

            let (category, number) =
                match (prod_def.parameter_category(), prod_def.parameter_number()) {
                    (Some(c), Some(n)) => (c, n),
                    _ => continue,
                };
            let triplet = (discipline, category, number);
            if triplet != VAR_U10 && triplet != VAR_V10 && triplet != VAR_T2M {
                continue;
            }

            let hour = match prod_def.forecast_time() {
                Some(ft) => i64::from(ft.value),
                None => {
                    tracing::warn!("AROME submessage without forecast time, skipping");
                    continue;
                }
            };

            if site_index.is_none() {
                match submessage.latlons() {
                    Ok(latlons) => {
                        site_index = nearest_grid_index(latlons, latitude, longitude);
                    }
                    Err(e) => {
                        tracing::warn!("Failed to read AROME grid coordinates: {:?}", e);
                        continue;
                    }
                }
            }
            let Some(index) = site_index else {
                continue;
            };

            let value = match grib::Grib2SubmessageDecoder::from(submessage) {
                Ok(decoder) => match decoder.dispatch() {
                    Ok(values) => values.into_iter().nth(index).map(f64::from),
                    Err(e) => {
                        tracing::warn!("Failed to decode AROME values at hour {}: {:?}", hour, e);
                        continue;
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to build AROME decoder at hour {}: {:?}", hour, e);
                    continue;
                }
            };
            let Some(value) = value else {
                tracing::warn!("AROME grid shorter than expected at hour {}", hour);
                continue;
            };

            let step = steps.entry(hour).or_default();
            match triplet {
                t if t == VAR_U10 => step.u = Some(value),
                t if t == VAR_V10 => step.v = Some(value),
                _ => step.t_kelvin = Some(value),
            }
        }

        Ok(steps)
    }

    /// Build forecast points from the per-hour site series, dropping
    /// aberrant values with a warning.
    fn points_from_steps(
        steps: &BTreeMap<i64, SiteStep>,
        request: &ForecastRequest,
    ) -> Vec<ForecastPoint> {
        let mut points = Vec::new();

        for (&hour, step) in steps {
            let valid_time = request.forecast_run + chrono::Duration::hours(hour);

            if let (Some(u), Some(v)) = (step.u, step.v) {
                let speed = wind_speed_kmh(u, v);
                if within_range(ParameterKind::WindSpeed, speed) {
                    points.push(ForecastPoint {
                        site_id: request.site_id,
                        model_id: request.model_id,
                        parameter_id: request.parameter_ids.wind_speed,
                        forecast_run: request.forecast_run,
                        valid_time,
                        value: speed,
                    });
                } else {
                    tracing::warn!("Aberrant wind speed {} km/h at {}, skipping", speed, valid_time);
                }

                let direction = wind_direction_deg(u, v);
                if within_range(ParameterKind::WindDirection, direction) {
                    points.push(ForecastPoint {
                        site_id: request.site_id,
                        model_id: request.model_id,
                        parameter_id: request.parameter_ids.wind_direction,
                        forecast_run: request.forecast_run,
                        valid_time,
                        value: direction,
                    });
                } else {
                    tracing::warn!(
                        "Aberrant wind direction {}° at {}, skipping",
                        direction,
                        valid_time
                    );
                }
            }

            if let Some(kelvin) = step.t_kelvin {
                let temperature = kelvin_to_celsius(kelvin);
                if within_range(ParameterKind::Temperature, temperature) {
                    points.push(ForecastPoint {
                        site_id: request.site_id,
                        model_id: request.model_id,
                        parameter_id: request.parameter_ids.temperature,
                        forecast_run: request.forecast_run,
                        valid_time,
                        value: temperature,
                    });
                } else {
                    tracing::warn!(
                        "Aberrant temperature {}°C at {}, skipping",
                        temperature,
                        valid_time
                    );
                }
            }
        }

        points
    }
}

/// Index of the grid point nearest to (latitude, longitude).
fn nearest_grid_index(
    latlons: impl Iterator<Item = (f32, f32)>,
    latitude: f64,
    longitude: f64,
) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, (lat, lon)) in latlons.enumerate() {
        let dlat = f64::from(lat) - latitude;
        let dlon = f64::from(lon) - longitude;
        let dist = dlat * dlat + dlon * dlon;
        if best.map(|(_, d)| dist < d).unwrap_or(true) {
            best = Some((i, dist));
        }
    }
    best.map(|(i, _)| i)
}

#[async_trait]
impl Collector for AromeCollector {
    fn name(&self) -> &'static str {
        "AROME"
    }

    fn source(&self) -> &'static str {
        "Météo-France AROME 1.3 km mesoscale model"
    }

    async fn collect_forecast(
        &self,
        request: &ForecastRequest,
    ) -> Result<Vec<ForecastPoint>, CollectError> {
        self.breaker.check().await?;

        let grib2_bytes = match self.download_grib2(request.forecast_run).await {
            Ok(bytes) => {
                self.breaker.record_success().await;
                bytes
            }
            Err(e) => {
                self.breaker.record_failure().await;
                return Err(e);
            }
        };

        let steps =
            match Self::extract_site_series(&grib2_bytes, request.latitude, request.longitude) {
                Ok(steps) => steps,
                Err(e) => {
                    tracing::warn!(
                        "Failed to parse AROME GRIB2 for site {}: {}",
                        request.site_id,
                        e
                    );
                    return Ok(Vec::new());
                }
            };

        let points = Self::points_from_steps(&steps, request);
        tracing::debug!(
            "AROME: extracted {} points over {} time steps for site {}",
            points.len(),
            steps.len(),
            request.site_id,
        );
        Ok(points)
    }

    async fn collect_observation(
        &self,
        request: &ObservationRequest,
    ) -> Result<Vec<ObservationPoint>, CollectError> {
        tracing::debug!(
            "collect_observation called for AROME site {}, but this is a forecast-only source",
            request.site_id,
        );
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::ParameterIds;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn request() -> ForecastRequest {
        ForecastRequest {
            site_id: 1,
            model_id: 1,
            forecast_run: "2026-01-12T06:00:00Z".parse().unwrap(),
            latitude: 45.9167,
            longitude: 6.7,
            parameter_ids: ParameterIds {
                wind_speed: 1,
                wind_direction: 2,
                temperature: 3,
            },
        }
    }

    #[test]
    fn test_build_url_carries_reference_time_and_range() {
        let run = "2026-01-12T06:00:00Z".parse().unwrap();
        let url = AromeCollector::build_url(run);
        assert!(url.contains("referencetime=2026-01-12T06:00:00Z"), "{url}");
        assert!(url.contains("time=00H24H"), "{url}");
        assert!(url.contains("format=grib2"), "{url}");
    }

    #[test]
    fn test_nearest_grid_index_picks_closest() {
        let grid = vec![
            (45.0f32, 6.0f32),
            (45.9f32, 6.7f32),
            (46.0f32, 7.0f32),
        ];
        let idx = nearest_grid_index(grid.into_iter(), 45.9167, 6.7);
        assert_eq!(idx, Some(1));
    }

    #[test]
    fn test_nearest_grid_index_empty_grid() {
        let idx = nearest_grid_index(std::iter::empty(), 45.9167, 6.7);
        assert_eq!(idx, None);
    }

    #[test]
    fn test_points_from_steps_full_step() {
        let mut steps = BTreeMap::new();
        steps.insert(
            12,
            SiteStep {
                u: Some(3.0),
                v: Some(4.0),
                t_kelvin: Some(268.05),
            },
        );

        let points = AromeCollector::points_from_steps(&steps, &request());
        assert_eq!(points.len(), 3, "speed + direction + temperature");

        let speed = points.iter().find(|p| p.parameter_id == 1).unwrap();
        assert_eq!(speed.value, Decimal::from_str("18.0").unwrap());
        assert_eq!(
            speed.valid_time,
            "2026-01-12T18:00:00Z".parse::<chrono::DateTime<Utc>>().unwrap()
        );

        let temp = points.iter().find(|p| p.parameter_id == 3).unwrap();
        assert_eq!(temp.value, Decimal::from_str("-5.1").unwrap());
    }

    #[test]
    fn test_points_from_steps_missing_v_skips_wind() {
        let mut steps = BTreeMap::new();
        steps.insert(
            6,
            SiteStep {
                u: Some(3.0),
                v: None,
                t_kelvin: Some(273.15),
            },
        );

        let points = AromeCollector::points_from_steps(&steps, &request());
        assert_eq!(points.len(), 1, "only temperature should be emitted");
        assert_eq!(points[0].parameter_id, 3);
    }

    #[test]
    fn test_points_from_steps_drops_aberrant_temperature() {
        let mut steps = BTreeMap::new();
        steps.insert(
            0,
            SiteStep {
                u: None,
                v: None,
                // 400 K ≈ 126.85 °C — far outside the valid range
                t_kelvin: Some(400.0),
            },
        );

        let points = AromeCollector::points_from_steps(&steps, &request());
        assert!(points.is_empty(), "aberrant temperature must be dropped");
    }

    #[test]
    fn test_extract_site_series_rejects_empty_payload() {
        let err = AromeCollector::extract_site_series(&[], 45.0, 6.0).unwrap_err();
        assert!(matches!(err, CollectError::Parse(_)));
    }

    #[test]
    fn test_extract_site_series_rejects_garbage() {
        let err =
            AromeCollector::extract_site_series(b"definitely not grib2", 45.0, 6.0).unwrap_err();
        assert!(matches!(err, CollectError::Parse(_)));
    }
}
