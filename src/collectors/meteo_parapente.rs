//! Meteo-Parapente forecast collector (JSON sounding API).
//!
//! GET `data.php?run=YYYYMMDDHH&location=lat,lon&date=YYYYMMDD&plot=sounding`.
//! The response is gated on `status == "ok"`; `data` maps hour-of-day keys
//! ("HH:MM") to per-level arrays where index 0 is the surface:
//!
//! - `umet` / `vmet`: wind U/V components (m/s)
//! - `tc`: temperature (°C)
//!
//! The valid time is the target date (default: the day after the forecast
//! run) at the key's hour, UTC. Upstream requires origin/referer/x-auth
//! headers alongside an identifying User-Agent.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use serde::Deserialize;

use super::http::{retry_with_backoff, CircuitBreaker, HttpClient, RetryPolicy};
use super::{
    wind_direction_deg, wind_speed_kmh, within_range, Collector, ForecastPoint, ForecastRequest,
    ObservationPoint, ObservationRequest, ParameterKind,
};
use crate::errors::CollectError;
use crate::helpers::f64_to_decimal_1dp;

const API_ENDPOINT: &str = "https://data0.meteo-parapente.com/data.php";
const TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct SoundingResponse {
    status: Option<String>,
    #[serde(default)]
    data: HashMap<String, HourData>,
}

/// Per-level arrays for one forecast hour; index 0 is the surface.
#[derive(Debug, Deserialize, Default)]
struct HourData {
    #[serde(default)]
    umet: Vec<f64>,
    #[serde(default)]
    vmet: Vec<f64>,
    #[serde(default)]
    tc: Vec<f64>,
}

pub struct MeteoParapenteCollector {
    client: HttpClient,
    breaker: CircuitBreaker,
}

impl MeteoParapenteCollector {
    pub fn new() -> Result<Self, CollectError> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            "origin",
            reqwest::header::HeaderValue::from_static("https://meteo-parapente.com"),
        );
        headers.insert(
            "referer",
            reqwest::header::HeaderValue::from_static("https://meteo-parapente.com/"),
        );
        headers.insert(
            reqwest::header::USER_AGENT,
            reqwest::header::HeaderValue::from_static(
                "ForecastCheck/0.1 (forecast accuracy pipeline)",
            ),
        );
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        headers.insert("x-auth", reqwest::header::HeaderValue::from_static(""));

        Ok(Self {
            client: HttpClient::new(TIMEOUT, headers)?,
            breaker: CircuitBreaker::with_defaults("Meteo-Parapente"),
        })
    }

    #[cfg(test)]
    fn with_endpoint_client(client: HttpClient) -> Self {
        Self {
            client,
            breaker: CircuitBreaker::with_defaults("Meteo-Parapente"),
        }
    }

    fn build_url(
        endpoint: &str,
        latitude: f64,
        longitude: f64,
        forecast_run: DateTime<Utc>,
        target_date: DateTime<Utc>,
    ) -> String {
        let run = forecast_run.format("%Y%m%d%H");
        let date = target_date.format("%Y%m%d");
        format!("{endpoint}?run={run}&location={latitude},{longitude}&date={date}&plot=sounding")
    }

    async fn fetch(&self, url: &str) -> Result<serde_json::Value, CollectError> {
        retry_with_backoff(RetryPolicy::default(), "Meteo-Parapente fetch", || async {
            self.client.get_json(url).await
        })
        .await
    }

    /// Parse the API response into forecast points. Hours that fail to
    /// parse are logged and skipped; aberrant values are dropped.
    fn parse_response(
        response: serde_json::Value,
        request: &ForecastRequest,
        target_date: DateTime<Utc>,
    ) -> Vec<ForecastPoint> {
        let parsed: SoundingResponse = match serde_json::from_value(response) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("Unexpected Meteo-Parapente response shape: {}", e);
                return Vec::new();
            }
        };

        if parsed.status.as_deref() != Some("ok") {
            tracing::warn!(
                "Meteo-Parapente returned non-ok status: {:?}",
                parsed.status
            );
            return Vec::new();
        }

        let mut points = Vec::new();
        for (hour_key, hour_data) in &parsed.data {
            match Self::parse_hour(hour_key, hour_data, request, target_date) {
                Ok(mut hour_points) => points.append(&mut hour_points),
                Err(e) => {
                    tracing::warn!("Error parsing hour {}: {}", hour_key, e);
                }
            }
        }
        points
    }

    fn parse_hour(
        hour_key: &str,
        hour_data: &HourData,
        request: &ForecastRequest,
        target_date: DateTime<Utc>,
    ) -> Result<Vec<ForecastPoint>, CollectError> {
        let valid_time = parse_valid_time(hour_key, target_date)?;
        let mut points = Vec::new();

        // Surface values are index 0 of each per-level array
        if let (Some(&u), Some(&v)) = (hour_data.umet.first(), hour_data.vmet.first()) {
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
                tracing::warn!("Aberrant wind speed {} km/h at {}, skipping", speed, hour_key);
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
                    hour_key
                );
            }
        }

        if let Some(&tc) = hour_data.tc.first() {
            let temperature = f64_to_decimal_1dp(tc);
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
                    hour_key
                );
            }
        }

        Ok(points)
    }
}

/// Build the valid time from an "HH:MM" hour key and the target date (UTC).
fn parse_valid_time(
    hour_key: &str,
    target_date: DateTime<Utc>,
) -> Result<DateTime<Utc>, CollectError> {
    let mut parts = hour_key.split(':');
    let hour: u32 = parts
        .next()
        .and_then(|h| h.trim().parse().ok())
        .ok_or_else(|| CollectError::Parse(format!("bad hour key '{hour_key}'")))?;
    let minute: u32 = match parts.next() {
        Some(m) => m
            .trim()
            .parse()
            .map_err(|_| CollectError::Parse(format!("bad hour key '{hour_key}'")))?,
        None => 0,
    };

    let time = NaiveTime::from_hms_opt(hour, minute, 0)
        .ok_or_else(|| CollectError::Parse(format!("hour key '{hour_key}' out of range")))?;
    Ok(Utc
        .from_utc_datetime(&target_date.date_naive().and_time(time)))
}

#[async_trait]
impl Collector for MeteoParapenteCollector {
    fn name(&self) -> &'static str {
        "Meteo-Parapente"
    }

    fn source(&self) -> &'static str {
        "Meteo-Parapente sounding API"
    }

    async fn collect_forecast(
        &self,
        request: &ForecastRequest,
    ) -> Result<Vec<ForecastPoint>, CollectError> {
        self.breaker.check().await?;

        // Forecasts target the day after the run by default
        let target_date = request.forecast_run + chrono::Duration::days(1);
        let url = Self::build_url(
            API_ENDPOINT,
            request.latitude,
            request.longitude,
            request.forecast_run,
            target_date,
        );

        let response = match self.fetch(&url).await {
            Ok(r) => {
                self.breaker.record_success().await;
                r
            }
            Err(e) => {
                self.breaker.record_failure().await;
                return Err(e);
            }
        };

        let points = Self::parse_response(response, request, target_date);
        tracing::debug!(
            "Meteo-Parapente: extracted {} points for site {}",
            points.len(),
            request.site_id,
        );
        Ok(points)
    }

    async fn collect_observation(
        &self,
        request: &ObservationRequest,
    ) -> Result<Vec<ObservationPoint>, CollectError> {
        tracing::debug!(
            "collect_observation called for Meteo-Parapente site {}, but this is a forecast-only source",
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
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> ForecastRequest {
        ForecastRequest {
            site_id: 1,
            model_id: 2,
            forecast_run: "2026-01-11T06:00:00Z".parse().unwrap(),
            latitude: 45.9167,
            longitude: 6.7,
            parameter_ids: ParameterIds {
                wind_speed: 1,
                wind_direction: 2,
                temperature: 3,
            },
        }
    }

    fn ok_body() -> serde_json::Value {
        serde_json::json!({
            "status": "ok",
            "data": {
                "12:00": {
                    "umet": [3.0, 5.0],
                    "vmet": [4.0, 6.0],
                    "tc": [2.35, -1.0],
                    "z": [1000.0, 1500.0]
                }
            }
        })
    }

    #[test]
    fn test_build_url_format() {
        let run = "2026-01-11T06:00:00Z".parse().unwrap();
        let date = "2026-01-12T06:00:00Z".parse().unwrap();
        let url = MeteoParapenteCollector::build_url("https://x.test/data.php", 45.9167, 6.7, run, date);
        assert_eq!(
            url,
            "https://x.test/data.php?run=2026011106&location=45.9167,6.7&date=20260112&plot=sounding"
        );
    }

    #[test]
    fn test_parse_valid_time() {
        let date = "2026-01-12T00:00:00Z".parse().unwrap();
        let vt = parse_valid_time("12:00", date).unwrap();
        assert_eq!(vt, "2026-01-12T12:00:00Z".parse::<DateTime<Utc>>().unwrap());
    }

    #[test]
    fn test_parse_valid_time_with_minutes() {
        let date = "2026-01-12T00:00:00Z".parse().unwrap();
        let vt = parse_valid_time("9:30", date).unwrap();
        assert_eq!(vt, "2026-01-12T09:30:00Z".parse::<DateTime<Utc>>().unwrap());
    }

    #[test]
    fn test_parse_valid_time_rejects_garbage() {
        let date = "2026-01-12T00:00:00Z".parse().unwrap();
        assert!(parse_valid_time("noon", date).is_err());
        assert!(parse_valid_time("25:00", date).is_err());
    }

    #[test]
    fn test_parse_response_extracts_surface_values() {
        let target = "2026-01-12T00:00:00Z".parse().unwrap();
        let points = MeteoParapenteCollector::parse_response(ok_body(), &request(), target);
        assert_eq!(points.len(), 3);

        // u=3, v=4 → 18 km/h
        let speed = points.iter().find(|p| p.parameter_id == 1).unwrap();
        assert_eq!(speed.value, Decimal::from_str("18.0").unwrap());

        // Surface temperature is index 0, rounded to 0.1
        let temp = points.iter().find(|p| p.parameter_id == 3).unwrap();
        assert_eq!(temp.value, Decimal::from_str("2.4").unwrap());

        let vt = "2026-01-12T12:00:00Z".parse::<DateTime<Utc>>().unwrap();
        assert!(points.iter().all(|p| p.valid_time == vt));
    }

    #[test]
    fn test_parse_response_non_ok_status_yields_nothing() {
        let body = serde_json::json!({ "status": "pending", "data": {} });
        let target = "2026-01-12T00:00:00Z".parse().unwrap();
        let points = MeteoParapenteCollector::parse_response(body, &request(), target);
        assert!(points.is_empty());
    }

    #[test]
    fn test_parse_response_missing_wind_still_yields_temperature() {
        let body = serde_json::json!({
            "status": "ok",
            "data": { "08:00": { "tc": [5.0] } }
        });
        let target = "2026-01-12T00:00:00Z".parse().unwrap();
        let points = MeteoParapenteCollector::parse_response(body, &request(), target);
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].parameter_id, 3);
    }

    #[test]
    fn test_parse_response_bad_hour_key_skipped() {
        let body = serde_json::json!({
            "status": "ok",
            "data": {
                "banana": { "tc": [5.0] },
                "10:00": { "tc": [3.0] }
            }
        });
        let target = "2026-01-12T00:00:00Z".parse().unwrap();
        let points = MeteoParapenteCollector::parse_response(body, &request(), target);
        assert_eq!(points.len(), 1, "only the valid hour should survive");
    }

    #[tokio::test]
    async fn test_fetch_against_mock_server() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data.php"))
            .and(query_param("plot", "sounding"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body()))
            .mount(&server)
            .await;

        let client = HttpClient::new(Duration::from_secs(5), Default::default()).unwrap();
        let collector = MeteoParapenteCollector::with_endpoint_client(client);

        let req = request();
        let target = req.forecast_run + chrono::Duration::days(1);
        let url = MeteoParapenteCollector::build_url(
            &format!("{}/data.php", server.uri()),
            req.latitude,
            req.longitude,
            req.forecast_run,
            target,
        );
        let response = collector.fetch(&url).await.unwrap();
        let points = MeteoParapenteCollector::parse_response(response, &req, target);
        assert_eq!(points.len(), 3);
    }
}
