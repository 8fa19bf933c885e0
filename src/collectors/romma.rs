//! ROMMA observation collector (beacon HTML scraping).
//!
//! Scrapes romma.fr station pages (`station_24.php?id=N`). Same regex
//! approach as the FFVL collector, with ROMMA's own markers: the average
//! wind is labelled "Moyen sur 10min" (plain or span-wrapped), directions
//! mix French cardinals (translated O→W before table lookup) with numeric
//! degrees, and timestamps are written out with French month names
//! ("le 18 Janvier 2026 17:01").

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;

use super::http::{retry_with_backoff, CircuitBreaker, HttpClient, RateLimiter, RetryPolicy};
use super::{
    within_range, Collector, ForecastPoint, ForecastRequest, ObservationPoint,
    ObservationRequest, ParameterKind,
};
use crate::errors::CollectError;
use crate::helpers::f64_to_decimal_1dp;

const BASE_URL: &str = "https://www.romma.fr/station_24.php";
const TIMEOUT: Duration = Duration::from_secs(10);
/// Polite scraping interval.
const MIN_REQUEST_INTERVAL: Duration = Duration::from_secs(2);
/// Observations older than this are logged as stale (but still emitted).
const STALE_THRESHOLD_HOURS: i64 = 2;

static WIND_SPEED_SPAN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)Moyen sur 10min\s*:\s*<span[^>]*>([\d.]+)</span>").unwrap()
});
static WIND_SPEED_PLAIN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)Moyen sur 10min\s*:\s*([\d.]+)\s*km/h").unwrap()
});
static DIRECTION_SPAN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)Direction\s*:\s*<span[^>]*>([NSEOW]{1,3})</span>").unwrap()
});
static DIRECTION_PLAIN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)Direction\s*:\s*([NSEOW]{1,3})\b").unwrap());
static DIRECTION_NUMERIC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)Direction\s*:\s*(\d+)\s*°").unwrap());
static TEMPERATURE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)Température\s*:?\s*([-\d.]+)\s*°C").unwrap());
static OBSERVATION_TIME_RE: Lazy<Regex> = Lazy::new(|| {
    // "le 18 Janvier 2026                17:01" (new) or
    // "le 12 Janvier 2026 à 14:30" (old)
    Regex::new(r"(?i)le\s+(\d{1,2})\s+(\p{L}+)\s+(\d{4})\s+(?:à\s+)?(\d{1,2}):(\d{2})").unwrap()
});

/// English-rose table; French cardinals are translated O→W before lookup.
static CARDINAL_TO_DEGREES: Lazy<HashMap<&'static str, Decimal>> = Lazy::new(|| {
    use std::str::FromStr;
    let d = |s: &str| Decimal::from_str(s).unwrap();
    HashMap::from([
        ("N", d("0")),
        ("NNE", d("22.5")),
        ("NE", d("45")),
        ("ENE", d("67.5")),
        ("E", d("90")),
        ("ESE", d("112.5")),
        ("SE", d("135")),
        ("SSE", d("157.5")),
        ("S", d("180")),
        ("SSW", d("202.5")),
        ("SW", d("225")),
        ("WSW", d("247.5")),
        ("W", d("270")),
        ("WNW", d("292.5")),
        ("NW", d("315")),
        ("NNW", d("337.5")),
    ])
});

/// French month names, accent variants included.
static FRENCH_MONTHS: Lazy<HashMap<&'static str, u32>> = Lazy::new(|| {
    HashMap::from([
        ("janvier", 1),
        ("février", 2),
        ("fevrier", 2),
        ("mars", 3),
        ("avril", 4),
        ("mai", 5),
        ("juin", 6),
        ("juillet", 7),
        ("août", 8),
        ("aout", 8),
        ("septembre", 9),
        ("octobre", 10),
        ("novembre", 11),
        ("décembre", 12),
        ("decembre", 12),
    ])
});

pub struct RommaCollector {
    client: HttpClient,
    rate_limiter: RateLimiter,
    breaker: CircuitBreaker,
}

impl RommaCollector {
    pub fn new() -> Result<Self, CollectError> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::USER_AGENT,
            reqwest::header::HeaderValue::from_static(
                "ForecastCheck/0.1 (forecast accuracy pipeline; contact@forecastcheck.example)",
            ),
        );
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("text/html,application/xhtml+xml"),
        );
        headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            reqwest::header::HeaderValue::from_static("fr-FR,fr;q=0.9,en;q=0.8"),
        );

        Ok(Self {
            client: HttpClient::new(TIMEOUT, headers)?,
            rate_limiter: RateLimiter::new(MIN_REQUEST_INTERVAL),
            breaker: CircuitBreaker::with_defaults("ROMMA"),
        })
    }

    async fn fetch_beacon_html(&self, beacon_id: i32) -> Result<String, CollectError> {
        let url = format!("{BASE_URL}?id={beacon_id}");
        retry_with_backoff(RetryPolicy::default(), "ROMMA beacon fetch", || {
            let url = url.clone();
            async move {
                self.rate_limiter.acquire().await;
                self.client.get_text(&url).await
            }
        })
        .await
    }

    fn parse_beacon_html(
        html: &str,
        request: &ObservationRequest,
        now: DateTime<Utc>,
    ) -> Vec<ObservationPoint> {
        let Some(obs_time) = parse_observation_time(html) else {
            tracing::warn!("Could not parse observation timestamp from ROMMA HTML");
            return Vec::new();
        };

        if now - obs_time > chrono::Duration::hours(STALE_THRESHOLD_HOURS) {
            tracing::warn!("ROMMA observation data is stale (timestamp: {})", obs_time);
        }

        let mut observations = Vec::new();

        if let Some(speed) = extract_wind_speed(html) {
            if within_range(ParameterKind::WindSpeed, speed) {
                observations.push(ObservationPoint {
                    site_id: request.site_id,
                    parameter_id: request.parameter_ids.wind_speed,
                    observation_time: obs_time,
                    value: speed,
                });
            } else {
                tracing::warn!("Aberrant wind speed value: {} km/h", speed);
            }
        }

        if let Some(direction) = extract_wind_direction(html) {
            if within_range(ParameterKind::WindDirection, direction) {
                observations.push(ObservationPoint {
                    site_id: request.site_id,
                    parameter_id: request.parameter_ids.wind_direction,
                    observation_time: obs_time,
                    value: direction,
                });
            } else {
                tracing::warn!("Aberrant wind direction value: {}°", direction);
            }
        }

        if let Some(temperature) = extract_temperature(html) {
            if within_range(ParameterKind::Temperature, temperature) {
                observations.push(ObservationPoint {
                    site_id: request.site_id,
                    parameter_id: request.parameter_ids.temperature,
                    observation_time: obs_time,
                    value: temperature,
                });
            } else {
                tracing::warn!("Aberrant temperature value: {}°C", temperature);
            }
        }

        observations
    }
}

/// 10-minute average wind speed, span-wrapped or plain.
fn extract_wind_speed(html: &str) -> Option<Decimal> {
    let captures = WIND_SPEED_SPAN_RE
        .captures(html)
        .or_else(|| WIND_SPEED_PLAIN_RE.captures(html))?;
    let value: f64 = captures.get(1)?.as_str().parse().ok()?;
    Some(f64_to_decimal_1dp(value))
}

/// Wind direction: cardinal (French O translated to W) or numeric degrees.
fn extract_wind_direction(html: &str) -> Option<Decimal> {
    if let Some(captures) = DIRECTION_SPAN_RE
        .captures(html)
        .or_else(|| DIRECTION_PLAIN_RE.captures(html))
    {
        let cardinal = captures.get(1)?.as_str().to_uppercase().replace('O', "W");
        match CARDINAL_TO_DEGREES.get(cardinal.as_str()) {
            Some(degrees) => return Some(*degrees),
            None => {
                tracing::warn!("Unknown cardinal direction: {}", cardinal);
                return None;
            }
        }
    }

    let captures = DIRECTION_NUMERIC_RE.captures(html)?;
    captures.get(1)?.as_str().parse::<i64>().ok().map(Decimal::from)
}

/// Temperature ("Température: 8.5 °C"); placeholder dashes mean no data.
fn extract_temperature(html: &str) -> Option<Decimal> {
    let captures = TEMPERATURE_RE.captures(html)?;
    let raw = captures.get(1)?.as_str();
    if raw == "--" || raw == "-.-" {
        return None;
    }
    let value: f64 = raw.parse().ok()?;
    Some(f64_to_decimal_1dp(value))
}

/// Observation timestamp with a written-out French month.
///
/// TODO: ROMMA publishes French local time (Europe/Paris) with no offset
/// marker; this parses it as UTC, so stale detection can be off by 1–2 h.
fn parse_observation_time(html: &str) -> Option<DateTime<Utc>> {
    let captures = OBSERVATION_TIME_RE.captures(html)?;
    let day: u32 = captures.get(1)?.as_str().parse().ok()?;
    let month_name = captures.get(2)?.as_str().to_lowercase();
    let year: i32 = captures.get(3)?.as_str().parse().ok()?;
    let hour: u32 = captures.get(4)?.as_str().parse().ok()?;
    let minute: u32 = captures.get(5)?.as_str().parse().ok()?;

    let Some(&month) = FRENCH_MONTHS.get(month_name.as_str()) else {
        tracing::warn!("Unknown French month: {}", month_name);
        return None;
    };

    Utc.with_ymd_and_hms(year, month, day, hour, minute, 0)
        .single()
}

#[async_trait]
impl Collector for RommaCollector {
    fn name(&self) -> &'static str {
        "ROMMA"
    }

    fn source(&self) -> &'static str {
        "Réseau d'Observation Météo du Massif Alpin"
    }

    async fn collect_forecast(
        &self,
        request: &ForecastRequest,
    ) -> Result<Vec<ForecastPoint>, CollectError> {
        tracing::debug!(
            "collect_forecast called for ROMMA site {}, but this is an observation-only source",
            request.site_id,
        );
        Ok(Vec::new())
    }

    async fn collect_observation(
        &self,
        request: &ObservationRequest,
    ) -> Result<Vec<ObservationPoint>, CollectError> {
        let Some(beacon_id) = request.beacon_id else {
            tracing::warn!("No ROMMA beacon id for site {}", request.site_id);
            return Ok(Vec::new());
        };

        self.breaker.check().await?;

        let html = match self.fetch_beacon_html(beacon_id).await {
            Ok(html) => {
                self.breaker.record_success().await;
                html
            }
            Err(e) => {
                self.breaker.record_failure().await;
                return Err(e);
            }
        };

        if html.is_empty() {
            tracing::warn!("Empty HTML received for ROMMA beacon {}", beacon_id);
            return Ok(Vec::new());
        }

        let observations = Self::parse_beacon_html(&html, request, Utc::now());
        tracing::debug!(
            "ROMMA: extracted {} observations from beacon {} for site {}",
            observations.len(),
            beacon_id,
            request.site_id,
        );
        Ok(observations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::ParameterIds;
    use std::str::FromStr;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> ObservationRequest {
        ObservationRequest {
            site_id: 1,
            observation_time: "2026-01-18T17:05:00Z".parse().unwrap(),
            beacon_id: Some(21),
            parameter_ids: ParameterIds {
                wind_speed: 1,
                wind_direction: 2,
                temperature: 3,
            },
        }
    }

    const SAMPLE_HTML: &str = r#"
        <html><body>
        <h2>Station Passy Plaine Joux, le 18 Janvier 2026                17:01</h2>
        <p>Moyen sur 10min : <span class="bigTexte">25</span> km/h</p>
        <p>Direction : <span class="smallTexte">NNO</span></p>
        <p>Température: 3.4 °C</p>
        </body></html>
    "#;

    #[test]
    fn test_parse_full_station_page() {
        let now = "2026-01-18T17:05:00Z".parse().unwrap();
        let obs = RommaCollector::parse_beacon_html(SAMPLE_HTML, &request(), now);
        assert_eq!(obs.len(), 3);

        let expected_time: DateTime<Utc> = "2026-01-18T17:01:00Z".parse().unwrap();
        assert!(obs.iter().all(|o| o.observation_time == expected_time));

        let speed = obs.iter().find(|o| o.parameter_id == 1).unwrap();
        assert_eq!(speed.value, Decimal::from_str("25.0").unwrap());

        // NNO → NNW → 337.5°
        let direction = obs.iter().find(|o| o.parameter_id == 2).unwrap();
        assert_eq!(direction.value, Decimal::from_str("337.5").unwrap());

        let temp = obs.iter().find(|o| o.parameter_id == 3).unwrap();
        assert_eq!(temp.value, Decimal::from_str("3.4").unwrap());
    }

    #[test]
    fn test_plain_text_wind_speed() {
        let html = "Moyen sur 10min : 25 km/h";
        assert_eq!(extract_wind_speed(html), Some(Decimal::from_str("25.0").unwrap()));
    }

    #[test]
    fn test_french_west_translates_to_w() {
        let html = "Direction : SO";
        // SO → SW → 225°
        assert_eq!(extract_wind_direction(html), Some(Decimal::from(225)));
    }

    #[test]
    fn test_numeric_direction() {
        let html = "Direction : 180°";
        assert_eq!(extract_wind_direction(html), Some(Decimal::from(180)));
    }

    #[test]
    fn test_all_sixteen_cardinals_are_rose_multiples() {
        use crate::helpers::dec_to_f64;
        for (cardinal, degrees) in CARDINAL_TO_DEGREES.iter() {
            let ratio = dec_to_f64(*degrees) / 22.5;
            assert!(
                (ratio - ratio.round()).abs() < 1e-9,
                "{cardinal} maps to {degrees}, not a multiple of 22.5°"
            );
        }
        assert_eq!(CARDINAL_TO_DEGREES.len(), 16);
    }

    #[test]
    fn test_temperature_placeholder_yields_none() {
        assert_eq!(extract_temperature("Température: -- °C"), None);
    }

    #[test]
    fn test_old_timestamp_format_with_a() {
        let t = parse_observation_time("le 12 Janvier 2026 à 14:30").unwrap();
        assert_eq!(t, "2026-01-12T14:30:00Z".parse::<DateTime<Utc>>().unwrap());
    }

    #[test]
    fn test_timestamp_accented_month() {
        let t = parse_observation_time("le 1 Février 2026 08:00").unwrap();
        assert_eq!(t, "2026-02-01T08:00:00Z".parse::<DateTime<Utc>>().unwrap());
    }

    #[test]
    fn test_unknown_month_yields_none() {
        assert_eq!(parse_observation_time("le 1 Brumaire 2026 08:00"), None);
    }

    #[test]
    fn test_observation_request_without_beacon_is_empty() {
        let collector = RommaCollector::new().unwrap();
        let mut req = request();
        req.beacon_id = None;
        let obs = tokio_test::block_on(collector.collect_observation(&req)).unwrap();
        assert!(obs.is_empty());
    }

    #[tokio::test]
    async fn test_collect_observation_against_mock_server() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/station_24.php"))
            .and(query_param("id", "21"))
            .respond_with(ResponseTemplate::new(200).set_body_string(SAMPLE_HTML))
            .mount(&server)
            .await;

        // Point a collector at the mock by fetching through its parser
        let client = HttpClient::new(Duration::from_secs(5), Default::default()).unwrap();
        let url = format!("{}/station_24.php?id=21", server.uri());
        let html = client.get_text(&url).await.unwrap();
        let now = "2026-01-18T17:05:00Z".parse().unwrap();
        let obs = RommaCollector::parse_beacon_html(&html, &request(), now);
        assert_eq!(obs.len(), 3);
    }
}
