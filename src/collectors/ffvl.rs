//! FFVL observation collector (beacon HTML scraping).
//!
//! Scrapes balisemeteo.com beacon pages (`balise.php?idBalise=N`) for
//! real-time wind and temperature observations. Extraction is regex-based,
//! keyed off stable French text markers ("Vitesse", "Direction",
//! "Température", "Relevé du …") — the pages are simple enough that DOM
//! parsing would buy nothing over anchored patterns.
//!
//! Directions come either as "SO : 224°" (degrees preferred) or as a bare
//! French cardinal resolved through the French rose (O = Ouest for west).
//! Observations older than two hours are still emitted but logged as stale.

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

const BASE_URL: &str = "https://www.balisemeteo.com/balise.php";
const TIMEOUT: Duration = Duration::from_secs(10);
/// Polite scraping interval.
const MIN_REQUEST_INTERVAL: Duration = Duration::from_secs(2);
/// Observations older than this are logged as stale (but still emitted).
const STALE_THRESHOLD_HOURS: i64 = 2;

static WIND_SPEED_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)Vitesse\s*:\s*(?:<b>|\*\*)\s*([\d.]+)\s*km/h").unwrap()
});
static WIND_SPEED_WARNING_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)Vitesse\s*:\s*(?:<b>)?\*?\*?\s*!!!\s*WARNING\s*!!!").unwrap()
});
static DIRECTION_DEGREES_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)Direction\s*:\s*(?:<b>|\*\*)?\s*([A-Z]{1,3})\s*:\s*(\d+)°").unwrap()
});
static DIRECTION_CARDINAL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)Direction\s*:\s*(?:<b>|\*\*)?\s*([A-Z]{1,3})\s*(?:</b>|\*\*)").unwrap()
});
static DIRECTION_WARNING_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)Direction\s*:\s*(?:<b>)?\*?\*?\s*!!!\s*WARNING\s*!!!").unwrap()
});
static TEMPERATURE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)Température\s*:\s*([-\d.]+)°").unwrap());
static TEMPERATURE_NC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)Température\s*:\s*NC").unwrap());
static OBSERVATION_TIME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)Relevé du\s+(\d{1,2})/(\d{1,2})/(\d{4})\s*-\s*(\d{1,2}):(\d{2})").unwrap()
});

/// French compass rose: O (Ouest) for west.
static FRENCH_CARDINAL_TO_DEGREES: Lazy<HashMap<&'static str, Decimal>> = Lazy::new(|| {
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
        ("SSO", d("202.5")),
        ("SO", d("225")),
        ("OSO", d("247.5")),
        ("O", d("270")),
        ("ONO", d("292.5")),
        ("NO", d("315")),
        ("NNO", d("337.5")),
    ])
});

pub struct FfvlCollector {
    client: HttpClient,
    rate_limiter: RateLimiter,
    breaker: CircuitBreaker,
}

impl FfvlCollector {
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
            breaker: CircuitBreaker::with_defaults("FFVL"),
        })
    }

    async fn fetch_beacon_html(&self, beacon_id: i32) -> Result<String, CollectError> {
        let url = format!("{BASE_URL}?idBalise={beacon_id}");
        retry_with_backoff(RetryPolicy::default(), "FFVL beacon fetch", || {
            let url = url.clone();
            async move {
                self.rate_limiter.acquire().await;
                self.client.get_text(&url).await
            }
        })
        .await
    }

    /// Parse all observations out of a beacon page. Missing fields are
    /// skipped; aberrant values are dropped with a warning.
    fn parse_beacon_html(
        html: &str,
        request: &ObservationRequest,
        now: DateTime<Utc>,
    ) -> Vec<ObservationPoint> {
        let Some(obs_time) = parse_observation_time(html) else {
            tracing::warn!("Could not parse observation timestamp from FFVL HTML");
            return Vec::new();
        };

        if now - obs_time > chrono::Duration::hours(STALE_THRESHOLD_HOURS) {
            tracing::warn!("FFVL observation data is stale (timestamp: {})", obs_time);
            // Still emitted; staleness is a data-quality signal, not an error
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

/// Average wind speed ("Vitesse : <b>33 km/h</b>"). The page also lists
/// min/max speeds; the first match is the average, which is what deviation
/// analysis compares against forecast averages.
fn extract_wind_speed(html: &str) -> Option<Decimal> {
    if WIND_SPEED_WARNING_RE.is_match(html) {
        return None;
    }
    let captures = WIND_SPEED_RE.captures(html)?;
    let value: f64 = captures.get(1)?.as_str().parse().ok()?;
    Some(f64_to_decimal_1dp(value))
}

/// Wind direction, preferring the degree-annotated form
/// ("Direction : <b>SO : 224°</b>") and falling back to the bare French
/// cardinal.
fn extract_wind_direction(html: &str) -> Option<Decimal> {
    if DIRECTION_WARNING_RE.is_match(html) {
        return None;
    }

    if let Some(captures) = DIRECTION_DEGREES_RE.captures(html) {
        if let Ok(degrees) = captures.get(2)?.as_str().parse::<i64>() {
            return Some(Decimal::from(degrees));
        }
    }

    let captures = DIRECTION_CARDINAL_RE.captures(html)?;
    let cardinal = captures.get(1)?.as_str().to_uppercase();
    match FRENCH_CARDINAL_TO_DEGREES.get(cardinal.as_str()) {
        Some(degrees) => Some(*degrees),
        None => {
            tracing::warn!("Unknown French cardinal direction: {}", cardinal);
            None
        }
    }
}

/// Temperature ("Température : -8.5°"); NC and placeholder dashes mean no
/// data.
fn extract_temperature(html: &str) -> Option<Decimal> {
    if TEMPERATURE_NC_RE.is_match(html) {
        return None;
    }
    let captures = TEMPERATURE_RE.captures(html)?;
    let raw = captures.get(1)?.as_str();
    if raw == "--" || raw == "-.-" {
        return None;
    }
    let value: f64 = raw.parse().ok()?;
    Some(f64_to_decimal_1dp(value))
}

/// Observation timestamp ("Relevé du 12/01/2026 - 14:30").
///
/// TODO: FFVL publishes French local time (Europe/Paris) with no offset
/// marker; this parses it as UTC, so stale detection can be off by 1–2 h.
fn parse_observation_time(html: &str) -> Option<DateTime<Utc>> {
    let captures = OBSERVATION_TIME_RE.captures(html)?;
    let day: u32 = captures.get(1)?.as_str().parse().ok()?;
    let month: u32 = captures.get(2)?.as_str().parse().ok()?;
    let year: i32 = captures.get(3)?.as_str().parse().ok()?;
    let hour: u32 = captures.get(4)?.as_str().parse().ok()?;
    let minute: u32 = captures.get(5)?.as_str().parse().ok()?;

    Utc.with_ymd_and_hms(year, month, day, hour, minute, 0)
        .single()
}

#[async_trait]
impl Collector for FfvlCollector {
    fn name(&self) -> &'static str {
        "FFVL"
    }

    fn source(&self) -> &'static str {
        "Fédération Française de Vol Libre - Balises Météo"
    }

    async fn collect_forecast(
        &self,
        request: &ForecastRequest,
    ) -> Result<Vec<ForecastPoint>, CollectError> {
        tracing::debug!(
            "collect_forecast called for FFVL site {}, but this is an observation-only source",
            request.site_id,
        );
        Ok(Vec::new())
    }

    async fn collect_observation(
        &self,
        request: &ObservationRequest,
    ) -> Result<Vec<ObservationPoint>, CollectError> {
        let Some(beacon_id) = request.beacon_id else {
            tracing::warn!("No FFVL beacon id for site {}", request.site_id);
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
            tracing::warn!("Empty HTML received for FFVL beacon {}", beacon_id);
            return Ok(Vec::new());
        }
        if html.contains("ERROR") || html.contains("no data for idBalise") {
            tracing::warn!("Error response from FFVL beacon {}", beacon_id);
            return Ok(Vec::new());
        }

        let observations = Self::parse_beacon_html(&html, request, Utc::now());
        tracing::debug!(
            "FFVL: extracted {} observations from beacon {} for site {}",
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

    fn request() -> ObservationRequest {
        ObservationRequest {
            site_id: 1,
            observation_time: "2026-01-12T14:35:00Z".parse().unwrap(),
            beacon_id: Some(67),
            parameter_ids: ParameterIds {
                wind_speed: 1,
                wind_direction: 2,
                temperature: 3,
            },
        }
    }

    const SAMPLE_HTML: &str = r#"
        <html><body>
        <h1>Balise Le Semnoz</h1>
        <p>Relevé du 12/01/2026 - 14:30</p>
        <p>Vitesse : <b>33 km/h</b></p>
        <p>Direction : <b>SO : 224°</b></p>
        <p>Température : -8.5°</p>
        </body></html>
    "#;

    #[test]
    fn test_parse_full_beacon_page() {
        let now = "2026-01-12T14:35:00Z".parse().unwrap();
        let obs = FfvlCollector::parse_beacon_html(SAMPLE_HTML, &request(), now);
        assert_eq!(obs.len(), 3);

        let expected_time: DateTime<Utc> = "2026-01-12T14:30:00Z".parse().unwrap();
        assert!(obs.iter().all(|o| o.observation_time == expected_time));

        let speed = obs.iter().find(|o| o.parameter_id == 1).unwrap();
        assert_eq!(speed.value, Decimal::from_str("33.0").unwrap());

        let direction = obs.iter().find(|o| o.parameter_id == 2).unwrap();
        assert_eq!(direction.value, Decimal::from(224));

        let temp = obs.iter().find(|o| o.parameter_id == 3).unwrap();
        assert_eq!(temp.value, Decimal::from_str("-8.5").unwrap());
    }

    #[test]
    fn test_direction_cardinal_only_uses_french_rose() {
        let html = "Relevé du 12/01/2026 - 14:30 Direction : <b>ONO</b>";
        let obs_dir = extract_wind_direction(html).unwrap();
        assert_eq!(obs_dir, Decimal::from_str("292.5").unwrap());
    }

    #[test]
    fn test_all_sixteen_french_cardinals_map_to_rose_multiples() {
        use crate::helpers::dec_to_f64;
        for (cardinal, degrees) in FRENCH_CARDINAL_TO_DEGREES.iter() {
            let ratio = dec_to_f64(*degrees) / 22.5;
            assert!(
                (ratio - ratio.round()).abs() < 1e-9,
                "{cardinal} maps to {degrees}, not a multiple of 22.5°"
            );
            assert!(
                *degrees >= Decimal::ZERO && *degrees < Decimal::from(360),
                "{cardinal} out of range"
            );
        }
        assert_eq!(FRENCH_CARDINAL_TO_DEGREES.len(), 16);
    }

    #[test]
    fn test_wind_speed_warning_state_yields_none() {
        let html = "Vitesse : <b>!!! WARNING !!!</b>";
        assert_eq!(extract_wind_speed(html), None);
    }

    #[test]
    fn test_temperature_nc_yields_none() {
        let html = "Température : NC";
        assert_eq!(extract_temperature(html), None);
    }

    #[test]
    fn test_missing_timestamp_yields_no_observations() {
        let html = "Vitesse : <b>33 km/h</b>";
        let now = "2026-01-12T14:35:00Z".parse().unwrap();
        let obs = FfvlCollector::parse_beacon_html(html, &request(), now);
        assert!(obs.is_empty());
    }

    #[test]
    fn test_stale_data_still_emitted() {
        // Observation from 14:30, "now" six hours later
        let now = "2026-01-12T20:30:00Z".parse().unwrap();
        let obs = FfvlCollector::parse_beacon_html(SAMPLE_HTML, &request(), now);
        assert_eq!(obs.len(), 3, "stale data is emitted, only logged");
    }

    #[test]
    fn test_aberrant_wind_speed_dropped() {
        let html = "Relevé du 12/01/2026 - 14:30 Vitesse : <b>999 km/h</b>";
        let now = "2026-01-12T14:35:00Z".parse().unwrap();
        let obs = FfvlCollector::parse_beacon_html(html, &request(), now);
        assert!(obs.is_empty());
    }

    #[test]
    fn test_parse_observation_time() {
        let t = parse_observation_time("Relevé du 3/2/2026 - 9:05").unwrap();
        assert_eq!(t, "2026-02-03T09:05:00Z".parse::<DateTime<Utc>>().unwrap());
    }

    #[test]
    fn test_parse_observation_time_invalid_date() {
        assert_eq!(parse_observation_time("Relevé du 45/13/2026 - 14:30"), None);
    }
}
