use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::types::Json;
use sqlx::FromRow;

/// A geographic point of interest: coordinates plus the beacon ids used to
/// observe it, per network (primary and optional backup).
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Site {
    pub id: i32,
    pub name: String,
    pub latitude: Decimal,
    pub longitude: Decimal,
    pub altitude: i32,
    pub romma_beacon_id: Option<i32>,
    pub romma_beacon_id_backup: Option<i32>,
    pub ffvl_beacon_id: Option<i32>,
    pub ffvl_beacon_id_backup: Option<i32>,
    pub created_at: DateTime<Utc>,
}

/// A forecast source (e.g. "AROME", "Meteo-Parapente").
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Model {
    pub id: i32,
    pub name: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
}

/// A measured quantity (wind_speed km/h, wind_direction deg, temperature °C).
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Parameter {
    pub id: i32,
    pub name: String,
    pub unit: String,
    pub created_at: DateTime<Utc>,
}

/// A raw forecast point in staging, unique on
/// (site, model, parameter, forecast_run, valid_time).
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Forecast {
    pub id: i32,
    pub site_id: i32,
    pub model_id: i32,
    pub parameter_id: i32,
    pub forecast_run: DateTime<Utc>,
    pub valid_time: DateTime<Utc>,
    pub value: Decimal,
    pub created_at: DateTime<Utc>,
}

/// A raw observed point in staging, unique on
/// (site, parameter, observation_time, source).
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Observation {
    pub id: i32,
    pub site_id: i32,
    pub parameter_id: i32,
    pub observation_time: DateTime<Utc>,
    pub value: Decimal,
    pub source: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A matched (forecast, observation) pair with denormalised dimensions.
/// `processed_at` is stamped by the deviation engine; once set, the pair is
/// never re-reduced.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ForecastObservationPair {
    pub id: i32,
    pub forecast_id: i32,
    pub observation_id: i32,
    pub site_id: i32,
    pub model_id: i32,
    pub parameter_id: i32,
    pub forecast_run: DateTime<Utc>,
    pub valid_time: DateTime<Utc>,
    pub horizon: i32,
    pub forecast_value: Decimal,
    pub observed_value: Decimal,
    pub time_diff_minutes: i32,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A reduced signed error, keyed (timestamp, site, model, parameter,
/// horizon) in the time-series table.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Deviation {
    pub timestamp: DateTime<Utc>,
    pub site_id: i32,
    pub model_id: i32,
    pub parameter_id: i32,
    pub horizon: i32,
    pub forecast_value: Decimal,
    pub observed_value: Decimal,
    pub deviation: Decimal,
    pub created_at: DateTime<Utc>,
}

/// Reduced accuracy statistics per (model, site, parameter, horizon) cell.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct AccuracyMetric {
    pub id: i32,
    pub model_id: i32,
    pub site_id: i32,
    pub parameter_id: i32,
    pub horizon: i32,
    pub mae: Decimal,
    pub bias: Decimal,
    pub std_dev: Decimal,
    pub sample_size: i32,
    pub confidence_level: String,
    pub ci_lower: Option<Decimal>,
    pub ci_upper: Option<Decimal>,
    pub min_deviation: Decimal,
    pub max_deviation: Decimal,
    pub calculated_at: DateTime<Utc>,
}

/// Per-job observability record, one row per scheduled or manual run.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ExecutionLog {
    pub id: i32,
    pub job_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_seconds: f64,
    pub status: String,
    pub records_collected: i32,
    pub records_persisted: i32,
    pub errors: Option<Json<Vec<String>>>,
}
