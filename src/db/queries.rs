use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::types::Json;
use sqlx::PgPool;

use super::models::{ExecutionLog, Forecast, ForecastObservationPair, Observation, Site};
use crate::collectors::{ForecastPoint, ObservationPoint};

// ---------------------------------------------------------------------------
// Reference data
// ---------------------------------------------------------------------------

/// Load all configured sites, including their beacon ids.
pub(crate) async fn list_sites(pool: &PgPool) -> Result<Vec<Site>, sqlx::Error> {
    sqlx::query_as::<_, Site>(
        "SELECT id, name, latitude, longitude, altitude,
                romma_beacon_id, romma_beacon_id_backup,
                ffvl_beacon_id, ffvl_beacon_id_backup, created_at
         FROM sites
         ORDER BY id",
    )
    .fetch_all(pool)
    .await
}

/// Look up a model id by its unique name (e.g. "AROME").
pub(crate) async fn model_id_by_name(
    pool: &PgPool,
    name: &str,
) -> Result<Option<i32>, sqlx::Error> {
    sqlx::query_scalar::<_, i32>("SELECT id FROM models WHERE name = $1")
        .bind(name)
        .fetch_optional(pool)
        .await
}

/// Map of parameter name → id for all known parameters.
pub(crate) async fn parameter_ids_by_name(
    pool: &PgPool,
) -> Result<HashMap<String, i32>, sqlx::Error> {
    let rows = sqlx::query_as::<_, (String, i32)>("SELECT name, id FROM parameters")
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().collect())
}

/// Map of parameter id → name for the given ids.
pub(crate) async fn parameter_names_by_id(
    pool: &PgPool,
    ids: &[i32],
) -> Result<HashMap<i32, String>, sqlx::Error> {
    let rows =
        sqlx::query_as::<_, (i32, String)>("SELECT id, name FROM parameters WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(pool)
            .await?;
    Ok(rows.into_iter().collect())
}

// ---------------------------------------------------------------------------
// Staging upserts
// ---------------------------------------------------------------------------

/// Save forecast points to staging with upsert-or-ignore semantics.
///
/// The whole batch runs in one transaction; a failure rolls all of it back
/// (other sources' batches are separate calls and unaffected). Returns
/// (attempted, inserted) — conflicts on the 5-tuple unique key count as
/// attempted but not inserted, which makes retries idempotent.
pub(crate) async fn insert_forecasts(
    pool: &PgPool,
    points: &[ForecastPoint],
    source_name: &str,
) -> Result<(usize, usize), sqlx::Error> {
    if points.is_empty() {
        return Ok((0, 0));
    }

    let mut tx = pool.begin().await?;
    let mut inserted = 0usize;

    for p in points {
        let result = sqlx::query(
            "INSERT INTO forecasts (site_id, model_id, parameter_id, forecast_run, valid_time, value)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (site_id, model_id, parameter_id, forecast_run, valid_time) DO NOTHING",
        )
        .bind(p.site_id)
        .bind(p.model_id)
        .bind(p.parameter_id)
        .bind(p.forecast_run)
        .bind(p.valid_time)
        .bind(p.value)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() > 0 {
            inserted += 1;
        }
    }

    tx.commit().await?;

    tracing::info!(
        "[{}] Saved {}/{} forecasts ({} duplicates skipped)",
        source_name,
        inserted,
        points.len(),
        points.len() - inserted,
    );

    Ok((points.len(), inserted))
}

/// Save observation points to staging with upsert-or-ignore semantics.
///
/// Same shape as `insert_forecasts`, with the 4-tuple unique key
/// (site, parameter, observation_time, source).
pub(crate) async fn insert_observations(
    pool: &PgPool,
    points: &[ObservationPoint],
    source_name: &str,
) -> Result<(usize, usize), sqlx::Error> {
    if points.is_empty() {
        return Ok((0, 0));
    }

    let mut tx = pool.begin().await?;
    let mut inserted = 0usize;

    for o in points {
        let result = sqlx::query(
            "INSERT INTO observations (site_id, parameter_id, observation_time, value, source)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (site_id, parameter_id, observation_time, source) DO NOTHING",
        )
        .bind(o.site_id)
        .bind(o.parameter_id)
        .bind(o.observation_time)
        .bind(o.value)
        .bind(source_name)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() > 0 {
            inserted += 1;
        }
    }

    tx.commit().await?;

    tracing::info!(
        "[{}] Saved {}/{} observations ({} duplicates skipped)",
        source_name,
        inserted,
        points.len(),
        points.len() - inserted,
    );

    Ok((points.len(), inserted))
}

// ---------------------------------------------------------------------------
// Matching engine loads & pair inserts
// ---------------------------------------------------------------------------

/// Forecasts for a site whose valid_time falls in [start, end].
pub(crate) async fn forecasts_in_window(
    pool: &PgPool,
    site_id: i32,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<Forecast>, sqlx::Error> {
    sqlx::query_as::<_, Forecast>(
        "SELECT id, site_id, model_id, parameter_id, forecast_run, valid_time, value, created_at
         FROM forecasts
         WHERE site_id = $1 AND valid_time >= $2 AND valid_time <= $3
         ORDER BY valid_time",
    )
    .bind(site_id)
    .bind(start)
    .bind(end)
    .fetch_all(pool)
    .await
}

/// Observations for a site whose observation_time falls in [start, end].
pub(crate) async fn observations_in_window(
    pool: &PgPool,
    site_id: i32,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<Observation>, sqlx::Error> {
    sqlx::query_as::<_, Observation>(
        "SELECT id, site_id, parameter_id, observation_time, value, source, created_at
         FROM observations
         WHERE site_id = $1 AND observation_time >= $2 AND observation_time <= $3
         ORDER BY observation_time",
    )
    .bind(site_id)
    .bind(start)
    .bind(end)
    .fetch_all(pool)
    .await
}

/// All existing (forecast_id, observation_id) pair keys for a site.
///
/// Loaded up front so the matcher can skip duplicates before insert; the
/// unique constraint remains as a safety net, not the control flow.
pub(crate) async fn existing_pair_keys(
    pool: &PgPool,
    site_id: i32,
) -> Result<HashSet<(i32, i32)>, sqlx::Error> {
    let rows = sqlx::query_as::<_, (i32, i32)>(
        "SELECT forecast_id, observation_id FROM forecast_observation_pairs WHERE site_id = $1",
    )
    .bind(site_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().collect())
}

/// A pair row produced by the matching engine, ready for insert.
#[derive(Debug, Clone)]
pub(crate) struct NewPair {
    pub(crate) forecast_id: i32,
    pub(crate) observation_id: i32,
    pub(crate) site_id: i32,
    pub(crate) model_id: i32,
    pub(crate) parameter_id: i32,
    pub(crate) forecast_run: DateTime<Utc>,
    pub(crate) valid_time: DateTime<Utc>,
    pub(crate) horizon: i32,
    pub(crate) forecast_value: Decimal,
    pub(crate) observed_value: Decimal,
    pub(crate) time_diff_minutes: i32,
}

/// Insert one batch of pairs in a single committed transaction.
///
/// The matcher calls this per ~1000-row chunk so earlier chunks survive a
/// later storage failure.
pub(crate) async fn insert_pairs(pool: &PgPool, pairs: &[NewPair]) -> Result<usize, sqlx::Error> {
    if pairs.is_empty() {
        return Ok(0);
    }

    let mut tx = pool.begin().await?;
    let mut inserted = 0usize;

    for p in pairs {
        let result = sqlx::query(
            "INSERT INTO forecast_observation_pairs
                 (forecast_id, observation_id, site_id, model_id, parameter_id,
                  forecast_run, valid_time, horizon, forecast_value, observed_value,
                  time_diff_minutes)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
             ON CONFLICT (forecast_id, observation_id) DO NOTHING",
        )
        .bind(p.forecast_id)
        .bind(p.observation_id)
        .bind(p.site_id)
        .bind(p.model_id)
        .bind(p.parameter_id)
        .bind(p.forecast_run)
        .bind(p.valid_time)
        .bind(p.horizon)
        .bind(p.forecast_value)
        .bind(p.observed_value)
        .bind(p.time_diff_minutes)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() > 0 {
            inserted += 1;
        }
    }

    tx.commit().await?;
    Ok(inserted)
}

// ---------------------------------------------------------------------------
// Deviation engine loads & inserts
// ---------------------------------------------------------------------------

/// Unprocessed pairs for a site in [start, end], oldest first.
pub(crate) async fn unprocessed_pairs_in_window(
    pool: &PgPool,
    site_id: i32,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<ForecastObservationPair>, sqlx::Error> {
    sqlx::query_as::<_, ForecastObservationPair>(
        "SELECT id, forecast_id, observation_id, site_id, model_id, parameter_id,
                forecast_run, valid_time, horizon, forecast_value, observed_value,
                time_diff_minutes, processed_at, created_at
         FROM forecast_observation_pairs
         WHERE site_id = $1
           AND valid_time >= $2 AND valid_time <= $3
           AND processed_at IS NULL
         ORDER BY valid_time",
    )
    .bind(site_id)
    .bind(start)
    .bind(end)
    .fetch_all(pool)
    .await
}

/// A deviation row produced by the deviation engine, ready for insert.
#[derive(Debug, Clone)]
pub(crate) struct NewDeviation {
    pub(crate) timestamp: DateTime<Utc>,
    pub(crate) site_id: i32,
    pub(crate) model_id: i32,
    pub(crate) parameter_id: i32,
    pub(crate) horizon: i32,
    pub(crate) forecast_value: Decimal,
    pub(crate) observed_value: Decimal,
    pub(crate) deviation: Decimal,
}

/// Insert one batch of deviations and stamp the source pairs as processed,
/// atomically. The stamp is what guarantees at-most-once reduction.
pub(crate) async fn insert_deviations_and_stamp(
    pool: &PgPool,
    deviations: &[NewDeviation],
    pair_ids: &[i32],
    processed_at: DateTime<Utc>,
) -> Result<usize, sqlx::Error> {
    if deviations.is_empty() {
        return Ok(0);
    }

    let mut tx = pool.begin().await?;
    let mut inserted = 0usize;

    for d in deviations {
        let result = sqlx::query(
            "INSERT INTO deviations
                 (timestamp, site_id, model_id, parameter_id, horizon,
                  forecast_value, observed_value, deviation)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (timestamp, site_id, model_id, parameter_id, horizon) DO NOTHING",
        )
        .bind(d.timestamp)
        .bind(d.site_id)
        .bind(d.model_id)
        .bind(d.parameter_id)
        .bind(d.horizon)
        .bind(d.forecast_value)
        .bind(d.observed_value)
        .bind(d.deviation)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() > 0 {
            inserted += 1;
        }
    }

    sqlx::query("UPDATE forecast_observation_pairs SET processed_at = $1 WHERE id = ANY($2)")
        .bind(processed_at)
        .bind(pair_ids)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(inserted)
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Distinct (model_id, parameter_id, horizon) cells with deviations for a
/// site in [start, end] — the cells whose accuracy metrics need a refresh
/// after a reduction pass.
pub(crate) async fn distinct_deviation_cells(
    pool: &PgPool,
    site_id: i32,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<(i32, i32, i32)>, sqlx::Error> {
    sqlx::query_as::<_, (i32, i32, i32)>(
        "SELECT DISTINCT model_id, parameter_id, horizon
         FROM deviations
         WHERE site_id = $1 AND timestamp >= $2 AND timestamp <= $3",
    )
    .bind(site_id)
    .bind(start)
    .bind(end)
    .fetch_all(pool)
    .await
}

/// SQL-side aggregate over the deviations of one
/// (model, site, parameter, horizon) cell.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct DeviationStatsRow {
    pub(crate) mae: Option<Decimal>,
    pub(crate) bias: Option<Decimal>,
    pub(crate) sample_size: i64,
    pub(crate) min_deviation: Option<Decimal>,
    pub(crate) max_deviation: Option<Decimal>,
    pub(crate) earliest: Option<DateTime<Utc>>,
    pub(crate) latest: Option<DateTime<Utc>>,
}

pub(crate) async fn deviation_stats(
    pool: &PgPool,
    model_id: i32,
    site_id: i32,
    parameter_id: i32,
    horizon: i32,
) -> Result<DeviationStatsRow, sqlx::Error> {
    sqlx::query_as::<_, DeviationStatsRow>(
        "SELECT AVG(ABS(deviation)) AS mae,
                AVG(deviation) AS bias,
                COUNT(*) AS sample_size,
                MIN(deviation) AS min_deviation,
                MAX(deviation) AS max_deviation,
                MIN(timestamp) AS earliest,
                MAX(timestamp) AS latest
         FROM deviations
         WHERE model_id = $1 AND site_id = $2 AND parameter_id = $3 AND horizon = $4",
    )
    .bind(model_id)
    .bind(site_id)
    .bind(parameter_id)
    .bind(horizon)
    .fetch_one(pool)
    .await
}

/// All deviation values for a cell (std-dev needs the raw sample).
pub(crate) async fn deviation_values(
    pool: &PgPool,
    model_id: i32,
    site_id: i32,
    parameter_id: i32,
    horizon: i32,
) -> Result<Vec<Decimal>, sqlx::Error> {
    sqlx::query_scalar::<_, Decimal>(
        "SELECT deviation FROM deviations
         WHERE model_id = $1 AND site_id = $2 AND parameter_id = $3 AND horizon = $4",
    )
    .bind(model_id)
    .bind(site_id)
    .bind(parameter_id)
    .bind(horizon)
    .fetch_all(pool)
    .await
}

/// Upsert parameters for an accuracy-metric cell.
#[derive(Debug, Clone)]
pub(crate) struct MetricUpsert {
    pub(crate) model_id: i32,
    pub(crate) site_id: i32,
    pub(crate) parameter_id: i32,
    pub(crate) horizon: i32,
    pub(crate) mae: Decimal,
    pub(crate) bias: Decimal,
    pub(crate) std_dev: Decimal,
    pub(crate) sample_size: i32,
    pub(crate) confidence_level: String,
    pub(crate) ci_lower: Option<Decimal>,
    pub(crate) ci_upper: Option<Decimal>,
    pub(crate) min_deviation: Decimal,
    pub(crate) max_deviation: Decimal,
}

/// Upsert on the (model, site, parameter, horizon) unique key;
/// `calculated_at` is refreshed on every write.
pub(crate) async fn upsert_accuracy_metric(
    pool: &PgPool,
    m: &MetricUpsert,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO accuracy_metrics
             (model_id, site_id, parameter_id, horizon, mae, bias, std_dev,
              sample_size, confidence_level, ci_lower, ci_upper,
              min_deviation, max_deviation, calculated_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, NOW())
         ON CONFLICT (model_id, site_id, parameter_id, horizon) DO UPDATE SET
             mae = EXCLUDED.mae,
             bias = EXCLUDED.bias,
             std_dev = EXCLUDED.std_dev,
             sample_size = EXCLUDED.sample_size,
             confidence_level = EXCLUDED.confidence_level,
             ci_lower = EXCLUDED.ci_lower,
             ci_upper = EXCLUDED.ci_upper,
             min_deviation = EXCLUDED.min_deviation,
             max_deviation = EXCLUDED.max_deviation,
             calculated_at = EXCLUDED.calculated_at",
    )
    .bind(m.model_id)
    .bind(m.site_id)
    .bind(m.parameter_id)
    .bind(m.horizon)
    .bind(m.mae)
    .bind(m.bias)
    .bind(m.std_dev)
    .bind(m.sample_size)
    .bind(&m.confidence_level)
    .bind(m.ci_lower)
    .bind(m.ci_upper)
    .bind(m.min_deviation)
    .bind(m.max_deviation)
    .execute(pool)
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Execution logs
// ---------------------------------------------------------------------------

/// Write one execution-log row. Failure here is logged but must not break
/// the collection it describes, so callers treat the error as non-fatal.
pub(crate) async fn save_execution_log(
    pool: &PgPool,
    job_id: &str,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    status: &str,
    records_collected: i32,
    records_persisted: i32,
    errors: &[String],
) -> Result<(), sqlx::Error> {
    let duration = (end_time - start_time).num_milliseconds() as f64 / 1000.0;
    let errors_json = if errors.is_empty() {
        None
    } else {
        Some(Json(errors.to_vec()))
    };

    sqlx::query(
        "INSERT INTO execution_logs
             (job_id, start_time, end_time, duration_seconds, status,
              records_collected, records_persisted, errors)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .bind(job_id)
    .bind(start_time)
    .bind(end_time)
    .bind(duration)
    .bind(status)
    .bind(records_collected)
    .bind(records_persisted)
    .bind(errors_json)
    .execute(pool)
    .await?;
    Ok(())
}

/// Execution history for a job, most recent first.
pub(crate) async fn execution_history(
    pool: &PgPool,
    job_id: &str,
    limit: i64,
) -> Result<Vec<ExecutionLog>, sqlx::Error> {
    sqlx::query_as::<_, ExecutionLog>(
        "SELECT id, job_id, start_time, end_time, duration_seconds, status,
                records_collected, records_persisted, errors
         FROM execution_logs
         WHERE job_id = $1
         ORDER BY start_time DESC
         LIMIT $2",
    )
    .bind(job_id)
    .bind(limit)
    .fetch_all(pool)
    .await
}
