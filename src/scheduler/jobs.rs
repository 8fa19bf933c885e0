//! Scheduled job bodies for data collection.
//!
//! Two jobs: forecast collection (AROME + Meteo-Parapente) and observation
//! collection (ROMMA + FFVL). Both walk every configured site sequentially
//! per source — the per-source rate limiters rely on that — persist
//! whatever came back with upsert-or-ignore semantics, and always finish
//! by writing an ExecutionLog row.
//!
//! Error policy: a collector failure for one site or source is recorded
//! and collection continues. A primary-beacon failure that the backup
//! beacon recovers is kept in the log's error list but does not change a
//! successful status. Status is `success` with no hard failures, `partial`
//! when something failed but data was still collected, `failed` when
//! everything did.

use std::sync::Arc;

use chrono::{DateTime, DurationRound, Timelike, Utc};
use sqlx::PgPool;

use crate::collectors::arome::AromeCollector;
use crate::collectors::ffvl::FfvlCollector;
use crate::collectors::meteo_parapente::MeteoParapenteCollector;
use crate::collectors::romma::RommaCollector;
use crate::collectors::{Collector, ForecastRequest, ObservationRequest, ParameterIds};
use crate::db::models::Site;
use crate::db::queries;
use crate::helpers::dec_to_f64;

pub const FORECAST_JOB_ID: &str = "collect_forecasts";
pub const OBSERVATION_JOB_ID: &str = "collect_observations";
pub const RECONCILE_JOB_ID: &str = "process_deviations";

/// How far back the reconciliation job looks for unmatched forecasts and
/// unprocessed pairs.
const RECONCILE_WINDOW_HOURS: i64 = 48;

/// Hour spacing of AROME/Meteo-Parapente model runs (00/06/12/18 UTC).
const MODEL_RUN_INTERVAL_HOURS: u32 = 6;

/// Everything the jobs need, constructed once at startup and shared.
#[derive(Clone)]
pub struct JobContext {
    pub pool: PgPool,
    pub arome: Arc<AromeCollector>,
    pub meteo_parapente: Arc<MeteoParapenteCollector>,
    pub romma: Arc<RommaCollector>,
    pub ffvl: Arc<FfvlCollector>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Success,
    Partial,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Success => "success",
            JobStatus::Partial => "partial",
            JobStatus::Failed => "failed",
        }
    }
}

/// What one job run did; the same data lands in the execution log.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub status: JobStatus,
    pub records_collected: usize,
    pub records_persisted: usize,
    pub duration_seconds: f64,
    pub errors: Vec<String>,
}

/// Accumulates counts and failures while a job walks sites and sources.
#[derive(Debug, Default)]
struct JobProgress {
    collected: usize,
    persisted: usize,
    /// All messages for the execution log, recovered failures included.
    errors: Vec<String>,
    /// Failures that were not recovered; these degrade the status.
    hard_failures: usize,
}

impl JobProgress {
    fn status(&self) -> JobStatus {
        if self.hard_failures == 0 {
            JobStatus::Success
        } else if self.collected > 0 {
            JobStatus::Partial
        } else {
            JobStatus::Failed
        }
    }

    fn record_hard_failure(&mut self, message: String) {
        tracing::error!("{}", message);
        self.errors.push(message);
        self.hard_failures += 1;
    }
}

/// The most recent model run at or before `now` (00/06/12/18 UTC).
pub fn latest_model_run(now: DateTime<Utc>) -> DateTime<Utc> {
    let on_hour = now
        .duration_trunc(chrono::Duration::hours(1))
        .unwrap_or(now);
    let offset = on_hour.hour() % MODEL_RUN_INTERVAL_HOURS;
    on_hour - chrono::Duration::hours(i64::from(offset))
}

/// Load the parameter-id map, keyed by the known parameter names.
async fn load_parameter_ids(pool: &PgPool) -> Result<ParameterIds, String> {
    let by_name = queries::parameter_ids_by_name(pool)
        .await
        .map_err(|e| format!("Failed to load parameters: {e}"))?;

    let get = |name: &str| {
        by_name
            .get(name)
            .copied()
            .ok_or_else(|| format!("Parameter '{name}' not configured"))
    };
    Ok(ParameterIds {
        wind_speed: get("wind_speed")?,
        wind_direction: get("wind_direction")?,
        temperature: get("temperature")?,
    })
}

// ---------------------------------------------------------------------------
// Forecast collection
// ---------------------------------------------------------------------------

/// Collect forecasts from all configured sources and persist them.
pub async fn collect_all_forecasts(ctx: &JobContext) -> JobOutcome {
    let start_time = Utc::now();
    let mut progress = JobProgress::default();

    tracing::info!("Starting forecast collection at {}", start_time);

    let sites = match queries::list_sites(&ctx.pool).await {
        Ok(sites) => sites,
        Err(e) => {
            progress.record_hard_failure(format!("Failed to load site configurations: {e}"));
            return finalize(ctx, FORECAST_JOB_ID, start_time, progress).await;
        }
    };
    let parameter_ids = match load_parameter_ids(&ctx.pool).await {
        Ok(ids) => ids,
        Err(e) => {
            progress.record_hard_failure(e);
            return finalize(ctx, FORECAST_JOB_ID, start_time, progress).await;
        }
    };

    let forecast_run = latest_model_run(start_time);
    let sources: [(&str, &dyn Collector); 2] = [
        ("Meteo-Parapente", ctx.meteo_parapente.as_ref()),
        ("AROME", ctx.arome.as_ref()),
    ];

    for (model_name, collector) in sources {
        let model_id = match queries::model_id_by_name(&ctx.pool, model_name).await {
            Ok(Some(id)) => id,
            Ok(None) => {
                progress.record_hard_failure(format!("Model '{model_name}' not configured"));
                continue;
            }
            Err(e) => {
                progress.record_hard_failure(format!("Failed to look up model '{model_name}': {e}"));
                continue;
            }
        };

        for site in &sites {
            let request = ForecastRequest {
                site_id: site.id,
                model_id,
                forecast_run,
                latitude: dec_to_f64(site.latitude),
                longitude: dec_to_f64(site.longitude),
                parameter_ids,
            };

            match collector.collect_forecast(&request).await {
                Ok(points) => {
                    tracing::info!(
                        "{}: Collected {} records for {}",
                        model_name,
                        points.len(),
                        site.name,
                    );
                    progress.collected += points.len();
                    if !points.is_empty() {
                        match queries::insert_forecasts(&ctx.pool, &points, model_name).await {
                            Ok((_, inserted)) => progress.persisted += inserted,
                            Err(e) => progress.record_hard_failure(format!(
                                "{model_name} persistence failed for {}: {e}",
                                site.name
                            )),
                        }
                    }
                }
                Err(e) => progress.record_hard_failure(format!(
                    "{model_name} collection failed for {}: {e}",
                    site.name
                )),
            }
        }
    }

    finalize(ctx, FORECAST_JOB_ID, start_time, progress).await
}

// ---------------------------------------------------------------------------
// Observation collection
// ---------------------------------------------------------------------------

/// Collect observations from all configured beacon networks and persist
/// them, falling back to each site's backup beacon when the primary
/// yields nothing.
pub async fn collect_all_observations(ctx: &JobContext) -> JobOutcome {
    let start_time = Utc::now();
    let mut progress = JobProgress::default();

    tracing::info!("Starting observation collection at {}", start_time);

    let sites = match queries::list_sites(&ctx.pool).await {
        Ok(sites) => sites,
        Err(e) => {
            progress.record_hard_failure(format!("Failed to load site configurations: {e}"));
            return finalize(ctx, OBSERVATION_JOB_ID, start_time, progress).await;
        }
    };
    let parameter_ids = match load_parameter_ids(&ctx.pool).await {
        Ok(ids) => ids,
        Err(e) => {
            progress.record_hard_failure(e);
            return finalize(ctx, OBSERVATION_JOB_ID, start_time, progress).await;
        }
    };

    for site in &sites {
        collect_site_observations(
            ctx,
            ctx.romma.as_ref(),
            site,
            site.romma_beacon_id,
            site.romma_beacon_id_backup,
            parameter_ids,
            &mut progress,
        )
        .await;
    }

    for site in &sites {
        collect_site_observations(
            ctx,
            ctx.ffvl.as_ref(),
            site,
            site.ffvl_beacon_id,
            site.ffvl_beacon_id_backup,
            parameter_ids,
            &mut progress,
        )
        .await;
    }

    finalize(ctx, OBSERVATION_JOB_ID, start_time, progress).await
}

/// Collect one site's observations from one network, trying the backup
/// beacon when the primary errored or returned zero rows. A primary
/// failure recovered by the backup is logged but not counted as a hard
/// failure.
async fn collect_site_observations(
    ctx: &JobContext,
    collector: &dyn Collector,
    site: &Site,
    primary: Option<i32>,
    backup: Option<i32>,
    parameter_ids: ParameterIds,
    progress: &mut JobProgress,
) {
    let network = collector.name();

    if primary.is_none() && backup.is_none() {
        tracing::warn!("No {} beacons configured for {}", network, site.name);
        return;
    }

    let mut collected = false;
    let mut primary_error: Option<String> = None;

    if let Some(beacon_id) = primary {
        let request = ObservationRequest {
            site_id: site.id,
            observation_time: Utc::now(),
            beacon_id: Some(beacon_id),
            parameter_ids,
        };
        match collector.collect_observation(&request).await {
            Ok(points) => {
                tracing::info!(
                    "{}: Collected {} records for {} (primary beacon_id={})",
                    network,
                    points.len(),
                    site.name,
                    beacon_id,
                );
                if !points.is_empty() {
                    progress.collected += points.len();
                    match queries::insert_observations(&ctx.pool, &points, network).await {
                        Ok((_, inserted)) => {
                            progress.persisted += inserted;
                            collected = true;
                        }
                        Err(e) => progress.record_hard_failure(format!(
                            "{network} persistence failed for {}: {e}",
                            site.name
                        )),
                    }
                }
            }
            Err(e) => {
                let message = format!("{network} primary beacon failed for {}: {e}", site.name);
                tracing::warn!("{}", message);
                if backup.is_some() {
                    tracing::info!("Trying {} backup beacon {:?}", network, backup);
                    primary_error = Some(message);
                } else {
                    progress.record_hard_failure(message);
                }
            }
        }
    }

    if !collected {
        if let Some(beacon_id) = backup {
            let request = ObservationRequest {
                site_id: site.id,
                observation_time: Utc::now(),
                beacon_id: Some(beacon_id),
                parameter_ids,
            };
            match collector.collect_observation(&request).await {
                Ok(points) => {
                    tracing::info!(
                        "{}: Collected {} records for {} (backup beacon_id={})",
                        network,
                        points.len(),
                        site.name,
                        beacon_id,
                    );
                    if !points.is_empty() {
                        progress.collected += points.len();
                        match queries::insert_observations(&ctx.pool, &points, network).await {
                            Ok((_, inserted)) => progress.persisted += inserted,
                            Err(e) => progress.record_hard_failure(format!(
                                "{network} persistence failed for {}: {e}",
                                site.name
                            )),
                        }
                    }
                    // Backup answered: the primary failure stays on record
                    // without degrading the run
                    if let Some(message) = primary_error.take() {
                        progress.errors.push(message);
                    }
                }
                Err(e) => {
                    if let Some(message) = primary_error.take() {
                        progress.errors.push(message);
                        progress.hard_failures += 1;
                    }
                    progress.record_hard_failure(format!(
                        "{network} backup beacon also failed for {}: {e}",
                        site.name
                    ));
                }
            }
        } else if let Some(message) = primary_error.take() {
            // Primary failed and no backup exists
            progress.record_hard_failure(message);
        }
    }
}

// ---------------------------------------------------------------------------
// Matching & deviation reconciliation
// ---------------------------------------------------------------------------

/// Run the matching and deviation engines over every site for the recent
/// window, turning staged forecasts and observations into pairs and pairs
/// into deviations. Idempotent by construction (pair uniqueness plus the
/// processed_at gate), so overlapping windows across runs are safe.
///
/// In the outcome, `records_collected` counts pairs created and
/// `records_persisted` counts deviations written.
pub async fn reconcile_all_sites(ctx: &JobContext) -> JobOutcome {
    let start_time = Utc::now();
    let mut progress = JobProgress::default();

    tracing::info!("Starting pair/deviation reconciliation at {}", start_time);

    let sites = match queries::list_sites(&ctx.pool).await {
        Ok(sites) => sites,
        Err(e) => {
            progress.record_hard_failure(format!("Failed to load site configurations: {e}"));
            return finalize(ctx, RECONCILE_JOB_ID, start_time, progress).await;
        }
    };

    let window_start = start_time - chrono::Duration::hours(RECONCILE_WINDOW_HOURS);
    let matcher = crate::services::matching::MatchingEngine::default();
    let deviation_engine = crate::services::deviation::DeviationEngine::default();

    for site in &sites {
        match matcher
            .match_forecasts_to_observations(&ctx.pool, site.id, window_start, start_time)
            .await
        {
            Ok(outcome) => {
                tracing::info!(
                    "Matcher: {} pairs created, {} forecasts unmatched for {}",
                    outcome.pairs_created,
                    outcome.forecasts_unmatched,
                    site.name,
                );
                progress.collected += outcome.pairs_created;
            }
            Err(e) => {
                progress.record_hard_failure(format!("Matching failed for {}: {e}", site.name));
                continue;
            }
        }

        match deviation_engine
            .process_pairs(&ctx.pool, site.id, window_start, start_time)
            .await
        {
            Ok(created) => {
                tracing::info!("Deviation engine: {} deviations for {}", created, site.name);
                progress.persisted += created;
            }
            Err(e) => {
                progress
                    .record_hard_failure(format!("Deviation reduction failed for {}: {e}", site.name));
                continue;
            }
        }

        refresh_site_metrics(ctx, site, window_start, start_time, &mut progress).await;
    }

    finalize(ctx, RECONCILE_JOB_ID, start_time, progress).await
}

/// Recompute accuracy metrics for every cell the window's deviations
/// touch. One failed cell is recorded and the rest continue.
async fn refresh_site_metrics(
    ctx: &JobContext,
    site: &Site,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    progress: &mut JobProgress,
) {
    let cells =
        match queries::distinct_deviation_cells(&ctx.pool, site.id, window_start, window_end).await
        {
            Ok(cells) => cells,
            Err(e) => {
                progress.record_hard_failure(format!(
                    "Failed to list metric cells for {}: {e}",
                    site.name
                ));
                return;
            }
        };

    let engine = crate::services::metrics::MetricsEngine;
    for (model_id, parameter_id, horizon) in cells {
        // Negative horizons are stored but have no metric cell
        if horizon < 0 {
            continue;
        }
        let report = match engine
            .calculate_accuracy_metrics(&ctx.pool, model_id, site.id, parameter_id, horizon)
            .await
        {
            Ok(report) => report,
            Err(e) => {
                progress.record_hard_failure(format!(
                    "Metrics calculation failed for {} (model={model_id}, param={parameter_id}, horizon={horizon}): {e}",
                    site.name
                ));
                continue;
            }
        };
        tracing::debug!("{}", report.confidence_message());
        if let Err(e) = engine.save_metrics(&ctx.pool, &report).await {
            progress.record_hard_failure(format!(
                "Metrics upsert failed for {} (model={model_id}, param={parameter_id}, horizon={horizon}): {e}",
                site.name
            ));
        }
    }
}

/// Write the execution log and build the outcome. Log failures are
/// swallowed — observability must not break collection.
async fn finalize(
    ctx: &JobContext,
    job_id: &str,
    start_time: DateTime<Utc>,
    progress: JobProgress,
) -> JobOutcome {
    let end_time = Utc::now();
    let status = progress.status();

    if let Err(e) = queries::save_execution_log(
        &ctx.pool,
        job_id,
        start_time,
        end_time,
        status.as_str(),
        progress.collected as i32,
        progress.persisted as i32,
        &progress.errors,
    )
    .await
    {
        tracing::error!("Failed to save execution log for {}: {}", job_id, e);
    }

    let duration_seconds = (end_time - start_time).num_milliseconds() as f64 / 1000.0;
    tracing::info!(
        "{} complete: {} collected, {} persisted in {:.2}s (status: {})",
        job_id,
        progress.collected,
        progress.persisted,
        duration_seconds,
        status.as_str(),
    );

    JobOutcome {
        status,
        records_collected: progress.collected,
        records_persisted: progress.persisted,
        duration_seconds,
        errors: progress.errors,
    }
}
