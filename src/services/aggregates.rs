//! Pre-aggregated time-bucket roll-ups over the deviations table.
//!
//! Daily, weekly and monthly continuous aggregates (`time_bucket` views)
//! keep the same statistics as the on-demand metrics engine, grouped by
//! (bucket, site, model, parameter, horizon). Their refresh policy is
//! time-based and owned by the storage layer; this service only queries
//! them and exposes the manual refresh entry point.
//!
//! Requires PostgreSQL with the TimescaleDB extension; anything else gets
//! a clear error instead of a silent degradation.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;

use crate::errors::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateWindow {
    Daily,
    Weekly,
    Monthly,
}

impl AggregateWindow {
    /// Continuous-aggregate view backing this window.
    pub fn view_name(self) -> &'static str {
        match self {
            AggregateWindow::Daily => "daily_accuracy_metrics",
            AggregateWindow::Weekly => "weekly_accuracy_metrics",
            AggregateWindow::Monthly => "monthly_accuracy_metrics",
        }
    }
}

/// One roll-up row from a continuous aggregate.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AggregateMetrics {
    pub bucket: DateTime<Utc>,
    pub site_id: i32,
    pub model_id: i32,
    pub parameter_id: i32,
    pub horizon: i32,
    pub mae: Option<Decimal>,
    pub bias: Option<Decimal>,
    pub std_dev: Option<Decimal>,
    pub sample_size: i64,
    pub min_deviation: Option<Decimal>,
    pub max_deviation: Option<Decimal>,
}

/// Filters for a roll-up query. `site_id` is required; everything else is
/// optional narrowing.
#[derive(Debug, Clone)]
pub struct AggregateQuery {
    pub site_id: i32,
    pub model_id: Option<i32>,
    pub parameter_id: Option<i32>,
    pub horizon: Option<i32>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: i64,
}

impl AggregateQuery {
    pub fn for_site(site_id: i32) -> Self {
        Self {
            site_id,
            model_id: None,
            parameter_id: None,
            horizon: None,
            start: None,
            end: None,
            limit: 100,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AggregateService;

impl AggregateService {
    /// Whether the TimescaleDB extension is installed.
    pub async fn timescaledb_available(&self, pool: &PgPool) -> Result<bool, AppError> {
        let available = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM pg_extension WHERE extname = 'timescaledb')",
        )
        .fetch_one(pool)
        .await?;
        Ok(available)
    }

    async fn ensure_timescaledb(&self, pool: &PgPool) -> Result<(), AppError> {
        if !self.timescaledb_available(pool).await? {
            return Err(AppError::InternalError(
                "TimescaleDB extension required: continuous aggregates are only \
                 available on PostgreSQL with TimescaleDB"
                    .into(),
            ));
        }
        Ok(())
    }

    /// Query one roll-up view with the given filters, newest bucket first.
    pub async fn query_metrics(
        &self,
        pool: &PgPool,
        window: AggregateWindow,
        query: &AggregateQuery,
    ) -> Result<Vec<AggregateMetrics>, AppError> {
        self.ensure_timescaledb(pool).await?;

        // The view name comes from the AggregateWindow enum, never from
        // input; the filters are all bound parameters.
        let sql = format!(
            "SELECT bucket, site_id, model_id, parameter_id, horizon,
                    mae, bias, std_dev, sample_size, min_deviation, max_deviation
             FROM {}
             WHERE site_id = $1
               AND ($2::int IS NULL OR model_id = $2)
               AND ($3::int IS NULL OR parameter_id = $3)
               AND ($4::int IS NULL OR horizon = $4)
               AND ($5::timestamptz IS NULL OR bucket >= $5)
               AND ($6::timestamptz IS NULL OR bucket <= $6)
             ORDER BY bucket DESC
             LIMIT $7",
            window.view_name(),
        );

        let rows = sqlx::query_as::<_, AggregateMetrics>(&sql)
            .bind(query.site_id)
            .bind(query.model_id)
            .bind(query.parameter_id)
            .bind(query.horizon)
            .bind(query.start)
            .bind(query.end)
            .bind(query.limit)
            .fetch_all(pool)
            .await?;
        Ok(rows)
    }

    /// Manually refresh one continuous aggregate, optionally bounded to a
    /// window. `None` bounds refresh the whole view.
    pub async fn refresh_aggregate(
        &self,
        pool: &PgPool,
        window: AggregateWindow,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<(), AppError> {
        self.ensure_timescaledb(pool).await?;

        let sql = format!(
            "CALL refresh_continuous_aggregate('{}', $1, $2)",
            window.view_name(),
        );
        sqlx::query(&sql).bind(start).bind(end).execute(pool).await?;

        tracing::info!("Refreshed continuous aggregate: {}", window.view_name());
        Ok(())
    }

    /// Refresh all three roll-up views.
    pub async fn refresh_all(
        &self,
        pool: &PgPool,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<(), AppError> {
        for window in [
            AggregateWindow::Daily,
            AggregateWindow::Weekly,
            AggregateWindow::Monthly,
        ] {
            self.refresh_aggregate(pool, window, start, end).await?;
        }
        tracing::info!("Refreshed all continuous aggregates");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_view_names() {
        assert_eq!(AggregateWindow::Daily.view_name(), "daily_accuracy_metrics");
        assert_eq!(
            AggregateWindow::Weekly.view_name(),
            "weekly_accuracy_metrics"
        );
        assert_eq!(
            AggregateWindow::Monthly.view_name(),
            "monthly_accuracy_metrics"
        );
    }

    #[test]
    fn test_query_defaults() {
        let q = AggregateQuery::for_site(3);
        assert_eq!(q.site_id, 3);
        assert_eq!(q.limit, 100);
        assert!(q.model_id.is_none() && q.horizon.is_none());
    }
}
