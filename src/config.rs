/// Application configuration, parsed from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    /// Bearer token for the Météo-France AROME endpoint. Absence is
    /// tolerated: collection proceeds unauthenticated (and usually fails,
    /// cleanly).
    pub meteofrance_api_token: Option<String>,
    pub scheduler_enabled: bool,
    /// UTC hours at which the forecast collection job fires.
    pub forecast_hours: Vec<u8>,
    /// UTC hours at which the observation collection job fires.
    pub observation_hours: Vec<u8>,
    /// UTC hours at which the matching/deviation reconciliation job fires.
    pub reconcile_hours: Vec<u8>,
    /// Runtime environment tag; "production" switches tracing to JSON output.
    pub environment: Environment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").expect("DATABASE_URL must be set"),
            meteofrance_api_token: std::env::var("METEOFRANCE_API_TOKEN")
                .ok()
                .filter(|t| !t.is_empty()),
            scheduler_enabled: std::env::var("SCHEDULER_ENABLED")
                .map(|v| v.to_lowercase() == "true")
                .unwrap_or(true),
            forecast_hours: parse_hours(
                &std::env::var("SCHEDULER_FORECAST_HOURS").unwrap_or_else(|_| "0,6,12,18".into()),
            ),
            observation_hours: parse_hours(
                &std::env::var("SCHEDULER_OBSERVATION_HOURS")
                    .unwrap_or_else(|_| "8,10,12,14,16,18".into()),
            ),
            reconcile_hours: parse_hours(
                &std::env::var("SCHEDULER_RECONCILE_HOURS").unwrap_or_else(|_| "1,7,13,19".into()),
            ),
            environment: match std::env::var("ENVIRONMENT").as_deref() {
                Ok("production") => Environment::Production,
                _ => Environment::Development,
            },
        }
    }
}

/// Parse a comma-separated UTC hour list (e.g. "0,6,12,18"). Entries that
/// are not valid hours are skipped with a warning.
fn parse_hours(hours: &str) -> Vec<u8> {
    hours
        .split(',')
        .filter_map(|part| {
            let part = part.trim();
            if part.is_empty() {
                return None;
            }
            match part.parse::<u8>() {
                Ok(h) if h < 24 => Some(h),
                _ => {
                    tracing::warn!("Ignoring invalid scheduler hour '{}'", part);
                    None
                }
            }
        })
        .collect()
}
