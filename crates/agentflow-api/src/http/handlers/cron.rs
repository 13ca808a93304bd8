//! Cron preview handler: describe an expression and list upcoming runs.

use axum::extract::Query;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;

use agentflow_core::workflow::cron;

use crate::http::error::AppError;
use crate::http::extractors::auth::AuthUser;
use crate::http::extractors::query::CronDescribeQuery;
use crate::http::response::{ApiResponse, RequestTimer};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct CronPreview {
    pub expression: String,
    pub description: String,
    pub timezone: String,
    pub next_runs: Vec<DateTime<Utc>>,
}

/// Build the cron sub-router. Mounted at `/api/v1`.
pub fn cron_routes() -> Router<AppState> {
    Router::new().route("/cron/describe", get(describe))
}

/// GET /api/v1/cron/describe?expression=&timezone=&count=
pub async fn describe(
    _auth: AuthUser,
    Query(query): Query<CronDescribeQuery>,
) -> Result<Json<ApiResponse<CronPreview>>, AppError> {
    let timer = RequestTimer::start();
    let preview = preview(&query)?;
    Ok(Json(timer.respond(preview)))
}

fn preview(query: &CronDescribeQuery) -> Result<CronPreview, AppError> {
    let expr = cron::parse(&query.expression)?;
    let tz = cron::parse_timezone(&query.timezone)?;
    let next_runs = expr.next_runs(Utc::now(), tz, query.capped_count())?;
    Ok(CronPreview {
        expression: expr.as_str().to_string(),
        description: expr.describe(),
        timezone: query.timezone.clone(),
        next_runs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(expression: &str, timezone: &str, count: usize) -> CronDescribeQuery {
        CronDescribeQuery {
            expression: expression.to_string(),
            timezone: timezone.to_string(),
            count,
        }
    }

    #[test]
    fn test_preview_lists_ascending_runs() {
        let p = preview(&query("*/15 * * * *", "UTC", 3)).unwrap();
        assert_eq!(p.next_runs.len(), 3);
        assert!(p.next_runs.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(p.description, "every 15 minutes");
    }

    #[test]
    fn test_preview_caps_count() {
        let p = preview(&query("* * * * *", "UTC", 500)).unwrap();
        assert_eq!(p.next_runs.len(), 50);
    }

    #[test]
    fn test_preview_rejects_bad_input() {
        let err = preview(&query("61 * * * *", "UTC", 1)).unwrap_err().to_string();
        assert!(err.contains("minute"), "got: {err}");

        let err = preview(&query("0 9 * * *", "Mars/Olympus", 1)).unwrap_err().to_string();
        assert!(err.contains("timezone"), "got: {err}");
    }
}
