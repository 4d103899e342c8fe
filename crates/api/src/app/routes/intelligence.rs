use std::sync::Arc;

use axum::{
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use serde_json::json;

use larder_infra::jobs::{wait_until_finished, AiAction, JobPayload, JobState};

use crate::app::{dto, errors, services::AppServices};
use crate::context::OwnerContext;

pub fn router() -> Router {
    Router::new().route("/waste-prediction", post(waste_prediction))
}

/// Enqueue an `ANALYZE_WASTE` job and wait for it inline.
///
/// On timeout the job keeps running; the 504 names the job id so the caller
/// can poll `/jobs/ai-analysis/{id}` instead.
pub async fn waste_prediction(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(owner): Extension<OwnerContext>,
    Json(body): Json<dto::WastePredictionRequest>,
) -> axum::response::Response {
    let payload = JobPayload::AiAnalysis(AiAction::AnalyzeWaste { data: body.data });
    if let Err(e) = payload.validate() {
        return errors::domain_error_to_response(e);
    }

    let job_id = match services.queue.enqueue(owner.owner_id(), payload).await {
        Ok(id) => id,
        Err(e) => return errors::queue_error_to_response(e),
    };

    let job = match wait_until_finished(services.queue.as_ref(), job_id, services.wait_timeout).await {
        Ok(job) => job,
        Err(e) => return errors::wait_error_to_response(e),
    };

    match job.state {
        JobState::Completed => Json(json!({
            "job_id": job.id,
            "prediction": job.result,
        }))
        .into_response(),
        _ => errors::json_error(
            StatusCode::BAD_GATEWAY,
            "analysis_failed",
            job.failure_reason.unwrap_or_else(|| "analysis failed".to_string()),
        ),
    }
}
