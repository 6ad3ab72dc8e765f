use crate::errors::{self, reject_anyhow, reject_enqueue, reject_error};
use crate::App;

use obi_protocol::common::{Submission, SubmissionId};
use obi_protocol::error::ErrorCode;
use obi_protocol::external::{CreateSubmissionOutput, CreateSubmissionRequest};

use std::convert::Infallible;
use std::sync::Arc;

use tracing::debug;
use validator::Validate;
use warp::http::StatusCode;
use warp::reply::{self, Response};
use warp::{Filter, Rejection, Reply};

const BODY_LIMIT: u64 = 64 * 1024;

macro_rules! impl_filter{
    () => {
        impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone + Send + Sync + 'static
    };
    ($($ty:ty,)+) => {
        impl Filter<Extract = ($($ty,)+), Error = Infallible> + Clone + Send + Sync + 'static
    };
}

pub fn routes(app: Arc<App>) -> impl_filter!() {
    let prefix = warp::path("v1");
    prefix
        .and(submission_routes(&app).or(problem_routes(&app)))
        .recover(errors::recover)
}

fn submission_routes(app: &Arc<App>) -> impl_filter!() {
    let prefix = warp::path("submissions");

    let create = warp::path::end()
        .and(warp::post())
        .and(warp::body::content_length_limit(BODY_LIMIT))
        .and(with_app(app))
        .and(warp::body::json())
        .and_then(create_submission);

    let status = warp::path::param()
        .and(warp::path::end())
        .and(warp::get())
        .and(with_app(app))
        .and_then(get_submission);

    let cancel = warp::path::param()
        .and(warp::path::end())
        .and(warp::delete())
        .and(with_app(app))
        .and_then(cancel_submission);

    prefix.and(create.or(status).or(cancel))
}

fn problem_routes(app: &Arc<App>) -> impl_filter!() {
    warp::path("problems")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_app(app))
        .map(|app: Arc<App>| reply::json(&app.engine.store().list()))
}

fn with_app(app: &Arc<App>) -> impl_filter!(Arc<App>,) {
    let app = app.clone();
    warp::any().map(move || app.clone())
}

/// POST /v1/submissions
/// JSON: CreateSubmissionRequest => CreateSubmissionOutput
async fn create_submission(
    app: Arc<App>,
    body: CreateSubmissionRequest,
) -> Result<Response, Rejection> {
    if let Err(err) = body.validate() {
        return Err(reject_error(
            ErrorCode::InvalidRequest,
            Some(err.to_string()),
        ));
    }

    let problem = app
        .engine
        .store()
        .problem(&body.problem_id)
        .map_err(reject_anyhow)?
        .ok_or_else(|| {
            let msg = format!("problem {} does not exist", body.problem_id);
            reject_error(ErrorCode::NotFound, Some(msg))
        })?;

    // a client may tighten the problem's limits, never loosen them
    let time_limit = clamp_limit(body.time_limit, problem.time_limit);
    let memory_limit = clamp_limit(body.memory_limit, problem.memory_limit);
    let submission = Submission::new(
        body.language,
        body.source,
        body.problem_id,
        time_limit,
        memory_limit,
    );

    let id = app.engine.enqueue(submission).map_err(reject_enqueue)?;
    debug!(submission_id = %id, "submission accepted");

    let output = CreateSubmissionOutput { id };
    Ok(reply::with_status(reply::json(&output), StatusCode::CREATED).into_response())
}

/// GET /v1/submissions/{id}
async fn get_submission(id: SubmissionId, app: Arc<App>) -> Result<Response, Rejection> {
    match app.engine.status(id) {
        Some(verdict) => Ok(reply::json(&verdict).into_response()),
        None => Err(not_found(id)),
    }
}

/// DELETE /v1/submissions/{id}
async fn cancel_submission(id: SubmissionId, app: Arc<App>) -> Result<Response, Rejection> {
    match app.engine.cancel(id) {
        Some(verdict) => Ok(reply::json(&verdict).into_response()),
        None => Err(not_found(id)),
    }
}

fn clamp_limit(requested: Option<u64>, ceiling: u64) -> u64 {
    requested.map_or(ceiling, |limit| limit.min(ceiling))
}

fn not_found(id: SubmissionId) -> Rejection {
    let msg = format!("submission {} does not exist", id);
    reject_error(ErrorCode::NotFound, Some(msg))
}
