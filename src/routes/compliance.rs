use axum::{
    extract::{Path, Query, State},
    http::{header::CONTENT_TYPE, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};

use crate::{
    auth::require_user_id,
    error::{AppError, AppResult},
    models::SubmissionFilter,
    schemas::{EvidenceQuery, ReservationPath},
    services::compliance::evidence_csv,
    state::AppState,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/compliance/submissions/{reservation_id}",
            axum::routing::post(create_submission),
        )
        .route("/compliance/evidence", axum::routing::get(evidence))
        .route("/compliance/connection", axum::routing::get(connection))
}

async fn create_submission(
    State(state): State<AppState>,
    Path(path): Path<ReservationPath>,
    headers: HeaderMap,
) -> AppResult<impl IntoResponse> {
    require_user_id(&state, &headers).await?;
    let reservation = state
        .store
        .get_reservation_by_public_id(path.reservation_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Reservation not found.".to_string()))?;
    let submission = state
        .compliance
        .create_submission(reservation.id, reservation.external_id.as_deref())
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "id": submission.public_id,
            "reservation_id": reservation.public_id,
            "state": submission.state,
            "attempts": submission.attempts,
            "max_attempts": submission.max_attempts,
            "reference": submission.reference,
        })),
    ))
}

async fn evidence(
    State(state): State<AppState>,
    Query(query): Query<EvidenceQuery>,
    headers: HeaderMap,
) -> AppResult<Response> {
    require_user_id(&state, &headers).await?;

    let property_id = match query.property_id {
        Some(public_id) => Some(state.properties.get_property(public_id).await?.id),
        None => None,
    };
    if let (Some(from), Some(to)) = (query.from, query.to) {
        if from > to {
            return Err(AppError::UnprocessableEntity(
                "from must not be after to.".to_string(),
            ));
        }
    }
    let filter = SubmissionFilter {
        property_id,
        created_from: query
            .from
            .and_then(|day| day.and_hms_opt(0, 0, 0))
            .map(|moment| moment.and_utc()),
        created_to: query
            .to
            .and_then(|day| day.and_hms_milli_opt(23, 59, 59, 999))
            .map(|moment| moment.and_utc()),
    };
    let records = state.compliance.evidence_export(&filter).await?;

    match query
        .format
        .as_deref()
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        None | Some("") | Some("json") => {
            Ok(Json(json!({ "data": records, "count": records.len() })).into_response())
        }
        Some("csv") => {
            let body = evidence_csv(&records)?;
            let mut response = body.into_response();
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/csv; charset=utf-8"),
            );
            Ok(response)
        }
        Some(other) => Err(AppError::BadRequest(format!(
            "Unsupported evidence format '{other}'."
        ))),
    }
}

async fn connection(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Json<Value>> {
    require_user_id(&state, &headers).await?;
    let reachable = state.compliance.test_connection().await;
    if !reachable {
        tracing::warn!(
            connector = state.compliance.connector_name(),
            "Guest registry connection test failed"
        );
    }
    Ok(Json(json!({
        "connector": state.compliance.connector_name(),
        "reachable": reachable,
    })))
}
