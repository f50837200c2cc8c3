use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::{json, Value};

use crate::{
    auth::require_user_id,
    error::AppResult,
    schemas::{
        validate_input, CreateReservationInput, ImportCalendarInput, ReservationPath,
        ReservationStatusInput, ReservationsQuery, UpdateReservationInput,
    },
    state::AppState,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/reservations",
            axum::routing::get(list_reservations).post(create_reservation),
        )
        .route(
            "/reservations/import-ical",
            axum::routing::post(import_ical),
        )
        .route(
            "/reservations/{reservation_id}",
            axum::routing::get(get_reservation).patch(update_reservation),
        )
        .route(
            "/reservations/{reservation_id}/status",
            axum::routing::post(transition_status),
        )
}

async fn list_reservations(
    State(state): State<AppState>,
    Query(query): Query<ReservationsQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    require_user_id(&state, &headers).await?;
    let page = state.reservations.find_all(query).await?;
    Ok(Json(json!(page)))
}

async fn create_reservation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateReservationInput>,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;
    validate_input(&payload)?;

    let created = state.reservations.create(payload).await?;
    let view = state.reservations.view(&created.reservation).await?;
    let status = if created.replayed {
        StatusCode::OK
    } else {
        tracing::debug!(user_id = %user_id, reservation_id = %view.id, "Reservation created via API");
        StatusCode::CREATED
    };
    Ok((status, Json(view)))
}

async fn get_reservation(
    State(state): State<AppState>,
    Path(path): Path<ReservationPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    require_user_id(&state, &headers).await?;
    let view = state.reservations.get(path.reservation_id).await?;
    Ok(Json(json!(view)))
}

async fn update_reservation(
    State(state): State<AppState>,
    Path(path): Path<ReservationPath>,
    headers: HeaderMap,
    Json(payload): Json<UpdateReservationInput>,
) -> AppResult<Json<Value>> {
    require_user_id(&state, &headers).await?;
    validate_input(&payload)?;
    let updated = state
        .reservations
        .update(path.reservation_id, payload)
        .await?;
    let view = state.reservations.view(&updated).await?;
    Ok(Json(json!(view)))
}

async fn transition_status(
    State(state): State<AppState>,
    Path(path): Path<ReservationPath>,
    headers: HeaderMap,
    Json(payload): Json<ReservationStatusInput>,
) -> AppResult<Json<Value>> {
    require_user_id(&state, &headers).await?;
    let updated = state
        .reservations
        .transition_status(path.reservation_id, payload.status)
        .await?;
    let view = state.reservations.view(&updated).await?;
    Ok(Json(json!(view)))
}

async fn import_ical(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<ImportCalendarInput>,
) -> AppResult<Json<Value>> {
    require_user_id(&state, &headers).await?;
    validate_input(&payload)?;
    let summary = state
        .reservations
        .import_from_external_calendar(payload)
        .await?;
    Ok(Json(json!(summary)))
}
