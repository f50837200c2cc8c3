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
        clamp_limit_in_range, validate_input, AvailabilityQuery, CalendarQuery,
        CreatePropertyInput, CreateSubUnitInput, PropertiesQuery, PropertyPath,
    },
    state::AppState,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/properties",
            axum::routing::get(list_properties).post(create_property),
        )
        .route(
            "/properties/{property_id}",
            axum::routing::get(get_property),
        )
        .route(
            "/properties/{property_id}/sub-units",
            axum::routing::get(list_sub_units).post(create_sub_unit),
        )
        .route(
            "/properties/{property_id}/calendar",
            axum::routing::get(month_calendar),
        )
        .route(
            "/properties/{property_id}/availability",
            axum::routing::get(availability),
        )
}

async fn list_properties(
    State(state): State<AppState>,
    Query(query): Query<PropertiesQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    require_user_id(&state, &headers).await?;
    let rows = state
        .properties
        .list_properties(clamp_limit_in_range(query.limit, 1, 500), query.offset.max(0))
        .await?;
    Ok(Json(json!({ "data": rows })))
}

async fn create_property(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreatePropertyInput>,
) -> AppResult<impl IntoResponse> {
    require_user_id(&state, &headers).await?;
    validate_input(&payload)?;
    let created = state.properties.create_property(payload).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_property(
    State(state): State<AppState>,
    Path(path): Path<PropertyPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    require_user_id(&state, &headers).await?;
    let property = state.properties.get_property(path.property_id).await?;
    let sub_units = state.properties.list_sub_units(path.property_id).await?;
    Ok(Json(json!({ "property": property, "sub_units": sub_units })))
}

async fn list_sub_units(
    State(state): State<AppState>,
    Path(path): Path<PropertyPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    require_user_id(&state, &headers).await?;
    let rows = state.properties.list_sub_units(path.property_id).await?;
    Ok(Json(json!({ "data": rows })))
}

async fn create_sub_unit(
    State(state): State<AppState>,
    Path(path): Path<PropertyPath>,
    headers: HeaderMap,
    Json(payload): Json<CreateSubUnitInput>,
) -> AppResult<impl IntoResponse> {
    require_user_id(&state, &headers).await?;
    validate_input(&payload)?;
    let created = state
        .properties
        .create_sub_unit(path.property_id, payload)
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn month_calendar(
    State(state): State<AppState>,
    Path(path): Path<PropertyPath>,
    Query(query): Query<CalendarQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    require_user_id(&state, &headers).await?;
    let property = state.properties.get_property(path.property_id).await?;
    let view = state
        .calendar
        .month_view(property.id, query.year, query.month)
        .await?;
    Ok(Json(json!(view)))
}

async fn availability(
    State(state): State<AppState>,
    Path(path): Path<PropertyPath>,
    Query(query): Query<AvailabilityQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    require_user_id(&state, &headers).await?;
    let property = state.properties.get_property(path.property_id).await?;
    let blocked = state
        .calendar
        .availability(property.id, query.from, query.to)
        .await?;
    Ok(Json(json!({
        "property_id": property.public_id,
        "from": query.from,
        "to": query.to,
        "blocked": blocked,
    })))
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use serde_json::json;
    use tower::ServiceExt;

    use crate::services::testing::{read_json, test_app};

    #[tokio::test]
    async fn creates_and_reads_property_with_calendar() {
        let (app, _) = test_app();
        let response = app
            .clone()
            .oneshot(
                Request::post("/properties")
                    .header("content-type", "application/json")
                    .header("x-user-id", "user-1")
                    .body(Body::from(
                        json!({
                            "name": "Casa Triana",
                            "address": "Calle Betis 3",
                            "city": "Sevilla",
                            "province": "Sevilla",
                            "tourism_license": "vft/se/9001",
                            "capacity": 4
                        })
                        .to_string(),
                    ))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = read_json(response).await;
        assert_eq!(created["tourism_license"], "VFT/SE/9001");
        let property_id = created["public_id"].as_str().expect("id").to_string();

        let response = app
            .oneshot(
                Request::get(format!(
                    "/properties/{property_id}/calendar?year=2024&month=2"
                ))
                .header("x-user-id", "user-1")
                .body(Body::empty())
                .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let view = read_json(response).await;
        assert_eq!(view["days_in_month"], 29);
        assert_eq!(view["occupancy_rate"], 0);
    }

    #[tokio::test]
    async fn rejects_requests_without_identity() {
        let (app, _) = test_app();
        let response = app
            .oneshot(Request::get("/properties").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn invalid_payload_is_unprocessable() {
        let (app, _) = test_app();
        let response = app
            .oneshot(
                Request::post("/properties")
                    .header("content-type", "application/json")
                    .header("x-user-id", "user-1")
                    .body(Body::from(
                        json!({
                            "name": "",
                            "address": "Calle Betis 3",
                            "city": "Sevilla",
                            "province": "Sevilla",
                            "tourism_license": "VFT/SE/9002",
                            "capacity": 0
                        })
                        .to_string(),
                    ))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
