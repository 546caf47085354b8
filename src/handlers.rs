use std::sync::Arc;

use actix_web::{web, HttpResponse, Result as ActixResult};
use serde_json::json;

use crate::error::ApiError;
use crate::metrics::ProcessingMetrics;
use crate::roads::RoadsAggregator;
use crate::weather_agg::WeatherAggregator;

#[derive(Clone)]
pub struct AppState {
    pub roads: Arc<RoadsAggregator>,
    pub weather: Arc<WeatherAggregator>,
    pub metrics: Arc<ProcessingMetrics>,
}

pub async fn list_roads(data: web::Data<AppState>) -> ActixResult<HttpResponse> {
    match data.roads.list_roads().await {
        Ok(response) => Ok(HttpResponse::Ok().json(response)),
        Err(e) => {
            tracing::error!("listing roads failed: {e}");
            Ok(error_response(&e))
        }
    }
}

pub async fn get_road(
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> ActixResult<HttpResponse> {
    let road_id = path.into_inner();
    match data.roads.get_road(&road_id).await {
        Ok(response) => Ok(HttpResponse::Ok().json(response)),
        Err(e) => {
            tracing::error!("getting road {road_id} failed: {e}");
            Ok(error_response(&e))
        }
    }
}

pub async fn list_weather(data: web::Data<AppState>) -> ActixResult<HttpResponse> {
    match data.weather.list_weather().await {
        Ok(response) => Ok(HttpResponse::Ok().json(response)),
        Err(e) => {
            tracing::error!("listing weather failed: {e}");
            Ok(error_response(&e))
        }
    }
}

pub async fn get_location_weather(
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> ActixResult<HttpResponse> {
    let location_id = path.into_inner();
    match data.weather.get_location_weather(&location_id).await {
        Ok(response) => Ok(HttpResponse::Ok().json(response)),
        Err(e) => {
            tracing::error!("getting weather for {location_id} failed: {e}");
            Ok(error_response(&e))
        }
    }
}

pub async fn list_weather_alerts(data: web::Data<AppState>) -> ActixResult<HttpResponse> {
    match data.weather.list_alerts().await {
        Ok(response) => Ok(HttpResponse::Ok().json(response)),
        Err(e) => {
            tracing::error!("listing weather alerts failed: {e}");
            Ok(error_response(&e))
        }
    }
}

pub async fn get_metrics(data: web::Data<AppState>) -> ActixResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(data.metrics.snapshot()))
}

pub async fn health_check() -> ActixResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(json!({
        "status": "healthy",
        "service": "road-conditions-api",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now(),
    })))
}

/// Maps the error taxonomy onto response statuses. Upstream trouble is a
/// gateway-class failure; the caller's own mistakes are 4xx.
fn error_response(error: &ApiError) -> HttpResponse {
    let body = json!({
        "error": error_kind(error),
        "message": error.to_string(),
    });

    match error {
        ApiError::NotFound(_) => HttpResponse::NotFound().json(body),
        ApiError::Validation(_) => HttpResponse::BadRequest().json(body),
        ApiError::Unavailable(_) => HttpResponse::ServiceUnavailable().json(body),
        ApiError::RateLimited(_) => HttpResponse::TooManyRequests().json(body),
        ApiError::Timeout(_) => HttpResponse::GatewayTimeout().json(body),
        ApiError::Provider(_) | ApiError::Auth(_) | ApiError::Parse(_) | ApiError::Schema(_) => {
            HttpResponse::BadGateway().json(body)
        }
    }
}

fn error_kind(error: &ApiError) -> &'static str {
    match error {
        ApiError::Validation(_) => "validation",
        ApiError::Provider(_) => "provider",
        ApiError::RateLimited(_) => "rate_limited",
        ApiError::Auth(_) => "auth",
        ApiError::Timeout(_) => "timeout",
        ApiError::Parse(_) => "parse",
        ApiError::Schema(_) => "schema",
        ApiError::NotFound(_) => "not_found",
        ApiError::Unavailable(_) => "unavailable",
    }
}
