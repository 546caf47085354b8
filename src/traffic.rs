use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{ApiError, Result};
use crate::geo::Coordinate;

const DEFAULT_BASE_URL: &str = "https://routes.googleapis.com/directions/v2:computeRoutes";

/// Field mask the provider requires on every computeRoutes call. Requests
/// without one are rejected upstream, so an empty mask fails before sending.
const FIELD_MASK: &str = "routes.duration,routes.staticDuration,routes.distanceMeters,\
routes.polyline.encodedPolyline,routes.travelAdvisory.speedReadingIntervals";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SpeedCategory {
    SpeedUnspecified,
    Normal,
    Slow,
    TrafficJam,
}

/// One traffic reading over a span of polyline point indices.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeedReadingInterval {
    #[serde(default)]
    pub start_polyline_point_index: u32,
    #[serde(default)]
    pub end_polyline_point_index: u32,
    pub speed: SpeedCategory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficResult {
    pub duration_seconds: i64,
    pub static_duration_seconds: i64,
    pub distance_meters: f64,
    pub encoded_polyline: String,
    pub speed_readings: Vec<SpeedReadingInterval>,
}

#[derive(Debug, Deserialize)]
struct ComputeRoutesResponse {
    #[serde(default)]
    routes: Vec<RoutePayload>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoutePayload {
    duration: Option<String>,
    static_duration: Option<String>,
    distance_meters: Option<f64>,
    polyline: Option<PolylinePayload>,
    travel_advisory: Option<TravelAdvisoryPayload>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PolylinePayload {
    encoded_polyline: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TravelAdvisoryPayload {
    #[serde(default)]
    speed_reading_intervals: Vec<SpeedReadingInterval>,
}

/// Traffic-aware routing client. One request per monitored road per cache
/// miss; the caller holds results in the 20-minute traffic sub-cache.
pub struct RoutesClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    field_mask: String,
}

impl RoutesClient {
    pub fn new(api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            field_mask: FIELD_MASK.to_string(),
        }
    }

    pub async fn compute_route(
        &self,
        origin: Coordinate,
        destination: Coordinate,
    ) -> Result<TrafficResult> {
        origin.validate()?;
        destination.validate()?;

        if self.field_mask.trim().is_empty() {
            return Err(ApiError::Provider(
                "computeRoutes requires a non-empty field mask".to_string(),
            ));
        }

        let body = json!({
            "origin": {
                "location": { "latLng": { "latitude": origin.lat, "longitude": origin.lon } }
            },
            "destination": {
                "location": { "latLng": { "latitude": destination.lat, "longitude": destination.lon } }
            },
            "travelMode": "DRIVE",
            "routingPreference": "TRAFFIC_AWARE",
            "extraComputations": ["TRAFFIC_ON_POLYLINE"],
        });

        let response = self
            .client
            .post(&self.base_url)
            .header("X-Goog-Api-Key", &self.api_key)
            .header("X-Goog-FieldMask", &self.field_mask)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() >= 400 {
            return Err(ApiError::from_status(status, "computeRoutes"));
        }

        let payload: ComputeRoutesResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Parse(format!("computeRoutes response: {e}")))?;

        let route = payload.routes.into_iter().next().ok_or_else(|| {
            ApiError::Provider("computeRoutes returned no routes".to_string())
        })?;

        parse_route(route)
    }
}

fn parse_route(route: RoutePayload) -> Result<TrafficResult> {
    let duration_seconds = parse_duration_seconds(
        route
            .duration
            .as_deref()
            .ok_or_else(|| ApiError::Parse("route missing duration".to_string()))?,
    )?;
    let static_duration_seconds = match route.static_duration.as_deref() {
        Some(raw) => parse_duration_seconds(raw)?,
        None => duration_seconds,
    };

    Ok(TrafficResult {
        duration_seconds,
        static_duration_seconds,
        distance_meters: route.distance_meters.unwrap_or(0.0),
        encoded_polyline: route
            .polyline
            .and_then(|p| p.encoded_polyline)
            .unwrap_or_default(),
        speed_readings: route
            .travel_advisory
            .map(|a| a.speed_reading_intervals)
            .unwrap_or_default(),
    })
}

/// Durations arrive as integer seconds with a trailing 's' suffix.
fn parse_duration_seconds(raw: &str) -> Result<i64> {
    raw.strip_suffix('s')
        .and_then(|v| v.parse::<i64>().ok())
        .ok_or_else(|| ApiError::Parse(format!("unparseable duration {raw:?}")))
}
