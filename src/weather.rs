use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{ApiError, Result};
use crate::geo::Coordinate;

const DEFAULT_WEATHER_URL: &str = "https://api.openweathermap.org/data/2.5/weather";
const DEFAULT_ONECALL_URL: &str = "https://api.openweathermap.org/data/3.0/onecall";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentWeather {
    pub temperature_c: f64,
    pub feels_like_c: f64,
    pub humidity_pct: u8,
    pub wind_speed_ms: f64,
    pub wind_deg: u16,
    pub visibility_m: Option<u32>,
    pub condition: String,
    pub description: String,
    pub icon: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherAlert {
    pub id: String,
    pub sender: String,
    pub event: String,
    pub start: i64,
    pub end: i64,
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CurrentWeatherPayload {
    main: MainPayload,
    wind: Option<WindPayload>,
    visibility: Option<u32>,
    #[serde(default)]
    weather: Vec<ConditionPayload>,
}

#[derive(Debug, Deserialize)]
struct MainPayload {
    temp: f64,
    feels_like: f64,
    humidity: u8,
}

#[derive(Debug, Deserialize)]
struct WindPayload {
    #[serde(default)]
    speed: f64,
    #[serde(default)]
    deg: u16,
}

#[derive(Debug, Deserialize)]
struct ConditionPayload {
    main: String,
    description: String,
    icon: String,
}

#[derive(Debug, Deserialize)]
struct OneCallPayload {
    #[serde(default)]
    alerts: Vec<AlertPayload>,
}

#[derive(Debug, Deserialize)]
struct AlertPayload {
    sender_name: String,
    event: String,
    start: i64,
    end: i64,
    description: String,
    #[serde(default)]
    tags: Vec<String>,
}

/// Current-conditions and alert client for a single coordinate. Metric
/// units on every request.
pub struct WeatherClient {
    client: reqwest::Client,
    api_key: String,
    weather_url: String,
    onecall_url: String,
}

impl WeatherClient {
    pub fn new(api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            weather_url: DEFAULT_WEATHER_URL.to_string(),
            onecall_url: DEFAULT_ONECALL_URL.to_string(),
        }
    }

    pub async fn current_weather(&self, coord: Coordinate) -> Result<CurrentWeather> {
        coord.validate()?;

        let response = self
            .client
            .get(&self.weather_url)
            .query(&[
                ("lat", coord.lat.to_string()),
                ("lon", coord.lon.to_string()),
                ("units", "metric".to_string()),
                ("appid", self.api_key.clone()),
            ])
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() >= 400 {
            return Err(ApiError::from_status(status, "current weather"));
        }

        let payload: CurrentWeatherPayload = response
            .json()
            .await
            .map_err(|e| ApiError::Parse(format!("current weather response: {e}")))?;

        let condition = payload.weather.into_iter().next();
        let wind = payload.wind.unwrap_or(WindPayload { speed: 0.0, deg: 0 });

        Ok(CurrentWeather {
            temperature_c: payload.main.temp,
            feels_like_c: payload.main.feels_like,
            humidity_pct: payload.main.humidity,
            wind_speed_ms: wind.speed,
            wind_deg: wind.deg,
            visibility_m: payload.visibility,
            condition: condition
                .as_ref()
                .map(|c| c.main.clone())
                .unwrap_or_default(),
            description: condition
                .as_ref()
                .map(|c| c.description.clone())
                .unwrap_or_default(),
            icon: condition.map(|c| c.icon).unwrap_or_default(),
        })
    }

    pub async fn weather_alerts(&self, coord: Coordinate) -> Result<Vec<WeatherAlert>> {
        coord.validate()?;

        let response = self
            .client
            .get(&self.onecall_url)
            .query(&[
                ("lat", coord.lat.to_string()),
                ("lon", coord.lon.to_string()),
                ("exclude", "minutely,hourly,daily".to_string()),
                ("units", "metric".to_string()),
                ("appid", self.api_key.clone()),
            ])
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() >= 400 {
            return Err(ApiError::from_status(status, "weather alerts"));
        }

        let payload: OneCallPayload = response
            .json()
            .await
            .map_err(|e| ApiError::Parse(format!("weather alerts response: {e}")))?;

        Ok(payload
            .alerts
            .into_iter()
            .map(|alert| WeatherAlert {
                id: alert_id(&alert.sender_name, &alert.event, alert.start),
                sender: alert.sender_name,
                event: alert.event,
                start: alert.start,
                end: alert.end,
                description: alert.description,
                tags: alert.tags,
            })
            .collect())
    }
}

/// Deterministic alert id so repeated retrievals of the same upstream alert
/// collapse to one identity.
pub fn alert_id(sender: &str, event: &str, start: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sender.as_bytes());
    hasher.update(b"|");
    hasher.update(event.as_bytes());
    hasher.update(b"|");
    hasher.update(start.to_string().as_bytes());
    let digest = hasher.finalize();
    format!("wx-{:x}", digest)[..19].to_string()
}
